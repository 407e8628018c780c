//! Bookkeeping of watched paths and their kernel handles.
//!
//! Kernel records carry a handle, callers speak in paths, so the registry
//! keeps both directions: path → watch and handle → path. The two maps are
//! updated together under one mutex; no observer can see one without the
//! other. The mutex is held only for map updates, never across a syscall.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Whether a watch was added by the caller or synthesized on its behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RootKind {
	/// Added through `Watcher::add`; listed by `watch_list`.
	Root,
	/// Added by the recursion manager (or as a per-child kqueue watch);
	/// removed with its root, never listed.
	Descendant,
}

/// One registered watch.
#[derive(Debug, Clone)]
pub(crate) struct Watch {
	pub path: PathBuf,
	pub handle: u64,
	pub is_dir: bool,
	pub recursive: bool,
	pub kind: RootKind,
}

#[derive(Default)]
struct Inner {
	by_path: HashMap<PathBuf, Watch>,
	by_handle: HashMap<u64, PathBuf>,
}

#[derive(Default)]
pub(crate) struct Registry {
	inner: Mutex<Inner>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts a watch. A second insert for the same path with the same
	/// handle is the idempotent no-op re-`add` wants; a different handle
	/// for a known path is a caller bug (widen with remove-then-insert).
	pub fn insert(&self, watch: Watch) -> bool {
		let mut inner = self.inner.lock();
		if let Some(existing) = inner.by_path.get(&watch.path) {
			debug_assert_eq!(existing.handle, watch.handle);
			return false;
		}
		inner.by_handle.insert(watch.handle, watch.path.clone());
		inner.by_path.insert(watch.path.clone(), watch);
		true
	}

	pub fn remove_by_path(&self, path: &Path) -> Option<Watch> {
		let mut inner = self.inner.lock();
		let watch = inner.by_path.remove(path)?;
		inner.by_handle.remove(&watch.handle);
		Some(watch)
	}

	pub fn remove_by_handle(&self, handle: u64) -> Option<Watch> {
		let mut inner = self.inner.lock();
		let path = inner.by_handle.remove(&handle)?;
		inner.by_path.remove(&path)
	}

	pub fn get(&self, path: &Path) -> Option<Watch> {
		self.inner.lock().by_path.get(path).cloned()
	}

	/// Resolves a kernel handle back to its watch; raw records carry the
	/// handle, not the path.
	pub fn by_handle(&self, handle: u64) -> Option<Watch> {
		let inner = self.inner.lock();
		let path = inner.by_handle.get(&handle)?;
		inner.by_path.get(path).cloned()
	}

	pub fn contains(&self, path: &Path) -> bool {
		self.inner.lock().by_path.contains_key(path)
	}

	/// Snapshot of caller-added root paths; descendants are not listed.
	pub fn roots(&self) -> Vec<PathBuf> {
		self.inner
			.lock()
			.by_path
			.values()
			.filter(|w| w.kind == RootKind::Root)
			.map(|w| w.path.clone())
			.collect()
	}

	/// Watches strictly below `root`, for recursive pruning.
	pub fn descendants_of(&self, root: &Path) -> Vec<Watch> {
		self.inner
			.lock()
			.by_path
			.values()
			.filter(|w| w.path != root && w.path.starts_with(root))
			.cloned()
			.collect()
	}

	/// Both maps, for consistency assertions in tests.
	#[cfg(test)]
	pub fn is_bijective(&self) -> bool {
		let inner = self.inner.lock();
		inner.by_path.len() == inner.by_handle.len()
			&& inner.by_path.values().all(|w| {
				inner.by_handle.get(&w.handle).map(PathBuf::as_path) == Some(w.path.as_path())
			})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn watch(path: &str, handle: u64) -> Watch {
		Watch {
			path: PathBuf::from(path),
			handle,
			is_dir: true,
			recursive: false,
			kind: RootKind::Root,
		}
	}

	#[test]
	fn maps_stay_mutually_inverse() {
		let registry = Registry::new();
		assert!(registry.insert(watch("/a", 1)));
		assert!(registry.insert(watch("/b", 2)));
		assert!(registry.is_bijective());

		assert_eq!(registry.by_handle(2).map(|w| w.path), Some(PathBuf::from("/b")));
		assert_eq!(registry.remove_by_path(Path::new("/a")).map(|w| w.handle), Some(1));
		assert!(registry.is_bijective());

		assert!(registry.remove_by_handle(2).is_some());
		assert!(registry.is_bijective());
		assert!(registry.roots().is_empty());
	}

	#[test]
	fn duplicate_insert_is_rejected() {
		let registry = Registry::new();
		assert!(registry.insert(watch("/a", 1)));
		assert!(!registry.insert(watch("/a", 1)));
		assert!(registry.is_bijective());
	}

	#[test]
	fn roots_exclude_descendants() {
		let registry = Registry::new();
		registry.insert(watch("/a", 1));
		registry.insert(Watch { kind: RootKind::Descendant, ..watch("/a/sub", 2) });

		assert_eq!(registry.roots(), vec![PathBuf::from("/a")]);
	}

	#[test]
	fn descendants_are_found_by_prefix_not_by_string() {
		let registry = Registry::new();
		registry.insert(watch("/a", 1));
		registry.insert(Watch { kind: RootKind::Descendant, ..watch("/a/sub", 2) });
		registry.insert(watch("/ab", 3));

		let below = registry.descendants_of(Path::new("/a"));
		assert_eq!(below.len(), 1);
		assert_eq!(below[0].path, PathBuf::from("/a/sub"));
	}

	#[test]
	fn remove_unknown_is_none() {
		let registry = Registry::new();
		assert!(registry.remove_by_path(Path::new("/nope")).is_none());
		assert!(registry.remove_by_handle(9).is_none());
	}
}
