//! The watcher facade.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{Backend, Emitter, WatchFlags};
use crate::config::{ExcludePredicate, Options, DEFAULT_DEDUP_WINDOW};
use crate::dedup::DedupFilter;
use crate::delivery::Delivery;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::recurse::{self, is_excluded};
use crate::registry::{Registry, RootKind, Watch};

/// Watches paths for filesystem changes and delivers [`Event`]s and
/// advisory [`Error`]s on two bounded channels.
///
/// ```no_run
/// use pathwatch::{Op, Watcher};
///
/// # fn main() -> pathwatch::Result<()> {
/// let watcher = Watcher::new()?;
/// watcher.add("/tmp/t")?;
///
/// for event in watcher.events().iter() {
/// 	if event.has(Op::CREATE) {
/// 		println!("created: {}", event.path.display());
/// 	}
/// }
/// # Ok(())
/// # }
/// ```
///
/// A path whose final component is `...` is watched recursively:
/// `add("/a/b/...")` covers `/a/b` and all present and future
/// descendants. [`Watcher::recursive_with_exclude`] makes every add
/// recursive and filters paths through a predicate.
pub struct Watcher {
	backend: Backend,
	registry: Arc<Registry>,
	delivery: Arc<Delivery>,
	events_rx: flume::Receiver<Event>,
	errors_rx: flume::Receiver<Error>,
	exclude: Option<ExcludePredicate>,
	default_recursive: bool,
	// Serializes add/remove so widen and prune sequences stay whole.
	// Close never takes this lock.
	ops: Mutex<()>,
}

impl Watcher {
	/// Creates a watcher with default options.
	pub fn new() -> Result<Self> {
		Self::build(Options::default(), None, false)
	}

	/// Creates a watcher with explicit [`Options`].
	pub fn with_options(options: Options) -> Result<Self> {
		Self::build(options, None, false)
	}

	/// Creates a watcher where every `add` is recursive and `exclude`
	/// filters paths: excluded paths are never registered and their
	/// events are never delivered. Dedup is enabled with the default
	/// window, since recursive trees tend to produce bursts.
	pub fn recursive_with_exclude(exclude: ExcludePredicate) -> Result<Self> {
		let options = Options::default().dedup_window(DEFAULT_DEDUP_WINDOW);
		Self::build(options, Some(exclude), true)
	}

	fn build(
		options: Options,
		exclude: Option<ExcludePredicate>,
		default_recursive: bool,
	) -> Result<Self> {
		let registry = Arc::new(Registry::new());
		let (delivery, events_rx, errors_rx) =
			Delivery::new(options.event_capacity, options.error_capacity);
		let delivery = Arc::new(delivery);
		let emitter = Emitter::new(
			delivery.clone(),
			exclude.clone(),
			options.dedup_window.map(DedupFilter::new),
		);

		#[cfg(windows)]
		let backend =
			Backend::new(registry.clone(), delivery.clone(), emitter, options.buffer_size)?;
		#[cfg(not(windows))]
		let backend = Backend::new(registry.clone(), delivery.clone(), emitter)?;

		Ok(Self {
			backend,
			registry,
			delivery,
			events_rx,
			errors_rx,
			exclude,
			default_recursive,
			ops: Mutex::new(()),
		})
	}

	/// The event stream. Ordered within the watcher; ends after
	/// [`Watcher::close`].
	pub fn events(&self) -> &flume::Receiver<Event> {
		&self.events_rx
	}

	/// The advisory error stream. Independent of the event stream; no
	/// relative ordering between the two is promised.
	pub fn errors(&self) -> &flume::Receiver<Error> {
		&self.errors_rx
	}

	/// Registers `path`. Idempotent: adding a watched path again is a
	/// no-op, except that it may widen a non-recursive watch into a
	/// recursive one (never the other way around).
	pub fn add(&self, path: impl AsRef<Path>) -> Result<()> {
		if self.delivery.is_closed() {
			return Err(Error::Closed);
		}

		let (path, suffix) = recurse::recursive_path(path.as_ref());
		if is_excluded(self.exclude.as_ref(), &path) {
			debug!(path = %path.display(), "add skipped by exclude predicate");
			return Ok(());
		}

		let meta = std::fs::metadata(&path).map_err(|e| {
			if e.kind() == std::io::ErrorKind::NotFound {
				Error::PathNotFound(path.clone())
			} else {
				Error::watch(path.clone(), e)
			}
		})?;
		let is_dir = meta.is_dir();
		#[cfg(windows)]
		if !is_dir {
			return Err(Error::NotADirectory(path));
		}
		let recursive = (suffix || self.default_recursive) && is_dir;

		let _ops = self.ops.lock();
		if self.delivery.is_closed() {
			return Err(Error::Closed);
		}

		if let Some(existing) = self.registry.get(&path) {
			return self.re_add(existing, recursive, is_dir);
		}

		if let Err(e) = self.backend.register(&path, WatchFlags::root(recursive), is_dir) {
			// A register that raced with close reports the close, not
			// the doomed syscall.
			return if self.delivery.is_closed() { Err(Error::Closed) } else { Err(e) };
		}
		if recursive {
			self.backend.register_descendants(&path, self.exclude.as_ref())?;
		}

		debug!(path = %path.display(), recursive, "now watching");
		Ok(())
	}

	/// Re-`add` of a known path: promote a descendant to a root if the
	/// caller names it explicitly, and widen to recursive by
	/// re-registering.
	fn re_add(&self, existing: Watch, recursive: bool, is_dir: bool) -> Result<()> {
		let widen = recursive && !existing.recursive;
		if widen {
			self.registry.remove_by_path(&existing.path);
			self.backend.deregister(&existing)?;
			self.backend
				.register(&existing.path, WatchFlags::root(true), is_dir)?;
			self.backend
				.register_descendants(&existing.path, self.exclude.as_ref())?;
			debug!(path = %existing.path.display(), "watch widened to recursive");
		} else if existing.kind == RootKind::Descendant {
			self.registry.remove_by_path(&existing.path);
			self.registry.insert(Watch { kind: RootKind::Root, ..existing });
		}
		Ok(())
	}

	/// Unregisters `path`; for a recursive root, all descendant watches
	/// go with it. Removing a path that isn't watched is
	/// [`Error::NonExistentWatch`].
	pub fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
		if self.delivery.is_closed() {
			return Err(Error::Closed);
		}
		let (path, _) = recurse::recursive_path(path.as_ref());

		let _ops = self.ops.lock();
		if self.delivery.is_closed() {
			return Err(Error::Closed);
		}
		let Some(watch) = self.registry.remove_by_path(&path) else {
			return Err(Error::NonExistentWatch(path));
		};

		if watch.recursive && watch.is_dir {
			for descendant in self.registry.descendants_of(&path) {
				self.registry.remove_by_path(&descendant.path);
				if let Err(e) = self.backend.deregister(&descendant) {
					warn!(path = %descendant.path.display(), "failed to drop descendant watch: {e}");
				}
			}
		}
		self.backend.deregister(&watch)?;

		debug!(path = %path.display(), "stopped watching");
		Ok(())
	}

	/// Snapshot of the watched root paths. Descendants picked up by
	/// recursion are not listed.
	pub fn watch_list(&self) -> Vec<PathBuf> {
		self.registry.roots()
	}

	/// Shuts the watcher down: interrupts the kernel reader, releases
	/// every kernel resource and closes both channels. Queued events stay
	/// readable; after they drain, the receivers report end-of-stream.
	/// Idempotent, and safe to call while other threads are in `add` or
	/// `remove`: close waits for an in-flight operation to finish, and
	/// every later one gets [`Error::Closed`].
	pub fn close(&self) {
		{
			// Taking the same lock add/remove hold means the closed flag
			// can't flip in the middle of a registration; their recheck
			// under the lock is then authoritative.
			let _ops = self.ops.lock();
			if !self.delivery.is_closed() {
				debug!("closing watcher");
			}
			self.delivery.close();
		}
		self.backend.shutdown();
	}
}

impl Drop for Watcher {
	fn drop(&mut self) {
		self.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn watcher() -> Watcher {
		Watcher::new().expect("failed to create watcher")
	}

	#[test]
	fn add_missing_path_fails() {
		let w = watcher();
		let err = w.add("/definitely/not/here").unwrap_err();
		assert!(matches!(err, Error::PathNotFound(_)));
	}

	#[test]
	fn remove_unknown_path_is_the_sentinel() {
		let w = watcher();
		let err = w.remove("/tmp/never-added").unwrap_err();
		match err {
			Error::NonExistentWatch(path) => {
				assert_eq!(path, PathBuf::from("/tmp/never-added"));
			}
			other => panic!("expected NonExistentWatch, got {other:?}"),
		}
	}

	#[test]
	fn add_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let w = watcher();
		w.add(dir.path()).unwrap();
		w.add(dir.path()).unwrap();
		assert_eq!(w.watch_list(), vec![dir.path().to_path_buf()]);
	}

	#[test]
	fn remove_undoes_add() {
		let dir = tempfile::tempdir().unwrap();
		let w = watcher();
		w.add(dir.path()).unwrap();
		w.remove(dir.path()).unwrap();
		assert!(w.watch_list().is_empty());
		assert!(matches!(w.remove(dir.path()), Err(Error::NonExistentWatch(_))));
	}

	#[test]
	fn watch_list_reports_roots() {
		let first = tempfile::tempdir().unwrap();
		let second = tempfile::tempdir().unwrap();
		let w = watcher();
		w.add(first.path()).unwrap();
		w.add(second.path()).unwrap();

		let mut roots = w.watch_list();
		roots.sort();
		let mut expected = vec![first.path().to_path_buf(), second.path().to_path_buf()];
		expected.sort();
		assert_eq!(roots, expected);
	}

	#[test]
	fn trailing_dots_register_the_parent() {
		let dir = tempfile::tempdir().unwrap();
		let sub = dir.path().join("sub");
		std::fs::create_dir(&sub).unwrap();

		let w = watcher();
		w.add(dir.path().join("...")).unwrap();
		// The root is listed under its real name and the existing
		// subdirectory was picked up as a descendant.
		assert_eq!(w.watch_list(), vec![dir.path().to_path_buf()]);
		w.remove(dir.path()).unwrap();
		assert!(w.watch_list().is_empty());
	}

	#[test]
	fn operations_after_close_fail_with_closed() {
		let dir = tempfile::tempdir().unwrap();
		let w = watcher();
		w.close();
		w.close(); // idempotent

		assert!(matches!(w.add(dir.path()), Err(Error::Closed)));
		assert!(matches!(w.remove(dir.path()), Err(Error::Closed)));
	}

	#[test]
	fn close_ends_both_streams() {
		let w = watcher();
		w.close();
		assert!(w.events().recv().is_err());
		assert!(w.errors().recv().is_err());
	}

	#[test]
	fn excluded_paths_are_never_registered() {
		let dir = tempfile::tempdir().unwrap();
		let skip = dir.path().join("skip");
		std::fs::create_dir(&skip).unwrap();

		let w = Watcher::recursive_with_exclude(Arc::new(|p: &Path| {
			p.file_name().map(|n| n == "skip").unwrap_or(false)
		}))
		.unwrap();

		w.add(&skip).unwrap(); // silently filtered
		assert!(w.watch_list().is_empty());

		w.add(dir.path()).unwrap();
		assert_eq!(w.watch_list(), vec![dir.path().to_path_buf()]);
	}
}
