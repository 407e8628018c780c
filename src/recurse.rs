//! Recursive-watch synthesis for kernels without native recursion.
//!
//! inotify, kqueue and FEN only watch single nodes, so recursion is built
//! in user space: when a directory appears under a recursive root, its
//! subtree is enumerated once, depth-first, and a watch is installed for
//! every nested directory. Anything created between the mkdir and the
//! watch installation is invisible to the kernel; the catch-up pass
//! re-lists each new directory and synthesizes Create events for entries
//! discovered that way.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::ExcludePredicate;
use crate::error::Result;
use crate::event::{Event, Op};
use crate::walk::walk_error;

/// Detects the trailing `...` component that marks a recursive add and
/// strips it: `/a/b/...` watches `/a/b` and all present and future
/// descendants.
pub(crate) fn recursive_path(path: &Path) -> (PathBuf, bool) {
	if path.file_name().map(|n| n == "...").unwrap_or(false) {
		let parent = path.parent().unwrap_or(Path::new(""));
		(parent.to_path_buf(), true)
	} else {
		(path.to_path_buf(), false)
	}
}

pub(crate) fn is_excluded(exclude: Option<&ExcludePredicate>, path: &Path) -> bool {
	exclude.map(|pred| pred(path)).unwrap_or(false)
}

/// Directories under `root` (root included) in a single depth-first pass,
/// pre-order, skipping excluded subtrees entirely.
pub(crate) fn collect_dirs(root: &Path, exclude: Option<&ExcludePredicate>) -> Result<Vec<PathBuf>> {
	let mut dirs = Vec::new();
	let walker = WalkDir::new(root)
		.into_iter()
		.filter_entry(|entry| !is_excluded(exclude, entry.path()));
	for entry in walker {
		let entry = entry.map_err(walk_error)?;
		if entry.file_type().is_dir() {
			dirs.push(entry.into_path());
		}
	}
	Ok(dirs)
}

/// Re-lists `dir` right after its watch was installed and synthesizes a
/// Create for every entry that slipped through the race window. Entries
/// already delivered during the current batch are skipped, and everything
/// reported here is added to the set.
pub(crate) fn catch_up(
	dir: &Path,
	exclude: Option<&ExcludePredicate>,
	delivered: &mut HashSet<PathBuf>,
	mut emit: impl FnMut(Event),
) {
	let Ok(entries) = std::fs::read_dir(dir) else {
		// The directory vanished again before we got here; its Remove
		// is already on its way from the kernel.
		return;
	};
	for entry in entries.flatten() {
		let path = entry.path();
		if is_excluded(exclude, &path) || !delivered.insert(path.clone()) {
			continue;
		}
		let mut op = Op::CREATE;
		if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
			op |= Op::IS_DIR;
		}
		emit(Event::new(path, op));
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	#[test]
	fn trailing_dots_mark_a_recursive_root() {
		let (path, recursive) = recursive_path(Path::new("/a/b/..."));
		assert_eq!(path, PathBuf::from("/a/b"));
		assert!(recursive);
	}

	#[test]
	fn plain_paths_are_left_alone() {
		let (path, recursive) = recursive_path(Path::new("/a/b"));
		assert_eq!(path, PathBuf::from("/a/b"));
		assert!(!recursive);

		// "..." must be the whole final component.
		let (path, recursive) = recursive_path(Path::new("/a/b...c"));
		assert_eq!(path, PathBuf::from("/a/b...c"));
		assert!(!recursive);
	}

	#[test]
	fn collect_dirs_walks_depth_first_and_honors_exclude() {
		let root = tempfile::tempdir().unwrap();
		let keep = root.path().join("keep");
		let deep = keep.join("deep");
		let skip = root.path().join("skip");
		std::fs::create_dir_all(&deep).unwrap();
		std::fs::create_dir_all(skip.join("below")).unwrap();

		let exclude: ExcludePredicate =
			Arc::new(|p: &Path| p.file_name().map(|n| n == "skip").unwrap_or(false));
		let dirs = collect_dirs(root.path(), Some(&exclude)).unwrap();

		assert_eq!(dirs, vec![root.path().to_path_buf(), keep, deep]);
	}

	#[test]
	fn catch_up_reports_only_undelivered_entries() {
		let root = tempfile::tempdir().unwrap();
		let seen = root.path().join("seen");
		let missed = root.path().join("missed");
		let missed_dir = root.path().join("missed_dir");
		std::fs::write(&seen, b"").unwrap();
		std::fs::write(&missed, b"").unwrap();
		std::fs::create_dir(&missed_dir).unwrap();

		let mut delivered = HashSet::from([seen]);
		let mut events = Vec::new();
		catch_up(root.path(), None, &mut delivered, |e| events.push(e));

		events.sort_by(|a, b| a.path.cmp(&b.path));
		assert_eq!(events.len(), 2);
		assert_eq!(events[0].path, missed);
		assert_eq!(events[0].op, Op::CREATE);
		assert_eq!(events[1].path, missed_dir);
		assert_eq!(events[1].op, Op::CREATE | Op::IS_DIR);
	}
}
