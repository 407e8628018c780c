//! Normalized filesystem events.
//!
//! Every backend reports through the same [`Event`] shape: the path the
//! caller's watch resolves to, and an [`Op`] bitmask. The low bits of the
//! mask are the canonical operations shared by all platforms; the high bits
//! carry kernel-flavored subflags (inotify-style) when the backend provides
//! them, so nothing the kernel said is lost in translation.

use std::fmt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

bitflags! {
	/// A set of file operations.
	///
	/// This is a bitmask, not an enum: a single event may carry several
	/// bits at once (`CREATE | IS_DIR`, `WRITE | CLOSE_WRITE`, ...). Check
	/// bits with [`Op::contains`] or [`Event::has`], never with `==`.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct Op: u64 {
		/// A new pathname was created.
		const CREATE = 1 << 0;

		/// The pathname was written to. This does *not* mean the write has
		/// finished; a write can be followed by more writes.
		const WRITE = 1 << 1;

		/// The pathname was removed; any watch on it is auto-removed.
		///
		/// Some "remove" operations show up as a rename instead (moving to
		/// trash is often a rename under the hood).
		const REMOVE = 1 << 2;

		/// The pathname was renamed to something else; any watch on it is
		/// auto-removed.
		const RENAME = 1 << 3;

		/// File attributes or metadata changed.
		///
		/// Indexers, anti-virus scanners and backup tools can fire this
		/// very frequently; most callers will want to ignore it.
		const CHMOD = 1 << 4;

		// Kernel subflags. Only set when the host backend reports the
		// corresponding fact; absent bits mean "not reported", not "did
		// not happen".

		/// The file was read (inotify `IN_ACCESS`).
		const ACCESS = 1 << 32;
		/// The file's content changed (inotify `IN_MODIFY`).
		const MODIFY = 1 << 33;
		/// Metadata changed (inotify `IN_ATTRIB`).
		const ATTRIB = 1 << 34;
		/// A writable file descriptor was closed (inotify `IN_CLOSE_WRITE`).
		const CLOSE_WRITE = 1 << 35;
		/// A read-only file descriptor was closed (inotify `IN_CLOSE_NOWRITE`).
		const CLOSE_NOWRITE = 1 << 36;
		/// The file was opened (inotify `IN_OPEN`).
		const OPEN = 1 << 37;
		/// The entry was moved out of a watched directory.
		const MOVED_FROM = 1 << 38;
		/// The entry was moved into a watched directory.
		const MOVED_TO = 1 << 39;
		/// The watched path itself was moved.
		const MOVE_SELF = 1 << 40;
		/// An entry was deleted from a watched directory.
		const DELETE = 1 << 41;
		/// The watched path itself was deleted.
		const DELETE_SELF = 1 << 42;
		/// The subject of the event is a directory.
		const IS_DIR = 1 << 43;
		/// The filesystem containing the watched path was unmounted.
		const UNMOUNT = 1 << 44;
	}
}

impl Op {
	/// Reports whether this operation set contains all bits of `other`.
	pub fn has(self, other: Op) -> bool {
		self.contains(other)
	}
}

// Canonical names first so the string is meaningful on every backend, then
// whatever subflags the kernel attached.
const OP_NAMES: &[(Op, &str)] = &[
	(Op::CREATE, "CREATE"),
	(Op::WRITE, "WRITE"),
	(Op::REMOVE, "REMOVE"),
	(Op::RENAME, "RENAME"),
	(Op::CHMOD, "CHMOD"),
	(Op::ACCESS, "ACCESS"),
	(Op::MODIFY, "MODIFY"),
	(Op::ATTRIB, "ATTRIB"),
	(Op::CLOSE_WRITE, "CLOSE_WRITE"),
	(Op::CLOSE_NOWRITE, "CLOSE_NOWRITE"),
	(Op::OPEN, "OPEN"),
	(Op::MOVED_FROM, "MOVED_FROM"),
	(Op::MOVED_TO, "MOVED_TO"),
	(Op::MOVE_SELF, "MOVE_SELF"),
	(Op::DELETE, "DELETE"),
	(Op::DELETE_SELF, "DELETE_SELF"),
	(Op::IS_DIR, "IS_DIR"),
	(Op::UNMOUNT, "UNMOUNT"),
];

impl fmt::Display for Op {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_empty() {
			return f.write_str("[no events]");
		}

		let mut first = true;
		for (op, name) in OP_NAMES {
			if self.contains(*op) {
				if !first {
					f.write_str("|")?;
				}
				f.write_str(name)?;
				first = false;
			}
		}
		Ok(())
	}
}

/// A single filesystem notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
	/// Path to the file or directory.
	///
	/// Paths keep the prefix the watch was added with: after `add("dir")`
	/// a created file is reported as `dir/file`, after
	/// `add("/path/to/dir")` as `/path/to/dir/file`.
	pub path: PathBuf,

	/// The operations that triggered this event.
	pub op: Op,
}

impl Event {
	pub(crate) fn new(path: impl Into<PathBuf>, op: Op) -> Self {
		Self { path: path.into(), op }
	}

	/// Reports whether this event carries all bits of `op`.
	pub fn has(&self, op: Op) -> bool {
		self.op.contains(op)
	}

	/// The event's path, borrowed.
	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl fmt::Display for Event {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {}", self.op, self.path.display())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn op_is_a_set_not_an_enum() {
		let op = Op::CREATE | Op::IS_DIR | Op::MOVED_TO;
		assert!(op.has(Op::CREATE));
		assert!(op.has(Op::IS_DIR));
		assert!(op.has(Op::CREATE | Op::MOVED_TO));
		assert!(!op.has(Op::REMOVE));
		assert!(!op.has(Op::CREATE | Op::REMOVE));
	}

	#[test]
	fn display_emits_canonical_names_before_subflags() {
		let op = Op::MOVED_TO | Op::CREATE | Op::IS_DIR;
		assert_eq!(op.to_string(), "CREATE|MOVED_TO|IS_DIR");
	}

	#[test]
	fn display_empty_set() {
		assert_eq!(Op::empty().to_string(), "[no events]");
	}

	#[test]
	fn event_display_is_op_then_path() {
		let event = Event::new("/tmp/t/a", Op::WRITE | Op::MODIFY);
		assert_eq!(event.to_string(), "WRITE|MODIFY /tmp/t/a");
	}

	#[test]
	fn event_preserves_relative_prefix() {
		let event = Event::new("dir/file", Op::CREATE);
		assert_eq!(event.path(), Path::new("dir/file"));
	}
}
