//! Error types for the watcher.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the watcher, either synchronously from
/// [`Watcher::add`](crate::Watcher::add) / [`Watcher::remove`](crate::Watcher::remove)
/// or asynchronously on the errors channel.
#[derive(Debug, Error)]
pub enum Error {
	/// Tried to remove a path that was never added.
	#[error("can't remove non-existent watch: {0}")]
	NonExistentWatch(PathBuf),

	/// The kernel queue or an internal buffer overflowed; delivery
	/// continues but some events over the affected interval were lost.
	#[error("queue or buffer overflow")]
	Overflow,

	/// The watcher was already closed.
	#[error("watcher already closed")]
	Closed,

	/// The path handed to `add` does not exist.
	#[error("path does not exist: {0}")]
	PathNotFound(PathBuf),

	/// The backend only watches directories and the path isn't one.
	#[error("path is not a directory: {0}")]
	NotADirectory(PathBuf),

	/// A register or deregister syscall failed.
	#[error("failed to watch {path}")]
	Watch {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// The kernel event stream produced an unreadable record. Fatal: the
	/// watcher shuts down after posting this.
	#[error("malformed kernel event record")]
	Protocol(#[source] std::io::Error),

	/// Any other I/O error, wrapped.
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl Error {
	pub(crate) fn watch(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Self::Watch { path: path.into(), source }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::error::Error as _;

	#[test]
	fn sentinels_are_distinguishable() {
		let remove = Error::NonExistentWatch(PathBuf::from("/nope"));
		assert!(matches!(remove, Error::NonExistentWatch(_)));
		assert!(matches!(Error::Overflow, Error::Overflow));
		assert!(matches!(Error::Closed, Error::Closed));
	}

	#[test]
	fn wrapped_kernel_errors_keep_their_cause() {
		let inner = std::io::Error::from_raw_os_error(13);
		let err = Error::watch("/root/secret", inner);
		let source = err.source().expect("cause chain");
		let io = source.downcast_ref::<std::io::Error>().expect("io cause");
		assert_eq!(io.raw_os_error(), Some(13));
	}
}
