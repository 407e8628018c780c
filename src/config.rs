//! Watcher configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding whether a path is excluded from watching.
///
/// Returns `true` to exclude. Must be pure and cheap: it runs on the event
/// path for every delivery and on every candidate registration.
pub type ExcludePredicate = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Tunables recognized by [`Watcher::with_options`](crate::Watcher::with_options).
#[derive(Debug, Clone)]
pub struct Options {
	/// Bytes reserved per read from the Windows change buffer. A no-op on
	/// every other backend.
	///
	/// 64 KiB is the largest value that works on all filesystems; raise it
	/// if bursts of events produce overflow errors.
	pub buffer_size: usize,

	/// Capacity of the events channel. When full, the oldest undelivered
	/// event is dropped and an overflow error is posted.
	pub event_capacity: usize,

	/// Capacity of the errors channel. The channel is advisory: errors
	/// that don't fit are dropped.
	pub error_capacity: usize,

	/// Sliding window for the dedup filter, or `None` to deliver every
	/// event. Semantically redundant events within the window collapse
	/// into one.
	pub dedup_window: Option<Duration>,
}

/// Default window used when dedup is enabled without an explicit duration.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_millis(100);

impl Default for Options {
	fn default() -> Self {
		Self {
			buffer_size: 64 * 1024,
			event_capacity: 4096,
			error_capacity: 16,
			dedup_window: None,
		}
	}
}

impl Options {
	/// Sets the per-read buffer size for the Windows backend.
	pub fn buffer_size(mut self, bytes: usize) -> Self {
		self.buffer_size = bytes;
		self
	}

	/// Enables the dedup filter with the default 100 ms window.
	pub fn dedup(mut self) -> Self {
		self.dedup_window = Some(DEFAULT_DEDUP_WINDOW);
		self
	}

	/// Enables the dedup filter with an explicit window.
	pub fn dedup_window(mut self, window: Duration) -> Self {
		self.dedup_window = Some(window);
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_documented_values() {
		let opts = Options::default();
		assert_eq!(opts.buffer_size, 65536);
		assert!(opts.dedup_window.is_none());
	}

	#[test]
	fn dedup_uses_documented_default_window() {
		let opts = Options::default().dedup();
		assert_eq!(opts.dedup_window, Some(Duration::from_millis(100)));
	}
}
