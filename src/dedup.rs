//! Sliding-window collapse of semantically redundant events.
//!
//! Editors and build tools hammer the same path with bursts of identical
//! notifications. Within a window W, a second event equal in (path, op) is
//! dropped and the window re-arms, so a continuous flood delivers at most
//! one event per W. Removes are different: a Remove ends the path's story,
//! flushes its window state and is always delivered.
//!
//! The clock is passed in by the caller, which keeps the filter
//! deterministic under test.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::event::{Event, Op};

pub(crate) struct DedupFilter {
	window: Duration,
	last: HashMap<PathBuf, (Op, Instant)>,
}

impl DedupFilter {
	pub fn new(window: Duration) -> Self {
		Self { window, last: HashMap::new() }
	}

	/// Decides whether `event` passes the filter at time `now`.
	pub fn admit(&mut self, event: &Event, now: Instant) -> bool {
		if event.op.contains(Op::REMOVE) {
			self.last.remove(&event.path);
			return true;
		}

		match self.last.get_mut(&event.path) {
			Some((op, at)) if *op == event.op && now.duration_since(*at) < self.window => {
				// Identical within the window: drop and re-arm, so a
				// steady burst keeps collapsing into the first event.
				*at = now;
				false
			}
			_ => {
				self.last.insert(event.path.clone(), (event.op, now));
				true
			}
		}
	}

	/// Drops window state that can no longer suppress anything.
	pub fn evict(&mut self, now: Instant) {
		let window = self.window;
		self.last.retain(|_, (_, at)| now.duration_since(*at) < window);
	}

	#[cfg(test)]
	fn tracked(&self) -> usize {
		self.last.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const W: Duration = Duration::from_millis(100);

	fn write(path: &str) -> Event {
		Event::new(path, Op::WRITE | Op::MODIFY)
	}

	#[test]
	fn identical_event_within_window_is_dropped() {
		let mut filter = DedupFilter::new(W);
		let t0 = Instant::now();

		assert!(filter.admit(&write("/t/a"), t0));
		assert!(!filter.admit(&write("/t/a"), t0 + Duration::from_millis(50)));
		// The drop re-armed the window, so 120 ms after t0 is still inside.
		assert!(!filter.admit(&write("/t/a"), t0 + Duration::from_millis(120)));
		assert!(filter.admit(&write("/t/a"), t0 + Duration::from_millis(250)));
	}

	#[test]
	fn different_paths_do_not_interfere() {
		let mut filter = DedupFilter::new(W);
		let t0 = Instant::now();

		assert!(filter.admit(&write("/t/a"), t0));
		assert!(filter.admit(&write("/t/b"), t0));
	}

	#[test]
	fn create_then_write_both_pass() {
		let mut filter = DedupFilter::new(W);
		let t0 = Instant::now();

		assert!(filter.admit(&Event::new("/t/a", Op::CREATE), t0));
		assert!(filter.admit(&write("/t/a"), t0 + Duration::from_millis(1)));
	}

	#[test]
	fn remove_always_passes_and_flushes() {
		let mut filter = DedupFilter::new(W);
		let t0 = Instant::now();

		assert!(filter.admit(&write("/t/a"), t0));
		let remove = Event::new("/t/a", Op::REMOVE | Op::DELETE);
		assert!(filter.admit(&remove, t0 + Duration::from_millis(10)));
		assert!(filter.admit(&remove, t0 + Duration::from_millis(20)));
		// State was flushed: the next write starts a fresh window.
		assert!(filter.admit(&write("/t/a"), t0 + Duration::from_millis(30)));
	}

	#[test]
	fn flood_delivers_at_most_one_event_per_window() {
		let mut filter = DedupFilter::new(W);
		let t0 = Instant::now();
		let elapsed = Duration::from_secs(1);

		let mut delivered = 0;
		for i in 0..10_000u32 {
			let now = t0 + elapsed * i / 10_000;
			if filter.admit(&write("/t/hot"), now) {
				delivered += 1;
			}
		}

		let bound = elapsed.as_millis() / W.as_millis() + 1;
		assert!(delivered as u128 <= bound, "{delivered} > {bound}");
	}

	#[test]
	fn eviction_bounds_the_state() {
		let mut filter = DedupFilter::new(W);
		let t0 = Instant::now();

		for i in 0..32 {
			filter.admit(&write(&format!("/t/{i}")), t0);
		}
		assert_eq!(filter.tracked(), 32);

		filter.evict(t0 + Duration::from_millis(200));
		assert_eq!(filter.tracked(), 0);
	}
}
