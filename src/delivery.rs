//! Bounded event and error channels.
//!
//! The kernel reader must never block on a slow consumer: a full events
//! channel sheds the oldest undelivered event and posts one coalesced
//! overflow error per burst. The errors channel is advisory; errors that
//! don't fit are silently dropped. Close happens exactly once, after which
//! both receivers drain whatever was already queued and then report
//! end-of-stream.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::Error;
use crate::event::Event;

pub(crate) struct Delivery {
	events_tx: Mutex<Option<flume::Sender<Event>>>,
	errors_tx: Mutex<Option<flume::Sender<Error>>>,
	// Internal receive side used to shed the oldest event when full.
	events_drain: flume::Receiver<Event>,
	// Set while a shed burst is in progress, so overflow is posted once.
	overflowed: AtomicBool,
	closed: AtomicBool,
}

impl Delivery {
	pub fn new(
		event_capacity: usize,
		error_capacity: usize,
	) -> (Self, flume::Receiver<Event>, flume::Receiver<Error>) {
		let (events_tx, events_rx) = flume::bounded(event_capacity);
		let (errors_tx, errors_rx) = flume::bounded(error_capacity);
		let delivery = Self {
			events_tx: Mutex::new(Some(events_tx)),
			errors_tx: Mutex::new(Some(errors_tx)),
			events_drain: events_rx.clone(),
			overflowed: AtomicBool::new(false),
			closed: AtomicBool::new(false),
		};
		(delivery, events_rx, errors_rx)
	}

	pub fn publish_event(&self, event: Event) {
		let guard = self.events_tx.lock();
		let Some(tx) = guard.as_ref() else { return };

		match tx.try_send(event) {
			Ok(()) => {
				self.overflowed.store(false, Ordering::Relaxed);
			}
			Err(flume::TrySendError::Full(event)) => {
				// Shed the oldest undelivered event to make room. The
				// retry can still lose a race with another publisher;
				// then this event is dropped too.
				let _ = self.events_drain.try_recv();
				if let Err(flume::TrySendError::Full(event)) = tx.try_send(event) {
					trace!(path = %event.path.display(), "dropped event on full channel");
				}
				let first = !self.overflowed.swap(true, Ordering::Relaxed);
				drop(guard);
				if first {
					self.publish_error(Error::Overflow);
				}
			}
			Err(flume::TrySendError::Disconnected(_)) => {}
		}
	}

	/// Posts an error without ever blocking; a full channel drops it.
	pub fn publish_error(&self, error: Error) {
		let guard = self.errors_tx.lock();
		if let Some(tx) = guard.as_ref() {
			if tx.try_send(error).is_err() {
				trace!("dropped error on full or closed channel");
			}
		}
	}

	/// Drops both senders so receivers see end-of-stream once drained.
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.events_tx.lock().take();
		self.errors_tx.lock().take();
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::Op;

	fn event(name: &str) -> Event {
		Event::new(format!("/t/{name}"), Op::WRITE)
	}

	#[test]
	fn full_channel_sheds_oldest_and_posts_one_overflow() {
		let (delivery, events, errors) = Delivery::new(2, 4);

		delivery.publish_event(event("a"));
		delivery.publish_event(event("b"));
		delivery.publish_event(event("c"));
		delivery.publish_event(event("d"));

		// Oldest two were shed; newest two remain in order.
		let got: Vec<_> = events.try_iter().map(|e| e.path).collect();
		assert_eq!(got, vec![std::path::PathBuf::from("/t/c"), "/t/d".into()]);

		// One coalesced overflow for the whole burst.
		let errs: Vec<_> = errors.try_iter().collect();
		assert_eq!(errs.len(), 1);
		assert!(matches!(errs[0], Error::Overflow));
	}

	#[test]
	fn overflow_is_posted_again_after_the_burst_ends() {
		let (delivery, events, errors) = Delivery::new(1, 4);

		delivery.publish_event(event("a"));
		delivery.publish_event(event("b")); // burst 1
		assert!(events.try_recv().is_ok());
		delivery.publish_event(event("c")); // succeeds, burst over
		delivery.publish_event(event("d")); // burst 2

		let errs: Vec<_> = errors.try_iter().collect();
		assert_eq!(errs.len(), 2);
	}

	#[test]
	fn errors_channel_never_blocks() {
		let (delivery, _events, errors) = Delivery::new(4, 1);

		delivery.publish_error(Error::Overflow);
		delivery.publish_error(Error::Overflow);
		delivery.publish_error(Error::Overflow);

		assert_eq!(errors.try_iter().count(), 1);
	}

	#[test]
	fn close_drains_then_ends_both_streams() {
		let (delivery, events, errors) = Delivery::new(4, 4);

		delivery.publish_event(event("a"));
		delivery.close();
		delivery.close(); // idempotent

		assert_eq!(events.try_recv().unwrap().path, std::path::PathBuf::from("/t/a"));
		assert!(matches!(events.try_recv(), Err(flume::TryRecvError::Disconnected)));
		assert!(matches!(errors.try_recv(), Err(flume::TryRecvError::Disconnected)));
		assert!(delivery.is_closed());
	}

	#[test]
	fn publish_after_close_is_a_quiet_no_op() {
		let (delivery, events, _errors) = Delivery::new(4, 4);
		delivery.close();
		delivery.publish_event(event("late"));
		assert!(matches!(events.try_recv(), Err(flume::TryRecvError::Disconnected)));
	}
}
