//! Kernel backends.
//!
//! One adapter per host OS, all presenting the same shape: `new` opens the
//! kernel endpoint and spawns the reader thread, `register`/`deregister`
//! run on the caller's thread, `shutdown` interrupts the reader and joins
//! it. The facade picks the adapter for the current platform at compile
//! time.

use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::config::ExcludePredicate;
use crate::dedup::DedupFilter;
use crate::delivery::Delivery;
use crate::event::Event;
use crate::recurse::is_excluded;

#[cfg(target_os = "linux")]
mod inotify;
#[cfg(any(
	target_os = "macos",
	target_os = "ios",
	target_os = "freebsd",
	target_os = "netbsd",
	target_os = "openbsd",
	target_os = "dragonfly"
))]
mod kqueue;
#[cfg(windows)]
mod windows;
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
mod fen;

#[cfg(target_os = "linux")]
pub(crate) use self::inotify::InotifyBackend as Backend;
#[cfg(any(
	target_os = "macos",
	target_os = "ios",
	target_os = "freebsd",
	target_os = "netbsd",
	target_os = "openbsd",
	target_os = "dragonfly"
))]
pub(crate) use self::kqueue::KqueueBackend as Backend;
#[cfg(windows)]
pub(crate) use self::windows::ReadDirectoryChangesBackend as Backend;
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub(crate) use self::fen::FenBackend as Backend;

/// Flags a watch is registered with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WatchFlags {
	pub recursive: bool,
	/// Descendant watches are installed by the recursion manager, not
	/// listed and pruned with their root.
	pub descendant: bool,
}

impl WatchFlags {
	pub fn root(recursive: bool) -> Self {
		Self { recursive, descendant: false }
	}

	pub fn descendant() -> Self {
		Self { recursive: true, descendant: true }
	}
}

/// The tail of the reader pipeline, shared by every backend: exclusion,
/// optional dedup, then the delivery channels.
pub(crate) struct Emitter {
	delivery: Arc<Delivery>,
	exclude: Option<ExcludePredicate>,
	dedup: Option<DedupFilter>,
}

impl Emitter {
	pub fn new(
		delivery: Arc<Delivery>,
		exclude: Option<ExcludePredicate>,
		dedup: Option<DedupFilter>,
	) -> Self {
		Self { delivery, exclude, dedup }
	}

	pub fn exclude(&self) -> Option<&ExcludePredicate> {
		self.exclude.as_ref()
	}

	pub fn emit(&mut self, event: Event) {
		if is_excluded(self.exclude.as_ref(), &event.path) {
			trace!(path = %event.path.display(), "event excluded");
			return;
		}
		if let Some(dedup) = &mut self.dedup {
			let now = Instant::now();
			if !dedup.admit(&event, now) {
				trace!(%event, "event collapsed by dedup window");
				return;
			}
		}
		self.delivery.publish_event(event);
	}

	/// Housekeeping between kernel batches.
	pub fn tick(&mut self) {
		if let Some(dedup) = &mut self.dedup {
			dedup.evict(Instant::now());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::Op;
	use std::path::Path;
	use std::time::Duration;

	#[test]
	fn emitter_applies_exclusion_before_delivery() {
		let (delivery, events, _errors) = Delivery::new(8, 8);
		let exclude: ExcludePredicate = Arc::new(|p: &Path| p.ends_with("skip"));
		let mut emitter = Emitter::new(Arc::new(delivery), Some(exclude), None);

		emitter.emit(Event::new("/t/skip", Op::CREATE));
		emitter.emit(Event::new("/t/keep", Op::CREATE));

		let got: Vec<_> = events.try_iter().map(|e| e.path).collect();
		assert_eq!(got, vec![std::path::PathBuf::from("/t/keep")]);
	}

	#[test]
	fn emitter_applies_dedup_when_configured() {
		let (delivery, events, _errors) = Delivery::new(8, 8);
		let dedup = DedupFilter::new(Duration::from_secs(5));
		let mut emitter = Emitter::new(Arc::new(delivery), None, Some(dedup));

		emitter.emit(Event::new("/t/a", Op::WRITE));
		emitter.emit(Event::new("/t/a", Op::WRITE));

		assert_eq!(events.try_iter().count(), 1);
	}
}
