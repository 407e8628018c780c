//! Cross-platform filesystem change notification.
//!
//! `pathwatch` turns the kernel's native change-notification primitive
//! into one uniform event stream:
//!
//! - Linux via inotify
//! - BSDs and macOS via kqueue
//! - Windows via ReadDirectoryChangesW
//! - illumos and Solaris via FEN event ports
//!
//! # Architecture
//!
//! A [`Watcher`] owns one kernel endpoint and a reader thread blocked on
//! it. Registration bookkeeping lives in a path ↔ handle registry;
//! raw kernel records are normalized into [`Event`]s carrying an [`Op`]
//! bitmask of canonical operations plus lossless kernel subflags. On
//! kernels without native recursion, directory creations under a
//! recursive root extend the watch set on the fly. Events and errors
//! arrive on two bounded channels; when the kernel outruns the consumer
//! the oldest events are shed and an [`Error::Overflow`] is posted, so
//! the reader never blocks.
//!
//! Delivery is best-effort by design: kernel queues can overflow, and
//! recursive watch extension has a small documented race that is patched
//! up by a catch-up rescan. Don't build transactional logic on top of
//! this; rescan when it matters.
//!
//! # Example
//!
//! ```no_run
//! use pathwatch::Watcher;
//!
//! # fn main() -> pathwatch::Result<()> {
//! let watcher = Watcher::new()?;
//! watcher.add("/some/dir")?;
//!
//! loop {
//! 	flume::Selector::new()
//! 		.recv(watcher.events(), |event| match event {
//! 			Ok(event) => println!("{event}"),
//! 			Err(_) => std::process::exit(0),
//! 		})
//! 		.recv(watcher.errors(), |error| {
//! 			if let Ok(error) = error {
//! 				eprintln!("error: {error}");
//! 			}
//! 		})
//! 		.wait();
//! }
//! # }
//! ```

mod backend;
mod config;
mod dedup;
mod delivery;
mod error;
mod event;
mod recurse;
mod registry;
#[cfg(any(
	all(test, unix),
	target_os = "macos",
	target_os = "ios",
	target_os = "freebsd",
	target_os = "netbsd",
	target_os = "openbsd",
	target_os = "dragonfly",
	target_os = "illumos",
	target_os = "solaris"
))]
mod rescan;
mod walk;
mod watcher;

pub use config::{ExcludePredicate, Options, DEFAULT_DEDUP_WINDOW};
pub use error::{Error, Result};
pub use event::{Event, Op};
pub use walk::dir_names;
pub use watcher::Watcher;
