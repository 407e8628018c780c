//! Watcher backend for the inotify API (Linux).
//!
//! One inotify file descriptor carries every watch. Registration happens
//! on the caller's thread (`inotify_add_watch` is safe to issue while the
//! reader sleeps); the reader thread blocks on a `mio` poll over the fd
//! plus a waker, drains variable-length records until the fd runs dry, and
//! feeds them through the normalization table into the shared pipeline.
//!
//! inotify has no native recursion, so directory creations observed under
//! a recursive root extend the watch set on the fly, with a catch-up
//! listing to cover entries created before the new watch was in place.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use mio::unix::SourceFd;
use mio::{Events as MioEvents, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::{Emitter, WatchFlags};
use crate::config::ExcludePredicate;
use crate::delivery::Delivery;
use crate::error::{Error, Result};
use crate::event::{Event, Op};
use crate::recurse;
use crate::registry::{Registry, RootKind, Watch};

const INOTIFY: Token = Token(0);
const WAKER: Token = Token(1);

fn watch_mask() -> WatchMask {
	WatchMask::CREATE
		| WatchMask::MODIFY
		| WatchMask::ATTRIB
		| WatchMask::CLOSE_WRITE
		| WatchMask::MOVED_FROM
		| WatchMask::MOVED_TO
		| WatchMask::MOVE_SELF
		| WatchMask::DELETE
		| WatchMask::DELETE_SELF
}

fn op_from_mask(mask: EventMask) -> Op {
	let mut op = Op::empty();
	if mask.contains(EventMask::CREATE) {
		op |= Op::CREATE;
	}
	if mask.contains(EventMask::MOVED_TO) {
		op |= Op::CREATE | Op::MOVED_TO;
	}
	if mask.contains(EventMask::MODIFY) {
		op |= Op::WRITE | Op::MODIFY;
	}
	if mask.contains(EventMask::ATTRIB) {
		op |= Op::CHMOD | Op::ATTRIB;
	}
	if mask.contains(EventMask::CLOSE_WRITE) {
		op |= Op::CLOSE_WRITE;
	}
	if mask.contains(EventMask::CLOSE_NOWRITE) {
		op |= Op::CLOSE_NOWRITE;
	}
	if mask.contains(EventMask::OPEN) {
		op |= Op::OPEN;
	}
	if mask.contains(EventMask::ACCESS) {
		op |= Op::ACCESS;
	}
	if mask.contains(EventMask::DELETE) {
		op |= Op::REMOVE | Op::DELETE;
	}
	if mask.contains(EventMask::DELETE_SELF) {
		op |= Op::REMOVE | Op::DELETE_SELF;
	}
	if mask.contains(EventMask::MOVED_FROM) {
		op |= Op::RENAME | Op::MOVED_FROM;
	}
	if mask.contains(EventMask::MOVE_SELF) {
		op |= Op::RENAME | Op::MOVE_SELF;
	}
	if mask.contains(EventMask::ISDIR) {
		op |= Op::IS_DIR;
	}
	if mask.contains(EventMask::UNMOUNT) {
		op |= Op::UNMOUNT;
	}
	op
}

/// The controller half: add/remove syscalls on the shared fd, issued from
/// whatever thread the facade runs on. Also used by the reader to extend
/// recursive roots.
#[derive(Clone)]
struct Controller {
	watches: Watches,
	// handle → kernel descriptor, needed to issue the remove syscall.
	wds: Arc<Mutex<HashMap<u64, WatchDescriptor>>>,
	registry: Arc<Registry>,
}

impl Controller {
	fn add(&self, path: &Path, flags: WatchFlags, is_dir: bool) -> Result<u64> {
		let mut watches = self.watches.clone();
		let wd = watches
			.add(path, watch_mask())
			.map_err(|e| Error::watch(path, e))?;
		let handle = wd.get_watch_descriptor_id() as u64;
		self.wds.lock().insert(handle, wd);
		self.registry.insert(Watch {
			path: path.to_path_buf(),
			handle,
			is_dir,
			recursive: flags.recursive,
			kind: if flags.descendant { RootKind::Descendant } else { RootKind::Root },
		});
		trace!(path = %path.display(), handle, "inotify watch added");
		Ok(handle)
	}

	/// Issues the remove syscall for a watch whose registry entry the
	/// caller already took out. The kernel may have beaten us to it
	/// (deleted path), which is fine.
	fn remove(&self, watch: &Watch) -> Result<()> {
		let Some(wd) = self.wds.lock().remove(&watch.handle) else {
			return Ok(());
		};
		let mut watches = self.watches.clone();
		match watches.remove(wd) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
			Err(e) => Err(Error::watch(&watch.path, e)),
		}
	}

	/// Forgets a watch the kernel already dropped on its own.
	fn forget(&self, handle: u64) {
		self.wds.lock().remove(&handle);
		self.registry.remove_by_handle(handle);
	}
}

pub(crate) struct InotifyBackend {
	controller: Controller,
	waker: Arc<Waker>,
	shutdown: Arc<AtomicBool>,
	reader: Mutex<Option<JoinHandle<()>>>,
}

impl InotifyBackend {
	pub fn new(
		registry: Arc<Registry>,
		delivery: Arc<Delivery>,
		emitter: Emitter,
	) -> Result<Self> {
		let inotify = Inotify::init()?;
		let poll = Poll::new()?;
		let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

		let fd = inotify.as_raw_fd();
		poll.registry()
			.register(&mut SourceFd(&fd), INOTIFY, Interest::READABLE)?;

		let controller = Controller {
			watches: inotify.watches(),
			wds: Arc::new(Mutex::new(HashMap::new())),
			registry,
		};
		let shutdown = Arc::new(AtomicBool::new(false));

		let reader = Reader {
			inotify,
			poll,
			controller: controller.clone(),
			delivery,
			emitter,
			shutdown: shutdown.clone(),
		};
		let handle = std::thread::Builder::new()
			.name("pathwatch-inotify".into())
			.spawn(move || reader.run())
			.map_err(Error::Io)?;

		Ok(Self {
			controller,
			waker,
			shutdown,
			reader: Mutex::new(Some(handle)),
		})
	}

	pub fn register(&self, path: &Path, flags: WatchFlags, is_dir: bool) -> Result<u64> {
		self.controller.add(path, flags, is_dir)
	}

	/// Installs descendant watches for every directory already present
	/// under a recursive root.
	pub fn register_descendants(
		&self,
		root: &Path,
		exclude: Option<&ExcludePredicate>,
	) -> Result<()> {
		for dir in recurse::collect_dirs(root, exclude)? {
			if dir != root && !self.controller.registry.contains(&dir) {
				self.controller.add(&dir, WatchFlags::descendant(), true)?;
			}
		}
		Ok(())
	}

	pub fn deregister(&self, watch: &Watch) -> Result<()> {
		self.controller.remove(watch)
	}

	/// Wakes the reader and waits for it to exit. The inotify fd is
	/// released when the reader drops it, which also drops every kernel
	/// watch.
	pub fn shutdown(&self) {
		self.shutdown.store(true, Ordering::SeqCst);
		if let Err(e) = self.waker.wake() {
			warn!("failed to wake inotify reader: {e}");
		}
		if let Some(handle) = self.reader.lock().take() {
			if handle.join().is_err() {
				error!("inotify reader panicked");
			}
		}
	}
}

/// An owned copy of one kernel record; the read buffer is reused across
/// batches so records are detached from it before processing.
struct RawRecord {
	handle: u64,
	mask: EventMask,
	name: Option<OsString>,
}

struct Reader {
	inotify: Inotify,
	poll: Poll,
	controller: Controller,
	delivery: Arc<Delivery>,
	emitter: Emitter,
	shutdown: Arc<AtomicBool>,
}

impl Reader {
	fn run(mut self) {
		let mut mio_events = MioEvents::with_capacity(16);
		// 64K holds a full burst of records; a single record needs at
		// most sizeof(inotify_event) + NAME_MAX + 1.
		let mut buffer = Box::new([0u8; 65536]);

		'outer: loop {
			match self.poll.poll(&mut mio_events, None) {
				Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
				Err(e) => {
					error!("inotify poll failed: {e}");
					self.fail(Error::Io(e));
					break;
				}
				Ok(()) => {}
			}

			for mio_event in mio_events.iter() {
				match mio_event.token() {
					WAKER => {
						if self.shutdown.load(Ordering::SeqCst) {
							break 'outer;
						}
					}
					INOTIFY => {
						if !self.drain(&mut buffer[..]) {
							break 'outer;
						}
					}
					_ => {}
				}
			}

			self.emitter.tick();
		}

		debug!("inotify reader exiting");
	}

	/// Reads until the fd runs dry. Returns false when the stream is dead
	/// and the loop must stop.
	fn drain(&mut self, buffer: &mut [u8]) -> bool {
		// Tracks paths reported in this batch so catch-up listings don't
		// repeat them.
		let mut delivered = HashSet::new();

		loop {
			let mut batch = Vec::new();
			match self.inotify.read_events(buffer) {
				Ok(events) => {
					for event in events {
						batch.push(RawRecord {
							handle: event.wd.get_watch_descriptor_id() as u64,
							mask: event.mask,
							name: event.name.map(OsString::from),
						});
					}
				}
				Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
				Err(e) => {
					// A short or garbled read means we lost our place in
					// the record stream; there is no way to resync.
					error!("unreadable inotify event stream: {e}");
					self.fail(Error::Protocol(e));
					return false;
				}
			}

			for record in batch {
				self.handle_record(record, &mut delivered);
			}
		}
	}

	fn handle_record(&mut self, record: RawRecord, delivered: &mut HashSet<PathBuf>) {
		if record.mask.contains(EventMask::Q_OVERFLOW) {
			warn!("inotify queue overflowed, events were lost");
			self.delivery.publish_error(Error::Overflow);
			return;
		}

		if record.mask.contains(EventMask::IGNORED) {
			// The kernel dropped the watch, either because we asked or
			// because the path is gone; mirror it.
			self.controller.forget(record.handle);
			return;
		}

		let Some(watch) = self.controller.registry.by_handle(record.handle) else {
			trace!(handle = record.handle, "record for unknown watch");
			return;
		};

		let path = match &record.name {
			Some(name) if !name.is_empty() => watch.path.join(name),
			_ => watch.path.clone(),
		};
		let op = op_from_mask(record.mask);
		if op.is_empty() {
			return;
		}

		// The watched path itself went away: exactly one Remove or
		// Rename, then the watch and any recursive descendants go.
		if record.mask.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF) {
			self.remove_self(&watch, record.mask.contains(EventMask::MOVE_SELF));
			delivered.insert(path.clone());
			self.emitter.emit(Event::new(path, op));
			return;
		}

		delivered.insert(path.clone());
		self.emitter.emit(Event::new(path.clone(), op));

		// A directory appeared under a recursive root: extend the watch
		// set and catch up on anything we raced against.
		if watch.recursive
			&& record.mask.contains(EventMask::ISDIR)
			&& record.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO)
		{
			self.extend(&path, delivered);
		}
	}

	fn remove_self(&mut self, watch: &Watch, moved: bool) {
		self.controller.registry.remove_by_path(&watch.path);
		if moved {
			// A moved inode keeps its kernel watch alive; drop it
			// explicitly so events don't follow the path out of scope.
			if let Err(e) = self.controller.remove(watch) {
				debug!(path = %watch.path.display(), "failed to drop moved watch: {e}");
			}
		} else {
			self.controller.wds.lock().remove(&watch.handle);
		}

		if watch.recursive && watch.is_dir {
			// Descendants die with the root. The kernel reports their
			// own deletions; no synthetic events here.
			for descendant in self.controller.registry.descendants_of(&watch.path) {
				self.controller.registry.remove_by_path(&descendant.path);
				if let Err(e) = self.controller.remove(&descendant) {
					debug!(
						path = %descendant.path.display(),
						"failed to drop descendant watch: {e}",
					);
				}
			}
		}
	}

	fn extend(&mut self, dir: &Path, delivered: &mut HashSet<PathBuf>) {
		let exclude = self.emitter.exclude().cloned();
		let dirs = match recurse::collect_dirs(dir, exclude.as_ref()) {
			Ok(dirs) => dirs,
			Err(e) => {
				// The directory can be gone again before we walk it.
				debug!(dir = %dir.display(), "failed to enumerate new directory: {e}");
				return;
			}
		};

		for sub in dirs {
			if self.controller.registry.contains(&sub) {
				continue;
			}
			if let Err(e) = self.controller.add(&sub, WatchFlags::descendant(), true) {
				debug!(dir = %sub.display(), "failed to extend recursive watch: {e}");
				continue;
			}
			let emitter = &mut self.emitter;
			recurse::catch_up(&sub, exclude.as_ref(), delivered, |event| emitter.emit(event));
		}
	}

	/// Fatal reader-side failure: post the error, end both streams, mark
	/// the watcher closed.
	fn fail(&mut self, error: Error) {
		self.delivery.publish_error(error);
		self.delivery.close();
		self.shutdown.store(true, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn masks_map_to_canonical_bits_plus_subflags() {
		assert_eq!(op_from_mask(EventMask::CREATE), Op::CREATE);
		assert_eq!(op_from_mask(EventMask::MODIFY), Op::WRITE | Op::MODIFY);
		assert_eq!(op_from_mask(EventMask::ATTRIB), Op::CHMOD | Op::ATTRIB);
		assert_eq!(op_from_mask(EventMask::DELETE), Op::REMOVE | Op::DELETE);
		assert_eq!(
			op_from_mask(EventMask::DELETE_SELF),
			Op::REMOVE | Op::DELETE_SELF,
		);
		assert_eq!(
			op_from_mask(EventMask::MOVED_FROM),
			Op::RENAME | Op::MOVED_FROM,
		);
		assert_eq!(op_from_mask(EventMask::MOVE_SELF), Op::RENAME | Op::MOVE_SELF);
	}

	#[test]
	fn moved_to_counts_as_create() {
		let op = op_from_mask(EventMask::MOVED_TO | EventMask::ISDIR);
		assert!(op.has(Op::CREATE));
		assert!(op.has(Op::MOVED_TO));
		assert!(op.has(Op::IS_DIR));
		assert!(!op.has(Op::RENAME));
	}

	#[test]
	fn unsubscribed_bits_map_to_nothing() {
		assert!(op_from_mask(EventMask::IGNORED).is_empty());
	}
}
