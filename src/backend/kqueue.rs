//! Watcher backend for the kqueue API (BSDs, macOS).
//!
//! kqueue attaches vnode filters to open file descriptors, one per watched
//! path, and a directory watch only says "something in here changed". The
//! event loop therefore keeps a listing per watched directory and infers
//! creations, removals and renames by rescanning and diffing. To see
//! writes to files inside a watched directory at all, every direct child
//! gets its own kernel watch as well.
//!
//! All kqueue calls happen on the event-loop thread; the facade talks to
//! it through a control channel and a waker.

use std::collections::HashSet;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use kqueue::{EventData, EventFilter, FilterFlag, Ident, Vnode};
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
use crate::rescan::{DiffEntry, DirListings};

const KQUEUE: Token = Token(0);
const WAKER: Token = Token(1);

fn vnode_flags() -> FilterFlag {
	FilterFlag::NOTE_DELETE
		| FilterFlag::NOTE_WRITE
		| FilterFlag::NOTE_EXTEND
		| FilterFlag::NOTE_ATTRIB
		| FilterFlag::NOTE_LINK
		| FilterFlag::NOTE_RENAME
		| FilterFlag::NOTE_REVOKE
}

enum CtrlMsg {
	Register {
		path: PathBuf,
		flags: WatchFlags,
		is_dir: bool,
		reply: flume::Sender<Result<u64>>,
	},
	RegisterTree {
		root: PathBuf,
		reply: flume::Sender<Result<()>>,
	},
	Deregister {
		watch: Watch,
		reply: flume::Sender<Result<()>>,
	},
	Shutdown,
}

pub(crate) struct KqueueBackend {
	ctl_tx: flume::Sender<CtrlMsg>,
	waker: Arc<Waker>,
	reader: Mutex<Option<JoinHandle<()>>>,
}

impl KqueueBackend {
	pub fn new(
		registry: Arc<Registry>,
		delivery: Arc<Delivery>,
		emitter: Emitter,
	) -> Result<Self> {
		let kq = kqueue::Watcher::new()?;
		let poll = Poll::new()?;
		let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

		let fd = kq.as_raw_fd();
		poll.registry()
			.register(&mut SourceFd(&fd), KQUEUE, Interest::READABLE)?;

		let (ctl_tx, ctl_rx) = flume::unbounded();

		let event_loop = EventLoop {
			kq,
			poll,
			ctl_rx,
			registry,
			delivery,
			emitter,
			listings: DirListings::new(),
			kernel_watched: HashSet::new(),
			next_handle: 1,
		};
		let handle = std::thread::Builder::new()
			.name("pathwatch-kqueue".into())
			.spawn(move || event_loop.run())
			.map_err(Error::Io)?;

		Ok(Self {
			ctl_tx,
			waker,
			reader: Mutex::new(Some(handle)),
		})
	}

	fn roundtrip<T>(&self, msg: CtrlMsg, reply_rx: flume::Receiver<Result<T>>) -> Result<T> {
		self.ctl_tx.send(msg).map_err(|_| Error::Closed)?;
		self.waker.wake().map_err(Error::Io)?;
		reply_rx.recv().map_err(|_| Error::Closed)?
	}

	pub fn register(&self, path: &Path, flags: WatchFlags, is_dir: bool) -> Result<u64> {
		let (reply, reply_rx) = flume::bounded(1);
		let msg = CtrlMsg::Register { path: path.to_path_buf(), flags, is_dir, reply };
		self.roundtrip(msg, reply_rx)
	}

	pub fn register_descendants(
		&self,
		root: &Path,
		_exclude: Option<&ExcludePredicate>,
	) -> Result<()> {
		// The loop applies its own exclude predicate while walking.
		let (reply, reply_rx) = flume::bounded(1);
		let msg = CtrlMsg::RegisterTree { root: root.to_path_buf(), reply };
		self.roundtrip(msg, reply_rx)
	}

	pub fn deregister(&self, watch: &Watch) -> Result<()> {
		let (reply, reply_rx) = flume::bounded(1);
		let msg = CtrlMsg::Deregister { watch: watch.clone(), reply };
		self.roundtrip(msg, reply_rx)
	}

	pub fn shutdown(&self) {
		if self.ctl_tx.send(CtrlMsg::Shutdown).is_ok() {
			if let Err(e) = self.waker.wake() {
				warn!("failed to wake kqueue loop: {e}");
			}
		}
		if let Some(handle) = self.reader.lock().take() {
			if handle.join().is_err() {
				error!("kqueue loop panicked");
			}
		}
	}
}

struct EventLoop {
	kq: kqueue::Watcher,
	poll: Poll,
	ctl_rx: flume::Receiver<CtrlMsg>,
	registry: Arc<Registry>,
	delivery: Arc<Delivery>,
	emitter: Emitter,
	listings: DirListings,
	// Paths with a kernel-level watch, including anonymous per-child
	// watches that have no registry entry of their own.
	kernel_watched: HashSet<PathBuf>,
	next_handle: u64,
}

impl EventLoop {
	fn run(mut self) {
		let mut mio_events = MioEvents::with_capacity(16);

		'outer: loop {
			match self.poll.poll(&mut mio_events, None) {
				Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
				Err(e) => {
					error!("kqueue poll failed: {e}");
					self.delivery.publish_error(Error::Io(e));
					self.delivery.close();
					break;
				}
				Ok(()) => {}
			}

			for mio_event in mio_events.iter() {
				match mio_event.token() {
					WAKER => {
						if !self.handle_messages() {
							break 'outer;
						}
					}
					KQUEUE => self.handle_kernel(),
					_ => {}
				}
			}

			self.emitter.tick();
		}

		debug!("kqueue loop exiting");
	}

	fn handle_messages(&mut self) -> bool {
		while let Ok(msg) = self.ctl_rx.try_recv() {
			match msg {
				CtrlMsg::Register { path, flags, is_dir, reply } => {
					let _ = reply.send(self.register(&path, flags, is_dir));
				}
				CtrlMsg::RegisterTree { root, reply } => {
					let _ = reply.send(self.register_tree(&root));
				}
				CtrlMsg::Deregister { watch, reply } => {
					let _ = reply.send(self.deregister(&watch));
				}
				CtrlMsg::Shutdown => return false,
			}
		}
		true
	}

	fn watch_path(&mut self, path: &Path) -> std::io::Result<()> {
		if self.kernel_watched.contains(path) {
			return Ok(());
		}
		self.kq
			.add_filename(path, EventFilter::EVFILT_VNODE, vnode_flags())?;
		self.kq.watch()?;
		self.kernel_watched.insert(path.to_path_buf());
		Ok(())
	}

	fn unwatch_path(&mut self, path: &Path) {
		if self.kernel_watched.remove(path) {
			// The fd may already be dead if the path was deleted.
			self.kq
				.remove_filename(path, EventFilter::EVFILT_VNODE)
				.ok();
			self.kq.watch().ok();
		}
	}

	fn register(&mut self, path: &Path, flags: WatchFlags, is_dir: bool) -> Result<u64> {
		// A rescan may have auto-registered this path between the
		// facade's registry check and this message; converge on the
		// existing watch instead of minting a second handle.
		if let Some(existing) = self.registry.get(path) {
			if !flags.descendant && existing.kind == RootKind::Descendant {
				self.registry.remove_by_path(path);
				let handle = existing.handle;
				self.registry.insert(Watch {
					kind: RootKind::Root,
					recursive: existing.recursive || flags.recursive,
					..existing
				});
				return Ok(handle);
			}
			return Ok(existing.handle);
		}

		self.watch_path(path).map_err(|e| Error::watch(path, e))?;

		let handle = self.next_handle;
		self.next_handle += 1;
		self.registry.insert(Watch {
			path: path.to_path_buf(),
			handle,
			is_dir,
			recursive: flags.recursive,
			kind: if flags.descendant { RootKind::Descendant } else { RootKind::Root },
		});

		if is_dir {
			// Per-child watches are the only way kqueue reports writes
			// to the files in here.
			if let Err(e) = self.listings.snapshot(path) {
				debug!(dir = %path.display(), "failed to list watched directory: {e}");
			}
			if let Ok(entries) = std::fs::read_dir(path) {
				for entry in entries.flatten() {
					let child = entry.path();
					if recurse::is_excluded(self.emitter.exclude(), &child) {
						continue;
					}
					if let Err(e) = self.watch_path(&child) {
						trace!(path = %child.display(), "failed to watch child: {e}");
					}
				}
			}
		}

		trace!(path = %path.display(), handle, "kqueue watch added");
		Ok(handle)
	}

	fn register_tree(&mut self, root: &Path) -> Result<()> {
		let exclude = self.emitter.exclude().cloned();
		for dir in recurse::collect_dirs(root, exclude.as_ref())? {
			if dir != root && !self.registry.contains(&dir) {
				self.register(&dir, WatchFlags::descendant(), true)?;
			}
		}
		Ok(())
	}

	fn deregister(&mut self, watch: &Watch) -> Result<()> {
		self.unwatch_path(&watch.path);
		if watch.is_dir {
			self.listings.forget(&watch.path);
			// Anonymous child watches die with the directory.
			let children: Vec<_> = self
				.kernel_watched
				.iter()
				.filter(|p| p.parent() == Some(watch.path.as_path()))
				.cloned()
				.collect();
			for child in children {
				if !self.registry.contains(&child) {
					self.unwatch_path(&child);
				}
			}
		}
		Ok(())
	}

	/// Drops every trace of a watch after the kernel reported its subject
	/// gone. Descendants are pruned without synthetic events; the kernel
	/// reports their fates itself.
	fn drop_watch_state(&mut self, path: &Path) {
		if let Some(watch) = self.registry.remove_by_path(path) {
			let _ = self.deregister(&watch);
			if watch.recursive && watch.is_dir {
				for descendant in self.registry.descendants_of(path) {
					self.registry.remove_by_path(&descendant.path);
					let _ = self.deregister(&descendant);
				}
			}
		} else {
			self.unwatch_path(path);
		}
	}

	/// A path is in scope if it is watched itself or sits directly in a
	/// watched directory. Descendant directories of recursive roots have
	/// their own registry entries, so one parent hop is enough.
	fn in_scope(&self, path: &Path) -> bool {
		if self.registry.contains(path) {
			return true;
		}
		path.parent()
			.map(|parent| self.registry.contains(parent))
			.unwrap_or(false)
	}

	fn handle_kernel(&mut self) {
		let mut delivered = HashSet::new();

		while let Some(event) = self.kq.poll(None) {
			trace!(?event, "kqueue event");
			let kqueue::Event { data: EventData::Vnode(vnode), ident: Ident::Filename(_, path) } =
				event
			else {
				continue;
			};
			let path = PathBuf::from(path);
			self.handle_vnode(path, vnode, &mut delivered);
		}

		// Re-arm whatever survived this batch.
		if let Err(e) = self.kq.watch() {
			warn!("failed to re-arm kqueue watches: {e}");
		}
	}

	fn handle_vnode(&mut self, path: PathBuf, vnode: Vnode, delivered: &mut HashSet<PathBuf>) {
		let watch = self.registry.get(&path);
		let is_dir = watch.as_ref().map(|w| w.is_dir).unwrap_or(false);

		match vnode {
			Vnode::Write | Vnode::Link if is_dir => self.rescan(&path, delivered),

			Vnode::Write | Vnode::Extend | Vnode::Truncate => {
				if self.in_scope(&path) {
					self.emit(Event::new(path, Op::WRITE), delivered);
				}
			}

			Vnode::Attrib => {
				if self.in_scope(&path) {
					let mut op = Op::CHMOD | Op::ATTRIB;
					if is_dir {
						op |= Op::IS_DIR;
					}
					self.emit(Event::new(path, op), delivered);
				}
			}

			Vnode::Delete | Vnode::Revoke => {
				let parent_watched = path
					.parent()
					.map(|p| self.registry.contains(p))
					.unwrap_or(false);
				self.drop_watch_state(&path);
				// When the parent directory is watched its rescan will
				// report this removal; don't say it twice.
				if watch.is_some() && !parent_watched {
					let mut op = Op::REMOVE | Op::DELETE_SELF;
					if is_dir {
						op |= Op::IS_DIR;
					}
					self.emit(Event::new(path, op), delivered);
				}
			}

			Vnode::Rename => {
				let parent_watched = path
					.parent()
					.map(|p| self.registry.contains(p))
					.unwrap_or(false);
				self.drop_watch_state(&path);
				if watch.is_some() && !parent_watched {
					let mut op = Op::RENAME | Op::MOVE_SELF;
					if is_dir {
						op |= Op::IS_DIR;
					}
					self.emit(Event::new(path, op), delivered);
				}
			}

			// Other BSDs ship extra vnote bits we don't subscribe to.
			#[allow(unreachable_patterns)]
			_ => {}
		}
	}

	/// Something changed inside `dir`: diff it against the last listing
	/// and synthesize what the kernel didn't say.
	fn rescan(&mut self, dir: &Path, delivered: &mut HashSet<PathBuf>) {
		let dir = dir.to_path_buf();
		let entries = match self.listings.diff(&dir) {
			Ok(entries) => entries,
			Err(e) => {
				debug!(dir = %dir.display(), "rescan failed: {e}");
				return;
			}
		};

		let recursive = self.registry.get(&dir).map(|w| w.recursive).unwrap_or(false);

		for entry in entries {
			match entry {
				DiffEntry::Created { path, is_dir } => {
					let mut op = Op::CREATE;
					if is_dir {
						op |= Op::IS_DIR;
					}
					self.emit(Event::new(path.clone(), op), delivered);
					if let Err(e) = self.watch_path(&path) {
						trace!(path = %path.display(), "failed to watch new entry: {e}");
					}
					if is_dir && recursive {
						self.extend(&path, delivered);
					}
				}
				DiffEntry::Removed { path, is_dir } => {
					self.drop_watch_state(&path);
					let mut op = Op::REMOVE | Op::DELETE;
					if is_dir {
						op |= Op::IS_DIR;
					}
					self.emit(Event::new(path, op), delivered);
				}
				DiffEntry::Renamed { from, to, is_dir } => {
					self.drop_watch_state(&from);
					let mut op = Op::RENAME | Op::MOVED_FROM;
					if is_dir {
						op |= Op::IS_DIR;
					}
					self.emit(Event::new(from, op), delivered);

					let mut op = Op::CREATE | Op::MOVED_TO;
					if is_dir {
						op |= Op::IS_DIR;
					}
					self.emit(Event::new(to.clone(), op), delivered);
					if let Err(e) = self.watch_path(&to) {
						trace!(path = %to.display(), "failed to watch renamed entry: {e}");
					}
					if is_dir && recursive {
						self.extend(&to, delivered);
					}
				}
			}
		}
	}

	/// A new directory under a recursive root: register it and everything
	/// below it, then catch up on entries created before the watches were
	/// in place.
	fn extend(&mut self, dir: &Path, delivered: &mut HashSet<PathBuf>) {
		let exclude = self.emitter.exclude().cloned();
		let dirs = match recurse::collect_dirs(dir, exclude.as_ref()) {
			Ok(dirs) => dirs,
			Err(e) => {
				debug!(dir = %dir.display(), "failed to enumerate new directory: {e}");
				return;
			}
		};

		for sub in dirs {
			if !self.registry.contains(&sub) {
				if let Err(e) = self.register(&sub, WatchFlags::descendant(), true) {
					debug!(dir = %sub.display(), "failed to extend recursive watch: {e}");
					continue;
				}
			}
			let emitter = &mut self.emitter;
			recurse::catch_up(&sub, exclude.as_ref(), delivered, |event| emitter.emit(event));
		}
	}

	fn emit(&mut self, event: Event, delivered: &mut HashSet<PathBuf>) {
		delivered.insert(event.path.clone());
		self.emitter.emit(event);
	}
}
