//! Watcher backend for FEN event ports (illumos, Solaris).
//!
//! A port watches file objects, not descriptors, and is level-triggered
//! exactly once: delivering an event dissociates the object, so every
//! handled event re-associates its file before the next wait. Like
//! kqueue, a directory event only means "look again"; the rescan differ
//! works out what actually changed, and every direct child is associated
//! as well so file writes inside watched directories are visible.
//!
//! All association state lives on the event-loop thread; the facade talks
//! to it through a control channel and a `port_send` wakeup. With one
//! thread owning registration, a caller's add can't race the recursive
//! extension done during a rescan.

use std::collections::{HashMap, HashSet};
use std::ffi::{c_void, CString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

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

// sys/port.h event bits; libc carries the port syscalls and structs but
// not these.
const FILE_ACCESS: i32 = 0x0000_0001;
const FILE_MODIFIED: i32 = 0x0000_0002;
const FILE_ATTRIB: i32 = 0x0000_0004;
const FILE_DELETE: i32 = 0x0000_0010;
const FILE_RENAME_TO: i32 = 0x0000_0020;
const FILE_RENAME_FROM: i32 = 0x0000_0040;
const UNMOUNTED: i32 = 0x2000_0000;
const MOUNTEDOVER: i32 = 0x4000_0000;

const WATCH_EVENTS: i32 = FILE_MODIFIED | FILE_ATTRIB | FILE_DELETE | FILE_RENAME_TO | FILE_RENAME_FROM;

// portev_user cookie distinguishing control-channel wakeups from file
// events.
const WAKE_COOKIE: usize = usize::MAX;

fn op_from_events(events: i32) -> Op {
	let mut op = Op::empty();
	if events & FILE_ACCESS != 0 {
		op |= Op::ACCESS;
	}
	if events & FILE_MODIFIED != 0 {
		op |= Op::WRITE | Op::MODIFY;
	}
	if events & FILE_ATTRIB != 0 {
		op |= Op::CHMOD | Op::ATTRIB;
	}
	if events & FILE_DELETE != 0 {
		op |= Op::REMOVE | Op::DELETE_SELF;
	}
	if events & FILE_RENAME_FROM != 0 {
		op |= Op::RENAME | Op::MOVE_SELF;
	}
	if events & FILE_RENAME_TO != 0 {
		// Something was renamed onto the watched object, replacing it.
		op |= Op::REMOVE | Op::MOVED_TO;
	}
	if events & (UNMOUNTED | MOUNTEDOVER) != 0 {
		op |= Op::REMOVE | Op::UNMOUNT;
	}
	op
}

/// One associated file object. The port keeps a raw pointer to `obj`
/// (whose `fo_name` points into `name`), so both stay boxed and pinned in
/// the map for the lifetime of the association.
struct FileObj {
	name: CString,
	obj: Box<libc::file_obj>,
	is_dir: bool,
	cookie: usize,
}

// fo_name points into `name`, which lives and dies with the map entry;
// the whole struct is owned by the event-loop thread after creation.
unsafe impl Send for FileObj {}

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

pub(crate) struct FenBackend {
	ctl_tx: flume::Sender<CtrlMsg>,
	port: i32,
	reader: Mutex<Option<JoinHandle<()>>>,
}

impl FenBackend {
	pub fn new(
		registry: Arc<Registry>,
		delivery: Arc<Delivery>,
		emitter: Emitter,
	) -> Result<Self> {
		let port = unsafe { libc::port_create() };
		if port < 0 {
			return Err(Error::Io(std::io::Error::last_os_error()));
		}

		let (ctl_tx, ctl_rx) = flume::unbounded();

		let event_loop = EventLoop {
			port,
			ctl_rx,
			registry,
			delivery,
			emitter,
			objects: HashMap::new(),
			cookies: HashMap::new(),
			listings: DirListings::new(),
			next_cookie: 0,
			next_handle: 1,
		};
		let handle = std::thread::Builder::new()
			.name("pathwatch-fen".into())
			.spawn(move || event_loop.run())
			.map_err(Error::Io)?;

		Ok(Self {
			ctl_tx,
			port,
			reader: Mutex::new(Some(handle)),
		})
	}

	fn wake(&self) {
		let ok = unsafe { libc::port_send(self.port, 0, WAKE_COOKIE as *mut c_void) };
		if ok < 0 {
			warn!("failed to wake fen loop: {}", std::io::Error::last_os_error());
		}
	}

	fn roundtrip<T>(&self, msg: CtrlMsg, reply_rx: flume::Receiver<Result<T>>) -> Result<T> {
		self.ctl_tx.send(msg).map_err(|_| Error::Closed)?;
		self.wake();
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
			self.wake();
		}
		if let Some(handle) = self.reader.lock().take() {
			if handle.join().is_err() {
				error!("fen loop panicked");
			}
			unsafe { libc::close(self.port) };
		}
	}
}

struct EventLoop {
	port: i32,
	ctl_rx: flume::Receiver<CtrlMsg>,
	registry: Arc<Registry>,
	delivery: Arc<Delivery>,
	emitter: Emitter,
	objects: HashMap<PathBuf, FileObj>,
	cookies: HashMap<usize, PathBuf>,
	listings: DirListings,
	next_cookie: usize,
	next_handle: u64,
}

impl EventLoop {
	fn run(mut self) {
		loop {
			let mut pe: libc::port_event = unsafe { std::mem::zeroed() };
			let ret = unsafe { libc::port_get(self.port, &mut pe, std::ptr::null_mut()) };
			if ret < 0 {
				let err = std::io::Error::last_os_error();
				if err.kind() == std::io::ErrorKind::Interrupted {
					continue;
				}
				error!("port_get failed: {err}");
				self.delivery.publish_error(Error::Io(err));
				self.delivery.close();
				break;
			}

			let cookie = pe.portev_user as usize;
			if cookie == WAKE_COOKIE {
				if !self.handle_messages() {
					break;
				}
				continue;
			}

			self.handle_event(cookie, pe.portev_events as i32);
			self.emitter.tick();
		}
		debug!("fen loop exiting");
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

	/// Associates `path` with the port, pinning the name buffer the
	/// kernel reads. Re-associating a known path refreshes its
	/// timestamps, which is exactly what the re-arm after each event
	/// needs.
	fn associate(&mut self, path: &Path, is_dir: bool) -> std::io::Result<()> {
		let meta = path.symlink_metadata()?;
		let name = CString::new(path.as_os_str().as_bytes())
			.map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

		let cookie = match self.objects.get(path) {
			Some(existing) => existing.cookie,
			None => {
				let cookie = self.next_cookie;
				self.next_cookie += 1;
				self.cookies.insert(cookie, path.to_path_buf());
				cookie
			}
		};

		let mut obj: Box<libc::file_obj> = Box::new(unsafe { std::mem::zeroed() });
		obj.fo_atime.tv_sec = meta.atime();
		obj.fo_atime.tv_nsec = meta.atime_nsec();
		obj.fo_mtime.tv_sec = meta.mtime();
		obj.fo_mtime.tv_nsec = meta.mtime_nsec();
		obj.fo_ctime.tv_sec = meta.ctime();
		obj.fo_ctime.tv_nsec = meta.ctime_nsec();
		obj.fo_name = name.as_ptr() as *mut libc::c_char;

		let ret = unsafe {
			libc::port_associate(
				self.port,
				libc::PORT_SOURCE_FILE,
				obj.as_ref() as *const libc::file_obj as libc::uintptr_t,
				WATCH_EVENTS,
				cookie as *mut c_void,
			)
		};
		if ret < 0 {
			let err = std::io::Error::last_os_error();
			if !self.objects.contains_key(path) {
				self.cookies.remove(&cookie);
			}
			return Err(err);
		}

		self.objects
			.insert(path.to_path_buf(), FileObj { name, obj, is_dir, cookie });
		Ok(())
	}

	fn dissociate(&mut self, path: &Path) {
		if let Some(fo) = self.objects.remove(path) {
			unsafe {
				// Fails harmlessly when the event in flight already
				// dissociated the object.
				libc::port_dissociate(
					self.port,
					libc::PORT_SOURCE_FILE,
					fo.obj.as_ref() as *const libc::file_obj as libc::uintptr_t,
				);
			}
			self.cookies.remove(&fo.cookie);
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

		self.associate(path, is_dir).map_err(|e| Error::watch(path, e))?;

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
			if let Err(e) = self.listings.snapshot(path) {
				debug!(dir = %path.display(), "failed to list watched directory: {e}");
			}
			// Associate children so writes inside the directory show up.
			if let Ok(entries) = std::fs::read_dir(path) {
				for entry in entries.flatten() {
					let child = entry.path();
					if recurse::is_excluded(self.emitter.exclude(), &child) {
						continue;
					}
					let child_is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
					if let Err(e) = self.associate(&child, child_is_dir) {
						trace!(path = %child.display(), "failed to associate child: {e}");
					}
				}
			}
		}

		trace!(path = %path.display(), handle, "fen watch added");
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
		self.dissociate(&watch.path);
		if watch.is_dir {
			self.listings.forget(&watch.path);
			// Anonymous child associations die with the directory.
			let children: Vec<_> = self
				.objects
				.keys()
				.filter(|p| p.parent() == Some(watch.path.as_path()))
				.cloned()
				.collect();
			for child in children {
				if !self.registry.contains(&child) {
					self.dissociate(&child);
				}
			}
		}
		Ok(())
	}

	fn handle_event(&mut self, cookie: usize, events: i32) {
		let Some(path) = self.cookies.get(&cookie).cloned() else {
			trace!(cookie, "event for unknown file object");
			return;
		};
		let is_dir = self.objects.get(&path).map(|o| o.is_dir).unwrap_or(false);

		let gone =
			events & (FILE_DELETE | FILE_RENAME_FROM | FILE_RENAME_TO | UNMOUNTED | MOUNTEDOVER) != 0;
		let watch = self.registry.get(&path);
		let parent_watched = path
			.parent()
			.map(|p| self.registry.contains(p))
			.unwrap_or(false);

		if gone {
			self.drop_watch_state(&path);
			if watch.is_some() && !parent_watched {
				let mut op = op_from_events(events);
				if is_dir {
					op |= Op::IS_DIR;
				}
				self.emitter.emit(Event::new(path, op));
			}
			return;
		}

		if is_dir && events & FILE_MODIFIED != 0 {
			self.rescan(&path);
		} else if watch.is_some() || parent_watched {
			let mut op = op_from_events(events);
			if is_dir {
				op |= Op::IS_DIR;
			}
			if !op.is_empty() {
				self.emitter.emit(Event::new(path.clone(), op));
			}
		}

		// Level-triggered once: nothing arrives for this file again until
		// it is re-associated.
		if let Err(e) = self.associate(&path, is_dir) {
			debug!(path = %path.display(), "failed to re-associate: {e}");
			self.drop_watch_state(&path);
		}
	}

	fn rescan(&mut self, dir: &Path) {
		if !self.listings.contains(dir) {
			// First event for an anonymous subdirectory establishes its
			// baseline; entries present now predate the watch.
			if let Err(e) = self.listings.snapshot(dir) {
				debug!(dir = %dir.display(), "failed to list directory: {e}");
			}
			return;
		}
		let entries = match self.listings.diff(dir) {
			Ok(entries) => entries,
			Err(e) => {
				debug!(dir = %dir.display(), "rescan failed: {e}");
				return;
			}
		};
		let recursive = self.registry.get(dir).map(|w| w.recursive).unwrap_or(false);
		let mut delivered = HashSet::new();

		for entry in entries {
			match entry {
				DiffEntry::Created { path, is_dir } => {
					let mut op = Op::CREATE;
					if is_dir {
						op |= Op::IS_DIR;
					}
					delivered.insert(path.clone());
					self.emitter.emit(Event::new(path.clone(), op));
					if let Err(e) = self.associate(&path, is_dir) {
						trace!(path = %path.display(), "failed to associate new entry: {e}");
					}
					if is_dir && recursive {
						self.extend(&path, &mut delivered);
					}
				}
				DiffEntry::Removed { path, is_dir } => {
					self.drop_watch_state(&path);
					let mut op = Op::REMOVE | Op::DELETE;
					if is_dir {
						op |= Op::IS_DIR;
					}
					self.emitter.emit(Event::new(path, op));
				}
				DiffEntry::Renamed { from, to, is_dir } => {
					self.drop_watch_state(&from);
					let mut op = Op::RENAME | Op::MOVED_FROM;
					if is_dir {
						op |= Op::IS_DIR;
					}
					self.emitter.emit(Event::new(from, op));

					let mut op = Op::CREATE | Op::MOVED_TO;
					if is_dir {
						op |= Op::IS_DIR;
					}
					delivered.insert(to.clone());
					self.emitter.emit(Event::new(to.clone(), op));
					if let Err(e) = self.associate(&to, is_dir) {
						trace!(path = %to.display(), "failed to associate renamed entry: {e}");
					}
					if is_dir && recursive {
						self.extend(&to, &mut delivered);
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

	fn drop_watch_state(&mut self, path: &Path) {
		self.dissociate(path);
		self.listings.forget(path);
		if let Some(watch) = self.registry.remove_by_path(path) {
			if watch.recursive && watch.is_dir {
				for descendant in self.registry.descendants_of(path) {
					self.registry.remove_by_path(&descendant.path);
					self.dissociate(&descendant.path);
					self.listings.forget(&descendant.path);
				}
			}
		}
	}
}
