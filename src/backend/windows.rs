//! Watcher backend for ReadDirectoryChangesW (Windows).
//!
//! Each watched root is a directory HANDLE opened for overlapped I/O and
//! bound to one completion port. The reader thread blocks on the port;
//! every completion carries a chain of FILE_NOTIFY_INFORMATION records
//! which is walked, translated and re-armed with another
//! ReadDirectoryChangesW call into the same caller-sized buffer. Renames
//! arrive as an OLD/NEW record pair and are matched into a single Rename
//! at the position of the NEW record. Recursion is native here: the kernel
//! walks the subtree for us.
//!
//! All per-watch state lives on the reader thread; the facade talks to it
//! through a control channel and a posted wake packet.

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use windows_sys::Win32::Foundation::{
	CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_OPERATION_ABORTED, HANDLE,
	INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
	CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
	FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
	FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
	FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
	FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY,
	FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ,
	FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::INFINITE;
use windows_sys::Win32::System::IO::{
	CancelIo, CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus,
	OVERLAPPED,
};

use super::{Emitter, WatchFlags};
use crate::config::ExcludePredicate;
use crate::delivery::Delivery;
use crate::error::{Error, Result};
use crate::event::{Event, Op};
use crate::registry::{Registry, RootKind, Watch};

// Completion key reserved for control-channel wakeups.
const WAKE_KEY: usize = 0;

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
	| FILE_NOTIFY_CHANGE_DIR_NAME
	| FILE_NOTIFY_CHANGE_ATTRIBUTES
	| FILE_NOTIFY_CHANGE_SIZE
	| FILE_NOTIFY_CHANGE_LAST_WRITE
	| FILE_NOTIFY_CHANGE_CREATION
	| FILE_NOTIFY_CHANGE_SECURITY;

/// The completion port handle, shared between the reader (waits) and the
/// facade (posts wakeups). Completion ports are thread-safe by contract.
struct Port(HANDLE);

unsafe impl Send for Port {}
unsafe impl Sync for Port {}

impl Drop for Port {
	fn drop(&mut self) {
		unsafe { CloseHandle(self.0) };
	}
}

enum CtrlMsg {
	Register {
		path: PathBuf,
		flags: WatchFlags,
		reply: flume::Sender<Result<u64>>,
	},
	Deregister {
		watch: Watch,
		reply: flume::Sender<Result<()>>,
	},
	Shutdown,
}

pub(crate) struct ReadDirectoryChangesBackend {
	ctl_tx: flume::Sender<CtrlMsg>,
	port: Arc<Port>,
	reader: Mutex<Option<JoinHandle<()>>>,
}

impl ReadDirectoryChangesBackend {
	pub fn new(
		registry: Arc<Registry>,
		delivery: Arc<Delivery>,
		emitter: Emitter,
		buffer_size: usize,
	) -> Result<Self> {
		let raw = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 1) };
		if raw.is_null() {
			return Err(Error::Io(std::io::Error::last_os_error()));
		}
		let port = Arc::new(Port(raw));

		let (ctl_tx, ctl_rx) = flume::unbounded();

		let event_loop = EventLoop {
			port: port.clone(),
			ctl_rx,
			registry,
			delivery,
			emitter,
			watches: HashMap::new(),
			next_handle: 1,
			buffer_size,
		};
		let handle = std::thread::Builder::new()
			.name("pathwatch-rdcw".into())
			.spawn(move || event_loop.run())
			.map_err(Error::Io)?;

		Ok(Self {
			ctl_tx,
			port,
			reader: Mutex::new(Some(handle)),
		})
	}

	fn wake(&self) {
		let ok = unsafe { PostQueuedCompletionStatus(self.port.0, 0, WAKE_KEY, std::ptr::null_mut()) };
		if ok == 0 {
			warn!("failed to post completion-port wakeup: {}", std::io::Error::last_os_error());
		}
	}

	fn roundtrip<T>(&self, msg: CtrlMsg, reply_rx: flume::Receiver<Result<T>>) -> Result<T> {
		self.ctl_tx.send(msg).map_err(|_| Error::Closed)?;
		self.wake();
		reply_rx.recv().map_err(|_| Error::Closed)?
	}

	pub fn register(&self, path: &Path, flags: WatchFlags, _is_dir: bool) -> Result<u64> {
		let (reply, reply_rx) = flume::bounded(1);
		let msg = CtrlMsg::Register { path: path.to_path_buf(), flags, reply };
		self.roundtrip(msg, reply_rx)
	}

	/// ReadDirectoryChangesW walks the subtree natively; there is nothing
	/// to seed.
	pub fn register_descendants(
		&self,
		_root: &Path,
		_exclude: Option<&ExcludePredicate>,
	) -> Result<()> {
		Ok(())
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
				error!("completion-port reader panicked");
			}
		}
	}
}

struct WinWatch {
	path: PathBuf,
	handle: HANDLE,
	// u64-backed so the FILE_NOTIFY_INFORMATION chain is DWORD-aligned.
	buffer: Vec<u64>,
	overlapped: Box<OVERLAPPED>,
	recursive: bool,
	// OLD_NAME waiting for its NEW_NAME partner.
	rename_old: Option<PathBuf>,
	// Deregistered; the entry only survives until the aborted completion
	// arrives so the kernel can't write into freed memory.
	dying: bool,
}

// HANDLE and the OVERLAPPED pointers are only ever touched from the
// reader thread once the watch is created.
unsafe impl Send for WinWatch {}

struct EventLoop {
	port: Arc<Port>,
	ctl_rx: flume::Receiver<CtrlMsg>,
	registry: Arc<Registry>,
	delivery: Arc<Delivery>,
	emitter: Emitter,
	watches: HashMap<u64, WinWatch>,
	next_handle: u64,
	buffer_size: usize,
}

impl EventLoop {
	fn run(mut self) {
		loop {
			let mut bytes = 0u32;
			let mut key = 0usize;
			let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
			let ok = unsafe {
				GetQueuedCompletionStatus(self.port.0, &mut bytes, &mut key, &mut overlapped, INFINITE)
			};

			if key == WAKE_KEY {
				if !self.handle_messages() {
					break;
				}
				continue;
			}

			let failed = ok == 0;
			self.handle_completion(key as u64, bytes as usize, failed);
			self.emitter.tick();
		}

		for (_, watch) in self.watches.drain() {
			unsafe {
				CancelIo(watch.handle);
				CloseHandle(watch.handle);
			}
		}
		debug!("completion-port reader exiting");
	}

	fn handle_messages(&mut self) -> bool {
		while let Ok(msg) = self.ctl_rx.try_recv() {
			match msg {
				CtrlMsg::Register { path, flags, reply } => {
					let _ = reply.send(self.register(&path, flags));
				}
				CtrlMsg::Deregister { watch, reply } => {
					let _ = reply.send(self.deregister(&watch));
				}
				CtrlMsg::Shutdown => return false,
			}
		}
		true
	}

	fn register(&mut self, path: &Path, flags: WatchFlags) -> Result<u64> {
		let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
		let handle = unsafe {
			CreateFileW(
				wide.as_ptr(),
				FILE_LIST_DIRECTORY,
				FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
				std::ptr::null(),
				OPEN_EXISTING,
				FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
				std::ptr::null_mut(),
			)
		};
		if handle == INVALID_HANDLE_VALUE {
			return Err(Error::watch(path, std::io::Error::last_os_error()));
		}

		let id = self.next_handle;
		self.next_handle += 1;

		let bound = unsafe { CreateIoCompletionPort(handle, self.port.0, id as usize, 0) };
		if bound.is_null() {
			let err = std::io::Error::last_os_error();
			unsafe { CloseHandle(handle) };
			return Err(Error::watch(path, err));
		}

		let mut watch = WinWatch {
			path: path.to_path_buf(),
			handle,
			buffer: vec![0u64; self.buffer_size.div_ceil(8)],
			overlapped: Box::new(unsafe { std::mem::zeroed() }),
			recursive: flags.recursive,
			rename_old: None,
			dying: false,
		};
		if let Err(e) = issue_read(&mut watch) {
			unsafe { CloseHandle(handle) };
			return Err(Error::watch(path, e));
		}

		self.registry.insert(Watch {
			path: path.to_path_buf(),
			handle: id,
			is_dir: true,
			recursive: flags.recursive,
			kind: if flags.descendant { RootKind::Descendant } else { RootKind::Root },
		});
		self.watches.insert(id, watch);
		trace!(path = %path.display(), handle = id, "directory watch added");
		Ok(id)
	}

	fn deregister(&mut self, watch: &Watch) -> Result<()> {
		let Some(state) = self.watches.get_mut(&watch.handle) else {
			return Ok(());
		};
		state.dying = true;
		unsafe {
			CancelIo(state.handle);
			CloseHandle(state.handle);
		}
		Ok(())
	}

	fn handle_completion(&mut self, id: u64, bytes: usize, failed: bool) {
		let Some(watch) = self.watches.get_mut(&id) else {
			return;
		};

		if failed {
			let code = unsafe { GetLastError() };
			if watch.dying || code == ERROR_OPERATION_ABORTED {
				// The buffer is finally free to go.
				self.watches.remove(&id);
				return;
			}
			// The watched directory itself is gone (deleted or access
			// revoked): one Remove, then the watch dies.
			debug!(path = %watch.path.display(), code, "directory watch failed");
			let path = watch.path.clone();
			unsafe { CloseHandle(watch.handle) };
			self.watches.remove(&id);
			self.registry.remove_by_path(&path);
			if code != ERROR_ACCESS_DENIED {
				self.delivery.publish_error(Error::watch(&path, std::io::Error::from_raw_os_error(code as i32)));
			}
			self.emitter.emit(Event::new(path, Op::REMOVE | Op::DELETE_SELF | Op::IS_DIR));
			return;
		}

		if watch.dying {
			self.watches.remove(&id);
			return;
		}

		if bytes == 0 {
			// The kernel couldn't fit the burst into our buffer and
			// threw it away.
			warn!(path = %watch.path.display(), "change buffer overflowed, events were lost");
			self.delivery.publish_error(Error::Overflow);
		} else {
			let records = parse_notify_chain(&watch.buffer, bytes, &watch.path);
			let root = watch.path.clone();
			let mut pending_old = watch.rename_old.take();
			let mut out = Vec::new();
			for (action, path) in records {
				translate(action, path, &mut pending_old, &mut out);
			}
			if let Some(watch) = self.watches.get_mut(&id) {
				watch.rename_old = pending_old;
			}
			for event in out {
				self.emit_with_registry_cleanup(&root, event);
			}
		}

		if let Some(watch) = self.watches.get_mut(&id) {
			if let Err(e) = issue_read(watch) {
				error!(path = %watch.path.display(), "failed to re-arm directory watch: {e}");
				let path = watch.path.clone();
				unsafe { CloseHandle(watch.handle) };
				self.watches.remove(&id);
				self.registry.remove_by_path(&path);
				self.delivery.publish_error(Error::watch(path, e));
			}
		}
	}

	fn emit_with_registry_cleanup(&mut self, root: &Path, event: Event) {
		// A removed or renamed entry that is itself a watched root: the
		// kernel record came from the parent watch, the registry entry
		// still has to go.
		if event.op.intersects(Op::REMOVE | Op::RENAME) && event.path != root {
			if let Some(watch) = self.registry.get(&event.path) {
				self.registry.remove_by_path(&event.path);
				if let Some(state) = self.watches.get_mut(&watch.handle) {
					state.dying = true;
					unsafe {
						CancelIo(state.handle);
						CloseHandle(state.handle);
					}
				}
			}
		}
		self.emitter.emit(event);
	}
}

fn issue_read(watch: &mut WinWatch) -> std::io::Result<()> {
	let ok = unsafe {
		ReadDirectoryChangesW(
			watch.handle,
			watch.buffer.as_mut_ptr() as *mut c_void,
			(watch.buffer.len() * 8) as u32,
			if watch.recursive { 1 } else { 0 },
			NOTIFY_FILTER,
			std::ptr::null_mut(),
			watch.overlapped.as_mut(),
			None,
		)
	};
	if ok == 0 {
		Err(std::io::Error::last_os_error())
	} else {
		Ok(())
	}
}

/// Walks the FILE_NOTIFY_INFORMATION chain, yielding (action, full path)
/// pairs in kernel order.
fn parse_notify_chain(buffer: &[u64], bytes: usize, root: &Path) -> Vec<(u32, PathBuf)> {
	let mut out = Vec::new();
	let base = buffer.as_ptr() as *const u8;
	let mut offset = 0usize;

	loop {
		if offset + std::mem::size_of::<FILE_NOTIFY_INFORMATION>() > bytes {
			break;
		}
		let info = unsafe { &*(base.add(offset) as *const FILE_NOTIFY_INFORMATION) };
		let name_len = info.FileNameLength as usize / 2;
		let name = unsafe {
			std::slice::from_raw_parts(info.FileName.as_ptr(), name_len)
		};
		let relative = PathBuf::from(std::ffi::OsString::from_wide(name));
		out.push((info.Action, root.join(relative)));

		if info.NextEntryOffset == 0 {
			break;
		}
		offset += info.NextEntryOffset as usize;
	}
	out
}

/// Maps one action record to events, pairing rename OLD/NEW records into a
/// single Rename emitted at the position of the NEW record, followed by
/// the Create for the new path.
fn translate(action: u32, path: PathBuf, pending_old: &mut Option<PathBuf>, out: &mut Vec<Event>) {
	match action {
		FILE_ACTION_ADDED => {
			let mut op = Op::CREATE;
			if path.is_dir() {
				op |= Op::IS_DIR;
			}
			out.push(Event::new(path, op));
		}
		FILE_ACTION_MODIFIED => out.push(Event::new(path, Op::WRITE | Op::MODIFY)),
		FILE_ACTION_REMOVED => out.push(Event::new(path, Op::REMOVE | Op::DELETE)),
		FILE_ACTION_RENAMED_OLD_NAME => {
			*pending_old = Some(path);
		}
		FILE_ACTION_RENAMED_NEW_NAME => {
			if let Some(old) = pending_old.take() {
				out.push(Event::new(old, Op::RENAME | Op::MOVED_FROM));
			}
			let mut op = Op::CREATE | Op::MOVED_TO;
			if path.is_dir() {
				op |= Op::IS_DIR;
			}
			out.push(Event::new(path, op));
		}
		other => trace!(action = other, "unhandled directory change action"),
	}
}
