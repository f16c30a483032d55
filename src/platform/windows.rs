//! Windows backend: `ReadDirectoryChangesW` over an I/O completion port.
//!
//! Only directories can be watched; file-level watching is emulated by the
//! embedding layer. Each watch opens the directory with backup semantics and
//! overlapped I/O, associates it with the shared completion port, and keeps
//! exactly one `ReadDirectoryChangesW` outstanding, re-armed after every
//! completion.
//!
//! A [`HandleWrapper`] owns the directory handle, its `OVERLAPPED`, the
//! notification buffer and the originally requested path (the OS reports
//! child names relative to the directory). `unwatch` must not free the
//! wrapper while a completion still references its buffer, so the wrapper is
//! moved to a retire map and freed when the pump drains the final completion
//! for the closed handle.

use crate::bridge::EventBridge;
use crate::event::{EventType, WatcherEvent};
use crate::platform::WatcherHandle;
use std::collections::HashMap;
use std::ffi::OsString;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use tracing::{error, trace, warn};
use windows_sys::Win32::Foundation::{
	CloseHandle, GetLastError, ERROR_DIRECTORY, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
	CreateFileW, GetFileAttributesW, ReadDirectoryChangesW, FILE_ACTION_ADDED,
	FILE_ACTION_MODIFIED, FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME,
	FILE_ACTION_RENAMED_OLD_NAME, FILE_ATTRIBUTE_DIRECTORY, FILE_FLAG_BACKUP_SEMANTICS,
	FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES,
	FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
	FILE_NOTIFY_CHANGE_LAST_ACCESS, FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY,
	FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ,
	FILE_SHARE_WRITE, INVALID_FILE_ATTRIBUTES, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::INFINITE;
use windows_sys::Win32::System::IO::{
	CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
};

const BUFFER_SIZE: usize = 16 * 1024;

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
	| FILE_NOTIFY_CHANGE_DIR_NAME
	| FILE_NOTIFY_CHANGE_ATTRIBUTES
	| FILE_NOTIFY_CHANGE_SIZE
	| FILE_NOTIFY_CHANGE_LAST_WRITE
	| FILE_NOTIFY_CHANGE_LAST_ACCESS
	| FILE_NOTIFY_CHANGE_CREATION
	| FILE_NOTIFY_CHANGE_SECURITY;

// FILE_NOTIFY_INFORMATION records are DWORD-aligned within the buffer.
#[repr(align(8))]
struct NotifyBuffer([u8; BUFFER_SIZE]);

struct HandleWrapper {
	dir_handle: HANDLE,
	overlapped: OVERLAPPED,
	buffer: NotifyBuffer,
	/// Originally requested path, for reconstructing child paths from the
	/// relative filenames in the notification records.
	path: PathBuf,
	/// The OS side of this watch is gone (failed completion, handle already
	/// closed); `unwatch` frees the wrapper directly instead of retiring it.
	dead: bool,
}

// OVERLAPPED contains a raw pointer member we never use; the wrapper itself
// only crosses threads inside the backend's mutex-guarded maps.
unsafe impl Send for HandleWrapper {}

pub(crate) struct Backend {
	iocp: HANDLE,
	init_error: i32,
	/// Directory handle value -> live wrapper.
	wrappers: Mutex<HashMap<HANDLE, Box<HandleWrapper>>>,
	/// Wrappers whose handle was closed by `unwatch`, kept until the pump
	/// drains their final (aborted) completion.
	retired: Mutex<HashMap<HANDLE, Box<HandleWrapper>>>,
	/// OS error of the most recent failed watch; a HANDLE cannot encode an
	/// error number the way a negative POSIX descriptor can.
	last_error: AtomicI32,
}

impl Backend {
	pub(crate) fn init() -> Self {
		let iocp = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 1) };
		let init_error = if iocp == 0 {
			let code = unsafe { GetLastError() } as i32;
			error!("CreateIoCompletionPort failed: os error {code}");
			code
		} else {
			0
		};
		Self {
			iocp,
			init_error,
			wrappers: Mutex::new(HashMap::new()),
			retired: Mutex::new(HashMap::new()),
			last_error: AtomicI32::new(0),
		}
	}

	pub(crate) fn init_error(&self) -> Option<i32> {
		(self.iocp == 0).then_some(self.init_error)
	}

	pub(crate) fn watch(&self, path: &Path) -> WatcherHandle {
		if self.iocp == 0 {
			self.last_error.store(self.init_error, Ordering::SeqCst);
			return WatcherHandle::invalid();
		}

		let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();

		// Requires a directory; file watching is emulated by the embedding
		// layer.
		let attributes = unsafe { GetFileAttributesW(wide.as_ptr()) };
		if attributes == INVALID_FILE_ATTRIBUTES {
			return self.fail_watch(unsafe { GetLastError() } as i32);
		}
		if attributes & FILE_ATTRIBUTE_DIRECTORY == 0 {
			return self.fail_watch(ERROR_DIRECTORY as i32);
		}

		let dir_handle = unsafe {
			CreateFileW(
				wide.as_ptr(),
				FILE_LIST_DIRECTORY,
				FILE_SHARE_READ | FILE_SHARE_DELETE | FILE_SHARE_WRITE,
				ptr::null(),
				OPEN_EXISTING,
				FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
				0,
			)
		};
		if dir_handle == INVALID_HANDLE_VALUE {
			return self.fail_watch(unsafe { GetLastError() } as i32);
		}

		if unsafe { CreateIoCompletionPort(dir_handle, self.iocp, dir_handle as usize, 0) } == 0 {
			let code = unsafe { GetLastError() } as i32;
			unsafe { CloseHandle(dir_handle) };
			return self.fail_watch(code);
		}

		let wrapper = Box::new(HandleWrapper {
			dir_handle,
			overlapped: unsafe { std::mem::zeroed() },
			buffer: NotifyBuffer([0; BUFFER_SIZE]),
			path: path.to_path_buf(),
			dead: false,
		});

		// Insert before arming so the pump can always resolve the
		// completion key, then arm under the same lock.
		let mut wrappers = self.wrappers.lock().expect("wrapper map poisoned");
		let entry = wrappers.entry(dir_handle).or_insert(wrapper);
		if !arm(entry) {
			let code = unsafe { GetLastError() } as i32;
			wrappers.remove(&dir_handle);
			drop(wrappers);
			unsafe { CloseHandle(dir_handle) };
			return self.fail_watch(code);
		}
		drop(wrappers);

		trace!("watching {} (handle {dir_handle})", path.display());
		WatcherHandle(dir_handle)
	}

	pub(crate) fn unwatch(&self, handle: WatcherHandle) -> bool {
		let Some(wrapper) = self
			.wrappers
			.lock()
			.expect("wrapper map poisoned")
			.remove(&handle.0)
		else {
			return false;
		};

		trace!("unwatching {} (handle {})", wrapper.path.display(), handle.0);
		if wrapper.dead {
			// No read outstanding any more, nothing left to drain.
			return true;
		}
		// Closing the handle aborts the outstanding read; its completion
		// still lands on the port, so the wrapper must outlive it.
		unsafe { CloseHandle(wrapper.dir_handle) };
		self.retired
			.lock()
			.expect("retire map poisoned")
			.insert(handle.0, wrapper);
		true
	}

	pub(crate) fn invalid_to_error_number(&self, _handle: WatcherHandle) -> i32 {
		self.last_error.load(Ordering::SeqCst)
	}

	pub(crate) fn pump(&self, bridge: &EventBridge) {
		if self.iocp == 0 {
			return;
		}

		loop {
			let mut bytes: u32 = 0;
			let mut key: usize = 0;
			let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
			let ok = unsafe {
				GetQueuedCompletionStatus(self.iocp, &mut bytes, &mut key, &mut overlapped, INFINITE)
			};

			if overlapped.is_null() {
				if ok == 0 {
					error!("GetQueuedCompletionStatus failed, stopping pump: os error {}", unsafe {
						GetLastError()
					});
					return;
				}
				continue;
			}

			let dir_handle = key as HANDLE;

			// The final completion for an unwatched handle frees its
			// retired wrapper; nothing is emitted for it.
			if self
				.retired
				.lock()
				.expect("retire map poisoned")
				.remove(&dir_handle)
				.is_some()
			{
				continue;
			}

			if ok == 0 {
				// Failed completion for a live watch, typically because the
				// watched directory itself was deleted. The handle stays
				// valid for `unwatch`; the OS side is finished.
				warn!("completion for handle {dir_handle} failed: os error {}", unsafe {
					GetLastError()
				});
				let gone = {
					let mut wrappers = self.wrappers.lock().expect("wrapper map poisoned");
					match wrappers.get_mut(&dir_handle) {
						Some(wrapper) if !wrapper.dead => {
							unsafe { CloseHandle(wrapper.dir_handle) };
							wrapper.dead = true;
							true
						}
						_ => false,
					}
				};
				if gone {
					bridge.post_and_wait(WatcherEvent::on_self(
						EventType::Delete,
						WatcherHandle(dir_handle),
					));
				}
				continue;
			}

			// Translate and re-arm under the lock, then post with the lock
			// released so a concurrent unwatch cannot deadlock against the
			// fire-and-wait handoff.
			let events = {
				let mut wrappers = self.wrappers.lock().expect("wrapper map poisoned");
				let Some(wrapper) = wrappers.get_mut(&dir_handle) else {
					continue;
				};
				let events = translate_batch(wrapper, bytes);
				if !arm(wrapper) {
					warn!("failed to re-arm watch on {}: os error {}", wrapper.path.display(), unsafe {
						GetLastError()
					});
				}
				events
			};

			for event in events {
				bridge.post_and_wait(event);
			}
		}
	}

	fn fail_watch(&self, code: i32) -> WatcherHandle {
		self.last_error.store(code, Ordering::SeqCst);
		WatcherHandle::invalid()
	}
}

/// Issue the next `ReadDirectoryChangesW` on the wrapper's buffer.
fn arm(wrapper: &mut HandleWrapper) -> bool {
	let r = unsafe {
		ReadDirectoryChangesW(
			wrapper.dir_handle,
			wrapper.buffer.0.as_mut_ptr().cast(),
			BUFFER_SIZE as u32,
			0,
			NOTIFY_FILTER,
			ptr::null_mut(),
			&mut wrapper.overlapped,
			None,
		)
	};
	r != 0
}

/// Translate one completion's worth of notification records, in order.
fn translate_batch(wrapper: &HandleWrapper, bytes: u32) -> Vec<WatcherEvent> {
	let handle = WatcherHandle(wrapper.dir_handle);
	let mut events = Vec::new();

	if bytes == 0 {
		// Zero-length completion: the OS buffer overflowed and individual
		// records were lost; all we know is that the directory changed.
		warn!("notification buffer overflow for {}", wrapper.path.display());
		events.push(WatcherEvent::on_self(EventType::Change, handle));
		return events;
	}

	// Old-name half of an in-flight rename; the matching new-name record
	// normally follows in the same batch.
	let mut pending_old: Option<PathBuf> = None;
	let mut offset = 0usize;

	loop {
		let info = unsafe {
			&*(wrapper.buffer.0.as_ptr().add(offset) as *const FILE_NOTIFY_INFORMATION)
		};
		let name = unsafe {
			slice::from_raw_parts(info.FileName.as_ptr(), info.FileNameLength as usize / 2)
		};
		let child_path = wrapper.path.join(OsString::from_wide(name));
		trace!("notify action {} for {}", info.Action, child_path.display());

		match info.Action {
			FILE_ACTION_ADDED => {
				flush_pending(&mut events, handle, &mut pending_old);
				push_child(&mut events, EventType::ChildCreate, handle, child_path);
			}
			FILE_ACTION_REMOVED => {
				flush_pending(&mut events, handle, &mut pending_old);
				push_child(&mut events, EventType::ChildDelete, handle, child_path);
			}
			FILE_ACTION_MODIFIED => {
				flush_pending(&mut events, handle, &mut pending_old);
				events.push(WatcherEvent::child(
					EventType::ChildChange,
					handle,
					child_path,
				));
			}
			FILE_ACTION_RENAMED_OLD_NAME => {
				flush_pending(&mut events, handle, &mut pending_old);
				pending_old = Some(child_path);
			}
			FILE_ACTION_RENAMED_NEW_NAME => match pending_old.take() {
				Some(old_path) => {
					events.push(WatcherEvent::child_rename(handle, old_path, child_path));
					events.push(WatcherEvent::on_self(EventType::Change, handle));
				}
				// Orphaned new-name record (old half lost to an earlier
				// overflow): the entry is new from our point of view.
				None => push_child(&mut events, EventType::ChildCreate, handle, child_path),
			},
			_ => {}
		}

		if info.NextEntryOffset == 0 {
			break;
		}
		offset += info.NextEntryOffset as usize;
	}

	flush_pending(&mut events, handle, &mut pending_old);
	events
}

/// Child add/remove/rename also mean the watched directory itself changed.
fn push_child(events: &mut Vec<WatcherEvent>, kind: EventType, handle: WatcherHandle, path: PathBuf) {
	events.push(WatcherEvent::child(kind, handle, path));
	events.push(WatcherEvent::on_self(EventType::Change, handle));
}

/// Orphaned old-name record: the entry left our view, report it deleted.
fn flush_pending(
	events: &mut Vec<WatcherEvent>,
	handle: WatcherHandle,
	pending_old: &mut Option<PathBuf>,
) {
	if let Some(old_path) = pending_old.take() {
		push_child(events, EventType::ChildDelete, handle, old_path);
	}
}
