//! kqueue backend (macOS, iOS, the BSDs).
//!
//! Each watch opens its target with `O_EVTONLY` and registers the descriptor
//! with a shared kqueue for `EVFILT_VNODE` events; the file descriptor is the
//! watcher handle. kqueue only reports events for the watched entry itself,
//! never for directory children.
//!
//! kqueue does not report the new name of a renamed entry, so `NOTE_RENAME`
//! re-resolves the current path of the still-open descriptor with
//! `fcntl(F_GETPATH)` before closing it. The handle itself stays live until
//! the consumer unwatches it.

use crate::bridge::EventBridge;
use crate::event::{EventType, WatcherEvent};
use crate::platform::WatcherHandle;
use std::collections::HashMap;
use std::ffi::{CString, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Mutex;
use tracing::{error, trace};

// Descriptor event notification without inhibiting unmounts; only Darwin
// has it, the BSDs fall back to a plain read descriptor.
#[cfg(any(target_os = "macos", target_os = "ios"))]
const OPEN_FLAGS: libc::c_int = libc::O_EVTONLY;
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const OPEN_FLAGS: libc::c_int = libc::O_RDONLY;

#[cfg(any(target_os = "macos", target_os = "ios"))]
const F_GETPATH: libc::c_int = libc::F_GETPATH;
// Not exposed by libc on the BSDs; value as defined by the XNU headers.
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const F_GETPATH: libc::c_int = 50;

const VNODE_FFLAGS: u32 =
	libc::NOTE_WRITE | libc::NOTE_DELETE | libc::NOTE_RENAME | libc::NOTE_ATTRIB;

struct WatchState {
	/// The pump already closed the descriptor (self rename); `unwatch` then
	/// only forgets the entry instead of closing again.
	dead: bool,
}

pub(crate) struct Backend {
	kq: libc::c_int,
	init_errno: i32,
	/// Live watch descriptors, for unwatch validation and for dropping
	/// events that race an unwatch.
	watched: Mutex<HashMap<i32, WatchState>>,
}

fn last_errno() -> i32 {
	io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

impl Backend {
	pub(crate) fn init() -> Self {
		let kq = unsafe { libc::kqueue() };
		let init_errno = if kq == -1 {
			let errno = last_errno();
			error!("kqueue() failed: os error {errno}");
			errno
		} else {
			0
		};
		Self {
			kq,
			init_errno,
			watched: Mutex::new(HashMap::new()),
		}
	}

	pub(crate) fn init_error(&self) -> Option<i32> {
		(self.kq == -1).then_some(self.init_errno)
	}

	pub(crate) fn watch(&self, path: &Path) -> WatcherHandle {
		if self.kq == -1 {
			return WatcherHandle::from_errno(self.init_errno);
		}

		let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
			return WatcherHandle::from_errno(libc::EINVAL);
		};

		let fd = unsafe { libc::open(c_path.as_ptr(), OPEN_FLAGS) };
		if fd < 0 {
			return WatcherHandle::from_errno(last_errno());
		}

		let mut event: libc::kevent = unsafe { std::mem::zeroed() };
		event.ident = fd as _;
		event.filter = libc::EVFILT_VNODE as _;
		event.flags = (libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR) as _;
		event.fflags = VNODE_FFLAGS as _;

		let timeout = libc::timespec {
			tv_sec: 0,
			tv_nsec: 0,
		};
		let r = unsafe { libc::kevent(self.kq, &event, 1, ptr::null_mut(), 0, &timeout) };
		if r == -1 {
			let errno = last_errno();
			unsafe { libc::close(fd) };
			return WatcherHandle::from_errno(errno);
		}

		trace!("watching {} (fd {fd})", path.display());
		self.watched
			.lock()
			.expect("watch set poisoned")
			.insert(fd, WatchState { dead: false });
		WatcherHandle(fd)
	}

	pub(crate) fn unwatch(&self, handle: WatcherHandle) -> bool {
		let Some(state) = self
			.watched
			.lock()
			.expect("watch set poisoned")
			.remove(&handle.0)
		else {
			return false;
		};
		trace!("unwatching fd {}", handle.0);
		if state.dead {
			// The pump already closed the descriptor on self rename.
			return true;
		}
		// Closing the descriptor deletes its knote from the kqueue.
		unsafe { libc::close(handle.0) };
		true
	}

	pub(crate) fn invalid_to_error_number(&self, handle: WatcherHandle) -> i32 {
		-handle.0
	}

	pub(crate) fn pump(&self, bridge: &EventBridge) {
		if self.kq == -1 {
			return;
		}

		loop {
			let mut event: libc::kevent = unsafe { std::mem::zeroed() };
			let r = unsafe { libc::kevent(self.kq, ptr::null(), 0, &mut event, 1, ptr::null()) };
			if r == -1 {
				if last_errno() == libc::EINTR {
					continue;
				}
				error!("kevent wait failed, stopping pump: os error {}", last_errno());
				return;
			}
			if r == 0 {
				continue;
			}

			let fd = event.ident as i32;
			let handle = WatcherHandle(fd);
			let fflags = event.fflags;
			trace!("kqueue event fflags {fflags:#x} for fd {fd}");

			// One locked section covers the liveness check and every use of
			// the descriptor, so a concurrent unwatch cannot close it between
			// the check and the use. Posting happens with the lock released.
			let to_post = {
				let mut watched = self.watched.lock().expect("watch set poisoned");
				match watched.get_mut(&fd) {
					// Unwatched (or already dead) while the event was queued.
					None => continue,
					Some(state) if state.dead => continue,
					Some(state) => {
						if fflags & libc::NOTE_WRITE != 0 {
							Some(WatcherEvent::on_self(EventType::Change, handle))
						} else if fflags & libc::NOTE_DELETE != 0 {
							Some(WatcherEvent::on_self(EventType::Delete, handle))
						} else if fflags & libc::NOTE_RENAME != 0 {
							let new_path = resolve_fd_path(fd);
							// The descriptor tracks the entry under its old
							// identity; the OS side of the watch ends here,
							// but the handle stays live until the consumer
							// unwatches it.
							unsafe { libc::close(fd) };
							state.dead = true;
							Some(WatcherEvent::renamed_self(handle, new_path))
						} else if fflags & libc::NOTE_ATTRIB != 0
							&& unsafe { libc::lseek(fd, 0, libc::SEEK_END) } == 0
						{
							// Truncation to empty does not raise NOTE_WRITE.
							Some(WatcherEvent::on_self(EventType::Change, handle))
						} else {
							None
						}
					}
				}
			};

			if let Some(event) = to_post {
				bridge.post_and_wait(event);
			}
		}
	}
}

/// Current path of an open descriptor, empty if it cannot be resolved.
fn resolve_fd_path(fd: i32) -> PathBuf {
	let mut buffer = [0u8; libc::PATH_MAX as usize];
	let r = unsafe { libc::fcntl(fd, F_GETPATH, buffer.as_mut_ptr()) };
	if r == -1 {
		return PathBuf::new();
	}
	let len = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
	PathBuf::from(OsString::from_vec(buffer[..len].to_vec()))
}
