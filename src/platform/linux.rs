//! inotify backend (Linux, Android).
//!
//! One inotify instance multiplexes every watch; the pump thread blocks in a
//! `read` on the inotify descriptor. The kernel reports only a watch
//! descriptor and a child filename, so the backend keeps its own
//! descriptor-to-base-path table (populated at `watch` time) to reconstruct
//! full child paths.
//!
//! Rename pairing: `IN_MOVED_FROM` is cached and paired with the following
//! `IN_MOVED_TO` carrying the same cookie, producing a single child-rename
//! event with both paths. An orphaned `IN_MOVED_FROM` (the entry left the
//! watched directory) degrades to a child-delete, an orphaned `IN_MOVED_TO`
//! (the entry arrived from elsewhere) to a child-create.

use crate::bridge::EventBridge;
use crate::event::{EventType, WatcherEvent};
use crate::platform::WatcherHandle;
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, trace, warn};

/// Large enough for `sizeof(inotify_event)` plus a filename, several times
/// over.
const EVENT_BUFFER_SIZE: usize = 4096;

fn watch_mask() -> WatchMask {
	WatchMask::ATTRIB
		| WatchMask::CREATE
		| WatchMask::DELETE
		| WatchMask::MODIFY
		| WatchMask::MOVE
		| WatchMask::MOVE_SELF
		| WatchMask::DELETE_SELF
}

struct WatchEntry {
	wd: WatchDescriptor,
	base_path: PathBuf,
}

struct State {
	/// Registration handle; usable while the pump owns the `Inotify` itself.
	watches: Mutex<Watches>,
	/// Taken once by the pump thread.
	inotify: Mutex<Option<Inotify>>,
	/// Watch descriptor id -> entry, for child path reconstruction and
	/// unwatch validation.
	table: Mutex<HashMap<i32, WatchEntry>>,
}

pub(crate) struct Backend {
	state: Option<State>,
	init_errno: i32,
}

fn errno_of(e: &io::Error) -> i32 {
	e.raw_os_error().unwrap_or(libc::EIO)
}

impl Backend {
	pub(crate) fn init() -> Self {
		match Inotify::init() {
			Ok(inotify) => {
				let watches = inotify.watches();
				Self {
					state: Some(State {
						watches: Mutex::new(watches),
						inotify: Mutex::new(Some(inotify)),
						table: Mutex::new(HashMap::new()),
					}),
					init_errno: 0,
				}
			}
			Err(e) => {
				error!("inotify_init failed: {e}");
				Self {
					state: None,
					init_errno: errno_of(&e),
				}
			}
		}
	}

	pub(crate) fn init_error(&self) -> Option<i32> {
		self.state.is_none().then_some(self.init_errno)
	}

	pub(crate) fn watch(&self, path: &Path) -> WatcherHandle {
		let Some(state) = &self.state else {
			return WatcherHandle::from_errno(self.init_errno);
		};

		let wd = match state
			.watches
			.lock()
			.expect("watch table poisoned")
			.add(path, watch_mask())
		{
			Ok(wd) => wd,
			Err(e) => return WatcherHandle::from_errno(errno_of(&e)),
		};

		let id = wd.get_watch_descriptor_id();
		trace!("watching {} (wd {id})", path.display());
		state.table.lock().expect("watch table poisoned").insert(
			id,
			WatchEntry {
				wd,
				base_path: path.to_path_buf(),
			},
		);
		WatcherHandle(id)
	}

	pub(crate) fn unwatch(&self, handle: WatcherHandle) -> bool {
		let Some(state) = &self.state else {
			return false;
		};

		let Some(entry) = state
			.table
			.lock()
			.expect("watch table poisoned")
			.remove(&handle.0)
		else {
			return false;
		};

		trace!("unwatching {} (wd {})", entry.base_path.display(), handle.0);
		// EINVAL here means the kernel already dropped the watch (the
		// watched entry was deleted); the handle was still live for us.
		if let Err(e) = state
			.watches
			.lock()
			.expect("watch table poisoned")
			.remove(entry.wd)
		{
			trace!("inotify_rm_watch on wd {}: {e}", handle.0);
		}
		true
	}

	pub(crate) fn invalid_to_error_number(&self, handle: WatcherHandle) -> i32 {
		-handle.0
	}

	pub(crate) fn pump(&self, bridge: &EventBridge) {
		let Some(state) = &self.state else {
			return;
		};
		let Some(mut inotify) = state
			.inotify
			.lock()
			.expect("watch table poisoned")
			.take()
		else {
			return;
		};

		let mut buffer = [0u8; EVENT_BUFFER_SIZE];
		// Cached IN_MOVED_FROM half of a rename: (cookie, handle, old path).
		let mut pending_rename: Option<(u32, WatcherHandle, PathBuf)> = None;

		loop {
			let events = match inotify.read_events_blocking(&mut buffer) {
				Ok(events) => events,
				Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => {
					error!("inotify read failed, stopping pump: {e}");
					return;
				}
			};

			for event in events {
				let mask = event.mask;
				if mask.contains(EventMask::Q_OVERFLOW) {
					warn!("inotify event queue overflowed");
					flush_pending(bridge, &mut pending_rename);
					continue;
				}
				if mask.contains(EventMask::IGNORED) {
					continue;
				}

				let id = event.wd.get_watch_descriptor_id();
				let base_path = {
					let table = state.table.lock().expect("watch table poisoned");
					match table.get(&id) {
						Some(entry) => entry.base_path.clone(),
						// Unwatched while the event was queued.
						None => continue,
					}
				};
				let handle = WatcherHandle(id);

				match event.name {
					Some(name) => {
						let child_path = base_path.join(name);
						trace!("inotify child event {mask:?} for {}", child_path.display());

						if mask.contains(EventMask::MOVED_FROM) {
							flush_pending(bridge, &mut pending_rename);
							pending_rename = Some((event.cookie, handle, child_path));
						} else if mask.contains(EventMask::MOVED_TO) {
							match pending_rename.take() {
								Some((cookie, from_handle, old_path))
									if cookie == event.cookie && from_handle == handle =>
								{
									bridge.post_and_wait(WatcherEvent::child_rename(
										handle, old_path, child_path,
									));
									bridge.post_and_wait(WatcherEvent::on_self(
										EventType::Change,
										handle,
									));
								}
								stale => {
									// The halves belong to different watches
									// or the old name never arrived; degrade
									// to delete + create.
									pending_rename = stale;
									flush_pending(bridge, &mut pending_rename);
									post_child(bridge, EventType::ChildCreate, handle, child_path);
								}
							}
						} else if mask.contains(EventMask::CREATE) {
							flush_pending(bridge, &mut pending_rename);
							post_child(bridge, EventType::ChildCreate, handle, child_path);
						} else if mask.contains(EventMask::DELETE) {
							flush_pending(bridge, &mut pending_rename);
							post_child(bridge, EventType::ChildDelete, handle, child_path);
						} else if mask.intersects(EventMask::MODIFY | EventMask::ATTRIB) {
							flush_pending(bridge, &mut pending_rename);
							bridge.post_and_wait(WatcherEvent::child(
								EventType::ChildChange,
								handle,
								child_path,
							));
						}
					}
					None => {
						flush_pending(bridge, &mut pending_rename);
						if mask.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF) {
							// inotify does not report where the entry moved
							// to, so a self move is treated as a delete.
							bridge.post_and_wait(WatcherEvent::on_self(EventType::Delete, handle));
						} else if mask.intersects(EventMask::MODIFY | EventMask::ATTRIB) {
							bridge.post_and_wait(WatcherEvent::on_self(EventType::Change, handle));
						}
					}
				}
			}

			// A rename whose second half never arrived in this batch.
			flush_pending(bridge, &mut pending_rename);
		}
	}
}

/// Child create/delete/rename also mean the watched directory itself changed.
fn post_child(bridge: &EventBridge, kind: EventType, handle: WatcherHandle, path: PathBuf) {
	bridge.post_and_wait(WatcherEvent::child(kind, handle, path));
	bridge.post_and_wait(WatcherEvent::on_self(EventType::Change, handle));
}

fn flush_pending(bridge: &EventBridge, pending: &mut Option<(u32, WatcherHandle, PathBuf)>) {
	if let Some((_, handle, old_path)) = pending.take() {
		post_child(bridge, EventType::ChildDelete, handle, old_path);
	}
}
