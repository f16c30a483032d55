//! Cross-platform file-system change notification engine.
//!
//! Watches directories and files with the native OS facility (inotify on
//! Linux, kqueue on the BSDs and macOS, `ReadDirectoryChangesW` over an I/O
//! completion port on Windows) and delivers normalized [`WatcherEvent`]s to a
//! single consumer, in the exact order the OS produced them.
//!
//! Two threads are involved: a dedicated pump thread spawned by
//! [`PathWatcher::new`] that blocks in the platform's wait primitive, and the
//! consumer thread that calls [`PathWatcher::dispatch`]. Events cross that
//! boundary through a single-slot mailbox with fire-and-wait back-pressure,
//! so the pump can never run ahead of the consumer.
//!
//! ```no_run
//! use pathwatcher::PathWatcher;
//!
//! let watcher = PathWatcher::new();
//! watcher.set_callback(|event| {
//! 	println!("{} {}", event.kind, event.new_path.display());
//! });
//! let handle = watcher.watch("/tmp/some-dir")?;
//! // ... on the consumer thread:
//! // watcher.dispatch();
//! watcher.unwatch(handle)?;
//! # Ok::<(), pathwatcher::Error>(())
//! ```
//!
//! Watching is not recursive: each directory must be watched explicitly.
//! Events are not batched or debounced; every native record is delivered
//! individually.

mod bridge;
mod error;
mod event;
mod liveness;
mod platform;
mod registry;

pub use error::{Error, Result};
pub use event::{EventType, WatcherEvent};
pub use platform::{RawWatcherHandle, WatcherHandle};
pub use registry::HandleRegistry;

use bridge::EventBridge;
use liveness::Liveness;
use platform::Backend;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error};

/// The single process-wide event callback; replaced wholesale by
/// [`PathWatcher::set_callback`].
pub type EventCallback = Box<dyn FnMut(&WatcherEvent) + Send>;

struct Inner {
	backend: Backend,
	bridge: EventBridge,
	liveness: Liveness,
	callback: Mutex<Option<EventCallback>>,
}

/// A watcher engine instance: one platform backend, one pump thread, one
/// consumer-visible event stream.
///
/// Cloning is cheap and shares the same engine. The pump thread lives for
/// the rest of the process; at zero active watches it sits blocked in the OS
/// wait call and does not prevent process exit.
#[derive(Clone)]
pub struct PathWatcher {
	inner: Arc<Inner>,
}

impl PathWatcher {
	/// Initialize the platform backend and spawn the pump thread.
	///
	/// Backend initialization failure is not reported here; it surfaces as
	/// [`Error::InitFailure`] from every subsequent [`watch`](Self::watch).
	pub fn new() -> Self {
		let inner = Arc::new(Inner {
			backend: Backend::init(),
			bridge: EventBridge::new(),
			liveness: Liveness::new(),
			callback: Mutex::new(None),
		});

		let pump = Arc::clone(&inner);
		let spawned = thread::Builder::new()
			.name("pathwatcher-pump".to_string())
			.spawn(move || {
				pump.backend.pump(&pump.bridge);
				debug!("pump thread stopped");
			});
		if let Err(e) = spawned {
			// Watches can still be registered, but no events will ever flow.
			error!("failed to spawn pump thread: {e}");
		}

		Self { inner }
	}

	/// Register the event callback, replacing any previous one.
	pub fn set_callback(&self, callback: impl FnMut(&WatcherEvent) + Send + 'static) {
		*self.inner.callback.lock().expect("callback poisoned") = Some(Box::new(callback));
	}

	/// Start watching `path` for changes.
	///
	/// The path must exist; on Windows it must be a directory. On success
	/// the active-watch count is incremented.
	pub fn watch(&self, path: impl AsRef<Path>) -> Result<WatcherHandle> {
		if let Some(errno) = self.inner.backend.init_error() {
			return Err(Error::InitFailure(errno));
		}

		let handle = self.inner.backend.watch(path.as_ref());
		if !handle.is_valid() {
			return Err(Error::WatchFailed {
				errno: self.inner.backend.invalid_to_error_number(handle),
			});
		}

		self.inner.liveness.increment(&self.inner.bridge);
		Ok(handle)
	}

	/// Stop watching `handle` and release its OS resource.
	///
	/// No further events are delivered for the handle; an event already in
	/// flight is still delivered. Unwatching a handle that is not live is
	/// [`Error::InvalidArgument`].
	pub fn unwatch(&self, handle: WatcherHandle) -> Result<()> {
		if !handle.is_valid() {
			return Err(Error::InvalidArgument);
		}
		if !self.inner.backend.unwatch(handle) {
			return Err(Error::InvalidArgument);
		}
		self.inner.liveness.decrement(&self.inner.bridge);
		Ok(())
	}

	/// Number of currently active watches.
	pub fn active_watches(&self) -> usize {
		self.inner.liveness.count()
	}

	/// Run the consumer loop on the calling thread.
	///
	/// Each iteration receives one event from the pump thread, invokes the
	/// registered callback synchronously, then releases the pump to process
	/// the next native record. Returns once there are no active watches and
	/// no pending event, so the host process can exit naturally.
	pub fn dispatch(&self) {
		while let Some(event) = self.inner.bridge.recv() {
			// The callback is taken out of its slot for the invocation so it
			// may itself call `set_callback` without deadlocking; it is put
			// back only if no replacement was installed meanwhile.
			let callback = self.inner.callback.lock().expect("callback poisoned").take();
			if let Some(mut callback) = callback {
				callback(&event);
				let mut slot = self.inner.callback.lock().expect("callback poisoned");
				if slot.is_none() {
					*slot = Some(callback);
				}
			}
		}
	}
}

impl Default for PathWatcher {
	fn default() -> Self {
		Self::new()
	}
}
