//! Platform watch backends.
//!
//! One backend is compiled per target, behind the same contract:
//! `init` acquires the OS multiplexing resource, `watch`/`unwatch` manage
//! individual watches, and `pump` runs forever on a dedicated thread,
//! blocking in the native wait primitive and posting normalized events
//! through the [`EventBridge`](crate::bridge::EventBridge).
//!
//! `watch` never fails by panicking or returning a `Result`; failure is
//! encoded into the returned handle (negative errno on POSIX, the invalid
//! handle sentinel on Windows) and recovered with `invalid_to_error_number`.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use linux::Backend;

#[cfg(any(
	target_os = "macos",
	target_os = "ios",
	target_os = "freebsd",
	target_os = "openbsd",
	target_os = "netbsd",
	target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
	target_os = "macos",
	target_os = "ios",
	target_os = "freebsd",
	target_os = "openbsd",
	target_os = "netbsd",
	target_os = "dragonfly"
))]
pub(crate) use kqueue::Backend;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::Backend;

/// Raw OS value backing a [`WatcherHandle`].
///
/// POSIX: an inotify watch descriptor or a kqueue file descriptor. Windows:
/// a native directory `HANDLE` value.
#[cfg(unix)]
pub type RawWatcherHandle = i32;
#[cfg(windows)]
pub type RawWatcherHandle = isize;

#[cfg(windows)]
const INVALID_HANDLE_VALUE: RawWatcherHandle = -1;

/// Opaque identifier for one active watch.
///
/// Valid from the moment `watch()` returns success until `unwatch()`; never
/// reused for two simultaneously live watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatcherHandle(pub(crate) RawWatcherHandle);

impl WatcherHandle {
	pub fn raw(self) -> RawWatcherHandle {
		self.0
	}

	/// Pure validity check; does not consult the backend.
	pub fn is_valid(self) -> bool {
		#[cfg(unix)]
		{
			self.0 >= 0
		}
		#[cfg(windows)]
		{
			self.0 != INVALID_HANDLE_VALUE
		}
	}

	/// Failed-watch handle carrying the OS error number.
	#[cfg(unix)]
	pub(crate) fn from_errno(errno: i32) -> Self {
		Self(-errno)
	}

	#[cfg(windows)]
	pub(crate) fn invalid() -> Self {
		Self(INVALID_HANDLE_VALUE)
	}

	#[cfg(test)]
	pub(crate) fn for_tests(raw: i32) -> Self {
		Self(raw as RawWatcherHandle)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[cfg(unix)]
	#[test]
	fn negative_handles_are_invalid() {
		assert!(WatcherHandle::for_tests(0).is_valid());
		assert!(WatcherHandle::for_tests(5).is_valid());
		assert!(!WatcherHandle::for_tests(-2).is_valid());
		assert_eq!(WatcherHandle::from_errno(2).raw(), -2);
	}

	#[cfg(windows)]
	#[test]
	fn sentinel_handle_is_invalid() {
		assert!(WatcherHandle::for_tests(0).is_valid());
		assert!(!WatcherHandle::invalid().is_valid());
	}
}
