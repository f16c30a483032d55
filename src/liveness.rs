//! Active-watch ref counting.
//!
//! The bridge's wakeup primitive would otherwise keep the consumer loop (and
//! with it the host process) alive forever, so the count of active watches
//! toggles it: the 0 -> 1 transition marks the bridge keep-alive, the 1 -> 0
//! transition clears it and lets the consumer loop return.

use crate::bridge::EventBridge;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct Liveness {
	active: AtomicUsize,
}

impl Liveness {
	pub(crate) fn new() -> Self {
		Self {
			active: AtomicUsize::new(0),
		}
	}

	pub(crate) fn count(&self) -> usize {
		self.active.load(Ordering::SeqCst)
	}

	pub(crate) fn increment(&self, bridge: &EventBridge) {
		if self.active.fetch_add(1, Ordering::SeqCst) == 0 {
			bridge.set_keep_alive(true);
		}
	}

	pub(crate) fn decrement(&self, bridge: &EventBridge) {
		if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
			bridge.set_keep_alive(false);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn toggles_keep_alive_on_transitions() {
		let bridge = EventBridge::new();
		let liveness = Liveness::new();
		assert!(!bridge.keep_alive());

		liveness.increment(&bridge);
		assert_eq!(liveness.count(), 1);
		assert!(bridge.keep_alive());

		// A second watch does not re-toggle.
		liveness.increment(&bridge);
		assert_eq!(liveness.count(), 2);
		assert!(bridge.keep_alive());

		liveness.decrement(&bridge);
		assert!(bridge.keep_alive());

		liveness.decrement(&bridge);
		assert_eq!(liveness.count(), 0);
		assert!(!bridge.keep_alive());
	}
}
