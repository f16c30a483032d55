//! Cross-thread event bridge.
//!
//! A single-slot mailbox between the platform pump thread and the consumer
//! thread. The producer posts one event and blocks until the consumer has
//! finished processing it (fire-and-wait), so the producer can never get more
//! than one event ahead and native ordering is preserved across the thread
//! boundary.
//!
//! State machine per event: `Idle -> EventPosted -> Consumed -> Idle`.

use crate::event::WatcherEvent;
use std::ops::Deref;
use std::sync::{Condvar, Mutex};

struct Slot {
	event: Option<WatcherEvent>,
	/// The last posted event has been fully processed by the consumer.
	acked: bool,
	/// Whether a blocked `recv` should keep waiting when the mailbox is
	/// empty. Cleared at zero active watches so the consumer loop can exit.
	keep_alive: bool,
}

pub(crate) struct EventBridge {
	slot: Mutex<Slot>,
	event_posted: Condvar,
	event_consumed: Condvar,
}

impl EventBridge {
	pub(crate) fn new() -> Self {
		Self {
			slot: Mutex::new(Slot {
				event: None,
				acked: true,
				keep_alive: false,
			}),
			event_posted: Condvar::new(),
			event_consumed: Condvar::new(),
		}
	}

	/// Post one event and block until the consumer acknowledges it.
	///
	/// Called only from the pump thread; there is exactly one producer, so
	/// the slot is always free when this is entered.
	pub(crate) fn post_and_wait(&self, event: WatcherEvent) {
		let mut slot = self.slot.lock().expect("event mailbox poisoned");
		slot.event = Some(event);
		slot.acked = false;
		self.event_posted.notify_one();
		while !slot.acked {
			slot = self
				.event_consumed
				.wait(slot)
				.expect("event mailbox poisoned");
		}
	}

	/// Take the pending event, blocking until one is posted.
	///
	/// Returns `None` when the mailbox is empty and no active watch keeps it
	/// alive. A pending event is always delivered, even after keep-alive has
	/// been cleared.
	pub(crate) fn recv(&self) -> Option<EventGuard<'_>> {
		let mut slot = self.slot.lock().expect("event mailbox poisoned");
		loop {
			if let Some(event) = slot.event.take() {
				return Some(EventGuard {
					bridge: self,
					event,
				});
			}
			if !slot.keep_alive {
				return None;
			}
			slot = self
				.event_posted
				.wait(slot)
				.expect("event mailbox poisoned");
		}
	}

	pub(crate) fn set_keep_alive(&self, keep_alive: bool) {
		let mut slot = self.slot.lock().expect("event mailbox poisoned");
		slot.keep_alive = keep_alive;
		drop(slot);
		if !keep_alive {
			// Wake a consumer blocked on an empty mailbox so it can exit.
			self.event_posted.notify_all();
		}
	}

	#[cfg(test)]
	pub(crate) fn keep_alive(&self) -> bool {
		self.slot.lock().expect("event mailbox poisoned").keep_alive
	}

	fn acknowledge(&self) {
		let mut slot = self.slot.lock().expect("event mailbox poisoned");
		slot.acked = true;
		drop(slot);
		self.event_consumed.notify_one();
	}
}

/// Borrow of one delivered event; releases the producer when dropped.
pub(crate) struct EventGuard<'a> {
	bridge: &'a EventBridge,
	event: WatcherEvent,
}

impl Deref for EventGuard<'_> {
	type Target = WatcherEvent;

	fn deref(&self) -> &WatcherEvent {
		&self.event
	}
}

impl Drop for EventGuard<'_> {
	fn drop(&mut self) {
		self.bridge.acknowledge();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::EventType;
	use crate::platform::WatcherHandle;
	use std::path::PathBuf;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;
	use std::thread;
	use std::time::Duration;

	fn change(n: i32) -> WatcherEvent {
		WatcherEvent {
			kind: EventType::ChildChange,
			handle: WatcherHandle::for_tests(1),
			new_path: PathBuf::from(format!("/tmp/{n}")),
			old_path: PathBuf::new(),
		}
	}

	#[test]
	fn recv_returns_none_without_keep_alive() {
		let bridge = EventBridge::new();
		assert!(bridge.recv().is_none());
	}

	#[test]
	fn pending_event_delivered_after_keep_alive_cleared() {
		let bridge = Arc::new(EventBridge::new());
		bridge.set_keep_alive(true);

		let producer = {
			let bridge = Arc::clone(&bridge);
			thread::spawn(move || bridge.post_and_wait(change(0)))
		};

		// Give the producer time to post, then clear keep-alive.
		thread::sleep(Duration::from_millis(50));
		bridge.set_keep_alive(false);

		let guard = bridge.recv().expect("pending event must still be delivered");
		assert_eq!(guard.new_path, PathBuf::from("/tmp/0"));
		drop(guard);
		producer.join().unwrap();

		assert!(bridge.recv().is_none());
	}

	#[test]
	fn producer_blocks_until_consumer_acknowledges() {
		let bridge = Arc::new(EventBridge::new());
		bridge.set_keep_alive(true);
		let posted = Arc::new(AtomicUsize::new(0));

		let producer = {
			let bridge = Arc::clone(&bridge);
			let posted = Arc::clone(&posted);
			thread::spawn(move || {
				for n in 0..2 {
					bridge.post_and_wait(change(n));
					posted.fetch_add(1, Ordering::SeqCst);
				}
			})
		};

		let first = loop {
			match bridge.recv() {
				Some(guard) => break guard,
				None => unreachable!("keep-alive is set"),
			}
		};
		thread::sleep(Duration::from_millis(50));
		// The first post has not returned while its event is unacknowledged.
		assert_eq!(posted.load(Ordering::SeqCst), 0);
		drop(first);

		let second = bridge.recv().expect("second event");
		assert_eq!(second.new_path, PathBuf::from("/tmp/1"));
		drop(second);

		producer.join().unwrap();
		assert_eq!(posted.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn events_arrive_in_post_order() {
		let bridge = Arc::new(EventBridge::new());
		bridge.set_keep_alive(true);

		let producer = {
			let bridge = Arc::clone(&bridge);
			thread::spawn(move || {
				for n in 0..32 {
					bridge.post_and_wait(change(n));
				}
				bridge.set_keep_alive(false);
			})
		};

		let mut seen = Vec::new();
		while let Some(guard) = bridge.recv() {
			seen.push(guard.new_path.clone());
		}
		producer.join().unwrap();

		let expected: Vec<_> = (0..32).map(|n| PathBuf::from(format!("/tmp/{n}"))).collect();
		assert_eq!(seen, expected);
	}
}
