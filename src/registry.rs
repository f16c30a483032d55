//! Handle registry.
//!
//! An exclusive-ownership map from [`WatcherHandle`] to an arbitrary
//! consumer-owned value, used by the embedding layer to attach per-watch
//! metadata. Consumer-thread-only by design; the pump thread never touches
//! it.

use crate::error::{Error, Result};
use crate::platform::WatcherHandle;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct HandleRegistry<V> {
	entries: BTreeMap<WatcherHandle, V>,
}

impl<V> HandleRegistry<V> {
	pub fn new() -> Self {
		Self {
			entries: BTreeMap::new(),
		}
	}

	/// Store `value` under `handle`.
	///
	/// Fails with [`Error::DuplicateKey`] if the handle is already present.
	pub fn add(&mut self, handle: WatcherHandle, value: V) -> Result<()> {
		if self.entries.contains_key(&handle) {
			return Err(Error::DuplicateKey);
		}
		self.entries.insert(handle, value);
		Ok(())
	}

	/// Fails with [`Error::InvalidKey`] if the handle is absent.
	pub fn get(&self, handle: WatcherHandle) -> Result<&V> {
		self.entries.get(&handle).ok_or(Error::InvalidKey)
	}

	pub fn has(&self, handle: WatcherHandle) -> bool {
		self.entries.contains_key(&handle)
	}

	/// Snapshot of all stored values, in ascending handle order.
	pub fn values(&self) -> Vec<&V> {
		self.entries.values().collect()
	}

	/// Release the value stored under `handle` to the caller.
	///
	/// Fails with [`Error::InvalidKey`] if the handle is absent.
	pub fn remove(&mut self, handle: WatcherHandle) -> Result<V> {
		self.entries.remove(&handle).ok_or(Error::InvalidKey)
	}

	/// Drop every stored value.
	pub fn clear(&mut self) {
		self.entries.clear();
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn handle(raw: i32) -> WatcherHandle {
		WatcherHandle::for_tests(raw)
	}

	#[test]
	fn round_trip() {
		let mut registry = HandleRegistry::new();
		registry.add(handle(1), "first").unwrap();

		assert_eq!(*registry.get(handle(1)).unwrap(), "first");
		assert!(registry.has(handle(1)));

		assert_eq!(registry.remove(handle(1)).unwrap(), "first");
		assert!(!registry.has(handle(1)));
	}

	#[test]
	fn add_on_existing_key_is_duplicate() {
		let mut registry = HandleRegistry::new();
		registry.add(handle(7), 1).unwrap();
		assert!(matches!(
			registry.add(handle(7), 2),
			Err(Error::DuplicateKey)
		));
		// The original value is untouched.
		assert_eq!(*registry.get(handle(7)).unwrap(), 1);
	}

	#[test]
	fn missing_key_is_invalid() {
		let mut registry = HandleRegistry::<u32>::new();
		assert!(matches!(registry.get(handle(3)), Err(Error::InvalidKey)));
		assert!(matches!(registry.remove(handle(3)), Err(Error::InvalidKey)));
		assert!(!registry.has(handle(3)));
	}

	#[test]
	fn values_iterate_in_handle_order() {
		let mut registry = HandleRegistry::new();
		registry.add(handle(30), "c").unwrap();
		registry.add(handle(10), "a").unwrap();
		registry.add(handle(20), "b").unwrap();

		assert_eq!(registry.values(), vec![&"a", &"b", &"c"]);
	}

	#[test]
	fn clear_empties_the_registry() {
		let mut registry = HandleRegistry::new();
		registry.add(handle(1), ()).unwrap();
		registry.add(handle(2), ()).unwrap();

		registry.clear();
		assert!(registry.is_empty());
		assert!(!registry.has(handle(1)));
	}
}
