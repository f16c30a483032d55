//! Normalized watcher events.
//!
//! Every platform backend translates its native notification records into
//! [`WatcherEvent`]s before they cross the thread boundary. Self events apply
//! to the watched entry itself; child events apply to entries inside a
//! watched directory.

use crate::platform::WatcherHandle;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
	/// The watched entry changed (contents, attributes, or a child was
	/// added/removed, reported on the directory itself).
	Change,
	/// The watched entry was deleted or moved away.
	Delete,
	/// The watched entry was renamed.
	Rename,
	/// An entry was created inside a watched directory.
	ChildCreate,
	/// An entry inside a watched directory was modified.
	ChildChange,
	/// An entry inside a watched directory was deleted.
	ChildDelete,
	/// An entry inside a watched directory was renamed.
	ChildRename,
}

impl EventType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Change => "change",
			Self::Delete => "delete",
			Self::Rename => "rename",
			Self::ChildCreate => "child-create",
			Self::ChildChange => "child-change",
			Self::ChildDelete => "child-delete",
			Self::ChildRename => "child-rename",
		}
	}

	pub fn is_rename(self) -> bool {
		matches!(self, Self::Rename | Self::ChildRename)
	}

	pub fn is_child(self) -> bool {
		matches!(
			self,
			Self::ChildCreate | Self::ChildChange | Self::ChildDelete | Self::ChildRename
		)
	}
}

impl fmt::Display for EventType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One normalized file-system event.
///
/// `old_path` is non-empty only for rename-class events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
	pub kind: EventType,
	pub handle: WatcherHandle,
	pub new_path: PathBuf,
	pub old_path: PathBuf,
}

impl WatcherEvent {
	/// Event affecting the watched entry itself.
	pub(crate) fn on_self(kind: EventType, handle: WatcherHandle) -> Self {
		Self {
			kind,
			handle,
			new_path: PathBuf::new(),
			old_path: PathBuf::new(),
		}
	}

	/// Self rename carrying the re-resolved path of the watched entry.
	pub(crate) fn renamed_self(handle: WatcherHandle, new_path: PathBuf) -> Self {
		Self {
			kind: EventType::Rename,
			handle,
			new_path,
			old_path: PathBuf::new(),
		}
	}

	/// Event affecting an entry inside a watched directory.
	pub(crate) fn child(kind: EventType, handle: WatcherHandle, new_path: PathBuf) -> Self {
		Self {
			kind,
			handle,
			new_path,
			old_path: PathBuf::new(),
		}
	}

	/// Paired rename of a child entry.
	pub(crate) fn child_rename(handle: WatcherHandle, old_path: PathBuf, new_path: PathBuf) -> Self {
		Self {
			kind: EventType::ChildRename,
			handle,
			new_path,
			old_path,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn event_type_wire_strings() {
		assert_eq!(EventType::Change.as_str(), "change");
		assert_eq!(EventType::Delete.as_str(), "delete");
		assert_eq!(EventType::Rename.as_str(), "rename");
		assert_eq!(EventType::ChildCreate.as_str(), "child-create");
		assert_eq!(EventType::ChildChange.as_str(), "child-change");
		assert_eq!(EventType::ChildDelete.as_str(), "child-delete");
		assert_eq!(EventType::ChildRename.as_str(), "child-rename");
	}

	#[test]
	fn rename_classification() {
		assert!(EventType::Rename.is_rename());
		assert!(EventType::ChildRename.is_rename());
		assert!(!EventType::Change.is_rename());
		assert!(EventType::ChildDelete.is_child());
		assert!(!EventType::Delete.is_child());
	}
}
