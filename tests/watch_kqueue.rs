//! End-to-end tests against the real kqueue backend.

#![cfg(any(
	target_os = "macos",
	target_os = "ios",
	target_os = "freebsd",
	target_os = "openbsd",
	target_os = "netbsd",
	target_os = "dragonfly"
))]

use pathwatcher::{EventType, PathWatcher, WatcherHandle};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

type Delivered = (EventType, WatcherHandle, PathBuf, PathBuf);

fn watcher_with_events() -> (PathWatcher, Receiver<Delivered>) {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();

	let watcher = PathWatcher::new();
	let (tx, rx) = mpsc::channel();
	watcher.set_callback(move |event| {
		let _ = tx.send((
			event.kind,
			event.handle,
			event.new_path.clone(),
			event.old_path.clone(),
		));
	});
	(watcher, rx)
}

/// The dispatch loop must only start once a watch holds it alive.
fn spawn_dispatch(watcher: &PathWatcher) -> JoinHandle<()> {
	let watcher = watcher.clone();
	thread::spawn(move || watcher.dispatch())
}

fn next_event(rx: &Receiver<Delivered>) -> Delivered {
	rx.recv_timeout(EVENT_TIMEOUT).expect("timed out waiting for event")
}

#[test]
fn write_to_watched_file_is_a_change() {
	let dir = tempfile::tempdir().unwrap();
	let target = dir.path().join("log");
	File::create(&target).unwrap();

	let (watcher, rx) = watcher_with_events();
	let handle = watcher.watch(&target).unwrap();
	let dispatcher = spawn_dispatch(&watcher);

	let mut file = File::options().append(true).open(&target).unwrap();
	file.write_all(b"entry").unwrap();
	drop(file);

	let (kind, event_handle, ..) = next_event(&rx);
	assert_eq!(kind, EventType::Change);
	assert_eq!(event_handle, handle);

	watcher.unwatch(handle).unwrap();
	dispatcher.join().unwrap();
}

#[test]
fn self_rename_still_unwatches_and_restores_the_count() {
	let dir = tempfile::tempdir().unwrap();
	let before = dir.path().join("a");
	let after = dir.path().join("b");
	File::create(&before).unwrap();

	let (watcher, rx) = watcher_with_events();
	let handle = watcher.watch(&before).unwrap();
	assert_eq!(watcher.active_watches(), 1);
	let dispatcher = spawn_dispatch(&watcher);

	fs::rename(&before, &after).unwrap();

	let (kind, event_handle, new_path, _) = next_event(&rx);
	assert_eq!(kind, EventType::Rename);
	assert_eq!(event_handle, handle);
	// The re-resolved path is canonical; the temp dir may sit behind a
	// symlink.
	assert_eq!(new_path, after.canonicalize().unwrap());

	// The pump already released the OS side of the watch; the handle must
	// still unwatch cleanly so the count returns to zero and the consumer
	// loop can exit.
	watcher.unwatch(handle).unwrap();
	assert_eq!(watcher.active_watches(), 0);
	dispatcher.join().unwrap();

	// The handle is no longer live; a second unwatch is a caller error.
	assert!(watcher.unwatch(handle).is_err());
}

#[test]
fn self_delete_then_unwatch() {
	let dir = tempfile::tempdir().unwrap();
	let target = dir.path().join("gone");
	File::create(&target).unwrap();

	let (watcher, rx) = watcher_with_events();
	let handle = watcher.watch(&target).unwrap();
	let dispatcher = spawn_dispatch(&watcher);

	fs::remove_file(&target).unwrap();

	let (kind, event_handle, ..) = next_event(&rx);
	assert_eq!(kind, EventType::Delete);
	assert_eq!(event_handle, handle);

	watcher.unwatch(handle).unwrap();
	assert_eq!(watcher.active_watches(), 0);
	dispatcher.join().unwrap();
}

#[test]
fn rename_does_not_disturb_a_later_watch() {
	let dir = tempfile::tempdir().unwrap();
	let first = dir.path().join("a");
	let second = dir.path().join("s");
	File::create(&first).unwrap();
	File::create(&second).unwrap();

	let (watcher, rx) = watcher_with_events();
	let first_handle = watcher.watch(&first).unwrap();
	let dispatcher = spawn_dispatch(&watcher);

	fs::rename(&first, dir.path().join("a-moved")).unwrap();
	let (kind, ..) = next_event(&rx);
	assert_eq!(kind, EventType::Rename);
	watcher.unwatch(first_handle).unwrap();

	// The new watch may reuse the descriptor number the rename released;
	// it must be fully live regardless.
	let second_handle = watcher.watch(&second).unwrap();

	let mut file = File::options().append(true).open(&second).unwrap();
	file.write_all(b"x").unwrap();
	drop(file);

	let (kind, event_handle, ..) = next_event(&rx);
	assert_eq!(kind, EventType::Change);
	assert_eq!(event_handle, second_handle);

	watcher.unwatch(second_handle).unwrap();
	assert_eq!(watcher.active_watches(), 0);
	dispatcher.join().unwrap();
}
