//! End-to-end tests against the real kernel notification source.

#![cfg(unix)]

use std::path::Path;
use std::time::{Duration, Instant};

use pathwatch::{Error, Event, Op, Watcher};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

fn wait_for(watcher: &Watcher, what: &str, want: impl Fn(&Event) -> bool) -> Event {
	let deadline = Instant::now() + WAIT;
	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());
		match watcher.events().recv_timeout(remaining) {
			Ok(event) if want(&event) => return event,
			Ok(other) => {
				// Unrelated event from the same burst; keep looking.
				eprintln!("skipping {other}");
			}
			Err(e) => panic!("timed out waiting for {what}: {e:?}"),
		}
	}
}

fn assert_quiet(watcher: &Watcher, what: &str) {
	match watcher.events().recv_timeout(QUIET) {
		Err(_) => {}
		Ok(event) => panic!("expected no events after {what}, got {event}"),
	}
}

#[test]
fn create_in_watched_dir_is_reported() {
	let dir = tempfile::tempdir().unwrap();
	let watcher = Watcher::new().unwrap();
	watcher.add(dir.path()).unwrap();

	let file = dir.path().join("a");
	std::fs::write(&file, b"hello").unwrap();

	let event = wait_for(&watcher, "create", |e| e.has(Op::CREATE));
	assert_eq!(event.path, file);
}

#[test]
fn write_to_watched_file_is_reported() {
	let dir = tempfile::tempdir().unwrap();
	let file = dir.path().join("a");
	std::fs::write(&file, b"first").unwrap();

	let watcher = Watcher::new().unwrap();
	watcher.add(&file).unwrap();

	std::fs::write(&file, b"second").unwrap();

	let event = wait_for(&watcher, "write", |e| e.has(Op::WRITE));
	assert_eq!(event.path, file);
}

#[test]
fn chmod_is_reported() {
	let dir = tempfile::tempdir().unwrap();
	let file = dir.path().join("a");
	std::fs::write(&file, b"").unwrap();

	let watcher = Watcher::new().unwrap();
	watcher.add(dir.path()).unwrap();

	let mut perms = std::fs::metadata(&file).unwrap().permissions();
	perms.set_readonly(true);
	std::fs::set_permissions(&file, perms).unwrap();

	let event = wait_for(&watcher, "chmod", |e| e.has(Op::CHMOD));
	assert_eq!(event.path, file);
}

#[test]
fn remove_in_watched_dir_is_reported() {
	let dir = tempfile::tempdir().unwrap();
	let file = dir.path().join("a");
	std::fs::write(&file, b"").unwrap();

	let watcher = Watcher::new().unwrap();
	watcher.add(dir.path()).unwrap();

	std::fs::remove_file(&file).unwrap();

	let event = wait_for(&watcher, "remove", |e| e.has(Op::REMOVE));
	assert_eq!(event.path, file);
}

// Backends differ on whether a rename is one paired event or a
// Rename/Create pair, so the assertions go by bitmask, not by count.
#[test]
fn rename_reports_old_and_new_names() {
	let dir = tempfile::tempdir().unwrap();
	let from = dir.path().join("a");
	let to = dir.path().join("b");
	std::fs::write(&from, b"").unwrap();

	let watcher = Watcher::new().unwrap();
	watcher.add(dir.path()).unwrap();

	std::fs::rename(&from, &to).unwrap();

	wait_for(&watcher, "rename-from", |e| e.has(Op::RENAME) && e.path == from);
	wait_for(&watcher, "rename-to", |e| e.has(Op::CREATE) && e.path == to);
}

#[test]
fn recursive_add_covers_new_subdirectories() {
	let dir = tempfile::tempdir().unwrap();
	let watcher = Watcher::new().unwrap();
	watcher.add(dir.path().join("...")).unwrap();

	let sub = dir.path().join("sub");
	std::fs::create_dir(&sub).unwrap();
	let nested = sub.join("x");
	std::fs::write(&nested, b"").unwrap();

	let event = wait_for(&watcher, "dir create", |e| e.has(Op::CREATE) && e.path == sub);
	assert!(event.has(Op::IS_DIR));
	wait_for(&watcher, "nested create", |e| e.has(Op::CREATE) && e.path == nested);
}

#[test]
fn recursive_add_seeds_existing_subdirectories() {
	let dir = tempfile::tempdir().unwrap();
	let sub = dir.path().join("already").join("here");
	std::fs::create_dir_all(&sub).unwrap();

	let watcher = Watcher::new().unwrap();
	watcher.add(dir.path().join("...")).unwrap();

	let nested = sub.join("x");
	std::fs::write(&nested, b"").unwrap();

	wait_for(&watcher, "deep create", |e| e.has(Op::CREATE) && e.path == nested);
}

#[test]
fn removed_root_stops_producing_events() {
	let dir = tempfile::tempdir().unwrap();
	let watcher = Watcher::new().unwrap();
	watcher.add(dir.path()).unwrap();
	watcher.remove(dir.path()).unwrap();

	std::fs::write(dir.path().join("a"), b"").unwrap();
	assert_quiet(&watcher, "remove");
	assert!(watcher.watch_list().is_empty());
}

#[test]
fn remove_of_unknown_path_is_the_sentinel() {
	let watcher = Watcher::new().unwrap();
	assert!(matches!(
		watcher.remove("/tmp/does-not-exist"),
		Err(Error::NonExistentWatch(_)),
	));
}

#[test]
fn add_after_close_is_the_sentinel() {
	let dir = tempfile::tempdir().unwrap();
	let watcher = Watcher::new().unwrap();
	watcher.close();
	assert!(matches!(watcher.add(dir.path()), Err(Error::Closed)));
}

#[test]
fn close_yields_a_finite_prefix_then_end_of_stream() {
	let dir = tempfile::tempdir().unwrap();
	let watcher = Watcher::new().unwrap();
	watcher.add(dir.path()).unwrap();

	std::fs::write(dir.path().join("a"), b"").unwrap();
	// Give the reader a moment to queue the burst, then cut it off.
	std::thread::sleep(Duration::from_millis(200));
	watcher.close();

	// Whatever was queued stays readable; then the stream ends for good.
	while watcher.events().recv().is_ok() {}
	assert!(watcher.events().recv().is_err());
}

#[test]
fn deleted_watch_root_reports_remove_and_unregisters() {
	let parent = tempfile::tempdir().unwrap();
	let target = parent.path().join("goner");
	std::fs::create_dir(&target).unwrap();

	let watcher = Watcher::new().unwrap();
	watcher.add(&target).unwrap();

	std::fs::remove_dir(&target).unwrap();

	let event = wait_for(&watcher, "self remove", |e| e.has(Op::REMOVE));
	assert_eq!(event.path, target);
	// The watch went with the path.
	assert!(matches!(watcher.remove(&target), Err(Error::NonExistentWatch(_))));
}

#[test]
fn exclude_predicate_filters_registration_and_delivery() {
	let dir = tempfile::tempdir().unwrap();
	let watcher = Watcher::recursive_with_exclude(std::sync::Arc::new(|p: &Path| {
		p.extension().map(|e| e == "tmp").unwrap_or(false)
	}))
	.unwrap();
	watcher.add(dir.path()).unwrap();

	std::fs::write(dir.path().join("scratch.tmp"), b"").unwrap();
	std::fs::write(dir.path().join("kept"), b"").unwrap();

	let event = wait_for(&watcher, "unfiltered create", |e| e.has(Op::CREATE));
	assert_eq!(event.path, dir.path().join("kept"));
}

#[test]
fn watch_list_is_a_snapshot_of_roots() {
	let first = tempfile::tempdir().unwrap();
	let second = tempfile::tempdir().unwrap();

	let watcher = Watcher::new().unwrap();
	watcher.add(first.path()).unwrap();
	watcher.add(second.path().join("...")).unwrap();

	let mut roots = watcher.watch_list();
	roots.sort();
	let mut expected = vec![first.path().to_path_buf(), second.path().to_path_buf()];
	expected.sort();
	assert_eq!(roots, expected);
}
