//! End-to-end scenarios against a real temporary directory: filesystem
//! mutations on one side, delivered batches on the other.
//!
//! Timing-tolerant by construction — events may land in the same or the next
//! delivery window, so every expectation is a poll with a deadline rather
//! than an exact batch count.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use treewatch::{Event, EventKind, TreeWatcher, WatchConfig};

type Batch = Vec<(EventKind, PathBuf)>;
type Batches = Arc<Mutex<Vec<Batch>>>;

const DEADLINE: Duration = Duration::from_secs(5);

fn start(root: &Path, latency: Duration, send_init_events: bool) -> (TreeWatcher, Batches) {
    let batches: Batches = Arc::default();
    let sink = batches.clone();
    let watcher = TreeWatcher::new(
        WatchConfig::new(root)
            .latency(latency)
            .send_init_events(send_init_events),
        move |batch: &[Event]| {
            sink.lock()
                .unwrap()
                .push(batch.iter().map(|e| (e.kind, e.path.clone())).collect());
        },
    );
    (watcher, batches)
}

fn wait_until(batches: &Batches, description: &str, pred: impl Fn(&[Batch]) -> bool) {
    let deadline = Instant::now() + DEADLINE;
    loop {
        if pred(&batches.lock().unwrap()) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {description}; saw {:?}",
            batches.lock().unwrap()
        );
        thread::sleep(Duration::from_millis(5));
    }
}

fn has_event(batches: &[Batch], bit: EventKind, path: &str) -> bool {
    batches
        .iter()
        .flatten()
        .any(|(kind, p)| kind.contains(bit) && p == Path::new(path))
}

fn has_failure(batches: &[Batch], message: &str) -> bool {
    batches
        .iter()
        .flatten()
        .any(|(kind, p)| kind.is_failed() && p == Path::new(message))
}

#[test]
fn creating_a_file_reports_created() {
    let tmp = tempfile::tempdir().unwrap();
    let (_watcher, batches) = start(tmp.path(), Duration::from_millis(10), false);

    fs::File::create(tmp.path().join("a.txt")).unwrap();

    wait_until(&batches, "created event for a.txt", |batches| {
        has_event(batches, EventKind::CREATED, "a.txt")
    });
}

#[test]
fn rapid_writes_collapse_into_changed() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("a.txt"), "seed").unwrap();
    let (_watcher, batches) = start(tmp.path(), Duration::from_millis(10), false);

    fs::write(tmp.path().join("a.txt"), "x").unwrap();
    fs::write(tmp.path().join("a.txt"), "y").unwrap();

    wait_until(&batches, "changed event for a.txt", |batches| {
        has_event(batches, EventKind::CHANGED, "a.txt")
    });

    let batches = batches.lock().unwrap();
    // The file predates the watch, so nothing may claim it was created.
    assert!(!has_event(&batches, EventKind::CREATED, "a.txt"));
    // Within any one delivered batch the path appears at most once; the
    // write burst is a single composite event, not a stutter.
    for batch in batches.iter() {
        let hits = batch
            .iter()
            .filter(|(_, p)| p == Path::new("a.txt"))
            .count();
        assert!(hits <= 1, "batch repeats a path: {batch:?}");
    }
}

#[test]
fn new_directory_contents_are_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let (_watcher, batches) = start(tmp.path(), Duration::from_millis(10), false);

    fs::create_dir(tmp.path().join("d")).unwrap();
    fs::File::create(tmp.path().join("d/x")).unwrap();

    wait_until(&batches, "created events for d and d/x", |batches| {
        has_event(batches, EventKind::CREATED, "d")
            && has_event(batches, EventKind::CREATED, "d/x")
    });
}

#[test]
fn renaming_a_file_emits_an_ordered_pair() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("a.txt"), "contents").unwrap();
    let (_watcher, batches) = start(tmp.path(), Duration::from_millis(10), false);

    fs::rename(tmp.path().join("a.txt"), tmp.path().join("b.txt")).unwrap();

    wait_until(&batches, "a rename pair in one batch", |batches| {
        batches.iter().any(|batch| {
            let old = batch.iter().position(|(kind, p)| {
                *kind == (EventKind::DELETED | EventKind::RENAMED) && p == Path::new("a.txt")
            });
            let new = batch.iter().position(|(kind, p)| {
                *kind == (EventKind::CREATED | EventKind::RENAMED) && p == Path::new("b.txt")
            });
            matches!((old, new), (Some(old), Some(new)) if old < new)
        })
    });
}

#[test]
fn moved_directory_keeps_reporting_under_the_new_prefix() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("d/sub")).unwrap();
    let (_watcher, batches) = start(tmp.path(), Duration::from_millis(10), false);

    fs::rename(tmp.path().join("d"), tmp.path().join("e")).unwrap();
    wait_until(&batches, "rename pair for d -> e", |batches| {
        has_event(batches, EventKind::RENAMED, "d") && has_event(batches, EventKind::RENAMED, "e")
    });

    // A formerly-deep descendant still reports, and under the new prefix.
    fs::File::create(tmp.path().join("e/sub/inside")).unwrap();
    wait_until(&batches, "created event for e/sub/inside", |batches| {
        has_event(batches, EventKind::CREATED, "e/sub/inside")
    });
}

#[test]
fn quiet_root_delivers_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let (_watcher, batches) = start(tmp.path(), Duration::from_millis(10), false);

    thread::sleep(Duration::from_millis(200));
    assert!(batches.lock().unwrap().is_empty());
}

#[test]
fn deleting_a_directory_reports_deleted() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("d")).unwrap();
    let (_watcher, batches) = start(tmp.path(), Duration::from_millis(10), false);

    fs::remove_dir(tmp.path().join("d")).unwrap();

    wait_until(&batches, "deleted event for d", |batches| {
        has_event(batches, EventKind::DELETED, "d")
    });
}

#[test]
fn deleting_the_root_kills_the_watcher() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir(&root).unwrap();
    let (watcher, batches) = start(&root, Duration::from_millis(10), false);
    assert!(watcher.is_watching());

    fs::remove_dir_all(&root).unwrap();

    wait_until(&batches, "failure after root deletion", |batches| {
        has_failure(batches, "unexpected termination")
    });
    assert!(!watcher.is_watching());
}

#[test]
fn preexisting_contents_surface_as_init_events() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("a")).unwrap();
    fs::write(tmp.path().join("a/f.txt"), "x").unwrap();
    fs::write(tmp.path().join("b.txt"), "y").unwrap();

    let (_watcher, batches) = start(tmp.path(), Duration::from_millis(10), true);

    wait_until(&batches, "init events for preexisting entries", |batches| {
        has_event(batches, EventKind::CREATED, "a")
            && has_event(batches, EventKind::CREATED, "a/f.txt")
            && has_event(batches, EventKind::CREATED, "b.txt")
    });
}

#[test]
fn unreadable_subdirectory_fails_without_taking_siblings_down() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("open")).unwrap();
    let locked = tmp.path().join("locked");
    fs::create_dir(&locked).unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::read_dir(&locked).is_ok() {
        // Permission bits are not enforced for this user (running as root),
        // so there is nothing to observe.
        return;
    }

    let (watcher, batches) = start(tmp.path(), Duration::from_millis(10), false);
    assert!(watcher.is_watching());

    wait_until(&batches, "failure for the unreadable directory", |batches| {
        has_failure(batches, "permission denied: locked")
    });

    fs::File::create(tmp.path().join("open/f")).unwrap();
    wait_until(&batches, "created event in the sibling", |batches| {
        has_event(batches, EventKind::CREATED, "open/f")
    });

    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
}
