//! The decoder thread: blocks on the kernel queue, resolves cookie-paired
//! move fragments, and turns raw records into tree mutations and coalescer
//! entries.
//!
//! The inotify fd is registered non-blocking with a mio poll alongside a
//! waker token, so shutdown is a flag store plus a wake — no signals and no
//! racing against handle closure. Reads drain until `WouldBlock`; after each
//! drain an `FIONREAD` probe decides whether an unmatched move-from can still
//! hope for its pair.

use std::{
    ffi::{OsStr, OsString},
    io,
    os::unix::io::{AsRawFd, RawFd},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
};

use inotify::{EventMask, Inotify, WatchDescriptor};
use mio::{unix::SourceFd, Events, Interest, Poll, Token, Waker};
use tracing::{debug, trace, warn};

use crate::{coalescer::Coalescer, event::Event, event::EventKind, tree::WatchTree};

const INOTIFY_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

/// Sized for a few dozen records per read; inotify never splits a record
/// across reads.
const EVENT_BUFFER_SIZE: usize = 4096;

/// A half-seen move-from waiting for its move-to counterpart. At most one
/// exists at any time, and only the decoder thread touches it.
struct PendingRename {
    cookie: u32,
    wd: WatchDescriptor,
    name: OsString,
    is_dir: bool,
}

pub(crate) struct EventLoop {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventLoop {
    /// Spawns the decoder thread and blocks until it has entered its read
    /// loop, so a constructed `EventLoop` is already observing events.
    pub(crate) fn spawn(
        inotify: Inotify,
        tree: Arc<WatchTree>,
        coalescer: Arc<Coalescer>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let raw_fd = inotify.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&raw_fd), INOTIFY_TOKEN, Interest::READABLE)?;

        let running = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("treewatch-decoder".to_string())
            .spawn({
                let running = running.clone();
                let dispatcher = Dispatcher { tree, coalescer };
                move || run(inotify, poll, dispatcher, running, ready_tx)
            })?;
        let _ = ready_rx.recv();

        Ok(Self {
            running,
            waker,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flags the thread down, wakes its poll, and joins it. Idempotent.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            warn!(%err, "failed to wake decoder for shutdown");
        }
        let handle = self.thread.lock().expect("lock is valid").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("decoder thread panicked before join");
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    mut inotify: Inotify,
    mut poll: Poll,
    dispatcher: Dispatcher,
    running: Arc<AtomicBool>,
    ready: mpsc::Sender<()>,
) {
    running.store(true, Ordering::Release);
    let _ = ready.send(());
    debug!("decoder running");

    let raw_fd = inotify.as_raw_fd();
    let mut poll_events = Events::with_capacity(16);
    let mut buffer = [0u8; EVENT_BUFFER_SIZE];
    let mut pending: Option<PendingRename> = None;

    'outer: loop {
        match poll.poll(&mut poll_events, None) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                dispatcher
                    .coalescer
                    .send_error(format!("failed to poll inotify: {err}"));
                break;
            }
            Ok(()) => {}
        }
        if !running.load(Ordering::Acquire) {
            break;
        }
        for poll_event in poll_events.iter() {
            match poll_event.token() {
                // Re-checked at the top of the loop.
                WAKE_TOKEN => {}
                INOTIFY_TOKEN => {
                    if !drain(
                        &mut inotify,
                        raw_fd,
                        &dispatcher,
                        &running,
                        &mut pending,
                        &mut buffer,
                    ) {
                        break 'outer;
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    running.store(false, Ordering::Release);
    debug!("decoder stopped");
}

/// Reads the kernel queue dry and dispatches every record. Returns `false`
/// when the loop must exit (fatal read error or stop observed mid-batch).
fn drain(
    inotify: &mut Inotify,
    raw_fd: RawFd,
    dispatcher: &Dispatcher,
    running: &AtomicBool,
    pending: &mut Option<PendingRename>,
    buffer: &mut [u8],
) -> bool {
    loop {
        match inotify.read_events(buffer) {
            Ok(records) => {
                let mut saw_any = false;
                for record in records {
                    saw_any = true;
                    if !running.load(Ordering::Acquire) {
                        return false;
                    }
                    handle_record(
                        dispatcher,
                        pending,
                        record.wd,
                        record.mask,
                        record.cookie,
                        record.name,
                    );
                }
                if !saw_any {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                dispatcher
                    .coalescer
                    .send_error(format!("failed to read inotify events: {err}"));
                return false;
            }
        }
    }

    // Nothing further queued means an unmatched move-from will never see its
    // pair; resolve it as a deletion now. A failed probe leaves it pending.
    if queued_bytes(raw_fd) == Some(0) {
        if let Some(stale) = pending.take() {
            dispatcher.flush_pending(stale);
        }
    }
    true
}

fn queued_bytes(fd: RawFd) -> Option<libc::c_int> {
    let mut available: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available) };
    (rc == 0).then_some(available)
}

fn handle_record(
    dispatcher: &Dispatcher,
    pending: &mut Option<PendingRename>,
    wd: WatchDescriptor,
    mask: EventMask,
    cookie: u32,
    name: Option<&OsStr>,
) {
    trace!(?mask, cookie, ?name, "kernel record");

    if mask.contains(EventMask::Q_OVERFLOW) {
        // Events were dropped; the tree may now disagree with reality and
        // the consumer is expected to re-enumerate.
        dispatcher
            .coalescer
            .collect(EventKind::OVERFLOW, PathBuf::new());
        return;
    }

    // A record under a different cookie proves the pending pair will never
    // complete; resolve it before dispatching the record normally.
    if pending.as_ref().is_some_and(|p| p.cookie != cookie) {
        let stale = pending.take().expect("pending was just checked");
        dispatcher.flush_pending(stale);
    }

    let is_dir = mask.contains(EventMask::ISDIR);
    let name = name.unwrap_or(OsStr::new(""));

    if mask.intersects(EventMask::ATTRIB | EventMask::MODIFY) {
        dispatcher.emit_modify(&wd, name);
    } else if mask.contains(EventMask::CREATE) {
        dispatcher.emit_create(&wd, name, is_dir, true);
    } else if mask.contains(EventMask::DELETE) {
        dispatcher.emit_delete(&wd, name);
    } else if mask.intersects(EventMask::DELETE_SELF | EventMask::IGNORED) {
        dispatcher.emit_delete_dir_by_wd(&wd);
    } else if mask.contains(EventMask::MOVED_FROM) {
        if cookie == 0 {
            dispatcher.emit_delete(&wd, name);
        } else {
            *pending = Some(PendingRename {
                cookie,
                wd,
                name: name.to_owned(),
                is_dir,
            });
        }
    } else if mask.contains(EventMask::MOVED_TO) {
        // Any mismatched pending was flushed above, so a surviving pending
        // here carries the matching cookie.
        match pending.take() {
            Some(from) if from.is_dir => {
                dispatcher.emit_move_dir(&from.wd, &from.name, &wd, name);
            }
            Some(from) => {
                dispatcher.emit_move(&from.wd, &from.name, &wd, name);
            }
            // A move-in whose source we never saw. With no cookie at all the
            // entry comes from outside the event source's horizon and its
            // contents are surfaced; a cookied but unpaired move-in adopts
            // silently.
            None => {
                dispatcher.emit_create(&wd, name, is_dir, cookie == 0);
            }
        }
    } else if mask.contains(EventMask::MOVE_SELF) {
        dispatcher.emit_delete(&wd, name);
        dispatcher.emit_delete_dir_by_wd(&wd);
    }
}

/// Translates decoder actions into tree mutations and coalescer entries.
/// Records whose watch descriptor no longer resolves are dropped — the
/// subtree they belong to has already been torn out of the tree.
struct Dispatcher {
    tree: Arc<WatchTree>,
    coalescer: Arc<Coalescer>,
}

impl Dispatcher {
    fn dispatch_one(&self, kind: EventKind, wd: &WatchDescriptor, name: &OsStr) {
        let Some(mut path) = self.tree.rel_path(wd) else {
            return;
        };
        if !name.is_empty() {
            path.push(name);
        }
        self.coalescer.collect(kind, path);
    }

    fn emit_create(&self, wd: &WatchDescriptor, name: &OsStr, is_dir: bool, send_init: bool) {
        if is_dir {
            if !self.tree.node_exists(wd) {
                return;
            }
            self.tree.add_dir_node(wd, name, send_init);
        }
        self.dispatch_one(EventKind::CREATED, wd, name);
    }

    fn emit_modify(&self, wd: &WatchDescriptor, name: &OsStr) {
        self.dispatch_one(EventKind::CHANGED, wd, name);
    }

    fn emit_delete(&self, wd: &WatchDescriptor, name: &OsStr) {
        self.dispatch_one(EventKind::DELETED, wd, name);
    }

    fn emit_delete_dir_by_wd(&self, wd: &WatchDescriptor) {
        self.tree.remove_dir_node_by_wd(wd);
    }

    /// The two halves of a matched rename enter the coalescer in one push:
    /// deletion of the old path first, creation of the new path second. If
    /// either side no longer resolves, neither is emitted.
    fn emit_move(
        &self,
        old_wd: &WatchDescriptor,
        old_name: &OsStr,
        new_wd: &WatchDescriptor,
        new_name: &OsStr,
    ) {
        let Some(old_dir) = self.tree.rel_path(old_wd) else {
            return;
        };
        let Some(new_dir) = self.tree.rel_path(new_wd) else {
            return;
        };
        self.coalescer.insert(vec![
            Event::new(
                EventKind::DELETED | EventKind::RENAMED,
                old_dir.join(old_name),
            ),
            Event::new(
                EventKind::CREATED | EventKind::RENAMED,
                new_dir.join(new_name),
            ),
        ]);
    }

    fn emit_move_dir(
        &self,
        old_wd: &WatchDescriptor,
        old_name: &OsStr,
        new_wd: &WatchDescriptor,
        new_name: &OsStr,
    ) {
        // Emit with the pre-move paths, then relocate the subtree.
        self.emit_move(old_wd, old_name, new_wd, new_name);
        self.tree
            .move_dir_node(old_wd, old_name, new_wd, new_name);
    }

    /// An orphaned move-from is a departure we will never see the other half
    /// of: the entry left the watched subtree.
    fn flush_pending(&self, pending: PendingRename) {
        if pending.is_dir {
            self.tree.remove_dir_node(&pending.wd, &pending.name);
        }
        self.dispatch_one(EventKind::DELETED, &pending.wd, &pending.name);
    }
}
