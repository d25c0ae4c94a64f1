//! Periodic drain of the event buffer with per-path merging.
//!
//! Producers push events into a mutex-guarded buffer; a worker thread swaps
//! the buffer against an empty one on a fixed cadence, merges everything that
//! happened to the same path within the window into a single record, and
//! hands the merged batch to the filter. Swapping under the lock keeps
//! producers wait-free apart from the push itself.

use std::{
    collections::{hash_map::Entry, HashMap},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    event::{Event, EventKind},
    subscribers::EventFilter,
};

pub(crate) struct Coalescer {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Shared {
    filter: Arc<EventFilter>,
    buffer: Mutex<Vec<Event>>,
    running: AtomicBool,
    latency: Duration,
}

impl Coalescer {
    /// Spawns the drain worker. It alternates a drain pass and a sleep of
    /// `latency` until stopped.
    pub(crate) fn new(filter: Arc<EventFilter>, latency: Duration) -> Self {
        let shared = Arc::new(Shared {
            filter,
            buffer: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            latency,
        });
        let worker = thread::Builder::new()
            .name("treewatch-coalescer".to_string())
            .spawn({
                let shared = shared.clone();
                move || {
                    debug!(latency_ms = shared.latency.as_millis() as u64, "coalescer running");
                    while shared.running.load(Ordering::Acquire) {
                        shared.drain();
                        thread::sleep(shared.latency);
                    }
                    debug!("coalescer stopped");
                }
            })
            .expect("failed to spawn coalescer thread");
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueues a single event, stamped on entry.
    pub(crate) fn collect(&self, kind: EventKind, path: impl Into<PathBuf>) {
        let mut buffer = self.shared.buffer.lock().expect("lock is valid");
        buffer.push(Event::new(kind, path));
    }

    /// Enqueues a pre-built batch in one locked push, so records that belong
    /// together (a rename pair) stay adjacent.
    pub(crate) fn insert(&self, events: Vec<Event>) {
        let mut buffer = self.shared.buffer.lock().expect("lock is valid");
        buffer.extend(events);
    }

    /// Routes an error past the buffer, straight through the filter.
    pub(crate) fn send_error(&self, message: impl Into<String>) {
        self.shared.filter.send_error(message);
    }

    /// Stops the worker and waits for it to exit; it completes at most one
    /// more sleep cycle. Idempotent.
    pub(crate) fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        let handle = self.worker.lock().expect("lock is valid").take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("coalescer thread panicked before join");
            }
        }
    }
}

impl Drop for Coalescer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn drain(&self) {
        let drained = {
            let mut buffer = self.buffer.lock().expect("lock is valid");
            std::mem::take(&mut *buffer)
        };
        self.filter.filter_and_notify(merge(drained));
    }
}

/// Folds every event sharing a relative path into one record whose kind is
/// the union of the kinds observed there. The surviving record is the latest
/// at that path (its timestamp and path object are kept); survivors stay in
/// arrival order. Applying the pass to its own output changes nothing.
pub(crate) fn merge(events: Vec<Event>) -> Vec<Event> {
    let mut slots: Vec<Option<Event>> = events.into_iter().map(Some).collect();
    let mut chosen: HashMap<PathBuf, usize> = HashMap::with_capacity(slots.len());
    for index in (0..slots.len()).rev() {
        let path = slots[index]
            .as_ref()
            .expect("slot is unvisited")
            .path
            .clone();
        match chosen.entry(path) {
            Entry::Vacant(entry) => {
                entry.insert(index);
            }
            Entry::Occupied(entry) => {
                let earlier = slots[index].take().expect("slot is unvisited");
                let survivor = slots[*entry.get()]
                    .as_mut()
                    .expect("chosen slot still holds its event");
                survivor.kind |= earlier.kind;
            }
        }
    }
    slots.into_iter().flatten().collect()
}
