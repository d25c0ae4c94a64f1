#![deny(clippy::all)]

//! Debounced, deduplicated filesystem watching for Linux directory trees,
//! built directly on inotify.
//!
//! A [`TreeWatcher`] mirrors a directory subtree with one inotify watch per
//! live directory, decodes the raw kernel stream (including cookie-paired
//! rename fragments), and delivers batches of [`Event`]s to a callback on a
//! fixed cadence. Events observed for the same path within one cadence
//! window are merged into a single record whose kind is the union of
//! everything that happened there.
//!
//! Failures never surface as `Result`s: the watcher owns no fallible public
//! operations beyond construction, and anything that goes wrong — from an
//! unreadable subdirectory to the kernel queue overflowing — reaches the
//! callback as a `FAILED` or `OVERFLOW` event. The single health probe is
//! [`TreeWatcher::is_watching`].
//!
//! ```no_run
//! use std::time::Duration;
//! use treewatch::{TreeWatcher, WatchConfig};
//!
//! let config = WatchConfig::new("/tmp/assets").latency(Duration::from_millis(10));
//! let watcher = TreeWatcher::new(config, |batch| {
//!     for event in batch {
//!         println!("{} {}", event.kind, event.path.display());
//!     }
//! });
//! assert!(watcher.is_watching());
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use inotify::Inotify;
use tracing::debug;

mod coalescer;
mod event;
mod event_loop;
mod subscribers;
mod tree;

pub use event::{Event, EventKind};
pub use subscribers::SubscriberHandle;

use coalescer::Coalescer;
use event_loop::EventLoop;
use subscribers::EventFilter;
use tree::WatchTree;

/// Construction inputs for a [`TreeWatcher`].
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Root of the watched subtree; absolute or relative.
    pub root: PathBuf,
    /// Cadence of batch delivery; also the merge window.
    pub latency: Duration,
    /// Whether bootstrap enumeration synthesizes a CREATED event for every
    /// preexisting entry, so consumers see existing contents as if just
    /// created.
    pub send_init_events: bool,
}

impl WatchConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            latency: Duration::from_millis(50),
            send_init_events: false,
        }
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn send_init_events(mut self, send_init_events: bool) -> Self {
        self.send_init_events = send_init_events;
        self
    }
}

/// Watches a directory subtree and delivers debounced event batches to the
/// callback supplied at construction.
///
/// Dropping the watcher stops the decoder, then the delivery worker, then
/// releases the kernel handle, in that order. In-flight work completes; the
/// threads are joined.
pub struct TreeWatcher {
    event_loop: Option<EventLoop>,
    tree: Option<Arc<WatchTree>>,
    coalescer: Arc<Coalescer>,
    filter: Arc<EventFilter>,
}

impl TreeWatcher {
    /// Builds the watcher and starts watching. Never fails outright: setup
    /// errors (missing root, inotify initialization failure, a dead root
    /// watch) are delivered to the callback as `FAILED` events and leave the
    /// instance in a dead state, observable through [`Self::is_watching`].
    pub fn new(config: WatchConfig, callback: impl FnMut(&[Event]) + Send + 'static) -> Self {
        debug!(root = %config.root.display(), "initializing tree watcher");
        let filter = Arc::new(EventFilter::new(callback));
        let coalescer = Arc::new(Coalescer::new(filter.clone(), config.latency));

        let inotify = match Inotify::init() {
            Ok(inotify) => inotify,
            Err(err) => {
                coalescer.send_error(format!("inotify initialization failed: {err}"));
                return Self {
                    event_loop: None,
                    tree: None,
                    coalescer,
                    filter,
                };
            }
        };

        let tree = Arc::new(WatchTree::new(
            inotify.watches(),
            config.root,
            coalescer.clone(),
            config.send_init_events,
        ));
        if !tree.is_root_alive() {
            // The tree has already reported why.
            return Self {
                event_loop: None,
                tree: None,
                coalescer,
                filter,
            };
        }

        let event_loop = match EventLoop::spawn(inotify, tree.clone(), coalescer.clone()) {
            Ok(event_loop) => Some(event_loop),
            Err(err) => {
                coalescer.send_error(format!("failed to start event loop: {err}"));
                None
            }
        };

        Self {
            event_loop,
            tree: Some(tree),
            coalescer,
            filter,
        }
    }

    /// Whether the root watch is alive and the decoder is running. Turns
    /// false when the watched root disappears, when the decoder hits a fatal
    /// read error, or after drop begins.
    pub fn is_watching(&self) -> bool {
        self.tree.as_ref().is_some_and(|tree| tree.is_root_alive())
            && self
                .event_loop
                .as_ref()
                .is_some_and(|event_loop| event_loop.is_running())
    }

    /// Attaches an additional subscriber. Every subscriber observes every
    /// delivered batch.
    pub fn register(&self, callback: impl FnMut(&[Event]) + Send + 'static) -> SubscriberHandle {
        self.filter.subscribers().register(callback)
    }

    /// Detaches a subscriber registered through [`Self::register`].
    /// Idempotent.
    pub fn deregister(&self, handle: SubscriberHandle) {
        self.filter.subscribers().deregister(handle);
    }
}

impl Drop for TreeWatcher {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.stop();
        }
        self.coalescer.stop();
        // The tree, and with it the last reference to the kernel handle,
        // drops after the workers are down.
    }
}
