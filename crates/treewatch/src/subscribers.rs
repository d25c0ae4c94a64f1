//! Subscriber registry and the filter seam through which every batch (and
//! every internal error) reaches consumers.
//!
//! Consumers register callbacks and receive each drained batch as a shared
//! slice. The registry lock is held for the duration of `notify`, so
//! callbacks must not register or deregister subscribers from inside their
//! own invocation.

use std::{collections::BTreeMap, sync::Mutex};

use tracing::trace;

use crate::event::Event;

/// Opaque ticket returned by [`SubscriberSet::register`], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberHandle(u64);

type BoxedCallback = Box<dyn FnMut(&[Event]) + Send>;

#[derive(Default)]
struct Registry {
    callbacks: BTreeMap<u64, BoxedCallback>,
    next_handle: u64,
}

/// A mutex-guarded set of consumer callbacks with synchronous fan-out.
#[derive(Default)]
pub struct SubscriberSet {
    registry: Mutex<Registry>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, callback: impl FnMut(&[Event]) + Send + 'static) -> SubscriberHandle {
        let mut registry = self.registry.lock().expect("lock is valid");
        registry.next_handle += 1;
        let handle = registry.next_handle;
        registry.callbacks.insert(handle, Box::new(callback));
        SubscriberHandle(handle)
    }

    /// Removes a subscriber. Unknown or already-removed handles are ignored.
    pub fn deregister(&self, handle: SubscriberHandle) {
        let mut registry = self.registry.lock().expect("lock is valid");
        registry.callbacks.remove(&handle.0);
    }

    /// Invokes every registered callback with the batch, in registration
    /// order. Holds the registry lock across the invocations; callbacks must
    /// not re-enter registration.
    pub fn notify(&self, batch: &[Event]) {
        let mut registry = self.registry.lock().expect("lock is valid");
        for callback in registry.callbacks.values_mut() {
            callback(batch);
        }
    }
}

/// Wraps the subscriber set with the two operations the rest of the system
/// uses: suppressing empty batches and synthesizing error batches. Every
/// internal failure escapes through here as a single `FAILED` event.
pub struct EventFilter {
    subscribers: SubscriberSet,
    primary: SubscriberHandle,
}

impl EventFilter {
    pub fn new(callback: impl FnMut(&[Event]) + Send + 'static) -> Self {
        let subscribers = SubscriberSet::new();
        let primary = subscribers.register(callback);
        Self {
            subscribers,
            primary,
        }
    }

    pub fn subscribers(&self) -> &SubscriberSet {
        &self.subscribers
    }

    /// Delivers a batch unless it is empty.
    pub fn filter_and_notify(&self, batch: Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        trace!(events = batch.len(), "delivering batch");
        self.subscribers.notify(&batch);
    }

    /// Synthesizes a one-event `FAILED` batch and delivers it immediately,
    /// bypassing the coalescer.
    pub fn send_error(&self, message: impl Into<String>) {
        let message = message.into();
        trace!(%message, "delivering failure");
        self.subscribers.notify(&[Event::failure(message)]);
    }
}

impl Drop for EventFilter {
    fn drop(&mut self) {
        self.subscribers.deregister(self.primary);
    }
}
