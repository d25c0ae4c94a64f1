//! The typed event record delivered to subscribers.
//!
//! An [`Event`] is a path relative to the watch root, a monotonic timestamp,
//! and a [`EventKind`] bitset. Kinds are a bitset rather than an enum because
//! the coalescer folds every event observed for one path within a drain
//! window into a single record whose kind is the union of everything that
//! happened there.

use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
    time::Instant,
};

use bitflags::bitflags;

bitflags! {
    /// What happened at a path, possibly several things at once.
    ///
    /// `CREATED | CHANGED` is a file that appeared and was written within one
    /// coalescing window; `DELETED | RENAMED` / `CREATED | RENAMED` are the
    /// two halves of a rename pair.
    pub struct EventKind: u8 {
        const CREATED = 0x01;
        const CHANGED = 0x02;
        const DELETED = 0x04;
        const RENAMED = 0x08;
        const OVERFLOW = 0x10;
        const FAILED = 0x20;
    }
}

impl EventKind {
    pub fn is_created(self) -> bool {
        self.contains(EventKind::CREATED)
    }

    pub fn is_changed(self) -> bool {
        self.contains(EventKind::CHANGED)
    }

    pub fn is_deleted(self) -> bool {
        self.contains(EventKind::DELETED)
    }

    pub fn is_renamed(self) -> bool {
        self.contains(EventKind::RENAMED)
    }

    pub fn is_overflow(self) -> bool {
        self.contains(EventKind::OVERFLOW)
    }

    pub fn is_failed(self) -> bool {
        self.contains(EventKind::FAILED)
    }
}

const KIND_NAMES: [(EventKind, &str); 6] = [
    (EventKind::CREATED, "created"),
    (EventKind::CHANGED, "changed"),
    (EventKind::DELETED, "deleted"),
    (EventKind::RENAMED, "renamed"),
    (EventKind::OVERFLOW, "overflow"),
    (EventKind::FAILED, "failed"),
];

impl Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        // A rename half also carries CREATED or DELETED; rendering both reads
        // like two distinct operations, so the rename bit wins.
        let kind = if self.is_renamed() {
            *self & EventKind::RENAMED
        } else {
            *self
        };
        let mut first = true;
        for (flag, name) in KIND_NAMES {
            if kind.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// One filesystem observation, relative to the watch root.
#[derive(Debug)]
pub struct Event {
    pub kind: EventKind,
    /// Path relative to the watch root; empty for events on the root itself.
    /// A `FAILED` event carries its error message here instead.
    pub path: PathBuf,
    /// Monotonic timestamp taken when the event entered the coalescer.
    pub at: Instant,
}

impl Event {
    pub fn new(kind: EventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            at: Instant::now(),
        }
    }

    /// A synthetic error marker. The message rides in the path field, which
    /// keeps two distinct failures from being merged into one record by the
    /// per-path coalescing pass.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(EventKind::FAILED, PathBuf::from(message.into()))
    }

    /// The error message of a `FAILED` event, if this is one.
    pub fn failure_message(&self) -> Option<&str> {
        self.kind.is_failed().then(|| self.path.to_str()).flatten()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bits_match_wire_encoding() {
        assert_eq!(EventKind::CREATED.bits(), 0x01);
        assert_eq!(EventKind::CHANGED.bits(), 0x02);
        assert_eq!(EventKind::DELETED.bits(), 0x04);
        assert_eq!(EventKind::RENAMED.bits(), 0x08);
        assert_eq!(EventKind::OVERFLOW.bits(), 0x10);
        assert_eq!(EventKind::FAILED.bits(), 0x20);
    }

    #[test]
    fn kind_union_keeps_both_bits() {
        let kind = EventKind::CREATED | EventKind::CHANGED;
        assert!(kind.is_created());
        assert!(kind.is_changed());
        assert!(!kind.is_deleted());
    }

    #[test]
    fn display_renders_rename_halves_as_renamed() {
        assert_eq!(
            (EventKind::DELETED | EventKind::RENAMED).to_string(),
            "renamed"
        );
        assert_eq!(
            (EventKind::CREATED | EventKind::RENAMED).to_string(),
            "renamed"
        );
    }

    #[test]
    fn display_joins_plain_unions() {
        assert_eq!(
            (EventKind::CREATED | EventKind::CHANGED).to_string(),
            "created | changed"
        );
        assert_eq!(EventKind::empty().to_string(), "none");
    }

    #[test]
    fn failure_event_exposes_its_message() {
        let event = Event::failure("permission denied: logs");
        assert!(event.kind.is_failed());
        assert_eq!(event.failure_message(), Some("permission denied: logs"));

        let plain = Event::new(EventKind::CREATED, "a.txt");
        assert_eq!(plain.failure_message(), None);
    }
}
