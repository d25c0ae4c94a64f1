//! The live forest of inotify watches mirroring the watched subtree.
//!
//! One node per directory currently being watched. Files never get their own
//! watch descriptor; the watch on the containing directory reports their
//! events. The tree owns every node, keyed by watch descriptor, and all
//! structural mutation serializes on a single lock. The decoder thread is the
//! only runtime mutator; caller threads only read liveness and paths.

use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use inotify::{WatchDescriptor, WatchMask, Watches};
use thiserror::Error;
use tracing::{trace, warn};

use crate::{coalescer::Coalescer, event::EventKind};

/// Why `inotify_add_watch` refused a directory. Everything except the
/// permission case is a resource-level failure, so only that one names the
/// offending path.
#[derive(Debug, Error)]
pub(crate) enum WatchInstallError {
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("bad address")]
    BadAddress,
    #[error("no space left on device")]
    NoSpace,
    #[error("out of memory")]
    OutOfMemory,
    #[error("bad file descriptor or invalid argument")]
    BadDescriptor,
    #[error("failed to install watch: {0}")]
    Other(io::Error),
}

fn classify_install_error(err: io::Error, rel_path: &Path) -> WatchInstallError {
    match err.raw_os_error() {
        Some(libc::EACCES) => WatchInstallError::PermissionDenied(rel_path.to_owned()),
        Some(libc::EFAULT) => WatchInstallError::BadAddress,
        Some(libc::ENOSPC) => WatchInstallError::NoSpace,
        Some(libc::ENOMEM) => WatchInstallError::OutOfMemory,
        Some(libc::EBADF) | Some(libc::EINVAL) => WatchInstallError::BadDescriptor,
        _ => WatchInstallError::Other(err),
    }
}

fn watch_mask(is_root: bool) -> WatchMask {
    let mut mask = WatchMask::ATTRIB
        | WatchMask::MODIFY
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::DELETE_SELF;
    if is_root {
        // Only the root cares about being moved away; children moving inside
        // the tree are reported by their parents.
        mask |= WatchMask::MOVE_SELF;
    }
    mask
}

struct WatchNode {
    wd: WatchDescriptor,
    /// `None` only for the root.
    parent: Option<WatchDescriptor>,
    /// Cached path relative to the watch root; empty for the root. Rewritten
    /// for a whole subtree when a directory moves.
    rel_path: PathBuf,
    children: HashMap<OsString, WatchDescriptor>,
}

impl WatchNode {
    fn name(&self) -> &OsStr {
        self.rel_path.file_name().unwrap_or_else(|| OsStr::new(""))
    }
}

struct TreeState {
    watches: Watches,
    /// Exactly the set of alive nodes.
    nodes: HashMap<WatchDescriptor, WatchNode>,
    root: Option<WatchDescriptor>,
}

pub(crate) struct WatchTree {
    root_path: PathBuf,
    coalescer: Arc<Coalescer>,
    state: Mutex<TreeState>,
    /// Mirror of `state.root.is_some()`, readable without the tree lock so
    /// liveness probes from subscriber callbacks cannot deadlock.
    alive: AtomicBool,
}

impl WatchTree {
    /// Bootstraps the tree against `root_path`. A nonexistent root or a
    /// failed root watch leaves the tree dead; the error has already been
    /// surfaced through the coalescer in that case.
    pub(crate) fn new(
        watches: Watches,
        root_path: PathBuf,
        coalescer: Arc<Coalescer>,
        send_init_events: bool,
    ) -> Self {
        let tree = Self {
            root_path,
            coalescer,
            state: Mutex::new(TreeState {
                watches,
                nodes: HashMap::new(),
                root: None,
            }),
            alive: AtomicBool::new(false),
        };
        if !tree.root_path.exists() {
            tree.coalescer.send_error("watch root does not exist");
            return tree;
        }
        {
            let mut state = tree.state.lock().expect("lock is valid");
            match tree.install_node(&mut state, None, PathBuf::new(), send_init_events) {
                Some(wd) => {
                    state.root = Some(wd);
                    tree.alive.store(true, Ordering::Release);
                }
                None => {
                    drop(state);
                    tree.coalescer.send_error("unexpected termination");
                }
            }
        }
        tree
    }

    pub(crate) fn is_root_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// The only way upstream layers turn a watch descriptor into a path.
    pub(crate) fn rel_path(&self, wd: &WatchDescriptor) -> Option<PathBuf> {
        self.state
            .lock()
            .expect("lock is valid")
            .nodes
            .get(wd)
            .map(|node| node.rel_path.clone())
    }

    pub(crate) fn node_exists(&self, wd: &WatchDescriptor) -> bool {
        self.state
            .lock()
            .expect("lock is valid")
            .nodes
            .contains_key(wd)
    }

    /// Adopts `name` as a new child directory of the node watched by
    /// `parent_wd`. Unknown parents are ignored; a child that fails to come
    /// up alive is discarded.
    pub(crate) fn add_dir_node(
        &self,
        parent_wd: &WatchDescriptor,
        name: &OsStr,
        send_init_events: bool,
    ) {
        let mut state = self.state.lock().expect("lock is valid");
        self.add_child_locked(&mut state, parent_wd, name, send_init_events);
    }

    /// Removes the node watched by `wd` and its whole subtree. Removing the
    /// root kills the tree and surfaces a failure, since it means the watched
    /// directory itself went away.
    pub(crate) fn remove_dir_node_by_wd(&self, wd: &WatchDescriptor) {
        let mut state = self.state.lock().expect("lock is valid");
        let found = state
            .nodes
            .get(wd)
            .map(|node| (node.parent.clone(), node.name().to_owned()));
        match found {
            None => {}
            Some((None, _)) => {
                if let Some(root) = state.root.take() {
                    Self::destroy_subtree(&mut state, &root);
                }
                self.alive.store(false, Ordering::Release);
                drop(state);
                self.coalescer.send_error("unexpected termination");
            }
            Some((Some(parent_wd), name)) => {
                if let Some(parent) = state.nodes.get_mut(&parent_wd) {
                    parent.children.remove(&name);
                }
                Self::destroy_subtree(&mut state, wd);
            }
        }
    }

    /// Removes the child `name` of the node watched by `parent_wd`, subtree
    /// included. No-op when either is unknown.
    pub(crate) fn remove_dir_node(&self, parent_wd: &WatchDescriptor, name: &OsStr) {
        let mut state = self.state.lock().expect("lock is valid");
        let Some(parent) = state.nodes.get_mut(parent_wd) else {
            return;
        };
        let Some(child_wd) = parent.children.remove(name) else {
            return;
        };
        Self::destroy_subtree(&mut state, &child_wd);
    }

    /// Relocates the subtree `old_name` under `old_parent_wd` to `new_name`
    /// under `new_parent_wd`, rewriting every descendant's cached path. When
    /// the source is unknown we lost sight of the subtree at some point, so
    /// the destination is adopted fresh with synthesized creation events.
    pub(crate) fn move_dir_node(
        &self,
        old_parent_wd: &WatchDescriptor,
        old_name: &OsStr,
        new_parent_wd: &WatchDescriptor,
        new_name: &OsStr,
    ) {
        let mut state = self.state.lock().expect("lock is valid");
        let detached = state
            .nodes
            .get_mut(old_parent_wd)
            .map(|old_parent| old_parent.children.remove(old_name));
        let moving_wd = match detached {
            // The source is unknown or already gone; all we can do is adopt
            // the destination as a brand-new subtree.
            None | Some(None) => {
                self.add_child_locked(&mut state, new_parent_wd, new_name, true);
                return;
            }
            Some(Some(moving_wd)) => moving_wd,
        };
        let new_parent_rel = state.nodes.get(new_parent_wd).map(|n| n.rel_path.clone());
        let Some(new_parent_rel) = new_parent_rel else {
            // The destination is outside anything we watch; the detached
            // subtree is gone as far as consumers are concerned.
            Self::destroy_subtree(&mut state, &moving_wd);
            return;
        };
        let children = {
            let node = state
                .nodes
                .get_mut(&moving_wd)
                .expect("moving node is indexed");
            node.parent = Some(new_parent_wd.clone());
            node.rel_path = new_parent_rel.join(new_name);
            node.children.values().cloned().collect::<Vec<_>>()
        };
        for child in children {
            Self::rewrite_paths(&mut state, &child);
        }
        state
            .nodes
            .get_mut(new_parent_wd)
            .expect("destination parent was just resolved")
            .children
            .insert(new_name.to_owned(), moving_wd);
    }

    /// Installs a watch for one directory and recursively adopts its
    /// subdirectories. Returns `None` when the node did not come up alive;
    /// the failure, if it is worth reporting, has been surfaced already.
    fn install_node(
        &self,
        state: &mut TreeState,
        parent: Option<WatchDescriptor>,
        rel_path: PathBuf,
        send_init_events: bool,
    ) -> Option<WatchDescriptor> {
        let abs_path = self.root_path.join(&rel_path);
        let wd = match state.watches.add(&abs_path, watch_mask(parent.is_none())) {
            Ok(wd) => wd,
            Err(err) => {
                let err = classify_install_error(err, &rel_path);
                warn!(path = %abs_path.display(), %err, "failed to install watch");
                self.coalescer.send_error(err.to_string());
                return None;
            }
        };
        // Only real, non-symlink directories get nodes. The watch briefly
        // installed on anything else is released again.
        let is_plain_dir = fs::symlink_metadata(&abs_path)
            .map(|meta| meta.file_type().is_dir())
            .unwrap_or(false);
        if !is_plain_dir {
            let _ = state.watches.remove(wd);
            return None;
        }
        trace!(path = %abs_path.display(), "watching directory");
        state.nodes.insert(
            wd.clone(),
            WatchNode {
                wd: wd.clone(),
                parent,
                rel_path: rel_path.clone(),
                children: HashMap::new(),
            },
        );
        let Ok(entries) = fs::read_dir(&abs_path) else {
            return Some(wd);
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_symlink() {
                continue;
            }
            let name = entry.file_name();
            let child_rel = rel_path.join(&name);
            if file_type.is_dir() {
                if let Some(child_wd) =
                    self.install_node(state, Some(wd.clone()), child_rel.clone(), send_init_events)
                {
                    state
                        .nodes
                        .get_mut(&wd)
                        .expect("node was just inserted")
                        .children
                        .insert(name, child_wd);
                }
            }
            if send_init_events {
                self.coalescer.collect(EventKind::CREATED, child_rel);
            }
        }
        Some(wd)
    }

    fn add_child_locked(
        &self,
        state: &mut TreeState,
        parent_wd: &WatchDescriptor,
        name: &OsStr,
        send_init_events: bool,
    ) {
        let Some(parent) = state.nodes.get(parent_wd) else {
            return;
        };
        let child_rel = parent.rel_path.join(name);
        if let Some(child_wd) =
            self.install_node(state, Some(parent_wd.clone()), child_rel, send_init_events)
        {
            state
                .nodes
                .get_mut(parent_wd)
                .expect("parent was present before the install")
                .children
                .insert(name.to_owned(), child_wd);
        }
    }

    /// Recomputes a node's cached path from its parent and recurses into its
    /// children. A node whose path already agrees with its parent has a
    /// consistent subtree below it, so recursion stops there.
    fn rewrite_paths(state: &mut TreeState, wd: &WatchDescriptor) {
        let Some((parent_wd, name)) = state
            .nodes
            .get(wd)
            .map(|node| (node.parent.clone(), node.name().to_owned()))
        else {
            return;
        };
        let Some(parent_rel) = parent_wd
            .and_then(|parent| state.nodes.get(&parent))
            .map(|parent| parent.rel_path.clone())
        else {
            return;
        };
        let new_rel = parent_rel.join(name);
        let children = {
            let node = state.nodes.get_mut(wd).expect("node was just read");
            if node.rel_path == new_rel {
                return;
            }
            node.rel_path = new_rel;
            node.children.values().cloned().collect::<Vec<_>>()
        };
        for child in children {
            Self::rewrite_paths(state, &child);
        }
    }

    /// Drops a node and everything below it: the kernel watch, the index
    /// entry, the children. The parent's link to it is the caller's business.
    fn destroy_subtree(state: &mut TreeState, wd: &WatchDescriptor) {
        let Some(node) = state.nodes.remove(wd) else {
            return;
        };
        let _ = state.watches.remove(node.wd);
        for child_wd in node.children.values() {
            Self::destroy_subtree(state, child_wd);
        }
    }
}
