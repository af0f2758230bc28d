//! Inode number allocator
//!
//! A versioned, deterministic allocator: ids come from the lowest free
//! id, so replaying the same sequence of alloc/free operations against
//! the same starting state reproduces the same ids. Every mutation
//! advances the table version by exactly one, which is what lets journal
//! replay assert strict sequencing.

use crate::completion::Completion;
use quillfs_common::Version;
use std::collections::BTreeSet;
use tracing::debug;

/// First id handed out by a fresh allocator, above the reserved inode
/// ranges (root, strays).
const ID_BASE: u64 = 0x1000;

/// Deterministic id allocator.
pub struct IdAllocator {
    version: Version,
    committed_version: Version,
    next: u64,
    freed: BTreeSet<u64>,
    save_waiters: Vec<(Version, Completion)>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: 0,
            committed_version: 0,
            next: ID_BASE,
            freed: BTreeSet::new(),
            save_waiters: Vec::new(),
        }
    }

    #[must_use]
    pub fn get_version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn get_committed_version(&self) -> Version {
        self.committed_version
    }

    /// Allocate the lowest free id.
    pub fn alloc_id(&mut self) -> u64 {
        self.version += 1;
        let id = match self.freed.iter().next().copied() {
            Some(id) => {
                self.freed.remove(&id);
                id
            }
            None => {
                let id = self.next;
                self.next += 1;
                id
            }
        };
        debug!("idalloc v{} alloc {}", self.version, id);
        id
    }

    /// Return an id to the free pool.
    pub fn reclaim_id(&mut self, id: u64) {
        self.version += 1;
        debug!("idalloc v{} reclaim {}", self.version, id);
        self.freed.insert(id);
    }

    /// Ask for the table to be flushed through `version`; `cb` fires once
    /// that version is durable.
    pub fn save(&mut self, cb: Completion, version: Version) {
        self.save_waiters.push((version, cb));
    }

    /// The backing store acknowledged a flush of the current version.
    pub fn mark_saved(&mut self) {
        self.committed_version = self.version;
        let committed = self.committed_version;
        let (ready, pending): (Vec<_>, Vec<_>) = self
            .save_waiters
            .drain(..)
            .partition(|(v, _)| *v <= committed);
        self.save_waiters = pending;
        for (_, cb) in ready {
            cb();
        }
    }
}
