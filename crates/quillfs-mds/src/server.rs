//! Server-side journal-open batching
//!
//! An `EOpen` entry pins the log tail while clients still hold
//! capabilities on its inodes. To let the tail advance, the server
//! re-journals a fresh open record for the still-open inodes; this module
//! holds the queue and the waiters for that batch write. The write itself
//! is driven from [`crate::mds::Mds::maybe_journal_opens`], which needs
//! the cache and the log.

use crate::completion::Completion;
use quillfs_common::InodeNo;

/// Pending journal-open work.
#[derive(Default)]
pub struct Server {
    queue: Vec<InodeNo>,
    open_waiters: Vec<Completion>,
}

impl Server {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `ino` for inclusion in the next journal-open write.
    pub fn queue_journal_open(&mut self, ino: InodeNo) {
        if !self.queue.contains(&ino) {
            self.queue.push(ino);
        }
    }

    pub fn add_journal_open_waiter(&mut self, cb: Completion) {
        self.open_waiters.push(cb);
    }

    #[must_use]
    pub fn queued_opens(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn has_open_waiters(&self) -> bool {
        !self.open_waiters.is_empty()
    }

    pub(crate) fn take_queue(&mut self) -> Vec<InodeNo> {
        std::mem::take(&mut self.queue)
    }

    pub(crate) fn drain_open_waiters(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.open_waiters)
    }
}
