//! Subtree migrator bookkeeping
//!
//! The export/import protocol itself runs elsewhere; the journal only
//! needs to know which subtrees are mid-export and to park completions
//! until an export finishes.

use crate::completion::Completion;
use quillfs_common::DirfragId;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Export-side migration state.
#[derive(Default)]
pub struct Migrator {
    exporting: HashSet<DirfragId>,
    finish_waiters: HashMap<DirfragId, Vec<Completion>>,
}

impl Migrator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_exporting(&self, dirfrag: DirfragId) -> bool {
        self.exporting.contains(&dirfrag)
    }

    /// An export of `dirfrag` started.
    pub fn begin_export(&mut self, dirfrag: DirfragId) {
        debug!("migrator exporting {}", dirfrag);
        self.exporting.insert(dirfrag);
    }

    pub fn add_export_finish_waiter(&mut self, dirfrag: DirfragId, cb: Completion) {
        self.finish_waiters.entry(dirfrag).or_default().push(cb);
    }

    /// The export of `dirfrag` finished (acked remotely and logged);
    /// wake its waiters.
    pub fn finish_export(&mut self, dirfrag: DirfragId) {
        debug!("migrator finished export of {}", dirfrag);
        self.exporting.remove(&dirfrag);
        if let Some(waiters) = self.finish_waiters.remove(&dirfrag) {
            for cb in waiters {
                cb();
            }
        }
    }
}
