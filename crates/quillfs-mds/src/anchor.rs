//! Anchor table and anchor client
//!
//! The anchor table maps inodes to their containing dirfrags so that
//! remote links can be resolved without a path walk. Mutations are
//! two-phase: a prepare reserves the change under a transaction id (the
//! table version at prepare time) and a commit applies it.
//!
//! The anchor client is the per-MDS view of outstanding transactions: it
//! tracks which transactions have been journaled locally ("agree") and
//! which the table has durably acknowledged ("ack").

use crate::completion::Completion;
use quillfs_common::{AnchorTxnId, DirfragId, InodeNo, NodeId, Version};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// One hop of an anchor trace: an inode and the dirfrag holding its
/// primary dentry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub ino: InodeNo,
    pub dirfrag: DirfragId,
    pub nref: u32,
}

/// A prepared, not yet committed table mutation.
#[derive(Clone, Debug)]
enum PendingOp {
    Create {
        ino: InodeNo,
        trace: Vec<Anchor>,
    },
    Destroy {
        ino: InodeNo,
    },
    Update {
        ino: InodeNo,
        trace: Vec<Anchor>,
    },
}

/// The anchor table. Every prepare and every commit advances the table
/// version by exactly one.
pub struct AnchorTable {
    version: Version,
    committed_version: Version,
    anchors: HashMap<InodeNo, Vec<Anchor>>,
    pending: HashMap<AnchorTxnId, PendingOp>,
    save_waiters: Vec<(Version, Completion)>,
}

impl Default for AnchorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AnchorTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: 0,
            committed_version: 0,
            anchors: HashMap::new(),
            pending: HashMap::new(),
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

    /// Prepare creation of the anchors in `trace` for `ino`. Returns the
    /// transaction id.
    pub fn create_prepare(
        &mut self,
        ino: InodeNo,
        trace: Vec<Anchor>,
        reqmds: NodeId,
    ) -> AnchorTxnId {
        self.version += 1;
        let atid = self.version;
        debug!("anchortable create_prepare {} atid {} from {}", ino, atid, reqmds);
        self.pending.insert(atid, PendingOp::Create { ino, trace });
        atid
    }

    /// Prepare removal of `ino`'s anchors. Returns the transaction id.
    pub fn destroy_prepare(&mut self, ino: InodeNo, reqmds: NodeId) -> AnchorTxnId {
        self.version += 1;
        let atid = self.version;
        debug!("anchortable destroy_prepare {} atid {} from {}", ino, atid, reqmds);
        self.pending.insert(atid, PendingOp::Destroy { ino });
        atid
    }

    /// Prepare replacement of `ino`'s anchor trace. Returns the
    /// transaction id.
    pub fn update_prepare(
        &mut self,
        ino: InodeNo,
        trace: Vec<Anchor>,
        reqmds: NodeId,
    ) -> AnchorTxnId {
        self.version += 1;
        let atid = self.version;
        debug!("anchortable update_prepare {} atid {} from {}", ino, atid, reqmds);
        self.pending.insert(atid, PendingOp::Update { ino, trace });
        atid
    }

    /// Commit a prepared transaction.
    pub fn commit(&mut self, atid: AnchorTxnId) {
        self.version += 1;
        match self.pending.remove(&atid) {
            Some(PendingOp::Create { ino, trace }) | Some(PendingOp::Update { ino, trace }) => {
                debug!("anchortable commit atid {} anchoring {}", atid, ino);
                self.anchors.insert(ino, trace);
            }
            Some(PendingOp::Destroy { ino }) => {
                debug!("anchortable commit atid {} removing {}", atid, ino);
                self.anchors.remove(&ino);
            }
            None => {
                debug!("anchortable commit atid {} with no pending op", atid);
            }
        }
    }

    /// Ask for the table to be flushed; `cb` fires once the version at
    /// the time of the call is durable.
    pub fn save(&mut self, cb: Completion) {
        self.save_waiters.push((self.version, cb));
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

    #[must_use]
    pub fn get_anchor_trace(&self, ino: InodeNo) -> Option<&Vec<Anchor>> {
        self.anchors.get(&ino)
    }
}

/// The per-MDS anchor transaction client.
#[derive(Default)]
pub struct AnchorClient {
    /// Transactions journaled locally, awaiting the table's ack.
    pending_commit: HashSet<AnchorTxnId>,
    /// Transactions the table has durably acknowledged.
    committed: HashSet<AnchorTxnId>,
    ack_waiters: HashMap<AnchorTxnId, Vec<Completion>>,
}

impl AnchorClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn has_committed(&self, atid: AnchorTxnId) -> bool {
        self.committed.contains(&atid)
    }

    pub fn wait_for_ack(&mut self, atid: AnchorTxnId, cb: Completion) {
        self.ack_waiters.entry(atid).or_default().push(cb);
    }

    /// Our agreement to `atid` hit the local journal.
    pub fn got_journaled_agree(&mut self, atid: AnchorTxnId) {
        debug!("anchorclient journaled agree for atid {}", atid);
        self.pending_commit.insert(atid);
    }

    /// The table's ack for `atid` hit the local journal: the transaction
    /// is committed from this node's point of view.
    pub fn got_journaled_ack(&mut self, atid: AnchorTxnId) {
        debug!("anchorclient journaled ack for atid {}", atid);
        self.pending_commit.remove(&atid);
        self.committed.insert(atid);
        if let Some(waiters) = self.ack_waiters.remove(&atid) {
            for cb in waiters {
                cb();
            }
        }
    }
}
