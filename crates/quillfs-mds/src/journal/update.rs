//! Transaction wrapper events
//!
//! `EUpdate` journals a local transaction; `ESlaveUpdate` is this node's
//! half of a two-phase transaction mastered elsewhere; `EOpen` keeps
//! inodes with outstanding client capabilities reconstructible.

use crate::completion::Completion;
use crate::journal::MetaBlob;
use crate::mds::Mds;
use quillfs_common::{Error, InodeNo, LogOffset, RequestId, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A local metadata transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EUpdate {
    /// What kind of operation this was, for humans reading the log.
    pub desc: String,
    pub metablob: MetaBlob,
}

impl EUpdate {
    #[must_use]
    pub fn new(desc: impl Into<String>, metablob: MetaBlob) -> Self {
        Self {
            desc: desc.into(),
            metablob,
        }
    }

    pub fn has_expired(&self, mds: &Mds) -> bool {
        self.metablob.has_expired(mds)
    }

    pub fn expire(&self, mds: &mut Mds, c: Completion) -> Result<()> {
        self.metablob.expire(mds, c)
    }

    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        debug!("EUpdate.replay {}", self.desc);
        self.metablob.replay(mds)
    }
}

/// Phase of a slave transaction.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum SlaveOp {
    Prepare,
    Commit,
    Abort,
}

/// This node's participation in a transaction mastered by another MDS.
///
/// A replayed `Prepare` parks its blob until the master's outcome is
/// known; `Commit` applies the parked blob, `Abort` discards it. Either
/// may arrive without the prepare if the prepare was already trimmed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ESlaveUpdate {
    pub reqid: RequestId,
    pub op: SlaveOp,
    pub metablob: MetaBlob,
}

impl ESlaveUpdate {
    #[must_use]
    pub fn new(reqid: RequestId, op: SlaveOp, metablob: MetaBlob) -> Self {
        Self {
            reqid,
            op,
            metablob,
        }
    }

    pub fn has_expired(&self, mds: &Mds) -> bool {
        self.metablob.has_expired(mds)
    }

    pub fn expire(&self, mds: &mut Mds, c: Completion) -> Result<()> {
        self.metablob.expire(mds, c)
    }

    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        match self.op {
            SlaveOp::Prepare => {
                debug!("ESlaveUpdate.replay prepare {}: saving blob for later commit", self.reqid);
                if mds.cache.uncommitted_slave_updates.contains_key(&self.reqid) {
                    return Err(Error::DuplicateSlavePrepare(self.reqid));
                }
                mds.cache
                    .uncommitted_slave_updates
                    .insert(self.reqid, self.metablob.clone());
            }
            SlaveOp::Commit => {
                if let Some(blob) = mds.cache.uncommitted_slave_updates.remove(&self.reqid) {
                    debug!("ESlaveUpdate.replay commit {}: applying previously saved blob", self.reqid);
                    blob.replay(mds)?;
                } else {
                    debug!("ESlaveUpdate.replay commit {}: ignoring, no previously saved blob", self.reqid);
                }
            }
            SlaveOp::Abort => {
                if mds.cache.uncommitted_slave_updates.remove(&self.reqid).is_some() {
                    debug!("ESlaveUpdate.replay abort {}: discarding previously saved blob", self.reqid);
                } else {
                    debug!("ESlaveUpdate.replay abort {}: ignoring, no previously saved blob", self.reqid);
                }
            }
        }
        Ok(())
    }
}

/// Records inodes whose client capabilities were opened, so a crash can
/// reconstruct them. The entry pins the tail while any of its inodes
/// still hold caps and no newer open record covers them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EOpen {
    pub metablob: MetaBlob,
    pub inos: Vec<InodeNo>,
}

impl EOpen {
    #[must_use]
    pub fn new(metablob: MetaBlob, inos: Vec<InodeNo>) -> Self {
        Self { metablob, inos }
    }

    pub fn has_expired(&self, mds: &Mds, start_off: LogOffset) -> bool {
        for ino in &self.inos {
            if let Some(inode) = mds.cache.get_inode(*ino) {
                if inode.is_any_caps()
                    && !(inode.last_open_journaled > start_off || inode.last_open_journaled == 0)
                {
                    debug!("EOpen.has_expired still refer to caps on {}", ino);
                    return false;
                }
            }
        }
        true
    }

    pub fn expire(&self, mds: &mut Mds, c: Completion) -> Result<()> {
        debug!("EOpen.expire");

        if mds.log.is_capped() {
            // shutdown should have flushed every cap first
            return Err(Error::CappedLogWithOpens);
        }

        for ino in &self.inos {
            let Some(inode) = mds.cache.get_inode(*ino) else {
                continue;
            };
            if !inode.is_any_caps() {
                continue;
            }
            debug!(
                "EOpen.expire {} last_open_journaled {}",
                ino, inode.last_open_journaled
            );
            mds.server.queue_journal_open(*ino);
        }
        mds.server.add_journal_open_waiter(c);
        mds.maybe_journal_opens()
    }

    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        debug!("EOpen.replay");
        self.metablob.replay(mds)
    }
}
