//! Versioned table events
//!
//! `EAlloc` and `EAnchor` stamp one table mutation each with the table
//! version it produced. They expire once the table's durably committed
//! version catches up, and replay asserts strict increment-by-one
//! sequencing against the live table.

use crate::completion::Completion;
use crate::mds::Mds;
use crate::anchor::Anchor;
use quillfs_common::{AnchorTxnId, Error, InodeNo, NodeId, Result, Version};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What an id-allocator event did.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum AllocOp {
    Alloc,
    Free,
}

/// One id-allocator table mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EAlloc {
    pub table_version: Version,
    pub op: AllocOp,
    pub id: u64,
}

impl EAlloc {
    #[must_use]
    pub fn new(table_version: Version, op: AllocOp, id: u64) -> Self {
        Self {
            table_version,
            op,
            id,
        }
    }

    pub fn has_expired(&self, mds: &Mds) -> bool {
        let cv = mds.idalloc.get_committed_version();
        if cv < self.table_version {
            debug!("EAlloc.has_expired v{} > {}, still dirty", self.table_version, cv);
            false
        } else {
            debug!("EAlloc.has_expired v{} <= {}, already flushed", self.table_version, cv);
            true
        }
    }

    pub fn expire(&self, mds: &mut Mds, c: Completion) -> Result<()> {
        debug!("EAlloc.expire saving idalloc table");
        mds.idalloc.save(c, self.table_version);
        Ok(())
    }

    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        let table = mds.idalloc.get_version();
        if table >= self.table_version {
            debug!("EAlloc.replay event v{} <= table v{}", self.table_version, table);
            return Ok(());
        }
        if self.table_version != table + 1 {
            return Err(Error::TableVersionGap {
                table,
                event: self.table_version,
            });
        }
        match self.op {
            AllocOp::Alloc => {
                // the allocator is deterministic across replay
                let id = mds.idalloc.alloc_id();
                if id != self.id {
                    return Err(Error::AllocReplayMismatch {
                        recorded: self.id,
                        got: id,
                    });
                }
            }
            AllocOp::Free => {
                mds.idalloc.reclaim_id(self.id);
            }
        }
        debug_assert_eq!(mds.idalloc.get_version(), self.table_version);
        Ok(())
    }
}

/// What an anchor-table event did. Prepares carry the payload the table
/// needs to reserve the change; commit names the transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AnchorOp {
    CreatePrepare {
        ino: InodeNo,
        trace: Vec<Anchor>,
        reqmds: NodeId,
    },
    DestroyPrepare {
        ino: InodeNo,
        reqmds: NodeId,
    },
    UpdatePrepare {
        ino: InodeNo,
        trace: Vec<Anchor>,
        reqmds: NodeId,
    },
    Commit {
        atid: AnchorTxnId,
    },
}

/// One anchor-table mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EAnchor {
    pub version: Version,
    pub op: AnchorOp,
}

impl EAnchor {
    #[must_use]
    pub fn new(version: Version, op: AnchorOp) -> Self {
        Self { version, op }
    }

    pub fn has_expired(&self, mds: &Mds) -> bool {
        let cv = mds.anchor_table.get_committed_version();
        if cv < self.version {
            debug!("EAnchor.has_expired v{} > {}, still dirty", self.version, cv);
            false
        } else {
            debug!("EAnchor.has_expired v{} <= {}, already flushed", self.version, cv);
            true
        }
    }

    pub fn expire(&self, mds: &mut Mds, c: Completion) -> Result<()> {
        debug!("EAnchor.expire saving anchor table");
        mds.anchor_table.save(c);
        Ok(())
    }

    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        let table = mds.anchor_table.get_version();
        if table >= self.version {
            debug!("EAnchor.replay event v{} <= table v{}", self.version, table);
            return Ok(());
        }
        if self.version != table + 1 {
            return Err(Error::TableVersionGap {
                table,
                event: self.version,
            });
        }
        match &self.op {
            AnchorOp::CreatePrepare { ino, trace, reqmds } => {
                mds.anchor_table.create_prepare(*ino, trace.clone(), *reqmds);
            }
            AnchorOp::DestroyPrepare { ino, reqmds } => {
                mds.anchor_table.destroy_prepare(*ino, *reqmds);
            }
            AnchorOp::UpdatePrepare { ino, trace, reqmds } => {
                mds.anchor_table.update_prepare(*ino, trace.clone(), *reqmds);
            }
            AnchorOp::Commit { atid } => {
                mds.anchor_table.commit(*atid);
            }
        }
        debug_assert_eq!(mds.anchor_table.get_version(), self.version);
        Ok(())
    }
}

/// What an anchor-client event did.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum AnchorClientOp {
    Ack,
}

/// The anchor client journaled a table ack. Never blocks trimming.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EAnchorClient {
    pub op: AnchorClientOp,
    pub atid: AnchorTxnId,
}

impl EAnchorClient {
    #[must_use]
    pub fn new(op: AnchorClientOp, atid: AnchorTxnId) -> Self {
        Self { op, atid }
    }

    pub fn has_expired(&self, _mds: &Mds) -> bool {
        true
    }

    pub fn expire(&self, _mds: &mut Mds, _c: Completion) -> Result<()> {
        Err(Error::IllegalExpire)
    }

    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        debug!("EAnchorClient.replay ack atid {}", self.atid);
        match self.op {
            AnchorClientOp::Ack => mds.anchor_client.got_journaled_ack(self.atid),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::flag;
    use quillfs_common::{DirfragId, MdsConfig, ROOT_INO};

    fn mds() -> Mds {
        Mds::new(MdsConfig::default())
    }

    fn trace(ino: u64) -> Vec<Anchor> {
        vec![Anchor {
            ino: InodeNo(ino),
            dirfrag: DirfragId::whole(ROOT_INO),
            nref: 1,
        }]
    }

    #[test]
    fn test_alloc_replay_at_gap_one_matches_recorded_id() {
        // a fresh table replaying journaled history lands on the same ids
        let mut m = mds();
        for v in 1..=7 {
            EAlloc::new(v, AllocOp::Alloc, 0x1000 + v - 1)
                .replay(&mut m)
                .unwrap();
        }
        assert_eq!(m.idalloc.get_version(), 7);

        // the canonical boundary case: table at v7, event {v8, ALLOC}
        EAlloc::new(8, AllocOp::Alloc, 0x1007).replay(&mut m).unwrap();
        assert_eq!(m.idalloc.get_version(), 8);
    }

    #[test]
    fn test_alloc_replay_mismatch_is_fatal() {
        let mut m = mds();
        let e = EAlloc::new(1, AllocOp::Alloc, 9999);
        assert!(matches!(
            e.replay(&mut m),
            Err(Error::AllocReplayMismatch { recorded: 9999, .. })
        ));
    }

    #[test]
    fn test_alloc_replay_stale_event_is_noop() {
        let mut m = mds();
        let id = m.idalloc.alloc_id();
        let e = EAlloc::new(1, AllocOp::Alloc, id);
        // table already at v1; nothing to do
        e.replay(&mut m).unwrap();
        assert_eq!(m.idalloc.get_version(), 1);
    }

    #[test]
    fn test_alloc_replay_version_gap_is_fatal() {
        let mut m = mds();
        let e = EAlloc::new(3, AllocOp::Alloc, 0x1000);
        assert!(matches!(
            e.replay(&mut m),
            Err(Error::TableVersionGap { table: 0, event: 3 })
        ));
    }

    #[test]
    fn test_alloc_free_replay_reclaims() {
        let mut m = mds();
        let id = m.idalloc.alloc_id();
        let e = EAlloc::new(2, AllocOp::Free, id);
        e.replay(&mut m).unwrap();
        assert_eq!(m.idalloc.get_version(), 2);
        // the freed id is handed out again next
        assert_eq!(m.idalloc.alloc_id(), id);
    }

    #[test]
    fn test_alloc_expiry_follows_committed_version() {
        let mut m = mds();
        let id = m.idalloc.alloc_id();
        let e = EAlloc::new(1, AllocOp::Alloc, id);
        assert!(!e.has_expired(&m));

        let (cb, fired) = flag();
        e.expire(&mut m, cb).unwrap();
        assert!(!fired.get());
        m.idalloc.mark_saved();
        assert!(fired.get());
        assert!(e.has_expired(&m));
    }

    #[test]
    fn test_anchor_replay_prepare_then_commit() {
        let mut m = mds();
        EAnchor::new(
            1,
            AnchorOp::CreatePrepare {
                ino: InodeNo(30),
                trace: trace(30),
                reqmds: NodeId(1),
            },
        )
        .replay(&mut m)
        .unwrap();
        assert_eq!(m.anchor_table.get_version(), 1);

        EAnchor::new(2, AnchorOp::Commit { atid: 1 })
            .replay(&mut m)
            .unwrap();
        assert_eq!(m.anchor_table.get_version(), 2);
        assert!(m.anchor_table.get_anchor_trace(InodeNo(30)).is_some());
    }

    #[test]
    fn test_anchor_replay_version_gap_is_fatal() {
        let mut m = mds();
        let e = EAnchor::new(5, AnchorOp::Commit { atid: 1 });
        assert!(matches!(
            e.replay(&mut m),
            Err(Error::TableVersionGap { table: 0, event: 5 })
        ));
    }

    #[test]
    fn test_anchor_expiry_follows_committed_version() {
        let mut m = mds();
        m.anchor_table.create_prepare(InodeNo(30), trace(30), NodeId(0));
        let e = EAnchor::new(1, AnchorOp::Commit { atid: 1 });
        assert!(!e.has_expired(&m));
        m.anchor_table.commit(1);
        m.anchor_table.mark_saved();
        assert!(e.has_expired(&m));
    }

    #[test]
    fn test_anchor_client_ack_replay() {
        let mut m = mds();
        m.anchor_client.got_journaled_agree(4);
        assert!(!m.anchor_client.has_committed(4));

        let e = EAnchorClient::new(AnchorClientOp::Ack, 4);
        assert!(e.has_expired(&m));
        e.replay(&mut m).unwrap();
        assert!(m.anchor_client.has_committed(4));
    }

    #[test]
    fn test_anchor_client_expire_is_fatal() {
        let mut m = mds();
        let e = EAnchorClient::new(AnchorClientOp::Ack, 4);
        let (cb, _) = flag();
        assert!(matches!(e.expire(&mut m, cb), Err(Error::IllegalExpire)));
    }
}
