//! Subtree-authority events
//!
//! `EImportMap` is the periodic checkpoint of which subtrees this node
//! is authoritative for; the others journal the hand-off protocol:
//! `EExport` when giving a subtree away, `EImportStart`/`EImportFinish`
//! when accepting one.

use crate::completion::Completion;
use crate::journal::MetaBlob;
use crate::mds::Mds;
use quillfs_common::{Authority, DirfragId, Error, LogOffset, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Checkpoint: a spanning tree of the auth subtrees plus the set of
/// dirfrags rooted here. Expires only once a newer map is written past
/// it (or the log is capped).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EImportMap {
    pub metablob: MetaBlob,
    pub imports: BTreeSet<DirfragId>,
}

impl EImportMap {
    #[must_use]
    pub fn new(metablob: MetaBlob, imports: BTreeSet<DirfragId>) -> Self {
        Self { metablob, imports }
    }

    pub fn has_expired(&self, mds: &Mds, end_off: LogOffset) -> bool {
        if mds.log.last_import_map() > end_off {
            debug!("EImportMap.has_expired: there is a newer map");
            true
        } else if mds.log.is_capped() {
            debug!("EImportMap.has_expired: log is capped, allowing map to expire");
            true
        } else {
            debug!("EImportMap.has_expired: not until a newer map is written");
            false
        }
    }

    // A flush follow-up (re-submitting a map when this one is not last
    // in the log) would tighten expiry; not needed for correctness.
    pub fn expire(&self, mds: &mut Mds, c: Completion) -> Result<()> {
        debug!("EImportMap.expire: waiting for a newer map (or shutdown)");
        mds.log.add_import_map_expire_waiter(c);
        Ok(())
    }

    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        if mds.cache.is_subtrees() {
            debug!("EImportMap.replay: ignoring, already have subtrees");
        } else {
            debug!("EImportMap.replay: reconstructing auth subtree spanning tree");
            self.metablob.replay(mds)?;
            let node = mds.node_id();
            for dirfrag in &self.imports {
                mds.cache.adjust_subtree_auth(*dirfrag, node);
            }
        }
        mds.cache.log_subtrees();
        Ok(())
    }
}

/// Journaled when a subtree was handed to another node. The embedded
/// blob is the final snapshot of the exported state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EExport {
    pub metablob: MetaBlob,
    pub base: DirfragId,
    pub bounds: BTreeSet<DirfragId>,
}

impl EExport {
    #[must_use]
    pub fn new(metablob: MetaBlob, base: DirfragId, bounds: BTreeSet<DirfragId>) -> Self {
        Self {
            metablob,
            base,
            bounds,
        }
    }

    pub fn has_expired(&self, mds: &Mds) -> bool {
        let Some(dir) = mds.cache.get_dirfrag(self.base) else {
            return true;
        };
        if !mds.migrator.is_exporting(self.base) {
            return true;
        }
        debug!("EExport.has_expired still exporting {}", dir.id);
        false
    }

    pub fn expire(&self, mds: &mut Mds, c: Completion) -> Result<()> {
        if mds.cache.get_dirfrag(self.base).is_none() {
            return Err(Error::MissingDirfrag(self.base));
        }
        debug!("EExport.expire waiting for export of {}", self.base);
        mds.migrator.add_export_finish_waiter(self.base, c);
        Ok(())
    }

    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        debug!("EExport.replay {}", self.base);
        self.metablob.replay(mds)?;

        if mds.cache.get_dirfrag(self.base).is_none() {
            return Err(Error::MissingDirfrag(self.base));
        }
        let mut bounds = Vec::with_capacity(self.bounds.len());
        for bound in &self.bounds {
            if mds.cache.get_dirfrag(*bound).is_none() {
                return Err(Error::MissingDirfrag(*bound));
            }
            bounds.push(*bound);
        }

        // the subtree is no longer ours; who owns it now is unknown
        mds.cache
            .adjust_bounded_subtree_auth(self.base, &bounds, Authority::unknown());
        mds.cache.try_subtree_merge(self.base);
        Ok(())
    }
}

/// Journaled on accepting a subtree, before the outcome is known.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EImportStart {
    pub metablob: MetaBlob,
    pub base: DirfragId,
    pub bounds: BTreeSet<DirfragId>,
}

impl EImportStart {
    #[must_use]
    pub fn new(metablob: MetaBlob, base: DirfragId, bounds: BTreeSet<DirfragId>) -> Self {
        Self {
            metablob,
            base,
            bounds,
        }
    }

    pub fn has_expired(&self, mds: &Mds) -> bool {
        self.metablob.has_expired(mds)
    }

    pub fn expire(&self, mds: &mut Mds, c: Completion) -> Result<()> {
        debug!("EImportStart.expire {}", self.base);
        self.metablob.expire(mds, c)
    }

    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        debug!("EImportStart.replay {}", self.base);
        self.metablob.replay(mds)?;
        mds.cache
            .add_ambiguous_import(self.base, self.bounds.iter().copied().collect());
        Ok(())
    }
}

/// Resolution of a started import. Trivially trimmable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EImportFinish {
    pub base: DirfragId,
    pub bounds: BTreeSet<DirfragId>,
    pub success: bool,
}

impl EImportFinish {
    #[must_use]
    pub fn new(base: DirfragId, bounds: BTreeSet<DirfragId>, success: bool) -> Self {
        Self {
            base,
            bounds,
            success,
        }
    }

    pub fn has_expired(&self, _mds: &Mds) -> bool {
        true
    }

    pub fn expire(&self, _mds: &mut Mds, _c: Completion) -> Result<()> {
        Err(Error::IllegalExpire)
    }

    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        debug!("EImportFinish.replay {} success={}", self.base, self.success);
        if self.success {
            mds.cache.finish_ambiguous_import(self.base);
        } else {
            mds.cache.cancel_ambiguous_import(self.base);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalEvent;
    use crate::test_util::flag;
    use quillfs_common::{
        Frag, InodeKind, InodeNo, InodeRecord, MdsConfig, NodeId, ROOT_INO,
    };

    fn mds() -> Mds {
        Mds::new(MdsConfig::default())
    }

    fn root_df() -> DirfragId {
        DirfragId::whole(ROOT_INO)
    }

    /// Spanning-tree blob: root dirfrag with /sub -> dir inode 20.
    fn spanning_blob() -> (MetaBlob, DirfragId) {
        let mut blob = MetaBlob::new();
        blob.add_dir(root_df(), 1, false, false);
        blob.add_full_dentry(
            root_df(),
            "sub",
            1,
            false,
            InodeRecord::new(InodeNo(20), InodeKind::Dir),
            None,
        );
        let sub = DirfragId::whole(InodeNo(20));
        blob.add_dir(sub, 1, false, false);
        (blob, sub)
    }

    #[test]
    fn test_import_map_replay_reconstructs_subtrees() {
        let mut m = mds();
        let (blob, sub) = spanning_blob();
        let mut imports = BTreeSet::new();
        imports.insert(root_df());
        imports.insert(sub);

        let e = EImportMap::new(blob, imports);
        e.replay(&mut m).unwrap();

        assert!(m.cache.is_subtrees());
        assert_eq!(
            m.cache.get_dirfrag(root_df()).unwrap().authority(),
            Authority::single(NodeId(0))
        );
        assert_eq!(
            m.cache.get_dirfrag(sub).unwrap().authority(),
            Authority::single(NodeId(0))
        );
    }

    #[test]
    fn test_import_map_replay_ignored_when_subtrees_exist() {
        let mut m = mds();
        m.cache.create_root_inode();
        let df = m.cache.get_or_open_dirfrag(ROOT_INO, Frag::WHOLE).unwrap().id;
        m.cache.adjust_subtree_auth(df, NodeId(5));

        let (blob, _) = spanning_blob();
        let mut imports = BTreeSet::new();
        imports.insert(root_df());
        EImportMap::new(blob, imports).replay(&mut m).unwrap();

        // the existing subtree map wins
        assert_eq!(
            m.cache.get_dirfrag(df).unwrap().authority(),
            Authority::single(NodeId(5))
        );
    }

    #[test]
    fn test_import_map_expires_behind_newer_map() {
        let mut m = mds();
        let (blob, _) = spanning_blob();
        let e = EImportMap::new(blob.clone(), BTreeSet::new());
        let end = m
            .log
            .submit(JournalEvent::ImportMap(e.clone()))
            .unwrap();
        assert!(!e.has_expired(&m, end));

        // expire parks on the checkpoint waiter list; a newer map fires it
        let (cb, fired) = flag();
        e.expire(&mut m, cb).unwrap();
        assert!(!fired.get());

        m.log
            .submit(JournalEvent::ImportMap(EImportMap::new(blob, BTreeSet::new())))
            .unwrap();
        assert!(fired.get());
        assert!(e.has_expired(&m, end));
    }

    #[test]
    fn test_import_map_expires_when_capped() {
        let mut m = mds();
        let (blob, _) = spanning_blob();
        let e = EImportMap::new(blob, BTreeSet::new());
        let end = m
            .log
            .submit(JournalEvent::ImportMap(e.clone()))
            .unwrap();
        assert!(!e.has_expired(&m, end));
        m.log.cap();
        assert!(e.has_expired(&m, end));
    }

    #[test]
    fn test_export_replay_relinquishes_authority() {
        let mut m = mds();
        let (blob, sub) = spanning_blob();
        let mut imports = BTreeSet::new();
        imports.insert(root_df());
        imports.insert(sub);
        EImportMap::new(blob.clone(), imports).replay(&mut m).unwrap();

        let e = EExport::new(blob, sub, BTreeSet::new());
        e.replay(&mut m).unwrap();
        assert_eq!(
            m.cache.get_dirfrag(sub).unwrap().authority(),
            Authority::unknown()
        );
    }

    #[test]
    fn test_export_expiry_follows_migrator() {
        let mut m = mds();
        let (blob, sub) = spanning_blob();
        blob.replay(&mut m).unwrap();

        let e = EExport::new(MetaBlob::new(), sub, BTreeSet::new());
        // not exporting (already finished): expired
        assert!(e.has_expired(&m));

        m.migrator.begin_export(sub);
        assert!(!e.has_expired(&m));

        let (cb, fired) = flag();
        e.expire(&mut m, cb).unwrap();
        m.migrator.finish_export(sub);
        assert!(fired.get());
        assert!(e.has_expired(&m));
    }

    #[test]
    fn test_export_gone_dirfrag_is_expired() {
        let m = mds();
        let e = EExport::new(MetaBlob::new(), DirfragId::whole(InodeNo(99)), BTreeSet::new());
        assert!(e.has_expired(&m));
    }

    #[test]
    fn test_import_start_parks_ambiguous_import() {
        let mut m = mds();
        let (blob, sub) = spanning_blob();
        let e = EImportStart::new(blob, sub, BTreeSet::new());
        e.replay(&mut m).unwrap();
        assert!(m.cache.is_ambiguous_import(sub));
    }

    #[test]
    fn test_import_finish_success_claims_subtree() {
        let mut m = mds();
        let (blob, sub) = spanning_blob();
        EImportStart::new(blob, sub, BTreeSet::new())
            .replay(&mut m)
            .unwrap();

        let e = EImportFinish::new(sub, BTreeSet::new(), true);
        assert!(e.has_expired(&m));
        e.replay(&mut m).unwrap();
        assert!(!m.cache.is_ambiguous_import(sub));
        assert_eq!(
            m.cache.get_dirfrag(sub).unwrap().authority(),
            Authority::single(NodeId(0))
        );
    }

    #[test]
    fn test_import_finish_failure_cancels() {
        let mut m = mds();
        let (blob, sub) = spanning_blob();
        EImportStart::new(blob, sub, BTreeSet::new())
            .replay(&mut m)
            .unwrap();

        EImportFinish::new(sub, BTreeSet::new(), false)
            .replay(&mut m)
            .unwrap();
        assert!(!m.cache.is_ambiguous_import(sub));
    }

    #[test]
    fn test_import_finish_expire_is_fatal() {
        let mut m = mds();
        let e = EImportFinish::new(root_df(), BTreeSet::new(), true);
        let (cb, _) = flag();
        assert!(matches!(e.expire(&mut m, cb), Err(Error::IllegalExpire)));
    }
}
