//! The composite metadata payload
//!
//! A `MetaBlob` describes the dirty state a transaction touched: whole
//! dirfrags with their changed dentries, anchor transactions it took part
//! in, truncations it started, and client requests whose completion
//! tracking must outlive it. Several event kinds embed one by value.
//!
//! A journaled blob has expired once every piece of that state is safe
//! without it: each dirfrag either committed past the blob's version or
//! became some other node's problem, each anchor transaction committed,
//! each truncation finished purging, and each completed-request record
//! was trimmed.

use crate::cache::Inode;
use crate::completion::{Completion, Gather};
use crate::mds::Mds;
use quillfs_common::{
    AnchorTxnId, Authority, DirfragId, Error, InodeNo, InodeRecord, RequestId, Result, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Full dentry + inode snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FullBit {
    pub name: String,
    pub version: Version,
    pub dirty: bool,
    pub inode: InodeRecord,
    pub symlink: Option<String>,
}

/// Dentry pointing at an inode whose primary link lives elsewhere.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteBit {
    pub name: String,
    pub version: Version,
    pub dirty: bool,
    pub ino: InodeNo,
}

/// Negative dentry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NullBit {
    pub name: String,
    pub version: Version,
    pub dirty: bool,
}

/// One dirfrag's worth of journaled state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DirLump {
    /// Dirfrag version this lump carries the dirfrag to.
    pub dirv: Version,
    pub dirty: bool,
    pub complete: bool,
    pub full: Vec<FullBit>,
    pub remote: Vec<RemoteBit>,
    pub null: Vec<NullBit>,
}

/// The composite payload. Lump order is parent-before-child and replay
/// preserves it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetaBlob {
    lump_order: Vec<DirfragId>,
    lump_map: BTreeMap<DirfragId, DirLump>,
    atids: Vec<AnchorTxnId>,
    truncated_inodes: Vec<(InodeRecord, u64)>,
    client_reqs: Vec<RequestId>,
}

impl MetaBlob {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or revisit) a lump for `dirfrag`. The recorded target
    /// version is the maximum seen across calls.
    pub fn add_dir(
        &mut self,
        dirfrag: DirfragId,
        dirv: Version,
        dirty: bool,
        complete: bool,
    ) -> &mut DirLump {
        if !self.lump_map.contains_key(&dirfrag) {
            self.lump_order.push(dirfrag);
        }
        let lump = self.lump_map.entry(dirfrag).or_default();
        lump.dirv = lump.dirv.max(dirv);
        lump.dirty |= dirty;
        lump.complete |= complete;
        lump
    }

    pub fn add_full_dentry(
        &mut self,
        dirfrag: DirfragId,
        name: &str,
        version: Version,
        dirty: bool,
        inode: InodeRecord,
        symlink: Option<String>,
    ) {
        let lump = self.lump_map.entry(dirfrag).or_default();
        if !self.lump_order.contains(&dirfrag) {
            self.lump_order.push(dirfrag);
        }
        lump.full.push(FullBit {
            name: name.to_string(),
            version,
            dirty,
            inode,
            symlink,
        });
    }

    pub fn add_remote_dentry(
        &mut self,
        dirfrag: DirfragId,
        name: &str,
        version: Version,
        dirty: bool,
        ino: InodeNo,
    ) {
        let lump = self.lump_map.entry(dirfrag).or_default();
        if !self.lump_order.contains(&dirfrag) {
            self.lump_order.push(dirfrag);
        }
        lump.remote.push(RemoteBit {
            name: name.to_string(),
            version,
            dirty,
            ino,
        });
    }

    pub fn add_null_dentry(
        &mut self,
        dirfrag: DirfragId,
        name: &str,
        version: Version,
        dirty: bool,
    ) {
        let lump = self.lump_map.entry(dirfrag).or_default();
        if !self.lump_order.contains(&dirfrag) {
            self.lump_order.push(dirfrag);
        }
        lump.null.push(NullBit {
            name: name.to_string(),
            version,
            dirty,
        });
    }

    pub fn add_anchor_txn(&mut self, atid: AnchorTxnId) {
        self.atids.push(atid);
    }

    pub fn add_truncated_inode(&mut self, rec: InodeRecord, size: u64) {
        self.truncated_inodes.push((rec, size));
    }

    pub fn add_client_request(&mut self, reqid: RequestId) {
        self.client_reqs.push(reqid);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lump_order.is_empty()
            && self.atids.is_empty()
            && self.truncated_inodes.is_empty()
            && self.client_reqs.is_empty()
    }

    #[must_use]
    pub fn lumps(&self) -> impl Iterator<Item = (&DirfragId, &DirLump)> {
        self.lump_map.iter()
    }

    /// True only once every journaled piece of state is safe without
    /// this blob. A dirfrag absent from the cache counts as safe: it was
    /// flushed before being trimmed from cache.
    #[must_use]
    pub fn has_expired(&self, mds: &Mds) -> bool {
        for (id, lump) in &self.lump_map {
            let Some(dir) = mds.cache.get_dirfrag(*id) else {
                continue; // we expired it
            };

            if dir.authority().primary != Some(mds.node_id()) {
                debug!(
                    "MetaBlob.has_expired not auth, needed dirv {} for {}",
                    lump.dirv, id
                );
                continue; // not our problem
            }
            if dir.committed_version() >= lump.dirv {
                debug!("MetaBlob.has_expired have dirv {} for {}", lump.dirv, id);
                continue;
            }

            if dir.is_ambiguous_auth() {
                // an export or import is in flight; responsibility for
                // flushing may move, so the entry must stay
                let root = mds.cache.get_subtree_root(*id);
                if mds.migrator.is_exporting(root) {
                    debug!(
                        "MetaBlob.has_expired ambiguous auth for {}, exporting on {}",
                        id, root
                    );
                } else {
                    debug!(
                        "MetaBlob.has_expired ambiguous auth for {}, importing on {}",
                        id, root
                    );
                }
                return false;
            }

            debug!("MetaBlob.has_expired need dirv {} for {}", lump.dirv, id);
            return false; // not committed
        }

        for atid in &self.atids {
            if !mds.anchor_client.has_committed(*atid) {
                debug!(
                    "MetaBlob.has_expired anchor transaction {} not yet acked",
                    atid
                );
                return false;
            }
        }

        for (rec, size) in &self.truncated_inodes {
            if mds.cache.is_purging(rec.ino, *size) {
                debug!(
                    "MetaBlob.has_expired still purging inode {} to {}",
                    rec.ino, size
                );
                return false;
            }
        }

        for reqid in &self.client_reqs {
            if mds.clientmap.have_completed_request(*reqid) {
                debug!("MetaBlob.has_expired still have completed request {}", reqid);
                return false;
            }
        }

        true
    }

    /// Gather one sub-completion per unmet condition; `c` fires once all
    /// of them do.
    pub fn expire(&self, mds: &mut Mds, c: Completion) -> Result<()> {
        let mut commit: BTreeMap<DirfragId, Version> = BTreeMap::new();
        let mut waitfor_export = Vec::new();
        let mut waitfor_import = Vec::new();

        for (id, lump) in &self.lump_map {
            let Some(dir) = mds.cache.get_dirfrag(*id) else {
                continue; // we expired it
            };

            if dir.authority().primary != Some(mds.node_id()) {
                debug!("MetaBlob.expire not auth, needed dirv {} for {}", lump.dirv, id);
                continue;
            }
            if dir.committed_version() >= lump.dirv {
                debug!("MetaBlob.expire have dirv {} on {}", lump.dirv, id);
                continue;
            }

            if dir.is_ambiguous_auth() {
                let root = mds.cache.get_subtree_root(*id);
                if mds.migrator.is_exporting(root) {
                    // wait until the export is acked remotely and logged
                    debug!(
                        "MetaBlob.expire ambiguous auth for {}, waiting for export finish on {}",
                        id, root
                    );
                    waitfor_export.push(root);
                } else {
                    debug!(
                        "MetaBlob.expire ambiguous auth for {}, waiting for import finish on {}",
                        id, root
                    );
                    waitfor_import.push(root);
                }
                continue;
            }

            debug!("MetaBlob.expire need dirv {}, committing {}", lump.dirv, id);
            let target = commit.entry(*id).or_insert(0);
            *target = (*target).max(lump.dirv);
        }

        let gather = Gather::new(c);

        for (id, version) in commit {
            let Some(dir) = mds.cache.get_dirfrag_mut(id) else {
                continue;
            };
            if dir.can_auth_pin() {
                dir.commit(version, gather.sub());
            } else {
                // about to export, split, or merge; wait out the freeze
                // and retry the commit on the next trim pass
                dir.add_authpin_waiter(gather.sub());
            }
        }
        for root in waitfor_export {
            mds.migrator.add_export_finish_waiter(root, gather.sub());
        }
        for root in waitfor_import {
            if let Some(dir) = mds.cache.get_dirfrag_mut(root) {
                dir.add_imported_waiter(gather.sub());
            }
        }

        for atid in &self.atids {
            if !mds.anchor_client.has_committed(*atid) {
                debug!("MetaBlob.expire anchor transaction {} not yet acked, waiting", atid);
                mds.anchor_client.wait_for_ack(*atid, gather.sub());
            }
        }

        for (rec, size) in &self.truncated_inodes {
            if mds.cache.is_purging(rec.ino, *size) {
                debug!("MetaBlob.expire waiting for purge of inode {} to {}", rec.ino, size);
                mds.cache.wait_for_purge(rec.ino, *size, gather.sub());
            }
        }

        for reqid in &self.client_reqs {
            if mds.clientmap.have_completed_request(*reqid) {
                debug!("MetaBlob.expire waiting on completed request {}", reqid);
                mds.clientmap.add_trim_waiter(*reqid, gather.sub());
            }
        }

        gather.activate();
        Ok(())
    }

    /// Rebuild cache state from this blob, lump by lump in journaled
    /// order.
    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        debug!("MetaBlob.replay {} dirlumps", self.lump_order.len());

        for id in &self.lump_order {
            let Some(lump) = self.lump_map.get(id) else {
                continue;
            };
            debug!("MetaBlob.replay dir {}", id);

            if mds.cache.get_dirfrag(*id).is_none() {
                if mds.cache.get_inode(id.ino).is_none() {
                    let max_nodes = mds.config().max_nodes;
                    if id.ino.is_root() {
                        mds.cache.create_root_inode();
                        debug!("MetaBlob.replay created root {}", id.ino);
                    } else if let Some(owner) = id.ino.stray_owner(max_nodes) {
                        mds.cache.create_stray_inode(owner);
                        debug!("MetaBlob.replay created stray {} for {}", id.ino, owner);
                    } else {
                        return Err(Error::MissingParentInode(id.ino));
                    }
                }
                let dir = mds.cache.get_or_open_dirfrag(id.ino, id.frag)?;
                if id.ino.is_root() {
                    // authority re-established by the next import map
                    dir.set_authority(Authority::unknown());
                }
                debug!("MetaBlob.replay added dir {}", id);
            }

            {
                let dir = mds
                    .cache
                    .get_dirfrag_mut(*id)
                    .ok_or(Error::MissingDirfrag(*id))?;
                dir.version = lump.dirv;
                if lump.dirty {
                    dir.dirty = true;
                }
                if lump.complete {
                    dir.complete = true;
                }
            }

            // full dentry + inode pairs
            for bit in &lump.full {
                {
                    let dir = mds
                        .cache
                        .get_dirfrag_mut(*id)
                        .ok_or(Error::MissingDirfrag(*id))?;
                    let dn = dir.add_dentry(&bit.name);
                    dn.version = bit.version;
                    if bit.dirty {
                        dn.dirty = true;
                    }
                }

                let ino = bit.inode.ino;
                if mds.cache.get_inode(ino).is_none() {
                    let mut inode = Inode::new(bit.inode.clone());
                    if bit.inode.is_symlink() {
                        inode.symlink = bit.symlink.clone();
                    }
                    if bit.dirty {
                        inode.dirty = true;
                    }
                    mds.cache.add_inode(inode);
                    mds.cache.link_primary(*id, &bit.name, ino);
                    debug!("MetaBlob.replay added inode {}", ino);
                } else {
                    let prev = mds.cache.get_inode(ino).and_then(|i| i.parent.clone());
                    if let Some((pdir, pname)) = prev {
                        debug!("MetaBlob.replay unlinking {} from {}", ino, pdir);
                        mds.cache.unlink(pdir, &pname);
                    }
                    if let Some(inode) = mds.cache.get_inode_mut(ino) {
                        inode.rec = bit.inode.clone();
                        if bit.inode.is_symlink() {
                            inode.symlink = bit.symlink.clone();
                        }
                        if bit.dirty {
                            inode.dirty = true;
                        }
                    }
                    mds.cache.link_primary(*id, &bit.name, ino);
                    debug!("MetaBlob.replay linked inode {}", ino);
                }
            }

            // remote dentries
            for bit in &lump.remote {
                let nonnull = mds
                    .cache
                    .get_dirfrag(*id)
                    .and_then(|d| d.lookup(&bit.name))
                    .is_some_and(|dn| !dn.is_null());
                if nonnull {
                    debug!("MetaBlob.replay unlinking {} in {}", bit.name, id);
                    mds.cache.unlink(*id, &bit.name);
                }
                mds.cache.link_remote(*id, &bit.name, bit.ino);
                if let Some(dir) = mds.cache.get_dirfrag_mut(*id) {
                    if let Some(dn) = dir.lookup_mut(&bit.name) {
                        dn.version = bit.version;
                        if bit.dirty {
                            dn.dirty = true;
                        }
                    }
                }
            }

            // null dentries
            for bit in &lump.null {
                let nonnull = mds
                    .cache
                    .get_dirfrag(*id)
                    .and_then(|d| d.lookup(&bit.name))
                    .is_some_and(|dn| !dn.is_null());
                if nonnull {
                    debug!("MetaBlob.replay unlinking {} in {}", bit.name, id);
                    mds.cache.unlink(*id, &bit.name);
                }
                if let Some(dir) = mds.cache.get_dirfrag_mut(*id) {
                    let dn = dir.add_dentry(&bit.name);
                    dn.version = bit.version;
                    if bit.dirty {
                        dn.dirty = true;
                    }
                }
            }
        }

        for atid in &self.atids {
            debug!("MetaBlob.replay noting anchor transaction {}", atid);
            mds.anchor_client.got_journaled_agree(*atid);
        }

        for (rec, size) in &self.truncated_inodes {
            mds.cache.add_recovered_purge(rec.clone(), *size);
        }

        for reqid in &self.client_reqs {
            mds.clientmap.add_completed_request(*reqid);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DentryLink;
    use crate::test_util::flag;
    use quillfs_common::{
        Authority, ClientId, Frag, InodeKind, InodeNo, MdsConfig, NodeId, ROOT_INO,
        STRAY_INO_BASE,
    };

    fn mds() -> Mds {
        Mds::new(MdsConfig::default())
    }

    fn dir_rec(ino: u64) -> InodeRecord {
        InodeRecord::new(InodeNo(ino), InodeKind::Dir)
    }

    fn file_rec(ino: u64) -> InodeRecord {
        InodeRecord::new(InodeNo(ino), InodeKind::File)
    }

    /// Root inode + dirfrag, settled auth on this node.
    fn setup_root(m: &mut Mds) -> DirfragId {
        m.cache.create_root_inode();
        let df = m.cache.get_or_open_dirfrag(ROOT_INO, Frag::WHOLE).unwrap().id;
        m.cache.adjust_subtree_auth(df, m.node_id());
        df
    }

    #[test]
    fn test_replay_sets_dirfrag_version_and_flags() {
        let mut m = mds();
        let df = DirfragId::whole(ROOT_INO);

        let mut blob = MetaBlob::new();
        blob.add_dir(df, 7, true, true);
        blob.replay(&mut m).unwrap();

        let dir = m.cache.get_dirfrag(df).unwrap();
        assert_eq!(dir.version, 7);
        assert!(dir.dirty);
        assert!(dir.complete);
        // root materialized with unknown authority
        assert_eq!(dir.authority(), Authority::unknown());
    }

    #[test]
    fn test_replay_materializes_stray_parent() {
        let mut m = mds();
        let stray = InodeNo(STRAY_INO_BASE + 2);
        let df = DirfragId::whole(stray);

        let mut blob = MetaBlob::new();
        blob.add_dir(df, 1, false, false);
        blob.replay(&mut m).unwrap();
        assert!(m.cache.get_inode(stray).is_some());
        assert!(m.cache.get_dirfrag(df).is_some());
    }

    #[test]
    fn test_replay_unknown_parent_is_fatal() {
        let mut m = mds();
        let df = DirfragId::whole(InodeNo(9999));

        let mut blob = MetaBlob::new();
        blob.add_dir(df, 1, false, false);
        assert!(matches!(
            blob.replay(&mut m),
            Err(Error::MissingParentInode(InodeNo(9999)))
        ));
    }

    #[test]
    fn test_replay_full_bit_links_inode_under_one_parent() {
        let mut m = mds();
        let df = setup_root(&mut m);

        let mut blob = MetaBlob::new();
        blob.add_dir(df, 2, true, false);
        blob.add_full_dentry(df, "a", 1, true, file_rec(100), None);
        blob.replay(&mut m).unwrap();

        assert_eq!(
            m.cache.get_inode(InodeNo(100)).unwrap().parent,
            Some((df, "a".to_string()))
        );

        // a later event moves the inode to /b: the old link is severed
        let mut blob2 = MetaBlob::new();
        blob2.add_dir(df, 3, true, false);
        blob2.add_full_dentry(df, "b", 2, true, file_rec(100), None);
        blob2.replay(&mut m).unwrap();

        let dir = m.cache.get_dirfrag(df).unwrap();
        assert!(dir.lookup("a").unwrap().is_null());
        assert_eq!(dir.lookup("b").unwrap().link, DentryLink::Primary(InodeNo(100)));
        assert_eq!(
            m.cache.get_inode(InodeNo(100)).unwrap().parent,
            Some((df, "b".to_string()))
        );
    }

    #[test]
    fn test_replay_symlink_carries_target() {
        let mut m = mds();
        let df = setup_root(&mut m);

        let rec = InodeRecord::new(InodeNo(50), InodeKind::Symlink);
        let mut blob = MetaBlob::new();
        blob.add_dir(df, 2, true, false);
        blob.add_full_dentry(df, "link", 1, true, rec, Some("/target".into()));
        blob.replay(&mut m).unwrap();

        assert_eq!(
            m.cache.get_inode(InodeNo(50)).unwrap().symlink.as_deref(),
            Some("/target")
        );
    }

    #[test]
    fn test_replay_remote_and_null_bits() {
        let mut m = mds();
        let df = setup_root(&mut m);

        let mut blob = MetaBlob::new();
        blob.add_dir(df, 2, true, false);
        blob.add_full_dentry(df, "x", 1, true, file_rec(100), None);
        blob.replay(&mut m).unwrap();

        // remote overwrite of a primary dentry unlinks first
        let mut blob2 = MetaBlob::new();
        blob2.add_dir(df, 3, true, false);
        blob2.add_remote_dentry(df, "x", 2, true, InodeNo(200));
        blob2.replay(&mut m).unwrap();
        let dir = m.cache.get_dirfrag(df).unwrap();
        assert_eq!(dir.lookup("x").unwrap().link, DentryLink::Remote(InodeNo(200)));
        assert!(m.cache.get_inode(InodeNo(100)).unwrap().parent.is_none());

        // null overwrite of the remote dentry
        let mut blob3 = MetaBlob::new();
        blob3.add_dir(df, 4, true, false);
        blob3.add_null_dentry(df, "x", 3, true);
        blob3.replay(&mut m).unwrap();
        let dir = m.cache.get_dirfrag(df).unwrap();
        assert!(dir.lookup("x").unwrap().is_null());
        assert_eq!(dir.lookup("x").unwrap().version, 3);
    }

    #[test]
    fn test_replay_lumps_in_parent_before_child_order() {
        let mut m = mds();
        setup_root(&mut m);
        let root_df = DirfragId::whole(ROOT_INO);
        let sub_df = DirfragId::whole(InodeNo(20));

        let mut blob = MetaBlob::new();
        blob.add_dir(root_df, 2, true, false);
        blob.add_full_dentry(root_df, "dir", 1, true, dir_rec(20), None);
        blob.add_dir(sub_df, 1, true, false);
        blob.add_full_dentry(sub_df, "f", 1, true, file_rec(30), None);
        blob.replay(&mut m).unwrap();

        assert!(m.cache.get_dirfrag(sub_df).is_some());
        assert_eq!(
            m.cache.get_inode(InodeNo(30)).unwrap().parent,
            Some((sub_df, "f".to_string()))
        );
    }

    #[test]
    fn test_replay_records_atids_truncations_requests() {
        let mut m = mds();
        let mut blob = MetaBlob::new();
        blob.add_anchor_txn(11);
        blob.add_truncated_inode(file_rec(40), 4096);
        let reqid = RequestId {
            client: ClientId(1),
            tid: 5,
        };
        blob.add_client_request(reqid);
        blob.replay(&mut m).unwrap();

        assert!(m.cache.has_recovered_purge(InodeNo(40), 4096));
        assert!(m.clientmap.have_completed_request(reqid));
    }

    // ---- expiration predicate ----

    #[test]
    fn test_has_expired_missing_dirfrag_is_satisfied() {
        let m = mds();
        let mut blob = MetaBlob::new();
        blob.add_dir(DirfragId::whole(InodeNo(77)), 5, true, false);
        assert!(blob.has_expired(&m));
    }

    #[test]
    fn test_has_expired_foreign_authority_is_satisfied() {
        // boundary scenario: authority belongs to another node entirely
        let mut m = mds();
        let df = setup_root(&mut m);
        m.cache
            .get_dirfrag_mut(df)
            .unwrap()
            .set_authority(Authority::single(NodeId(7)));

        let mut blob = MetaBlob::new();
        blob.add_dir(df, 5, true, false);
        assert!(blob.has_expired(&m));

        // and expire issues no commit
        let (cb, fired) = flag();
        blob.expire(&mut m, cb).unwrap();
        assert!(fired.get());
        assert_eq!(m.cache.get_dirfrag(df).unwrap().committing, 0);
    }

    #[test]
    fn test_ambiguous_export_blocks_and_waits_on_migrator() {
        let mut m = mds();
        let df = setup_root(&mut m);
        m.cache
            .get_dirfrag_mut(df)
            .unwrap()
            .set_authority(Authority::transition(NodeId(0), NodeId(1)));
        m.migrator.begin_export(df);

        let mut blob = MetaBlob::new();
        blob.add_dir(df, 5, true, false);
        assert!(!blob.has_expired(&m));

        let (cb, fired) = flag();
        blob.expire(&mut m, cb).unwrap();
        assert!(!fired.get());
        assert_eq!(m.cache.get_dirfrag(df).unwrap().committing, 0);

        m.migrator.finish_export(df);
        assert!(fired.get());
    }

    #[test]
    fn test_ambiguous_import_blocks_and_waits_on_dirfrag() {
        let mut m = mds();
        let df = setup_root(&mut m);
        m.cache
            .get_dirfrag_mut(df)
            .unwrap()
            .set_authority(Authority::transition(NodeId(1), NodeId(0)));
        m.cache.add_ambiguous_import(df, vec![]);

        let mut blob = MetaBlob::new();
        blob.add_dir(df, 5, true, false);
        assert!(!blob.has_expired(&m));

        let (cb, fired) = flag();
        blob.expire(&mut m, cb).unwrap();
        assert!(!fired.get());
        assert_eq!(m.cache.get_dirfrag(df).unwrap().committing, 0);

        m.cache.finish_ambiguous_import(df);
        assert!(fired.get());
    }

    #[test]
    fn test_normal_commit_path() {
        let mut m = mds();
        let df = setup_root(&mut m);
        m.cache.mark_dirfrag_committed(df, 3);

        let mut blob = MetaBlob::new();
        blob.add_dir(df, 5, true, false);
        assert!(!blob.has_expired(&m));

        let (cb, fired) = flag();
        blob.expire(&mut m, cb).unwrap();
        assert_eq!(m.cache.get_dirfrag(df).unwrap().committing, 5);
        assert!(!fired.get());

        m.cache.mark_dirfrag_committed(df, 5);
        assert!(fired.get());
        assert!(blob.has_expired(&m));
    }

    #[test]
    fn test_frozen_dirfrag_waits_for_authpin() {
        let mut m = mds();
        let df = setup_root(&mut m);
        m.cache.get_dirfrag_mut(df).unwrap().frozen = true;

        let mut blob = MetaBlob::new();
        blob.add_dir(df, 5, true, false);
        let (cb, fired) = flag();
        blob.expire(&mut m, cb).unwrap();
        // no commit yet; the waiter retries once the freeze lifts
        assert_eq!(m.cache.get_dirfrag(df).unwrap().committing, 0);
        assert!(!fired.get());

        m.cache.get_dirfrag_mut(df).unwrap().unfreeze();
        assert!(fired.get());
    }

    #[test]
    fn test_anchor_and_purge_and_request_conditions() {
        let mut m = mds();

        let mut blob = MetaBlob::new();
        blob.add_anchor_txn(3);
        blob.add_truncated_inode(file_rec(40), 512);
        let reqid = RequestId {
            client: ClientId(2),
            tid: 9,
        };
        blob.add_client_request(reqid);

        m.cache.start_purge(InodeNo(40), 512);
        m.clientmap.add_completed_request(reqid);
        assert!(!blob.has_expired(&m));

        let (cb, fired) = flag();
        blob.expire(&mut m, cb).unwrap();
        assert!(!fired.get());

        m.anchor_client.got_journaled_ack(3);
        assert!(!fired.get());
        m.cache.finish_purge(InodeNo(40), 512);
        assert!(!fired.get());
        m.clientmap.trim_completed_request(reqid);
        assert!(fired.get());
        assert!(blob.has_expired(&m));
    }

    #[test]
    fn test_has_expired_is_monotonic_without_state_change() {
        let mut m = mds();
        let df = setup_root(&mut m);
        m.cache.mark_dirfrag_committed(df, 5);

        let mut blob = MetaBlob::new();
        blob.add_dir(df, 5, true, false);
        assert!(blob.has_expired(&m));
        assert!(blob.has_expired(&m));
    }
}
