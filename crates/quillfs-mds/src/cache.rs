//! In-memory metadata cache
//!
//! Holds the cached namespace: inodes, directory fragments with their
//! dentries, the subtree authority map, ambiguous imports, and purge
//! bookkeeping. The journal replays into this cache on startup, and the
//! expiration predicates read commit state out of it.
//!
//! Objects are keyed by id rather than linked by pointer; a dentry refers
//! to its inode by number and an inode records its parent as a
//! `(dirfrag, name)` pair.

use crate::completion::Completion;
use crate::journal::MetaBlob;
use quillfs_common::{
    Authority, DirfragId, Error, Frag, InodeKind, InodeNo, InodeRecord, NodeId, RequestId,
    Result, Version, ROOT_INO, STRAY_INO_BASE,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// A cached inode.
pub struct Inode {
    pub rec: InodeRecord,
    pub symlink: Option<String>,
    /// Primary link: the dentry this inode hangs off, if any.
    pub parent: Option<(DirfragId, String)>,
    /// Number of client capabilities held on this inode.
    pub caps: u32,
    /// Start offset of the most recent journal-open write naming this
    /// inode, zero if none.
    pub last_open_journaled: u64,
    pub dirty: bool,
}

impl Inode {
    #[must_use]
    pub fn new(rec: InodeRecord) -> Self {
        Self {
            rec,
            symlink: None,
            parent: None,
            caps: 0,
            last_open_journaled: 0,
            dirty: false,
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNo {
        self.rec.ino
    }

    /// Does any client hold capabilities on this inode?
    #[must_use]
    pub fn is_any_caps(&self) -> bool {
        self.caps > 0
    }
}

/// What a dentry points at.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DentryLink {
    /// Negative dentry.
    Null,
    /// Primary link to an inode in this cache.
    Primary(InodeNo),
    /// Link to an inode whose primary dentry lives elsewhere.
    Remote(InodeNo),
}

/// A cached dentry.
pub struct Dentry {
    pub version: Version,
    pub dirty: bool,
    pub link: DentryLink,
}

impl Dentry {
    fn new() -> Self {
        Self {
            version: 0,
            dirty: false,
            link: DentryLink::Null,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.link == DentryLink::Null
    }
}

/// A cached directory fragment: the unit of authority and commit.
pub struct Dirfrag {
    pub id: DirfragId,
    pub version: Version,
    /// Highest version a commit has been requested for.
    pub committing: Version,
    /// Highest version known durable in the backing store.
    pub committed: Version,
    pub dirty: bool,
    pub complete: bool,
    auth: Authority,
    /// A frozen dirfrag (mid export/split/merge) cannot be auth-pinned.
    pub frozen: bool,
    dentries: BTreeMap<String, Dentry>,
    commit_waiters: Vec<(Version, Completion)>,
    authpin_waiters: Vec<Completion>,
    imported_waiters: Vec<Completion>,
}

impl Dirfrag {
    fn new(id: DirfragId, auth: Authority) -> Self {
        Self {
            id,
            version: 0,
            committing: 0,
            committed: 0,
            dirty: false,
            complete: false,
            auth,
            frozen: false,
            dentries: BTreeMap::new(),
            commit_waiters: Vec::new(),
            authpin_waiters: Vec::new(),
            imported_waiters: Vec::new(),
        }
    }

    #[must_use]
    pub fn authority(&self) -> Authority {
        self.auth
    }

    pub fn set_authority(&mut self, auth: Authority) {
        self.auth = auth;
    }

    #[must_use]
    pub fn committed_version(&self) -> Version {
        self.committed
    }

    /// An authority transition (export or import) is in flight.
    #[must_use]
    pub fn is_ambiguous_auth(&self) -> bool {
        self.auth.is_ambiguous()
    }

    #[must_use]
    pub fn can_auth_pin(&self) -> bool {
        !self.frozen
    }

    /// Request a commit up to `version`; `cb` fires once the store
    /// acknowledges it (see [`Dirfrag::mark_committed`]).
    pub fn commit(&mut self, version: Version, cb: Completion) {
        debug!("dirfrag {} commit requested to v{}", self.id, version);
        self.committing = self.committing.max(version);
        self.commit_waiters.push((version, cb));
    }

    /// The backing store acknowledged durability up to `version`.
    pub fn mark_committed(&mut self, version: Version) {
        self.committed = self.committed.max(version);
        let committed = self.committed;
        let (ready, pending): (Vec<_>, Vec<_>) = self
            .commit_waiters
            .drain(..)
            .partition(|(v, _)| *v <= committed);
        self.commit_waiters = pending;
        for (_, cb) in ready {
            cb();
        }
    }

    pub fn add_authpin_waiter(&mut self, cb: Completion) {
        self.authpin_waiters.push(cb);
    }

    /// Unfreeze and wake everyone waiting to auth-pin.
    pub fn unfreeze(&mut self) {
        self.frozen = false;
        for cb in self.authpin_waiters.drain(..) {
            cb();
        }
    }

    pub fn add_imported_waiter(&mut self, cb: Completion) {
        self.imported_waiters.push(cb);
    }

    fn fire_imported_waiters(&mut self) {
        for cb in self.imported_waiters.drain(..) {
            cb();
        }
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Dentry> {
        self.dentries.get(name)
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Dentry> {
        self.dentries.get_mut(name)
    }

    /// Find or create the dentry with `name`; created dentries are null.
    pub fn add_dentry(&mut self, name: &str) -> &mut Dentry {
        self.dentries
            .entry(name.to_string())
            .or_insert_with(Dentry::new)
    }

    #[must_use]
    pub fn num_dentries(&self) -> usize {
        self.dentries.len()
    }
}

/// The metadata cache.
pub struct MetaCache {
    node_id: NodeId,
    /// Cluster size; bounds the stray inode range.
    max_nodes: u64,
    inodes: HashMap<InodeNo, Inode>,
    dirfrags: HashMap<DirfragId, Dirfrag>,
    /// Subtree roots authoritative knowledge: root -> bound dirfrags.
    subtrees: HashMap<DirfragId, HashSet<DirfragId>>,
    /// Imports journaled but not yet finished: base -> bounds.
    ambiguous_imports: HashMap<DirfragId, Vec<DirfragId>>,
    /// Purges in flight, with their waiters.
    purging: HashSet<(InodeNo, u64)>,
    purge_waiters: HashMap<(InodeNo, u64), Vec<Completion>>,
    /// Truncations recovered from the journal, to be re-purged.
    recovered_purges: HashMap<(InodeNo, u64), InodeRecord>,
    /// Slave transaction prepares awaiting commit or abort.
    pub uncommitted_slave_updates: HashMap<RequestId, MetaBlob>,
}

impl MetaCache {
    #[must_use]
    pub fn new(node_id: NodeId, max_nodes: u64) -> Self {
        Self {
            node_id,
            max_nodes,
            inodes: HashMap::new(),
            dirfrags: HashMap::new(),
            subtrees: HashMap::new(),
            ambiguous_imports: HashMap::new(),
            purging: HashSet::new(),
            purge_waiters: HashMap::new(),
            recovered_purges: HashMap::new(),
            uncommitted_slave_updates: HashMap::new(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    // ---- inodes ----

    #[must_use]
    pub fn get_inode(&self, ino: InodeNo) -> Option<&Inode> {
        self.inodes.get(&ino)
    }

    pub fn get_inode_mut(&mut self, ino: InodeNo) -> Option<&mut Inode> {
        self.inodes.get_mut(&ino)
    }

    pub fn add_inode(&mut self, inode: Inode) {
        debug!("cache add inode {}", inode.ino());
        self.inodes.insert(inode.ino(), inode);
    }

    /// Materialize the root inode.
    pub fn create_root_inode(&mut self) -> InodeNo {
        self.add_inode(Inode::new(InodeRecord::new(ROOT_INO, InodeKind::Dir)));
        ROOT_INO
    }

    /// Materialize the stray directory inode belonging to `node`. The
    /// owner must be inside the cluster, or the minted inode number
    /// would fall outside the stray range.
    pub fn create_stray_inode(&mut self, node: NodeId) -> InodeNo {
        assert!(
            u64::from(node.0) < self.max_nodes,
            "stray owner {} outside cluster of {} nodes",
            node,
            self.max_nodes
        );
        let ino = InodeNo(STRAY_INO_BASE + u64::from(node.0));
        self.add_inode(Inode::new(InodeRecord::new(ino, InodeKind::Dir)));
        ino
    }

    // ---- dirfrags ----

    #[must_use]
    pub fn get_dirfrag(&self, id: DirfragId) -> Option<&Dirfrag> {
        self.dirfrags.get(&id)
    }

    pub fn get_dirfrag_mut(&mut self, id: DirfragId) -> Option<&mut Dirfrag> {
        self.dirfrags.get_mut(&id)
    }

    /// Find or open the dirfrag `frag` of directory inode `ino`. The
    /// inode must already be cached.
    pub fn get_or_open_dirfrag(&mut self, ino: InodeNo, frag: Frag) -> Result<&mut Dirfrag> {
        if !self.inodes.contains_key(&ino) {
            return Err(Error::MissingParentInode(ino));
        }
        let id = DirfragId { ino, frag };
        let node = self.node_id;
        Ok(self
            .dirfrags
            .entry(id)
            .or_insert_with(|| Dirfrag::new(id, Authority::single(node))))
    }

    /// Testing/driver entry: the store acknowledged a dirfrag commit.
    pub fn mark_dirfrag_committed(&mut self, id: DirfragId, version: Version) {
        if let Some(dir) = self.dirfrags.get_mut(&id) {
            dir.mark_committed(version);
        }
    }

    // ---- links ----

    /// Make `name` in `dfid` the primary dentry of `ino`, severing any
    /// prior primary link of either side.
    pub fn link_primary(&mut self, dfid: DirfragId, name: &str, ino: InodeNo) {
        // sever the dentry's current primary link, if to another inode
        if let Some(dir) = self.dirfrags.get_mut(&dfid) {
            if let Some(dn) = dir.lookup_mut(name) {
                if let DentryLink::Primary(old) = dn.link {
                    if old != ino {
                        if let Some(old_in) = self.inodes.get_mut(&old) {
                            old_in.parent = None;
                        }
                    }
                }
            }
        }
        if let Some(dir) = self.dirfrags.get_mut(&dfid) {
            dir.add_dentry(name).link = DentryLink::Primary(ino);
        }
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.parent = Some((dfid, name.to_string()));
        }
    }

    /// Point `name` in `dfid` at a remote inode.
    pub fn link_remote(&mut self, dfid: DirfragId, name: &str, remote: InodeNo) {
        if let Some(dir) = self.dirfrags.get_mut(&dfid) {
            dir.add_dentry(name).link = DentryLink::Remote(remote);
        }
    }

    /// Null out `name` in `dfid`, clearing the inode's parent if the
    /// dentry was its primary link.
    pub fn unlink(&mut self, dfid: DirfragId, name: &str) {
        let mut primary = None;
        if let Some(dir) = self.dirfrags.get_mut(&dfid) {
            if let Some(dn) = dir.lookup_mut(name) {
                if let DentryLink::Primary(ino) = dn.link {
                    primary = Some(ino);
                }
                dn.link = DentryLink::Null;
            }
        }
        if let Some(ino) = primary {
            if let Some(inode) = self.inodes.get_mut(&ino) {
                inode.parent = None;
            }
        }
    }

    // ---- purges ----

    #[must_use]
    pub fn is_purging(&self, ino: InodeNo, size: u64) -> bool {
        self.purging.contains(&(ino, size))
    }

    pub fn start_purge(&mut self, ino: InodeNo, size: u64) {
        self.purging.insert((ino, size));
    }

    pub fn wait_for_purge(&mut self, ino: InodeNo, size: u64, cb: Completion) {
        self.purge_waiters.entry((ino, size)).or_default().push(cb);
    }

    /// A purge completed; wake its waiters.
    pub fn finish_purge(&mut self, ino: InodeNo, size: u64) {
        self.purging.remove(&(ino, size));
        if let Some(waiters) = self.purge_waiters.remove(&(ino, size)) {
            for cb in waiters {
                cb();
            }
        }
    }

    pub fn add_recovered_purge(&mut self, rec: InodeRecord, size: u64) {
        debug!("cache will purge recovered truncation {} to {}", rec.ino, size);
        self.recovered_purges.insert((rec.ino, size), rec);
    }

    pub fn remove_recovered_purge(&mut self, ino: InodeNo, size: u64) {
        self.recovered_purges.remove(&(ino, size));
    }

    #[must_use]
    pub fn has_recovered_purge(&self, ino: InodeNo, size: u64) -> bool {
        self.recovered_purges.contains_key(&(ino, size))
    }

    // ---- subtrees ----

    /// Has any subtree authority been established yet?
    #[must_use]
    pub fn is_subtrees(&self) -> bool {
        !self.subtrees.is_empty()
    }

    /// Walk up from `id` to the root of the subtree containing it.
    #[must_use]
    pub fn get_subtree_root(&self, mut id: DirfragId) -> DirfragId {
        let mut hops = 0;
        loop {
            if self.subtrees.contains_key(&id) {
                return id;
            }
            let parent = self
                .inodes
                .get(&id.ino)
                .and_then(|inode| inode.parent.as_ref());
            match parent {
                Some((pdir, _)) => id = *pdir,
                None => return id,
            }
            hops += 1;
            if hops > self.dirfrags.len() {
                warn!("subtree walk did not terminate at {}", id);
                return id;
            }
        }
    }

    /// Declare `id` a subtree root authoritative on `node`.
    pub fn adjust_subtree_auth(&mut self, id: DirfragId, node: NodeId) {
        let Some(dir) = self.dirfrags.get_mut(&id) else {
            warn!("adjust_subtree_auth: dirfrag {} not in cache", id);
            return;
        };
        debug!("subtree {} auth -> {}", id, node);
        dir.set_authority(Authority::single(node));
        self.subtrees.entry(id).or_default();
    }

    /// Declare `base` a subtree root with the given bounds and authority.
    /// Bounds become subtree roots of their own if they were not already.
    pub fn adjust_bounded_subtree_auth(
        &mut self,
        base: DirfragId,
        bounds: &[DirfragId],
        auth: Authority,
    ) {
        let Some(dir) = self.dirfrags.get_mut(&base) else {
            warn!("adjust_bounded_subtree_auth: dirfrag {} not in cache", base);
            return;
        };
        debug!("subtree {} auth -> {} bounds {:?}", base, auth, bounds);
        dir.set_authority(auth);
        self.subtrees.insert(base, bounds.iter().copied().collect());
        for bound in bounds {
            if self.dirfrags.contains_key(bound) {
                self.subtrees.entry(*bound).or_default();
            }
        }
    }

    /// Merge `base` into its parent subtree if their settled authorities
    /// match.
    pub fn try_subtree_merge(&mut self, base: DirfragId) {
        let Some(base_bounds) = self.subtrees.get(&base).cloned() else {
            return;
        };
        let Some(base_auth) = self.dirfrags.get(&base).map(Dirfrag::authority) else {
            return;
        };
        if base_auth.is_ambiguous() {
            return;
        }
        let Some((pdir, _)) = self
            .inodes
            .get(&base.ino)
            .and_then(|inode| inode.parent.clone())
        else {
            return;
        };
        let parent_root = self.get_subtree_root(pdir);
        if parent_root == base {
            return;
        }
        let Some(parent_auth) = self.dirfrags.get(&parent_root).map(Dirfrag::authority) else {
            return;
        };
        if parent_auth.is_ambiguous() || parent_auth != base_auth {
            return;
        }
        debug!("merging subtree {} into {}", base, parent_root);
        self.subtrees.remove(&base);
        if let Some(parent_bounds) = self.subtrees.get_mut(&parent_root) {
            parent_bounds.remove(&base);
            parent_bounds.extend(base_bounds);
        }
    }

    /// Record a journaled import whose outcome is not yet known.
    pub fn add_ambiguous_import(&mut self, base: DirfragId, bounds: Vec<DirfragId>) {
        debug!("ambiguous import {} bounds {:?}", base, bounds);
        self.ambiguous_imports.insert(base, bounds);
    }

    #[must_use]
    pub fn is_ambiguous_import(&self, base: DirfragId) -> bool {
        self.ambiguous_imports.contains_key(&base)
    }

    /// The import succeeded: claim authority over the subtree and wake
    /// anyone waiting on the import.
    pub fn finish_ambiguous_import(&mut self, base: DirfragId) {
        let Some(bounds) = self.ambiguous_imports.remove(&base) else {
            warn!("finish_ambiguous_import: {} not ambiguous", base);
            return;
        };
        let node = self.node_id;
        self.adjust_bounded_subtree_auth(base, &bounds, Authority::single(node));
        if let Some(dir) = self.dirfrags.get_mut(&base) {
            dir.fire_imported_waiters();
        }
    }

    /// The import failed: forget it.
    pub fn cancel_ambiguous_import(&mut self, base: DirfragId) {
        if self.ambiguous_imports.remove(&base).is_none() {
            warn!("cancel_ambiguous_import: {} not ambiguous", base);
        }
    }

    /// Debug dump of the subtree map.
    pub fn log_subtrees(&self) {
        for (root, bounds) in &self.subtrees {
            let auth = self
                .dirfrags
                .get(root)
                .map(Dirfrag::authority)
                .unwrap_or_default();
            debug!("subtree {} auth {} bounds {:?}", root, auth, bounds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::flag;
    use quillfs_common::{InodeKind, ROOT_INO};

    fn cache() -> MetaCache {
        MetaCache::new(NodeId(0), 0x100)
    }

    fn file_rec(ino: u64) -> InodeRecord {
        InodeRecord::new(InodeNo(ino), InodeKind::File)
    }

    #[test]
    fn test_link_and_unlink_primary() {
        let mut c = cache();
        c.create_root_inode();
        let root_df = c.get_or_open_dirfrag(ROOT_INO, Frag::WHOLE).unwrap().id;
        c.add_inode(Inode::new(file_rec(10)));
        c.get_dirfrag_mut(root_df).unwrap().add_dentry("a");

        c.link_primary(root_df, "a", InodeNo(10));
        assert_eq!(
            c.get_inode(InodeNo(10)).unwrap().parent,
            Some((root_df, "a".to_string()))
        );

        c.unlink(root_df, "a");
        assert!(c.get_inode(InodeNo(10)).unwrap().parent.is_none());
        assert!(c.get_dirfrag(root_df).unwrap().lookup("a").unwrap().is_null());
    }

    #[test]
    fn test_relink_severs_old_parent() {
        let mut c = cache();
        c.create_root_inode();
        let root_df = c.get_or_open_dirfrag(ROOT_INO, Frag::WHOLE).unwrap().id;
        c.add_inode(Inode::new(file_rec(10)));
        c.link_primary(root_df, "b", InodeNo(10));

        // taking over a dentry that was primary to another inode severs
        // that inode's parent link
        c.add_inode(Inode::new(file_rec(11)));
        c.link_primary(root_df, "b", InodeNo(11));
        assert!(c.get_inode(InodeNo(10)).unwrap().parent.is_none());
        assert_eq!(
            c.get_inode(InodeNo(11)).unwrap().parent,
            Some((root_df, "b".to_string()))
        );
    }

    #[test]
    fn test_subtree_root_walk() {
        let mut c = cache();
        c.create_root_inode();
        let root_df = c.get_or_open_dirfrag(ROOT_INO, Frag::WHOLE).unwrap().id;
        c.adjust_subtree_auth(root_df, NodeId(0));

        // /dir under root, no subtree of its own
        c.add_inode(Inode::new(InodeRecord::new(InodeNo(20), InodeKind::Dir)));
        c.get_dirfrag_mut(root_df).unwrap().add_dentry("dir");
        c.link_primary(root_df, "dir", InodeNo(20));
        let sub_df = c.get_or_open_dirfrag(InodeNo(20), Frag::WHOLE).unwrap().id;

        assert_eq!(c.get_subtree_root(sub_df), root_df);
        c.adjust_subtree_auth(sub_df, NodeId(1));
        assert_eq!(c.get_subtree_root(sub_df), sub_df);
    }

    #[test]
    fn test_ambiguous_import_lifecycle() {
        let mut c = cache();
        c.create_root_inode();
        let base = c.get_or_open_dirfrag(ROOT_INO, Frag::WHOLE).unwrap().id;
        let (cb, fired) = flag();
        c.get_dirfrag_mut(base).unwrap().add_imported_waiter(cb);

        c.add_ambiguous_import(base, vec![]);
        assert!(c.is_ambiguous_import(base));

        c.finish_ambiguous_import(base);
        assert!(!c.is_ambiguous_import(base));
        assert!(fired.get());
        assert_eq!(
            c.get_dirfrag(base).unwrap().authority(),
            Authority::single(NodeId(0))
        );
        assert!(c.is_subtrees());
    }

    #[test]
    fn test_create_stray_inode_in_range() {
        let mut c = MetaCache::new(NodeId(0), 4);
        let ino = c.create_stray_inode(NodeId(3));
        assert!(ino.is_stray(4));
        assert_eq!(ino.stray_owner(4), Some(NodeId(3)));
    }

    #[test]
    #[should_panic(expected = "outside cluster")]
    fn test_create_stray_inode_out_of_range_panics() {
        let mut c = MetaCache::new(NodeId(0), 4);
        c.create_stray_inode(NodeId(4));
    }

    #[test]
    fn test_purge_waiters() {
        let mut c = cache();
        c.start_purge(InodeNo(5), 4096);
        assert!(c.is_purging(InodeNo(5), 4096));

        let (cb, fired) = flag();
        c.wait_for_purge(InodeNo(5), 4096, cb);
        c.finish_purge(InodeNo(5), 4096);
        assert!(!c.is_purging(InodeNo(5), 4096));
        assert!(fired.get());
    }

    #[test]
    fn test_commit_waiters_fire_at_version() {
        let mut c = cache();
        c.create_root_inode();
        let df = c.get_or_open_dirfrag(ROOT_INO, Frag::WHOLE).unwrap().id;

        let (cb, fired) = flag();
        c.get_dirfrag_mut(df).unwrap().commit(5, cb);
        c.mark_dirfrag_committed(df, 4);
        assert!(!fired.get());
        c.mark_dirfrag_committed(df, 5);
        assert!(fired.get());
    }
}
