//! The MDS aggregate
//!
//! One `Mds` owns every process-wide subsystem the journal events operate
//! against. All mutation happens from the single event thread; the
//! cross-subsystem operations (client-map flush, journal-open batching,
//! tail trimming) live here because they touch several subsystems at
//! once.

use crate::anchor::{AnchorClient, AnchorTable};
use crate::cache::MetaCache;
use crate::clientmap::ClientMap;
use crate::completion::Completion;
use crate::idalloc::IdAllocator;
use crate::journal::{EClientMap, EOpen, JournalEvent, MetaBlob};
use crate::log::MdsLog;
use crate::migrator::Migrator;
use crate::server::Server;
use quillfs_common::{MdsConfig, NodeId, Result};
use tracing::debug;

/// A metadata server instance.
pub struct Mds {
    config: MdsConfig,
    pub cache: MetaCache,
    pub anchor_table: AnchorTable,
    pub anchor_client: AnchorClient,
    pub idalloc: IdAllocator,
    pub clientmap: ClientMap,
    pub migrator: Migrator,
    pub log: MdsLog,
    pub server: Server,
}

impl Mds {
    #[must_use]
    pub fn new(config: MdsConfig) -> Self {
        let node_id = config.node_id;
        let max_nodes = config.max_nodes;
        Self {
            config,
            cache: MetaCache::new(node_id, max_nodes),
            anchor_table: AnchorTable::new(),
            anchor_client: AnchorClient::new(),
            idalloc: IdAllocator::new(),
            clientmap: ClientMap::new(),
            migrator: Migrator::new(),
            log: MdsLog::new(),
            server: Server::new(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    #[must_use]
    pub fn config(&self) -> &MdsConfig {
        &self.config
    }

    /// Start a fresh client-map flush: journal the current session table
    /// and park `cb` until the flush commits.
    pub fn log_clientmap(&mut self, cb: Completion) -> Result<()> {
        let cmapv = self.clientmap.get_version();
        debug!("logging clientmap v{}", cmapv);
        let image = self.clientmap.encode()?;
        self.clientmap.set_committing(cmapv);
        self.log
            .submit(JournalEvent::ClientMap(EClientMap::new(cmapv, image)))?;
        self.clientmap.add_commit_waiter(cb);
        Ok(())
    }

    /// Write a fresh open record for the queued inodes if the batch is
    /// due, stamping each inode's `last_open_journaled`, and wake the
    /// open waiters.
    pub fn maybe_journal_opens(&mut self) -> Result<()> {
        if self.server.queued_opens() == 0 {
            return Ok(());
        }
        if self.server.queued_opens() < self.config.journal_open_batch
            && !self.server.has_open_waiters()
        {
            return Ok(());
        }

        let stamp = self.log.write_pos();
        let mut blob = MetaBlob::new();
        let mut inos = Vec::new();
        for ino in self.server.take_queue() {
            let Some(inode) = self.cache.get_inode(ino) else {
                continue;
            };
            if !inode.is_any_caps() {
                continue;
            }
            let parent = inode.parent.clone();
            let rec = inode.rec.clone();
            let symlink = inode.symlink.clone();
            if let Some((pdir, name)) = parent {
                let dir = self.cache.get_dirfrag(pdir);
                let dirv = dir.map_or(0, |d| d.version);
                let dnv = dir.and_then(|d| d.lookup(&name)).map_or(0, |dn| dn.version);
                blob.add_dir(pdir, dirv, false, false);
                blob.add_full_dentry(pdir, &name, dnv, false, rec, symlink);
            }
            inos.push(ino);
        }

        if !inos.is_empty() {
            debug!("journaling opens for {} inodes", inos.len());
            for ino in &inos {
                if let Some(inode) = self.cache.get_inode_mut(*ino) {
                    inode.last_open_journaled = stamp;
                }
            }
            self.log.submit(JournalEvent::Open(EOpen::new(blob, inos)))?;
        }
        for cb in self.server.drain_open_waiters() {
            cb();
        }
        Ok(())
    }

    /// Drop expired entries from the log tail, stopping at the first
    /// entry that has not expired. Returns how many were trimmed. The
    /// trim policy (when to call this, when to drive `expire`) belongs to
    /// the caller.
    pub fn try_trim(&mut self) -> usize {
        let mut trimmed = 0;
        loop {
            let expired = match self.log.front() {
                Some(entry) => entry.has_expired(self),
                None => break,
            };
            if !expired {
                break;
            }
            self.log.pop_front();
            trimmed += 1;
        }
        if trimmed > 0 {
            debug!("trimmed {} journal entries", trimmed);
        }
        trimmed
    }
}
