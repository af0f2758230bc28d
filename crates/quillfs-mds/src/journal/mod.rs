//! Journal events
//!
//! Every metadata mutation is journaled as one of the event kinds below.
//! Each kind implements the same triple:
//!
//! - `replay` reconstructs in-memory state from the event on startup;
//! - `has_expired` decides, without side effects, whether the entry may
//!   be trimmed from the log tail;
//! - `expire` schedules the asynchronous work that will make the entry
//!   expirable, delivering a single completion when all of it is done.
//!
//! The trimmer may only call `expire` on an entry whose `has_expired` is
//! currently false; for kinds that can never be unexpired the call is a
//! hard error.

mod metablob;
mod session;
mod subtree;
mod table;
mod update;

pub use metablob::{DirLump, FullBit, MetaBlob, NullBit, RemoteBit};
pub use session::{EClientMap, ESession};
pub use subtree::{EExport, EImportFinish, EImportMap, EImportStart};
pub use table::{AllocOp, AnchorClientOp, AnchorOp, EAlloc, EAnchor, EAnchorClient};
pub use update::{EOpen, ESlaveUpdate, EUpdate, SlaveOp};

use crate::completion::Completion;
use crate::mds::Mds;
use quillfs_common::{Error, InodeNo, LogOffset, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// A free-form debug marker. Never blocks trimming.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EString {
    pub event: String,
}

impl EString {
    #[must_use]
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
        }
    }

    pub fn has_expired(&self, _mds: &Mds) -> bool {
        debug!("EString.has_expired {}", self.event);
        true
    }

    pub fn expire(&self, _mds: &mut Mds, _c: Completion) -> Result<()> {
        debug!("EString.expire {}", self.event);
        Ok(())
    }

    pub fn replay(&self, _mds: &mut Mds) -> Result<()> {
        debug!("EString.replay {}", self.event);
        Ok(())
    }
}

/// Journaled when a pending purge finished. Balances the truncation its
/// `MetaBlob` recorded, so a crash between the two re-purges.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EPurgeFinish {
    pub ino: InodeNo,
    pub newsize: u64,
}

impl EPurgeFinish {
    #[must_use]
    pub fn new(ino: InodeNo, newsize: u64) -> Self {
        Self { ino, newsize }
    }

    pub fn has_expired(&self, _mds: &Mds) -> bool {
        true
    }

    pub fn expire(&self, _mds: &mut Mds, _c: Completion) -> Result<()> {
        Err(Error::IllegalExpire)
    }

    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        debug!("EPurgeFinish.replay {} to {}", self.ino, self.newsize);
        mds.cache.remove_recovered_purge(self.ino, self.newsize);
        Ok(())
    }
}

/// Discriminant of a journal event, for logging and record inspection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    String,
    ClientMap,
    Session,
    Alloc,
    Anchor,
    AnchorClient,
    Update,
    SlaveUpdate,
    Open,
    PurgeFinish,
    ImportMap,
    Export,
    ImportStart,
    ImportFinish,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "EString",
            Self::ClientMap => "EClientMap",
            Self::Session => "ESession",
            Self::Alloc => "EAlloc",
            Self::Anchor => "EAnchor",
            Self::AnchorClient => "EAnchorClient",
            Self::Update => "EUpdate",
            Self::SlaveUpdate => "ESlaveUpdate",
            Self::Open => "EOpen",
            Self::PurgeFinish => "EPurgeFinish",
            Self::ImportMap => "EImportMap",
            Self::Export => "EExport",
            Self::ImportStart => "EImportStart",
            Self::ImportFinish => "EImportFinish",
        };
        f.write_str(name)
    }
}

/// The tagged union over every journal event kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum JournalEvent {
    String(EString),
    ClientMap(EClientMap),
    Session(ESession),
    Alloc(EAlloc),
    Anchor(EAnchor),
    AnchorClient(EAnchorClient),
    Update(EUpdate),
    SlaveUpdate(ESlaveUpdate),
    Open(EOpen),
    PurgeFinish(EPurgeFinish),
    ImportMap(EImportMap),
    Export(EExport),
    ImportStart(EImportStart),
    ImportFinish(EImportFinish),
}

impl JournalEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::String(_) => EventKind::String,
            Self::ClientMap(_) => EventKind::ClientMap,
            Self::Session(_) => EventKind::Session,
            Self::Alloc(_) => EventKind::Alloc,
            Self::Anchor(_) => EventKind::Anchor,
            Self::AnchorClient(_) => EventKind::AnchorClient,
            Self::Update(_) => EventKind::Update,
            Self::SlaveUpdate(_) => EventKind::SlaveUpdate,
            Self::Open(_) => EventKind::Open,
            Self::PurgeFinish(_) => EventKind::PurgeFinish,
            Self::ImportMap(_) => EventKind::ImportMap,
            Self::Export(_) => EventKind::Export,
            Self::ImportStart(_) => EventKind::ImportStart,
            Self::ImportFinish(_) => EventKind::ImportFinish,
        }
    }

    /// Dispatch `has_expired`, supplying the entry's log position to the
    /// kinds whose predicate depends on it.
    #[must_use]
    pub fn has_expired(&self, mds: &Mds, start: LogOffset, end: LogOffset) -> bool {
        match self {
            Self::String(e) => e.has_expired(mds),
            Self::ClientMap(e) => e.has_expired(mds),
            Self::Session(e) => e.has_expired(mds),
            Self::Alloc(e) => e.has_expired(mds),
            Self::Anchor(e) => e.has_expired(mds),
            Self::AnchorClient(e) => e.has_expired(mds),
            Self::Update(e) => e.has_expired(mds),
            Self::SlaveUpdate(e) => e.has_expired(mds),
            Self::Open(e) => e.has_expired(mds, start),
            Self::PurgeFinish(e) => e.has_expired(mds),
            Self::ImportMap(e) => e.has_expired(mds, end),
            Self::Export(e) => e.has_expired(mds),
            Self::ImportStart(e) => e.has_expired(mds),
            Self::ImportFinish(e) => e.has_expired(mds),
        }
    }

    /// Dispatch `expire`. Only legal while `has_expired` is false.
    pub fn expire(&self, mds: &mut Mds, c: Completion) -> Result<()> {
        match self {
            Self::String(e) => e.expire(mds, c),
            Self::ClientMap(e) => e.expire(mds, c),
            Self::Session(e) => e.expire(mds, c),
            Self::Alloc(e) => e.expire(mds, c),
            Self::Anchor(e) => e.expire(mds, c),
            Self::AnchorClient(e) => e.expire(mds, c),
            Self::Update(e) => e.expire(mds, c),
            Self::SlaveUpdate(e) => e.expire(mds, c),
            Self::Open(e) => e.expire(mds, c),
            Self::PurgeFinish(e) => e.expire(mds, c),
            Self::ImportMap(e) => e.expire(mds, c),
            Self::Export(e) => e.expire(mds, c),
            Self::ImportStart(e) => e.expire(mds, c),
            Self::ImportFinish(e) => e.expire(mds, c),
        }
    }

    /// Dispatch `replay`.
    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        match self {
            Self::String(e) => e.replay(mds),
            Self::ClientMap(e) => e.replay(mds),
            Self::Session(e) => e.replay(mds),
            Self::Alloc(e) => e.replay(mds),
            Self::Anchor(e) => e.replay(mds),
            Self::AnchorClient(e) => e.replay(mds),
            Self::Update(e) => e.replay(mds),
            Self::SlaveUpdate(e) => e.replay(mds),
            Self::Open(e) => e.replay(mds),
            Self::PurgeFinish(e) => e.replay(mds),
            Self::ImportMap(e) => e.replay(mds),
            Self::Export(e) => e.replay(mds),
            Self::ImportStart(e) => e.replay(mds),
            Self::ImportFinish(e) => e.replay(mds),
        }
    }
}

/// A journal event together with its position in the log.
pub struct LogEntry {
    pub start: LogOffset,
    pub end: LogOffset,
    pub event: JournalEvent,
}

impl LogEntry {
    #[must_use]
    pub fn has_expired(&self, mds: &Mds) -> bool {
        self.event.has_expired(mds, self.start, self.end)
    }

    pub fn expire(&self, mds: &mut Mds, c: Completion) -> Result<()> {
        self.event.expire(mds, c)
    }

    pub fn replay(&self, mds: &mut Mds) -> Result<()> {
        self.event.replay(mds)
    }
}
