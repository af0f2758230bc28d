//! Error types for the QuillFS MDS
//!
//! Replay and expiration surface fatal invariant violations as typed
//! errors; the caller treats them as unrecoverable. Missing cache objects
//! are not errors (a trimmed dirfrag means its data was already flushed).

use crate::types::{DirfragId, InodeNo, RequestId, Version};
use thiserror::Error;

/// Common result type for MDS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the MDS journal subsystem
#[derive(Debug, Error)]
pub enum Error {
    #[error("parent inode {0} absent during replay and neither root nor stray")]
    MissingParentInode(InodeNo),

    #[error("dirfrag {0} required but not in cache")]
    MissingDirfrag(DirfragId),

    #[error("slave update {0} already has a saved prepare")]
    DuplicateSlavePrepare(RequestId),

    #[error("table at version {table}, event carries version {event}")]
    TableVersionGap { table: Version, event: Version },

    #[error("replayed allocation produced id {got}, journal recorded {recorded}")]
    AllocReplayMismatch { recorded: u64, got: u64 },

    #[error("expire called on an event that cannot be unexpired")]
    IllegalExpire,

    #[error("log is capped but journaled opens have not expired")]
    CappedLogWithOpens,

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}
