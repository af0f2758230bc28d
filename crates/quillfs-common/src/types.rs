//! Core type definitions for the QuillFS metadata server
//!
//! This module defines the fundamental identifiers used throughout the
//! MDS: inode numbers, directory fragments, node and client identities,
//! and the subtree authority pair.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Version number for a versioned object (dirfrag, table, client map).
pub type Version = u64;

/// Byte offset into the metadata journal.
pub type LogOffset = u64;

/// Anchor table transaction id. Anchor transactions are identified by the
/// table version at which they were prepared.
pub type AnchorTxnId = u64;

/// The root inode of the filesystem namespace.
pub const ROOT_INO: InodeNo = InodeNo(1);

/// First inode number of the per-node stray directory range. The range
/// width is the configured maximum node count
/// (`MdsConfig::max_nodes`).
pub const STRAY_INO_BASE: u64 = 0x100;

/// Inode number.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, Default,
)]
#[display("{_0}")]
pub struct InodeNo(pub u64);

impl InodeNo {
    /// Is this the root inode?
    #[must_use]
    pub fn is_root(self) -> bool {
        self == ROOT_INO
    }

    /// Is this inode in the stray directory range for a cluster of
    /// `max_nodes` nodes?
    #[must_use]
    pub fn is_stray(self, max_nodes: u64) -> bool {
        self.0 >= STRAY_INO_BASE && self.0 < STRAY_INO_BASE + max_nodes
    }

    /// The node whose stray directory this inode is, if it is one.
    #[must_use]
    pub fn stray_owner(self, max_nodes: u64) -> Option<NodeId> {
        if self.is_stray(max_nodes) {
            Some(NodeId((self.0 - STRAY_INO_BASE) as u32))
        } else {
            None
        }
    }
}

impl fmt::Debug for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ino({})", self.0)
    }
}

/// MDS node identifier within the cluster.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, Debug,
)]
#[display("mds{_0}")]
pub struct NodeId(pub u32);

/// Client identifier.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, Debug,
)]
#[display("client{_0}")]
pub struct ClientId(pub u64);

/// A client identity: who it is and where it connects from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInst {
    pub client: ClientId,
    pub addr: SocketAddr,
}

/// Identifier of a client metadata request, unique per client.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, Debug,
)]
#[display("{client}:{tid}")]
pub struct RequestId {
    pub client: ClientId,
    pub tid: u64,
}

/// Directory fragment within an inode.
///
/// `Frag::WHOLE` covers the entire directory; a fragmented directory
/// splits its dentry space across several fragments.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, Default,
)]
#[display("{_0:x}")]
pub struct Frag(pub u32);

impl Frag {
    /// The unfragmented whole of a directory.
    pub const WHOLE: Frag = Frag(0);
}

impl fmt::Debug for Frag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frag({:x})", self.0)
    }
}

/// Identifier of a directory fragment: the directory inode plus the
/// fragment of its dentry space. The unit of authority and commit.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, Debug,
)]
#[display("{ino}.{frag}")]
pub struct DirfragId {
    pub ino: InodeNo,
    pub frag: Frag,
}

impl DirfragId {
    /// Dirfrag covering the whole of a directory inode.
    #[must_use]
    pub fn whole(ino: InodeNo) -> Self {
        Self {
            ino,
            frag: Frag::WHOLE,
        }
    }
}

/// Subtree authority: which node(s) are responsible for a subtree.
///
/// `None` is the UNKNOWN sentinel. A set `secondary` marks an in-flight
/// authority transition (export or import), during which responsibility
/// for flushing journaled state is ambiguous.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Authority {
    pub primary: Option<NodeId>,
    pub secondary: Option<NodeId>,
}

impl Authority {
    /// Sole, settled authority of one node.
    #[must_use]
    pub fn single(node: NodeId) -> Self {
        Self {
            primary: Some(node),
            secondary: None,
        }
    }

    /// Both halves unknown.
    #[must_use]
    pub fn unknown() -> Self {
        Self::default()
    }

    /// An in-flight transition from `from` to `to`.
    #[must_use]
    pub fn transition(from: NodeId, to: NodeId) -> Self {
        Self {
            primary: Some(from),
            secondary: Some(to),
        }
    }

    /// An authority transition is in flight.
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        self.secondary.is_some()
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let half = |n: Option<NodeId>| match n {
            Some(n) => n.to_string(),
            None => "?".to_string(),
        };
        write!(f, "({},{})", half(self.primary), half(self.secondary))
    }
}

/// Kind of an inode, as recorded in the journal.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum InodeKind {
    File,
    Dir,
    Symlink,
}

/// The on-journal record of an inode's attributes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub ino: InodeNo,
    pub version: Version,
    pub kind: InodeKind,
    pub size: u64,
}

impl InodeRecord {
    #[must_use]
    pub fn new(ino: InodeNo, kind: InodeKind) -> Self {
        Self {
            ino,
            version: 1,
            kind,
            size: 0,
        }
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.kind == InodeKind::Symlink
    }
}
