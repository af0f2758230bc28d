//! Configuration for a QuillFS metadata server

use crate::types::NodeId;
use serde::{Deserialize, Serialize};

/// Default width of the stray inode range (one stray dir per node).
const DEFAULT_MAX_NODES: u64 = 0x100;

/// MDS node configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MdsConfig {
    /// This node's identity within the cluster
    pub node_id: NodeId,
    /// Maximum number of MDS nodes in the cluster; sizes the stray
    /// inode range `[STRAY_INO_BASE, STRAY_INO_BASE + max_nodes)`
    pub max_nodes: u64,
    /// Queue length at which pending journal-open writes are flushed
    pub journal_open_batch: usize,
}

impl Default for MdsConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(0),
            max_nodes: DEFAULT_MAX_NODES,
            journal_open_batch: 16,
        }
    }
}

impl MdsConfig {
    /// Config for a given node, defaults otherwise
    #[must_use]
    pub fn for_node(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }
}
