//! Cluster node state.

use gabbro_types::{AdminState, EntityName, NodeId, OperState};
use serde::{Deserialize, Serialize};

/// One cluster node, as seen by the engine.
///
/// The engine does not run a membership protocol; `member` and `oper_state`
/// mirror what the node agents report. `lost_acks` accounts for orders whose
/// tracking timer expired before an acknowledgement arrived: one counter per
/// node-agent subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub admin_state: AdminState,
    pub oper_state: OperState,
    pub member: bool,
    pub lost_acks: u64,
    /// Units hosted on this node.
    pub sus: Vec<EntityName>,
}

impl Node {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            admin_state: AdminState::Unlocked,
            oper_state: OperState::Enabled,
            member: true,
            lost_acks: 0,
            sus: Vec::new(),
        }
    }

    /// True while orders can be delivered to this node's agent.
    pub fn is_reachable(&self) -> bool {
        self.member && self.oper_state == OperState::Enabled
    }
}
