//! Service unit state.

use gabbro_types::{
    AdminState, EntityName, Invocation, NodeId, OperState, ReadinessState, SuRank, Toggle,
};
use serde::{Deserialize, Serialize};

/// One service unit: a deployable part of a group, hosted on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUnit {
    pub name: EntityName,
    pub sg: EntityName,
    pub node: NodeId,
    pub rank: SuRank,

    pub admin_state: AdminState,
    pub oper_state: OperState,
    /// Derived from admin/oper state of the unit and its node; see
    /// [`crate::model::Model::refresh_su_readiness`].
    pub readiness: ReadinessState,

    /// Cached assignment counts, kept in sync with the assignment table.
    pub num_active: u32,
    pub num_standby: u32,

    /// Per-unit caps on assignments; 0 means unlimited.
    pub max_active: u32,
    pub max_standby: u32,

    /// Set while this unit is the active side of an instance swap.
    pub switch_flag: Toggle,

    /// Outstanding unit-scoped admin invocation, if any.
    pub pending_invocation: Option<Invocation>,
}

impl ServiceUnit {
    pub fn is_in_service(&self) -> bool {
        self.readiness == ReadinessState::InService
    }

    /// Capacity check for one more assignment of the given side, against the
    /// per-unit cap only. The group-wide cap is checked by the orchestrator.
    pub fn has_local_capacity(&self, active_side: bool) -> bool {
        if active_side {
            self.max_active == 0 || self.num_active < self.max_active
        } else {
            self.max_standby == 0 || self.num_standby < self.max_standby
        }
    }
}
