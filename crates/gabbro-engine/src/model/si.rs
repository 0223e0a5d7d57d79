//! Service instance state.

use std::time::Duration;

use gabbro_types::{
    AdminState, AssignmentState, DepState, EntityName, HaState, Invocation, SiRank, Toggle,
};
use serde::{Deserialize, Serialize};

/// A directed dependency edge: this instance requires its sponsor to hold
/// `required_ha` before it may itself be assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorEdge {
    pub sponsor: EntityName,
    pub required_ha: HaState,
    /// Grace period after sponsor loss before the dependent is torn down.
    pub toleration: Duration,
}

/// One service instance: the workload, assigned to units in HA roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: EntityName,
    pub sg: EntityName,
    pub rank: SiRank,

    pub admin_state: AdminState,
    pub assignment_state: AssignmentState,
    pub dep_state: DepState,

    /// Component service instances configured under this instance.
    pub configured_csis: u32,
    /// Component service instances discovered so far. The instance is only
    /// assignable once every configured child exists.
    pub discovered_csis: u32,

    /// Set while this instance is being swapped.
    pub switch_flag: Toggle,

    /// Outstanding instance-scoped admin invocation (swap), if any.
    pub invocation: Option<Invocation>,

    /// Sponsors of this instance, with the HA state each must hold.
    pub sponsors: Vec<SponsorEdge>,

    /// Preferred units for this instance, highest preference first. Used by
    /// the N-Way chooser before falling back to group rank order.
    pub ranked_sus: Vec<EntityName>,
}

impl ServiceInstance {
    /// All configured component instances have been discovered.
    pub fn csis_ready(&self) -> bool {
        self.configured_csis > 0 && self.discovered_csis == self.configured_csis
    }

    /// Eligibility for new assignments: unlocked, children complete, and not
    /// blocked or being torn down by the dependency tracker.
    pub fn is_assignable(&self) -> bool {
        self.admin_state == AdminState::Unlocked
            && self.csis_ready()
            && !matches!(
                self.dep_state,
                DepState::SponsorUnassigned
                    | DepState::UnassigningDueToDep
                    | DepState::ReadyToUnassign
            )
    }

    pub fn has_sponsors(&self) -> bool {
        !self.sponsors.is_empty()
    }
}
