//! The shared data model: cluster nodes, service groups, service units,
//! service instances, and the assignment table.
//!
//! The model is exclusively owned by the engine; external readers consume
//! clones published at transition boundaries. All maps are ordered so that
//! iteration (and therefore order emission) is deterministic.

mod node;
mod sg;
mod si;
mod su;
mod susi;

pub use node::Node;
pub use sg::{Redistribution, ServiceGroup, SgCapacityUpdate};
pub use si::{ServiceInstance, SponsorEdge};
pub use su::ServiceUnit;
pub use susi::{Assignment, AssignmentTable};

use std::collections::BTreeMap;

use gabbro_types::{
    AdminState, AssignmentState, EntityName, HaState, NodeId, OperState, ReadinessState,
    RedundancyModel, SusiFsm,
};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// The whole engine state tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub nodes: BTreeMap<NodeId, Node>,
    pub sgs: BTreeMap<EntityName, ServiceGroup>,
    pub sus: BTreeMap<EntityName, ServiceUnit>,
    pub sis: BTreeMap<EntityName, ServiceInstance>,
    pub assignments: AssignmentTable,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn node(&self, id: NodeId) -> Result<&Node, EngineError> {
        self.nodes
            .get(&id)
            .ok_or(EngineError::UnknownNode(id.as_u32()))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, EngineError> {
        self.nodes
            .get_mut(&id)
            .ok_or(EngineError::UnknownNode(id.as_u32()))
    }

    pub fn sg(&self, name: &EntityName) -> Result<&ServiceGroup, EngineError> {
        self.sgs.get(name).ok_or_else(|| EngineError::UnknownEntity {
            kind: "service group",
            name: name.clone(),
        })
    }

    pub fn sg_mut(&mut self, name: &EntityName) -> Result<&mut ServiceGroup, EngineError> {
        self.sgs
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownEntity {
                kind: "service group",
                name: name.clone(),
            })
    }

    pub fn su(&self, name: &EntityName) -> Result<&ServiceUnit, EngineError> {
        self.sus.get(name).ok_or_else(|| EngineError::UnknownEntity {
            kind: "service unit",
            name: name.clone(),
        })
    }

    pub fn su_mut(&mut self, name: &EntityName) -> Result<&mut ServiceUnit, EngineError> {
        self.sus
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownEntity {
                kind: "service unit",
                name: name.clone(),
            })
    }

    pub fn si(&self, name: &EntityName) -> Result<&ServiceInstance, EngineError> {
        self.sis.get(name).ok_or_else(|| EngineError::UnknownEntity {
            kind: "service instance",
            name: name.clone(),
        })
    }

    pub fn si_mut(&mut self, name: &EntityName) -> Result<&mut ServiceInstance, EngineError> {
        self.sis
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownEntity {
                kind: "service instance",
                name: name.clone(),
            })
    }

    /// The group owning a unit.
    pub fn sg_of_su(&self, su: &EntityName) -> Result<&ServiceGroup, EngineError> {
        let sg_name = self.su(su)?.sg.clone();
        self.sg(&sg_name)
    }

    // ========================================================================
    // Derived State
    // ========================================================================

    /// Recomputes a unit's readiness from its own state, its node's and its
    /// group's. Returns true if the readiness changed.
    pub fn refresh_su_readiness(&mut self, su_name: &EntityName) -> Result<bool, EngineError> {
        let su = self.su(su_name)?;
        let node = self.node(su.node)?;
        let sg = self.sg(&su.sg)?;
        let in_service = su.oper_state == OperState::Enabled
            && su.admin_state == AdminState::Unlocked
            && sg.admin_state == AdminState::Unlocked
            && node.member
            && node.oper_state == OperState::Enabled
            && node.admin_state != AdminState::Locked;
        let next = if in_service {
            ReadinessState::InService
        } else {
            ReadinessState::OutOfService
        };
        let su = self.su_mut(su_name)?;
        let changed = su.readiness != next;
        if changed {
            tracing::debug!(su = %su_name, readiness = %next, "readiness changed");
            su.readiness = next;
        }
        Ok(changed)
    }

    /// Recomputes a unit's cached assignment counters from the table.
    pub fn refresh_su_counts(&mut self, su_name: &EntityName) -> Result<(), EngineError> {
        let active = self.assignments.count_of_su(su_name, HaState::Active)
            + self.assignments.count_of_su(su_name, HaState::Quiescing);
        let standby = self.assignments.count_of_su(su_name, HaState::Standby);
        let su = self.su_mut(su_name)?;
        su.num_active = active;
        su.num_standby = standby;
        Ok(())
    }

    /// Recomputes an instance's aggregate assignment state.
    ///
    /// Fully assigned means one active plus the standbys the model calls for,
    /// bounded by the supply of other in-service units.
    pub fn refresh_si_state(&mut self, si_name: &EntityName) -> Result<(), EngineError> {
        let si = self.si(si_name)?;
        let sg = self.sg(&si.sg)?;

        let live: Vec<&Assignment> = self
            .assignments
            .of_si(si_name)
            .filter(|a| a.fsm != SusiFsm::Unassigned)
            .collect();
        let active = live.iter().any(|a| a.ha == HaState::Active);
        let standbys = live.iter().filter(|a| a.ha == HaState::Standby).count() as u32;

        let wanted = match sg.model {
            RedundancyModel::TwoN => 1,
            RedundancyModel::NPlusM => sg.pref_num_standby_sus.min(1),
            RedundancyModel::NWay => sg.pref_num_standby_sus,
        };
        // Standbys cannot exceed the other in-service units available.
        let supply = sg
            .sus
            .iter()
            .filter(|name| {
                self.sus
                    .get(*name)
                    .is_some_and(|su| su.is_in_service())
            })
            .count()
            .saturating_sub(1) as u32;
        let needed = wanted.min(supply);

        let next = if live.is_empty() {
            AssignmentState::Unassigned
        } else if active && standbys >= needed {
            AssignmentState::FullyAssigned
        } else {
            AssignmentState::PartiallyAssigned
        };

        self.si_mut(si_name)?.assignment_state = next;
        Ok(())
    }

    /// Refreshes counters and aggregate states touched by a unit's
    /// assignments. Call after any mutation of that unit's rows.
    pub fn refresh_after_su_change(&mut self, su_name: &EntityName) -> Result<(), EngineError> {
        self.refresh_su_counts(su_name)?;
        for si in self.assignments.sis_of_su(su_name) {
            self.refresh_si_state(&si)?;
        }
        Ok(())
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Instances that name `sponsor` as a sponsor.
    pub fn dependents_of(&self, sponsor: &EntityName) -> Vec<EntityName> {
        self.sis
            .values()
            .filter(|si| si.sponsors.iter().any(|edge| &edge.sponsor == sponsor))
            .map(|si| si.name.clone())
            .collect()
    }

    /// In-service units of a group, in rank order.
    pub fn in_service_sus(&self, sg: &ServiceGroup) -> Vec<EntityName> {
        sg.sus
            .iter()
            .filter(|name| self.sus.get(*name).is_some_and(ServiceUnit::is_in_service))
            .cloned()
            .collect()
    }

    /// Inserts a unit into its group's member list, keeping rank order.
    pub(crate) fn link_su_to_sg(&mut self, su_name: &EntityName) -> Result<(), EngineError> {
        let (sg_name, rank) = {
            let su = self.su(su_name)?;
            (su.sg.clone(), su.rank)
        };
        let ranks: BTreeMap<EntityName, gabbro_types::SuRank> = self
            .sus
            .values()
            .map(|su| (su.name.clone(), su.rank))
            .collect();
        let sg = self.sg_mut(&sg_name)?;
        let pos = sg
            .sus
            .iter()
            .position(|other| {
                let other_rank = ranks.get(other).copied().unwrap_or_default();
                (other_rank, other) > (rank, su_name)
            })
            .unwrap_or(sg.sus.len());
        sg.sus.insert(pos, su_name.clone());
        Ok(())
    }

    /// Inserts an instance into its group's member list, keeping rank order.
    pub(crate) fn link_si_to_sg(&mut self, si_name: &EntityName) -> Result<(), EngineError> {
        let (sg_name, rank) = {
            let si = self.si(si_name)?;
            (si.sg.clone(), si.rank)
        };
        let ranks: BTreeMap<EntityName, gabbro_types::SiRank> = self
            .sis
            .values()
            .map(|si| (si.name.clone(), si.rank))
            .collect();
        let sg = self.sg_mut(&sg_name)?;
        let pos = sg
            .sis
            .iter()
            .position(|other| {
                let other_rank = ranks.get(other).copied().unwrap_or_default();
                (other_rank, other) > (rank, si_name)
            })
            .unwrap_or(sg.sis.len());
        sg.sis.insert(pos, si_name.clone());
        Ok(())
    }
}
