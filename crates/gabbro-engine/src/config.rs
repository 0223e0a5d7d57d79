//! Configuration objects and their validation.
//!
//! The configuration layer (external to the engine) translates object
//! create/modify/delete callbacks into [`ConfigEvent`]s. Creation is
//! validated here; a group whose configuration is invalid is refused
//! activation and processes no further events.
//!
//! Capacity and preferred-count modifications do not take effect
//! immediately: they are parked on the group and applied at the next
//! STABLE entry.

use std::time::Duration;

use gabbro_types::{
    AdminState, AssignmentState, DepState, EntityName, HaState, NodeId, OperState, ReadinessState,
    RedundancyModel, SiRank, SuRank, Toggle,
};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::{
    Model, Node, ServiceGroup, ServiceInstance, ServiceUnit, SgCapacityUpdate, SponsorEdge,
};

// ============================================================================
// Configuration Objects
// ============================================================================

/// Group configuration at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SgConfig {
    pub name: EntityName,
    pub model: RedundancyModel,
    pub pref_num_active_sus: u32,
    pub pref_num_standby_sus: u32,
    /// 0 means unlimited.
    pub max_active_sis_per_su: u32,
    /// 0 means unlimited.
    pub max_standby_sis_per_su: u32,
    pub auto_adjust: bool,
    pub equal_ranked_sus: bool,
}

impl SgConfig {
    pub fn new(name: impl Into<EntityName>, model: RedundancyModel) -> Self {
        Self {
            name: name.into(),
            model,
            pref_num_active_sus: 1,
            pref_num_standby_sus: 1,
            max_active_sis_per_su: 0,
            max_standby_sis_per_su: 0,
            auto_adjust: false,
            equal_ranked_sus: false,
        }
    }
}

/// Unit configuration at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuConfig {
    pub name: EntityName,
    pub sg: EntityName,
    pub node: NodeId,
    pub rank: SuRank,
    /// 0 means unlimited.
    pub max_active: u32,
    /// 0 means unlimited.
    pub max_standby: u32,
}

/// Instance configuration at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiConfig {
    pub name: EntityName,
    pub sg: EntityName,
    pub rank: SiRank,
    pub configured_csis: u32,
    /// Preferred units for this instance, highest preference first.
    pub ranked_sus: Vec<EntityName>,
}

/// Dependency edge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub dependent: EntityName,
    pub sponsor: EntityName,
    pub required_ha: HaState,
    pub toleration: Duration,
}

/// Configuration object changes delivered to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigEvent {
    NodeAdded(NodeId),
    SgAdded(SgConfig),
    SuAdded(SuConfig),
    SiAdded(SiConfig),
    DependencyAdded(DependencyConfig),
    /// Deferred capacity change; effective at the next STABLE entry.
    SgModified {
        sg: EntityName,
        update: SgCapacityUpdate,
    },
    /// Component instances reported under an instance. The instance becomes
    /// assignable once the discovered count reaches the configured count.
    CsisDiscovered { si: EntityName, count: u32 },
    SiRemoved(EntityName),
    SuRemoved(EntityName),
    SgRemoved(EntityName),
}

// ============================================================================
// Validation & Application
// ============================================================================

impl Model {
    pub(crate) fn create_node(&mut self, id: NodeId) -> Result<(), EngineError> {
        if self.nodes.contains_key(&id) {
            return Err(EngineError::InvalidConfig(format!("node {id} exists")));
        }
        self.nodes.insert(id, Node::new(id));
        Ok(())
    }

    pub(crate) fn create_sg(&mut self, cfg: SgConfig) -> Result<(), EngineError> {
        if self.sgs.contains_key(&cfg.name) {
            return Err(EngineError::AlreadyExists(cfg.name));
        }
        let sg = ServiceGroup {
            name: cfg.name.clone(),
            model: cfg.model,
            admin_state: AdminState::Unlocked,
            pref_num_active_sus: cfg.pref_num_active_sus,
            pref_num_standby_sus: cfg.pref_num_standby_sus,
            max_active_sis_per_su: cfg.max_active_sis_per_su,
            max_standby_sis_per_su: cfg.max_standby_sis_per_su,
            auto_adjust: cfg.auto_adjust,
            equal_ranked_sus: cfg.equal_ranked_sus,
            fsm_state: gabbro_types::SgFsmState::Stable,
            su_oper_list: Vec::new(),
            admin_si: None,
            redistribution: None,
            sus: Vec::new(),
            sis: Vec::new(),
            pending_invocation: None,
            pending_update: None,
            activated: true,
        };
        self.sgs.insert(cfg.name, sg);
        Ok(())
    }

    pub(crate) fn create_su(&mut self, cfg: SuConfig) -> Result<(), EngineError> {
        if self.sus.contains_key(&cfg.name) {
            return Err(EngineError::AlreadyExists(cfg.name));
        }
        self.sg(&cfg.sg)?;
        self.node(cfg.node)?;
        let su = ServiceUnit {
            name: cfg.name.clone(),
            sg: cfg.sg,
            node: cfg.node,
            rank: cfg.rank,
            admin_state: AdminState::Unlocked,
            oper_state: OperState::Enabled,
            readiness: ReadinessState::OutOfService,
            num_active: 0,
            num_standby: 0,
            max_active: cfg.max_active,
            max_standby: cfg.max_standby,
            switch_flag: Toggle::Stable,
            pending_invocation: None,
        };
        let node_id = su.node;
        self.sus.insert(cfg.name.clone(), su);
        self.link_su_to_sg(&cfg.name)?;
        self.node_mut(node_id)?.sus.push(cfg.name.clone());
        self.refresh_su_readiness(&cfg.name)?;
        Ok(())
    }

    pub(crate) fn create_si(&mut self, cfg: SiConfig) -> Result<(), EngineError> {
        if self.sis.contains_key(&cfg.name) {
            return Err(EngineError::AlreadyExists(cfg.name));
        }
        self.sg(&cfg.sg)?;
        let si = ServiceInstance {
            name: cfg.name.clone(),
            sg: cfg.sg,
            rank: cfg.rank,
            admin_state: AdminState::Unlocked,
            assignment_state: AssignmentState::Unassigned,
            dep_state: DepState::NoDependency,
            configured_csis: cfg.configured_csis,
            discovered_csis: 0,
            switch_flag: Toggle::Stable,
            invocation: None,
            sponsors: Vec::new(),
            ranked_sus: cfg.ranked_sus,
        };
        self.sis.insert(cfg.name.clone(), si);
        self.link_si_to_sg(&cfg.name)?;
        Ok(())
    }

    /// Adds a dependency edge after checking both endpoints exist and the
    /// edge keeps the graph acyclic. On rejection the dependent's group is
    /// deactivated: a group with a broken dependency graph must not run.
    pub(crate) fn add_dependency(&mut self, cfg: DependencyConfig) -> Result<(), EngineError> {
        if self.sis.get(&cfg.sponsor).is_none() {
            let dependent_sg = self.si(&cfg.dependent)?.sg.clone();
            self.sg_mut(&dependent_sg)?.activated = false;
            return Err(EngineError::InvalidConfig(format!(
                "undefined sponsor '{}'",
                cfg.sponsor
            )));
        }
        self.si(&cfg.dependent)?;

        if cfg.dependent == cfg.sponsor || self.depends_on(&cfg.sponsor, &cfg.dependent) {
            let dependent_sg = self.si(&cfg.dependent)?.sg.clone();
            self.sg_mut(&dependent_sg)?.activated = false;
            return Err(EngineError::DependencyCycle {
                dependent: cfg.dependent,
                sponsor: cfg.sponsor,
            });
        }

        let si = self.si_mut(&cfg.dependent)?;
        si.sponsors.push(SponsorEdge {
            sponsor: cfg.sponsor,
            required_ha: cfg.required_ha,
            toleration: cfg.toleration,
        });
        if si.dep_state == DepState::NoDependency {
            si.dep_state = DepState::SponsorUnassigned;
        }
        Ok(())
    }

    /// True iff `si` (transitively) depends on `candidate`.
    fn depends_on(&self, si: &EntityName, candidate: &EntityName) -> bool {
        let Some(instance) = self.sis.get(si) else {
            return false;
        };
        instance.sponsors.iter().any(|edge| {
            edge.sponsor == *candidate || self.depends_on(&edge.sponsor, candidate)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_with_two_sis() -> Model {
        let mut model = Model::new();
        model
            .create_sg(SgConfig::new("sg", RedundancyModel::TwoN))
            .unwrap();
        for name in ["si-a", "si-b"] {
            model
                .create_si(SiConfig {
                    name: name.into(),
                    sg: "sg".into(),
                    rank: SiRank::new(1),
                    configured_csis: 1,
                    ranked_sus: Vec::new(),
                })
                .unwrap();
        }
        model
    }

    fn edge(dependent: &str, sponsor: &str) -> DependencyConfig {
        DependencyConfig {
            dependent: dependent.into(),
            sponsor: sponsor.into(),
            required_ha: HaState::Active,
            toleration: Duration::from_secs(3),
        }
    }

    #[test]
    fn dependency_cycle_is_rejected() {
        let mut model = model_with_two_sis();
        model.add_dependency(edge("si-b", "si-a")).unwrap();
        let err = model.add_dependency(edge("si-a", "si-b")).unwrap_err();
        assert!(matches!(err, EngineError::DependencyCycle { .. }));
        assert!(!model.sg(&"sg".into()).unwrap().activated);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut model = model_with_two_sis();
        let err = model.add_dependency(edge("si-a", "si-a")).unwrap_err();
        assert!(matches!(err, EngineError::DependencyCycle { .. }));
    }

    #[test]
    fn undefined_sponsor_deactivates_group() {
        let mut model = model_with_two_sis();
        let err = model.add_dependency(edge("si-a", "si-missing")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
        assert!(!model.sg(&"sg".into()).unwrap().activated);
    }

    #[test]
    fn dependency_sets_sponsor_unassigned() {
        let mut model = model_with_two_sis();
        model.add_dependency(edge("si-b", "si-a")).unwrap();
        assert_eq!(
            model.si(&"si-b".into()).unwrap().dep_state,
            DepState::SponsorUnassigned
        );
    }
}
