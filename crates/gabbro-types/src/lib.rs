//! # gabbro-types: Core types for Gabbro
//!
//! This crate contains the shared vocabulary of the availability engine:
//! - Entity identifiers ([`EntityName`], [`NodeId`], [`Invocation`])
//! - Rank types ([`SuRank`], [`SiRank`])
//! - HA role and lifecycle enums ([`HaState`], [`AdminState`], [`OperState`],
//!   [`ReadinessState`], [`AssignmentState`])
//! - Assignment and group state machines ([`SusiFsm`], [`SgFsmState`])
//! - Redundancy models ([`RedundancyModel`])
//! - Service-instance dependency states ([`DepState`])
//!
//! Everything here is a plain value type: cheap to clone, ordered where a
//! deterministic iteration order matters, and serializable so the director
//! process can checkpoint and inspect engine state.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// Entity Identifiers
// ============================================================================

/// Distinguished name of a configured entity (service group, service unit,
/// service instance).
///
/// Names are opaque to the engine; it only compares and orders them. The
/// configuration layer guarantees uniqueness per entity class.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct EntityName(String);

impl EntityName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityName {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for EntityName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unique identifier of a cluster node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(u32);

impl NodeId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Administrative invocation token.
///
/// Every administrative operation carries one; the engine owes exactly one
/// reply per token, whatever the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Invocation(u64);

impl Invocation {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Ranks
// ============================================================================

/// Rank of a service unit within its group. Lower value = higher preference.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SuRank(u32);

impl SuRank {
    pub fn new(rank: u32) -> Self {
        Self(rank)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for SuRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rank of a service instance within its group. Lower value = higher
/// preference; higher-ranked instances are assigned first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SiRank(u32);

impl SiRank {
    pub fn new(rank: u32) -> Self {
        Self(rank)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for SiRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// HA Roles and Entity States
// ============================================================================

/// High-availability role of one assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HaState {
    /// Serving the workload.
    Active,
    /// Replicating, ready to take over.
    Standby,
    /// Draining: still serving but refusing new work.
    Quiescing,
    /// Drained: holds state but serves nothing.
    Quiesced,
}

impl HaState {
    /// Active-side roles: the assignment currently owns (or is draining)
    /// the workload.
    pub fn is_active_side(self) -> bool {
        matches!(self, Self::Active | Self::Quiescing)
    }
}

impl Display for HaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::Standby => "STANDBY",
            Self::Quiescing => "QUIESCING",
            Self::Quiesced => "QUIESCED",
        };
        write!(f, "{s}")
    }
}

/// Administrative state of a node, group, unit or instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AdminState {
    #[default]
    Unlocked,
    Locked,
    /// Transitional: draining before reaching [`AdminState::Locked`].
    ShuttingDown,
}

impl Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unlocked => "UNLOCKED",
            Self::Locked => "LOCKED",
            Self::ShuttingDown => "SHUTTING_DOWN",
        };
        write!(f, "{s}")
    }
}

/// Operational (health) state reported by the node agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OperState {
    #[default]
    Enabled,
    Disabled,
}

impl Display for OperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Enabled => "ENABLED",
            Self::Disabled => "DISABLED",
        };
        write!(f, "{s}")
    }
}

/// Readiness of a service unit to take assignments.
///
/// Derived state: a unit is in service only while it is healthy, unlocked,
/// and its node is a healthy cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReadinessState {
    InService,
    #[default]
    OutOfService,
}

impl Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InService => "IN_SERVICE",
            Self::OutOfService => "OUT_OF_SERVICE",
        };
        write!(f, "{s}")
    }
}

/// Aggregate assignment state of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AssignmentState {
    #[default]
    Unassigned,
    PartiallyAssigned,
    FullyAssigned,
}

impl Display for AssignmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unassigned => "UNASSIGNED",
            Self::PartiallyAssigned => "PARTIALLY_ASSIGNED",
            Self::FullyAssigned => "FULLY_ASSIGNED",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Assignment FSM
// ============================================================================

/// Per-assignment message state machine.
///
/// ```text
/// Assigning --ack--> Assigned --modify--> Modifying --ack--> Assigned
///     |                  |                    |
///     +------------- delete ------------------+
///     |
///     v
/// Unassigning --ack--> Unassigned (record destroyed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SusiFsm {
    Assigning,
    Assigned,
    Modifying,
    Unassigning,
    Unassigned,
}

impl SusiFsm {
    /// Terminal states: no order is outstanding for this assignment.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Assigned | Self::Unassigned)
    }
}

impl Display for SusiFsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Assigning => "ASSIGNING",
            Self::Assigned => "ASSIGNED",
            Self::Modifying => "MODIFYING",
            Self::Unassigning => "UNASSIGNING",
            Self::Unassigned => "UNASSIGNED",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Service Group FSM
// ============================================================================

/// Top-level state of one service group's redundancy state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SgFsmState {
    /// No outstanding orders; all invariants hold.
    #[default]
    Stable,
    /// Orders are settling after a topology change.
    SgRealign,
    /// A single unit is under operation (fault handling, switch, transfer).
    SuOper,
    /// A single instance is under an instance-scoped admin operation.
    SiOper,
    /// The whole group is under a group-scoped admin operation.
    SgAdmin,
}

impl Display for SgFsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stable => "STABLE",
            Self::SgRealign => "SG_REALIGN",
            Self::SuOper => "SU_OPER",
            Self::SiOper => "SI_OPER",
            Self::SgAdmin => "SG_ADMIN",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Redundancy Models
// ============================================================================

/// The redundancy model governing a service group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RedundancyModel {
    /// One active unit, one standby unit, group-wide.
    TwoN,
    /// Up to N active units plus up to M standby units; standby pairing is
    /// one-to-one per unit.
    NPlusM,
    /// Each instance may hold standby assignments on several units.
    NWay,
}

impl Display for RedundancyModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TwoN => "2N",
            Self::NPlusM => "N+M",
            Self::NWay => "N-Way",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Dependency States
// ============================================================================

/// Sponsor-dependency state of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DepState {
    /// The instance has no sponsors.
    #[default]
    NoDependency,
    /// All sponsors hold the HA state the instance requires.
    Assigned,
    /// Some sponsor is unassigned; the instance must not be assigned.
    SponsorUnassigned,
    /// The instance is being torn down because a sponsor was lost.
    UnassigningDueToDep,
    /// Toleration expired; teardown orders are about to be issued.
    ReadyToUnassign,
    /// A sponsor was lost; the toleration timer is running.
    TolTimerRunning,
    /// A sponsor is failing over; the instance waits for its new active.
    FailoverUnderProgress,
}

impl Display for DepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoDependency => "NO_DEPENDENCY",
            Self::Assigned => "ASSIGNED",
            Self::SponsorUnassigned => "SPONSOR_UNASSIGNED",
            Self::UnassigningDueToDep => "UNASSIGNING_DUE_TO_DEP",
            Self::ReadyToUnassign => "READY_TO_UNASSIGN",
            Self::TolTimerRunning => "TOL_TIMER_RUNNING",
            Self::FailoverUnderProgress => "FAILOVER_UNDER_PROGRESS",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Switch Toggle
// ============================================================================

/// Switch flag used while an instance swap is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Toggle {
    #[default]
    Stable,
    Switch,
}

impl Toggle {
    pub fn is_switch(self) -> bool {
        matches!(self, Self::Switch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_name_ordering_is_lexicographic() {
        let a = EntityName::from("safSu=su1");
        let b = EntityName::from("safSu=su2");
        assert!(a < b);
        assert_eq!(a.as_str(), "safSu=su1");
    }

    #[test]
    fn ha_state_active_side() {
        assert!(HaState::Active.is_active_side());
        assert!(HaState::Quiescing.is_active_side());
        assert!(!HaState::Standby.is_active_side());
        assert!(!HaState::Quiesced.is_active_side());
    }

    #[test]
    fn susi_fsm_terminal_states() {
        assert!(SusiFsm::Assigned.is_terminal());
        assert!(SusiFsm::Unassigned.is_terminal());
        assert!(!SusiFsm::Assigning.is_terminal());
        assert!(!SusiFsm::Modifying.is_terminal());
        assert!(!SusiFsm::Unassigning.is_terminal());
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(HaState::Quiesced.to_string(), "QUIESCED");
        assert_eq!(SgFsmState::SgRealign.to_string(), "SG_REALIGN");
        assert_eq!(DepState::TolTimerRunning.to_string(), "TOL_TIMER_RUNNING");
        assert_eq!(RedundancyModel::NPlusM.to_string(), "N+M");
    }
}
