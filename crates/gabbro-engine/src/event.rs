//! Engine input events.
//!
//! Everything that can drive a state transition enters through [`Event`]:
//! - Assignment completion replies from the node agents
//! - Operational-state reports for units and nodes
//! - Administrative operations (each carrying an invocation token)
//! - Configuration object changes
//! - Timer expiries
//!
//! The director process owns the mailbox; the engine only consumes typed
//! events, one at a time, on the director's event loop.

use gabbro_types::{EntityName, HaState, Invocation, NodeId, OperState};
use serde::{Deserialize, Serialize};

use crate::config::ConfigEvent;

/// Events that can trigger engine state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Node agent acknowledged (or rejected) an assignment order.
    SusiAssignReply {
        /// The unit the order targeted.
        su: EntityName,
        /// The instance the order targeted; `None` for all-assignment orders.
        si: Option<EntityName>,
        /// Which order is being answered.
        operation: SusiOperation,
        /// HA state carried by the order (absent for deletes).
        ha: Option<HaState>,
        /// Outcome reported by the node agent.
        result: ReplyResult,
    },

    /// Node agent reported a unit operational-state change.
    SuOperState { su: EntityName, oper: OperState },

    /// A node's operational state changed. `Disabled` means the node is gone:
    /// no further orders can be delivered to it.
    NodeOperState { node: NodeId, oper: OperState },

    /// Administrative operation on a service unit.
    SuAdmin {
        su: EntityName,
        op: AdminOp,
        invocation: Invocation,
    },

    /// Administrative operation on a service instance.
    SiAdmin {
        si: EntityName,
        op: SiAdminOp,
        invocation: Invocation,
    },

    /// Administrative operation on a service group.
    SgAdmin {
        sg: EntityName,
        op: SgAdminOp,
        invocation: Invocation,
    },

    /// Configuration object created, modified or deleted.
    Config(ConfigEvent),

    /// A timer armed through [`crate::order::TimerOp::Arm`] expired.
    Timeout(TimeoutKind),
}

/// The order kind a node-agent reply answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SusiOperation {
    Assign,
    Modify,
    Delete,
}

/// Outcome in a node-agent reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplyResult {
    Ok,
    Fail,
}

/// Unit- and group-scoped administrative operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdminOp {
    Lock,
    Unlock,
    Shutdown,
}

/// Instance-scoped administrative operations.
///
/// `Swap` exchanges the active and standby assignments of one instance and is
/// only defined for the 2N model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiAdminOp {
    Lock,
    Unlock,
    Shutdown,
    Swap,
}

/// Group-scoped administrative operations.
///
/// `Adjust` runs one redistribution screening pass on demand, using the same
/// path as `auto_adjust`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SgAdminOp {
    Lock,
    Unlock,
    Shutdown,
    Adjust,
}

/// Types of timeouts that can fire.
///
/// The engine never reads clocks. It arms and cancels timers through
/// [`crate::order::TimerOp`]; the director's timer service delivers expiries
/// back as [`Event::Timeout`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutKind {
    /// Toleration window after a sponsor loss (per dependency edge).
    ///
    /// Until expiry the dependent may keep running; on expiry it is torn down.
    Toleration {
        si: EntityName,
        sponsor: EntityName,
    },

    /// Bound on how long a dependent waits for its sponsor's promotion.
    AwaitActive { si: EntityName },

    /// Bound on how long a MODIFY to quiesced may stay outstanding (per group).
    Quiesced { sg: EntityName },

    /// Tracking timer for one emitted order. Expiry counts as a lost message:
    /// the owning node's loss counter is bumped and a synthetic failure reply
    /// is processed.
    OrderAck {
        su: EntityName,
        /// Mirrors the order granularity: `None` for all-assignment orders.
        si: Option<EntityName>,
    },
}
