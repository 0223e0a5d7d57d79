//! Engine outputs.
//!
//! Processing one event produces an [`EngineOutput`]: assignment orders for
//! the node agents, administrative replies, timer operations, and checkpoint
//! effects. The engine never performs I/O itself; the director executes the
//! output after the transition has been committed:
//!
//! 1. Send `orders` through the messaging layer (FIFO per destination)
//! 2. Deliver `admin_replies` to the administrative layer
//! 3. Apply `timers` to the timer service
//! 4. Forward `effects` to the checkpoint layer (fire-and-forget)

use gabbro_types::{EntityName, HaState, Invocation, SgFsmState};
use serde::{Deserialize, Serialize};

use crate::event::TimeoutKind;

// ============================================================================
// Assignment Orders
// ============================================================================

/// An assignment order for a node agent.
///
/// `si: None` addresses every assignment the unit currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    /// Create a new assignment with the given role.
    Assign {
        su: EntityName,
        si: EntityName,
        ha: HaState,
    },

    /// Change the role of existing assignments.
    Modify {
        su: EntityName,
        si: Option<EntityName>,
        ha: HaState,
    },

    /// Remove assignments.
    Delete {
        su: EntityName,
        si: Option<EntityName>,
    },
}

impl Order {
    /// The unit this order is addressed to.
    pub fn su(&self) -> &EntityName {
        match self {
            Self::Assign { su, .. } | Self::Modify { su, .. } | Self::Delete { su, .. } => su,
        }
    }
}

// ============================================================================
// Administrative Replies
// ============================================================================

/// Outcome reported back for an administrative invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminStatus {
    Ok,
    /// The operation is not valid for the target in its current configuration.
    BadOperation,
    /// The operation cannot run now (group not stable); retry later.
    TryAgain,
}

/// Exactly one of these is produced per received administrative invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminReply {
    pub invocation: Invocation,
    pub status: AdminStatus,
}

// ============================================================================
// Timer Operations
// ============================================================================

/// Timer instructions for the director's timer service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerOp {
    Arm(TimeoutKind),
    Cancel(TimeoutKind),
}

// ============================================================================
// Checkpoint Effects
// ============================================================================

/// Per-group checkpoint delta, captured at every transition boundary where
/// the group's replicated fields changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SgCheckpoint {
    pub sg: EntityName,
    pub fsm_state: SgFsmState,
    pub su_oper_list: Vec<EntityName>,
    pub admin_si: Option<EntityName>,
    pub redistribution: Option<(EntityName, EntityName, EntityName)>,
}

/// An effect to be executed by the director.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    /// Ship a serialized group checkpoint to the standby director.
    ///
    /// Encoding is canonical `postcard` bytes of [`SgCheckpoint`]. Send is
    /// fire-and-forget; the engine never waits on it.
    Checkpoint { sg: EntityName, bytes: Vec<u8> },
}

// ============================================================================
// Engine Output
// ============================================================================

/// Output produced by processing one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOutput {
    /// Assignment orders to send to node agents.
    pub orders: Vec<Order>,

    /// Replies owed to the administrative layer.
    pub admin_replies: Vec<AdminReply>,

    /// Timer arms/cancels for the timer service.
    pub timers: Vec<TimerOp>,

    /// Effects for the checkpoint layer.
    pub effects: Vec<Effect>,
}

impl EngineOutput {
    /// Creates an empty output.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if nothing was produced.
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
            && self.admin_replies.is_empty()
            && self.timers.is_empty()
            && self.effects.is_empty()
    }

    /// Merges another output into this one, preserving order.
    pub fn merge(&mut self, other: EngineOutput) {
        self.orders.extend(other.orders);
        self.admin_replies.extend(other.admin_replies);
        self.timers.extend(other.timers);
        self.effects.extend(other.effects);
    }

    pub(crate) fn push_order(&mut self, order: Order) {
        self.orders.push(order);
    }

    pub(crate) fn reply(&mut self, invocation: Invocation, status: AdminStatus) {
        self.admin_replies.push(AdminReply { invocation, status });
    }

    pub(crate) fn arm(&mut self, kind: TimeoutKind) {
        self.timers.push(TimerOp::Arm(kind));
    }

    pub(crate) fn cancel(&mut self, kind: TimeoutKind) {
        self.timers.push(TimerOp::Cancel(kind));
    }
}
