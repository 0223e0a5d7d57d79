//! Engine error types.

use gabbro_types::{EntityName, HaState};
use thiserror::Error;

/// Errors surfaced by the engine.
///
/// Administrative rejections are not errors: they are reported through
/// [`crate::order::AdminReply`] so the invocation always gets exactly one
/// answer. `EngineError` covers configuration faults and internal refusals
/// that the caller (or a state-machine handler) must react to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("unknown {kind} '{name}'")]
    UnknownEntity { kind: &'static str, name: EntityName },

    #[error("unknown node {0}")]
    UnknownNode(u32),

    #[error("'{0}' already exists")]
    AlreadyExists(EntityName),

    #[error("operation not valid in the current state")]
    BadOperation,

    #[error("operation cannot be performed now, retry later")]
    TryAgain,

    #[error("service unit '{0}' is not in service")]
    NotInService(EntityName),

    #[error("no capacity on '{su}' for {ha} assignment")]
    CapacityExhausted { su: EntityName, ha: HaState },

    #[error("sponsors of '{0}' are not assigned")]
    SponsorsNotReady(EntityName),

    #[error("dependency from '{dependent}' to '{sponsor}' would create a cycle")]
    DependencyCycle {
        dependent: EntityName,
        sponsor: EntityName,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
