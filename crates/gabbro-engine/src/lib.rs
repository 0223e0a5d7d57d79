//! # gabbro-engine: the redundancy-model engine
//!
//! This crate implements the core of an availability-management director:
//! the per-service-group state machines that decide, under faults,
//! administrative actions and topology changes, which service units host
//! which service instances in which HA role. Three redundancy models are
//! implemented (2N, N+M and N-Way) as distinct finite state machines over a
//! shared data model.
//!
//! # Architecture
//!
//! The engine is a passive, deterministic library:
//! - Takes typed events as input (node-agent replies, operational reports,
//!   administrative operations, configuration changes, timer expiries)
//! - Produces assignment orders, administrative replies, timer operations
//!   and checkpoint effects as output
//! - No I/O, no clocks, no locks: all waiting is expressed as state
//!
//! The director process owns the event loop, the messaging transport, the
//! timer service and the checkpoint channel; the engine only decides.
//!
//! ```text
//! node agents ──replies──► Engine::handle_event ──orders──► node agents
//! admin layer ──ops──────►        │            ──replies──► admin layer
//! timer svc   ──expiry───►        │            ──arm/cancel─► timer svc
//! config layer──objects──►        ▼            ──checkpoints► standby
//!                          per-group FSMs
//!                 (2N / N+M / N-Way × 5 states)
//! ```
//!
//! # Layers
//!
//! Leaves first: the dependency tracker (`sidep`) knows when an instance may
//! be promoted; the orchestrator (`assign`) emits orders and keeps the
//! operation lists; the per-model state machines (`sg`) drive the redundancy
//! semantics on top of both.
//!
//! # Key Types
//!
//! - [`Engine`]: the context handle; one per director process
//! - [`Event`]: everything that can trigger a transition
//! - [`EngineOutput`]: everything a transition can produce
//! - [`Model`]: the state tree (groups, units, instances, assignments)

mod assign;
mod config;
mod engine;
mod error;
mod event;
mod model;
mod order;
mod sg;
mod sidep;

#[cfg(test)]
mod tests;

pub use config::{ConfigEvent, DependencyConfig, SgConfig, SiConfig, SuConfig};
pub use engine::Engine;
pub use error::EngineError;
pub use event::{
    AdminOp, Event, ReplyResult, SgAdminOp, SiAdminOp, SusiOperation, TimeoutKind,
};
pub use model::{
    Assignment, AssignmentTable, Model, Node, Redistribution, ServiceGroup, ServiceInstance,
    ServiceUnit, SgCapacityUpdate, SponsorEdge,
};
pub use order::{AdminReply, AdminStatus, Effect, EngineOutput, Order, SgCheckpoint, TimerOp};
