//! Integration tests for gabbro-engine.
//!
//! These exercise whole event sequences against the public surface: the
//! literal failover/admin scenarios, the round-trip laws, the boundary
//! behaviours, and randomized invariant exploration.

use std::collections::VecDeque;
use std::time::Duration;

use gabbro_types::{
    AdminState, AssignmentState, DepState, EntityName, HaState, Invocation, NodeId,
    OperState, RedundancyModel, SgFsmState, SiRank, SuRank, SusiFsm,
};
use test_case::test_case;

use crate::{
    AdminOp, AdminReply, AdminStatus, ConfigEvent, DependencyConfig, Effect, Engine, Event, Order,
    ReplyResult, SgAdminOp, SgCheckpoint, SgConfig, SiAdminOp, SiConfig, SuConfig, SusiOperation,
    TimeoutKind,
};

// ============================================================================
// Helpers
// ============================================================================

fn name(s: &str) -> EntityName {
    EntityName::from(s)
}

fn apply(engine: &mut Engine, event: Event) -> crate::EngineOutput {
    engine.handle_event(event).expect("event handled")
}

/// Builds the success reply a node agent would send for an order.
fn ack(order: &Order) -> Event {
    match order {
        Order::Assign { su, si, ha } => Event::SusiAssignReply {
            su: su.clone(),
            si: Some(si.clone()),
            operation: SusiOperation::Assign,
            ha: Some(*ha),
            result: ReplyResult::Ok,
        },
        Order::Modify { su, si, ha } => Event::SusiAssignReply {
            su: su.clone(),
            si: si.clone(),
            operation: SusiOperation::Modify,
            ha: Some(*ha),
            result: ReplyResult::Ok,
        },
        Order::Delete { su, si } => Event::SusiAssignReply {
            su: su.clone(),
            si: si.clone(),
            operation: SusiOperation::Delete,
            ha: None,
            result: ReplyResult::Ok,
        },
    }
}

/// Acknowledges every outstanding order (and those produced by the
/// acknowledgements) until the engine goes quiet. Returns every order seen
/// and every admin reply produced along the way.
fn settle(engine: &mut Engine, initial: crate::EngineOutput) -> (Vec<Order>, Vec<AdminReply>) {
    let mut queue: VecDeque<Order> = initial.orders.iter().cloned().collect();
    let mut seen = initial.orders;
    let mut replies = initial.admin_replies;
    let mut rounds = 0;
    while let Some(order) = queue.pop_front() {
        rounds += 1;
        assert!(rounds < 500, "settling did not converge");
        let out = apply(engine, ack(&order));
        // A graceful drain completes through an unsolicited quiesced report.
        let follow_up = if let Order::Modify {
            su,
            si,
            ha: HaState::Quiescing,
        } = &order
        {
            Some(apply(
                engine,
                Event::SusiAssignReply {
                    su: su.clone(),
                    si: si.clone(),
                    operation: SusiOperation::Modify,
                    ha: Some(HaState::Quiesced),
                    result: ReplyResult::Ok,
                },
            ))
        } else {
            None
        };
        for extra in std::iter::once(out).chain(follow_up) {
            seen.extend(extra.orders.iter().cloned());
            queue.extend(extra.orders);
            replies.extend(extra.admin_replies);
        }
    }
    (seen, replies)
}

fn assignment(engine: &Engine, su: &str, si: &str) -> Option<(HaState, SusiFsm)> {
    engine
        .model()
        .assignments
        .get(&name(su), &name(si))
        .map(|a| (a.ha, a.fsm))
}

fn assert_stable(engine: &Engine, sg: &str) {
    let group = engine.model().sg(&name(sg)).expect("group exists");
    assert_eq!(group.fsm_state, SgFsmState::Stable, "group should be stable");
    engine.verify_invariants().expect("invariants hold");
}

fn su_config(su: &str, sg: &str, node: u32, rank: u32) -> SuConfig {
    SuConfig {
        name: name(su),
        sg: name(sg),
        node: NodeId::new(node),
        rank: SuRank::new(rank),
        max_active: 0,
        max_standby: 0,
    }
}

fn si_config(si: &str, sg: &str, rank: u32) -> SiConfig {
    SiConfig {
        name: name(si),
        sg: name(sg),
        rank: SiRank::new(rank),
        configured_csis: 1,
        ranked_sus: Vec::new(),
    }
}

/// A 2N group with `sus` units (one per node, ranked by index) and `sis`
/// instances, driven to its initial stable assignment.
fn two_n_engine(sus: u32, sis: u32) -> Engine {
    let mut engine = Engine::new();
    for n in 1..=sus {
        apply(&mut engine, Event::Config(ConfigEvent::NodeAdded(NodeId::new(n))));
    }
    apply(
        &mut engine,
        Event::Config(ConfigEvent::SgAdded(SgConfig::new("g", RedundancyModel::TwoN))),
    );
    for n in 1..=sus {
        apply(
            &mut engine,
            Event::Config(ConfigEvent::SuAdded(su_config(&format!("s{n}"), "g", n, n))),
        );
    }
    for k in 1..=sis {
        apply(
            &mut engine,
            Event::Config(ConfigEvent::SiAdded(si_config(&format!("i{k}"), "g", k))),
        );
    }
    let mut pending = crate::EngineOutput::empty();
    for k in 1..=sis {
        pending.merge(apply(
            &mut engine,
            Event::Config(ConfigEvent::CsisDiscovered {
                si: name(&format!("i{k}")),
                count: 1,
            }),
        ));
    }
    settle(&mut engine, pending);
    assert_stable(&engine, "g");
    engine
}

// ============================================================================
// 2N: Initial Assignment and Failover
// ============================================================================

#[test]
fn two_n_initial_assignment() {
    let engine = two_n_engine(2, 1);
    assert_eq!(
        assignment(&engine, "s1", "i1"),
        Some((HaState::Active, SusiFsm::Assigned))
    );
    assert_eq!(
        assignment(&engine, "s2", "i1"),
        Some((HaState::Standby, SusiFsm::Assigned))
    );
    let i1 = engine.model().si(&name("i1")).unwrap();
    assert_eq!(i1.assignment_state, AssignmentState::FullyAssigned);
}

/// The literal 2N active-failover sequence: quiesce the faulted unit, and
/// on its acknowledgement promote the standby and delete the old side.
#[test]
fn two_n_active_failover_order_sequence() {
    let mut engine = two_n_engine(2, 1);

    let out = apply(
        &mut engine,
        Event::SuOperState {
            su: name("s1"),
            oper: OperState::Disabled,
        },
    );
    assert_eq!(
        out.orders,
        vec![Order::Modify {
            su: name("s1"),
            si: None,
            ha: HaState::Quiesced,
        }]
    );
    assert_eq!(
        engine.model().sg(&name("g")).unwrap().fsm_state,
        SgFsmState::SuOper
    );

    let out = apply(&mut engine, ack(&out.orders[0]));
    assert_eq!(
        out.orders,
        vec![
            Order::Modify {
                su: name("s2"),
                si: Some(name("i1")),
                ha: HaState::Active,
            },
            Order::Delete {
                su: name("s1"),
                si: None,
            },
        ]
    );

    settle(&mut engine, out);
    assert_stable(&engine, "g");
    assert_eq!(
        assignment(&engine, "s2", "i1"),
        Some((HaState::Active, SusiFsm::Assigned))
    );
    assert_eq!(assignment(&engine, "s1", "i1"), None);
    assert!(engine.model().assignments.standbys_of_si(&name("i1")).next().is_none());
}

#[test]
fn two_n_standby_fault_is_deleted_and_replaced() {
    let mut engine = two_n_engine(3, 1);
    // s2 holds the standby; s3 is spare.
    let out = apply(
        &mut engine,
        Event::SuOperState {
            su: name("s2"),
            oper: OperState::Disabled,
        },
    );
    assert_eq!(
        out.orders,
        vec![Order::Delete {
            su: name("s2"),
            si: None,
        }]
    );
    settle(&mut engine, out);
    assert_stable(&engine, "g");
    assert_eq!(
        assignment(&engine, "s3", "i1"),
        Some((HaState::Standby, SusiFsm::Assigned))
    );
}

// ============================================================================
// 2N: Shutdown Coercion (S4)
// ============================================================================

#[test]
fn shutdown_coerces_to_lock_on_quiesced_report() {
    let mut engine = two_n_engine(2, 1);

    let out = apply(
        &mut engine,
        Event::SuAdmin {
            su: name("s1"),
            op: AdminOp::Shutdown,
            invocation: Invocation::new(7),
        },
    );
    assert_eq!(
        out.admin_replies,
        vec![AdminReply {
            invocation: Invocation::new(7),
            status: AdminStatus::Ok,
        }]
    );
    assert_eq!(
        out.orders,
        vec![Order::Modify {
            su: name("s1"),
            si: None,
            ha: HaState::Quiescing,
        }]
    );
    assert_eq!(
        engine.model().su(&name("s1")).unwrap().admin_state,
        AdminState::ShuttingDown
    );

    // Quiescing acknowledged; the drain is still in progress.
    apply(&mut engine, ack(&out.orders[0]));
    assert_eq!(
        engine.model().su(&name("s1")).unwrap().admin_state,
        AdminState::ShuttingDown
    );

    // The drained report arrives: lock coercion and teardown in the same
    // event handler.
    let out = apply(
        &mut engine,
        Event::SusiAssignReply {
            su: name("s1"),
            si: None,
            operation: SusiOperation::Modify,
            ha: Some(HaState::Quiesced),
            result: ReplyResult::Ok,
        },
    );
    assert_eq!(
        engine.model().su(&name("s1")).unwrap().admin_state,
        AdminState::Locked
    );
    assert!(out.orders.iter().any(|o| matches!(o, Order::Delete { su, .. } if *su == name("s1"))));

    settle(&mut engine, out);
    assert_stable(&engine, "g");
    assert_eq!(
        assignment(&engine, "s2", "i1"),
        Some((HaState::Active, SusiFsm::Assigned))
    );
}

// ============================================================================
// 2N: Instance Swap (S5, R2)
// ============================================================================

/// Runs one full swap, asserting the three-phase order flow, and returns
/// the admin replies seen.
fn run_swap(engine: &mut Engine, invocation: u64) -> Vec<AdminReply> {
    let out = apply(
        engine,
        Event::SiAdmin {
            si: name("i1"),
            op: SiAdminOp::Swap,
            invocation: Invocation::new(invocation),
        },
    );
    assert!(out.admin_replies.is_empty(), "swap reply must wait for completion");
    let (_, replies) = settle(engine, out);
    replies
}

#[test]
fn swap_replies_exactly_once_and_exchanges_roles() {
    let mut engine = two_n_engine(2, 1);

    let replies = run_swap(&mut engine, 40);
    assert_eq!(
        replies,
        vec![AdminReply {
            invocation: Invocation::new(40),
            status: AdminStatus::Ok,
        }]
    );
    assert_stable(&engine, "g");
    assert_eq!(
        assignment(&engine, "s2", "i1"),
        Some((HaState::Active, SusiFsm::Assigned))
    );
    assert_eq!(
        assignment(&engine, "s1", "i1"),
        Some((HaState::Standby, SusiFsm::Assigned))
    );
}

#[test]
fn double_swap_restores_original_placement() {
    let mut engine = two_n_engine(2, 1);
    run_swap(&mut engine, 41);
    run_swap(&mut engine, 42);
    assert_stable(&engine, "g");
    assert_eq!(
        assignment(&engine, "s1", "i1"),
        Some((HaState::Active, SusiFsm::Assigned))
    );
    assert_eq!(
        assignment(&engine, "s2", "i1"),
        Some((HaState::Standby, SusiFsm::Assigned))
    );
}

#[test]
fn swap_fault_replies_bad_operation_once() {
    let mut engine = two_n_engine(2, 1);

    let initiation = apply(
        &mut engine,
        Event::SiAdmin {
            si: name("i1"),
            op: SiAdminOp::Swap,
            invocation: Invocation::new(43),
        },
    );
    assert!(initiation.admin_replies.is_empty());
    // The quiesce leg fails.
    let out = apply(
        &mut engine,
        Event::SusiAssignReply {
            su: name("s1"),
            si: None,
            operation: SusiOperation::Modify,
            ha: Some(HaState::Quiesced),
            result: ReplyResult::Fail,
        },
    );
    let (_, mut replies) = settle(&mut engine, out);
    replies.retain(|r| r.invocation == Invocation::new(43));
    assert_eq!(
        replies,
        vec![AdminReply {
            invocation: Invocation::new(43),
            status: AdminStatus::BadOperation,
        }]
    );
    assert_stable(&engine, "g");
    // Recovery restored the original roles.
    assert_eq!(
        assignment(&engine, "s1", "i1"),
        Some((HaState::Active, SusiFsm::Assigned))
    );
}

#[test_case(RedundancyModel::NPlusM; "n plus m")]
#[test_case(RedundancyModel::NWay; "n way")]
fn swap_is_rejected_outside_two_n(model: RedundancyModel) {
    let mut engine = Engine::new();
    apply(&mut engine, Event::Config(ConfigEvent::NodeAdded(NodeId::new(1))));
    apply(
        &mut engine,
        Event::Config(ConfigEvent::SgAdded(SgConfig::new("g", model))),
    );
    apply(
        &mut engine,
        Event::Config(ConfigEvent::SuAdded(su_config("s1", "g", 1, 1))),
    );
    apply(
        &mut engine,
        Event::Config(ConfigEvent::SiAdded(si_config("i1", "g", 1))),
    );
    let out = apply(
        &mut engine,
        Event::Config(ConfigEvent::CsisDiscovered {
            si: name("i1"),
            count: 1,
        }),
    );
    settle(&mut engine, out);

    let out = apply(
        &mut engine,
        Event::SiAdmin {
            si: name("i1"),
            op: SiAdminOp::Swap,
            invocation: Invocation::new(9),
        },
    );
    assert_eq!(
        out.admin_replies,
        vec![AdminReply {
            invocation: Invocation::new(9),
            status: AdminStatus::BadOperation,
        }]
    );
}

// ============================================================================
// Round-Trip: Group Lock / Unlock (R1)
// ============================================================================

#[test]
fn group_lock_unlock_restores_topology() {
    let mut engine = two_n_engine(2, 2);
    let before: Vec<_> = engine
        .model()
        .assignments
        .iter()
        .map(|a| (a.su.clone(), a.si.clone(), a.ha))
        .collect();

    let out = apply(
        &mut engine,
        Event::SgAdmin {
            sg: name("g"),
            op: SgAdminOp::Lock,
            invocation: Invocation::new(50),
        },
    );
    let (_, replies) = settle(&mut engine, out);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status, AdminStatus::Ok);
    assert_stable(&engine, "g");
    assert_eq!(engine.model().assignments.iter().count(), 0);
    assert_eq!(
        engine.model().sg(&name("g")).unwrap().admin_state,
        AdminState::Locked
    );

    let out = apply(
        &mut engine,
        Event::SgAdmin {
            sg: name("g"),
            op: SgAdminOp::Unlock,
            invocation: Invocation::new(51),
        },
    );
    settle(&mut engine, out);
    assert_stable(&engine, "g");
    let after: Vec<_> = engine
        .model()
        .assignments
        .iter()
        .map(|a| (a.su.clone(), a.si.clone(), a.ha))
        .collect();
    assert_eq!(before, after);
}

// ============================================================================
// N+M: Capacity and Spill (S2)
// ============================================================================

fn npm_engine() -> Engine {
    let mut engine = Engine::new();
    for n in 1..=3 {
        apply(&mut engine, Event::Config(ConfigEvent::NodeAdded(NodeId::new(n))));
    }
    let mut cfg = SgConfig::new("g", RedundancyModel::NPlusM);
    cfg.pref_num_active_sus = 2;
    cfg.pref_num_standby_sus = 1;
    cfg.max_active_sis_per_su = 1;
    apply(&mut engine, Event::Config(ConfigEvent::SgAdded(cfg)));
    for n in 1..=3 {
        apply(
            &mut engine,
            Event::Config(ConfigEvent::SuAdded(su_config(&format!("s{n}"), "g", n, n))),
        );
    }
    for k in 1..=3 {
        apply(
            &mut engine,
            Event::Config(ConfigEvent::SiAdded(si_config(&format!("i{k}"), "g", k))),
        );
    }
    let mut pending = crate::EngineOutput::empty();
    for k in 1..=3 {
        pending.merge(apply(
            &mut engine,
            Event::Config(ConfigEvent::CsisDiscovered {
                si: name(&format!("i{k}")),
                count: 1,
            }),
        ));
    }
    settle(&mut engine, pending);
    assert_stable(&engine, "g");
    engine
}

#[test]
fn npm_capacity_cap_leaves_overflow_unassigned() {
    let engine = npm_engine();
    assert_eq!(
        assignment(&engine, "s1", "i1"),
        Some((HaState::Active, SusiFsm::Assigned))
    );
    assert_eq!(
        assignment(&engine, "s2", "i2"),
        Some((HaState::Active, SusiFsm::Assigned))
    );
    assert_eq!(
        assignment(&engine, "s3", "i1"),
        Some((HaState::Standby, SusiFsm::Assigned))
    );
    assert_eq!(
        assignment(&engine, "s3", "i2"),
        Some((HaState::Standby, SusiFsm::Assigned))
    );
    let i3 = engine.model().si(&name("i3")).unwrap();
    assert_eq!(i3.assignment_state, AssignmentState::Unassigned);
}

#[test]
fn npm_new_unit_takes_the_overflow_instance() {
    let mut engine = npm_engine();
    apply(&mut engine, Event::Config(ConfigEvent::NodeAdded(NodeId::new(4))));
    let out = apply(
        &mut engine,
        Event::Config(ConfigEvent::SuAdded(su_config("s4", "g", 4, 4))),
    );
    settle(&mut engine, out);
    assert_stable(&engine, "g");
    assert_eq!(
        assignment(&engine, "s4", "i3"),
        Some((HaState::Active, SusiFsm::Assigned))
    );
    assert_eq!(
        assignment(&engine, "s3", "i3"),
        Some((HaState::Standby, SusiFsm::Assigned))
    );
}

// ============================================================================
// N+M: Redistribution (S6)
// ============================================================================

#[test]
fn npm_redistribution_moves_one_instance_per_cycle() {
    let mut engine = Engine::new();
    apply(&mut engine, Event::Config(ConfigEvent::NodeAdded(NodeId::new(1))));
    let mut cfg = SgConfig::new("g", RedundancyModel::NPlusM);
    cfg.pref_num_active_sus = 2;
    cfg.pref_num_standby_sus = 0;
    cfg.auto_adjust = true;
    cfg.equal_ranked_sus = true;
    apply(&mut engine, Event::Config(ConfigEvent::SgAdded(cfg)));
    apply(
        &mut engine,
        Event::Config(ConfigEvent::SuAdded(su_config("s1", "g", 1, 1))),
    );
    for k in 1..=5 {
        apply(
            &mut engine,
            Event::Config(ConfigEvent::SiAdded(si_config(&format!("i{k}"), "g", k))),
        );
    }
    let mut pending = crate::EngineOutput::empty();
    for k in 1..=5 {
        pending.merge(apply(
            &mut engine,
            Event::Config(ConfigEvent::CsisDiscovered {
                si: name(&format!("i{k}")),
                count: 1,
            }),
        ));
    }
    settle(&mut engine, pending);
    assert_stable(&engine, "g");
    assert_eq!(engine.model().su(&name("s1")).unwrap().num_active, 5);

    // A second unit appears; the balancer drains exactly one instance per
    // stable cycle until the spread is within one.
    apply(&mut engine, Event::Config(ConfigEvent::NodeAdded(NodeId::new(2))));
    let out = apply(
        &mut engine,
        Event::Config(ConfigEvent::SuAdded(su_config("s2", "g", 2, 2))),
    );
    // First step drains the highest-ranked instance only.
    assert_eq!(
        out.orders,
        vec![Order::Modify {
            su: name("s1"),
            si: Some(name("i1")),
            ha: HaState::Quiesced,
        }]
    );
    let (orders, _) = settle(&mut engine, out);
    assert_stable(&engine, "g");
    assert_eq!(engine.model().su(&name("s1")).unwrap().num_active, 3);
    assert_eq!(engine.model().su(&name("s2")).unwrap().num_active, 2);
    // Exactly two transfers happened (5/0 → 4/1 → 3/2).
    let transfers = orders
        .iter()
        .filter(|o| {
            matches!(
                o,
                Order::Modify {
                    su,
                    si: Some(_),
                    ha: HaState::Quiesced,
                } if *su == name("s1")
            )
        })
        .count();
    assert_eq!(transfers, 2);
}

// ============================================================================
// N-Way: Dependency Deferral (S3)
// ============================================================================

#[test]
fn nway_sponsor_failover_defers_dependent() {
    let mut engine = Engine::new();
    for n in 1..=3 {
        apply(&mut engine, Event::Config(ConfigEvent::NodeAdded(NodeId::new(n))));
    }
    let mut cfg = SgConfig::new("g", RedundancyModel::NWay);
    cfg.pref_num_standby_sus = 1;
    cfg.max_active_sis_per_su = 1;
    apply(&mut engine, Event::Config(ConfigEvent::SgAdded(cfg)));
    for (n, su) in ["sp", "sx", "sd"].into_iter().enumerate() {
        apply(
            &mut engine,
            Event::Config(ConfigEvent::SuAdded(su_config(su, "g", n as u32 + 1, n as u32 + 1))),
        );
    }
    // The sponsor prefers sp with sx as its backup; the dependent runs on sd.
    let mut p_cfg = si_config("p", "g", 1);
    p_cfg.ranked_sus = vec![name("sp"), name("sx")];
    let mut d_cfg = si_config("d", "g", 2);
    d_cfg.ranked_sus = vec![name("sd"), name("sp")];
    apply(&mut engine, Event::Config(ConfigEvent::SiAdded(p_cfg)));
    apply(&mut engine, Event::Config(ConfigEvent::SiAdded(d_cfg)));
    apply(
        &mut engine,
        Event::Config(ConfigEvent::DependencyAdded(DependencyConfig {
            dependent: name("d"),
            sponsor: name("p"),
            required_ha: HaState::Active,
            toleration: Duration::from_secs(3),
        })),
    );
    let mut pending = crate::EngineOutput::empty();
    for si in ["p", "d"] {
        pending.merge(apply(
            &mut engine,
            Event::Config(ConfigEvent::CsisDiscovered {
                si: name(si),
                count: 1,
            }),
        ));
    }
    settle(&mut engine, pending);
    assert_stable(&engine, "g");
    assert_eq!(
        assignment(&engine, "sp", "p"),
        Some((HaState::Active, SusiFsm::Assigned))
    );
    assert_eq!(engine.model().si(&name("d")).unwrap().dep_state, DepState::Assigned);
    let d_active_su = engine
        .model()
        .assignments
        .active_of_si(&name("d"))
        .unwrap()
        .su
        .clone();

    // The sponsor's unit faults.
    let out = apply(
        &mut engine,
        Event::SuOperState {
            su: name("sp"),
            oper: OperState::Disabled,
        },
    );
    let out = apply(&mut engine, ack(&out.orders[0]));
    // Sponsor drained: the dependent is parked until the new active acks.
    assert_eq!(
        engine.model().si(&name("d")).unwrap().dep_state,
        DepState::FailoverUnderProgress
    );
    let promotion = out
        .orders
        .iter()
        .find(|o| matches!(o, Order::Modify { si: Some(si), ha: HaState::Active, .. } if *si == name("p")))
        .expect("sponsor promotion ordered before the dependent is touched");
    let promotion = promotion.clone();
    let out2 = apply(&mut engine, ack(&promotion));
    assert_eq!(engine.model().si(&name("d")).unwrap().dep_state, DepState::Assigned);

    let mut rest = out;
    rest.orders.retain(|o| *o != promotion);
    rest.merge(out2);
    settle(&mut engine, rest);
    assert_stable(&engine, "g");
    // The dependent's own active was never touched.
    assert_eq!(
        engine
            .model()
            .assignments
            .active_of_si(&name("d"))
            .unwrap()
            .su,
        d_active_su
    );
}

// ============================================================================
// Dependency Toleration
// ============================================================================

#[test]
fn sponsor_loss_arms_toleration_then_tears_down_dependent() {
    let mut engine = Engine::new();
    for n in 1..=2 {
        apply(&mut engine, Event::Config(ConfigEvent::NodeAdded(NodeId::new(n))));
    }
    apply(
        &mut engine,
        Event::Config(ConfigEvent::SgAdded(SgConfig::new("g", RedundancyModel::TwoN))),
    );
    for n in 1..=2 {
        apply(
            &mut engine,
            Event::Config(ConfigEvent::SuAdded(su_config(&format!("s{n}"), "g", n, n))),
        );
    }
    apply(&mut engine, Event::Config(ConfigEvent::SiAdded(si_config("i1", "g", 1))));
    apply(&mut engine, Event::Config(ConfigEvent::SiAdded(si_config("i2", "g", 2))));
    apply(
        &mut engine,
        Event::Config(ConfigEvent::DependencyAdded(DependencyConfig {
            dependent: name("i2"),
            sponsor: name("i1"),
            required_ha: HaState::Active,
            toleration: Duration::from_secs(5),
        })),
    );
    let mut pending = crate::EngineOutput::empty();
    for si in ["i1", "i2"] {
        pending.merge(apply(
            &mut engine,
            Event::Config(ConfigEvent::CsisDiscovered {
                si: name(si),
                count: 1,
            }),
        ));
    }
    settle(&mut engine, pending);
    assert_stable(&engine, "g");

    // Lock the sponsor away.
    let out = apply(
        &mut engine,
        Event::SiAdmin {
            si: name("i1"),
            op: SiAdminOp::Lock,
            invocation: Invocation::new(60),
        },
    );
    let (_, replies) = settle(&mut engine, out);
    assert_eq!(replies.len(), 1);
    assert_eq!(
        engine.model().si(&name("i2")).unwrap().dep_state,
        DepState::TolTimerRunning
    );
    assert_stable(&engine, "g");

    // Toleration expires: the dependent is drained and removed.
    let out = apply(
        &mut engine,
        Event::Timeout(TimeoutKind::Toleration {
            si: name("i2"),
            sponsor: name("i1"),
        }),
    );
    settle(&mut engine, out);
    assert_stable(&engine, "g");
    assert!(engine.model().assignments.of_si(&name("i2")).next().is_none());
    assert_eq!(
        engine.model().si(&name("i2")).unwrap().dep_state,
        DepState::SponsorUnassigned
    );

    // Unlocking the sponsor brings both back.
    let out = apply(
        &mut engine,
        Event::SiAdmin {
            si: name("i1"),
            op: SiAdminOp::Unlock,
            invocation: Invocation::new(61),
        },
    );
    settle(&mut engine, out);
    assert_stable(&engine, "g");
    assert!(engine.model().assignments.active_of_si(&name("i1")).is_some());
    assert!(engine.model().assignments.active_of_si(&name("i2")).is_some());
    assert_eq!(engine.model().si(&name("i2")).unwrap().dep_state, DepState::Assigned);
}

// ============================================================================
// Node Failure
// ============================================================================

#[test]
fn node_fail_promotes_standby_without_orders_to_dead_node() {
    let mut engine = two_n_engine(2, 2);
    let out = apply(
        &mut engine,
        Event::NodeOperState {
            node: NodeId::new(1),
            oper: OperState::Disabled,
        },
    );
    // No order may target a unit on the dead node.
    assert!(
        out.orders.iter().all(|o| *o.su() != name("s1")),
        "orders to the dead node: {:?}",
        out.orders
    );
    settle(&mut engine, out);
    assert_stable(&engine, "g");
    for si in ["i1", "i2"] {
        assert_eq!(
            assignment(&engine, "s2", si),
            Some((HaState::Active, SusiFsm::Assigned))
        );
    }
    assert!(!engine.model().assignments.has_any(&name("s1")));
}

#[test]
fn node_fail_during_swap_fails_the_invocation() {
    let mut engine = two_n_engine(2, 1);
    let mut pending = apply(
        &mut engine,
        Event::SiAdmin {
            si: name("i1"),
            op: SiAdminOp::Swap,
            invocation: Invocation::new(70),
        },
    );
    assert!(pending.admin_replies.is_empty());
    // The standby's node dies mid-swap; the outstanding quiesce still acks.
    pending.merge(apply(
        &mut engine,
        Event::NodeOperState {
            node: NodeId::new(2),
            oper: OperState::Disabled,
        },
    ));
    let (_, replies) = settle(&mut engine, pending);
    let swap_replies: Vec<_> = replies
        .iter()
        .filter(|r| r.invocation == Invocation::new(70))
        .collect();
    assert_eq!(swap_replies.len(), 1);
    assert_eq!(swap_replies[0].status, AdminStatus::BadOperation);
    assert_stable(&engine, "g");
    // Recovery re-assigned the instance on the surviving unit.
    assert_eq!(
        assignment(&engine, "s1", "i1"),
        Some((HaState::Active, SusiFsm::Assigned))
    );
}

// ============================================================================
// Message Loss
// ============================================================================

#[test]
fn unacknowledged_order_counts_loss_and_fails_over() {
    let mut engine = two_n_engine(2, 1);
    let out = apply(
        &mut engine,
        Event::SuOperState {
            su: name("s1"),
            oper: OperState::Disabled,
        },
    );
    assert_eq!(out.orders.len(), 1);

    // The quiesce is never acknowledged.
    let out = apply(
        &mut engine,
        Event::Timeout(TimeoutKind::OrderAck {
            su: name("s1"),
            si: None,
        }),
    );
    assert_eq!(engine.model().node(NodeId::new(1)).unwrap().lost_acks, 1);
    assert!(out.orders.iter().any(|o| matches!(o, Order::Delete { su, .. } if *su == name("s1"))));
    settle(&mut engine, out);
    assert_stable(&engine, "g");
    assert_eq!(
        assignment(&engine, "s2", "i1"),
        Some((HaState::Active, SusiFsm::Assigned))
    );
}

// ============================================================================
// Boundaries
// ============================================================================

/// One preferred serving unit and no standbys: nothing ever lands anywhere
/// else.
#[test]
fn single_preferred_unit_holds_everything() {
    let mut engine = Engine::new();
    for n in 1..=2 {
        apply(&mut engine, Event::Config(ConfigEvent::NodeAdded(NodeId::new(n))));
    }
    let mut cfg = SgConfig::new("g", RedundancyModel::NPlusM);
    cfg.pref_num_active_sus = 1;
    cfg.pref_num_standby_sus = 0;
    apply(&mut engine, Event::Config(ConfigEvent::SgAdded(cfg)));
    for n in 1..=2 {
        apply(
            &mut engine,
            Event::Config(ConfigEvent::SuAdded(su_config(&format!("s{n}"), "g", n, n))),
        );
    }
    for k in 1..=3 {
        apply(
            &mut engine,
            Event::Config(ConfigEvent::SiAdded(si_config(&format!("i{k}"), "g", k))),
        );
    }
    let mut pending = crate::EngineOutput::empty();
    for k in 1..=3 {
        pending.merge(apply(
            &mut engine,
            Event::Config(ConfigEvent::CsisDiscovered {
                si: name(&format!("i{k}")),
                count: 1,
            }),
        ));
    }
    settle(&mut engine, pending);
    assert_stable(&engine, "g");
    assert!(!engine.model().assignments.has_any(&name("s2")));
    assert_eq!(engine.model().su(&name("s1")).unwrap().num_active, 3);
    for k in 1..=3 {
        assert_eq!(
            engine
                .model()
                .si(&name(&format!("i{k}")))
                .unwrap()
                .assignment_state,
            AssignmentState::FullyAssigned
        );
    }
}

/// An instance with no component children is never assigned.
#[test]
fn childless_instance_is_never_assigned() {
    let mut engine = two_n_engine(2, 1);
    apply(
        &mut engine,
        Event::Config(ConfigEvent::SiAdded(SiConfig {
            name: name("empty"),
            sg: name("g"),
            rank: SiRank::new(9),
            configured_csis: 0,
            ranked_sus: Vec::new(),
        })),
    );
    let out = apply(
        &mut engine,
        Event::Config(ConfigEvent::CsisDiscovered {
            si: name("empty"),
            count: 0,
        }),
    );
    assert!(out.orders.is_empty());
    settle(&mut engine, out);
    assert!(engine.model().assignments.of_si(&name("empty")).next().is_none());
}

// ============================================================================
// Checkpoints
// ============================================================================

#[test]
fn checkpoint_deltas_decode_and_track_the_group() {
    let mut engine = two_n_engine(2, 1);
    let out = apply(
        &mut engine,
        Event::SuOperState {
            su: name("s1"),
            oper: OperState::Disabled,
        },
    );
    let Effect::Checkpoint { sg, bytes } = out
        .effects
        .last()
        .expect("transition boundary checkpoints the group")
        .clone();
    assert_eq!(sg, name("g"));
    let decoded: SgCheckpoint = postcard::from_bytes(&bytes).expect("canonical bytes");
    assert_eq!(decoded.fsm_state, SgFsmState::SuOper);
    assert_eq!(decoded.su_oper_list, vec![name("s1")]);
}

// ============================================================================
// Randomized Invariant Exploration
// ============================================================================

mod properties {
    use super::*;
    use proptest::prelude::*;

    /// One scripted step: fault or heal a unit, acknowledge or fail the
    /// oldest outstanding order.
    #[derive(Debug, Clone, Copy)]
    enum Step {
        Fault(u8),
        Heal(u8),
        AckOldest,
        FailOldest,
    }

    fn step_strategy() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0u8..2).prop_map(Step::Fault),
            (0u8..2).prop_map(Step::Heal),
            Just(Step::AckOldest),
            Just(Step::FailOldest),
        ]
    }

    fn fail(order: &Order) -> Event {
        match order {
            Order::Assign { su, si, ha } => Event::SusiAssignReply {
                su: su.clone(),
                si: Some(si.clone()),
                operation: SusiOperation::Assign,
                ha: Some(*ha),
                result: ReplyResult::Fail,
            },
            Order::Modify { su, si, ha } => Event::SusiAssignReply {
                su: su.clone(),
                si: si.clone(),
                operation: SusiOperation::Modify,
                ha: Some(*ha),
                result: ReplyResult::Fail,
            },
            Order::Delete { su, si } => Event::SusiAssignReply {
                su: su.clone(),
                si: si.clone(),
                operation: SusiOperation::Delete,
                ha: None,
                result: ReplyResult::Fail,
            },
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Universal invariants hold at every step of arbitrary fault /
        /// heal / reply interleavings, and the group settles afterwards.
        #[test]
        fn invariants_hold_under_random_interleavings(
            steps in proptest::collection::vec(step_strategy(), 0..40)
        ) {
            let mut engine = two_n_engine(2, 2);
            let mut queue: VecDeque<Order> = VecDeque::new();

            for step in steps {
                let event = match step {
                    Step::Fault(n) => Event::SuOperState {
                        su: name(&format!("s{}", n + 1)),
                        oper: OperState::Disabled,
                    },
                    Step::Heal(n) => Event::SuOperState {
                        su: name(&format!("s{}", n + 1)),
                        oper: OperState::Enabled,
                    },
                    Step::AckOldest => match queue.pop_front() {
                        Some(order) => ack(&order),
                        None => continue,
                    },
                    Step::FailOldest => match queue.pop_front() {
                        Some(order) => fail(&order),
                        None => continue,
                    },
                };
                let out = engine.handle_event(event).expect("event handled");
                queue.extend(out.orders);
                engine.verify_invariants().expect("invariants hold mid-flight");
            }

            // Drain everything left over; the engine must settle.
            let mut rounds = 0;
            while let Some(order) = queue.pop_front() {
                rounds += 1;
                prop_assert!(rounds < 500, "did not settle");
                let out = engine.handle_event(ack(&order)).expect("ack handled");
                queue.extend(out.orders);
            }
            engine.verify_invariants().expect("invariants hold settled");
        }
    }
}
