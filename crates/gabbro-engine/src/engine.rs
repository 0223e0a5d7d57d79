//! The engine context: event routing, stable-entry logic, checkpoint
//! emission and invariant checks.
//!
//! There is no global control block; the director constructs one [`Engine`]
//! and feeds it events on its single event loop. Processing an event returns
//! an [`EngineOutput`] that the director executes after the transition has
//! been committed.

use std::collections::BTreeMap;

use gabbro_types::{
    AdminState, DepState, EntityName, HaState, NodeId, OperState, RedundancyModel, SgFsmState,
    SusiFsm, Toggle,
};

use crate::config::ConfigEvent;
use crate::error::EngineError;
use crate::event::{AdminOp, Event, ReplyResult, SgAdminOp, SiAdminOp, SusiOperation, TimeoutKind};
use crate::model::{Model, ServiceGroup};
use crate::order::{AdminStatus, Effect, EngineOutput, SgCheckpoint};

/// The redundancy-model engine.
///
/// Owns the whole state tree. Single-threaded by design: all state machine
/// transitions, orchestrator calls and dependency-tracker updates run on the
/// caller's event loop, and the engine never blocks while holding state.
#[derive(Debug, Default)]
pub struct Engine {
    pub(crate) model: Model,
    /// Last checkpoint shipped per group, for delta suppression.
    last_checkpoint: BTreeMap<EntityName, SgCheckpoint>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access to the state tree.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Immutable snapshot for external readers (queries, notifications).
    /// Published state is only consistent at transition boundaries, i.e.
    /// between `handle_event` calls.
    pub fn snapshot(&self) -> Model {
        self.model.clone()
    }

    // ========================================================================
    // Event Entry Point
    // ========================================================================

    /// Processes one event and returns the orders, replies, timer operations
    /// and effects it produced.
    ///
    /// Administrative rejections are reported through the output (exactly
    /// one reply per invocation); `Err` is reserved for configuration faults
    /// and unknown entities on non-administrative paths.
    pub fn handle_event(&mut self, event: Event) -> Result<EngineOutput, EngineError> {
        let mut out = EngineOutput::empty();

        match event {
            Event::SusiAssignReply {
                su,
                si,
                operation,
                ha,
                result,
            } => self.on_susi_reply(&su, si.as_ref(), operation, ha, result, &mut out)?,
            Event::SuOperState { su, oper } => self.on_su_oper_state(&su, oper, &mut out)?,
            Event::NodeOperState { node, oper } => {
                self.on_node_oper_state(node, oper, &mut out)?;
            }
            Event::SuAdmin {
                su,
                op,
                invocation,
            } => {
                let status = self.on_su_admin(&su, op, &mut out);
                out.reply(invocation, status);
            }
            Event::SiAdmin {
                si,
                op,
                invocation,
            } => {
                // Swap replies are deferred to completion; everything else is
                // answered here.
                match self.on_si_admin(&si, op, invocation, &mut out) {
                    None => {}
                    Some(status) => out.reply(invocation, status),
                }
            }
            Event::SgAdmin {
                sg,
                op,
                invocation,
            } => {
                let status = self.on_sg_admin(&sg, op, &mut out);
                out.reply(invocation, status);
            }
            Event::Config(config) => self.on_config(config, &mut out)?,
            Event::Timeout(kind) => self.on_timeout(kind, &mut out)?,
        }

        self.reconcile_dependents(&mut out)?;
        self.run_stable_checks(&mut out)?;
        self.emit_checkpoints(&mut out);

        Ok(out)
    }

    // ========================================================================
    // Assignment Replies
    // ========================================================================

    fn on_susi_reply(
        &mut self,
        su_name: &EntityName,
        si_name: Option<&EntityName>,
        operation: SusiOperation,
        ha: Option<HaState>,
        result: ReplyResult,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        // Replies for unknown entities are protocol violations: log and drop.
        if self.model.sus.get(su_name).is_none() {
            tracing::warn!(su = %su_name, "reply for unknown unit, discarded");
            return Ok(());
        }
        if let Some(si) = si_name
            && self.model.assignments.get(su_name, si).is_none()
        {
            tracing::warn!(su = %su_name, si = %si, "reply for unknown assignment, discarded");
            return Ok(());
        }

        out.cancel(TimeoutKind::OrderAck {
            su: su_name.clone(),
            si: si_name.cloned(),
        });

        if result == ReplyResult::Fail {
            tracing::info!(su = %su_name, ?operation, "assignment order failed");
            self.sg_susi_fail(su_name, si_name, operation, ha, out)?;
            self.prune_oper_list_if_settled(su_name)?;
            return Ok(());
        }

        // Record completion before dispatching to the model handler.
        let acked: Vec<EntityName> = match si_name {
            Some(si) => vec![si.clone()],
            None => self.model.assignments.sis_of_su(su_name),
        };
        for si in &acked {
            if let Some(assignment) = self.model.assignments.get_mut(su_name, si) {
                match operation {
                    SusiOperation::Assign if assignment.fsm == SusiFsm::Assigning => {
                        assignment.fsm = SusiFsm::Assigned;
                    }
                    SusiOperation::Modify => {
                        if assignment.fsm == SusiFsm::Modifying {
                            assignment.fsm = SusiFsm::Assigned;
                        }
                        // Quiescing completes through an unsolicited
                        // quiesced report; the record follows the reply.
                        if let Some(ha) = ha
                            && assignment.fsm == SusiFsm::Assigned
                        {
                            assignment.ha = ha;
                        }
                    }
                    SusiOperation::Delete if assignment.fsm == SusiFsm::Unassigning => {
                        assignment.fsm = SusiFsm::Unassigned;
                    }
                    _ => {}
                }
            }
        }
        self.model.refresh_after_su_change(su_name)?;

        if operation == SusiOperation::Modify && ha == Some(HaState::Quiesced) {
            let sg = self.model.su(su_name)?.sg.clone();
            let still_quiescing = self
                .model
                .assignments
                .of_su(su_name)
                .any(|a| a.fsm == SusiFsm::Modifying && a.ha == HaState::Quiesced);
            if !still_quiescing {
                out.cancel(TimeoutKind::Quiesced { sg });
            }
        }

        self.sg_susi_success(su_name, si_name, operation, ha, out)?;

        // Sponsors that just became active release their dependents.
        if operation != SusiOperation::Delete && ha == Some(HaState::Active) {
            for si in &acked {
                self.sponsor_became_active(si, out)?;
            }
        }

        self.prune_oper_list_if_settled(su_name)?;
        Ok(())
    }

    /// Removes the unit from its group's operation list once every one of
    /// its assignments is terminal. Units pinned by an in-flight switch or
    /// admin invocation stay listed until their operation resolves.
    fn prune_oper_list_if_settled(&mut self, su_name: &EntityName) -> Result<(), EngineError> {
        let su = match self.model.sus.get(su_name) {
            Some(su) => su,
            None => return Ok(()),
        };
        if su.switch_flag.is_switch() || su.pending_invocation.is_some() {
            return Ok(());
        }
        // A graceful drain is still in progress until the quiesced report
        // lands, even though no order is outstanding.
        let still_quiescing = self
            .model
            .assignments
            .of_su(su_name)
            .any(|a| a.ha == HaState::Quiescing && a.fsm != SusiFsm::Unassigned);
        if still_quiescing {
            return Ok(());
        }
        let sg_name = su.sg.clone();
        if self.model.assignments.all_terminal(su_name) {
            let sg = self.model.sg(&sg_name)?;
            if sg.redistribution.as_ref().is_some_and(|r| r.max_su == *su_name) {
                return Ok(());
            }
            self.oper_list_del(&sg_name, su_name);
        }
        Ok(())
    }

    // ========================================================================
    // Operational State Reports
    // ========================================================================

    fn on_su_oper_state(
        &mut self,
        su_name: &EntityName,
        oper: OperState,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        self.model.su_mut(su_name)?.oper_state = oper;
        let changed = self.model.refresh_su_readiness(su_name)?;
        match oper {
            OperState::Disabled => {
                tracing::info!(su = %su_name, "unit disabled");
                self.sg_su_fault(su_name, out)?;
            }
            OperState::Enabled => {
                if changed && self.model.su(su_name)?.is_in_service() {
                    tracing::info!(su = %su_name, "unit back in service");
                    self.sg_su_insvc(su_name, out)?;
                }
            }
        }
        Ok(())
    }

    fn on_node_oper_state(
        &mut self,
        node_id: NodeId,
        oper: OperState,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let node = self.model.node_mut(node_id)?;
        node.oper_state = oper;
        node.member = oper == OperState::Enabled;
        let sus = node.sus.clone();
        match oper {
            OperState::Disabled => {
                tracing::info!(node = %node_id, "node failed");
                for su in &sus {
                    self.model.refresh_su_readiness(su)?;
                    self.sg_node_fail(su, out)?;
                }
            }
            OperState::Enabled => {
                tracing::info!(node = %node_id, "node joined");
                for su in &sus {
                    // A unit that faulted on its own stays disabled until its
                    // agent reports otherwise; only node-derived readiness
                    // changes here.
                    if self.model.refresh_su_readiness(su)?
                        && self.model.su(su)?.is_in_service()
                    {
                        self.sg_su_insvc(su, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Administrative Operations
    // ========================================================================

    fn on_su_admin(
        &mut self,
        su_name: &EntityName,
        op: AdminOp,
        out: &mut EngineOutput,
    ) -> AdminStatus {
        let Ok(su) = self.model.su(su_name) else {
            return AdminStatus::BadOperation;
        };
        let sg_name = su.sg.clone();
        let Ok(sg) = self.model.sg(&sg_name) else {
            return AdminStatus::BadOperation;
        };

        match op {
            AdminOp::Lock | AdminOp::Shutdown => {
                let su = self.model.su(su_name).expect("checked above");
                if su.admin_state == AdminState::Locked {
                    return if op == AdminOp::Lock {
                        AdminStatus::Ok
                    } else {
                        AdminStatus::BadOperation
                    };
                }
                // A lock racing the unit's own recovery is rejected, not queued.
                if sg.fsm_state == SgFsmState::SuOper && sg.in_oper_list(su_name) {
                    return AdminStatus::BadOperation;
                }
                if sg.fsm_state != SgFsmState::Stable {
                    return AdminStatus::TryAgain;
                }
                let shutdown = op == AdminOp::Shutdown;
                let has_assignments = self.model.assignments.has_any(su_name);
                let target = if shutdown && has_assignments {
                    AdminState::ShuttingDown
                } else {
                    AdminState::Locked
                };
                if let Ok(su) = self.model.su_mut(su_name) {
                    su.admin_state = target;
                }
                let _ = self.model.refresh_su_readiness(su_name);
                if has_assignments {
                    if let Err(err) = self.sg_su_admin_down(su_name, shutdown, out) {
                        tracing::warn!(su = %su_name, %err, "admin down failed");
                        return AdminStatus::TryAgain;
                    }
                }
                AdminStatus::Ok
            }
            AdminOp::Unlock => {
                if let Ok(su) = self.model.su_mut(su_name) {
                    if su.admin_state == AdminState::Unlocked {
                        return AdminStatus::Ok;
                    }
                    su.admin_state = AdminState::Unlocked;
                }
                let _ = self.model.refresh_su_readiness(su_name);
                if self.model.su(su_name).is_ok_and(|su| su.is_in_service()) {
                    if let Err(err) = self.sg_su_insvc(su_name, out) {
                        tracing::warn!(su = %su_name, %err, "unlock realign failed");
                    }
                }
                AdminStatus::Ok
            }
        }
    }

    /// Returns `None` when the reply is deferred (swap in progress).
    fn on_si_admin(
        &mut self,
        si_name: &EntityName,
        op: SiAdminOp,
        invocation: gabbro_types::Invocation,
        out: &mut EngineOutput,
    ) -> Option<AdminStatus> {
        let Ok(si) = self.model.si(si_name) else {
            return Some(AdminStatus::BadOperation);
        };
        let sg_name = si.sg.clone();

        match op {
            SiAdminOp::Swap => {
                match self.sg_si_swap(si_name, invocation, out) {
                    Ok(()) => None,
                    Err(EngineError::TryAgain) => Some(AdminStatus::TryAgain),
                    Err(_) => Some(AdminStatus::BadOperation),
                }
            }
            SiAdminOp::Lock | SiAdminOp::Shutdown => {
                let si = self.model.si(si_name).expect("checked above");
                if si.admin_state == AdminState::Locked {
                    return Some(if op == SiAdminOp::Lock {
                        AdminStatus::Ok
                    } else {
                        AdminStatus::BadOperation
                    });
                }
                let Ok(sg) = self.model.sg(&sg_name) else {
                    return Some(AdminStatus::BadOperation);
                };
                if sg.fsm_state != SgFsmState::Stable {
                    return Some(AdminStatus::TryAgain);
                }
                let shutdown = op == SiAdminOp::Shutdown;
                let has_assignments = self
                    .model
                    .assignments
                    .of_si(si_name)
                    .any(|a| a.fsm != SusiFsm::Unassigned);
                let target = if shutdown && has_assignments {
                    AdminState::ShuttingDown
                } else {
                    AdminState::Locked
                };
                if let Ok(si) = self.model.si_mut(si_name) {
                    si.admin_state = target;
                }
                if has_assignments {
                    if let Err(err) = self.sg_si_admin_down(si_name, shutdown, out) {
                        tracing::warn!(si = %si_name, %err, "admin down failed");
                        return Some(AdminStatus::TryAgain);
                    }
                }
                Some(AdminStatus::Ok)
            }
            SiAdminOp::Unlock => {
                if let Ok(si) = self.model.si_mut(si_name) {
                    if si.admin_state == AdminState::Unlocked {
                        return Some(AdminStatus::Ok);
                    }
                    si.admin_state = AdminState::Unlocked;
                }
                if let Err(err) = self.sg_realign(&sg_name, out) {
                    tracing::warn!(sg = %sg_name, %err, "unlock realign failed");
                }
                Some(AdminStatus::Ok)
            }
        }
    }

    fn on_sg_admin(
        &mut self,
        sg_name: &EntityName,
        op: SgAdminOp,
        out: &mut EngineOutput,
    ) -> AdminStatus {
        let Ok(sg) = self.model.sg(sg_name) else {
            return AdminStatus::BadOperation;
        };
        match op {
            SgAdminOp::Lock | SgAdminOp::Shutdown => {
                if sg.admin_state == AdminState::Locked {
                    return if op == SgAdminOp::Lock {
                        AdminStatus::Ok
                    } else {
                        AdminStatus::BadOperation
                    };
                }
                if sg.fsm_state != SgFsmState::Stable {
                    return AdminStatus::TryAgain;
                }
                let shutdown = op == SgAdminOp::Shutdown;
                match self.sg_sg_admin_down(sg_name, shutdown, out) {
                    Ok(()) => AdminStatus::Ok,
                    Err(err) => {
                        tracing::warn!(sg = %sg_name, %err, "group admin down failed");
                        AdminStatus::TryAgain
                    }
                }
            }
            SgAdminOp::Unlock => {
                let sg = self.model.sg_mut(sg_name).expect("checked above");
                if sg.admin_state == AdminState::Unlocked {
                    return AdminStatus::Ok;
                }
                if sg.fsm_state != SgFsmState::Stable {
                    return AdminStatus::TryAgain;
                }
                sg.admin_state = AdminState::Unlocked;
                let sus = sg.sus.clone();
                for su in &sus {
                    let _ = self.model.refresh_su_readiness(su);
                }
                if let Err(err) = self.sg_realign(sg_name, out) {
                    tracing::warn!(sg = %sg_name, %err, "unlock realign failed");
                }
                AdminStatus::Ok
            }
            SgAdminOp::Adjust => {
                let sg = self.model.sg(sg_name).expect("checked above");
                if sg.model != RedundancyModel::NPlusM || !sg.equal_ranked_sus {
                    return AdminStatus::BadOperation;
                }
                if sg.fsm_state != SgFsmState::Stable {
                    return AdminStatus::TryAgain;
                }
                match self.npm_screen_redistribution(sg_name, out) {
                    Ok(_) => AdminStatus::Ok,
                    Err(err) => {
                        tracing::warn!(sg = %sg_name, %err, "adjust failed");
                        AdminStatus::TryAgain
                    }
                }
            }
        }
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    fn on_config(&mut self, config: ConfigEvent, out: &mut EngineOutput) -> Result<(), EngineError> {
        match config {
            ConfigEvent::NodeAdded(id) => self.model.create_node(id),
            ConfigEvent::SgAdded(cfg) => self.model.create_sg(cfg),
            ConfigEvent::SuAdded(cfg) => {
                let name = cfg.name.clone();
                self.model.create_su(cfg)?;
                if self.model.su(&name)?.is_in_service() {
                    self.sg_su_insvc(&name, out)?;
                }
                Ok(())
            }
            ConfigEvent::SiAdded(cfg) => {
                let name = cfg.name.clone();
                self.model.create_si(cfg)?;
                self.sg_si_added(&name, out)
            }
            ConfigEvent::DependencyAdded(cfg) => self.model.add_dependency(cfg),
            ConfigEvent::SgModified { sg, update } => {
                let group = self.model.sg_mut(&sg)?;
                group.pending_update = Some(update);
                // Applied at the next STABLE entry; force one if already there.
                if group.fsm_state == SgFsmState::Stable {
                    group.apply_pending_update();
                }
                Ok(())
            }
            ConfigEvent::CsisDiscovered { si, count } => {
                self.model.si_mut(&si)?.discovered_csis = count;
                self.sg_si_added(&si, out)
            }
            ConfigEvent::SiRemoved(si) => {
                if self
                    .model
                    .assignments
                    .of_si(&si)
                    .any(|a| a.fsm != SusiFsm::Unassigned)
                {
                    return Err(EngineError::BadOperation);
                }
                let sg_name = self.model.si(&si)?.sg.clone();
                self.model.sg_mut(&sg_name)?.sis.retain(|name| name != &si);
                self.model.sis.remove(&si);
                Ok(())
            }
            ConfigEvent::SuRemoved(su) => {
                if self.model.assignments.has_any(&su) {
                    return Err(EngineError::BadOperation);
                }
                let (sg_name, node) = {
                    let unit = self.model.su(&su)?;
                    (unit.sg.clone(), unit.node)
                };
                self.model.sg_mut(&sg_name)?.sus.retain(|name| name != &su);
                self.model.node_mut(node)?.sus.retain(|name| name != &su);
                self.model.sus.remove(&su);
                Ok(())
            }
            ConfigEvent::SgRemoved(sg) => {
                let group = self.model.sg(&sg)?;
                if !group.sus.is_empty() || !group.sis.is_empty() {
                    return Err(EngineError::BadOperation);
                }
                self.model.sgs.remove(&sg);
                self.last_checkpoint.remove(&sg);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Timeouts
    // ========================================================================

    fn on_timeout(&mut self, kind: TimeoutKind, out: &mut EngineOutput) -> Result<(), EngineError> {
        match kind {
            TimeoutKind::OrderAck { su, si } => self.on_order_ack_expiry(&su, si.as_ref(), out),
            TimeoutKind::Toleration { si, .. } => self.on_toleration_expiry(&si, out),
            TimeoutKind::AwaitActive { si } => self.on_await_active_expiry(&si, out),
            TimeoutKind::Quiesced { sg } => self.on_quiesced_expiry(&sg, out),
        }
    }

    /// No acknowledgement arrived in time: account the loss and run the
    /// failure path as if the node agent had rejected the order.
    fn on_order_ack_expiry(
        &mut self,
        su_name: &EntityName,
        si_name: Option<&EntityName>,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let Ok(su) = self.model.su(su_name) else {
            return Ok(());
        };
        let node_id = su.node;
        self.model.node_mut(node_id)?.lost_acks += 1;
        tracing::warn!(su = %su_name, node = %node_id, "order unacknowledged, treating as failed");

        // Derive the outstanding operation from the assignment FSM.
        let probe = match si_name {
            Some(si) => self.model.assignments.get(su_name, si).cloned(),
            None => self
                .model
                .assignments
                .sis_of_su(su_name)
                .iter()
                .filter_map(|si| self.model.assignments.get(su_name, si))
                .find(|a| !a.is_terminal())
                .cloned(),
        };
        let Some(assignment) = probe else {
            return Ok(());
        };
        let (operation, ha) = match assignment.fsm {
            SusiFsm::Assigning => (SusiOperation::Assign, Some(assignment.ha)),
            SusiFsm::Modifying => (SusiOperation::Modify, Some(assignment.ha)),
            SusiFsm::Unassigning => (SusiOperation::Delete, None),
            SusiFsm::Assigned | SusiFsm::Unassigned => return Ok(()),
        };
        self.sg_susi_fail(su_name, si_name, operation, ha, out)?;
        self.prune_oper_list_if_settled(su_name)?;
        Ok(())
    }

    /// The quiesce window for a group expired: fail every quiescing unit.
    fn on_quiesced_expiry(
        &mut self,
        sg_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let sus = self.model.sg(sg_name)?.sus.clone();
        for su in sus {
            let outstanding = self
                .model
                .assignments
                .of_su(&su)
                .any(|a| a.fsm == SusiFsm::Modifying && a.ha == HaState::Quiesced);
            if outstanding {
                tracing::warn!(su = %su, "quiesce window expired");
                self.sg_susi_fail(&su, None, SusiOperation::Modify, Some(HaState::Quiesced), out)?;
                self.prune_oper_list_if_settled(&su)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Dependent Reconciliation
    // ========================================================================

    /// Arms toleration windows for dependents whose sponsor was genuinely
    /// lost during this event (loss paths that did not already park the
    /// dependent behind a failover).
    fn reconcile_dependents(&mut self, out: &mut EngineOutput) -> Result<(), EngineError> {
        let sponsors: Vec<EntityName> = self
            .model
            .sis
            .values()
            .flat_map(|si| si.sponsors.iter().map(|edge| edge.sponsor.clone()))
            .collect();
        for sponsor in sponsors {
            if self.model.sis.contains_key(&sponsor) {
                self.sponsor_lost(&sponsor, out)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Stable Entry
    // ========================================================================

    /// The group returns to STABLE exactly when the operation list is empty,
    /// no admin operation is in progress, and no assignment is mid-flight.
    fn can_enter_stable(&self, sg: &ServiceGroup) -> bool {
        if sg.fsm_state == SgFsmState::Stable {
            return false;
        }
        if !sg.su_oper_list.is_empty() || sg.admin_si.is_some() {
            return false;
        }
        sg.sus
            .iter()
            .all(|su| self.model.assignments.all_terminal(su))
    }

    fn run_stable_checks(&mut self, out: &mut EngineOutput) -> Result<(), EngineError> {
        let sg_names: Vec<EntityName> = self.model.sgs.keys().cloned().collect();
        for sg_name in sg_names {
            let sg = self.model.sg(&sg_name)?;
            if !sg.activated || !self.can_enter_stable(sg) {
                continue;
            }
            self.enter_stable(&sg_name, out)?;
        }
        Ok(())
    }

    /// Runs the stable-entry sequence: apply deferred configuration, screen
    /// dependencies, attempt redistribution, re-invoke the assigner. Any of
    /// these may emit orders and leave the group transient again.
    fn enter_stable(
        &mut self,
        sg_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        tracing::info!(sg = %sg_name, "entering stable");
        {
            let sg = self.model.sg_mut(sg_name)?;
            sg.fsm_state = SgFsmState::Stable;
            sg.redistribution = None;
            sg.apply_pending_update();
        }

        // (i) dependency screening
        let sis = self.model.sg(sg_name)?.sis.clone();
        for si in &sis {
            self.screen_sponsor_state(si)?;
        }

        // (ii) redistribution, when enabled for this group
        let (model, auto_adjust, equal_ranked, admin_state) = {
            let sg = self.model.sg(sg_name)?;
            (sg.model, sg.auto_adjust, sg.equal_ranked_sus, sg.admin_state)
        };
        if model == RedundancyModel::NPlusM
            && auto_adjust
            && equal_ranked
            && admin_state == AdminState::Unlocked
            && self.npm_screen_redistribution(sg_name, out)?
        {
            return Ok(());
        }

        // (iii) re-invoke the assigner; it may have nothing to do
        if admin_state == AdminState::Unlocked && self.sg_run_chooser(sg_name, out)? {
            let sg = self.model.sg_mut(sg_name)?;
            sg.fsm_state = SgFsmState::SgRealign;
            return Ok(());
        }

        #[cfg(debug_assertions)]
        {
            if let Err(violation) = self.verify_invariants() {
                debug_assert!(false, "invariant violated at stable entry: {violation}");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    fn emit_checkpoints(&mut self, out: &mut EngineOutput) {
        let captures: Vec<SgCheckpoint> = self.model.sgs.values().map(capture).collect();
        for checkpoint in captures {
            let unchanged = self
                .last_checkpoint
                .get(&checkpoint.sg)
                .is_some_and(|prev| *prev == checkpoint);
            if unchanged {
                continue;
            }
            match postcard::to_allocvec(&checkpoint) {
                Ok(bytes) => out.effects.push(Effect::Checkpoint {
                    sg: checkpoint.sg.clone(),
                    bytes,
                }),
                Err(err) => tracing::error!(sg = %checkpoint.sg, %err, "checkpoint encode failed"),
            }
            self.last_checkpoint
                .insert(checkpoint.sg.clone(), checkpoint);
        }
    }

    // ========================================================================
    // Invariant Checks
    // ========================================================================

    /// Verifies the universal invariants over the whole tree. Used by tests
    /// and, under debug assertions, at every stable entry.
    pub fn verify_invariants(&self) -> Result<(), String> {
        for assignment in self.model.assignments.iter() {
            let su = self
                .model
                .sus
                .get(&assignment.su)
                .ok_or_else(|| format!("assignment to unknown unit {}", assignment.su))?;
            let si = self
                .model
                .sis
                .get(&assignment.si)
                .ok_or_else(|| format!("assignment to unknown instance {}", assignment.si))?;
            if su.sg != si.sg {
                return Err(format!(
                    "assignment {}/{} spans groups {} and {}",
                    assignment.su, assignment.si, su.sg, si.sg
                ));
            }
        }

        for si in self.model.sis.values() {
            let actives = self
                .model
                .assignments
                .of_si(&si.name)
                .filter(|a| a.ha == HaState::Active && a.fsm != SusiFsm::Unassigned)
                .count();
            if actives > 1 {
                return Err(format!("instance {} has {actives} active assignments", si.name));
            }
        }

        for su in self.model.sus.values() {
            let active = self.model.assignments.count_of_su(&su.name, HaState::Active)
                + self.model.assignments.count_of_su(&su.name, HaState::Quiescing);
            let standby = self.model.assignments.count_of_su(&su.name, HaState::Standby);
            if su.num_active != active || su.num_standby != standby {
                return Err(format!(
                    "unit {} counters ({}, {}) disagree with table ({active}, {standby})",
                    su.name, su.num_active, su.num_standby
                ));
            }
        }

        for sg in self.model.sgs.values() {
            let mut seen = std::collections::BTreeSet::new();
            for su in &sg.su_oper_list {
                if !seen.insert(su.clone()) {
                    return Err(format!("operation list of {} repeats {su}", sg.name));
                }
            }
            if sg.admin_si.is_some()
                && !matches!(sg.fsm_state, SgFsmState::SiOper | SgFsmState::SgRealign)
            {
                return Err(format!(
                    "group {} holds an admin instance in state {}",
                    sg.name, sg.fsm_state
                ));
            }
            if sg.fsm_state == SgFsmState::Stable {
                if !sg.su_oper_list.is_empty() {
                    return Err(format!("stable group {} has a non-empty operation list", sg.name));
                }
                if sg.admin_si.is_some() {
                    return Err(format!("stable group {} holds an admin instance", sg.name));
                }
                for su in &sg.sus {
                    if !self.model.assignments.all_terminal(su) {
                        return Err(format!(
                            "stable group {} has a mid-flight assignment on {su}",
                            sg.name
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Captures the replicated fields of a group.
fn capture(sg: &ServiceGroup) -> SgCheckpoint {
    SgCheckpoint {
        sg: sg.name.clone(),
        fsm_state: sg.fsm_state,
        su_oper_list: sg.su_oper_list.clone(),
        admin_si: sg.admin_si.clone(),
        redistribution: sg
            .redistribution
            .as_ref()
            .map(|r| (r.max_su.clone(), r.min_su.clone(), r.si.clone())),
    }
}

impl Engine {
    /// Resolves a deferred instance-scoped invocation with `status`,
    /// clearing the stored token. Safe to call twice; only the first call
    /// replies.
    pub(crate) fn resolve_si_invocation(
        &mut self,
        si_name: &EntityName,
        status: AdminStatus,
        out: &mut EngineOutput,
    ) {
        if let Ok(si) = self.model.si_mut(si_name)
            && let Some(invocation) = si.invocation.take()
        {
            tracing::info!(si = %si_name, ?status, "admin invocation resolved");
            si.switch_flag = Toggle::Stable;
            out.reply(invocation, status);
        }
    }

    /// Clears failover parking for instances of a unit that is itself being
    /// torn down: their dependency state reverts to sponsor-unassigned so the
    /// normal teardown flow applies.
    pub(crate) fn reset_failover_marks_on(&mut self, su_name: &EntityName) -> Result<(), EngineError> {
        for si_name in self.model.assignments.sis_of_su(su_name) {
            if self.model.si(&si_name)?.dep_state == DepState::FailoverUnderProgress {
                self.set_dep_state(&si_name, DepState::SponsorUnassigned)?;
            }
            for dependent in self.model.dependents_of(&si_name) {
                if self.model.si(&dependent)?.dep_state == DepState::FailoverUnderProgress {
                    self.set_dep_state(&dependent, DepState::SponsorUnassigned)?;
                }
            }
        }
        Ok(())
    }
}
