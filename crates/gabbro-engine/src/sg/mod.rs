//! The per-group redundancy state machines.
//!
//! Each group runs a five-state Mealy machine (stable / realign / unit-op /
//! instance-op / group-admin). The transition logic shared by every model
//! lives here: fault entry, realignment settling, admin teardown, node
//! failure. The model-specific choosers and unit-operation completions live
//! in [`two_n`], [`n_plus_m`] and [`n_way`], as `impl Engine` blocks split
//! per model.

mod n_plus_m;
mod n_way;
mod two_n;

use gabbro_types::{
    AdminState, DepState, EntityName, HaState, RedundancyModel, SgFsmState, SusiFsm, Toggle,
};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::event::SusiOperation;
use crate::order::{AdminStatus, EngineOutput};

impl Engine {
    // ========================================================================
    // Shared Scans
    // ========================================================================

    /// The unit's drain is complete: nothing on it still serves or has an
    /// order in flight. Standby assignments may remain; they are removed
    /// with the unit.
    pub(crate) fn all_quiesced(&self, su: &EntityName) -> bool {
        self.model.assignments.of_su(su).all(|a| {
            matches!(a.fsm, SusiFsm::Unassigned)
                || (a.fsm == SusiFsm::Assigned && !a.ha.is_active_side())
        })
    }

    /// The unit currently holds (or is draining) the serving side.
    pub(crate) fn has_active_side(&self, su: &EntityName) -> bool {
        self.model
            .assignments
            .of_su(su)
            .any(|a| a.ha.is_active_side() && a.fsm != SusiFsm::Unassigned)
    }

    pub(crate) fn has_quiesced_or_quiescing(&self, su: &EntityName) -> bool {
        self.model.assignments.of_su(su).any(|a| {
            matches!(a.ha, HaState::Quiesced | HaState::Quiescing) && a.fsm != SusiFsm::Unassigned
        })
    }

    // ========================================================================
    // New Instance / Unit In Service
    // ========================================================================

    /// A new instance joined (or became assignable). Outside STABLE nothing
    /// happens now; the next stable entry picks it up.
    pub(crate) fn sg_si_added(
        &mut self,
        si_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let sg_name = self.model.si(si_name)?.sg.clone();
        self.sg_realign(&sg_name, out)
    }

    /// A unit came back in service.
    pub(crate) fn sg_su_insvc(
        &mut self,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let sg_name = self.model.su(su_name)?.sg.clone();
        self.sg_realign(&sg_name, out)
    }

    /// Runs the chooser if the group is stable; transitions to realign when
    /// orders were emitted.
    pub(crate) fn sg_realign(
        &mut self,
        sg_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let sg = self.model.sg(sg_name)?;
        if !sg.activated
            || sg.fsm_state != SgFsmState::Stable
            || sg.admin_state != AdminState::Unlocked
        {
            return Ok(());
        }
        if self.sg_run_chooser(sg_name, out)? {
            self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
            return Ok(());
        }
        // Nothing to assign; a topology change may still warrant
        // rebalancing on an equal-ranked group.
        let sg = self.model.sg(sg_name)?;
        if sg.model == RedundancyModel::NPlusM && sg.auto_adjust && sg.equal_ranked_sus {
            self.npm_screen_redistribution(sg_name, out)?;
        }
        Ok(())
    }

    /// Dispatches to the model's assignment chooser. Returns true when any
    /// order was emitted.
    pub(crate) fn sg_run_chooser(
        &mut self,
        sg_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<bool, EngineError> {
        // Screen sponsors before choosing so blocked instances are skipped.
        for si in self.model.sg(sg_name)?.sis.clone() {
            self.screen_sponsor_state(&si)?;
        }
        match self.model.sg(sg_name)?.model {
            RedundancyModel::TwoN => self.two_n_chose_asgn(sg_name, out),
            RedundancyModel::NPlusM => self.npm_chose_asgn(sg_name, out),
            RedundancyModel::NWay => self.nway_si_assign(sg_name, out),
        }
    }

    // ========================================================================
    // Unit Fault
    // ========================================================================

    /// Unit fault entry point; dispatches on the group state.
    pub(crate) fn sg_su_fault(
        &mut self,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        if !self.model.assignments.has_any(su_name) {
            tracing::info!(su = %su_name, "faulted with no assignments");
            return Ok(());
        }
        let sg_name = self.model.su(su_name)?.sg.clone();
        let state = self.model.sg(&sg_name)?.fsm_state;
        tracing::info!(su = %su_name, sg = %sg_name, %state, "unit fault");
        match state {
            SgFsmState::Stable => self.su_fault_stable(&sg_name, su_name, out),
            SgFsmState::SgRealign => self.su_fault_realign(&sg_name, su_name, out),
            SgFsmState::SuOper => match self.model.sg(&sg_name)?.model {
                RedundancyModel::TwoN => self.two_n_su_fault_su_oper(&sg_name, su_name, out),
                RedundancyModel::NPlusM | RedundancyModel::NWay => {
                    self.su_fault_su_oper_generic(&sg_name, su_name, out)
                }
            },
            SgFsmState::SiOper => self.su_fault_si_oper(&sg_name, su_name, out),
            SgFsmState::SgAdmin => self.su_fault_sg_admin(&sg_name, su_name, out),
        }
    }

    /// STABLE fault: quiesce the serving side (dependents first), or delete
    /// a standby-only unit outright.
    fn su_fault_stable(
        &mut self,
        sg_name: &EntityName,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        if self.has_active_side(su_name) {
            self.mark_dependents_of_su(su_name, out)?;
            self.quiesce_su_honouring_deps(su_name, HaState::Quiesced, out)?;
            self.oper_list_add(sg_name, su_name);
            self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SuOper;
        } else {
            self.del_send_su(su_name, out)?;
            self.oper_list_add(sg_name, su_name);
            self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
        }
        Ok(())
    }

    /// Fault while realigning: abandon any failover the unit was part of and
    /// tear it down.
    fn su_fault_realign(
        &mut self,
        sg_name: &EntityName,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        self.reset_failover_marks_on(su_name)?;
        let pending_delete = self
            .model
            .assignments
            .of_su(su_name)
            .all(|a| matches!(a.fsm, SusiFsm::Unassigning | SusiFsm::Unassigned));
        if pending_delete {
            return Ok(());
        }
        if self.has_active_side(su_name) {
            self.quiesce_su_honouring_deps(su_name, HaState::Quiesced, out)?;
        } else {
            self.del_send_su(su_name, out)?;
        }
        self.oper_list_add(sg_name, su_name);
        Ok(())
    }

    /// Fault during a unit operation, N+M / N-Way shape: the operated unit
    /// escalates its drain; any other unit enters teardown alongside it.
    fn su_fault_su_oper_generic(
        &mut self,
        sg_name: &EntityName,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let in_oper = self.model.sg(sg_name)?.in_oper_list(su_name);
        if in_oper {
            // A shutting-down unit that faults is coerced to locked and its
            // quiescing assignments escalate to a hard quiesce.
            if self.model.su(su_name)?.admin_state == AdminState::ShuttingDown {
                self.model.su_mut(su_name)?.admin_state = AdminState::Locked;
                let _ = self.model.refresh_su_readiness(su_name)?;
            }
            let quiescing = self
                .model
                .assignments
                .of_su(su_name)
                .any(|a| a.ha == HaState::Quiescing && a.fsm != SusiFsm::Unassigned);
            if quiescing {
                self.modify_send_su(su_name, HaState::Quiesced, out)?;
            }
            Ok(())
        } else {
            self.su_fault_realign(sg_name, su_name, out)?;
            self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
            Ok(())
        }
    }

    /// Fault while an instance admin operation is in flight. The operation
    /// is aborted if the faulted unit carries the admin instance.
    fn su_fault_si_oper(
        &mut self,
        sg_name: &EntityName,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let admin_si = self.model.sg(sg_name)?.admin_si.clone();
        if let Some(si_name) = admin_si
            && self.model.assignments.get(su_name, &si_name).is_some()
        {
            // Shutdown can no longer complete through this unit.
            if self.model.si(&si_name)?.admin_state == AdminState::ShuttingDown {
                self.model.si_mut(&si_name)?.admin_state = AdminState::Locked;
            }
            self.resolve_si_invocation(&si_name, AdminStatus::BadOperation, out);
            self.model.sg_mut(sg_name)?.admin_si = None;
        }
        self.su_fault_realign(sg_name, su_name, out)?;
        self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
        Ok(())
    }

    /// Fault during group lock/shutdown.
    fn su_fault_sg_admin(
        &mut self,
        sg_name: &EntityName,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        match self.model.sg(sg_name)?.admin_state {
            AdminState::Locked => Ok(()),
            AdminState::ShuttingDown => {
                // The drain is cut short: lock the group now, quiesce the
                // faulted unit hard and drop every standby.
                let quiescing = self
                    .model
                    .assignments
                    .of_su(su_name)
                    .any(|a| a.ha == HaState::Quiescing && a.fsm != SusiFsm::Unassigned);
                if quiescing {
                    self.modify_send_su(su_name, HaState::Quiesced, out)?;
                    self.model.sg_mut(sg_name)?.admin_state = AdminState::Locked;
                    let sus = self.model.sg(sg_name)?.sus.clone();
                    for other in sus {
                        let _ = self.model.refresh_su_readiness(&other);
                        if other != *su_name
                            && self.model.assignments.has_any(&other)
                            && !self.has_active_side(&other)
                        {
                            self.del_send_su(&other, out)?;
                            self.oper_list_add(sg_name, &other);
                        }
                    }
                } else {
                    self.del_send_su(su_name, out)?;
                }
                Ok(())
            }
            AdminState::Unlocked => Err(EngineError::BadOperation),
        }
    }

    // ========================================================================
    // Assignment Completions
    // ========================================================================

    /// Successful reply dispatch.
    pub(crate) fn sg_susi_success(
        &mut self,
        su_name: &EntityName,
        si_name: Option<&EntityName>,
        operation: SusiOperation,
        ha: Option<HaState>,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        // Stale replies for units with nothing bound are protocol noise.
        if !self.model.assignments.has_any(su_name) {
            return Ok(());
        }
        let sg_name = self.model.su(su_name)?.sg.clone();
        let state = self.model.sg(&sg_name)?.fsm_state;
        match state {
            SgFsmState::Stable => {
                // Only unsolicited quiescing-complete reports are expected
                // here; anything else is left to the realign settling.
                Ok(())
            }
            SgFsmState::SgRealign => {
                // An instance admin teardown may still be settling while the
                // group realigns around a fault; its replies keep flowing
                // through the instance-operation path.
                if let Some(admin) = self.model.sg(&sg_name)?.admin_si.clone() {
                    let concerns_admin = match si_name {
                        Some(si) => *si == admin,
                        None => self.model.assignments.get(su_name, &admin).is_some(),
                    };
                    if concerns_admin {
                        return self.success_si_oper(&sg_name, su_name, si_name, operation, ha, out);
                    }
                }
                match (operation, ha) {
                    (SusiOperation::Delete, _) => {
                        self.free_deleted(su_name, si_name)?;
                        self.coerce_shutdown_to_lock(su_name)?;
                    }
                    (SusiOperation::Modify, Some(HaState::Quiesced)) => {
                        // A dependency teardown drains one assignment at a
                        // time; its delete follows the drain ack.
                        if let Some(si) = si_name
                            && self.model.si(si)?.dep_state == DepState::UnassigningDueToDep
                        {
                            self.del_send_susi(su_name, si, out)?;
                            return Ok(());
                        }
                        // A unit drained while the group was already
                        // realigning (fault on a second unit): fail its
                        // workload over and tear it down.
                        if self.model.sg(&sg_name)?.in_oper_list(su_name)
                            && self.all_quiesced(su_name)
                        {
                            self.promote_drained_standbys(&sg_name, su_name, out)?;
                            self.del_send_su(su_name, out)?;
                            self.coerce_shutdown_to_lock(su_name)?;
                        }
                    }
                    _ => {}
                }
                Ok(())
            }
            SgFsmState::SuOper => match self.model.sg(&sg_name)?.model {
                RedundancyModel::TwoN => {
                    self.two_n_success_su_oper(&sg_name, su_name, si_name, operation, ha, out)
                }
                RedundancyModel::NPlusM => {
                    self.npm_success_su_oper(&sg_name, su_name, si_name, operation, ha, out)
                }
                RedundancyModel::NWay => {
                    self.nway_success_su_oper(&sg_name, su_name, si_name, operation, ha, out)
                }
            },
            SgFsmState::SiOper => {
                self.success_si_oper(&sg_name, su_name, si_name, operation, ha, out)
            }
            SgFsmState::SgAdmin => {
                self.success_sg_admin(&sg_name, su_name, si_name, operation, ha, out)
            }
        }
    }

    /// Instance-scoped admin teardown settling: the quiesce completed, so
    /// the instance's assignments are removed; once gone the admin pointer
    /// clears and shutdown coerces to lock.
    fn success_si_oper(
        &mut self,
        sg_name: &EntityName,
        su_name: &EntityName,
        si_name: Option<&EntityName>,
        operation: SusiOperation,
        ha: Option<HaState>,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let Some(admin_si) = self.model.sg(sg_name)?.admin_si.clone() else {
            return Ok(());
        };
        match (operation, ha) {
            (SusiOperation::Modify, Some(HaState::Quiesced)) => {
                // Drain acknowledged: remove every assignment of the admin
                // instance, on this unit and its peers.
                if self.model.si(&admin_si)?.admin_state == AdminState::ShuttingDown {
                    self.model.si_mut(&admin_si)?.admin_state = AdminState::Locked;
                }
                let holders = self.model.assignments.sus_of_si(&admin_si);
                for holder in holders {
                    if self
                        .model
                        .assignments
                        .get(&holder, &admin_si)
                        .is_some_and(|a| a.fsm != SusiFsm::Unassigned)
                    {
                        self.del_send_susi(&holder, &admin_si, out)?;
                        self.oper_list_add(sg_name, &holder);
                    }
                }
                Ok(())
            }
            (SusiOperation::Delete, _) => {
                let remaining: Vec<EntityName> = self
                    .model
                    .assignments
                    .sus_of_si(&admin_si)
                    .into_iter()
                    .filter(|su| {
                        self.model
                            .assignments
                            .get(su, &admin_si)
                            .is_some_and(|a| a.fsm != SusiFsm::Unassigned)
                    })
                    .collect();
                self.free_deleted(su_name, si_name)?;
                if remaining.iter().all(|su| su == su_name) {
                    self.model.sg_mut(sg_name)?.admin_si = None;
                    self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Group lock/shutdown settling.
    fn success_sg_admin(
        &mut self,
        sg_name: &EntityName,
        su_name: &EntityName,
        si_name: Option<&EntityName>,
        operation: SusiOperation,
        ha: Option<HaState>,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        match (operation, ha) {
            (SusiOperation::Modify, Some(HaState::Quiesced)) => {
                if !self.all_quiesced(su_name) {
                    return Ok(());
                }
                // Shutdown coerces to lock once the last drain completes.
                if self.model.sg(sg_name)?.admin_state == AdminState::ShuttingDown {
                    self.model.sg_mut(sg_name)?.admin_state = AdminState::Locked;
                    let sus = self.model.sg(sg_name)?.sus.clone();
                    for other in &sus {
                        let _ = self.model.refresh_su_readiness(other);
                        if other != su_name
                            && self.model.assignments.has_any(other)
                            && !self.has_active_side(other)
                        {
                            self.del_send_su(other, out)?;
                            self.oper_list_add(sg_name, other);
                        }
                    }
                }
                self.del_send_su(su_name, out)?;
                Ok(())
            }
            (SusiOperation::Delete, _) => {
                self.free_deleted(su_name, si_name)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Failed reply dispatch. A failed order is treated as a unit fault on
    /// the surviving path: drain what can be drained, delete the rest, and
    /// let the stable entry re-assign elsewhere.
    pub(crate) fn sg_susi_fail(
        &mut self,
        su_name: &EntityName,
        si_name: Option<&EntityName>,
        operation: SusiOperation,
        ha: Option<HaState>,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        if !self.model.assignments.has_any(su_name) {
            return Ok(());
        }
        let sg_name = self.model.su(su_name)?.sg.clone();
        match operation {
            SusiOperation::Assign => {
                // The assignment never materialized; drop the record and let
                // the chooser retry.
                match si_name {
                    Some(si) => {
                        self.model.assignments.remove(su_name, si);
                        self.model.refresh_after_su_change(su_name)?;
                        self.model.refresh_si_state(si)?;
                    }
                    None => self.free_su_assignments(su_name)?,
                }
                Ok(())
            }
            SusiOperation::Modify => {
                let swap_aborted = self.model.su(su_name)?.switch_flag.is_switch()
                    || self
                        .model
                        .assignments
                        .sis_of_su(su_name)
                        .iter()
                        .any(|si| {
                            self.model
                                .sis
                                .get(si)
                                .is_some_and(|s| s.switch_flag.is_switch())
                        });
                if swap_aborted {
                    return self.abort_swap_on_fail(&sg_name, su_name, out);
                }
                match ha {
                    Some(HaState::Quiesced | HaState::Quiescing) => {
                        // Could not drain cleanly; fall back to removal. The
                        // records already carry the drained role, so the
                        // delete is within protocol.
                        self.del_send_su(su_name, out)?;
                        self.oper_list_add(&sg_name, su_name);
                        Ok(())
                    }
                    Some(HaState::Active) => {
                        // Promotion failed: treat the target as faulted.
                        tracing::warn!(su = %su_name, "promotion failed, refaulting unit");
                        self.reset_failover_marks_on(su_name)?;
                        self.quiesce_su_honouring_deps(su_name, HaState::Quiesced, out)?;
                        self.oper_list_add(&sg_name, su_name);
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            SusiOperation::Delete => {
                // The node agent could not confirm removal; free locally.
                tracing::warn!(su = %su_name, "delete unacknowledged, freeing locally");
                match si_name {
                    Some(si) => {
                        self.model.assignments.remove(su_name, si);
                        self.model.refresh_after_su_change(su_name)?;
                        self.model.refresh_si_state(si)?;
                    }
                    None => self.free_su_assignments(su_name)?,
                }
                Ok(())
            }
        }
    }

    /// A swap leg failed: revert the drained side to active, clear the
    /// switch flags and answer the invocation.
    fn abort_swap_on_fail(
        &mut self,
        sg_name: &EntityName,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        tracing::warn!(su = %su_name, "swap aborted");
        let swapped_si: Option<EntityName> = self
            .model
            .assignments
            .sis_of_su(su_name)
            .into_iter()
            .find(|si| self.model.sis.get(si).is_some_and(|s| s.invocation.is_some()))
            .or_else(|| {
                self.model
                    .sis
                    .values()
                    .find(|s| s.sg == *sg_name && s.invocation.is_some())
                    .map(|s| s.name.clone())
            });
        self.model.su_mut(su_name)?.switch_flag = Toggle::Stable;
        if self.has_quiesced_or_quiescing(su_name) {
            self.modify_send_su(su_name, HaState::Active, out)?;
        }
        if let Some(si) = swapped_si {
            self.resolve_si_invocation(&si, AdminStatus::BadOperation, out);
        }
        self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
        Ok(())
    }

    // ========================================================================
    // Node Failure
    // ========================================================================

    /// Node failure handling for one unit on the dead node. No order can be
    /// sent there: standbys elsewhere are promoted, the unit's assignments
    /// are freed locally, and any admin operation it carried resolves.
    pub(crate) fn sg_node_fail(
        &mut self,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let sg_name = self.model.su(su_name)?.sg.clone();
        if !self.model.assignments.has_any(su_name) {
            return Ok(());
        }
        let state = self.model.sg(&sg_name)?.fsm_state;
        tracing::info!(su = %su_name, sg = %sg_name, %state, "node fail");

        // Swap involving this unit can no longer complete.
        let swap_si: Option<EntityName> = self
            .model
            .sis
            .values()
            .find(|si| si.sg == sg_name && si.invocation.is_some())
            .map(|si| si.name.clone());
        if let Some(si) = swap_si {
            let participating = self.model.su(su_name)?.switch_flag.is_switch()
                || self.model.assignments.get(su_name, &si).is_some();
            if participating {
                for su in self.model.sg(&sg_name)?.sus.clone() {
                    self.model.su_mut(&su)?.switch_flag = Toggle::Stable;
                }
                self.resolve_si_invocation(&si, AdminStatus::BadOperation, out);
                self.model.sg_mut(&sg_name)?.admin_si = None;
            }
        }

        // Instance admin operation rooted on this unit fails.
        if state == SgFsmState::SiOper {
            let admin_si = self.model.sg(&sg_name)?.admin_si.clone();
            if let Some(si_name) = admin_si
                && self.model.assignments.get(su_name, &si_name).is_some()
            {
                if self.model.si(&si_name)?.admin_state == AdminState::ShuttingDown {
                    // The shutdown can no longer complete normally.
                    self.model.si_mut(&si_name)?.admin_state = AdminState::Unlocked;
                }
                self.resolve_si_invocation(&si_name, AdminStatus::BadOperation, out);
                self.model.sg_mut(&sg_name)?.admin_si = None;
            }
        }

        // Promote the best surviving standby for every instance this unit
        // was serving, sponsors permitting.
        let mut promoted = false;
        for si_name in self.model.assignments.sis_of_su(su_name) {
            let serving = self
                .model
                .assignments
                .get(su_name, &si_name)
                .is_some_and(|a| a.ha.is_active_side() && a.fsm != SusiFsm::Unassigned);
            if !serving {
                continue;
            }
            let sponsors_survive = {
                let si = self.model.si(&si_name)?;
                si.sponsors.iter().all(|edge| {
                    self.model.assignments.of_si(&edge.sponsor).any(|a| {
                        a.ha == edge.required_ha && a.fsm == SusiFsm::Assigned && a.su != *su_name
                    })
                })
            };
            if !sponsors_survive {
                self.mark_dependents_of_su(su_name, out)?;
                continue;
            }
            // Dependents of this instance wait for the new active's ack.
            for dependent in self.model.dependents_of(&si_name) {
                if self.model.si(&dependent)?.dep_state == gabbro_types::DepState::Assigned {
                    self.set_dep_state(&dependent, gabbro_types::DepState::FailoverUnderProgress)?;
                    out.arm(crate::event::TimeoutKind::AwaitActive {
                        si: dependent.clone(),
                    });
                }
            }
            if let Some((target_su, si)) = self.pref_standby_for_promotion(&si_name)? {
                if target_su != *su_name {
                    self.modify_send_susi(&target_su, &si, HaState::Active, out)?;
                    self.oper_list_add(&sg_name, &target_su);
                    promoted = true;
                }
            } else {
                tracing::warn!(si = %si_name, "no standby available, instance left unassigned");
            }
        }

        // Free everything locally; the node is gone.
        self.oper_list_del(&sg_name, su_name);
        self.free_su_assignments(su_name)?;

        // Shutdown on the dead unit coerces to lock.
        if self.model.su(su_name)?.admin_state == AdminState::ShuttingDown {
            self.model.su_mut(su_name)?.admin_state = AdminState::Locked;
        }

        let sg = self.model.sg_mut(&sg_name)?;
        match sg.fsm_state {
            SgFsmState::SgAdmin => {
                if sg.su_oper_list.is_empty() && sg.admin_state == AdminState::ShuttingDown {
                    sg.admin_state = AdminState::Locked;
                }
            }
            _ => {
                if promoted {
                    sg.fsm_state = SgFsmState::SgRealign;
                } else if sg.su_oper_list.is_empty() && sg.admin_si.is_none() {
                    // Either nothing left in flight (stable entry follows) or
                    // a replacement gets chosen right away.
                    sg.fsm_state = SgFsmState::SgRealign;
                }
            }
        }
        Ok(())
    }

    /// Promotes the standby assignments backing the instances a drained (or
    /// dead) unit was serving, sponsors permitting. Returns true when any
    /// promotion order was emitted.
    pub(crate) fn promote_drained_standbys(
        &mut self,
        sg_name: &EntityName,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<bool, EngineError> {
        let mut promoted = false;
        for si_name in self.model.assignments.sis_of_su(su_name) {
            let drained = self
                .model
                .assignments
                .get(su_name, &si_name)
                .is_some_and(|a| {
                    matches!(a.ha, HaState::Quiesced | HaState::Quiescing)
                        && a.fsm != SusiFsm::Unassigned
                });
            if !drained {
                continue;
            }
            if let Some((target_su, si)) = self.pref_standby_for_promotion(&si_name)? {
                self.modify_send_susi(&target_su, &si, HaState::Active, out)?;
                self.oper_list_add(sg_name, &target_su);
                promoted = true;
            }
        }
        Ok(promoted)
    }

    // ========================================================================
    // Admin Teardown (unit / instance / group)
    // ========================================================================

    /// Unit lock or shutdown: drain the serving side, delete the standby
    /// side. The readiness change has already been applied.
    pub(crate) fn sg_su_admin_down(
        &mut self,
        su_name: &EntityName,
        shutdown: bool,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let sg_name = self.model.su(su_name)?.sg.clone();
        if self.has_active_side(su_name) {
            let target = if shutdown {
                HaState::Quiescing
            } else {
                HaState::Quiesced
            };
            self.mark_dependents_of_su(su_name, out)?;
            self.quiesce_su_honouring_deps(su_name, target, out)?;
            self.oper_list_add(&sg_name, su_name);
            self.model.sg_mut(&sg_name)?.fsm_state = SgFsmState::SuOper;
        } else {
            self.del_send_su(su_name, out)?;
            self.oper_list_add(&sg_name, su_name);
            self.model.sg_mut(&sg_name)?.fsm_state = SgFsmState::SgRealign;
        }
        Ok(())
    }

    /// Instance lock or shutdown: drain its active assignment; deletion of
    /// all its assignments follows on the drain ack.
    pub(crate) fn sg_si_admin_down(
        &mut self,
        si_name: &EntityName,
        shutdown: bool,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let sg_name = self.model.si(si_name)?.sg.clone();
        let Some(active) = self.model.assignments.active_of_si(si_name).cloned() else {
            // Standby-only instance: plain removal.
            let holders = self.model.assignments.sus_of_si(si_name);
            for holder in holders {
                self.del_send_susi(&holder, si_name, out)?;
                self.oper_list_add(&sg_name, &holder);
            }
            let sg = self.model.sg_mut(&sg_name)?;
            sg.admin_si = Some(si_name.clone());
            sg.fsm_state = SgFsmState::SiOper;
            return Ok(());
        };
        let target = if shutdown {
            HaState::Quiescing
        } else {
            HaState::Quiesced
        };
        self.modify_send_susi(&active.su, si_name, target, out)?;
        self.oper_list_add(&sg_name, &active.su);
        let sg = self.model.sg_mut(&sg_name)?;
        sg.admin_si = Some(si_name.clone());
        sg.fsm_state = SgFsmState::SiOper;
        Ok(())
    }

    /// Group lock or shutdown: every serving unit drains (hard for lock,
    /// graceful for shutdown); standby units are deleted immediately on
    /// lock and only after the drain completes on shutdown.
    pub(crate) fn sg_sg_admin_down(
        &mut self,
        sg_name: &EntityName,
        shutdown: bool,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let target_admin = if shutdown {
            AdminState::ShuttingDown
        } else {
            AdminState::Locked
        };
        self.model.sg_mut(sg_name)?.admin_state = target_admin;

        let sus = self.model.sg(sg_name)?.sus.clone();
        let mut any = false;
        for su in &sus {
            let _ = self.model.refresh_su_readiness(su);
            if !self.model.assignments.has_any(su) {
                continue;
            }
            if self.has_active_side(su) {
                let target = if shutdown {
                    HaState::Quiescing
                } else {
                    HaState::Quiesced
                };
                self.quiesce_su_honouring_deps(su, target, out)?;
                self.oper_list_add(sg_name, su);
                any = true;
            } else if !shutdown {
                self.del_send_su(su, out)?;
                self.oper_list_add(sg_name, su);
                any = true;
            }
        }
        let sg = self.model.sg_mut(sg_name)?;
        if any {
            sg.fsm_state = SgFsmState::SgAdmin;
        } else {
            // Nothing assigned anywhere: the lock is immediate.
            sg.admin_state = AdminState::Locked;
        }
        Ok(())
    }

    // ========================================================================
    // Instance Swap
    // ========================================================================

    /// Instance swap entry: 2N only; every other model rejects the
    /// operation rather than aborting.
    pub(crate) fn sg_si_swap(
        &mut self,
        si_name: &EntityName,
        invocation: gabbro_types::Invocation,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let sg_name = self.model.si(si_name)?.sg.clone();
        let sg = self.model.sg(&sg_name)?;
        if sg.model != RedundancyModel::TwoN {
            return Err(EngineError::BadOperation);
        }
        if self.model.si(si_name)?.admin_state != AdminState::Unlocked {
            return Err(EngineError::TryAgain);
        }
        if sg.fsm_state != SgFsmState::Stable {
            return Err(EngineError::TryAgain);
        }
        self.two_n_siswap(&sg_name, si_name, invocation, out)
    }
}
