//! The 2N redundancy model.
//!
//! At most one active unit and at most one standby unit per group at any
//! time; every instance of the group is assigned to the same pair. Instance
//! swap (active and standby exchanging roles) is only defined here.

use gabbro_types::{
    AdminState, EntityName, HaState, Invocation, SgFsmState, SusiFsm, Toggle,
};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::event::SusiOperation;
use crate::order::{AdminStatus, EngineOutput};

impl Engine {
    /// Locates the group-wide active-side and standby-side units by scanning
    /// instance assignments. Instances parked behind a failover are skipped.
    pub(crate) fn two_n_act_standby(
        &self,
        sg_name: &EntityName,
    ) -> Result<(Option<EntityName>, Option<EntityName>), EngineError> {
        let sg = self.model.sg(sg_name)?;
        let mut active: Option<EntityName> = None;
        let mut standby: Option<EntityName> = None;
        for si_name in &sg.sis {
            let si = self.model.si(si_name)?;
            if si.dep_state == gabbro_types::DepState::FailoverUnderProgress {
                continue;
            }
            let pair: Vec<_> = self
                .model
                .assignments
                .of_si(si_name)
                .filter(|a| a.fsm != SusiFsm::Unassigned)
                .collect();
            match pair.as_slice() {
                [] => continue,
                [only] => {
                    // A lone assignment names the active side whatever its
                    // role currently is (it may be mid-drain).
                    if only.ha == HaState::Standby {
                        standby.get_or_insert_with(|| only.su.clone());
                    } else {
                        active.get_or_insert_with(|| only.su.clone());
                    }
                }
                [first, second, ..] => {
                    let (act, stby) = match (first.ha, second.ha) {
                        (HaState::Standby, _) => (second, first),
                        (_, HaState::Standby) => (first, second),
                        // Both drained: the one still quiescing (or listed
                        // first) is the former active.
                        (HaState::Quiesced, HaState::Active | HaState::Quiescing) => {
                            (second, first)
                        }
                        _ => (first, second),
                    };
                    active = Some(act.su.clone());
                    standby = Some(stby.su.clone());
                }
            }
            if active.is_some() && standby.is_some() {
                break;
            }
        }
        Ok((active, standby))
    }

    /// The 2N chooser. Picks the active unit (current active side, else the
    /// highest-ranked in-service unit), assigns every unassigned instance
    /// active on it, then picks the standby unit (current standby, else the
    /// highest-ranked in-service unit with no assignments) and assigns every
    /// active-only instance standby on it. Returns true when any order was
    /// emitted.
    pub(crate) fn two_n_chose_asgn(
        &mut self,
        sg_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<bool, EngineError> {
        let (current_active, current_standby) = self.two_n_act_standby(sg_name)?;
        let sg = self.model.sg(sg_name)?;
        let sis = sg.sis.clone();

        let active_su = match current_active {
            Some(su) => su,
            None => match self.model.in_service_sus(sg).first() {
                Some(su) => su.clone(),
                None => {
                    tracing::debug!(sg = %sg_name, "no in-service units");
                    return Ok(false);
                }
            },
        };
        if !self.model.su(&active_su)?.is_in_service() {
            tracing::debug!(sg = %sg_name, su = %active_su, "active side out of service");
            return Ok(false);
        }

        let mut emitted = false;
        for si_name in &sis {
            let unassigned = self
                .model
                .assignments
                .of_si(si_name)
                .all(|a| a.fsm == SusiFsm::Unassigned);
            if !unassigned || !self.model.si(si_name)?.is_assignable() {
                continue;
            }
            match self.new_assign(&active_su, si_name, HaState::Active, false, out) {
                Ok(()) => emitted = true,
                Err(err) => tracing::debug!(si = %si_name, %err, "active assignment skipped"),
            }
        }
        if emitted {
            self.oper_list_add(sg_name, &active_su);
        }

        // Standby side: the current standby, else the highest-ranked
        // in-service unit with nothing assigned yet.
        let standby_su = match current_standby {
            Some(su) => Some(su),
            None => {
                let sg = self.model.sg(sg_name)?;
                self.model
                    .in_service_sus(sg)
                    .into_iter()
                    .find(|su| !self.model.assignments.has_any(su))
            }
        };
        if let Some(standby_su) = standby_su
            && self.model.su(&standby_su)?.is_in_service()
        {
            let mut standby_emitted = false;
            for si_name in &sis {
                let has_active_side = self
                    .model
                    .assignments
                    .of_si(si_name)
                    .any(|a| a.ha.is_active_side() && a.fsm != SusiFsm::Unassigned);
                let has_standby = self
                    .model
                    .assignments
                    .of_si(si_name)
                    .any(|a| a.ha == HaState::Standby && a.fsm != SusiFsm::Unassigned);
                if !has_active_side || has_standby {
                    continue;
                }
                match self.new_assign(&standby_su, si_name, HaState::Standby, false, out) {
                    Ok(()) => standby_emitted = true,
                    Err(err) => {
                        tracing::debug!(si = %si_name, %err, "standby assignment skipped");
                    }
                }
            }
            if standby_emitted {
                self.oper_list_add(sg_name, &standby_su);
                emitted = true;
            }
        }

        Ok(emitted)
    }

    /// Starts an instance swap: drain the active unit; the role exchange
    /// proceeds through the unit-operation completions below.
    pub(crate) fn two_n_siswap(
        &mut self,
        sg_name: &EntityName,
        si_name: &EntityName,
        invocation: Invocation,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let active = self
            .model
            .assignments
            .active_of_si(si_name)
            .cloned()
            .ok_or(EngineError::BadOperation)?;
        let has_standby = self
            .model
            .assignments
            .standbys_of_si(si_name)
            .any(|a| a.fsm == SusiFsm::Assigned);
        if !has_standby {
            return Err(EngineError::BadOperation);
        }

        self.quiesce_su_honouring_deps(&active.su, HaState::Quiesced, out)?;
        self.oper_list_add(sg_name, &active.su);
        self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SuOper;
        self.model.su_mut(&active.su)?.switch_flag = Toggle::Switch;
        let si = self.model.si_mut(si_name)?;
        si.switch_flag = Toggle::Switch;
        si.invocation = Some(invocation);
        tracing::info!(si = %si_name, su = %active.su, "swap initiated");
        Ok(())
    }

    /// Unit-operation completions for 2N: fault drain, admin drain, and the
    /// three-phase swap.
    pub(crate) fn two_n_success_su_oper(
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
                let in_oper = self.model.sg(sg_name)?.in_oper_list(su_name);
                if !in_oper {
                    return Ok(());
                }
                if !self.all_quiesced(su_name) {
                    // Staged drain: quiesce the next assignment in
                    // dependency order.
                    if let Some(next) = self.next_susi_to_be_quiesced(su_name)? {
                        let target = if self.model.su(su_name)?.admin_state
                            == AdminState::ShuttingDown
                        {
                            HaState::Quiescing
                        } else {
                            HaState::Quiesced
                        };
                        self.modify_send_susi(su_name, &next, target, out)?;
                    }
                    return Ok(());
                }
                self.two_n_drain_complete(sg_name, su_name, out)
            }
            (SusiOperation::Modify, Some(HaState::Active)) => {
                // Swap phase three: the former standby is active, so the
                // drained former active takes the standby role.
                let oper_su = self
                    .model
                    .sg(sg_name)?
                    .su_oper_list
                    .iter()
                    .find(|su| {
                        self.model
                            .sus
                            .get(*su)
                            .is_some_and(|unit| unit.switch_flag.is_switch())
                    })
                    .cloned();
                if let Some(oper_su) = oper_su
                    && oper_su != *su_name
                {
                    self.modify_send_su(&oper_su, HaState::Standby, out)?;
                }
                Ok(())
            }
            (SusiOperation::Modify, Some(HaState::Standby)) => {
                // Swap complete.
                if !self.model.su(su_name)?.switch_flag.is_switch() {
                    return Ok(());
                }
                self.model.su_mut(su_name)?.switch_flag = Toggle::Stable;
                let swapped: Vec<EntityName> = self
                    .model
                    .assignments
                    .sis_of_su(su_name)
                    .into_iter()
                    .filter(|si| {
                        self.model
                            .sis
                            .get(si)
                            .is_some_and(|instance| instance.invocation.is_some())
                    })
                    .collect();
                for si in swapped {
                    tracing::info!(si = %si, "swap done");
                    self.resolve_si_invocation(&si, AdminStatus::Ok, out);
                }
                self.oper_list_del(sg_name, su_name);
                self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
                Ok(())
            }
            (SusiOperation::Delete, _) => {
                // A drained unit finished teardown while still under
                // operation (the quiesce ack was lost or rejected). Its
                // workload fails over to the standby now, if one survives.
                // The acked records keep their drained role; fsm is already
                // terminal here.
                let was_drained = self
                    .model
                    .assignments
                    .of_su(su_name)
                    .any(|a| matches!(a.ha, HaState::Quiesced | HaState::Quiescing));
                let (_, standby) = self.two_n_act_standby(sg_name)?;
                self.free_deleted(su_name, si_name)?;
                if self.model.assignments.has_any(su_name) {
                    return Ok(());
                }
                if self.model.su(su_name)?.switch_flag.is_switch() {
                    self.model.su_mut(su_name)?.switch_flag = Toggle::Stable;
                }
                self.coerce_shutdown_to_lock(su_name)?;
                self.oper_list_del(sg_name, su_name);
                if was_drained
                    && let Some(standby_su) = standby.filter(|su| {
                        su != su_name
                            && self
                                .model
                                .sus
                                .get(su)
                                .is_some_and(|unit| unit.is_in_service())
                    })
                {
                    self.role_failover_with_dep_ordering(su_name, &standby_su, out)?;
                    self.oper_list_add(sg_name, &standby_su);
                }
                self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// The whole unit is drained and acknowledged: either continue a swap or
    /// fail the workload over and tear the unit down.
    fn two_n_drain_complete(
        &mut self,
        sg_name: &EntityName,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let (_, standby) = self.two_n_act_standby(sg_name)?;
        let standby_ok = standby
            .as_ref()
            .is_some_and(|su| self.model.sus.get(su).is_some_and(|s| s.is_in_service()));

        if self.model.su(su_name)?.switch_flag.is_switch() {
            // Swap phase two: hand the active role to the standby unit.
            if let Some(standby_su) = standby.filter(|_| standby_ok) {
                self.modify_send_su(&standby_su, HaState::Active, out)?;
                self.oper_list_add(sg_name, &standby_su);
            } else {
                // The peer vanished mid-swap; abort and tear down.
                self.model.su_mut(su_name)?.switch_flag = Toggle::Stable;
                let swapped: Vec<EntityName> = self
                    .model
                    .assignments
                    .sis_of_su(su_name)
                    .into_iter()
                    .filter(|si| {
                        self.model
                            .sis
                            .get(si)
                            .is_some_and(|instance| instance.invocation.is_some())
                    })
                    .collect();
                for si in swapped {
                    self.resolve_si_invocation(&si, AdminStatus::BadOperation, out);
                }
                self.del_send_su(su_name, out)?;
                self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
            }
            return Ok(());
        }

        if standby_ok && self.is_failover_possible(su_name)? {
            let standby_su = standby.expect("standby_ok implies presence");
            self.role_failover_with_dep_ordering(su_name, &standby_su, out)?;
            self.oper_list_add(sg_name, &standby_su);
            self.del_send_su(su_name, out)?;
            self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
        } else {
            self.del_send_su(su_name, out)?;
            self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
        }

        self.coerce_shutdown_to_lock(su_name)?;
        Ok(())
    }

    /// Shutdown reaching its drained point becomes a plain lock, in the same
    /// event handler that observed the drain.
    pub(crate) fn coerce_shutdown_to_lock(
        &mut self,
        su_name: &EntityName,
    ) -> Result<(), EngineError> {
        if self.model.su(su_name)?.admin_state == AdminState::ShuttingDown {
            tracing::info!(su = %su_name, "shutdown complete, locking");
            self.model.su_mut(su_name)?.admin_state = AdminState::Locked;
            let _ = self.model.refresh_su_readiness(su_name)?;
        }
        Ok(())
    }

    /// Unit fault while this group is mid-operation (2N specifics: swap
    /// abort and escalation of a shutting-down drain).
    pub(crate) fn two_n_su_fault_su_oper(
        &mut self,
        sg_name: &EntityName,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let in_oper = self.model.sg(sg_name)?.in_oper_list(su_name);
        if in_oper {
            if self.model.su(su_name)?.switch_flag.is_switch() {
                // The unit being swapped faulted: answer the invocation and
                // fall back to plain fault handling.
                self.model.su_mut(su_name)?.switch_flag = Toggle::Stable;
                let swapped: Vec<EntityName> = self
                    .model
                    .assignments
                    .sis_of_su(su_name)
                    .into_iter()
                    .filter(|si| {
                        self.model
                            .sis
                            .get(si)
                            .is_some_and(|instance| instance.invocation.is_some())
                    })
                    .collect();
                for si in swapped {
                    self.resolve_si_invocation(&si, AdminStatus::BadOperation, out);
                }
            }
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
            return Ok(());
        }

        // A peer faulted while another unit is under operation. If it was
        // the standby leg of a swap, the swap aborts and the drained side is
        // restored.
        let oper_su = self
            .model
            .sg(sg_name)?
            .su_oper_list
            .iter()
            .find(|su| {
                self.model
                    .sus
                    .get(*su)
                    .is_some_and(|unit| unit.switch_flag.is_switch())
            })
            .cloned();
        if let Some(oper_su) = oper_su {
            self.model.su_mut(&oper_su)?.switch_flag = Toggle::Stable;
            let swapped: Vec<EntityName> = self
                .model
                .assignments
                .sis_of_su(&oper_su)
                .into_iter()
                .filter(|si| {
                    self.model
                        .sis
                        .get(si)
                        .is_some_and(|instance| instance.invocation.is_some())
                })
                .collect();
            for si in swapped {
                self.resolve_si_invocation(&si, AdminStatus::BadOperation, out);
            }
            if self.has_quiesced_or_quiescing(&oper_su) {
                self.modify_send_su(&oper_su, HaState::Active, out)?;
            }
        }

        if self.has_active_side(su_name) {
            self.quiesce_su_honouring_deps(su_name, HaState::Quiesced, out)?;
        } else {
            self.del_send_su(su_name, out)?;
        }
        self.oper_list_add(sg_name, su_name);
        self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
        Ok(())
    }
}
