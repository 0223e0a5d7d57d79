//! The N-Way redundancy model.
//!
//! Each instance holds one active assignment plus standby assignments on as
//! many distinct units as the group prefers. Choosing walks the instance's
//! own ranked-unit list first, then the group's rank order.

use gabbro_types::{AdminState, EntityName, HaState, SgFsmState, SusiFsm};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::event::SusiOperation;
use crate::order::EngineOutput;

impl Engine {
    /// The N-Way chooser. Active assignments for every unassigned instance
    /// first; standby fill only once no active order is pending.
    pub(crate) fn nway_si_assign(
        &mut self,
        sg_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<bool, EngineError> {
        let sis = self.model.sg(sg_name)?.sis.clone();
        let mut emitted_active = false;

        for si_name in &sis {
            if !self.model.si(si_name)?.is_assignable() {
                continue;
            }
            let unassigned = self
                .model
                .assignments
                .of_si(si_name)
                .all(|a| a.fsm == SusiFsm::Unassigned);
            if !unassigned {
                continue;
            }
            let Some(target) = self.nway_pick_su(sg_name, si_name, HaState::Active)? else {
                continue;
            };
            match self.new_assign(&target, si_name, HaState::Active, false, out) {
                Ok(()) => {
                    self.oper_list_add(sg_name, &target);
                    emitted_active = true;
                }
                Err(err) => tracing::debug!(si = %si_name, %err, "active assignment skipped"),
            }
        }
        if emitted_active {
            return Ok(true);
        }

        // Standby fill, up to the preferred standby count per instance.
        let pref_standbys = self.model.sg(sg_name)?.pref_num_standby_sus;
        let mut emitted = false;
        for si_name in &sis {
            let si = self.model.si(si_name)?;
            if si.admin_state != AdminState::Unlocked || !si.csis_ready() {
                continue;
            }
            let has_active = self
                .model
                .assignments
                .of_si(si_name)
                .any(|a| a.ha == HaState::Active && a.fsm != SusiFsm::Unassigned);
            if !has_active {
                continue;
            }
            loop {
                let standbys = self.model.assignments.standbys_of_si(si_name).count() as u32;
                if standbys >= pref_standbys {
                    break;
                }
                let Some(target) = self.nway_pick_su(sg_name, si_name, HaState::Standby)? else {
                    break;
                };
                match self.new_assign(&target, si_name, HaState::Standby, false, out) {
                    Ok(()) => {
                        self.oper_list_add(sg_name, &target);
                        emitted = true;
                    }
                    Err(err) => {
                        tracing::debug!(si = %si_name, %err, "standby assignment skipped");
                        break;
                    }
                }
            }
        }
        Ok(emitted)
    }

    /// Candidate unit for one instance and role: the instance's ranked-unit
    /// list first (when configured), then the group's rank order.
    fn nway_pick_su(
        &self,
        sg_name: &EntityName,
        si_name: &EntityName,
        ha: HaState,
    ) -> Result<Option<EntityName>, EngineError> {
        let preferred = self.model.si(si_name)?.ranked_sus.clone();
        for su in &preferred {
            if self.model.sus.contains_key(su) && self.su_can_take(su, si_name, ha)? {
                return Ok(Some(su.clone()));
            }
        }
        let sg = self.model.sg(sg_name)?;
        for su in self.model.in_service_sus(sg) {
            if self.su_can_take(&su, si_name, ha)? {
                return Ok(Some(su));
            }
        }
        Ok(None)
    }

    /// True iff every non-standby assignment of the unit is covered by an
    /// acknowledged active for the same instance on some other unit.
    pub(crate) fn nway_stdby_sus_engaged(&self, su_name: &EntityName) -> bool {
        self.model
            .assignments
            .of_su(su_name)
            .filter(|a| a.ha != HaState::Standby && a.fsm != SusiFsm::Unassigned)
            .all(|a| {
                self.model.assignments.of_si(&a.si).any(|peer| {
                    peer.su != *su_name
                        && peer.ha == HaState::Active
                        && peer.fsm == SusiFsm::Assigned
                })
            })
    }

    /// Unit-operation completions for N-Way: the drain ack promotes a
    /// standby for every drained instance; the drained unit itself is only
    /// deleted once all its instances are served elsewhere.
    pub(crate) fn nway_success_su_oper(
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

                let promoted = self.promote_drained_standbys(sg_name, su_name, out)?;
                if !promoted {
                    // Nothing to take over; tear the unit down now.
                    self.del_send_su(su_name, out)?;
                    self.coerce_shutdown_to_lock(su_name)?;
                    self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
                }
                Ok(())
            }
            (SusiOperation::Modify, Some(HaState::Active)) => {
                // A promotion acked: drained units whose instances are all
                // served elsewhere can now be deleted.
                let drained: Vec<EntityName> = self
                    .model
                    .sg(sg_name)?
                    .su_oper_list
                    .iter()
                    .filter(|su| *su != su_name && self.all_quiesced(su))
                    .cloned()
                    .collect();
                let mut any = false;
                for su in drained {
                    if self.nway_stdby_sus_engaged(&su) {
                        self.del_send_su(&su, out)?;
                        self.coerce_shutdown_to_lock(&su)?;
                        any = true;
                    }
                }
                if any {
                    self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
                }
                Ok(())
            }
            (SusiOperation::Delete, _) => {
                self.free_deleted(su_name, si_name)?;
                if !self.model.assignments.has_any(su_name) {
                    self.coerce_shutdown_to_lock(su_name)?;
                    self.oper_list_del(sg_name, su_name);
                    self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
