//! Assignment orchestrator.
//!
//! Per-unit and per-assignment order emission, with the operation-list
//! bookkeeping every model shares. Nothing here blocks: an emitted order is
//! a value in the output, and completion arrives later as an event.
//!
//! Order emission is fallible and the state machine commits its transition
//! only after emission succeeded; on failure nothing has been mutated, so
//! the caller simply does not transition.

use gabbro_types::{EntityName, HaState, SusiFsm};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::event::TimeoutKind;
use crate::order::{EngineOutput, Order};

impl Engine {
    // ========================================================================
    // New Assignment
    // ========================================================================

    /// Creates a new assignment and emits the ASSIGN order.
    ///
    /// Fails if the unit is out of service, the instance is not assignable
    /// (admin state, children, sponsors), the pair is already bound, or
    /// capacity is exhausted. `forced` skips the readiness check; it is used
    /// when re-issuing assignments during group unlock where readiness is
    /// refreshed in the same step.
    pub(crate) fn new_assign(
        &mut self,
        su_name: &EntityName,
        si_name: &EntityName,
        ha: HaState,
        forced: bool,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let su = self.model.su(su_name)?;
        if !forced && !su.is_in_service() {
            return Err(EngineError::NotInService(su_name.clone()));
        }

        let si = self.model.si(si_name)?;
        if !si.is_assignable() {
            return Err(EngineError::BadOperation);
        }
        if ha == HaState::Active && !self.sponsors_ready(si_name)? {
            return Err(EngineError::SponsorsNotReady(si_name.clone()));
        }
        if self.model.assignments.get(su_name, si_name).is_some() {
            return Err(EngineError::AlreadyExists(si_name.clone()));
        }
        if !self.su_has_capacity(su_name, ha)? {
            return Err(EngineError::CapacityExhausted {
                su: su_name.clone(),
                ha,
            });
        }

        self.model
            .assignments
            .insert(su_name.clone(), si_name.clone(), ha)?;
        self.model.refresh_after_su_change(su_name)?;

        tracing::debug!(su = %su_name, si = %si_name, %ha, "new assignment");
        out.push_order(Order::Assign {
            su: su_name.clone(),
            si: si_name.clone(),
            ha,
        });
        out.arm(TimeoutKind::OrderAck {
            su: su_name.clone(),
            si: Some(si_name.clone()),
        });
        Ok(())
    }

    // ========================================================================
    // Modify
    // ========================================================================

    /// Emits MODIFY for every live assignment of a unit.
    pub(crate) fn modify_send_su(
        &mut self,
        su_name: &EntityName,
        ha: HaState,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        self.check_reachable(su_name)?;
        let mut any = false;
        self.model.assignments.for_each_of_su(su_name, |a| {
            if !matches!(a.fsm, SusiFsm::Unassigning | SusiFsm::Unassigned) {
                a.ha = ha;
                a.fsm = SusiFsm::Modifying;
                any = true;
            }
        });
        if !any {
            return Err(EngineError::BadOperation);
        }
        self.model.refresh_after_su_change(su_name)?;

        tracing::debug!(su = %su_name, %ha, "modify all assignments");
        out.push_order(Order::Modify {
            su: su_name.clone(),
            si: None,
            ha,
        });
        out.arm(TimeoutKind::OrderAck {
            su: su_name.clone(),
            si: None,
        });
        if ha == HaState::Quiesced {
            let sg = self.model.su(su_name)?.sg.clone();
            out.arm(TimeoutKind::Quiesced { sg });
        }
        Ok(())
    }

    /// Emits MODIFY for one assignment.
    pub(crate) fn modify_send_susi(
        &mut self,
        su_name: &EntityName,
        si_name: &EntityName,
        ha: HaState,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        self.check_reachable(su_name)?;
        let assignment = self
            .model
            .assignments
            .get_mut(su_name, si_name)
            .ok_or_else(|| EngineError::UnknownEntity {
                kind: "assignment",
                name: si_name.clone(),
            })?;
        assignment.ha = ha;
        assignment.fsm = SusiFsm::Modifying;
        self.model.refresh_after_su_change(su_name)?;

        tracing::debug!(su = %su_name, si = %si_name, %ha, "modify assignment");
        out.push_order(Order::Modify {
            su: su_name.clone(),
            si: Some(si_name.clone()),
            ha,
        });
        out.arm(TimeoutKind::OrderAck {
            su: su_name.clone(),
            si: Some(si_name.clone()),
        });
        if ha == HaState::Quiesced {
            let sg = self.model.su(su_name)?.sg.clone();
            out.arm(TimeoutKind::Quiesced { sg });
        }
        Ok(())
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Emits DELETE for every assignment of a unit.
    ///
    /// Active assignments must be quiesced first; deleting a serving
    /// assignment is a protocol violation.
    pub(crate) fn del_send_su(
        &mut self,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        self.check_reachable(su_name)?;
        debug_assert!(
            self.model
                .assignments
                .of_su(su_name)
                .all(|a| a.ha != HaState::Active),
            "delete of a serving assignment on {su_name}"
        );
        let mut any = false;
        self.model.assignments.for_each_of_su(su_name, |a| {
            if a.fsm != SusiFsm::Unassigned {
                a.fsm = SusiFsm::Unassigning;
                any = true;
            }
        });
        if !any {
            return Err(EngineError::BadOperation);
        }
        self.model.refresh_after_su_change(su_name)?;

        tracing::debug!(su = %su_name, "delete all assignments");
        out.push_order(Order::Delete {
            su: su_name.clone(),
            si: None,
        });
        out.arm(TimeoutKind::OrderAck {
            su: su_name.clone(),
            si: None,
        });
        Ok(())
    }

    /// Emits DELETE for one assignment.
    pub(crate) fn del_send_susi(
        &mut self,
        su_name: &EntityName,
        si_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        self.check_reachable(su_name)?;
        let assignment = self
            .model
            .assignments
            .get_mut(su_name, si_name)
            .ok_or_else(|| EngineError::UnknownEntity {
                kind: "assignment",
                name: si_name.clone(),
            })?;
        debug_assert!(
            assignment.ha != HaState::Active,
            "delete of a serving assignment {su_name}/{si_name}"
        );
        assignment.fsm = SusiFsm::Unassigning;
        self.model.refresh_after_su_change(su_name)?;

        tracing::debug!(su = %su_name, si = %si_name, "delete assignment");
        out.push_order(Order::Delete {
            su: su_name.clone(),
            si: Some(si_name.clone()),
        });
        out.arm(TimeoutKind::OrderAck {
            su: su_name.clone(),
            si: Some(si_name.clone()),
        });
        Ok(())
    }

    // ========================================================================
    // Operation List
    // ========================================================================

    /// Appends a unit to its group's operation list (deduplicated).
    pub(crate) fn oper_list_add(&mut self, sg_name: &EntityName, su_name: &EntityName) {
        if let Ok(sg) = self.model.sg_mut(sg_name)
            && sg.oper_list_add(su_name)
        {
            tracing::debug!(sg = %sg_name, su = %su_name, "oper list add");
        }
    }

    /// Removes a unit from its group's operation list if present.
    pub(crate) fn oper_list_del(&mut self, sg_name: &EntityName, su_name: &EntityName) {
        if let Ok(sg) = self.model.sg_mut(sg_name)
            && sg.oper_list_del(su_name)
        {
            tracing::debug!(sg = %sg_name, su = %su_name, "oper list del");
        }
    }

    // ========================================================================
    // Candidate Predicates
    // ========================================================================

    /// Capacity check for one more assignment of `ha` on a unit, against
    /// both the per-unit cap and the group-wide per-unit cap (0 = unlimited).
    pub(crate) fn su_has_capacity(
        &self,
        su_name: &EntityName,
        ha: HaState,
    ) -> Result<bool, EngineError> {
        let su = self.model.su(su_name)?;
        let sg = self.model.sg(&su.sg)?;
        let active_side = ha.is_active_side();
        if !su.has_local_capacity(active_side) {
            return Ok(false);
        }
        let (current, group_cap) = if active_side {
            (su.num_active, sg.max_active_sis_per_su)
        } else {
            (su.num_standby, sg.max_standby_sis_per_su)
        };
        Ok(group_cap == 0 || current < group_cap)
    }

    /// True iff the unit is in service, has capacity for `ha`, and is not
    /// already bound to the instance.
    pub(crate) fn su_can_take(
        &self,
        su_name: &EntityName,
        si_name: &EntityName,
        ha: HaState,
    ) -> Result<bool, EngineError> {
        let su = self.model.su(su_name)?;
        Ok(su.is_in_service()
            && self.model.assignments.get(su_name, si_name).is_none()
            && self.su_has_capacity(su_name, ha)?)
    }

    /// Fails with [`EngineError::NotInService`] when the unit's node agent
    /// cannot receive orders.
    fn check_reachable(&self, su_name: &EntityName) -> Result<(), EngineError> {
        let su = self.model.su(su_name)?;
        let node = self.model.node(su.node)?;
        if !node.is_reachable() {
            return Err(EngineError::NotInService(su_name.clone()));
        }
        Ok(())
    }

    // ========================================================================
    // Local Teardown
    // ========================================================================

    /// Frees the assignments a DELETE reply acknowledged, honouring the
    /// reply granularity: one assignment, or the whole unit.
    pub(crate) fn free_deleted(
        &mut self,
        su_name: &EntityName,
        si_name: Option<&EntityName>,
    ) -> Result<(), EngineError> {
        match si_name {
            Some(si) => {
                self.model.assignments.remove(su_name, si);
                self.model.refresh_su_counts(su_name)?;
                self.model.refresh_si_state(si)?;
                Ok(())
            }
            None => self.free_su_assignments(su_name),
        }
    }

    /// Frees every assignment of a unit locally, without emitting orders.
    /// Used after DELETE completion and for units on dead nodes.
    pub(crate) fn free_su_assignments(&mut self, su_name: &EntityName) -> Result<(), EngineError> {
        let removed = self.model.assignments.remove_all_of_su(su_name);
        if !removed.is_empty() {
            tracing::debug!(su = %su_name, count = removed.len(), "assignments freed");
        }
        self.model.refresh_su_counts(su_name)?;
        for assignment in removed {
            self.model.refresh_si_state(&assignment.si)?;
        }
        Ok(())
    }
}
