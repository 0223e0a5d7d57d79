//! The N+M redundancy model.
//!
//! Up to N serving units plus up to M standby units; the standby pairing is
//! one-to-one per unit, so all instances served by one unit share a single
//! standby peer. Equal-ranked groups distribute by load instead of rank and
//! may rebalance one instance per stable cycle.

use gabbro_types::{AdminState, EntityName, HaState, SgFsmState, SusiFsm};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::event::SusiOperation;
use crate::model::Redistribution;
use crate::order::EngineOutput;

impl Engine {
    /// The N+M chooser. Active pass first: fill existing serving units in
    /// rank order up to the group cap, opening new units while fewer than
    /// the preferred count serve. Standby work only starts once no active
    /// order is pending, preferring each instance's serving unit's existing
    /// standby peer.
    pub(crate) fn npm_chose_asgn(
        &mut self,
        sg_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<bool, EngineError> {
        if self.model.sg(sg_name)?.equal_ranked_sus {
            return self.npm_distribute_equal(sg_name, out);
        }

        let sis = self.model.sg(sg_name)?.sis.clone();
        let pref_active = self.model.sg(sg_name)?.pref_num_active_sus;
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

            let target = self.npm_pick_active_su(sg_name, si_name, pref_active)?;
            let Some(target) = target else {
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

        // Standby pass.
        let mut emitted = false;
        for si_name in &sis {
            let si = self.model.si(si_name)?;
            if si.admin_state != AdminState::Unlocked || !si.csis_ready() {
                continue;
            }
            let Some(active) = self.model.assignments.active_of_si(si_name).cloned() else {
                continue;
            };
            let has_standby = self
                .model
                .assignments
                .standbys_of_si(si_name)
                .next()
                .is_some();
            if has_standby {
                continue;
            }

            let peer = self.npm_standby_peer_of(&active.su, si_name)?;
            let target = match peer {
                Some(peer) if self.su_can_take(&peer, si_name, HaState::Standby)? => Some(peer),
                _ => self.npm_pick_standby_su(sg_name, si_name)?,
            };
            let Some(target) = target else {
                continue;
            };
            match self.new_assign(&target, si_name, HaState::Standby, false, out) {
                Ok(()) => {
                    self.oper_list_add(sg_name, &target);
                    emitted = true;
                }
                Err(err) => tracing::debug!(si = %si_name, %err, "standby assignment skipped"),
            }
        }
        Ok(emitted)
    }

    /// Active candidate, rank mode: the highest-ranked serving unit with
    /// room, else a fresh unit while fewer than the preferred count serve.
    /// When every serving unit is at its cap and the preferred count is
    /// reached, a fresh unit may still open, but only from the spare units
    /// left over once the standby side has the units the group prefers.
    fn npm_pick_active_su(
        &self,
        sg_name: &EntityName,
        si_name: &EntityName,
        pref_active: u32,
    ) -> Result<Option<EntityName>, EngineError> {
        let sg = self.model.sg(sg_name)?;
        let pref_standby = sg.pref_num_standby_sus;
        let in_service = self.model.in_service_sus(sg);
        let serving: Vec<EntityName> = in_service
            .iter()
            .filter(|su| self.has_active_side(su))
            .cloned()
            .collect();
        for su in &serving {
            if self.su_can_take(su, si_name, HaState::Active)? {
                return Ok(Some(su.clone()));
            }
        }
        let spares: Vec<&EntityName> = in_service
            .iter()
            .filter(|su| !self.model.assignments.has_any(su))
            .collect();
        if (serving.len() as u32) < pref_active {
            for su in &spares {
                if self.su_can_take(su, si_name, HaState::Active)? {
                    return Ok(Some((*su).clone()));
                }
            }
            return Ok(None);
        }
        // Preferred serving count reached and every serving unit is full:
        // spill onto spare capacity, keeping enough spare units back for the
        // standby side.
        let standby_units = in_service
            .iter()
            .filter(|su| self.model.assignments.has_any(su) && !self.has_active_side(su))
            .count() as u32;
        let reserved = pref_standby.saturating_sub(standby_units) as usize;
        for su in spares.iter().skip(reserved) {
            if self.su_can_take(su, si_name, HaState::Active)? {
                return Ok(Some((*su).clone()));
            }
        }
        Ok(None)
    }

    /// Standby candidate, rank mode: an existing standby unit with room
    /// first; a fresh unit opens only while fewer than the preferred standby
    /// count exist.
    fn npm_pick_standby_su(
        &self,
        sg_name: &EntityName,
        si_name: &EntityName,
    ) -> Result<Option<EntityName>, EngineError> {
        let sg = self.model.sg(sg_name)?;
        let pref_standby = sg.pref_num_standby_sus;
        let in_service = self.model.in_service_sus(sg);
        let standby_units: Vec<EntityName> = in_service
            .iter()
            .filter(|su| self.model.assignments.has_any(su) && !self.has_active_side(su))
            .cloned()
            .collect();
        for su in &standby_units {
            if self.su_can_take(su, si_name, HaState::Standby)? {
                return Ok(Some(su.clone()));
            }
        }
        if (standby_units.len() as u32) < pref_standby {
            for su in &in_service {
                if !self.model.assignments.has_any(su)
                    && self.su_can_take(su, si_name, HaState::Standby)?
                {
                    return Ok(Some(su.clone()));
                }
            }
        }
        Ok(None)
    }

    /// The standby peer of a serving unit: the unit already holding a
    /// standby for any instance this unit serves.
    fn npm_standby_peer_of(
        &self,
        active_su: &EntityName,
        skip_si: &EntityName,
    ) -> Result<Option<EntityName>, EngineError> {
        for si_name in self.model.assignments.sis_of_su(active_su) {
            if si_name == *skip_si {
                continue;
            }
            if let Some(standby) = self
                .model
                .assignments
                .standbys_of_si(&si_name)
                .next()
            {
                return Ok(Some(standby.su.clone()));
            }
        }
        Ok(None)
    }

    // ========================================================================
    // Equal-Rank Mode
    // ========================================================================

    /// Load-based distribution for equal-ranked groups: every instance goes
    /// to the least-loaded eligible unit for its role.
    fn npm_distribute_equal(
        &mut self,
        sg_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<bool, EngineError> {
        let sis = self.model.sg(sg_name)?.sis.clone();
        let mut emitted = false;

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
            let Some(target) = self.npm_get_least_su(sg_name, HaState::Active)? else {
                break;
            };
            match self.new_assign(&target, si_name, HaState::Active, false, out) {
                Ok(()) => {
                    self.oper_list_add(sg_name, &target);
                    emitted = true;
                }
                Err(err) => tracing::debug!(si = %si_name, %err, "active assignment skipped"),
            }
        }

        for si_name in &sis {
            let has_active = self
                .model
                .assignments
                .of_si(si_name)
                .any(|a| a.ha == HaState::Active && a.fsm != SusiFsm::Unassigned);
            let has_standby = self
                .model
                .assignments
                .standbys_of_si(si_name)
                .next()
                .is_some();
            if !has_active || has_standby {
                continue;
            }
            let Some(target) = self.npm_get_least_su(sg_name, HaState::Standby)? else {
                break;
            };
            if !self.su_can_take(&target, si_name, HaState::Standby)? {
                continue;
            }
            match self.new_assign(&target, si_name, HaState::Standby, false, out) {
                Ok(()) => {
                    self.oper_list_add(sg_name, &target);
                    emitted = true;
                }
                Err(err) => tracing::debug!(si = %si_name, %err, "standby assignment skipped"),
            }
        }
        Ok(emitted)
    }

    /// The in-service unit with the fewest assignments for the requested
    /// role, with a fast path returning the first empty unit while the
    /// preferred unit count is not yet saturated.
    pub(crate) fn npm_get_least_su(
        &self,
        sg_name: &EntityName,
        ha: HaState,
    ) -> Result<Option<EntityName>, EngineError> {
        let sg = self.model.sg(sg_name)?;
        let in_service = self.model.in_service_sus(sg);
        let pref = if ha == HaState::Active {
            sg.pref_num_active_sus
        } else {
            sg.pref_num_standby_sus
        };
        let occupied: Vec<&EntityName> = in_service
            .iter()
            .filter(|su| {
                self.model.assignments.has_any(su)
                    && if ha == HaState::Active {
                        self.has_active_side(su)
                    } else {
                        !self.has_active_side(su)
                    }
            })
            .collect();

        if (occupied.len() as u32) < pref {
            if let Some(empty) = in_service
                .iter()
                .find(|su| !self.model.assignments.has_any(su))
            {
                return Ok(Some(empty.clone()));
            }
        }

        let mut best: Option<(u32, EntityName)> = None;
        for su_name in occupied {
            let su = self.model.su(su_name)?;
            let (count, cap) = if ha == HaState::Active {
                (su.num_active, sg.max_active_sis_per_su)
            } else {
                (su.num_standby, sg.max_standby_sis_per_su)
            };
            if cap != 0 && count >= cap {
                continue;
            }
            if best.as_ref().is_none_or(|(least, _)| count < *least) {
                best = Some((count, su_name.clone()));
            }
        }
        Ok(best.map(|(_, su)| su))
    }

    // ========================================================================
    // Redistribution
    // ========================================================================

    /// Screens for imbalance on entry to STABLE (or on an explicit adjust).
    /// Moves at most one instance per stable cycle: the highest-ranked
    /// instance on the most-loaded unit is drained there and re-assigned on
    /// the least-loaded unit. Standby imbalance is only considered once the
    /// serving side is level. Returns true when a transfer was started.
    pub(crate) fn npm_screen_redistribution(
        &mut self,
        sg_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<bool, EngineError> {
        let sg = self.model.sg(sg_name)?;
        let in_service = self.model.in_service_sus(sg);
        let pref_active = sg.pref_num_active_sus;
        let pref_standby = sg.pref_num_standby_sus;

        // Serving side first.
        let serving: Vec<EntityName> = in_service
            .iter()
            .filter(|su| self.model.assignments.has_any(su) && self.has_active_side(su))
            .cloned()
            .collect();
        if let Some(transfer) =
            self.pick_transfer(&in_service, &serving, pref_active, HaState::Active)?
        {
            let (max_su, min_su, si) = transfer;
            tracing::info!(sg = %sg_name, si = %si, from = %max_su, to = %min_su, "redistributing");
            self.modify_send_susi(&max_su, &si, HaState::Quiesced, out)?;
            self.oper_list_add(sg_name, &max_su);
            let sg = self.model.sg_mut(sg_name)?;
            sg.fsm_state = SgFsmState::SuOper;
            sg.redistribution = Some(Redistribution { max_su, min_su, si });
            return Ok(true);
        }

        // Standby side once actives are level.
        let standby_side: Vec<EntityName> = in_service
            .iter()
            .filter(|su| self.model.assignments.has_any(su) && !self.has_active_side(su))
            .cloned()
            .collect();
        if let Some((max_su, _, si)) =
            self.pick_transfer(&in_service, &standby_side, pref_standby, HaState::Standby)?
        {
            tracing::info!(sg = %sg_name, si = %si, from = %max_su, "rebalancing standby");
            self.del_send_susi(&max_su, &si, out)?;
            self.oper_list_add(sg_name, &max_su);
            self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
            return Ok(true);
        }
        Ok(false)
    }

    /// Max/min screening for one role. The least-loaded side may be
    /// overridden by a fully empty in-service unit while the preferred count
    /// is not yet reached (only here, on entry, never mid-flight).
    fn pick_transfer(
        &self,
        in_service: &[EntityName],
        occupied: &[EntityName],
        pref: u32,
        ha: HaState,
    ) -> Result<Option<(EntityName, EntityName, EntityName)>, EngineError> {
        let count_of = |su: &EntityName| -> Result<u32, EngineError> {
            let unit = self.model.su(su)?;
            Ok(if ha == HaState::Active {
                unit.num_active
            } else {
                unit.num_standby
            })
        };
        let mut max_su: Option<EntityName> = None;
        let mut min_su: Option<EntityName> = None;
        for su in occupied {
            let count = count_of(su)?;
            if max_su.as_ref().is_none_or(|m| count > count_of(m).unwrap_or(0)) {
                max_su = Some(su.clone());
            }
            if min_su.as_ref().is_none_or(|m| count < count_of(m).unwrap_or(u32::MAX)) {
                min_su = Some(su.clone());
            }
        }
        let Some(max_su) = max_su else {
            return Ok(None);
        };
        let mut min_su = min_su.expect("max implies min");

        if (occupied.len() as u32) < pref
            && let Some(empty) = in_service
                .iter()
                .find(|su| !self.model.assignments.has_any(su))
        {
            min_su = empty.clone();
        }

        if count_of(&max_su)?.saturating_sub(count_of(&min_su)?) <= 1 {
            return Ok(None);
        }

        // The highest-ranked instance on the most-loaded unit moves.
        let mut chosen: Option<(gabbro_types::SiRank, EntityName)> = None;
        for si_name in self.model.assignments.sis_of_su(&max_su) {
            let matching = self
                .model
                .assignments
                .get(&max_su, &si_name)
                .is_some_and(|a| a.ha == ha && a.fsm == SusiFsm::Assigned);
            if !matching {
                continue;
            }
            let rank = self.model.si(&si_name)?.rank;
            if chosen.as_ref().is_none_or(|(best, _)| rank < *best) {
                chosen = Some((rank, si_name));
            }
        }
        Ok(chosen.map(|(_, si)| (max_su, min_su, si)))
    }

    // ========================================================================
    // Unit-Operation Completions
    // ========================================================================

    /// Unit-operation completions for N+M: redistribution hand-off, staged
    /// drains, and per-instance failover to the standby peer.
    pub(crate) fn npm_success_su_oper(
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
                // Redistribution: the drained instance restarts on the
                // least-loaded unit, or reverts if that unit went away.
                let redistribution = self.model.sg(sg_name)?.redistribution.clone();
                if let Some(transfer) = redistribution
                    && transfer.max_su == *su_name
                {
                    let min_alive = self
                        .model
                        .sus
                        .get(&transfer.min_su)
                        .is_some_and(|su| su.is_in_service());
                    if min_alive {
                        self.del_send_susi(&transfer.max_su, &transfer.si, out)?;
                        match self.new_assign(
                            &transfer.min_su,
                            &transfer.si,
                            HaState::Active,
                            false,
                            out,
                        ) {
                            Ok(()) => self.oper_list_add(sg_name, &transfer.min_su),
                            Err(err) => {
                                tracing::warn!(si = %transfer.si, %err, "transfer target refused")
                            }
                        }
                    } else {
                        self.modify_send_susi(
                            &transfer.max_su,
                            &transfer.si,
                            HaState::Active,
                            out,
                        )?;
                    }
                    let sg = self.model.sg_mut(sg_name)?;
                    sg.redistribution = None;
                    sg.fsm_state = SgFsmState::SgRealign;
                    return Ok(());
                }

                if !self.model.sg(sg_name)?.in_oper_list(su_name) {
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

                // Drain complete: each instance fails over to its standby.
                self.promote_drained_standbys(sg_name, su_name, out)?;
                self.del_send_su(su_name, out)?;
                self.coerce_shutdown_to_lock(su_name)?;
                self.model.sg_mut(sg_name)?.fsm_state = SgFsmState::SgRealign;
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
