//! Instance-to-instance dependency tracker.
//!
//! Maintains the sponsor/dependent relation and decides when role failover
//! may proceed. A dependent is only given an ACTIVE order after every
//! sponsor's ACTIVE order has been acknowledged; on sponsor loss a per-edge
//! toleration window runs before the dependent is torn down.

use gabbro_types::{DepState, EntityName, HaState, SgFsmState, SusiFsm};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::event::TimeoutKind;
use crate::order::EngineOutput;

impl Engine {
    // ========================================================================
    // Sponsor Screening
    // ========================================================================

    /// True iff every sponsor of `si` holds its required HA state with an
    /// acknowledged assignment.
    pub(crate) fn sponsors_ready(&self, si_name: &EntityName) -> Result<bool, EngineError> {
        let si = self.model.si(si_name)?;
        Ok(si.sponsors.iter().all(|edge| {
            self.model
                .assignments
                .of_si(&edge.sponsor)
                .any(|a| a.ha == edge.required_ha && a.fsm == SusiFsm::Assigned)
        }))
    }

    /// Adjusts the dependency state of one instance from its sponsors'
    /// current assignments. Called for every instance on STABLE entry and
    /// before the choosers run.
    pub(crate) fn screen_sponsor_state(&mut self, si_name: &EntityName) -> Result<(), EngineError> {
        let si = self.model.si(si_name)?;
        if !si.has_sponsors() {
            return Ok(());
        }
        let dep_state = si.dep_state;
        let ready = self.sponsors_ready(si_name)?;
        let torn_down = self
            .model
            .assignments
            .of_si(si_name)
            .all(|a| a.fsm == SusiFsm::Unassigned);
        let next = match (dep_state, ready) {
            // Blocked instance whose sponsors came up.
            (DepState::SponsorUnassigned | DepState::FailoverUnderProgress, true) => {
                Some(DepState::Assigned)
            }
            // Unassigned dependent with a missing sponsor.
            (DepState::Assigned | DepState::NoDependency, false) => {
                if torn_down {
                    Some(DepState::SponsorUnassigned)
                } else {
                    None
                }
            }
            // Teardown finished; the instance waits for its sponsors again.
            (DepState::UnassigningDueToDep | DepState::ReadyToUnassign, _) => {
                if torn_down {
                    Some(DepState::SponsorUnassigned)
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some(state) = next {
            self.set_dep_state(si_name, state)?;
        }
        Ok(())
    }

    pub(crate) fn set_dep_state(
        &mut self,
        si_name: &EntityName,
        state: DepState,
    ) -> Result<(), EngineError> {
        let si = self.model.si_mut(si_name)?;
        if si.dep_state != state {
            tracing::debug!(si = %si_name, from = %si.dep_state, to = %state, "dep state");
            si.dep_state = state;
        }
        Ok(())
    }

    // ========================================================================
    // Sponsor Transitions
    // ========================================================================

    /// Called when a sponsor's ACTIVE assignment is acknowledged. Promotes
    /// dependents that were waiting on the failover and releases blocked
    /// ones for the next assigner pass.
    pub(crate) fn sponsor_became_active(
        &mut self,
        sponsor: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        for dependent in self.model.dependents_of(sponsor) {
            if !self.sponsors_ready(&dependent)? {
                continue;
            }
            let dep_state = self.model.si(&dependent)?.dep_state;
            match dep_state {
                DepState::FailoverUnderProgress => {
                    out.cancel(TimeoutKind::AwaitActive {
                        si: dependent.clone(),
                    });
                    // A dependent that lost its own active in the same sweep
                    // gets its standby promoted; one that kept it is simply
                    // re-asserted.
                    let has_active = self
                        .model
                        .assignments
                        .of_si(&dependent)
                        .any(|a| a.ha == HaState::Active && a.fsm != SusiFsm::Unassigned);
                    if !has_active
                        && let Some((su, si)) = self.pref_standby_for_promotion(&dependent)?
                    {
                        self.modify_send_susi(&su, &si, HaState::Active, out)?;
                        let sg_name = self.model.su(&su)?.sg.clone();
                        self.oper_list_add(&sg_name, &su);
                    }
                    self.set_dep_state(&dependent, DepState::Assigned)?;
                }
                DepState::SponsorUnassigned | DepState::TolTimerRunning => {
                    if dep_state == DepState::TolTimerRunning {
                        for edge in self.model.si(&dependent)?.sponsors.clone() {
                            out.cancel(TimeoutKind::Toleration {
                                si: dependent.clone(),
                                sponsor: edge.sponsor,
                            });
                        }
                    }
                    // Picked up by the chooser on the next STABLE entry.
                    self.set_dep_state(&dependent, DepState::Assigned)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Called when a sponsor lost its ACTIVE assignment without a failover
    /// in progress. Assigned dependents get a toleration window; unassigned
    /// ones are simply blocked.
    pub(crate) fn sponsor_lost(
        &mut self,
        sponsor: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        for dependent in self.model.dependents_of(sponsor) {
            if self.sponsors_ready(&dependent)? {
                continue;
            }
            let has_assignments = self
                .model
                .assignments
                .of_si(&dependent)
                .any(|a| a.fsm != SusiFsm::Unassigned);
            let dep_state = self.model.si(&dependent)?.dep_state;
            if has_assignments {
                if matches!(dep_state, DepState::Assigned | DepState::NoDependency) {
                    self.set_dep_state(&dependent, DepState::TolTimerRunning)?;
                    out.arm(TimeoutKind::Toleration {
                        si: dependent.clone(),
                        sponsor: sponsor.clone(),
                    });
                }
            } else {
                self.set_dep_state(&dependent, DepState::SponsorUnassigned)?;
            }
        }
        Ok(())
    }

    /// Toleration expired: tear the dependent down. Active assignments are
    /// quiesced first; everything else is deleted.
    pub(crate) fn on_toleration_expiry(
        &mut self,
        si_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        if self.model.si(si_name)?.dep_state != DepState::TolTimerRunning {
            return Ok(());
        }
        self.set_dep_state(si_name, DepState::ReadyToUnassign)?;
        self.unassign_dependent(si_name, out)?;
        Ok(())
    }

    /// Await-active expired: the sponsor's promotion never completed. Treat
    /// the dependent as sponsor-less and tear it down.
    pub(crate) fn on_await_active_expiry(
        &mut self,
        si_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        if self.model.si(si_name)?.dep_state != DepState::FailoverUnderProgress {
            return Ok(());
        }
        tracing::warn!(si = %si_name, "sponsor promotion timed out");
        self.set_dep_state(si_name, DepState::ReadyToUnassign)?;
        self.unassign_dependent(si_name, out)?;
        Ok(())
    }

    fn unassign_dependent(
        &mut self,
        si_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        let targets: Vec<(EntityName, HaState)> = self
            .model
            .assignments
            .of_si(si_name)
            .filter(|a| a.fsm != SusiFsm::Unassigned)
            .map(|a| (a.su.clone(), a.ha))
            .collect();
        let mut any = false;
        for (su, ha) in targets {
            if ha == HaState::Active {
                self.modify_send_susi(&su, si_name, HaState::Quiesced, out)?;
            } else {
                self.del_send_susi(&su, si_name, out)?;
            }
            let sg_name = self.model.su(&su)?.sg.clone();
            self.oper_list_add(&sg_name, &su);
            let sg = self.model.sg_mut(&sg_name)?;
            if sg.fsm_state == SgFsmState::Stable {
                sg.fsm_state = SgFsmState::SgRealign;
            }
            any = true;
        }
        if any {
            self.set_dep_state(si_name, DepState::UnassigningDueToDep)?;
        } else {
            self.set_dep_state(si_name, DepState::SponsorUnassigned)?;
        }
        Ok(())
    }

    // ========================================================================
    // Failover Support
    // ========================================================================

    /// True iff losing `su` leaves every sponsor of its active instances
    /// still actively assigned somewhere else. Used to delay standby
    /// promotion that would violate sponsorship.
    pub(crate) fn is_failover_possible(&self, su_name: &EntityName) -> Result<bool, EngineError> {
        for assignment in self.model.assignments.of_su(su_name) {
            if !assignment.ha.is_active_side() {
                continue;
            }
            let si = self.model.si(&assignment.si)?;
            for edge in &si.sponsors {
                let survives = self
                    .model
                    .assignments
                    .of_si(&edge.sponsor)
                    .any(|a| a.ha == edge.required_ha && a.su != *su_name);
                if !survives {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Promotes the standbys on `to_su` for the instances lost with
    /// `from_su`, sponsors first. Dependents whose sponsor is being promoted
    /// in the same pass are parked in `FailoverUnderProgress` and promoted
    /// when the sponsor's ACTIVE is acknowledged.
    pub(crate) fn role_failover_with_dep_ordering(
        &mut self,
        from_su: &EntityName,
        to_su: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<bool, EngineError> {
        let candidates = self.model.assignments.sis_of_su(to_su);
        let mut any = false;
        for si_name in candidates {
            let assignment = match self.model.assignments.get(to_su, &si_name) {
                Some(a) if a.ha == HaState::Standby && a.fsm == SusiFsm::Assigned => a.clone(),
                _ => continue,
            };
            // Sponsors must be acknowledged-active on a surviving unit.
            let blocked = {
                let si = self.model.si(&si_name)?;
                si.sponsors.iter().any(|edge| {
                    !self.model.assignments.of_si(&edge.sponsor).any(|a| {
                        a.ha == edge.required_ha && a.fsm == SusiFsm::Assigned && a.su != *from_su
                    })
                })
            };
            if blocked {
                self.set_dep_state(&si_name, DepState::FailoverUnderProgress)?;
                out.arm(TimeoutKind::AwaitActive {
                    si: si_name.clone(),
                });
                continue;
            }
            self.modify_send_susi(&assignment.su, &si_name, HaState::Active, out)?;
            any = true;
        }
        Ok(any)
    }

    /// The next assignment to quiesce on a unit, honouring intra-unit
    /// dependencies: a sponsor is only quiesced once no dependent of it is
    /// still serving on the same unit.
    pub(crate) fn next_susi_to_be_quiesced(
        &self,
        su_name: &EntityName,
    ) -> Result<Option<EntityName>, EngineError> {
        for si_name in self.model.assignments.sis_of_su(su_name) {
            let assignment = self
                .model
                .assignments
                .get(su_name, &si_name)
                .expect("listed assignment exists");
            if !assignment.ha.is_active_side() || assignment.fsm == SusiFsm::Modifying {
                continue;
            }
            let has_serving_dependent = self.model.dependents_of(&si_name).iter().any(|dep| {
                self.model
                    .assignments
                    .get(su_name, dep)
                    .is_some_and(|a| a.ha.is_active_side())
            });
            if !has_serving_dependent {
                return Ok(Some(si_name));
            }
        }
        Ok(None)
    }

    /// True iff an instance on this unit sponsors another instance on the
    /// same unit. Such units must be quiesced assignment by assignment.
    pub(crate) fn intra_su_dependency_exists(
        &self,
        su_name: &EntityName,
    ) -> Result<bool, EngineError> {
        let sis = self.model.assignments.sis_of_su(su_name);
        for si_name in &sis {
            let si = self.model.si(si_name)?;
            if si
                .sponsors
                .iter()
                .any(|edge| sis.contains(&edge.sponsor))
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Quiesces assignments of a unit honouring intra-unit dependency order:
    /// one at a time, dependents before sponsors. Falls back to a single
    /// all-assignment MODIFY when no intra-unit dependency exists.
    pub(crate) fn quiesce_su_honouring_deps(
        &mut self,
        su_name: &EntityName,
        ha: HaState,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        debug_assert!(matches!(ha, HaState::Quiesced | HaState::Quiescing));
        if self.intra_su_dependency_exists(su_name)? {
            let next = self
                .next_susi_to_be_quiesced(su_name)?
                .ok_or(EngineError::BadOperation)?;
            self.modify_send_susi(su_name, &next, ha, out)
        } else {
            self.modify_send_su(su_name, ha, out)
        }
    }

    /// Marks dependents of instances served by a lost unit, arming the
    /// await-active bound for each.
    pub(crate) fn mark_dependents_of_su(
        &mut self,
        su_name: &EntityName,
        out: &mut EngineOutput,
    ) -> Result<(), EngineError> {
        for si_name in self.model.assignments.sis_of_su(su_name) {
            let serving = self
                .model
                .assignments
                .get(su_name, &si_name)
                .is_some_and(|a| a.ha.is_active_side());
            if !serving {
                continue;
            }
            for dependent in self.model.dependents_of(&si_name) {
                if self.model.si(&dependent)?.dep_state == DepState::Assigned {
                    self.set_dep_state(&dependent, DepState::FailoverUnderProgress)?;
                    out.arm(TimeoutKind::AwaitActive {
                        si: dependent.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Best standby of an instance for promotion: the highest-ranked
    /// in-service unit holding a standby whose current active count,
    /// recomputed from its assignments rather than the cached counter, is
    /// below the group cap.
    pub(crate) fn pref_standby_for_promotion(
        &self,
        si_name: &EntityName,
    ) -> Result<Option<(EntityName, EntityName)>, EngineError> {
        if !self.sponsors_ready(si_name)? {
            return Ok(None);
        }
        let si = self.model.si(si_name)?;
        let sg = self.model.sg(&si.sg)?;
        let mut best: Option<(gabbro_types::SuRank, EntityName)> = None;
        for assignment in self.model.assignments.standbys_of_si(si_name) {
            if assignment.fsm != SusiFsm::Assigned {
                continue;
            }
            let su = self.model.su(&assignment.su)?;
            if !su.is_in_service() {
                continue;
            }
            let active_now = self
                .model
                .assignments
                .of_su(&assignment.su)
                .filter(|a| a.ha.is_active_side() && a.fsm != SusiFsm::Unassigned)
                .count() as u32;
            if sg.max_active_sis_per_su != 0 && active_now >= sg.max_active_sis_per_su {
                continue;
            }
            if best.as_ref().is_none_or(|(rank, _)| su.rank < *rank) {
                best = Some((su.rank, assignment.su.clone()));
            }
        }
        Ok(best.map(|(_, su)| (su, si_name.clone())))
    }
}
