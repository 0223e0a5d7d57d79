//! The assignment (SUSI) table.
//!
//! One [`Assignment`] binds one service unit to one service instance with an
//! HA role and a per-assignment message FSM. The original intrusive pointer
//! pairs (doubly linked through both the unit and the instance) are replaced
//! by a single owning map plus two insertion-ordered index lists, one per
//! unit and one per instance. The per-model choosers rely on insertion-order
//! traversal for deterministic rank handling; that order is preserved here.

use std::collections::BTreeMap;

use gabbro_types::{EntityName, HaState, SusiFsm};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A unit-instance binding with its HA role and message state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub su: EntityName,
    pub si: EntityName,
    pub ha: HaState,
    pub fsm: SusiFsm,
}

impl Assignment {
    /// True while no order is outstanding for this assignment.
    pub fn is_terminal(&self) -> bool {
        self.fsm.is_terminal()
    }
}

/// Owning store for all assignments, indexed both ways.
///
/// Exactly one assignment may exist per (unit, instance) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentTable {
    entries: BTreeMap<(EntityName, EntityName), Assignment>,
    /// Per-unit instance list, in insertion order.
    by_su: BTreeMap<EntityName, Vec<EntityName>>,
    /// Per-instance unit list, in insertion order.
    by_si: BTreeMap<EntityName, Vec<EntityName>>,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new assignment in `Assigning` state.
    pub fn insert(
        &mut self,
        su: EntityName,
        si: EntityName,
        ha: HaState,
    ) -> Result<(), EngineError> {
        let key = (su.clone(), si.clone());
        if self.entries.contains_key(&key) {
            return Err(EngineError::AlreadyExists(si));
        }
        self.by_su.entry(su.clone()).or_default().push(si.clone());
        self.by_si.entry(si.clone()).or_default().push(su.clone());
        self.entries.insert(
            key,
            Assignment {
                su,
                si,
                ha,
                fsm: SusiFsm::Assigning,
            },
        );
        Ok(())
    }

    /// Removes one assignment, returning it if present.
    pub fn remove(&mut self, su: &EntityName, si: &EntityName) -> Option<Assignment> {
        let removed = self.entries.remove(&(su.clone(), si.clone()))?;
        if let Some(list) = self.by_su.get_mut(su) {
            list.retain(|name| name != si);
            if list.is_empty() {
                self.by_su.remove(su);
            }
        }
        if let Some(list) = self.by_si.get_mut(si) {
            list.retain(|name| name != su);
            if list.is_empty() {
                self.by_si.remove(si);
            }
        }
        Some(removed)
    }

    /// Removes every assignment held by a unit, returning them in order.
    pub fn remove_all_of_su(&mut self, su: &EntityName) -> Vec<Assignment> {
        self.sis_of_su(su)
            .iter()
            .filter_map(|si| self.remove(su, si))
            .collect()
    }

    pub fn get(&self, su: &EntityName, si: &EntityName) -> Option<&Assignment> {
        self.entries.get(&(su.clone(), si.clone()))
    }

    pub fn get_mut(&mut self, su: &EntityName, si: &EntityName) -> Option<&mut Assignment> {
        self.entries.get_mut(&(su.clone(), si.clone()))
    }

    /// Instances assigned to a unit, in insertion order.
    pub fn sis_of_su(&self, su: &EntityName) -> Vec<EntityName> {
        self.by_su.get(su).cloned().unwrap_or_default()
    }

    /// Units assigned to an instance, in insertion order.
    pub fn sus_of_si(&self, si: &EntityName) -> Vec<EntityName> {
        self.by_si.get(si).cloned().unwrap_or_default()
    }

    /// Assignments held by a unit, in insertion order.
    pub fn of_su<'a>(&'a self, su: &'a EntityName) -> impl Iterator<Item = &'a Assignment> {
        self.by_su
            .get(su)
            .into_iter()
            .flatten()
            .filter_map(move |si| self.entries.get(&(su.clone(), si.clone())))
    }

    /// Assignments of an instance, in insertion order.
    pub fn of_si<'a>(&'a self, si: &'a EntityName) -> impl Iterator<Item = &'a Assignment> {
        self.by_si
            .get(si)
            .into_iter()
            .flatten()
            .filter_map(move |su| self.entries.get(&(su.clone(), si.clone())))
    }

    /// Applies `f` to every assignment of a unit, in insertion order.
    pub fn for_each_of_su(&mut self, su: &EntityName, mut f: impl FnMut(&mut Assignment)) {
        for si in self.sis_of_su(su) {
            if let Some(assignment) = self.entries.get_mut(&(su.clone(), si)) {
                f(assignment);
            }
        }
    }

    /// All assignments, in (unit, instance) order.
    pub fn iter(&self) -> impl Iterator<Item = &Assignment> {
        self.entries.values()
    }

    pub fn has_any(&self, su: &EntityName) -> bool {
        self.by_su.contains_key(su)
    }

    /// Number of assignments with the given role on a unit. `Unassigned`
    /// records are excluded: they only await destruction.
    pub fn count_of_su(&self, su: &EntityName, ha: HaState) -> u32 {
        self.of_su(su)
            .filter(|a| a.ha == ha && a.fsm != SusiFsm::Unassigned)
            .count() as u32
    }

    /// The active-role assignment of an instance, if any.
    pub fn active_of_si<'a>(&'a self, si: &'a EntityName) -> Option<&'a Assignment> {
        self.of_si(si)
            .find(|a| a.ha == HaState::Active && a.fsm != SusiFsm::Unassigned)
    }

    /// Standby assignments of an instance, in insertion order.
    pub fn standbys_of_si<'a>(&'a self, si: &'a EntityName) -> impl Iterator<Item = &'a Assignment> {
        self.of_si(si)
            .filter(|a| a.ha == HaState::Standby && a.fsm != SusiFsm::Unassigned)
    }

    /// True iff every assignment of a unit is in a terminal FSM state.
    pub fn all_terminal(&self, su: &EntityName) -> bool {
        self.of_su(su).all(Assignment::is_terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> EntityName {
        EntityName::from(s)
    }

    #[test]
    fn one_assignment_per_pair() {
        let mut table = AssignmentTable::new();
        table
            .insert(name("su1"), name("si1"), HaState::Active)
            .unwrap();
        let err = table.insert(name("su1"), name("si1"), HaState::Standby);
        assert!(err.is_err());
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut table = AssignmentTable::new();
        for si in ["si2", "si3", "si1"] {
            table.insert(name("su1"), name(si), HaState::Active).unwrap();
        }
        assert_eq!(
            table.sis_of_su(&name("su1")),
            vec![name("si2"), name("si3"), name("si1")]
        );
    }

    #[test]
    fn remove_cleans_both_indexes() {
        let mut table = AssignmentTable::new();
        table
            .insert(name("su1"), name("si1"), HaState::Active)
            .unwrap();
        table
            .insert(name("su2"), name("si1"), HaState::Standby)
            .unwrap();
        table.remove(&name("su1"), &name("si1"));
        assert!(!table.has_any(&name("su1")));
        assert_eq!(table.sus_of_si(&name("si1")), vec![name("su2")]);
    }

    #[test]
    fn counts_skip_unassigned_records() {
        let mut table = AssignmentTable::new();
        table
            .insert(name("su1"), name("si1"), HaState::Active)
            .unwrap();
        table
            .insert(name("su1"), name("si2"), HaState::Active)
            .unwrap();
        table.get_mut(&name("su1"), &name("si2")).unwrap().fsm = SusiFsm::Unassigned;
        assert_eq!(table.count_of_su(&name("su1"), HaState::Active), 1);
    }
}
