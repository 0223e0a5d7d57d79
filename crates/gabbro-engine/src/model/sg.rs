//! Service group state.

use gabbro_types::{AdminState, EntityName, Invocation, RedundancyModel, SgFsmState};
use serde::{Deserialize, Serialize};

/// In-flight redistribution: one instance moving from the most-loaded unit
/// to the least-loaded one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redistribution {
    pub max_su: EntityName,
    pub min_su: EntityName,
    pub si: EntityName,
}

/// Deferred capacity changes, applied at the next STABLE entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SgCapacityUpdate {
    pub pref_num_active_sus: Option<u32>,
    pub pref_num_standby_sus: Option<u32>,
    pub max_active_sis_per_su: Option<u32>,
    pub max_standby_sis_per_su: Option<u32>,
    pub auto_adjust: Option<bool>,
}

/// One service group: the scope of a redundancy model and its FSM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub name: EntityName,
    pub model: RedundancyModel,

    pub admin_state: AdminState,
    pub pref_num_active_sus: u32,
    pub pref_num_standby_sus: u32,
    /// Group-wide per-unit caps; 0 means unlimited.
    pub max_active_sis_per_su: u32,
    pub max_standby_sis_per_su: u32,
    pub auto_adjust: bool,
    pub equal_ranked_sus: bool,

    pub fsm_state: SgFsmState,

    /// Units with outstanding orders, in emission order, deduplicated.
    pub su_oper_list: Vec<EntityName>,

    /// The instance currently under an instance-scoped admin operation.
    pub admin_si: Option<EntityName>,

    /// In-flight redistribution, if any.
    pub redistribution: Option<Redistribution>,

    /// Member units, kept in rank order (ties by name).
    pub sus: Vec<EntityName>,
    /// Member instances, kept in rank order (ties by name).
    pub sis: Vec<EntityName>,

    /// Outstanding group-scoped admin invocation, if any.
    pub pending_invocation: Option<Invocation>,

    /// Capacity changes waiting for the next STABLE entry.
    pub pending_update: Option<SgCapacityUpdate>,

    /// False when configuration validation rejected this group; a
    /// deactivated group processes no events (implicit lock).
    pub activated: bool,
}

impl ServiceGroup {
    /// Appends a unit to the operation list unless already present.
    /// Returns true if the list changed.
    pub fn oper_list_add(&mut self, su: &EntityName) -> bool {
        if self.su_oper_list.contains(su) {
            return false;
        }
        self.su_oper_list.push(su.clone());
        true
    }

    /// Removes a unit from the operation list if present.
    /// Returns true if the list changed.
    pub fn oper_list_del(&mut self, su: &EntityName) -> bool {
        let before = self.su_oper_list.len();
        self.su_oper_list.retain(|name| name != su);
        self.su_oper_list.len() != before
    }

    pub fn in_oper_list(&self, su: &EntityName) -> bool {
        self.su_oper_list.contains(su)
    }

    /// The single unit under operation, when exactly one is listed.
    pub fn sole_oper_su(&self) -> Option<&EntityName> {
        match self.su_oper_list.as_slice() {
            [su] => Some(su),
            _ => None,
        }
    }

    /// Applies any deferred capacity update.
    pub fn apply_pending_update(&mut self) {
        let Some(update) = self.pending_update.take() else {
            return;
        };
        if let Some(v) = update.pref_num_active_sus {
            self.pref_num_active_sus = v;
        }
        if let Some(v) = update.pref_num_standby_sus {
            self.pref_num_standby_sus = v;
        }
        if let Some(v) = update.max_active_sis_per_su {
            self.max_active_sis_per_su = v;
        }
        if let Some(v) = update.max_standby_sis_per_su {
            self.max_standby_sis_per_su = v;
        }
        if let Some(v) = update.auto_adjust {
            self.auto_adjust = v;
        }
    }
}
