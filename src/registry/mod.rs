use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ledger::{Principal, UnitId};

/// Read side of the governed asset (the membership NFT contract).
pub trait AssetRegistry: Send + Sync {
    /// Number of units `principal` currently holds. This is both the
    /// membership gate and the vote weight.
    fn balance_of(&self, principal: &Principal) -> u64;

    fn owner_of(&self, unit: UnitId) -> Option<Principal>;
}

impl<R: AssetRegistry + ?Sized> AssetRegistry for Arc<R> {
    fn balance_of(&self, principal: &Principal) -> u64 {
        (**self).balance_of(principal)
    }

    fn owner_of(&self, unit: UnitId) -> Option<Principal> {
        (**self).owner_of(unit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unit {0} has not been minted")]
    UnknownUnit(UnitId),
    #[error("{caller} does not own unit {unit}")]
    NotOwner { unit: UnitId, caller: Principal },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RegistryState {
    pub next_unit: UnitId,
    pub owners: BTreeMap<UnitId, Principal>,
}

/// Registry kept in process memory; units are minted with sequential ids.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    state: RwLock<RegistryState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: RegistryState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn state(&self) -> RegistryState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn mint(&self, to: Principal) -> UnitId {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let unit = state.next_unit;
        state.next_unit += 1;
        state.owners.insert(unit, to);
        debug!(unit, %to, "minted unit");
        unit
    }

    pub fn transfer(
        &self,
        from: &Principal,
        to: Principal,
        unit: UnitId,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let owner = state
            .owners
            .get_mut(&unit)
            .ok_or(RegistryError::UnknownUnit(unit))?;
        if owner != from {
            return Err(RegistryError::NotOwner {
                unit,
                caller: *from,
            });
        }
        *owner = to;
        debug!(unit, %from, %to, "transferred unit");
        Ok(())
    }

    pub fn units_of(&self, principal: &Principal) -> Vec<UnitId> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .owners
            .iter()
            .filter(|(_, owner)| *owner == principal)
            .map(|(unit, _)| *unit)
            .collect()
    }
}

impl AssetRegistry for InMemoryRegistry {
    fn balance_of(&self, principal: &Principal) -> u64 {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.owners.values().filter(|o| *o == principal).count() as u64
    }

    fn owner_of(&self, unit: UnitId) -> Option<Principal> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.owners.get(&unit).copied()
    }
}
