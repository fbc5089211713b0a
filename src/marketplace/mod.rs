use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ledger::{Principal, UnitId, Wei};

/// Marketplace the treasury buys from when a proposal passes.
pub trait Marketplace: Send + Sync {
    fn available(&self, unit: UnitId) -> bool;

    fn price(&self, unit: UnitId) -> Wei;

    /// Transfers `unit` to `buyer` against `payment`. Nothing changes when
    /// this returns an error.
    fn purchase(&self, buyer: Principal, unit: UnitId, payment: Wei)
        -> Result<(), MarketplaceError>;
}

impl<M: Marketplace + ?Sized> Marketplace for Arc<M> {
    fn available(&self, unit: UnitId) -> bool {
        (**self).available(unit)
    }

    fn price(&self, unit: UnitId) -> Wei {
        (**self).price(unit)
    }

    fn purchase(
        &self,
        buyer: Principal,
        unit: UnitId,
        payment: Wei,
    ) -> Result<(), MarketplaceError> {
        (**self).purchase(buyer, unit, payment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarketplaceError {
    #[error("unit {0} is already sold")]
    Sold(UnitId),
    #[error("unit costs {price:?}, {paid:?} offered")]
    WrongPayment { price: Wei, paid: Wei },
    #[error("marketplace proceeds overflow")]
    Overflow,
}

pub const DEFAULT_UNIT_PRICE: Wei = Wei::new(100_000_000_000_000_000); // 0.1 ether

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarketplaceState {
    pub price: Wei,
    pub owners: BTreeMap<UnitId, Principal>,
    pub proceeds: Wei,
}

impl Default for MarketplaceState {
    fn default() -> Self {
        Self {
            price: DEFAULT_UNIT_PRICE,
            owners: BTreeMap::new(),
            proceeds: Wei::ZERO,
        }
    }
}

/// Flat-price marketplace: every unit costs the same and can be bought once.
#[derive(Debug, Default)]
pub struct FakeMarketplace {
    state: RwLock<MarketplaceState>,
}

impl FakeMarketplace {
    pub fn new(price: Wei) -> Self {
        Self::from_state(MarketplaceState {
            price,
            ..MarketplaceState::default()
        })
    }

    pub fn from_state(state: MarketplaceState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn state(&self) -> MarketplaceState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn owner_of(&self, unit: UnitId) -> Option<Principal> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.owners.get(&unit).copied()
    }
}

impl Marketplace for FakeMarketplace {
    fn available(&self, unit: UnitId) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        !state.owners.contains_key(&unit)
    }

    fn price(&self, _unit: UnitId) -> Wei {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .price
    }

    fn purchase(
        &self,
        buyer: Principal,
        unit: UnitId,
        payment: Wei,
    ) -> Result<(), MarketplaceError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if payment != state.price {
            debug!(unit, ?payment, price = ?state.price, "purchase rejected: wrong payment");
            return Err(MarketplaceError::WrongPayment {
                price: state.price,
                paid: payment,
            });
        }
        if state.owners.contains_key(&unit) {
            debug!(unit, "purchase rejected: sold");
            return Err(MarketplaceError::Sold(unit));
        }
        state.proceeds = state
            .proceeds
            .checked_add(payment)
            .ok_or(MarketplaceError::Overflow)?;
        state.owners.insert(unit, buyer);
        info!(unit, %buyer, ?payment, "unit sold");
        Ok(())
    }
}
