//! Holding-weighted proposal voting over a custodial treasury.
//!
//! The engine owns a [`LedgerState`] and is its only writer. Each command
//! takes the write lock for its whole duration, turns the request into a
//! batch of [`LedgerMutation`]s, and commits that batch under a fresh
//! [`Receipt`]. A command that fails leaves the ledger exactly as it was.
//!
//! Membership and vote weight are read from the [`AssetRegistry`] at the
//! moment of each action; nothing is snapshotted at proposal creation.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::ledger::{
    LedgerError, LedgerMutation, LedgerSnapshot, LedgerState, Outcome, Principal, ProposalId,
    UnitId, Vote, Wei,
};
use crate::marketplace::{Marketplace, MarketplaceError};
use crate::receipt::{Operation, Receipt, ReceiptCore};
use crate::registry::AssetRegistry;

mod view;


pub use view::{ProposalStatus, ProposalView};

pub const DEFAULT_VOTING_PERIOD: u64 = 5 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GovernanceError {
    #[error("{caller} is not authorized for this action")]
    Unauthorized { caller: Principal },
    #[error("voting on proposal {proposal} closed at {deadline}")]
    VotingClosed { proposal: ProposalId, deadline: u64 },
    #[error("voting on proposal {proposal} is open until {deadline}")]
    VotingOpen { proposal: ProposalId, deadline: u64 },
    #[error("{voter} already voted on proposal {proposal}")]
    AlreadyVoted { proposal: ProposalId, voter: Principal },
    #[error("proposal {0} already executed")]
    AlreadyExecuted(ProposalId),
    #[error("unit {0} is not available for purchase")]
    UnitUnavailable(UnitId),
    #[error("treasury holds {available} wei, {needed} wei required")]
    InsufficientFunds { needed: Wei, available: Wei },
    #[error("proposal {0} not found")]
    NotFound(ProposalId),
    #[error("marketplace refused purchase: {0}")]
    PurchaseFailed(MarketplaceError),
    #[error("ledger rejected the batch: {0}")]
    Ledger(#[from] LedgerError),
}

impl GovernanceError {
    pub fn kind(&self) -> &'static str {
        match self {
            GovernanceError::Unauthorized { .. } => "Unauthorized",
            GovernanceError::VotingClosed { .. } => "VotingClosed",
            GovernanceError::VotingOpen { .. } => "VotingOpen",
            GovernanceError::AlreadyVoted { .. } => "AlreadyVoted",
            GovernanceError::AlreadyExecuted(_) => "AlreadyExecuted",
            GovernanceError::UnitUnavailable(_) => "UnitUnavailable",
            GovernanceError::InsufficientFunds { .. } => "InsufficientFunds",
            GovernanceError::NotFound(_) => "NotFound",
            GovernanceError::PurchaseFailed(_) => "PurchaseFailed",
            GovernanceError::Ledger(_) => "Ledger",
        }
    }
}

pub type Result<T, E = GovernanceError> = std::result::Result<T, E>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSettings {
    /// Account the engine buys with; marketplace purchases are made out to it.
    pub address: Principal,
    pub owner: Principal,
    /// Seconds between proposal creation and its deadline.
    pub voting_period: u64,
}

impl EngineSettings {
    pub fn new(address: Principal, owner: Principal) -> Self {
        Self {
            address,
            owner,
            voting_period: DEFAULT_VOTING_PERIOD,
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    ledger: LedgerState,
    last_receipt: Option<Receipt>,
}

pub struct GovernanceEngine<R, M, C> {
    settings: EngineSettings,
    registry: R,
    marketplace: M,
    clock: C,
    state: RwLock<EngineState>,
}

impl<R, M, C> GovernanceEngine<R, M, C>
where
    R: AssetRegistry,
    M: Marketplace,
    C: Clock,
{
    pub fn new(settings: EngineSettings, registry: R, marketplace: M, clock: C) -> Self {
        Self::restore(settings, registry, marketplace, clock, LedgerState::new())
    }

    /// Rebuilds an engine around a ledger recovered from a snapshot.
    pub fn restore(
        settings: EngineSettings,
        registry: R,
        marketplace: M,
        clock: C,
        ledger: LedgerState,
    ) -> Self {
        Self {
            settings,
            registry,
            marketplace,
            clock,
            state: RwLock::new(EngineState {
                ledger,
                last_receipt: None,
            }),
        }
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    /// Deposits `amount` into the treasury. Returns the new balance.
    pub fn fund(&self, from: Principal, amount: Wei) -> Result<Wei> {
        let mut state = self.write();
        let now = self.clock.now();
        let operation = Operation::Fund { from, amount };
        let mutations = vec![LedgerMutation::FundTreasury { from, amount }];
        let outcome = self.commit(&mut state, operation, mutations, now);
        self.report(outcome)?;
        let balance = state.ledger.treasury();
        info!(%from, ?amount, ?balance, "treasury funded");
        Ok(balance)
    }

    pub fn create_proposal(&self, caller: Principal, unit: UnitId) -> Result<ProposalId> {
        let mut state = self.write();
        let outcome = self.create_locked(&mut state, caller, unit);
        self.report(outcome)
    }

    pub fn vote_on_proposal(
        &self,
        caller: Principal,
        proposal: ProposalId,
        vote: Vote,
    ) -> Result<ProposalView> {
        let mut state = self.write();
        let outcome = self.vote_locked(&mut state, caller, proposal, vote);
        self.report(outcome)
    }

    /// Closes a proposal whose deadline has passed. Anyone may call it.
    ///
    /// When yes outweighs no the target unit is bought at the marketplace's
    /// current price; the treasury debit and the `executed` flag land in one
    /// ledger batch, committed only after the purchase succeeds. Otherwise
    /// the proposal is closed as rejected and nothing is bought.
    pub fn execute_proposal(&self, caller: Principal, proposal: ProposalId) -> Result<ProposalView> {
        let mut state = self.write();
        let outcome = self.execute_locked(&mut state, caller, proposal);
        self.report(outcome)
    }

    /// Owner-only. Pays `amount` (or the whole treasury when `None`) out to
    /// the owner and returns the amount paid.
    pub fn withdraw(&self, caller: Principal, amount: Option<Wei>) -> Result<Wei> {
        let mut state = self.write();
        let outcome = self.withdraw_locked(&mut state, caller, amount);
        self.report(outcome)
    }

    fn create_locked(
        &self,
        state: &mut EngineState,
        caller: Principal,
        unit: UnitId,
    ) -> Result<ProposalId> {
        if self.registry.balance_of(&caller) == 0 {
            return Err(GovernanceError::Unauthorized { caller });
        }
        if !self.marketplace.available(unit) {
            return Err(GovernanceError::UnitUnavailable(unit));
        }
        let now = self.clock.now();
        let id = state.ledger.proposal_count();
        let deadline = now.saturating_add(self.settings.voting_period);
        let operation = Operation::CreateProposal { caller, unit };
        let mutations = vec![LedgerMutation::OpenProposal {
            id,
            target_unit: unit,
            deadline,
        }];
        self.commit(state, operation, mutations, now)?;
        info!(proposal = id, unit, %caller, deadline, "proposal created");
        Ok(id)
    }

    fn vote_locked(
        &self,
        state: &mut EngineState,
        caller: Principal,
        id: ProposalId,
        vote: Vote,
    ) -> Result<ProposalView> {
        let now = self.clock.now();
        let proposal = state
            .ledger
            .proposal(id)
            .ok_or(GovernanceError::NotFound(id))?;
        if now >= proposal.deadline {
            return Err(GovernanceError::VotingClosed {
                proposal: id,
                deadline: proposal.deadline,
            });
        }
        let weight = self.registry.balance_of(&caller);
        if weight == 0 {
            return Err(GovernanceError::Unauthorized { caller });
        }
        if proposal.has_voted(&caller) {
            return Err(GovernanceError::AlreadyVoted {
                proposal: id,
                voter: caller,
            });
        }
        let operation = Operation::Vote {
            caller,
            proposal: id,
            vote,
        };
        let mutations = vec![LedgerMutation::CastVote {
            proposal: id,
            voter: caller,
            vote,
            weight,
        }];
        self.commit(state, operation, mutations, now)?;
        let view = self.view_locked(state, id, now)?;
        info!(
            proposal = id,
            %caller,
            %vote,
            weight,
            yes = view.proposal.yes_votes,
            no = view.proposal.no_votes,
            "vote cast"
        );
        Ok(view)
    }

    fn execute_locked(
        &self,
        state: &mut EngineState,
        caller: Principal,
        id: ProposalId,
    ) -> Result<ProposalView> {
        let now = self.clock.now();
        let proposal = state
            .ledger
            .proposal(id)
            .ok_or(GovernanceError::NotFound(id))?;
        if now < proposal.deadline {
            return Err(GovernanceError::VotingOpen {
                proposal: id,
                deadline: proposal.deadline,
            });
        }
        if proposal.executed {
            return Err(GovernanceError::AlreadyExecuted(id));
        }
        let unit = proposal.target_unit;
        let operation = Operation::Execute {
            caller,
            proposal: id,
        };

        if proposal.yes_votes > proposal.no_votes {
            let price = self.marketplace.price(unit);
            let available = state.ledger.treasury();
            if available < price {
                return Err(GovernanceError::InsufficientFunds {
                    needed: price,
                    available,
                });
            }
            let mutations = vec![LedgerMutation::SettleProposal {
                proposal: id,
                outcome: Outcome::Accepted,
                purchase_price: Some(price),
            }];
            let (receipt, staged) = self.stage(state, operation, mutations, now)?;
            self.marketplace
                .purchase(self.settings.address, unit, price)
                .map_err(|err| match err {
                    MarketplaceError::Sold(unit) => GovernanceError::UnitUnavailable(unit),
                    other => GovernanceError::PurchaseFailed(other),
                })?;
            state.ledger.commit(staged);
            state.last_receipt = Some(receipt);
            info!(proposal = id, unit, ?price, %caller, "proposal accepted, unit purchased");
        } else {
            let mutations = vec![LedgerMutation::SettleProposal {
                proposal: id,
                outcome: Outcome::Rejected,
                purchase_price: None,
            }];
            self.commit(state, operation, mutations, now)?;
            info!(proposal = id, %caller, "proposal rejected");
        }
        self.view_locked(state, id, now)
    }

    fn withdraw_locked(
        &self,
        state: &mut EngineState,
        caller: Principal,
        amount: Option<Wei>,
    ) -> Result<Wei> {
        if caller != self.settings.owner {
            return Err(GovernanceError::Unauthorized { caller });
        }
        let now = self.clock.now();
        let available = state.ledger.treasury();
        let amount = amount.unwrap_or(available);
        if amount > available {
            return Err(GovernanceError::InsufficientFunds {
                needed: amount,
                available,
            });
        }
        let operation = Operation::Withdraw { caller, amount };
        let mutations = vec![LedgerMutation::PayOut {
            to: self.settings.owner,
            amount,
        }];
        self.commit(state, operation, mutations, now)?;
        info!(
            owner = %self.settings.owner,
            ?amount,
            remaining = ?state.ledger.treasury(),
            "treasury withdrawn"
        );
        Ok(amount)
    }

    /// Seals a receipt for the batch and applies it to a copy of the ledger.
    fn stage(
        &self,
        state: &EngineState,
        operation: Operation,
        mutations: Vec<LedgerMutation>,
        now: u64,
    ) -> Result<(Receipt, LedgerState)> {
        let receipt = ReceiptCore {
            height: state.ledger.height() + 1,
            timestamp: now,
            previous: state.ledger.meta.previous_receipt,
            operation,
            mutations,
        }
        .seal();
        let staged = state
            .ledger
            .stage(&receipt.core.mutations, receipt.id, now)?;
        debug!(
            operation = receipt.core.operation.name(),
            height = receipt.core.height,
            receipt = %receipt.id,
            "batch staged"
        );
        Ok((receipt, staged))
    }

    fn commit(
        &self,
        state: &mut EngineState,
        operation: Operation,
        mutations: Vec<LedgerMutation>,
        now: u64,
    ) -> Result<()> {
        let (receipt, staged) = self.stage(state, operation, mutations, now)?;
        state.ledger.commit(staged);
        state.last_receipt = Some(receipt);
        Ok(())
    }

    /// Rejections go back to the caller, who owns reporting them.
    fn report<T>(&self, outcome: Result<T>) -> Result<T> {
        outcome.inspect_err(|err| debug!(kind = err.kind(), error = %err, "operation rejected"))
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub fn proposal(&self, id: ProposalId) -> Result<ProposalView> {
        let state = self.read();
        self.view_locked(&state, id, self.clock.now())
    }

    /// Lazily walks proposals `0..count`, reading each one on demand.
    /// The count is fixed when the iterator is created.
    pub fn proposals(&self) -> impl Iterator<Item = ProposalView> + '_ {
        (0..self.proposal_count()).filter_map(move |id| self.proposal(id).ok())
    }

    pub fn proposal_count(&self) -> u64 {
        self.read().ledger.proposal_count()
    }

    pub fn treasury_balance(&self) -> Wei {
        self.read().ledger.treasury()
    }

    /// Total paid out of the treasury to `principal` so far.
    pub fn paid_out(&self, principal: &Principal) -> Wei {
        self.read().ledger.account(principal)
    }

    pub fn owner(&self) -> Principal {
        self.settings.owner
    }

    pub fn is_owner(&self, principal: &Principal) -> bool {
        *principal == self.settings.owner
    }

    pub fn address(&self) -> Principal {
        self.settings.address
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Current holding of `principal`, i.e. the weight its vote would carry now.
    pub fn holdings(&self, principal: &Principal) -> u64 {
        self.registry.balance_of(principal)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.read().ledger.snapshot()
    }

    pub fn last_receipt(&self) -> Option<Receipt> {
        self.read().last_receipt.clone()
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn marketplace(&self) -> &M {
        &self.marketplace
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    fn view_locked(&self, state: &EngineState, id: ProposalId, now: u64) -> Result<ProposalView> {
        state
            .ledger
            .proposal(id)
            .cloned()
            .map(|proposal| ProposalView::new(proposal, now))
            .ok_or(GovernanceError::NotFound(id))
    }

    fn read(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
