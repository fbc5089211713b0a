//! Holding-weighted DAO governance over a serialized treasury ledger.
//!
//! * [`governance`] — the engine: proposals, votes, execution, withdrawal.
//! * [`ledger`] — the engine's single mutable store and its typed values.
//! * [`receipt`] — digests chaining every committed batch.
//! * [`registry`] / [`marketplace`] — collaborators the engine consults,
//!   with in-memory implementations.
//! * [`deploy`] / [`config`] — bootstrap of a deployment and its settings.

pub mod clock;
pub mod config;
pub mod deploy;
pub mod governance;
pub mod ledger;
pub mod marketplace;
pub mod receipt;
pub mod registry;

pub use governance::{GovernanceEngine, GovernanceError, ProposalStatus, ProposalView};
pub use ledger::{Principal, ProposalId, UnitId, Vote, Wei};
