use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ledger::{Outcome, Proposal};

/// Lifecycle position of a proposal at a given instant.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    /// Before the deadline; accepting votes.
    Open,
    /// Deadline passed, waiting for someone to execute it.
    ClosedPending,
    ExecutedAccepted,
    ExecutedRejected,
}

impl ProposalStatus {
    pub fn of(proposal: &Proposal, now: u64) -> Self {
        match (proposal.executed, proposal.outcome) {
            (true, Some(Outcome::Accepted)) => ProposalStatus::ExecutedAccepted,
            (true, _) => ProposalStatus::ExecutedRejected,
            (false, _) if now < proposal.deadline => ProposalStatus::Open,
            (false, _) => ProposalStatus::ClosedPending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProposalStatus::ExecutedAccepted | ProposalStatus::ExecutedRejected
        )
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProposalStatus::Open => "open",
            ProposalStatus::ClosedPending => "closed, pending execution",
            ProposalStatus::ExecutedAccepted => "executed (accepted)",
            ProposalStatus::ExecutedRejected => "executed (rejected)",
        })
    }
}

/// A proposal as read at one instant, with its derived status.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposalView {
    pub proposal: Proposal,
    pub status: ProposalStatus,
}

impl ProposalView {
    pub fn new(proposal: Proposal, now: u64) -> Self {
        let status = ProposalStatus::of(&proposal, now);
        Self { proposal, status }
    }

    /// What execution would do with the current tallies. Ties reject.
    pub fn leading_outcome(&self) -> Outcome {
        if self.proposal.yes_votes > self.proposal.no_votes {
            Outcome::Accepted
        } else {
            Outcome::Rejected
        }
    }

    pub fn seconds_left(&self, now: u64) -> u64 {
        self.proposal.deadline.saturating_sub(now)
    }
}
