use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ledger::{Hash256, LedgerMutation, Outcome, Principal, ProposalId, UnitId, Vote, Wei};

/// The command that produced a batch of ledger mutations.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Fund {
        from: Principal,
        amount: Wei,
    },
    CreateProposal {
        caller: Principal,
        unit: UnitId,
    },
    Vote {
        caller: Principal,
        proposal: ProposalId,
        vote: Vote,
    },
    Execute {
        caller: Principal,
        proposal: ProposalId,
    },
    Withdraw {
        caller: Principal,
        amount: Wei,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Fund { .. } => "fund",
            Operation::CreateProposal { .. } => "create_proposal",
            Operation::Vote { .. } => "vote",
            Operation::Execute { .. } => "execute",
            Operation::Withdraw { .. } => "withdraw",
        }
    }

    fn commit(&self, hasher: &mut Sha256) {
        hasher.update(self.name().as_bytes());
        match self {
            Operation::Fund { from, amount } => {
                hasher.update(from.as_bytes());
                hasher.update(amount.to_le_bytes());
            }
            Operation::CreateProposal { caller, unit } => {
                hasher.update(caller.as_bytes());
                hasher.update(unit.to_le_bytes());
            }
            Operation::Vote {
                caller,
                proposal,
                vote,
            } => {
                hasher.update(caller.as_bytes());
                hasher.update(proposal.to_le_bytes());
                hasher.update([vote.index()]);
            }
            Operation::Execute { caller, proposal } => {
                hasher.update(caller.as_bytes());
                hasher.update(proposal.to_le_bytes());
            }
            Operation::Withdraw { caller, amount } => {
                hasher.update(caller.as_bytes());
                hasher.update(amount.to_le_bytes());
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiptCore {
    pub height: u64,
    pub timestamp: u64,
    pub previous: Option<Hash256>,
    pub operation: Operation,
    pub mutations: Vec<LedgerMutation>,
}

impl ReceiptCore {
    pub fn digest(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(b"dao-receipt");
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        match &self.previous {
            Some(prev) => hasher.update(prev.0),
            None => hasher.update([0u8; 32]),
        }
        self.operation.commit(&mut hasher);
        hasher.update((self.mutations.len() as u64).to_le_bytes());
        for mutation in &self.mutations {
            commit_mutation(mutation, &mut hasher);
        }
        Hash256(hasher.finalize().into())
    }

    pub fn seal(self) -> Receipt {
        Receipt {
            id: self.digest(),
            core: self,
        }
    }
}

/// Confirmation handed back for every committed operation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub id: Hash256,
    pub core: ReceiptCore,
}

impl Receipt {
    pub fn verify(&self) -> bool {
        self.core.digest() == self.id
    }
}

fn commit_mutation(mutation: &LedgerMutation, hasher: &mut Sha256) {
    match mutation {
        LedgerMutation::FundTreasury { from, amount } => {
            hasher.update(b"fund");
            hasher.update(from.as_bytes());
            hasher.update(amount.to_le_bytes());
        }
        LedgerMutation::OpenProposal {
            id,
            target_unit,
            deadline,
        } => {
            hasher.update(b"open");
            hasher.update(id.to_le_bytes());
            hasher.update(target_unit.to_le_bytes());
            hasher.update(deadline.to_le_bytes());
        }
        LedgerMutation::CastVote {
            proposal,
            voter,
            vote,
            weight,
        } => {
            hasher.update(b"vote");
            hasher.update(proposal.to_le_bytes());
            hasher.update(voter.as_bytes());
            hasher.update([vote.index()]);
            hasher.update(weight.to_le_bytes());
        }
        LedgerMutation::SettleProposal {
            proposal,
            outcome,
            purchase_price,
        } => {
            hasher.update(b"settle");
            hasher.update(proposal.to_le_bytes());
            hasher.update([match outcome {
                Outcome::Accepted => 1u8,
                Outcome::Rejected => 2u8,
            }]);
            hasher.update(purchase_price.unwrap_or_default().to_le_bytes());
        }
        LedgerMutation::PayOut { to, amount } => {
            hasher.update(b"payout");
            hasher.update(to.as_bytes());
            hasher.update(amount.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(previous: Option<Hash256>, vote: Vote) -> ReceiptCore {
        let caller = Principal::from_bytes([7u8; 20]);
        ReceiptCore {
            height: 3,
            timestamp: 1_700_000_000,
            previous,
            operation: Operation::Vote {
                caller,
                proposal: 0,
                vote,
            },
            mutations: vec![LedgerMutation::CastVote {
                proposal: 0,
                voter: caller,
                vote,
                weight: 2,
            }],
        }
    }

    #[test]
    fn digest_commits_to_every_field() {
        let base = core(None, Vote::Yes).digest();
        assert_eq!(base, core(None, Vote::Yes).digest());
        assert_ne!(base, core(None, Vote::No).digest());
        assert_ne!(base, core(Some(Hash256([1u8; 32])), Vote::Yes).digest());
    }

    #[test]
    fn sealed_receipt_verifies_until_modified() {
        let mut receipt = core(None, Vote::Yes).seal();
        assert!(receipt.verify());
        receipt.core.timestamp += 1;
        assert!(!receipt.verify());
    }
}
