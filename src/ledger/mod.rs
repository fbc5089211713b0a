use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

mod types;

pub use types::{ParseError, Principal, ProposalId, UnitId, Vote, Wei, WEI_PER_ETHER};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("treasury holds {available:?}, {needed:?} required")]
    InsufficientTreasury { needed: Wei, available: Wei },
    #[error("amount overflow")]
    Overflow,
    #[error("unknown proposal {0}")]
    UnknownProposal(ProposalId),
    #[error("proposal id {got} out of sequence, next is {expected}")]
    ProposalOutOfSequence { expected: ProposalId, got: ProposalId },
    #[error("{voter} already voted on proposal {proposal}")]
    DuplicateVote { proposal: ProposalId, voter: Principal },
    #[error("proposal {0} already settled")]
    AlreadySettled(ProposalId),
    #[error("duplicate receipt detected")]
    DuplicateReceipt,
    #[error("snapshot state root does not match its contents")]
    StateRootMismatch,
}

/// 32-byte SHA-256 output, hex encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash256(pub [u8; 32]);

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash256({self})")
    }
}

impl Serialize for Hash256 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let encoded = String::deserialize(deserializer)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&encoded, &mut out).map_err(D::Error::custom)?;
        Ok(Self(out))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Proposal {
    pub id: ProposalId,
    pub target_unit: UnitId,
    pub deadline: u64,
    pub yes_votes: u64,
    pub no_votes: u64,
    pub executed: bool,
    pub outcome: Option<Outcome>,
    pub voters: BTreeSet<Principal>,
}

impl Proposal {
    pub fn has_voted(&self, principal: &Principal) -> bool {
        self.voters.contains(principal)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub height: u64,
    pub timestamp: u64,
    pub previous_receipt: Option<Hash256>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub treasury: Wei,
    pub accounts: BTreeMap<Principal, Wei>,
    pub proposals: Vec<Proposal>,
    pub events: Vec<LedgerEvent>,
    pub receipts: BTreeSet<Hash256>,
    pub state_root: Hash256,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    TreasuryFunded {
        from: Principal,
        amount: Wei,
    },
    ProposalOpened {
        proposal: ProposalId,
        target_unit: UnitId,
        deadline: u64,
    },
    VoteCast {
        proposal: ProposalId,
        voter: Principal,
        vote: Vote,
        weight: u64,
    },
    ProposalSettled {
        proposal: ProposalId,
        outcome: Outcome,
        spent: Wei,
    },
    PaidOut {
        to: Principal,
        amount: Wei,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerMutation {
    FundTreasury {
        from: Principal,
        amount: Wei,
    },
    OpenProposal {
        id: ProposalId,
        target_unit: UnitId,
        deadline: u64,
    },
    CastVote {
        proposal: ProposalId,
        voter: Principal,
        vote: Vote,
        weight: u64,
    },
    SettleProposal {
        proposal: ProposalId,
        outcome: Outcome,
        purchase_price: Option<Wei>,
    },
    PayOut {
        to: Principal,
        amount: Wei,
    },
}

/// The engine's only mutable store. All writes go through
/// [`LedgerState::apply_mutations`], which either applies a whole batch or
/// leaves the state untouched.
#[derive(Clone, Debug, Default)]
pub struct LedgerState {
    pub meta: SnapshotMetadata,
    treasury: Wei,
    accounts: BTreeMap<Principal, Wei>,
    proposals: Vec<Proposal>,
    events: Vec<LedgerEvent>,
    applied_receipts: BTreeSet<Hash256>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn treasury(&self) -> Wei {
        self.treasury
    }

    pub fn account(&self, principal: &Principal) -> Wei {
        self.accounts.get(principal).copied().unwrap_or_default()
    }

    pub fn proposal(&self, id: ProposalId) -> Option<&Proposal> {
        usize::try_from(id).ok().and_then(|idx| self.proposals.get(idx))
    }

    pub fn proposal_count(&self) -> u64 {
        self.proposals.len() as u64
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn height(&self) -> u64 {
        self.meta.height
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            treasury: self.treasury,
            accounts: self.accounts.clone(),
            proposals: self.proposals.clone(),
            events: self.events.clone(),
            receipts: self.applied_receipts.clone(),
            state_root: compute_state_root(self),
        }
    }

    pub fn state_root(&self) -> Hash256 {
        compute_state_root(self)
    }

    /// Rebuilds a ledger from a snapshot, refusing one whose contents do
    /// not hash to its recorded state root.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        let ledger = Self {
            meta: snapshot.meta,
            treasury: snapshot.treasury,
            accounts: snapshot.accounts,
            proposals: snapshot.proposals,
            events: snapshot.events,
            applied_receipts: snapshot.receipts,
        };
        if compute_state_root(&ledger) != snapshot.state_root {
            return Err(LedgerError::StateRootMismatch);
        }
        Ok(ledger)
    }

    /// Applies the batch to a copy of this ledger and returns the copy.
    /// `self` is never touched, so a caller can run further checks before
    /// committing the result with [`LedgerState::commit`].
    pub fn stage(
        &self,
        mutations: &[LedgerMutation],
        receipt_id: Hash256,
        timestamp: u64,
    ) -> Result<LedgerState, LedgerError> {
        if self.applied_receipts.contains(&receipt_id) {
            return Err(LedgerError::DuplicateReceipt);
        }

        let mut staged = self.clone();
        for mutation in mutations {
            staged.apply_one(mutation)?;
        }

        staged.meta.height += 1;
        staged.meta.timestamp = timestamp;
        staged.meta.previous_receipt = Some(receipt_id);
        staged.applied_receipts.insert(receipt_id);
        Ok(staged)
    }

    pub fn commit(&mut self, staged: LedgerState) {
        *self = staged;
    }

    pub fn apply_mutations(
        &mut self,
        mutations: &[LedgerMutation],
        receipt_id: Hash256,
        timestamp: u64,
    ) -> Result<(), LedgerError> {
        let staged = self.stage(mutations, receipt_id, timestamp)?;
        self.commit(staged);
        Ok(())
    }

    fn apply_one(&mut self, mutation: &LedgerMutation) -> Result<(), LedgerError> {
        match mutation {
            LedgerMutation::FundTreasury { from, amount } => {
                self.treasury = self
                    .treasury
                    .checked_add(*amount)
                    .ok_or(LedgerError::Overflow)?;
                self.events.push(LedgerEvent::TreasuryFunded {
                    from: *from,
                    amount: *amount,
                });
            }
            LedgerMutation::OpenProposal {
                id,
                target_unit,
                deadline,
            } => {
                let expected = self.proposal_count();
                if *id != expected {
                    return Err(LedgerError::ProposalOutOfSequence { expected, got: *id });
                }
                self.proposals.push(Proposal {
                    id: *id,
                    target_unit: *target_unit,
                    deadline: *deadline,
                    yes_votes: 0,
                    no_votes: 0,
                    executed: false,
                    outcome: None,
                    voters: BTreeSet::new(),
                });
                self.events.push(LedgerEvent::ProposalOpened {
                    proposal: *id,
                    target_unit: *target_unit,
                    deadline: *deadline,
                });
            }
            LedgerMutation::CastVote {
                proposal,
                voter,
                vote,
                weight,
            } => {
                let record = self.proposal_mut(*proposal)?;
                if record.executed {
                    return Err(LedgerError::AlreadySettled(*proposal));
                }
                if !record.voters.insert(*voter) {
                    return Err(LedgerError::DuplicateVote {
                        proposal: *proposal,
                        voter: *voter,
                    });
                }
                let tally = match vote {
                    Vote::Yes => &mut record.yes_votes,
                    Vote::No => &mut record.no_votes,
                };
                *tally = tally.checked_add(*weight).ok_or(LedgerError::Overflow)?;
                self.events.push(LedgerEvent::VoteCast {
                    proposal: *proposal,
                    voter: *voter,
                    vote: *vote,
                    weight: *weight,
                });
            }
            LedgerMutation::SettleProposal {
                proposal,
                outcome,
                purchase_price,
            } => {
                if self.proposal_mut(*proposal)?.executed {
                    return Err(LedgerError::AlreadySettled(*proposal));
                }
                let spent = purchase_price.unwrap_or_default();
                self.debit_treasury(spent)?;
                let record = self.proposal_mut(*proposal)?;
                record.executed = true;
                record.outcome = Some(*outcome);
                self.events.push(LedgerEvent::ProposalSettled {
                    proposal: *proposal,
                    outcome: *outcome,
                    spent,
                });
            }
            LedgerMutation::PayOut { to, amount } => {
                self.debit_treasury(*amount)?;
                let balance = self.accounts.entry(*to).or_default();
                *balance = balance.checked_add(*amount).ok_or(LedgerError::Overflow)?;
                self.events.push(LedgerEvent::PaidOut {
                    to: *to,
                    amount: *amount,
                });
            }
        }
        Ok(())
    }

    fn proposal_mut(&mut self, id: ProposalId) -> Result<&mut Proposal, LedgerError> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| self.proposals.get_mut(idx))
            .ok_or(LedgerError::UnknownProposal(id))
    }

    fn debit_treasury(&mut self, amount: Wei) -> Result<(), LedgerError> {
        self.treasury = self
            .treasury
            .checked_sub(amount)
            .ok_or(LedgerError::InsufficientTreasury {
                needed: amount,
                available: self.treasury,
            })?;
        Ok(())
    }
}

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Hashes one tagged leaf. The prefix keeps leaves and inner nodes from
/// ever colliding.
fn leaf(tag: &[u8], fill: impl FnOnce(&mut Sha256)) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(tag);
    fill(&mut hasher);
    hasher.finalize().into()
}

fn event_leaf(index: usize, event: &LedgerEvent) -> [u8; 32] {
    let position = (index as u64).to_le_bytes();
    match event {
        LedgerEvent::TreasuryFunded { from, amount } => leaf(b"ev:funded", |h| {
            h.update(position);
            h.update(from.as_bytes());
            h.update(amount.to_le_bytes());
        }),
        LedgerEvent::ProposalOpened {
            proposal,
            target_unit,
            deadline,
        } => leaf(b"ev:opened", |h| {
            h.update(position);
            h.update(proposal.to_le_bytes());
            h.update(target_unit.to_le_bytes());
            h.update(deadline.to_le_bytes());
        }),
        LedgerEvent::VoteCast {
            proposal,
            voter,
            vote,
            weight,
        } => leaf(b"ev:vote", |h| {
            h.update(position);
            h.update(proposal.to_le_bytes());
            h.update(voter.as_bytes());
            h.update([vote.index()]);
            h.update(weight.to_le_bytes());
        }),
        LedgerEvent::ProposalSettled {
            proposal,
            outcome,
            spent,
        } => leaf(b"ev:settled", |h| {
            h.update(position);
            h.update(proposal.to_le_bytes());
            h.update([outcome_byte(Some(*outcome))]);
            h.update(spent.to_le_bytes());
        }),
        LedgerEvent::PaidOut { to, amount } => leaf(b"ev:paid", |h| {
            h.update(position);
            h.update(to.as_bytes());
            h.update(amount.to_le_bytes());
        }),
    }
}

fn outcome_byte(outcome: Option<Outcome>) -> u8 {
    match outcome {
        None => 0,
        Some(Outcome::Accepted) => 1,
        Some(Outcome::Rejected) => 2,
    }
}

/// Root over everything a snapshot carries: metadata, balances, proposals
/// with their voter sets, the event log and the applied receipt ids.
fn compute_state_root(ledger: &LedgerState) -> Hash256 {
    let meta = &ledger.meta;
    let mut leaves = vec![
        leaf(b"meta", |h| {
            h.update(meta.height.to_le_bytes());
            h.update(meta.timestamp.to_le_bytes());
            match meta.previous_receipt {
                Some(previous) => {
                    h.update([1u8]);
                    h.update(previous.0);
                }
                None => h.update([0u8]),
            }
        }),
        leaf(b"treasury", |h| h.update(ledger.treasury.to_le_bytes())),
    ];
    leaves.extend(ledger.accounts.iter().map(|(account, balance)| {
        leaf(b"acct", |h| {
            h.update(account.as_bytes());
            h.update(balance.to_le_bytes());
        })
    }));
    leaves.extend(ledger.proposals.iter().map(|proposal| {
        leaf(b"proposal", |h| {
            h.update(proposal.id.to_le_bytes());
            h.update(proposal.target_unit.to_le_bytes());
            h.update(proposal.deadline.to_le_bytes());
            h.update(proposal.yes_votes.to_le_bytes());
            h.update(proposal.no_votes.to_le_bytes());
            h.update([proposal.executed as u8, outcome_byte(proposal.outcome)]);
            h.update((proposal.voters.len() as u64).to_le_bytes());
            for voter in &proposal.voters {
                h.update(voter.as_bytes());
            }
        })
    }));
    leaves.extend(
        ledger
            .events
            .iter()
            .enumerate()
            .map(|(index, event)| event_leaf(index, event)),
    );
    leaves.extend(
        ledger
            .applied_receipts
            .iter()
            .map(|id| leaf(b"receipt", |h| h.update(id.0))),
    );
    Hash256(merkle_root(leaves))
}

/// Pairs nodes level by level; an odd node is carried up unchanged.
fn merkle_root(mut level: Vec<[u8; 32]>) -> [u8; 32] {
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut hasher = Sha256::new();
                    hasher.update([NODE_PREFIX]);
                    hasher.update(left);
                    hasher.update(right);
                    let node: [u8; 32] = hasher.finalize().into();
                    node
                }
                _ => pair[0],
            })
            .collect();
    }
    level.first().copied().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Principal {
        Principal::from_bytes([0xa1; 20])
    }

    fn bob() -> Principal {
        Principal::from_bytes([0xb0; 20])
    }

    fn receipt(n: u8) -> Hash256 {
        Hash256([n; 32])
    }

    fn funded(amount: u128) -> LedgerState {
        let mut ledger = LedgerState::new();
        ledger
            .apply_mutations(
                &[LedgerMutation::FundTreasury {
                    from: alice(),
                    amount: Wei::new(amount),
                }],
                receipt(0),
                1,
            )
            .unwrap();
        ledger
    }

    #[test]
    fn state_root_is_deterministic() {
        let ledger = funded(1_000);
        let root1 = ledger.snapshot().state_root;
        let root2 = ledger.snapshot().state_root;
        assert_eq!(root1, root2);
        assert_ne!(root1, LedgerState::new().state_root());
    }

    #[test]
    fn applying_mutations_updates_treasury_proposals_and_events() {
        let mut ledger = funded(10_000);
        ledger
            .apply_mutations(
                &[
                    LedgerMutation::OpenProposal {
                        id: 0,
                        target_unit: 7,
                        deadline: 300,
                    },
                    LedgerMutation::CastVote {
                        proposal: 0,
                        voter: alice(),
                        vote: Vote::Yes,
                        weight: 3,
                    },
                    LedgerMutation::SettleProposal {
                        proposal: 0,
                        outcome: Outcome::Accepted,
                        purchase_price: Some(Wei::new(4_000)),
                    },
                    LedgerMutation::PayOut {
                        to: bob(),
                        amount: Wei::new(1_000),
                    },
                ],
                receipt(1),
                2,
            )
            .unwrap();
        assert_eq!(ledger.treasury(), Wei::new(5_000));
        assert_eq!(ledger.account(&bob()), Wei::new(1_000));
        let proposal = ledger.proposal(0).unwrap();
        assert_eq!(proposal.yes_votes, 3);
        assert!(proposal.executed);
        assert_eq!(proposal.outcome, Some(Outcome::Accepted));
        assert_eq!(ledger.events().len(), 5);
        assert_eq!(ledger.height(), 2);
        assert_eq!(ledger.meta.previous_receipt, Some(receipt(1)));
    }

    #[test]
    fn failed_batch_leaves_state_untouched() {
        let mut ledger = funded(100);
        let before = ledger.snapshot();
        let err = ledger
            .apply_mutations(
                &[
                    LedgerMutation::OpenProposal {
                        id: 0,
                        target_unit: 1,
                        deadline: 10,
                    },
                    LedgerMutation::PayOut {
                        to: bob(),
                        amount: Wei::new(101),
                    },
                ],
                receipt(1),
                2,
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientTreasury { .. }));
        assert_eq!(ledger.snapshot(), before);
    }

    #[test]
    fn ledger_rejects_double_votes_and_double_settlement() {
        let mut ledger = funded(0);
        let open = LedgerMutation::OpenProposal {
            id: 0,
            target_unit: 1,
            deadline: 10,
        };
        let vote = LedgerMutation::CastVote {
            proposal: 0,
            voter: alice(),
            vote: Vote::No,
            weight: 1,
        };
        ledger
            .apply_mutations(&[open, vote.clone()], receipt(1), 2)
            .unwrap();
        assert_eq!(
            ledger.apply_mutations(&[vote], receipt(2), 3).unwrap_err(),
            LedgerError::DuplicateVote {
                proposal: 0,
                voter: alice()
            }
        );
        let settle = LedgerMutation::SettleProposal {
            proposal: 0,
            outcome: Outcome::Rejected,
            purchase_price: None,
        };
        ledger
            .apply_mutations(&[settle.clone()], receipt(3), 11)
            .unwrap();
        assert_eq!(
            ledger.apply_mutations(&[settle], receipt(4), 12).unwrap_err(),
            LedgerError::AlreadySettled(0)
        );
    }

    #[test]
    fn proposal_ids_must_be_sequential() {
        let mut ledger = LedgerState::new();
        let err = ledger
            .apply_mutations(
                &[LedgerMutation::OpenProposal {
                    id: 1,
                    target_unit: 1,
                    deadline: 1,
                }],
                receipt(1),
                1,
            )
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::ProposalOutOfSequence {
                expected: 0,
                got: 1
            }
        );
    }

    #[test]
    fn receipts_cannot_be_replayed() {
        let mut ledger = funded(5);
        let err = ledger.apply_mutations(&[], receipt(0), 9).unwrap_err();
        assert_eq!(err, LedgerError::DuplicateReceipt);
    }

    #[test]
    fn snapshot_restores_and_detects_tampering() {
        let ledger = funded(42);
        let snapshot = ledger.snapshot();
        let restored = LedgerState::from_snapshot(snapshot.clone()).unwrap();
        assert_eq!(restored.snapshot(), snapshot);

        let mut tampered = snapshot;
        tampered.treasury = Wei::new(1_000_000);
        assert_eq!(
            LedgerState::from_snapshot(tampered).unwrap_err(),
            LedgerError::StateRootMismatch
        );
    }

    #[test]
    fn root_covers_history_and_metadata() {
        let mut ledger = funded(500);
        ledger
            .apply_mutations(
                &[LedgerMutation::PayOut {
                    to: bob(),
                    amount: Wei::new(200),
                }],
                receipt(1),
                5,
            )
            .unwrap();
        let snapshot = ledger.snapshot();

        let mut edited_event = snapshot.clone();
        edited_event.events[1] = LedgerEvent::PaidOut {
            to: alice(),
            amount: Wei::new(200),
        };
        let mut dropped_event = snapshot.clone();
        dropped_event.events.pop();
        let mut rewritten_receipts = snapshot.clone();
        rewritten_receipts.receipts.remove(&receipt(0));
        rewritten_receipts.receipts.insert(receipt(9));
        let mut shifted_meta = snapshot.clone();
        shifted_meta.meta.timestamp += 1;
        let mut rewound = snapshot.clone();
        rewound.meta.previous_receipt = Some(receipt(0));

        for tampered in [
            edited_event,
            dropped_event,
            rewritten_receipts,
            shifted_meta,
            rewound,
        ] {
            assert_eq!(
                LedgerState::from_snapshot(tampered).unwrap_err(),
                LedgerError::StateRootMismatch
            );
        }
        assert!(LedgerState::from_snapshot(snapshot).is_ok());
    }

    #[test]
    fn merkle_root_separates_leaves_from_nodes() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        assert_eq!(merkle_root(vec![a]), a);

        let pair = merkle_root(vec![a, b]);
        assert_ne!(pair, a);
        assert_ne!(pair, merkle_root(vec![b, a]));
        // an odd trailing node is carried up, not paired with itself
        assert_eq!(merkle_root(vec![a, b, c]), merkle_root(vec![pair, c]));
        assert_ne!(merkle_root(vec![a, b, c]), merkle_root(vec![a, b, c, c]));
    }
}
