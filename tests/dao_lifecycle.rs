// End-to-end flow through the public API, persisting between every step the
// way the `dao` binary does.

use std::path::Path;

use dao_ledger::clock::ManualClock;
use dao_ledger::config::parse_config;
use dao_ledger::deploy::Deployment;
use dao_ledger::governance::DEFAULT_VOTING_PERIOD;
use dao_ledger::{GovernanceError, Principal, ProposalStatus, Vote, Wei};

const T0: u64 = 1_760_000_000;

fn addr(s: &str) -> Principal {
    s.parse().unwrap()
}

/// Loads the deployment, runs `f` against a live engine at time `now`, and
/// saves the result only when `f` succeeds.
fn step<T>(
    path: &Path,
    now: u64,
    f: impl FnOnce(&dao_ledger::deploy::DeployedEngine<ManualClock>) -> Result<T, GovernanceError>,
) -> Result<T, GovernanceError> {
    let mut deployment = Deployment::load(path).unwrap();
    let engine = deployment.engine(ManualClock::new(now)).unwrap();
    let out = f(&engine)?;
    deployment.capture(&engine);
    deployment.save(path).unwrap();
    Ok(out)
}

#[test]
fn proposal_lifecycle_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dao-state.json");

    let owner = addr("0x00000000000000000000000000000000000000aa");
    let alice = addr("0x00000000000000000000000000000000000000a1");
    let bob = addr("0x00000000000000000000000000000000000000b0");

    let config = parse_config(
        r#"
        [dao]
        initial_funding = "0.5"
        [marketplace]
        price = "0.1"
        "#,
    )
    .unwrap();
    let (deployment, _) =
        Deployment::bootstrap(&config, owner, None, ManualClock::new(T0)).unwrap();
    deployment.save(&path).unwrap();

    step(&path, T0, |engine| {
        engine.registry().mint(alice);
        engine.registry().mint(alice);
        engine.registry().mint(alice);
        engine.registry().mint(bob);
        Ok(())
    })
    .unwrap();

    let id = step(&path, T0 + 1, |engine| engine.create_proposal(alice, 11)).unwrap();
    assert_eq!(id, 0);

    step(&path, T0 + 10, |engine| engine.vote_on_proposal(alice, id, Vote::Yes)).unwrap();
    step(&path, T0 + 20, |engine| engine.vote_on_proposal(bob, id, Vote::No)).unwrap();

    // a failed command is not persisted
    let err = step(&path, T0 + 30, |engine| engine.vote_on_proposal(bob, id, Vote::Yes))
        .unwrap_err();
    assert_eq!(err, GovernanceError::AlreadyVoted { proposal: id, voter: bob });
    let err = step(&path, T0 + 30, |engine| engine.execute_proposal(bob, id)).unwrap_err();
    assert!(matches!(err, GovernanceError::VotingOpen { .. }));

    let after_deadline = T0 + 1 + DEFAULT_VOTING_PERIOD;
    let view = step(&path, after_deadline, |engine| engine.execute_proposal(bob, id)).unwrap();
    assert_eq!(view.status, ProposalStatus::ExecutedAccepted);
    assert_eq!(view.proposal.yes_votes, 3);
    assert_eq!(view.proposal.no_votes, 1);

    let remaining = step(&path, after_deadline, |engine| {
        assert_eq!(engine.marketplace().owner_of(11), Some(engine.address()));
        Ok(engine.treasury_balance())
    })
    .unwrap();
    assert_eq!(remaining, Wei::parse_ether("0.4").unwrap());

    let err = step(&path, after_deadline, |engine| engine.withdraw(alice, None)).unwrap_err();
    assert_eq!(err, GovernanceError::Unauthorized { caller: alice });

    let paid = step(&path, after_deadline, |engine| engine.withdraw(owner, None)).unwrap();
    assert_eq!(paid, remaining);

    let reloaded = Deployment::load(&path).unwrap();
    assert_eq!(reloaded.ledger.treasury, Wei::ZERO);
    assert_eq!(reloaded.ledger.proposals.len(), 1);
    assert_eq!(reloaded.ledger.accounts.get(&owner), Some(&remaining));
}
