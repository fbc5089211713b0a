// Drives the `dao` binary against a throwaway state file.

use std::path::PathBuf;
use std::process::{Command, Output};

use tempfile::TempDir;

const OWNER: &str = "0x00000000000000000000000000000000000000aa";
const ALICE: &str = "0x00000000000000000000000000000000000000a1";
const BOB: &str = "0x00000000000000000000000000000000000000b0";

const T0: u64 = 1_760_000_000;
const DEADLINE: u64 = T0 + 300;

struct Dao {
    _dir: TempDir,
    state: PathBuf,
}

impl Dao {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("dao-state.json");
        Self { _dir: dir, state }
    }

    /// Deploys with default settings and gives ALICE two units (0 and 1).
    fn deployed() -> Self {
        let dao = Self::new();
        dao.ok(T0, None, &["deploy", "--deployer", OWNER]);
        dao.ok(T0, None, &["mint", "--to", ALICE, "--count", "2"]);
        dao
    }

    fn run(&self, at: u64, caller: Option<&str>, args: &[&str]) -> Output {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_dao"));
        cmd.arg("--state")
            .arg(&self.state)
            .arg("--at")
            .arg(at.to_string())
            .env_remove("RUST_LOG");
        if let Some(caller) = caller {
            cmd.args(["--as", caller]);
        }
        cmd.args(args).output().unwrap()
    }

    fn ok(&self, at: u64, caller: Option<&str>, args: &[&str]) -> String {
        let out = self.run(at, caller, args);
        assert!(
            out.status.success(),
            "{args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8(out.stdout).unwrap()
    }

    /// Runs a command expected to fail and returns its stderr, checking
    /// that the state file was left byte-identical.
    fn rejected(&self, at: u64, caller: Option<&str>, args: &[&str]) -> String {
        let before = self.state_bytes();
        let out = self.run(at, caller, args);
        assert_eq!(out.status.code(), Some(1), "{args:?} should exit 1");
        assert_eq!(self.state_bytes(), before, "{args:?} rewrote the state file");
        String::from_utf8(out.stderr).unwrap()
    }

    fn state_bytes(&self) -> Vec<u8> {
        std::fs::read(&self.state).unwrap()
    }
}

#[test]
fn duplicate_vote_fails_once_with_kind_and_keeps_state() {
    let dao = Dao::deployed();
    dao.ok(T0, Some(ALICE), &["create", "--unit", "7"]);
    let out = dao.ok(T0 + 10, Some(ALICE), &["vote", "--proposal", "0", "yes"]);
    assert!(out.contains("tally: 2 yes / 0 no"), "{out}");

    let stderr = dao.rejected(T0 + 20, Some(ALICE), &["vote", "--proposal", "0", "no"]);
    assert!(stderr.contains("[AlreadyVoted]"), "{stderr}");
    assert!(stderr.contains(&format!("{ALICE} already voted on proposal 0")), "{stderr}");
    assert_eq!(stderr.matches("already voted").count(), 1, "{stderr}");
}

#[test]
fn execute_follows_the_clock_override() {
    let dao = Dao::deployed();
    dao.ok(T0, Some(ALICE), &["create", "--unit", "7"]);
    dao.ok(T0 + 1, Some(ALICE), &["vote", "--proposal", "0", "yes"]);

    let stderr = dao.rejected(DEADLINE - 1, Some(BOB), &["execute", "--proposal", "0"]);
    assert!(stderr.contains("[VotingOpen]"), "{stderr}");

    // 0.004 ETH of initial funding cannot cover a 0.1 ETH unit
    let stderr = dao.rejected(DEADLINE, Some(BOB), &["execute", "--proposal", "0"]);
    assert!(stderr.contains("[InsufficientFunds]"), "{stderr}");

    dao.ok(DEADLINE, None, &["fund", "--amount", "1"]);
    let out = dao.ok(DEADLINE, Some(BOB), &["execute", "--proposal", "0"]);
    assert!(out.contains("proposal 0 accepted: unit 7 purchased"), "{out}");
    assert!(out.contains("treasury balance: 0.904 ETH"), "{out}");

    let stderr = dao.rejected(DEADLINE + 5, Some(BOB), &["execute", "--proposal", "0"]);
    assert!(stderr.contains("[AlreadyExecuted]"), "{stderr}");

    let out = dao.ok(DEADLINE + 5, None, &["proposal", "0"]);
    assert!(out.contains("status:           executed (accepted)"), "{out}");
}

#[test]
fn deploy_needs_force_to_replace_state() {
    let dao = Dao::deployed();
    let stderr = dao.rejected(T0, None, &["deploy", "--deployer", BOB]);
    assert!(stderr.contains("--force"), "{stderr}");

    let out = dao.ok(T0, None, &["deploy", "--deployer", BOB, "--force"]);
    assert!(out.contains("DAO deployed to:"), "{out}");
    assert!(out.contains("Treasury funded with 0.004 ETH"), "{out}");

    // the fresh deployment has no members and a new owner
    let out = dao.ok(T0, Some(BOB), &["status"]);
    assert!(out.contains("You own this DAO"), "{out}");
    let out = dao.ok(T0, Some(ALICE), &["status"]);
    assert!(out.contains("Your units: 0"), "{out}");
}

#[test]
fn transfer_checks_the_current_holder() {
    let dao = Dao::deployed();

    let stderr = dao.rejected(T0, Some(BOB), &["transfer", "--to", BOB, "--unit", "0"]);
    assert!(stderr.contains(&format!("unit 0 is held by {ALICE}")), "{stderr}");
    let stderr = dao.rejected(T0, Some(ALICE), &["transfer", "--to", BOB, "--unit", "9"]);
    assert!(stderr.contains("unit 9 has not been minted"), "{stderr}");

    dao.ok(T0, Some(ALICE), &["transfer", "--to", BOB, "--unit", "1"]);
    let out = dao.ok(T0, Some(BOB), &["status"]);
    assert!(out.contains("Your units: 1"), "{out}");
}

#[test]
fn read_only_commands_do_not_need_a_caller() {
    let dao = Dao::deployed();
    let out = dao.ok(T0, None, &["proposals"]);
    assert!(out.contains("No proposals have been created"), "{out}");

    let stderr = dao.rejected(T0, None, &["create", "--unit", "3"]);
    assert!(stderr.contains("--as"), "{stderr}");
}
