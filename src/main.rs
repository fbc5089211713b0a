use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use anyhow::{anyhow, bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use tracing::debug;

use dao_ledger::{
    clock::{Clock, ManualClock, SystemClock},
    config::{self, DeployConfig},
    deploy::{DeployedEngine, Deployment},
    governance::GovernanceError,
    ledger::{Outcome, ParseError},
    registry::AssetRegistry,
    Principal, ProposalId, ProposalStatus, ProposalView, UnitId, Vote, Wei,
};

#[derive(Parser)]
#[command(name = "dao", version, about = "Holding-weighted DAO treasury governance")]
struct Cli {
    /// Deployment state file
    #[arg(long, global = true, default_value = "dao-state.json")]
    state: PathBuf,

    /// Principal issuing the command (0x-prefixed address)
    #[arg(long = "as", global = true, value_name = "PRINCIPAL")]
    caller: Option<Principal>,

    /// Evaluate deadlines at this unix time instead of the system clock
    #[arg(long, global = true, value_name = "UNIX_SECS")]
    at: Option<u64>,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy the marketplace and the DAO, funding its treasury
    Deploy {
        /// dao.toml; defaults are used when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        deployer: Principal,
        /// Address of the membership asset registry
        #[arg(long)]
        registry: Option<Principal>,
        /// Overwrite an existing state file
        #[arg(long)]
        force: bool,
    },
    #[command(flatten)]
    Session(SessionCommand),
}

/// Commands that run against an existing deployment.
#[derive(Subcommand)]
enum SessionCommand {
    /// Mint membership units to a principal
    Mint {
        #[arg(long)]
        to: Principal,
        #[arg(long, default_value_t = 1)]
        count: u64,
    },
    /// Transfer one membership unit from --as to another principal
    Transfer {
        #[arg(long)]
        to: Principal,
        #[arg(long)]
        unit: UnitId,
    },
    /// Deposit ether into the treasury
    Fund {
        #[arg(long, value_parser = parse_ether)]
        amount: Wei,
    },
    /// Propose buying a marketplace unit
    Create {
        #[arg(long)]
        unit: UnitId,
    },
    /// Vote yes or no on a proposal
    Vote {
        #[arg(long)]
        proposal: ProposalId,
        vote: Vote,
    },
    /// Execute a proposal whose deadline has passed
    Execute {
        #[arg(long)]
        proposal: ProposalId,
    },
    /// Owner only: withdraw ether from the treasury (everything by default)
    Withdraw {
        #[arg(long, value_parser = parse_ether)]
        amount: Option<Wei>,
    },
    /// Treasury balance, proposal count and the caller's standing
    Status,
    /// List every proposal
    Proposals,
    /// Show one proposal
    Proposal { id: ProposalId },
}

fn parse_ether(s: &str) -> Result<Wei, ParseError> {
    Wei::parse_ether(s)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.verbose) {
        eprintln!("error: {err:#}");
        return ExitCode::FAILURE;
    }
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<GovernanceError>() {
                Some(gov) => eprintln!("error: {} [{}]", gov, gov.kind()),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let default = match verbose {
        0 => "dao_ledger=info,dao=info,warn",
        1 => "dao_ledger=debug,dao=debug,warn",
        _ => "dao_ledger=trace,dao=trace,info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!(e))
        .context("failed to set tracing subscriber")
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = match cli.at {
        Some(at) => Arc::new(ManualClock::new(at)),
        None => Arc::new(SystemClock),
    };

    match cli.command {
        Command::Deploy {
            config,
            deployer,
            registry,
            force,
        } => deploy_cmd(&cli.state, config.as_deref(), deployer, registry, force, clock),
        Command::Session(command) => session_cmd(&cli.state, cli.caller, clock, command),
    }
}

fn session_cmd(
    state: &Path,
    caller: Option<Principal>,
    clock: Arc<dyn Clock>,
    command: SessionCommand,
) -> anyhow::Result<()> {
    let mut deployment = Deployment::load(state)
        .with_context(|| format!("no deployment at {} (run `dao deploy` first)", state.display()))?;
    let engine = deployment.engine(clock)?;
    debug!(state = %state.display(), dao = %engine.address(), "deployment loaded");

    let mutated = match command {
        SessionCommand::Mint { to, count } => {
            let units: Vec<UnitId> = (0..count).map(|_| engine.registry().mint(to)).collect();
            println!("minted units {units:?} to {to}");
            println!("{to} now holds {} unit(s)", engine.holdings(&to));
            true
        }
        SessionCommand::Transfer { to, unit } => {
            let from = require_caller(caller)?;
            match engine.registry().owner_of(unit) {
                Some(holder) if holder == from => {}
                Some(holder) => bail!("unit {unit} is held by {holder}, not {from}"),
                None => bail!("unit {unit} has not been minted"),
            }
            engine.registry().transfer(&from, to, unit)?;
            println!("unit {unit} transferred from {from} to {to}");
            true
        }
        SessionCommand::Fund { amount } => {
            let from = caller.unwrap_or(deployment.deployer);
            let balance = engine.fund(from, amount)?;
            println!("treasury balance: {} ETH", balance.format_ether());
            true
        }
        SessionCommand::Create { unit } => {
            let caller = require_caller(caller)?;
            let id = engine.create_proposal(caller, unit)?;
            let view = engine.proposal(id)?;
            println!("created proposal {id} to purchase unit {unit}");
            println!("voting closes {}", format_deadline(view.proposal.deadline));
            true
        }
        SessionCommand::Vote { proposal, vote } => {
            let caller = require_caller(caller)?;
            let view = engine.vote_on_proposal(caller, proposal, vote)?;
            println!(
                "voted {vote} on proposal {proposal} with weight {}",
                engine.holdings(&caller)
            );
            println!(
                "tally: {} yes / {} no",
                view.proposal.yes_votes, view.proposal.no_votes
            );
            true
        }
        SessionCommand::Execute { proposal } => {
            let caller = require_caller(caller)?;
            let view = engine.execute_proposal(caller, proposal)?;
            match view.proposal.outcome {
                Some(Outcome::Accepted) => println!(
                    "proposal {proposal} accepted: unit {} purchased",
                    view.proposal.target_unit
                ),
                _ => println!("proposal {proposal} rejected: nothing purchased"),
            }
            println!(
                "treasury balance: {} ETH",
                engine.treasury_balance().format_ether()
            );
            true
        }
        SessionCommand::Withdraw { amount } => {
            let caller = require_caller(caller)?;
            let paid = engine.withdraw(caller, amount)?;
            println!("withdrew {} ETH to {}", paid.format_ether(), engine.owner());
            println!(
                "treasury balance: {} ETH",
                engine.treasury_balance().format_ether()
            );
            true
        }
        SessionCommand::Status => {
            print_status(&engine, caller);
            false
        }
        SessionCommand::Proposals => {
            let now = engine.clock().now();
            let mut any = false;
            for view in engine.proposals() {
                any = true;
                print_proposal(&view, now);
            }
            if !any {
                println!("No proposals have been created");
            }
            false
        }
        SessionCommand::Proposal { id } => {
            let view = engine.proposal(id)?;
            print_proposal(&view, engine.clock().now());
            false
        }
    };

    if mutated {
        deployment.capture(&engine);
        deployment.save(state)?;
        if let Some(receipt) = engine.last_receipt() {
            debug!(height = receipt.core.height, receipt = %receipt.id, "state saved");
        }
    }
    Ok(())
}

fn deploy_cmd(
    state: &Path,
    config_path: Option<&Path>,
    deployer: Principal,
    registry: Option<Principal>,
    force: bool,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<()> {
    if state.exists() && !force {
        bail!(
            "{} already holds a deployment; pass --force to replace it",
            state.display()
        );
    }
    let config = match config_path {
        Some(path) => config::load_config(path).context("failed to load configuration")?,
        None => DeployConfig::default(),
    };
    let (deployment, _engine) = Deployment::bootstrap(&config, deployer, registry, clock)?;
    deployment.save(state)?;

    println!("Marketplace deployed to: {}", deployment.marketplace_address);
    println!("DAO deployed to: {}", deployment.engine.address);
    println!("Registry: {}", deployment.registry_address);
    println!(
        "Treasury funded with {} ETH",
        deployment.initial_funding.format_ether()
    );
    Ok(())
}

fn require_caller(caller: Option<Principal>) -> anyhow::Result<Principal> {
    caller.ok_or_else(|| anyhow!("this command needs --as <PRINCIPAL>"))
}

fn print_status<C: Clock>(engine: &DeployedEngine<C>, caller: Option<Principal>) {
    println!("DAO:        {}", engine.address());
    println!("Owner:      {}", engine.owner());
    println!(
        "Treasury:   {} ETH",
        engine.treasury_balance().format_ether()
    );
    println!("Proposals:  {}", engine.proposal_count());
    if let Some(caller) = caller {
        let units = engine.holdings(&caller);
        println!("Your units: {units}");
        if units == 0 {
            println!("You hold no membership units: you cannot create or vote on proposals");
        }
        if engine.is_owner(&caller) {
            println!("You own this DAO: `dao withdraw` is available");
        }
    }
}

fn print_proposal(view: &ProposalView, now: u64) {
    let p = &view.proposal;
    println!("Proposal {}", p.id);
    println!("  unit to purchase: {}", p.target_unit);
    println!("  deadline:         {}", format_deadline(p.deadline));
    println!("  yes votes:        {}", p.yes_votes);
    println!("  no votes:         {}", p.no_votes);
    println!("  executed:         {}", p.executed);
    match view.status {
        ProposalStatus::Open => println!(
            "  status:           open, {}s left (dao vote --proposal {} yes|no)",
            view.seconds_left(now),
            p.id
        ),
        ProposalStatus::ClosedPending => {
            let side = match view.leading_outcome() {
                Outcome::Accepted => "YES",
                Outcome::Rejected => "NO",
            };
            println!(
                "  status:           closed, execute ({side}) with dao execute --proposal {}",
                p.id
            );
        }
        status => println!("  status:           {status}"),
    }
}

fn format_deadline(deadline: u64) -> String {
    i64::try_from(deadline)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| deadline.to_string())
}
