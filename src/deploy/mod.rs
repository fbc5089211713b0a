//! Bootstrap of a marketplace + governance engine pair, and the JSON file
//! that carries a deployment between CLI invocations.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::clock::Clock;
use crate::config::DeployConfig;
use crate::governance::{EngineSettings, GovernanceEngine, GovernanceError};
use crate::ledger::{LedgerError, LedgerSnapshot, LedgerState, Principal, Wei};
use crate::marketplace::{FakeMarketplace, MarketplaceState};
use crate::registry::{InMemoryRegistry, RegistryState};

pub const DEPLOYMENT_VERSION: u8 = 1;

pub const REGISTRY_NONCE: u64 = 0;
pub const MARKETPLACE_NONCE: u64 = 1;
pub const ENGINE_NONCE: u64 = 2;

pub type DeployedEngine<C> = GovernanceEngine<InMemoryRegistry, FakeMarketplace, C>;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("failed to access deployment file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed deployment file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("deployment file version {0} is not supported")]
    UnsupportedVersion(u8),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Governance(#[from] GovernanceError),
}

/// Address a contract created by `deployer` at `nonce` would receive.
pub fn contract_address(deployer: &Principal, nonce: u64) -> Principal {
    let mut hasher = Sha256::new();
    hasher.update(b"dao-ledger/create");
    hasher.update(deployer.as_bytes());
    hasher.update(nonce.to_le_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[12..]);
    Principal::from_bytes(address)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    pub version: u8,
    pub deployer: Principal,
    pub registry_address: Principal,
    pub marketplace_address: Principal,
    pub engine: EngineSettings,
    pub initial_funding: Wei,
    pub registry: RegistryState,
    pub marketplace: MarketplaceState,
    pub ledger: LedgerSnapshot,
}

impl Deployment {
    /// Deploys the marketplace, then the engine wired to it and to the
    /// registry at `registry_address`, and funds the treasury.
    pub fn bootstrap<C: Clock>(
        config: &DeployConfig,
        deployer: Principal,
        registry_address: Option<Principal>,
        clock: C,
    ) -> Result<(Deployment, DeployedEngine<C>), DeployError> {
        let registry_address =
            registry_address.unwrap_or_else(|| contract_address(&deployer, REGISTRY_NONCE));

        let marketplace_address = contract_address(&deployer, MARKETPLACE_NONCE);
        let marketplace = FakeMarketplace::new(config.unit_price);
        info!(address = %marketplace_address, "marketplace deployed");

        let settings = EngineSettings {
            address: contract_address(&deployer, ENGINE_NONCE),
            owner: deployer,
            voting_period: config.voting_period,
        };
        let engine = GovernanceEngine::new(settings, InMemoryRegistry::new(), marketplace, clock);
        if !config.initial_funding.is_zero() {
            engine.fund(deployer, config.initial_funding)?;
        }
        info!(
            address = %engine.address(),
            marketplace = %marketplace_address,
            registry = %registry_address,
            funding = %config.initial_funding.format_ether(),
            "governance engine deployed"
        );

        let deployment = Deployment {
            version: DEPLOYMENT_VERSION,
            deployer,
            registry_address,
            marketplace_address,
            engine: engine.settings().clone(),
            initial_funding: config.initial_funding,
            registry: engine.registry().state(),
            marketplace: engine.marketplace().state(),
            ledger: engine.snapshot(),
        };
        Ok((deployment, engine))
    }

    /// Rebuilds a live engine from the recorded state.
    pub fn engine<C: Clock>(&self, clock: C) -> Result<DeployedEngine<C>, DeployError> {
        let ledger = LedgerState::from_snapshot(self.ledger.clone())?;
        Ok(GovernanceEngine::restore(
            self.engine.clone(),
            InMemoryRegistry::from_state(self.registry.clone()),
            FakeMarketplace::from_state(self.marketplace.clone()),
            clock,
            ledger,
        ))
    }

    /// Records the engine's current state back into this deployment.
    pub fn capture<C: Clock>(&mut self, engine: &DeployedEngine<C>) {
        self.registry = engine.registry().state();
        self.marketplace = engine.marketplace().state();
        self.ledger = engine.snapshot();
    }

    pub fn load(path: &Path) -> Result<Deployment, DeployError> {
        let bytes = fs::read(path).map_err(|source| DeployError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let deployment: Deployment =
            serde_json::from_slice(&bytes).map_err(|source| DeployError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        if deployment.version != DEPLOYMENT_VERSION {
            return Err(DeployError::UnsupportedVersion(deployment.version));
        }
        Ok(deployment)
    }

    /// Writes through a sibling temp file so a crash never leaves a
    /// half-written deployment behind.
    pub fn save(&self, path: &Path) -> Result<(), DeployError> {
        let io_err = |source| DeployError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| DeployError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}
