// Deployment configuration (dao.toml).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::governance::DEFAULT_VOTING_PERIOD;
use crate::ledger::Wei;
use crate::marketplace::DEFAULT_UNIT_PRICE;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Assembled config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployConfig {
    pub voting_period: u64,
    pub initial_funding: Wei,
    pub unit_price: Wei,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            voting_period: DEFAULT_VOTING_PERIOD,
            initial_funding: Wei::new(4_000_000_000_000_000), // 0.004 ether
            unit_price: DEFAULT_UNIT_PRICE,
        }
    }
}

// ---------------------------------------------------------------------------
// dao.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    dao: DaoSection,
    #[serde(default)]
    marketplace: MarketplaceSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DaoSection {
    voting_period_secs: Option<u64>,
    /// Ether, e.g. "0.004".
    initial_funding: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MarketplaceSection {
    /// Ether per unit, e.g. "0.1".
    price: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load_config(path: &Path) -> Result<DeployConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ConfigFile = toml::from_str(&text).map_err(|source| ConfigError::ParseError {
        path: path.to_path_buf(),
        source,
    })?;
    file.assemble()
}

pub fn parse_config(text: &str) -> Result<DeployConfig, ConfigError> {
    let file: ConfigFile = toml::from_str(text).map_err(|source| ConfigError::ParseError {
        path: PathBuf::from("<inline>"),
        source,
    })?;
    file.assemble()
}

impl ConfigFile {
    fn assemble(self) -> Result<DeployConfig, ConfigError> {
        let defaults = DeployConfig::default();
        let voting_period = self.dao.voting_period_secs.unwrap_or(defaults.voting_period);
        if voting_period == 0 {
            return Err(ConfigError::ValidationError {
                field: "dao.voting_period_secs".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(DeployConfig {
            voting_period,
            initial_funding: ether_field("dao.initial_funding", self.dao.initial_funding)?
                .unwrap_or(defaults.initial_funding),
            unit_price: ether_field("marketplace.price", self.marketplace.price)?
                .unwrap_or(defaults.unit_price),
        })
    }
}

fn ether_field(field: &str, value: Option<String>) -> Result<Option<Wei>, ConfigError> {
    value
        .map(|v| {
            Wei::parse_ether(&v).map_err(|e| ConfigError::ValidationError {
                field: field.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}
