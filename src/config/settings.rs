use crate::error::{BlockchainError, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

static DEFAULT_NODE_ADDR: &str = "127.0.0.1:2001";

const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const NODE_ID_KEY: &str = "NODE_ID";

/// Node and client settings. Values come from the defaults, then an optional
/// TOML file, then the `NODE_ADDRESS` / `NODE_ID` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address this node listens on and reports as `addr_from`
    pub node_addr: String,
    /// Node every other node introduces itself to on startup
    pub bootstrap_node: String,
    pub data_dir: PathBuf,
    pub wallet_file: String,
    /// Pending transactions needed before a miner starts a round
    pub mining_threshold: usize,
    /// Nonce search threads for locally mined blocks
    pub mining_threads: usize,
    /// Separates the stores of several nodes sharing one data directory
    pub node_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_addr: String::from(DEFAULT_NODE_ADDR),
            bootstrap_node: String::from(DEFAULT_NODE_ADDR),
            data_dir: PathBuf::from("./data"),
            wallet_file: String::from("wallet.dat"),
            mining_threshold: 2,
            mining_threads: 1,
            node_id: None,
        }
    }
}

impl Config {
    /// Defaults, merged with `path` when given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    BlockchainError::Config(format!("Cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&text)?
            }
            None => Config::default(),
        };
        config.apply_overrides(env::var(NODE_ADDRESS_KEY).ok(), env::var(NODE_ID_KEY).ok());
        config.validate()?;
        debug!("Loaded configuration: {config:?}");
        Ok(config)
    }

    /// Keys missing from `text` keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Config> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_overrides(&mut self, node_addr: Option<String>, node_id: Option<String>) {
        if let Some(addr) = node_addr.filter(|addr| !addr.is_empty()) {
            self.node_addr = addr;
        }
        if let Some(id) = node_id.filter(|id| !id.is_empty()) {
            self.node_id = Some(id);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_addr.is_empty() || self.bootstrap_node.is_empty() {
            return Err(BlockchainError::Config(
                "node_addr and bootstrap_node must be set".to_string(),
            ));
        }
        if self.mining_threshold == 0 {
            return Err(BlockchainError::Config(
                "mining_threshold must be at least 1".to_string(),
            ));
        }
        if self.mining_threads == 0 {
            return Err(BlockchainError::Config(
                "mining_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_bootstrap(&self) -> bool {
        self.node_addr == self.bootstrap_node
    }

    /// Directory of the ledger database.
    pub fn store_path(&self) -> PathBuf {
        match &self.node_id {
            Some(id) => self.data_dir.join(format!("node_{id}")),
            None => self.data_dir.join("chain"),
        }
    }

    /// Wallet file; nodes with an id get their own file.
    pub fn wallet_path(&self) -> PathBuf {
        match &self.node_id {
            Some(id) => {
                let path = Path::new(&self.wallet_file);
                let stem = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| String::from("wallet"));
                let file = match path.extension() {
                    Some(ext) => format!("{stem}_{id}.{}", ext.to_string_lossy()),
                    None => format!("{stem}_{id}"),
                };
                self.data_dir.join(file)
            }
            None => self.data_dir.join(&self.wallet_file),
        }
    }
}
