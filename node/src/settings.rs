//! Daemon configuration.
//!
//! Layered loading: defaults, then an optional TOML file, then
//! `LOGICHAIN_`-prefixed environment variables, then CLI overrides. A
//! configuration that fails validation terminates the daemon with exit
//! code 1.

use config::{Config, Environment, File};
use logichain_types::{Address, Amount, ChainConfig, ChainMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Raw daemon settings as loaded from file and environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Data directory holding `blocks/` and `chainstate/`.
    pub data_dir: PathBuf,
    /// `on_grid` or `off_grid`.
    pub mode: String,
    /// Mine blocks to this address when set.
    pub miner_address: Option<String>,
    /// Seconds between mining attempts when idle.
    pub mine_interval_secs: u64,
    /// `RUST_LOG`-style filter for the subscriber.
    pub log_filter: String,
    /// Explicit genesis allocations; when empty, the configured number of
    /// placeholder wallets is derived deterministically.
    pub genesis_allocations: Vec<GenesisAllocation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenesisAllocation {
    pub address: String,
    pub balance_units: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./logichain-data"),
            mode: "on_grid".into(),
            miner_address: None,
            mine_interval_secs: 5,
            log_filter: "info".into(),
            genesis_allocations: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Load from an optional file plus the environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self, String> {
        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(Environment::with_prefix("LOGICHAIN").separator("__"));

        let settings = builder.build().map_err(|e| e.to_string())?;
        settings
            .try_deserialize::<NodeConfig>()
            .map_err(|e| e.to_string())
    }

    pub fn chain_mode(&self) -> Result<ChainMode, String> {
        match self.mode.as_str() {
            "on_grid" => Ok(ChainMode::OnGrid),
            "off_grid" => Ok(ChainMode::OffGrid),
            other => Err(format!("unknown mode '{other}'")),
        }
    }

    /// Build and validate the protocol parameter set.
    pub fn chain_config(&self) -> Result<ChainConfig, String> {
        let config = ChainConfig::for_mode(self.chain_mode()?);
        config.validate()?;
        Ok(config)
    }

    pub fn miner(&self) -> Result<Option<Address>, String> {
        match &self.miner_address {
            None => Ok(None),
            Some(text) => Address::decode(text)
                .map(Some)
                .map_err(|e| format!("bad miner address: {e}")),
        }
    }

    /// The genesis allocation set: explicit entries when configured,
    /// otherwise the protocol default of N placeholder wallets.
    pub fn genesis(&self, chain: &ChainConfig) -> Result<Vec<(Address, Amount)>, String> {
        if !self.genesis_allocations.is_empty() {
            return self
                .genesis_allocations
                .iter()
                .map(|entry| {
                    Address::decode(&entry.address)
                        .map(|address| (address, Amount::from_units(entry.balance_units)))
                        .map_err(|e| format!("bad genesis address '{}': {e}", entry.address))
                })
                .collect();
        }
        Ok(derived_genesis_wallets(
            chain.genesis_wallet_count,
            Amount::from_units(chain.genesis_wallet_balance_units),
        ))
    }
}

/// Deterministic placeholder wallets for networks bootstrapped without an
/// explicit allocation file. Key material for these addresses is managed
/// by the out-of-scope wallet tooling.
pub fn derived_genesis_wallets(count: u32, balance: Amount) -> Vec<(Address, Amount)> {
    (0..count)
        .map(|i| {
            let digest = logichain_crypto::sha256(format!("logichain-genesis-{i}").as_bytes());
            let mut payload = [0u8; 20];
            payload.copy_from_slice(&digest[12..]);
            (Address(payload), balance)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = NodeConfig::default();
        let chain = config.chain_config().unwrap();
        assert_eq!(chain.mode, ChainMode::OnGrid);
        assert!(config.miner().unwrap().is_none());
    }

    #[test]
    fn off_grid_mode_selected() {
        let config = NodeConfig {
            mode: "off_grid".into(),
            ..NodeConfig::default()
        };
        assert_eq!(config.chain_config().unwrap().mode, ChainMode::OffGrid);
    }

    #[test]
    fn unknown_mode_rejected() {
        let config = NodeConfig {
            mode: "hybrid".into(),
            ..NodeConfig::default()
        };
        assert!(config.chain_config().is_err());
    }

    #[test]
    fn derived_genesis_is_deterministic() {
        let a = derived_genesis_wallets(5, Amount::from_units(1000));
        let b = derived_genesis_wallets(5, Amount::from_units(1000));
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        let unique: std::collections::HashSet<_> = a.iter().map(|(addr, _)| *addr).collect();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn explicit_genesis_parsed() {
        let address = Address([7; 20]).encode();
        let config = NodeConfig {
            genesis_allocations: vec![GenesisAllocation {
                address: address.clone(),
                balance_units: 42,
            }],
            ..NodeConfig::default()
        };
        let chain = config.chain_config().unwrap();
        let allocations = config.genesis(&chain).unwrap();
        assert_eq!(allocations, vec![(Address([7; 20]), Amount::from_units(42))]);
    }

    #[test]
    fn bad_miner_address_rejected() {
        let config = NodeConfig {
            miner_address: Some("not-an-address".into()),
            ..NodeConfig::default()
        };
        assert!(config.miner().is_err());
    }
}
