//! Chain configuration.
//!
//! Every tunable named by the protocol lives in [`ChainConfig`]. The two
//! operating modes differ in block caps, target block time, retarget
//! interval, mempool capacity, and whether BFT attestation is required.

use crate::amount::Amount;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating mode. OFF_GRID trades throughput and finality for the
/// ability to keep producing blocks without connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainMode {
    OnGrid,
    OffGrid,
}

impl ChainMode {
    pub fn as_byte(self) -> u8 {
        match self {
            ChainMode::OnGrid => 0,
            ChainMode::OffGrid => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ChainMode::OnGrid),
            1 => Some(ChainMode::OffGrid),
            _ => None,
        }
    }
}

impl fmt::Display for ChainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChainMode::OnGrid => "on_grid",
            ChainMode::OffGrid => "off_grid",
        })
    }
}

/// Reward distribution at contract validation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardSplit {
    pub driver: f64,
    pub validators: f64,
    pub reserve: f64,
}

impl Default for RewardSplit {
    fn default() -> Self {
        Self {
            driver: 0.70,
            validators: 0.20,
            reserve: 0.10,
        }
    }
}

impl RewardSplit {
    /// Shares in basis points, for exact integer arithmetic on amounts.
    pub fn basis_points(&self) -> (u64, u64, u64) {
        let driver = (self.driver * 10_000.0).round() as u64;
        let validators = (self.validators * 10_000.0).round() as u64;
        let reserve = 10_000u64.saturating_sub(driver + validators);
        (driver, validators, reserve)
    }

    pub fn is_valid(&self) -> bool {
        let sum = self.driver + self.validators + self.reserve;
        (sum - 1.0).abs() < 1e-9
            && self.driver >= 0.0
            && self.validators >= 0.0
            && self.reserve >= 0.0
    }
}

/// Protocol parameters, fixed at node start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub mode: ChainMode,
    pub target_block_time_secs: u64,
    pub block_size_cap_bytes: usize,
    pub tx_count_cap: usize,
    pub mempool_max_bytes: usize,
    pub difficulty_retarget_interval: u64,
    /// Leading-zero bits required of the first retarget window.
    pub initial_difficulty_bits: u32,

    pub committee_size: usize,
    pub epoch_blocks: u64,
    pub reorg_window: u64,
    pub proposal_timeout_secs: u64,
    pub stake_amount: Amount,

    pub gps_accuracy_limit_m: f64,
    pub max_step_km: f64,
    pub max_speed_kmh: f64,
    pub t_drift_secs: f64,
    pub max_coordinate_ops_per_minute: u32,
    /// Minimum driver reputation to accept a contract.
    pub driver_reputation_threshold: f64,

    pub rbf_min_bump_ratio: f64,
    pub nonce_gap_limit: u64,
    pub min_tx_fee: Amount,
    pub max_tx_fee: Amount,

    pub reward_split: RewardSplit,
    pub initial_block_reward_units: u64,
    pub halving_interval_blocks: u64,
    pub max_supply_units: u64,
    pub genesis_wallet_count: u32,
    pub genesis_wallet_balance_units: u64,

    pub segment_max_bytes: u64,
}

impl ChainConfig {
    /// Full-capacity configuration for connected operation.
    pub fn on_grid() -> Self {
        Self {
            mode: ChainMode::OnGrid,
            target_block_time_secs: 30,
            block_size_cap_bytes: 1_048_576,
            tx_count_cap: 1000,
            mempool_max_bytes: 268_435_456,
            difficulty_retarget_interval: 2016,
            initial_difficulty_bits: 12,
            committee_size: 21,
            epoch_blocks: 144,
            reorg_window: 6,
            proposal_timeout_secs: 10,
            stake_amount: Amount::from_units(10_000),
            gps_accuracy_limit_m: 10.0,
            max_step_km: 5.0,
            max_speed_kmh: 130.0,
            t_drift_secs: 300.0,
            max_coordinate_ops_per_minute: 100,
            driver_reputation_threshold: 0.3,
            rbf_min_bump_ratio: 0.10,
            nonce_gap_limit: 16,
            min_tx_fee: Amount::parse("0.001").expect("static fee bound"),
            max_tx_fee: Amount::from_units(1),
            reward_split: RewardSplit::default(),
            initial_block_reward_units: 50,
            halving_interval_blocks: 420_480,
            max_supply_units: 100_000_000,
            genesis_wallet_count: 1000,
            genesis_wallet_balance_units: 1000,
            segment_max_bytes: 128 * 1024 * 1024,
        }
    }

    /// Reduced-capacity configuration for disconnected operation: smaller
    /// blocks, slower cadence, no BFT quorum.
    pub fn off_grid() -> Self {
        Self {
            mode: ChainMode::OffGrid,
            target_block_time_secs: 300,
            block_size_cap_bytes: 1_024,
            tx_count_cap: 10,
            mempool_max_bytes: 262_144,
            difficulty_retarget_interval: 144,
            initial_difficulty_bits: 8,
            ..Self::on_grid()
        }
    }

    pub fn for_mode(mode: ChainMode) -> Self {
        match mode {
            ChainMode::OnGrid => Self::on_grid(),
            ChainMode::OffGrid => Self::off_grid(),
        }
    }

    /// Whether blocks finalizing contracts require a BFT quorum.
    pub fn requires_bft(&self) -> bool {
        self.mode == ChainMode::OnGrid
    }

    /// Sanity-check the parameter set; the daemon refuses to start on a
    /// failing config (exit code 1).
    pub fn validate(&self) -> Result<(), String> {
        if self.tx_count_cap == 0 || self.block_size_cap_bytes == 0 {
            return Err("block caps must be positive".into());
        }
        if !self.reward_split.is_valid() {
            return Err("reward split must be non-negative and sum to 1.0".into());
        }
        if self.committee_size < 4 {
            return Err("committee must allow at least one faulty validator".into());
        }
        if self.rbf_min_bump_ratio <= 0.0 {
            return Err("replace-by-fee bump ratio must be positive".into());
        }
        if self.min_tx_fee > self.max_tx_fee {
            return Err("minimum fee exceeds maximum fee".into());
        }
        if self.reorg_window == 0 {
            return Err("reorg window must be at least 1".into());
        }
        Ok(())
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::on_grid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_defaults_match_protocol_table() {
        let on = ChainConfig::on_grid();
        assert_eq!(on.target_block_time_secs, 30);
        assert_eq!(on.block_size_cap_bytes, 1_048_576);
        assert_eq!(on.tx_count_cap, 1000);
        assert_eq!(on.mempool_max_bytes, 268_435_456);
        assert_eq!(on.difficulty_retarget_interval, 2016);
        assert!(on.requires_bft());

        let off = ChainConfig::off_grid();
        assert_eq!(off.target_block_time_secs, 300);
        assert_eq!(off.block_size_cap_bytes, 1_024);
        assert_eq!(off.tx_count_cap, 10);
        assert_eq!(off.mempool_max_bytes, 262_144);
        assert_eq!(off.difficulty_retarget_interval, 144);
        assert!(!off.requires_bft());
    }

    #[test]
    fn default_config_validates() {
        ChainConfig::on_grid().validate().unwrap();
        ChainConfig::off_grid().validate().unwrap();
    }

    #[test]
    fn bad_split_rejected() {
        let mut config = ChainConfig::on_grid();
        config.reward_split.driver = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn split_basis_points_cover_whole() {
        let (driver, validators, reserve) = RewardSplit::default().basis_points();
        assert_eq!(driver, 7_000);
        assert_eq!(validators, 2_000);
        assert_eq!(reserve, 1_000);
        assert_eq!(driver + validators + reserve, 10_000);
    }

    #[test]
    fn mode_byte_roundtrip() {
        for mode in [ChainMode::OnGrid, ChainMode::OffGrid] {
            assert_eq!(ChainMode::from_byte(mode.as_byte()), Some(mode));
        }
        assert_eq!(ChainMode::from_byte(9), None);
    }
}
