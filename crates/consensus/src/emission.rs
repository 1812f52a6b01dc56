//! Reward emission schedule.
//!
//! The base reward starts at 50 units and halves every
//! `halving_interval_blocks`, regardless of the mode the block was mined
//! in (height is the schedule's only input). Issuance stops at the supply
//! cap: the final reward is clipped to whatever remains.

use logichain_types::{Amount, ChainConfig};

/// Unclipped reward at a height.
pub fn base_reward(height: u64, config: &ChainConfig) -> Amount {
    let halvings = height / config.halving_interval_blocks;
    Amount::from_units(config.initial_block_reward_units).halved(halvings.min(u32::MAX as u64) as u32)
}

/// The reward actually mintable at `height` given what has been issued.
pub fn scheduled_reward(height: u64, issued: Amount, config: &ChainConfig) -> Amount {
    let cap = Amount::from_units(config.max_supply_units);
    let remaining = cap.checked_sub(issued).unwrap_or(Amount::ZERO);
    if remaining.is_negative() {
        return Amount::ZERO;
    }
    base_reward(height, config).min(remaining)
}

/// Total supply the schedule would ever issue, ignoring the cap clip.
pub fn projected_supply(config: &ChainConfig) -> Amount {
    let mut total = Amount::ZERO;
    let mut height = 0u64;
    loop {
        let reward = base_reward(height, config);
        if reward.is_zero() {
            break;
        }
        let interval = Amount::from_atomic(
            reward.atomic() * config.halving_interval_blocks as i128,
        );
        total = total.checked_add(interval).unwrap_or(total);
        height += config.halving_interval_blocks;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_era_pays_fifty() {
        let config = ChainConfig::on_grid();
        assert_eq!(base_reward(0, &config), Amount::from_units(50));
        assert_eq!(
            base_reward(config.halving_interval_blocks - 1, &config),
            Amount::from_units(50)
        );
    }

    #[test]
    fn halves_per_interval() {
        let config = ChainConfig::on_grid();
        assert_eq!(
            base_reward(config.halving_interval_blocks, &config),
            Amount::from_units(25)
        );
        assert_eq!(
            base_reward(config.halving_interval_blocks * 2, &config),
            Amount::parse("12.5").unwrap()
        );
    }

    #[test]
    fn schedule_is_mode_independent() {
        let on = ChainConfig::on_grid();
        let off = ChainConfig::off_grid();
        for height in [0, 1000, 420_480, 840_960] {
            assert_eq!(base_reward(height, &on), base_reward(height, &off));
        }
    }

    #[test]
    fn reward_clips_at_supply_cap() {
        let config = ChainConfig::on_grid();
        let cap = Amount::from_units(config.max_supply_units);
        let nearly_all = cap.checked_sub(Amount::from_units(10)).unwrap();
        assert_eq!(
            scheduled_reward(0, nearly_all, &config),
            Amount::from_units(10)
        );
        assert_eq!(scheduled_reward(0, cap, &config), Amount::ZERO);
    }
}
