//! Account state.

use crate::address::Address;
use crate::amount::Amount;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Active,
    Frozen,
}

/// Per-role delivery metrics, updated as contracts complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RoleMetrics {
    pub deliveries: u64,
    pub revenue: Amount,
    pub completed_contracts: u64,
    pub avg_rating: f64,
}

/// The state attached to one address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: Amount,
    pub nonce: u64,
    /// Reputation in [0, 1]; drivers below the acceptance threshold cannot
    /// take contracts.
    pub reputation: f64,
    pub metrics: RoleMetrics,
    pub created_at: f64,
    pub status: AccountStatus,
}

impl Account {
    pub fn new(address: Address, created_at: f64) -> Self {
        Self {
            address,
            balance: Amount::ZERO,
            nonce: 0,
            reputation: 0.5,
            metrics: RoleMetrics::default(),
            created_at,
            status: AccountStatus::Active,
        }
    }

    pub fn with_balance(address: Address, balance: Amount, created_at: f64) -> Self {
        Self {
            balance,
            ..Self::new(address, created_at)
        }
    }

    pub fn credit(&mut self, amount: Amount) -> CoreResult<()> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| CoreError::ResourceExhausted("balance overflow".into()))?;
        Ok(())
    }

    /// Debit, refusing to let the balance go negative.
    pub fn debit(&mut self, amount: Amount) -> CoreResult<()> {
        let next = self
            .balance
            .checked_sub(amount)
            .ok_or_else(|| CoreError::ResourceExhausted("balance underflow".into()))?;
        if next.is_negative() {
            return Err(CoreError::InsufficientBalance);
        }
        self.balance = next;
        Ok(())
    }

    /// Move reputation toward `target` by `weight` of the remaining gap.
    pub fn nudge_reputation(&mut self, target: f64, weight: f64) {
        self.reputation += (target - self.reputation) * weight;
        self.reputation = self.reputation.clamp(0.0, 1.0);
    }
}
