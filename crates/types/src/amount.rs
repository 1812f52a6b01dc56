//! Fixed-point monetary amounts.
//!
//! One unit is 10^18 atomic parts, stored in a signed 128-bit integer.
//! All arithmetic is checked; an overflow is a bug and surfaces as
//! `ResourceExhausted` at the call site, never as silent wrap-around.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;

/// Decimal places of precision.
pub const AMOUNT_DECIMALS: u32 = 18;

/// Atomic parts per whole unit.
pub const ATOMIC_PER_UNIT: i128 = 10i128.pow(AMOUNT_DECIMALS);

/// A monetary amount with 18-decimal fixed-point precision.
///
/// Serialized as a decimal string: JSON numbers cannot carry 128-bit
/// precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(i128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_atomic(atomic: i128) -> Self {
        Amount(atomic)
    }

    /// Whole units, e.g. `Amount::from_units(50)` for the base reward.
    pub fn from_units(units: u64) -> Self {
        Amount(units as i128 * ATOMIC_PER_UNIT)
    }

    pub fn atomic(&self) -> i128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// `self * numerator / denominator` without intermediate overflow for
    /// realistic supplies. Used for payout splits.
    pub fn mul_div(self, numerator: u64, denominator: u64) -> Option<Amount> {
        if denominator == 0 {
            return None;
        }
        self.0
            .checked_mul(numerator as i128)
            .map(|scaled| Amount(scaled / denominator as i128))
    }

    /// Halve `halvings` times, flooring at each step.
    pub fn halved(self, halvings: u32) -> Amount {
        if halvings >= 128 {
            return Amount::ZERO;
        }
        Amount(self.0 >> halvings)
    }

    /// Parse a decimal string such as `"12.5"` or `"-0.001"`.
    pub fn parse(text: &str) -> Result<Self, AmountParseError> {
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        if digits.is_empty() {
            return Err(AmountParseError::Empty);
        }

        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if frac.len() > AMOUNT_DECIMALS as usize {
            return Err(AmountParseError::TooPrecise);
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(AmountParseError::InvalidDigit);
        }

        let whole: i128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| AmountParseError::Overflow)?
        };
        let mut frac_atomic: i128 = if frac.is_empty() {
            0
        } else {
            frac.parse().map_err(|_| AmountParseError::Overflow)?
        };
        frac_atomic *= 10i128.pow(AMOUNT_DECIMALS - frac.len() as u32);

        let atomic = whole
            .checked_mul(ATOMIC_PER_UNIT)
            .and_then(|w| w.checked_add(frac_atomic))
            .ok_or(AmountParseError::Overflow)?;
        Ok(Amount(if negative { -atomic } else { atomic }))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let magnitude = self.0.unsigned_abs();
        let whole = magnitude / ATOMIC_PER_UNIT as u128;
        let frac = magnitude % ATOMIC_PER_UNIT as u128;
        let sign = if self.0 < 0 { "-" } else { "" };
        if frac == 0 {
            write!(f, "{sign}{whole}")
        } else {
            let frac = format!("{frac:018}");
            write!(f, "{sign}{whole}.{}", frac.trim_end_matches('0'))
        }
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        amount.to_string()
    }
}

impl TryFrom<String> for Amount {
    type Error = AmountParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Amount::parse(&value)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, item| {
            Amount(acc.0.saturating_add(item.0))
        })
    }
}

/// Errors from [`Amount::parse`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountParseError {
    #[error("empty amount string")]
    Empty,
    #[error("amount has more than 18 fractional digits")]
    TooPrecise,
    #[error("amount contains a non-decimal character")]
    InvalidDigit,
    #[error("amount out of range")]
    Overflow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_and_atomic_agree() {
        assert_eq!(Amount::from_units(50).atomic(), 50 * ATOMIC_PER_UNIT);
    }

    #[test]
    fn display_roundtrip() {
        for text in ["0", "50", "0.001", "12.5", "-3.25", "1000000"] {
            let amount = Amount::parse(text).unwrap();
            assert_eq!(amount.to_string(), text);
            assert_eq!(Amount::parse(&amount.to_string()).unwrap(), amount);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Amount::parse("").is_err());
        assert!(Amount::parse("1.2.3").is_err());
        assert!(Amount::parse("abc").is_err());
        assert!(Amount::parse("1.0000000000000000001").is_err());
    }

    #[test]
    fn mul_div_splits_conserve_with_remainder() {
        let total = Amount::from_atomic(1_000_000_000_000_000_001);
        let driver = total.mul_div(7_000, 10_000).unwrap();
        let validators = total.mul_div(2_000, 10_000).unwrap();
        let reserve = total
            .checked_sub(driver)
            .and_then(|rest| rest.checked_sub(validators))
            .unwrap();
        let sum = driver
            .checked_add(validators)
            .and_then(|s| s.checked_add(reserve))
            .unwrap();
        assert_eq!(sum, total);
    }

    #[test]
    fn halving_schedule_floors() {
        let reward = Amount::from_units(50);
        assert_eq!(reward.halved(0), reward);
        assert_eq!(reward.halved(1), Amount::from_units(25));
        assert_eq!(reward.halved(200), Amount::ZERO);
    }

    #[test]
    fn checked_add_detects_overflow() {
        let max = Amount::from_atomic(i128::MAX);
        assert!(max.checked_add(Amount::from_atomic(1)).is_none());
    }

    #[test]
    fn serde_uses_decimal_strings() {
        let amount = Amount::parse("12.5").unwrap();
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"12.5\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
        assert!(serde_json::from_str::<Amount>("\"1.2.3\"").is_err());
    }
}
