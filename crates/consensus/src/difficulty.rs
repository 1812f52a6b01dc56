//! Proof-of-work difficulty.
//!
//! Difficulty is a leading-zero-bit count on the double-SHA-256 header
//! hash. Every retarget interval the bit count moves by the base-2 log of
//! the clamped time ratio, so one bit of difficulty corresponds to a 2×
//! change in expected work.

use logichain_types::ChainConfig;

/// Hard bounds on the bit count.
pub const MIN_DIFFICULTY_BITS: u32 = 1;
pub const MAX_DIFFICULTY_BITS: u32 = 240;

/// Per-retarget clamp on the time ratio, spec'd as [0.25×, 4×].
const RATIO_CLAMP: f64 = 4.0;

/// Whether `height` starts a new retarget window.
pub fn is_retarget_height(height: u64, config: &ChainConfig) -> bool {
    height > 0 && height % config.difficulty_retarget_interval == 0
}

/// Compute the next difficulty from the last window's wall time.
///
/// `actual_span_secs` is the time the previous `difficulty_retarget_interval`
/// blocks took; the expected span is the interval times the target block
/// time. A fast window (actual < expected) raises the bit count.
pub fn retarget(current_bits: u32, actual_span_secs: f64, config: &ChainConfig) -> u32 {
    let expected =
        (config.difficulty_retarget_interval * config.target_block_time_secs) as f64;
    if actual_span_secs <= 0.0 || !actual_span_secs.is_finite() {
        return (current_bits + 2).min(MAX_DIFFICULTY_BITS);
    }

    let ratio = (expected / actual_span_secs).clamp(1.0 / RATIO_CLAMP, RATIO_CLAMP);
    let delta = ratio.log2().round() as i64;
    let next = current_bits as i64 + delta;
    next.clamp(MIN_DIFFICULTY_BITS as i64, MAX_DIFFICULTY_BITS as i64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChainConfig {
        ChainConfig::on_grid()
    }

    #[test]
    fn on_schedule_window_keeps_difficulty() {
        let config = config();
        let expected = (config.difficulty_retarget_interval * config.target_block_time_secs) as f64;
        assert_eq!(retarget(16, expected, &config), 16);
    }

    #[test]
    fn fast_window_raises_difficulty() {
        let config = config();
        let expected = (config.difficulty_retarget_interval * config.target_block_time_secs) as f64;
        assert_eq!(retarget(16, expected / 2.0, &config), 17);
        // Clamped at 4×: at most +2 bits per step.
        assert_eq!(retarget(16, expected / 100.0, &config), 18);
    }

    #[test]
    fn slow_window_lowers_difficulty() {
        let config = config();
        let expected = (config.difficulty_retarget_interval * config.target_block_time_secs) as f64;
        assert_eq!(retarget(16, expected * 2.0, &config), 15);
        // Clamped at 0.25×: at most −2 bits per step.
        assert_eq!(retarget(16, expected * 100.0, &config), 14);
    }

    #[test]
    fn difficulty_never_leaves_bounds() {
        let config = config();
        assert_eq!(retarget(MIN_DIFFICULTY_BITS, f64::MAX, &config), MIN_DIFFICULTY_BITS);
        assert_eq!(retarget(MAX_DIFFICULTY_BITS, 0.001, &config), MAX_DIFFICULTY_BITS);
    }

    #[test]
    fn retarget_heights_respect_interval() {
        let config = config();
        assert!(!is_retarget_height(0, &config));
        assert!(!is_retarget_height(1, &config));
        assert!(is_retarget_height(config.difficulty_retarget_interval, &config));
        assert!(is_retarget_height(config.difficulty_retarget_interval * 3, &config));
    }
}
