//! Fork choice.
//!
//! The best chain has the greatest cumulative work; exact work ties break
//! toward the greater BFT-finalized height, then the lexicographically
//! lowest tip hash. Finality never outranks work outright: a stalled
//! quorum must not be able to freeze fork choice.

use logichain_types::BlockHash;
use std::cmp::Ordering;

/// A tip competing for the best chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipCandidate {
    pub hash: BlockHash,
    pub cumulative_work: u128,
    pub finalized_height: u64,
}

/// Total order on candidates; `Ordering::Greater` means `a` is better.
pub fn compare_tips(a: &TipCandidate, b: &TipCandidate) -> Ordering {
    a.cumulative_work
        .cmp(&b.cumulative_work)
        .then_with(|| a.finalized_height.cmp(&b.finalized_height))
        // Lowest hash wins the final tie, so the comparison is reversed.
        .then_with(|| b.hash.cmp(&a.hash))
}

/// Whether switching from `current` to `challenger` is justified.
pub fn challenger_wins(current: &TipCandidate, challenger: &TipCandidate) -> bool {
    compare_tips(challenger, current) == Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tip(hash_byte: u8, work: u128, finalized: u64) -> TipCandidate {
        TipCandidate {
            hash: [hash_byte; 32],
            cumulative_work: work,
            finalized_height: finalized,
        }
    }

    #[test]
    fn greater_work_wins() {
        assert!(challenger_wins(&tip(1, 10, 5), &tip(2, 11, 0)));
        assert!(!challenger_wins(&tip(1, 10, 0), &tip(2, 9, 99)));
    }

    #[test]
    fn work_tie_breaks_on_finalized_height() {
        assert!(challenger_wins(&tip(1, 10, 3), &tip(2, 10, 4)));
        assert!(!challenger_wins(&tip(1, 10, 4), &tip(2, 10, 3)));
    }

    #[test]
    fn full_tie_breaks_on_lowest_hash() {
        assert!(challenger_wins(&tip(5, 10, 4), &tip(2, 10, 4)));
        assert!(!challenger_wins(&tip(2, 10, 4), &tip(5, 10, 4)));
    }

    #[test]
    fn identical_candidates_do_not_switch() {
        let a = tip(1, 10, 4);
        assert!(!challenger_wins(&a, &a));
    }
}
