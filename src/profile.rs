//! Profile Predicates
//!
//! Hotness classification of basic blocks. These thresholds are the only
//! profitability inputs the layout pass consumes.

use crate::cfg::{BasicBlock, Cfg, ProfileKind, BB_FREQ_MAX};

/// True when the block is expected to never execute: with profile feedback
/// a zero count, otherwise a zero estimated frequency.
pub fn probably_never_executed(cfg: &Cfg, bb: &BasicBlock) -> bool {
    match cfg.profile() {
        ProfileKind::Feedback => bb.count == 0,
        ProfileKind::Estimated => bb.frequency == 0,
    }
}

/// True when the block plausibly executes often enough to be worth code
/// growth.
pub fn maybe_hot(cfg: &Cfg, bb: &BasicBlock) -> bool {
    match cfg.profile() {
        ProfileKind::Feedback => bb.count > 0,
        ProfileKind::Estimated => bb.frequency > BB_FREQ_MAX / 1000,
    }
}
