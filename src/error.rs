//! Error Types
//!
//! Structural anomalies found while rewriting the CFG are programmer errors
//! (a corrupt graph handed to the pass), so every variant here is fatal to
//! the pass: operations return `Result` and the entry points propagate the
//! first failure without retrying or exposing partial progress.

use thiserror::Error;

/// Layout pass error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// A block with no jump at its tail has more than one successor.
    ///
    /// A fall-through block must have exactly one way out; anything else
    /// means the edge lists and the instruction stream disagree.
    #[error("block {0} falls through but has {1} successors")]
    AmbiguousFallThru(u32, usize),

    /// A jump instruction does not have the shape its edges demand
    /// (e.g. a conditional whose taken target is not the crossing
    /// destination's label).
    #[error("block {0} ends in a jump that does not match its edges")]
    MalformedJump(u32),

    /// A conditional branch still crosses sections after the conditional
    /// fix-up phase has run.
    #[error("conditional jump in block {0} still crosses sections")]
    CrossingConditional(u32),

    /// `duplicate_block` did not leave the redirected edge pointing at the
    /// fresh copy.
    #[error("edge {src} -> {dest} was not redirected to the duplicated block")]
    RedirectMismatch { src: u32, dest: u32 },

    /// A freshly duplicated block was already marked visited.
    #[error("duplicate of block {original} produced an already-visited block {copy}")]
    DuplicateVisited { original: u32, copy: u32 },

    /// The tentative layout chain broke while being walked: a loop was not
    /// cut, or a splice dropped part of a trace.
    #[error("layout chain broken at block {0}")]
    BrokenChain(u32),

    /// The final chain does not visit every block exactly once.
    #[error("layout chain covers {visited} of {total} blocks")]
    IncompleteChain { visited: usize, total: usize },

    /// An operation that requires CFG-layout mode ran outside of it.
    #[error("operation requires CFG-layout mode")]
    NotInLayoutMode,
}
