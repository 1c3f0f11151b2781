//! Basic Block Trace Layout
//!
//! A compiler back-end pass that reorders the basic blocks of a
//! procedure's control-flow graph to improve instruction-cache locality
//! and reduce taken branches, and optionally segregates rarely-executed
//! blocks into a separate cold section.
//!
//! The pass partitions blocks into linear *traces* (chains expected to
//! execute consecutively) over several rounds of falling hotness
//! thresholds, concatenates the traces into one chain, and patches the CFG
//! so the resulting layout is correct: no fall-through may cross the
//! hot/cold boundary, and crossing branches are rewritten into forms the
//! target can encode across sections.
//!
//! # Usage
//!
//! ```rust,no_run
//! use bblayout::cfg::{Cfg, ProfileKind};
//! use bblayout::layout::{reorder_basic_blocks, LayoutOptions};
//! use bblayout::target::TargetSpec;
//!
//! # fn build_cfg() -> Cfg { Cfg::new(ProfileKind::Estimated) }
//! let mut cfg = build_cfg();
//! let target = TargetSpec::default();
//! let order = reorder_basic_blocks(&mut cfg, &target, &LayoutOptions::default())?;
//! # Ok::<(), bblayout::error::LayoutError>(())
//! ```
//!
//! Diagnostic dump lines (round headers, visitation, key changes,
//! connections, the final chain) are emitted through the `log` facade at
//! debug level.

pub mod cfg;
pub mod error;
pub mod layout;
pub mod profile;
pub mod target;

// Re-export commonly used types
pub use cfg::{BasicBlock, BlockId, Cfg, Edge, EdgeId, Partition, ProfileKind};
pub use error::LayoutError;
pub use layout::{partition_hot_cold_basic_blocks, reorder_basic_blocks, LayoutOptions};
pub use target::{TargetArch, TargetSpec};
