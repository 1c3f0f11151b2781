//! Basic Block Layout Pass
//!
//! Reorders the basic blocks of a procedure to improve instruction-cache
//! locality and reduce taken branches, in the style of a software trace
//! cache: greedy trace formation over the weighted CFG, connection of the
//! traces into one linear chain, and (separately) hot/cold partitioning
//! with the CFG fix-up that makes cross-section control transfers legal.
//!
//! Two entry points:
//! - [`reorder_basic_blocks`] runs trace formation and connection and
//!   installs the resulting order;
//! - [`partition_hot_cold_basic_blocks`] classifies blocks into hot and
//!   cold partitions and rewrites crossing edges.
//!
//! Both are no-ops for single-block procedures and for targets that forbid
//! rewriting jumps. The pass keeps no state between invocations; all of
//! its bookkeeping lives in a pass-scoped context released on exit.

pub mod aux;
pub mod heap;

mod connect;
mod partition;
mod trace;

pub use trace::Trace;

use serde::{Deserialize, Serialize};

use crate::cfg::insn::Insn;
use crate::cfg::{BlockId, Cfg};
use crate::error::LayoutError;
use crate::target::TargetSpec;

use aux::AuxTable;
use heap::HeapId;

/// Number of trace-formation rounds. Four in the common case; the extra
/// fifth round exists only when partitioning and collects the cold blocks,
/// and only those.
pub const N_ROUNDS: usize = 5;

/// Branch probability thresholds per round, in per mille of `PROB_BASE`.
/// The last rounds must be zero so every remaining block is consumed.
pub(crate) const BRANCH_THRESHOLD: [u32; N_ROUNDS] = [400, 200, 100, 0, 0];

/// Execution thresholds per round, in per mille of the hottest entry
/// successor's frequency.
pub(crate) const EXEC_THRESHOLD: [u32; N_ROUNDS] = [500, 200, 50, 0, 0];

/// Edges below this per-mille of the entry frequency are not worth
/// duplicating a block for while connecting traces.
pub(crate) const DUPLICATION_THRESHOLD: u32 = 100;

/// Pass configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutOptions {
    /// Segregate rarely-executed blocks into a cold section: trace
    /// formation defers cold blocks to the extra final round, connection
    /// places the cold chain after the hot one, and duplication across the
    /// boundary is disabled.
    pub reorder_blocks_and_partition: bool,
    /// Prefer smaller code over straighter code.
    pub optimize_size: bool,
}

/// State shared by every stage of one pass invocation; nothing persists
/// between invocations.
pub(crate) struct PassContext<'a> {
    pub cfg: &'a mut Cfg,
    pub target: &'a TargetSpec,
    pub opts: &'a LayoutOptions,
    pub aux: AuxTable,
    pub traces: Vec<Trace>,
    /// Maximum frequency over ENTRY's successors.
    pub max_entry_frequency: u32,
    /// Maximum profile count over ENTRY's successors.
    pub max_entry_count: u64,
    /// Length of an unconditional jump, probed once per invocation.
    pub uncond_jump_length: u32,
    next_heap_id: u32,
}

impl<'a> PassContext<'a> {
    fn new(
        cfg: &'a mut Cfg,
        target: &'a TargetSpec,
        opts: &'a LayoutOptions,
        uncond_jump_length: u32,
    ) -> Self {
        let n = cfg.n_blocks();
        PassContext {
            cfg,
            target,
            opts,
            aux: AuxTable::new(n),
            traces: Vec::with_capacity(n),
            max_entry_frequency: 0,
            max_entry_count: 0,
            uncond_jump_length,
            next_heap_id: 0,
        }
    }

    pub(crate) fn alloc_heap_id(&mut self) -> HeapId {
        let id = HeapId(self.next_heap_id);
        self.next_heap_id += 1;
        id
    }
}

/// Overflow-safe `value * per_mille / 1000`.
pub(crate) fn scaled_count(value: u64, per_mille: u32) -> u64 {
    if value < u64::MAX / 1000 {
        value * per_mille as u64 / 1000
    } else {
        value / 1000 * per_mille as u64
    }
}

/// Length of an unconditional jump on this target, probed by materializing
/// a dummy jump and asking for its length.
fn get_uncond_jump_length(cfg: &mut Cfg, target: &TargetSpec) -> u32 {
    let label = cfg.fresh_label();
    let jump = Insn::jump(label);
    target.insn_length(&jump)
}

/// Scoped CFG-layout mode. Entering puts the graph into layout mode;
/// dropping the session releases it on every exit path, normal return,
/// error, or unwind.
struct LayoutSession<'a> {
    cfg: &'a mut Cfg,
}

impl<'a> LayoutSession<'a> {
    fn enter(cfg: &'a mut Cfg) -> Self {
        cfg.begin_layout();
        LayoutSession { cfg }
    }

    fn cfg(&mut self) -> &mut Cfg {
        self.cfg
    }
}

impl Drop for LayoutSession<'_> {
    fn drop(&mut self) {
        self.cfg.end_layout();
    }
}

/// Reorder the procedure's blocks along greedily-built traces and install
/// the new order on the CFG. Returns the order.
pub fn reorder_basic_blocks(
    cfg: &mut Cfg,
    target: &TargetSpec,
    opts: &LayoutOptions,
) -> Result<Vec<BlockId>, LayoutError> {
    if cfg.n_blocks() <= 1 || target.cannot_modify_jumps {
        return Ok(cfg.block_order().to_vec());
    }

    let mut session = LayoutSession::enter(cfg);
    reorder_inner(session.cfg(), target, opts)
}

fn reorder_inner(
    cfg: &mut Cfg,
    target: &TargetSpec,
    opts: &LayoutOptions,
) -> Result<Vec<BlockId>, LayoutError> {
    cfg.set_can_fallthru_flags();
    cfg.mark_dfs_back_edges();

    let uncond_jump_length = get_uncond_jump_length(cfg, target);
    let total = cfg.n_blocks();

    let mut ctx = PassContext::new(cfg, target, opts, uncond_jump_length);
    trace::find_traces(&mut ctx)?;
    connect::connect_traces(&mut ctx)?;

    let head = ctx
        .traces
        .first()
        .map(|t| t.first)
        .ok_or(LayoutError::IncompleteChain { visited: 0, total })?;
    let order = chain_order(ctx.cfg, &ctx.aux, head)?;

    if opts.reorder_blocks_and_partition {
        partition::add_unlikely_executed_notes(ctx.cfg);
    }
    drop(ctx);

    cfg.set_block_order(&order)?;
    Ok(order)
}

/// Classify blocks into hot and cold partitions and rewrite every crossing
/// edge so no cross-section transfer is a fall-through or an out-of-range
/// branch. Returns the (possibly grown) block order.
pub fn partition_hot_cold_basic_blocks(
    cfg: &mut Cfg,
    target: &TargetSpec,
) -> Result<Vec<BlockId>, LayoutError> {
    if cfg.n_blocks() <= 1 || target.cannot_modify_jumps {
        return Ok(cfg.block_order().to_vec());
    }

    let mut session = LayoutSession::enter(cfg);
    partition_inner(session.cfg(), target)
}

fn partition_inner(cfg: &mut Cfg, target: &TargetSpec) -> Result<Vec<BlockId>, LayoutError> {
    let mut aux = AuxTable::new(cfg.n_blocks());

    // The tentative layout starts as the natural order; fix-up splices new
    // blocks into it.
    let natural: Vec<BlockId> = cfg.block_order().to_vec();
    for pair in natural.windows(2) {
        aux.get_mut(pair[0]).next = Some(pair[1]);
    }

    let crossing = partition::find_rarely_executed_basic_blocks_and_crossing_edges(cfg);
    if !crossing.is_empty() {
        partition::fix_edges_for_rarely_executed_code(cfg, &mut aux, target, &crossing)?;
    }

    let head = match natural.first() {
        Some(&h) => h,
        None => return Ok(Vec::new()),
    };
    let order = chain_order(cfg, &aux, head)?;
    cfg.set_block_order(&order)?;
    Ok(order)
}

/// Walk the tentative layout chain from `head` and return it as a vector,
/// checking that it is acyclic and covers every block exactly once.
fn chain_order(cfg: &Cfg, aux: &AuxTable, head: BlockId) -> Result<Vec<BlockId>, LayoutError> {
    use bitvec::prelude::*;

    let n = cfg.n_blocks();
    let mut seen: BitVec<u32> = bitvec![u32, Lsb0; 0; n];
    let mut order = Vec::with_capacity(n);
    let mut cur = Some(head);
    while let Some(bb) = cur {
        if seen[bb.index()] {
            return Err(LayoutError::BrokenChain(bb.0));
        }
        seen.set(bb.index(), true);
        order.push(bb);
        cur = aux.get(bb).next;
    }
    if order.len() != n {
        return Err(LayoutError::IncompleteChain { visited: order.len(), total: n });
    }
    Ok(order)
}
