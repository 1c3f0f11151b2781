//! Control Flow Graph Substrate
//!
//! This module provides the weighted CFG the layout pass consumes and
//! mutates: basic blocks with profile weights, edges with probabilities and
//! flags, a natural (source) block order, and the surgery operations the
//! pass needs (block duplication, fall-through breaking, label management,
//! jump inversion and redirection).
//!
//! # Memory Optimizations
//! - `BasicBlock.succs` and `preds` use `SmallVec<[EdgeId; 2]>` (most blocks
//!   have ≤2 edges each way)
//! - Block and edge ids are `u32` newtypes
//! - `Partition` uses `#[repr(u8)]`
//! - Liveness sets use `BitVec` (1 bit per register)

pub mod builder;
pub mod insn;

use anyhow::{bail, Result};
use bitvec::prelude::*;
use smallvec::SmallVec;
use std::fmt;

use crate::error::LayoutError;
use insn::{Insn, InsnKind, JumpTarget, LabelId, Reg};

/// Probability scale: edge probabilities live in `[0, PROB_BASE]`.
pub const PROB_BASE: u32 = 10_000;

/// Block frequency scale: the hottest block of a function has frequency
/// close to `BB_FREQ_MAX`.
pub const BB_FREQ_MAX: u32 = 10_000;

/// Dense basic block identifier. `ENTRY` and `EXIT` are sentinels and never
/// index real blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    pub const ENTRY: BlockId = BlockId(u32::MAX - 1);
    pub const EXIT: BlockId = BlockId(u32::MAX);

    pub fn is_real(self) -> bool {
        self != BlockId::ENTRY && self != BlockId::EXIT
    }

    pub fn index(self) -> usize {
        debug_assert!(self.is_real());
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            BlockId::ENTRY => write!(f, "entry"),
            BlockId::EXIT => write!(f, "exit"),
            BlockId(i) => write!(f, "{}", i),
        }
    }
}

/// Control flow edge identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub u32);

impl EdgeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Hot/cold section assignment of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Partition {
    Hot = 0,
    Cold = 1,
}

/// Where the block weights came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProfileKind {
    /// Weights estimated from static heuristics; counts are meaningless.
    Estimated = 0,
    /// Weights measured by profile feedback; counts are trustworthy.
    Feedback = 1,
}

/// Control flow edge.
#[derive(Debug, Clone)]
pub struct Edge {
    pub src: BlockId,
    pub dest: BlockId,
    /// Branch probability in `[0, PROB_BASE]`.
    pub probability: u32,
    /// Profile count along this edge.
    pub count: u64,
    /// The edge could become a fall-through under some layout.
    pub can_fallthru: bool,
    /// The edge is the current fall-through out of `src`.
    pub fallthru: bool,
    /// Abnormal control flow (EH, sibcall); never straightened.
    pub complex: bool,
    /// DFS back edge (loop-closing), precomputed before trace formation.
    pub dfs_back: bool,
    /// Fake edge inserted by analyses; never followed by layout.
    pub fake: bool,
    /// Endpoints lie in different hot/cold partitions.
    pub crossing: bool,
}

/// Basic block: weights, partition, adjacency, and its instruction stream.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Relative execution frequency, `0..=BB_FREQ_MAX`.
    pub frequency: u32,
    /// Profile execution count.
    pub count: u64,
    pub partition: Partition,
    /// Outgoing edges. SmallVec with inline capacity 2: most blocks end in
    /// a conditional branch or less.
    pub succs: SmallVec<[EdgeId; 2]>,
    /// Incoming edges.
    pub preds: SmallVec<[EdgeId; 2]>,
    pub insns: Vec<Insn>,
    /// Instructions detached from the tail after layout rewrites
    /// (barriers); re-emitted after the block.
    pub footer: Vec<Insn>,
    /// Registers live on entry, one bit per register.
    pub live_at_start: BitVec<u32>,
    /// Registers live on exit.
    pub live_at_end: BitVec<u32>,
    /// Position in the natural order; maintained by `Cfg`.
    ord: u32,
}

/// The control flow graph of one procedure.
#[derive(Debug, Clone)]
pub struct Cfg {
    blocks: Vec<BasicBlock>,
    edges: Vec<Edge>,
    /// Natural (source) block order.
    order: Vec<BlockId>,
    entry_succs: SmallVec<[EdgeId; 2]>,
    exit_preds: SmallVec<[EdgeId; 2]>,
    profile: ProfileKind,
    next_label: u32,
    next_reg: u32,
    layout_mode: bool,
}

impl Cfg {
    pub fn new(profile: ProfileKind) -> Self {
        Cfg {
            blocks: Vec::new(),
            edges: Vec::new(),
            order: Vec::new(),
            entry_succs: SmallVec::new(),
            exit_preds: SmallVec::new(),
            profile,
            next_label: 0,
            next_reg: 0,
            layout_mode: false,
        }
    }

    pub fn profile(&self) -> ProfileKind {
        self.profile
    }

    pub fn n_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.index()]
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        &mut self.edges[id.index()]
    }

    /// Ids of all real blocks, in id order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        (0..self.blocks.len() as u32).map(BlockId).collect()
    }

    /// The natural block order.
    pub fn block_order(&self) -> &[BlockId] {
        &self.order
    }

    /// Outgoing edge ids of `bb` (cloned so the graph may be mutated while
    /// iterating).
    pub fn succ_ids(&self, bb: BlockId) -> SmallVec<[EdgeId; 2]> {
        if bb == BlockId::ENTRY {
            self.entry_succs.clone()
        } else {
            self.block(bb).succs.clone()
        }
    }

    /// Incoming edge ids of `bb`.
    pub fn pred_ids(&self, bb: BlockId) -> SmallVec<[EdgeId; 2]> {
        if bb == BlockId::EXIT {
            self.exit_preds.clone()
        } else {
            self.block(bb).preds.clone()
        }
    }

    pub fn entry_succ_ids(&self) -> SmallVec<[EdgeId; 2]> {
        self.entry_succs.clone()
    }

    /// First real block in the natural order (ENTRY's layout successor).
    pub fn first_block(&self) -> Option<BlockId> {
        self.order.first().copied()
    }

    /// Last real block in the natural order (EXIT's layout predecessor).
    pub fn last_block(&self) -> Option<BlockId> {
        self.order.last().copied()
    }

    /// The block immediately before `bb` in the natural order.
    pub fn prev_block(&self, bb: BlockId) -> Option<BlockId> {
        let ord = self.block(bb).ord as usize;
        if ord == 0 {
            None
        } else {
            self.order.get(ord - 1).copied()
        }
    }

    /// The block immediately after `bb` in the natural order.
    pub fn next_block(&self, bb: BlockId) -> Option<BlockId> {
        let ord = self.block(bb).ord as usize;
        self.order.get(ord + 1).copied()
    }

    /// Frequency with which the edge is traversed, on the block frequency
    /// scale: `src.frequency * probability / PROB_BASE`.
    pub fn edge_frequency(&self, e: EdgeId) -> u64 {
        let edge = self.edge(e);
        let src_freq = match edge.src {
            BlockId::ENTRY => BB_FREQ_MAX as u64,
            BlockId::EXIT => 0,
            b => self.block(b).frequency as u64,
        };
        src_freq * edge.probability as u64 / PROB_BASE as u64
    }

    pub fn fresh_label(&mut self) -> LabelId {
        let l = LabelId(self.next_label);
        self.next_label += 1;
        l
    }

    /// A fresh pseudo register, e.g. to hold an indirect jump target.
    pub fn new_reg(&mut self) -> Reg {
        let r = Reg(self.next_reg);
        self.next_reg += 1;
        r
    }

    /// Recount register usage after instruction rewrites; returns the
    /// number of registers referenced.
    pub fn recount_regs(&mut self) -> u32 {
        let mut max = 0u32;
        for bb in &self.blocks {
            for insn in bb.insns.iter().chain(bb.footer.iter()) {
                match insn.kind {
                    InsnKind::Move { dest: Reg(r), src } => {
                        max = max.max(r + 1);
                        if let insn::Operand::Reg(Reg(s)) = src {
                            max = max.max(s + 1);
                        }
                    }
                    InsnKind::IndirectJump(Reg(r)) => max = max.max(r + 1),
                    _ => {}
                }
            }
        }
        self.next_reg = self.next_reg.max(max);
        max
    }

    pub fn in_layout_mode(&self) -> bool {
        self.layout_mode
    }

    pub(crate) fn begin_layout(&mut self) {
        self.layout_mode = true;
    }

    pub(crate) fn end_layout(&mut self) {
        self.layout_mode = false;
    }

    /// Append a new block at the end of the natural order.
    pub fn add_block(&mut self, frequency: u32, count: u64) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let ord = self.order.len() as u32;
        self.blocks.push(BasicBlock {
            id,
            frequency,
            count,
            partition: Partition::Hot,
            succs: SmallVec::new(),
            preds: SmallVec::new(),
            insns: Vec::new(),
            footer: Vec::new(),
            live_at_start: BitVec::new(),
            live_at_end: BitVec::new(),
            ord,
        });
        self.order.push(id);
        id
    }

    /// Create an empty block immediately after `after` in the natural
    /// order.
    pub fn create_basic_block(&mut self, after: BlockId) -> BlockId {
        let id = self.add_block(0, 0);
        let pos = self.block(after).ord as usize + 1;
        self.order.pop();
        self.order.insert(pos, id);
        self.renumber_order();
        id
    }

    /// Add an edge `src -> dest`. Flags default to cleared; callers adjust
    /// through `edge_mut`.
    pub fn make_edge(&mut self, src: BlockId, dest: BlockId, probability: u32, count: u64) -> EdgeId {
        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge {
            src,
            dest,
            probability,
            count,
            can_fallthru: false,
            fallthru: false,
            complex: false,
            dfs_back: false,
            fake: false,
            crossing: false,
        });
        if src == BlockId::ENTRY {
            self.entry_succs.push(id);
        } else {
            self.block_mut(src).succs.push(id);
        }
        if dest == BlockId::EXIT {
            self.exit_preds.push(id);
        } else {
            self.block_mut(dest).preds.push(id);
        }
        id
    }

    /// Point edge `e` at a new destination, keeping everything else.
    pub fn redirect_edge_succ(&mut self, e: EdgeId, new_dest: BlockId) {
        let old_dest = self.edge(e).dest;
        if old_dest == new_dest {
            return;
        }
        if old_dest == BlockId::EXIT {
            self.exit_preds.retain(|x| *x != e);
        } else {
            self.block_mut(old_dest).preds.retain(|x| *x != e);
        }
        if new_dest == BlockId::EXIT {
            self.exit_preds.push(e);
        } else {
            self.block_mut(new_dest).preds.push(e);
        }
        self.edge_mut(e).dest = new_dest;
    }

    /// Move edge `e` to a new source, keeping everything else.
    fn redirect_edge_src(&mut self, e: EdgeId, new_src: BlockId) {
        let old_src = self.edge(e).src;
        if old_src == new_src {
            return;
        }
        if old_src == BlockId::ENTRY {
            self.entry_succs.retain(|x| *x != e);
        } else {
            self.block_mut(old_src).succs.retain(|x| *x != e);
        }
        self.block_mut(new_src).succs.push(e);
        self.edge_mut(e).src = new_src;
    }

    /// The last instruction of the block, if any.
    pub fn last_insn(&self, bb: BlockId) -> Option<&Insn> {
        self.block(bb).insns.last()
    }

    /// True when the block's tail is a jump of any flavor.
    pub fn ends_in_jump(&self, bb: BlockId) -> bool {
        self.last_insn(bb).map_or(false, Insn::is_jump)
    }

    pub fn ends_in_cond_jump(&self, bb: BlockId) -> bool {
        self.last_insn(bb).map_or(false, Insn::is_cond_jump)
    }

    /// The label heading the block, if present.
    pub fn head_label(&self, bb: BlockId) -> Option<LabelId> {
        match self.block(bb).insns.first() {
            Some(Insn { kind: InsnKind::Label(l), .. }) => Some(*l),
            _ => None,
        }
    }

    /// The label heading `bb`, creating one if the block has none.
    pub fn block_label(&mut self, bb: BlockId) -> LabelId {
        if let Some(l) = self.head_label(bb) {
            return l;
        }
        let l = self.fresh_label();
        self.block_mut(bb)
            .insns
            .insert(0, Insn::new(InsnKind::Label(l)));
        l
    }

    /// Invert the conditional jump ending `bb` so that the taken branch
    /// goes to `new_taken`. Returns false when the block does not end in an
    /// invertible conditional jump.
    pub fn invert_jump(&mut self, bb: BlockId, new_taken: LabelId) -> bool {
        match self.block_mut(bb).insns.last_mut() {
            Some(Insn { kind: InsnKind::CondJump { cond, taken }, .. }) => {
                *cond = cond.invert();
                *taken = JumpTarget::Label(new_taken);
                true
            }
            _ => false,
        }
    }

    /// Retarget the jump ending `bb` at `new_label` without touching its
    /// condition. Returns false when there is no redirectable jump.
    pub fn redirect_jump(&mut self, bb: BlockId, new_label: LabelId) -> bool {
        match self.block_mut(bb).insns.last_mut() {
            Some(Insn { kind: InsnKind::CondJump { taken, .. }, .. }) => {
                *taken = JumpTarget::Label(new_label);
                true
            }
            Some(Insn { kind: InsnKind::Jump(l), .. }) => {
                *l = new_label;
                true
            }
            _ => false,
        }
    }

    /// Whether the block may be duplicated at all (structure only; size
    /// policy is the caller's).
    pub fn can_duplicate_block(&self, bb: BlockId) -> bool {
        if self
            .block(bb)
            .succs
            .iter()
            .any(|&e| self.edge(e).complex)
        {
            return false;
        }
        !self.last_insn(bb).map_or(false, Insn::is_table_jump)
    }

    /// Duplicate `orig` and redirect `via` (an edge into `orig`) to the
    /// fresh copy. The copy takes the edge's share of the profile, the
    /// original's partition and liveness, and copies of all outgoing edges.
    /// The copy is appended at the end of the natural order.
    pub fn duplicate_block(&mut self, orig: BlockId, via: EdgeId) -> Result<BlockId, LayoutError> {
        if !self.layout_mode {
            return Err(LayoutError::NotInLayoutMode);
        }
        debug_assert!(self.can_duplicate_block(orig));
        debug_assert_eq!(self.edge(via).dest, orig);

        let moved_freq = self.edge_frequency(via).min(BB_FREQ_MAX as u64) as u32;
        let moved_count = self.edge(via).count;
        let old_count = self.block(orig).count;

        // The copy must not carry the original's label.
        let insns: Vec<Insn> = self
            .block(orig)
            .insns
            .iter()
            .skip_while(|i| i.is_label())
            .cloned()
            .collect();
        let partition = self.block(orig).partition;
        let live_at_start = self.block(orig).live_at_start.clone();
        let live_at_end = self.block(orig).live_at_end.clone();

        let new_id = self.add_block(moved_freq, moved_count);
        {
            let new_bb = self.block_mut(new_id);
            new_bb.insns = insns;
            new_bb.partition = partition;
            new_bb.live_at_start = live_at_start;
            new_bb.live_at_end = live_at_end;
        }
        {
            let orig_bb = self.block_mut(orig);
            orig_bb.frequency = orig_bb.frequency.saturating_sub(moved_freq);
            orig_bb.count = orig_bb.count.saturating_sub(moved_count);
        }

        for e in self.succ_ids(orig) {
            let edge = self.edge(e).clone();
            // The edge's share of the original's outgoing counts.
            let scaled = if old_count > 0 {
                (edge.count as u128 * moved_count as u128 / old_count as u128) as u64
            } else {
                0
            };
            let ne = self.make_edge(new_id, edge.dest, edge.probability, scaled);
            let new_edge = self.edge_mut(ne);
            new_edge.can_fallthru = edge.can_fallthru;
            new_edge.complex = edge.complex;
            new_edge.dfs_back = edge.dfs_back;
            new_edge.crossing = edge.crossing;
        }

        self.redirect_edge_succ(via, new_id);
        if self.edge(via).dest != new_id {
            return Err(LayoutError::RedirectMismatch {
                src: self.edge(via).src.0,
                dest: orig.0,
            });
        }
        Ok(new_id)
    }

    /// Break a fall-through edge by routing it through a fresh block that
    /// ends in an unconditional jump to the old destination. The fresh
    /// block sits immediately after the source in the natural order and
    /// takes over edge `e` as its jump edge; a new fall-through edge links
    /// the source to it. Returns the fresh block, or `None` when `e` is
    /// not a fall-through edge.
    pub fn force_nonfallthru(&mut self, e: EdgeId) -> Result<Option<BlockId>, LayoutError> {
        if !self.layout_mode {
            return Err(LayoutError::NotInLayoutMode);
        }
        if !self.edge(e).fallthru {
            return Ok(None);
        }
        let src = self.edge(e).src;
        let dest = self.edge(e).dest;
        debug_assert!(src.is_real() && dest.is_real());

        let label = self.block_label(dest);
        let freq = self.edge_frequency(e).min(BB_FREQ_MAX as u64) as u32;
        let count = self.edge(e).count;
        let new_bb = self.create_basic_block(src);
        {
            let b = self.block_mut(new_bb);
            b.frequency = freq;
            b.count = count;
            b.insns.push(Insn::jump(label));
        }

        // The old edge becomes the jump out of the fresh block; a new
        // fall-through edge takes its place out of the source.
        let ft = self.make_edge(src, new_bb, PROB_BASE, count);
        {
            let ft_edge = self.edge_mut(ft);
            ft_edge.fallthru = true;
            ft_edge.can_fallthru = true;
        }
        self.redirect_edge_src(e, new_bb);
        {
            let jump_edge = self.edge_mut(e);
            jump_edge.fallthru = false;
            jump_edge.can_fallthru = true;
            jump_edge.probability = PROB_BASE;
        }
        Ok(Some(new_bb))
    }

    /// Compute `can_fallthru` for every edge: current fall-throughs can
    /// keep falling through, and both edges of an invertible conditional
    /// (or the single edge of a simple jump) could become fall-throughs
    /// under a different layout. Computed and indirect jumps cannot.
    pub fn set_can_fallthru_flags(&mut self) {
        for e in &mut self.edges {
            e.can_fallthru = e.fallthru;
        }
        for bb in self.block_ids() {
            let succs = self.succ_ids(bb);
            if self.ends_in_cond_jump(bb) {
                for e in succs {
                    if !self.edge(e).complex {
                        self.edge_mut(e).can_fallthru = true;
                    }
                }
            } else if self.last_insn(bb).map_or(false, Insn::is_simple_jump) && succs.len() == 1 {
                self.edge_mut(succs[0]).can_fallthru = true;
            }
        }
    }

    /// Mark loop-closing edges: a DFS from the entry block flags every edge
    /// whose destination is an ancestor on the current DFS path.
    pub fn mark_dfs_back_edges(&mut self) {
        for e in &mut self.edges {
            e.dfs_back = false;
        }
        let n = self.blocks.len();
        let mut visited: BitVec<u32> = bitvec![u32, Lsb0; 0; n];
        let mut on_stack: BitVec<u32> = bitvec![u32, Lsb0; 0; n];
        let mut back: Vec<EdgeId> = Vec::new();

        for start_edge in self.entry_succ_ids() {
            let start = self.edge(start_edge).dest;
            if !start.is_real() || visited[start.index()] {
                continue;
            }
            // Iterative DFS: (block, next successor position).
            let mut stack: Vec<(BlockId, usize)> = vec![(start, 0)];
            visited.set(start.index(), true);
            on_stack.set(start.index(), true);
            while let Some(top) = stack.len().checked_sub(1) {
                let (bb, pos) = stack[top];
                let succs = &self.block(bb).succs;
                if pos < succs.len() {
                    let e = succs[pos];
                    stack[top].1 = pos + 1;
                    let dest = self.edge(e).dest;
                    if !dest.is_real() {
                        continue;
                    }
                    if !visited[dest.index()] {
                        visited.set(dest.index(), true);
                        on_stack.set(dest.index(), true);
                        stack.push((dest, 0));
                    } else if on_stack[dest.index()] {
                        back.push(e);
                    }
                } else {
                    on_stack.set(bb.index(), false);
                    stack.pop();
                }
            }
        }
        for e in back {
            self.edge_mut(e).dfs_back = true;
        }
    }

    /// Replace the natural order with `order`, which must be a permutation
    /// of all real blocks.
    pub fn set_block_order(&mut self, order: &[BlockId]) -> Result<(), LayoutError> {
        let n = self.blocks.len();
        let mut seen: BitVec<u32> = bitvec![u32, Lsb0; 0; n];
        for &bb in order {
            if !bb.is_real() || bb.index() >= n || seen[bb.index()] {
                return Err(LayoutError::IncompleteChain { visited: order.len(), total: n });
            }
            seen.set(bb.index(), true);
        }
        if order.len() != n {
            return Err(LayoutError::IncompleteChain { visited: order.len(), total: n });
        }
        self.order = order.to_vec();
        self.renumber_order();
        Ok(())
    }

    /// Sanity-check the graph after construction: endpoints resolve,
    /// adjacency agrees with edge endpoints, probabilities are in range.
    pub fn validate(&self) -> Result<()> {
        for (i, e) in self.edges.iter().enumerate() {
            if e.probability > PROB_BASE {
                bail!("edge {} has probability {} > {}", i, e.probability, PROB_BASE);
            }
            for endpoint in [e.src, e.dest] {
                if endpoint.is_real() && endpoint.index() >= self.blocks.len() {
                    bail!("edge {} references missing block {}", i, endpoint);
                }
            }
            let in_succs = match e.src {
                BlockId::ENTRY => self.entry_succs.contains(&EdgeId(i as u32)),
                s => self.block(s).succs.contains(&EdgeId(i as u32)),
            };
            let in_preds = match e.dest {
                BlockId::EXIT => self.exit_preds.contains(&EdgeId(i as u32)),
                d => self.block(d).preds.contains(&EdgeId(i as u32)),
            };
            if !in_succs || !in_preds {
                bail!("edge {} missing from adjacency lists", i);
            }
        }
        if self.order.len() != self.blocks.len() {
            bail!(
                "natural order covers {} of {} blocks",
                self.order.len(),
                self.blocks.len()
            );
        }
        Ok(())
    }

    fn renumber_order(&mut self) {
        for (i, &bb) in self.order.iter().enumerate() {
            self.blocks[bb.index()].ord = i as u32;
        }
    }
}
