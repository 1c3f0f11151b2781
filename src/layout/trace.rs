//! Trace Formation
//!
//! Greedy construction of traces over the weighted CFG, in several rounds
//! of falling thresholds. Each round drains a seed heap: a seed either
//! starts a new trace, which then grows by repeatedly taking the most
//! attractive fall-through successor, or gets deferred to the next round
//! when it is not hot enough yet. Loops closed inside a trace are rotated
//! so the trace exits from its tail, and small join blocks are duplicated
//! instead of forcing a jump.
//!
//! # Trace growth
//! The successor choice uses 10% slack bands on probability and frequency:
//! within the probability band a lower-frequency destination wins (a hotter
//! destination has other hot predecessors, so some other trace will want
//! it), and within both bands the natural-order successor wins. A winner
//! with several predecessors that is cheaper to duplicate than to jump to
//! is deliberately left unclaimed; trace connection duplicates it later.

use crate::cfg::{BlockId, EdgeId, Partition, PROB_BASE};
use crate::error::LayoutError;
use crate::profile;

use super::heap::TraceHeap;
use super::{
    scaled_count, PassContext, BRANCH_THRESHOLD, EXEC_THRESHOLD, N_ROUNDS,
};

/// One trace: a chain of blocks linked through the side table's `next`
/// pointers.
#[derive(Debug, Clone)]
pub struct Trace {
    /// First and last basic block of the trace.
    pub first: BlockId,
    pub last: BlockId,
    /// Round in which the trace was found (0-based).
    pub round: usize,
    /// Number of blocks in the chain.
    pub length: usize,
}

/// Find all traces and chain their blocks through the side table. The
/// trace descriptors end up in `ctx.traces`.
pub(crate) fn find_traces(ctx: &mut PassContext) -> Result<(), LayoutError> {
    // One extra round when partitioning: the last round collects the cold
    // blocks, and only those.
    let number_of_rounds = if ctx.opts.reorder_blocks_and_partition {
        N_ROUNDS
    } else {
        N_ROUNDS - 1
    };

    let mut heap = TraceHeap::new(ctx.alloc_heap_id());
    ctx.max_entry_frequency = 0;
    ctx.max_entry_count = 0;
    for e in ctx.cfg.entry_succ_ids() {
        let dest = ctx.cfg.edge(e).dest;
        if !dest.is_real() {
            continue;
        }
        let key = bb_to_key(ctx, dest);
        let node = heap.insert(key, dest);
        let row = ctx.aux.get_mut(dest);
        row.heap = Some(heap.id());
        row.node = Some(node);
        let block = ctx.cfg.block(dest);
        ctx.max_entry_frequency = ctx.max_entry_frequency.max(block.frequency);
        ctx.max_entry_count = ctx.max_entry_count.max(block.count);
    }

    for round in 0..number_of_rounds {
        log::debug!("STC - round {}", round + 1);
        let branch_th = PROB_BASE * BRANCH_THRESHOLD[round] / 1000;
        let exec_th =
            ctx.max_entry_frequency as u64 * EXEC_THRESHOLD[round] as u64 / 1000;
        let count_th = scaled_count(ctx.max_entry_count, EXEC_THRESHOLD[round]);
        heap = find_traces_1_round(
            ctx,
            branch_th,
            exec_th,
            count_th,
            round,
            heap,
            number_of_rounds,
        )?;
    }
    debug_assert!(heap.is_empty());

    if log::log_enabled!(log::Level::Debug) {
        for (i, trace) in ctx.traces.iter().enumerate() {
            let mut line = String::new();
            let mut bb = trace.first;
            loop {
                line.push_str(&format!("{} [{}] ", bb, ctx.cfg.block(bb).frequency));
                if bb == trace.last {
                    break;
                }
                match ctx.aux.get(bb).next {
                    Some(n) => bb = n,
                    None => break,
                }
            }
            log::debug!("Trace {} (round {}): {}", i + 1, trace.round + 1, line.trim_end());
        }
    }
    Ok(())
}

/// One round of trace finding: drain `heap`, producing traces from every
/// seed that clears this round's thresholds and deferring the rest.
/// Returns the heap of seeds for the next round.
fn find_traces_1_round(
    ctx: &mut PassContext,
    branch_th: u32,
    exec_th: u64,
    count_th: u64,
    round: usize,
    mut heap: TraceHeap,
    number_of_rounds: usize,
) -> Result<TraceHeap, LayoutError> {
    // Last round in which non-cold blocks may still be collected.
    let last_round = N_ROUNDS - 1;

    let mut new_heap = TraceHeap::new(ctx.alloc_heap_id());

    while let Some(seed) = heap.extract_min() {
        {
            let row = ctx.aux.get_mut(seed);
            row.heap = None;
            row.node = None;
        }

        log::debug!("Getting bb {}", seed);

        if push_to_next_round_p(ctx, seed, round, number_of_rounds, exec_th, count_th) {
            let key = bb_to_key(ctx, seed);
            let node = new_heap.insert(key, seed);
            let row = ctx.aux.get_mut(seed);
            row.heap = Some(new_heap.id());
            row.node = Some(node);
            log::debug!("  Possible start point of next round: {} (key: {})", seed, key);
            continue;
        }

        let trace_idx = ctx.traces.len();
        let trace_no = (trace_idx + 1) as u32;
        ctx.traces.push(Trace { first: seed, last: seed, round, length: 0 });

        let mut bb = seed;
        loop {
            mark_bb_visited(ctx, &mut heap, &mut new_heap, bb, trace_no);
            ctx.traces[trace_idx].length += 1;
            log::debug!("Basic block {} was visited in trace {}", bb, trace_idx);

            // Select the successor that will be placed after BB.
            let mut best_edge: Option<EdgeId> = None;
            let mut best_prob: i64 = i64::MIN / 2;
            let mut best_freq: i64 = i64::MIN / 2;
            for e in ctx.cfg.succ_ids(bb) {
                let edge = ctx.cfg.edge(e);
                debug_assert!(!edge.fake, "fake edge {} -> {}", edge.src, edge.dest);
                if edge.fake {
                    continue;
                }
                let dest = edge.dest;
                if dest == BlockId::EXIT {
                    continue;
                }
                let visited = ctx.aux.get(dest).visited;
                if visited != 0 && visited != trace_no {
                    continue;
                }
                // Cold blocks wait for the final round.
                if ctx.cfg.block(dest).partition == Partition::Cold && round < last_round {
                    continue;
                }
                let prob = edge.probability;
                let freq = ctx.cfg.edge_frequency(e);
                // Unsuitable successor: cannot fall through, abnormal,
                // improbable or infrequent.
                if !edge.can_fallthru
                    || edge.complex
                    || prob < branch_th
                    || freq < exec_th
                    || edge.count < count_th
                {
                    continue;
                }
                if better_edge_p(ctx, bb, e, prob, freq, best_prob, best_freq, best_edge) {
                    best_edge = Some(e);
                    best_prob = prob as i64;
                    best_freq = freq as i64;
                }
            }

            // A winner with several predecessors that is cheap to duplicate
            // is left for trace connection, which can copy it instead.
            if let Some(be) = best_edge {
                let dest = ctx.cfg.edge(be).dest;
                if ctx.cfg.block(dest).preds.len() > 1 && copy_bb_p(ctx, dest, false) {
                    best_edge = None;
                }
            }

            // Every non-selected successor becomes a seed, in this round's
            // heap or the next's.
            for e in ctx.cfg.succ_ids(bb) {
                if Some(e) == best_edge {
                    continue;
                }
                let dest = ctx.cfg.edge(e).dest;
                if dest == BlockId::EXIT || ctx.aux.get(dest).visited != 0 {
                    continue;
                }

                let key = bb_to_key(ctx, dest);
                let row = ctx.aux.get(dest);
                if let (Some(hid), Some(node)) = (row.heap, row.node) {
                    let h = if hid == heap.id() { &mut heap } else { &mut new_heap };
                    debug_assert_eq!(h.id(), hid);
                    if key != h.key(node) {
                        log::debug!(
                            "Changing key for bb {} from {} to {}.",
                            dest,
                            h.key(node),
                            key
                        );
                        h.replace_key(node, key);
                    }
                } else {
                    let edge = ctx.cfg.edge(e);
                    let prob = edge.probability;
                    let freq = ctx.cfg.edge_frequency(e);
                    let mut into_next = false;
                    if !edge.can_fallthru
                        || edge.complex
                        || prob < branch_th
                        || freq < exec_th
                        || edge.count < count_th
                    {
                        if push_to_next_round_p(
                            ctx,
                            dest,
                            round,
                            number_of_rounds,
                            exec_th,
                            count_th,
                        ) {
                            into_next = true;
                        }
                    }
                    let h = if into_next { &mut new_heap } else { &mut heap };
                    let node = h.insert(key, dest);
                    let row = ctx.aux.get_mut(dest);
                    row.heap = Some(h.id());
                    row.node = Some(node);
                    log::debug!(
                        "  Possible start of {} round: {} (key: {})",
                        if into_next { "next" } else { "this" },
                        dest,
                        key
                    );
                }
            }

            let Some(be) = best_edge else { break };
            let dest = ctx.cfg.edge(be).dest;

            if ctx.aux.get(dest).visited == trace_no {
                // The chosen successor closes a loop inside this trace.
                if dest != bb {
                    // One-block self-loops are left alone.
                    if ctx.cfg.edge_frequency(be) > 4 * ctx.cfg.block(dest).frequency as u64 / 5
                    {
                        // The loop iterates at least 4 times. Rotate it so
                        // the exit leaves from the trace tail, unless the
                        // header is the function's first block.
                        if Some(dest) != ctx.cfg.first_block() {
                            log::debug!("Rotating loop {} - {}", dest, bb);
                            ctx.aux.get_mut(bb).next = Some(dest);
                            bb = rotate_loop(ctx, be, trace_idx, trace_no)?;
                        }
                    } else {
                        // Few iterations: duplicate the header onto the
                        // trace when the tail has no other way out.
                        let single_succ = ctx.cfg.block(bb).succs.len() == 1;
                        if single_succ && copy_bb_p(ctx, dest, !ctx.opts.optimize_size) {
                            bb = copy_bb(ctx, dest, be, bb, trace_no)?;
                        }
                    }
                }
                break;
            }

            // Diamond heuristic: for
            //
            //   A
            //  /|
            // B |
            //  \|
            //   C
            //
            // with 2 * B.frequency >= EDGE_FREQUENCY(A->C), the ordering
            // A B C wins even when A->C is the more probable edge. This
            // linearizes `if (A) B; C;` without a taken branch.
            let mut chosen = be;
            let best_freq_abs = ctx.cfg.edge_frequency(be);
            for e in ctx.cfg.succ_ids(bb) {
                if e == be {
                    continue;
                }
                let edge = ctx.cfg.edge(e);
                if !edge.can_fallthru || edge.complex || edge.crossing {
                    continue;
                }
                let d = edge.dest;
                if d == BlockId::EXIT || ctx.aux.get(d).visited != 0 {
                    continue;
                }
                if ctx.cfg.block(d).preds.len() != 1 {
                    continue;
                }
                let d_succs = &ctx.cfg.block(d).succs;
                if d_succs.len() != 1 {
                    continue;
                }
                let through = ctx.cfg.edge(d_succs[0]);
                if !through.can_fallthru || through.complex || through.dest != dest {
                    continue;
                }
                if 2 * ctx.cfg.block(d).frequency as u64 >= best_freq_abs {
                    chosen = e;
                    log::debug!("Selecting BB {}", ctx.cfg.edge(e).dest);
                    break;
                }
            }

            let next = ctx.cfg.edge(chosen).dest;
            ctx.aux.get_mut(bb).next = Some(next);
            bb = next;
        }

        ctx.traces[trace_idx].last = bb;
        let first = ctx.traces[trace_idx].first;
        ctx.aux.get_mut(first).start_of_trace = Some(trace_idx);
        ctx.aux.get_mut(bb).end_of_trace = Some(trace_idx);

        // The trace is terminated, so keys must be recounted: a successor
        // can now have a trace-end predecessor, which lowers its key.
        for e in ctx.cfg.succ_ids(bb) {
            let dest = ctx.cfg.edge(e).dest;
            if dest == BlockId::EXIT || ctx.aux.get(dest).visited != 0 {
                continue;
            }
            let row = ctx.aux.get(dest);
            if let (Some(hid), Some(node)) = (row.heap, row.node) {
                let key = bb_to_key(ctx, dest);
                let h = if hid == heap.id() { &mut heap } else { &mut new_heap };
                debug_assert_eq!(h.id(), hid);
                if key != h.key(node) {
                    log::debug!(
                        "Changing key for bb {} from {} to {}.",
                        dest,
                        h.key(node),
                        key
                    );
                    h.replace_key(node, key);
                }
            }
        }
    }

    Ok(new_heap)
}

/// Rotate the loop closed by `back_edge` so that the most frequent edge
/// leaving the loop departs from the trace tail. Returns the new tail.
/// The chain is temporarily circular on entry (the tail points back at the
/// loop header); the returned tail's `next` is cut to `None`.
fn rotate_loop(
    ctx: &mut PassContext,
    back_edge: EdgeId,
    trace_idx: usize,
    trace_no: u32,
) -> Result<BlockId, LayoutError> {
    let header = ctx.cfg.edge(back_edge).dest;

    // Best end of the loop after rotation. An edge is preferred when its
    // destination is unvisited or starts some trace: rotating there lets
    // the layout continue into fresh code.
    let mut best_bb: Option<BlockId> = None;
    let mut best_edge: Option<EdgeId> = None;
    let mut best_freq: i64 = -1;
    let mut best_count: i64 = -1;
    let mut is_preferred = false;

    let mut bb = header;
    loop {
        for e in ctx.cfg.succ_ids(bb) {
            let edge = ctx.cfg.edge(e);
            let dest = edge.dest;
            if dest == BlockId::EXIT
                || !edge.can_fallthru
                || edge.complex
            {
                continue;
            }
            if ctx.aux.get(dest).visited == trace_no {
                continue;
            }
            let dest_preferred = ctx.aux.get(dest).visited == 0
                || ctx.aux.get(dest).start_of_trace.is_some();
            let freq = ctx.cfg.edge_frequency(e) as i64;
            let count = edge.count as i64;
            if is_preferred {
                if dest_preferred && (freq > best_freq || count > best_count) {
                    best_freq = freq;
                    best_count = count;
                    best_edge = Some(e);
                    best_bb = Some(bb);
                }
            } else if dest_preferred {
                is_preferred = true;
                best_freq = freq;
                best_count = count;
                best_edge = Some(e);
                best_bb = Some(bb);
            } else if best_edge.is_none() || freq > best_freq || count > best_count {
                best_freq = freq;
                best_count = count;
                best_edge = Some(e);
                best_bb = Some(bb);
            }
        }
        bb = ctx.aux.get(bb).next.ok_or(LayoutError::BrokenChain(bb.0))?;
        if bb == header {
            break;
        }
    }

    let best_bb = match best_bb {
        Some(best) => {
            // Splice the chain so BEST_BB becomes the tail.
            if header == ctx.traces[trace_idx].first {
                ctx.traces[trace_idx].first =
                    ctx.aux.get(best).next.ok_or(LayoutError::BrokenChain(best.0))?;
            } else {
                let mut prev = ctx.traces[trace_idx].first;
                while ctx.aux.get(prev).next != Some(header) {
                    prev = ctx.aux.get(prev).next.ok_or(LayoutError::BrokenChain(prev.0))?;
                }
                let best_next = ctx.aux.get(best).next;
                ctx.aux.get_mut(prev).next = best_next;

                // The splice leaves PREV jumping to the loop header; if the
                // header is a small conditional-branch block, duplicating
                // it turns that unconditional jump into a fall-through.
                if ctx.cfg.block(prev).succs.len() == 1 {
                    let se = ctx.cfg.block(prev).succs[0];
                    let h = ctx.cfg.edge(se).dest;
                    if h.is_real() && ctx.cfg.ends_in_cond_jump(h) && copy_bb_p(ctx, h, false) {
                        copy_bb(ctx, h, se, prev, trace_no)?;
                    }
                }
            }
            best
        }
        // No suitable loop tail found; keep the original orientation.
        None => ctx.cfg.edge(back_edge).src,
    };
    ctx.aux.get_mut(best_bb).next = None;
    Ok(best_bb)
}

/// Mark BB as claimed by trace TRACE_NO and pull it out of whichever heap
/// still holds it.
fn mark_bb_visited(
    ctx: &mut PassContext,
    heap: &mut TraceHeap,
    new_heap: &mut TraceHeap,
    bb: BlockId,
    trace_no: u32,
) {
    let row = ctx.aux.get_mut(bb);
    row.visited = trace_no;
    if let (Some(hid), Some(node)) = (row.heap, row.node) {
        let h = if hid == heap.id() { heap } else { new_heap };
        debug_assert_eq!(h.id(), hid);
        h.delete(node);
        row.heap = None;
        row.node = None;
    }
}

/// Heap key of BB; smaller keys are extracted first.
///
/// Cold and never-executed blocks get a large positive key so they drain
/// last. Otherwise the key prefers blocks whose predecessor ends a trace
/// or closes a loop, then higher frequency.
fn bb_to_key(ctx: &PassContext, bb: BlockId) -> i64 {
    let block = ctx.cfg.block(bb);
    if block.partition == Partition::Cold || profile::probably_never_executed(ctx.cfg, block) {
        return crate::cfg::BB_FREQ_MAX as i64;
    }

    let mut priority: u64 = 0;
    for e in ctx.cfg.pred_ids(bb) {
        let edge = ctx.cfg.edge(e);
        let trace_end_pred = edge.src != BlockId::ENTRY
            && edge.src.is_real()
            && ctx.aux.get(edge.src).end_of_trace.is_some();
        if trace_end_pred || edge.dfs_back {
            priority = priority.max(ctx.cfg.edge_frequency(e));
        }
    }

    if priority > 0 {
        // A prioritized block must sort well before every plain one.
        -(100 * crate::cfg::BB_FREQ_MAX as i64 + 100 * priority as i64 + block.frequency as i64)
    } else {
        -(block.frequency as i64)
    }
}

/// Whether edge E out of BB beats the current best. Probability decides
/// outside a 10% slack band; inside it a lower-frequency destination wins,
/// then the natural-order successor. Under partitioning, a non-crossing
/// edge beats a crossing one that is otherwise no better.
fn better_edge_p(
    ctx: &PassContext,
    bb: BlockId,
    e: EdgeId,
    prob: u32,
    freq: u64,
    best_prob: i64,
    best_freq: i64,
    cur_best_edge: Option<EdgeId>,
) -> bool {
    let prob = prob as i64;
    let freq = freq as i64;
    let diff_prob = best_prob / 10;
    let diff_freq = best_freq / 10;

    let is_better = if prob > best_prob + diff_prob {
        true
    } else if prob < best_prob - diff_prob {
        false
    } else if freq < best_freq - diff_freq {
        // Equivalent probabilities; the higher-frequency destination has
        // another hot predecessor and some other trace will claim it.
        true
    } else if freq > best_freq + diff_freq {
        false
    } else {
        ctx.cfg.prev_block(ctx.cfg.edge(e).dest) == Some(bb)
    };

    if !is_better && ctx.opts.reorder_blocks_and_partition {
        if let Some(cur) = cur_best_edge {
            if ctx.cfg.edge(cur).crossing && !ctx.cfg.edge(e).crossing {
                return true;
            }
        }
    }
    is_better
}

/// Whether BB should wait for a later round: another round exists and the
/// block is cold under partitioning, or simply not hot enough yet.
fn push_to_next_round_p(
    ctx: &PassContext,
    bb: BlockId,
    round: usize,
    number_of_rounds: usize,
    exec_th: u64,
    count_th: u64,
) -> bool {
    let there_exists_another_round = round < number_of_rounds - 1;

    let block = ctx.cfg.block(bb);
    let cold_block = ctx.opts.reorder_blocks_and_partition
        && block.partition == Partition::Cold;

    let block_not_hot_enough = (block.frequency as u64) < exec_th
        || block.count < count_th
        || profile::probably_never_executed(ctx.cfg, block);

    there_exists_another_round && (cold_block || block_not_hot_enough)
}

/// Whether BB can and should be copied. `code_may_grow` lifts the size
/// limit from one jump's worth of bytes to eight, for hot blocks.
pub(crate) fn copy_bb_p(ctx: &PassContext, bb: BlockId, code_may_grow: bool) -> bool {
    let block = ctx.cfg.block(bb);
    if block.frequency == 0 {
        return false;
    }
    if block.preds.len() < 2 {
        return false;
    }
    if !ctx.cfg.can_duplicate_block(bb) {
        return false;
    }
    // Blocks with many successors make duplication explode downstream.
    if block.succs.len() > 8 {
        return false;
    }

    let mut max_size = ctx.uncond_jump_length as u64;
    if code_may_grow && profile::maybe_hot(ctx.cfg, block) {
        max_size *= 8;
    }

    let size: u64 = block
        .insns
        .iter()
        .filter(|i| i.is_executable())
        .map(|i| ctx.target.insn_length(i) as u64)
        .sum();
    if size <= max_size {
        return true;
    }

    log::debug!("Block {} can't be copied because its size = {}.", bb, size);
    false
}

/// Duplicate OLD_BB through edge E, splice the copy into the trace right
/// after AFTER, and mark it visited in TRACE_NO. Returns the copy.
pub(crate) fn copy_bb(
    ctx: &mut PassContext,
    old_bb: BlockId,
    e: EdgeId,
    after: BlockId,
    trace_no: u32,
) -> Result<BlockId, LayoutError> {
    let new_bb = ctx.cfg.duplicate_block(old_bb, e)?;
    if ctx.cfg.edge(e).dest != new_bb {
        return Err(LayoutError::RedirectMismatch {
            src: ctx.cfg.edge(e).src.0,
            dest: old_bb.0,
        });
    }
    ctx.aux.grow(ctx.cfg.n_blocks());
    if ctx.aux.get(new_bb).visited != 0 {
        return Err(LayoutError::DuplicateVisited { original: old_bb.0, copy: new_bb.0 });
    }
    log::debug!("Duplicated bb {} (created bb {})", old_bb, new_bb);
    {
        let after_next = ctx.aux.get(after).next;
        let row = ctx.aux.get_mut(new_bb);
        row.visited = trace_no;
        row.next = after_next;
    }
    ctx.aux.get_mut(after).next = Some(new_bb);
    Ok(new_bb)
}
