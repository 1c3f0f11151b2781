//! Trace Connection
//!
//! Stitches the traces found by trace formation into one linear chain.
//! Each unconnected trace first grows a prefix of traces that fall through
//! into it, then a suffix of traces its tail falls through into. When no
//! direct edge continues the chain, a single intermediary block sitting
//! between the tail and the head of another trace may be duplicated to
//! preserve fall-through.
//!
//! Under partitioning, cold traces are held back until every hot trace is
//! placed, then connected among themselves; connection by duplication is
//! disabled so no block silently changes section.

use bitvec::prelude::*;

use crate::cfg::{BlockId, EdgeId, Partition};
use crate::error::LayoutError;

use super::trace::{copy_bb, copy_bb_p};
use super::{scaled_count, PassContext, DUPLICATION_THRESHOLD};

pub(crate) fn connect_traces(ctx: &mut PassContext) -> Result<(), LayoutError> {
    let n_traces = ctx.traces.len();
    if n_traces == 0 {
        return Ok(());
    }

    let freq_threshold =
        ctx.max_entry_frequency as u64 * DUPLICATION_THRESHOLD as u64 / 1000;
    let count_threshold = scaled_count(ctx.max_entry_count, DUPLICATION_THRESHOLD);

    let mut connected: BitVec<u32> = bitvec![u32, Lsb0; 0; n_traces];
    let mut cold_traces: BitVec<u32> = bitvec![u32, Lsb0; 0; n_traces];
    let mut cold_connected = true;
    let mut unconnected_hot: usize = 0;

    // Hold cold traces back so the hot chain forms first; they are
    // released once every hot trace is placed.
    if ctx.opts.reorder_blocks_and_partition {
        for t in 0..n_traces {
            if ctx.cfg.block(ctx.traces[t].first).partition == Partition::Cold {
                connected.set(t, true);
                cold_traces.set(t, true);
                cold_connected = false;
            } else {
                unconnected_hot += 1;
            }
        }
    }

    let mut last_trace: Option<usize> = None;
    let mut i: usize = 0;
    while i < n_traces || !cold_connected {
        if ctx.opts.reorder_blocks_and_partition
            && (i >= n_traces || unconnected_hot == 0)
            && !cold_connected
        {
            // All hot traces are in; release the cold ones and restart at
            // the first of them.
            let mut first_cold = None;
            for j in 0..n_traces {
                if cold_traces[j] {
                    connected.set(j, false);
                    if first_cold.is_none() {
                        first_cold = Some(j);
                    }
                }
            }
            cold_connected = true;
            match first_cold {
                Some(f) => i = f,
                None => break,
            }
        }
        debug_assert!(i < n_traces);

        let t = i;
        if connected[t] {
            i += 1;
            continue;
        }
        connected.set(t, true);
        unconnected_hot = unconnected_hot.saturating_sub(1);

        // Predecessor walk: pull in traces whose tails fall through into
        // the head of the chain built so far.
        let mut t2 = t;
        while t2 > 0 {
            let head = ctx.traces[t2].first;
            let mut best: Option<EdgeId> = None;
            let mut best_len: usize = 0;
            for e in ctx.cfg.pred_ids(head) {
                let edge = ctx.cfg.edge(e);
                if edge.src == BlockId::ENTRY || !edge.src.is_real() {
                    continue;
                }
                if !edge.can_fallthru || edge.complex {
                    continue;
                }
                let Some(et) = ctx.aux.get(edge.src).end_of_trace else {
                    continue;
                };
                if connected[et] {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some(b) => {
                        let bp = ctx.cfg.edge(b).probability;
                        edge.probability > bp
                            || (edge.probability == bp && ctx.traces[et].length > best_len)
                    }
                };
                if better {
                    best = Some(e);
                    best_len = ctx.traces[et].length;
                }
            }
            let Some(b) = best else { break };
            let src = ctx.cfg.edge(b).src;
            let dest = ctx.cfg.edge(b).dest;
            ctx.aux.get_mut(src).next = Some(dest);
            log::debug!("Connection: {} {}", src, dest);
            let Some(et) = ctx.aux.get(src).end_of_trace else { break };
            t2 = et;
            connected.set(t2, true);
            unconnected_hot = unconnected_hot.saturating_sub(1);
        }

        if let Some(lt) = last_trace {
            let tail = ctx.traces[lt].last;
            let head = ctx.traces[t2].first;
            ctx.aux.get_mut(tail).next = Some(head);
        }
        last_trace = Some(t);

        // Successor walk: extend the chain from the tail of T, directly or
        // by duplicating one intermediary block.
        let mut t_cur = t;
        loop {
            let tail = ctx.traces[t_cur].last;

            let mut best: Option<EdgeId> = None;
            let mut best_len: usize = 0;
            for e in ctx.cfg.succ_ids(tail) {
                let edge = ctx.cfg.edge(e);
                let dest = edge.dest;
                if dest == BlockId::EXIT || !edge.can_fallthru || edge.complex {
                    continue;
                }
                let Some(st) = ctx.aux.get(dest).start_of_trace else {
                    continue;
                };
                if connected[st] {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some(b) => {
                        let bp = ctx.cfg.edge(b).probability;
                        edge.probability > bp
                            || (edge.probability == bp && ctx.traces[st].length > best_len)
                    }
                };
                if better {
                    best = Some(e);
                    best_len = ctx.traces[st].length;
                }
            }

            if let Some(b) = best {
                let src = ctx.cfg.edge(b).src;
                let dest = ctx.cfg.edge(b).dest;
                log::debug!("Connection: {} {}", src, dest);
                let Some(st) = ctx.aux.get(dest).start_of_trace else { break };
                let head = ctx.traces[st].first;
                ctx.aux.get_mut(tail).next = Some(head);
                connected.set(st, true);
                unconnected_hot = unconnected_hot.saturating_sub(1);
                last_trace = Some(st);
                t_cur = st;
                continue;
            }

            // No direct continuation; look for tail -> X -> head-of-trace
            // and duplicate X.
            let mut best: Option<EdgeId> = None;
            let mut best2: Option<EdgeId> = None;
            let mut best2_len: i64 = 0;
            let mut next_bb: Option<BlockId> = None;
            let mut try_copy = false;
            for e in ctx.cfg.succ_ids(tail) {
                let edge = ctx.cfg.edge(e);
                let dest = edge.dest;
                if dest == BlockId::EXIT || !edge.can_fallthru || edge.complex {
                    continue;
                }
                let beats = match best {
                    None => true,
                    Some(b) => edge.probability > ctx.cfg.edge(b).probability,
                };
                if !beats {
                    continue;
                }

                // A one-block trace needs no bridge; take it directly.
                if let Some(st) = ctx.aux.get(dest).start_of_trace {
                    if ctx.traces[st].length == 1 {
                        best = Some(e);
                        try_copy = true;
                        continue;
                    }
                }

                for e2id in ctx.cfg.succ_ids(dest) {
                    let e2 = ctx.cfg.edge(e2id);
                    let d2 = e2.dest;
                    let acceptable = if d2 == BlockId::EXIT {
                        true
                    } else if !e2.can_fallthru || e2.complex {
                        false
                    } else {
                        match ctx.aux.get(d2).start_of_trace {
                            Some(st2) if !connected[st2] => {
                                ctx.cfg.edge_frequency(e2id) >= freq_threshold
                                    && e2.count >= count_threshold
                                    && match best2 {
                                        None => true,
                                        Some(b2) => {
                                            let b2p = ctx.cfg.edge(b2).probability;
                                            e2.probability > b2p
                                                || (e2.probability == b2p
                                                    && (ctx.traces[st2].length as i64)
                                                        > best2_len)
                                        }
                                    }
                            }
                            _ => false,
                        }
                    };
                    if acceptable {
                        best = Some(e);
                        best2 = Some(e2id);
                        best2_len = if d2 != BlockId::EXIT {
                            ctx.aux
                                .get(d2)
                                .start_of_trace
                                .map_or(0, |st2| ctx.traces[st2].length as i64)
                        } else {
                            i64::MAX
                        };
                        next_bb = Some(d2);
                        try_copy = true;
                    }
                }
            }

            if ctx.opts.reorder_blocks_and_partition {
                try_copy = false;
            }

            let Some(b) = best.filter(|_| try_copy) else { break };
            // Tiny blocks are always copied; larger ones only when the
            // edge is traversed frequently enough.
            let may_grow = !ctx.opts.optimize_size
                && ctx.cfg.edge_frequency(b) >= freq_threshold
                && ctx.cfg.edge(b).count >= count_threshold;
            let bdest = ctx.cfg.edge(b).dest;
            if !copy_bb_p(ctx, bdest, may_grow) {
                break;
            }

            if log::log_enabled!(log::Level::Debug) {
                match next_bb {
                    None => log::debug!("Connection: {} {}", tail, bdest),
                    Some(BlockId::EXIT) => {
                        log::debug!("Connection: {} {} exit", tail, bdest)
                    }
                    Some(nb) => log::debug!("Connection: {} {} {}", tail, bdest, nb),
                }
            }

            let new_bb = copy_bb(ctx, bdest, b, tail, (t_cur + 1) as u32)?;
            ctx.traces[t_cur].last = new_bb;
            match next_bb {
                Some(nb) if nb != BlockId::EXIT => {
                    let Some(st) = ctx.aux.get(nb).start_of_trace else { break };
                    let head = ctx.traces[st].first;
                    ctx.aux.get_mut(new_bb).next = Some(head);
                    connected.set(st, true);
                    unconnected_hot = unconnected_hot.saturating_sub(1);
                    last_trace = Some(st);
                    t_cur = st;
                }
                _ => break,
            }
        }

        i += 1;
    }

    if log::log_enabled!(log::Level::Debug) {
        let mut line = String::new();
        let mut bb = Some(ctx.traces[0].first);
        let mut left = ctx.cfg.n_blocks() + 1;
        while let Some(b) = bb {
            line.push_str(&format!("{} ", b));
            bb = ctx.aux.get(b).next;
            left -= 1;
            if left == 0 {
                break;
            }
        }
        log::debug!("Final order: {}", line.trim_end());
    }
    Ok(())
}
