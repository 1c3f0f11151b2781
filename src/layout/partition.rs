//! Hot/Cold Partitioning and Crossing-Edge Fix-Up
//!
//! Classifies blocks into hot and cold partitions, collects the edges that
//! cross between them, and rewrites the CFG so that every cross-partition
//! transfer is legal once the two partitions land in separate output
//! sections:
//!
//! 1. every crossing destination gets a label, and crossing fall-throughs
//!    out of jump-less blocks become explicit unconditional jumps;
//! 2. remaining crossing fall-throughs (out of conditional-jump blocks)
//!    are removed by inverting the conditional or by routing the
//!    fall-through over a fresh same-partition block;
//! 3. on targets without long conditional branches, crossing conditionals
//!    are retargeted at a same-partition trampoline that jumps on;
//! 4. on targets without long unconditional branches, crossing direct
//!    jumps are lowered to indirect jumps through a fresh register;
//! 5. every remaining crossing jump is annotated for downstream passes.

use crate::cfg::insn::{Insn, InsnKind, JumpTarget, NoteKind, Operand};
use crate::cfg::{BlockId, Cfg, EdgeId, Partition, PROB_BASE};
use crate::error::LayoutError;
use crate::profile;
use crate::target::TargetSpec;

use super::aux::AuxTable;

/// Assign every block a partition and collect all crossing edges, marking
/// them on the way. Edges touching ENTRY or EXIT never cross.
pub(crate) fn find_rarely_executed_basic_blocks_and_crossing_edges(cfg: &mut Cfg) -> Vec<EdgeId> {
    for bb in cfg.block_ids() {
        let cold = profile::probably_never_executed(cfg, cfg.block(bb));
        cfg.block_mut(bb).partition = if cold { Partition::Cold } else { Partition::Hot };
    }

    let mut crossing = Vec::with_capacity(2 * cfg.n_blocks());
    for bb in cfg.block_ids() {
        for e in cfg.succ_ids(bb) {
            let edge = cfg.edge(e);
            let crosses = edge.src.is_real()
                && edge.dest.is_real()
                && cfg.block(edge.src).partition != cfg.block(edge.dest).partition;
            cfg.edge_mut(e).crossing = crosses;
            if crosses {
                crossing.push(e);
            }
        }
    }
    crossing
}

/// Run the fix-up phases, in their mandatory order.
pub(crate) fn fix_edges_for_rarely_executed_code(
    cfg: &mut Cfg,
    aux: &mut AuxTable,
    target: &TargetSpec,
    crossing_edges: &[EdgeId],
) -> Result<(), LayoutError> {
    add_labels_and_missing_jumps(cfg, crossing_edges)?;
    fix_up_fall_thru_edges(cfg, aux)?;
    if !target.has_long_cond_branch {
        fix_crossing_conditional_branches(cfg, aux)?;
    }
    if !target.has_long_uncond_branch {
        fix_crossing_unconditional_branches(cfg)?;
        cfg.recount_regs();
    }
    add_reg_crossing_jump_notes(cfg);
    Ok(())
}

/// Give every crossing destination a label, and end every jump-less
/// crossing source with an explicit unconditional jump (plus a detached
/// barrier), clearing its fall-through flag.
fn add_labels_and_missing_jumps(cfg: &mut Cfg, crossing_edges: &[EdgeId]) -> Result<(), LayoutError> {
    for &e in crossing_edges {
        let src = cfg.edge(e).src;
        let dest = cfg.edge(e).dest;
        if !src.is_real() || !dest.is_real() {
            continue;
        }
        let label = cfg.block_label(dest);

        if cfg.ends_in_jump(src) {
            continue;
        }
        // The source just falls through.
        let n_succ = cfg.block(src).succs.len();
        if n_succ != 1 {
            // Two ways out but no jump at the tail: the CFG is corrupt.
            return Err(LayoutError::AmbiguousFallThru(src.0, n_succ));
        }
        let block = cfg.block_mut(src);
        block.insns.push(Insn::jump(label));
        block.footer.push(Insn::new(InsnKind::Barrier));
        cfg.edge_mut(e).fallthru = false;
    }
    Ok(())
}

/// Remove crossing fall-through edges out of conditional-jump blocks:
/// invert the conditional when its non-crossing side can take over the
/// fall-through role, otherwise break the fall-through over a fresh block
/// in the source's partition.
fn fix_up_fall_thru_edges(cfg: &mut Cfg, aux: &mut AuxTable) -> Result<(), LayoutError> {
    for cur in cfg.block_ids() {
        let succs = cfg.succ_ids(cur);
        let succ1 = succs.first().copied();
        let succ2 = succs.get(1).copied();

        let (fall_thru, cond_jump) = if succ1.is_some_and(|e| cfg.edge(e).fallthru) {
            (succ1, succ2)
        } else if succ2.is_some_and(|e| cfg.edge(e).fallthru) {
            (succ2, succ1)
        } else {
            (None, None)
        };
        let Some(ft) = fall_thru else { continue };
        if !cfg.edge(ft).dest.is_real() || !cfg.edge(ft).crossing {
            continue;
        }

        let mut cond_jump_crosses = true;
        let mut invert_worked = false;

        if let Some(cj) = cond_jump {
            if !cfg.edge(cj).crossing {
                cond_jump_crosses = false;
            }
            // The fall-through crosses but the conditional does not; if the
            // conditional's destination is the next block in layout order,
            // inverting the jump swaps their roles.
            if !cond_jump_crosses && aux.get(cur).next == Some(cfg.edge(cj).dest) {
                let ft_label = cfg.block_label(cfg.edge(ft).dest);
                invert_worked = cfg.invert_jump(cur, ft_label);
                if invert_worked {
                    cfg.edge_mut(ft).fallthru = false;
                    cfg.edge_mut(cj).fallthru = true;
                    // The old fall-through is now the taken, crossing side.
                    cfg.edge_mut(ft).crossing = true;
                    cfg.edge_mut(cj).crossing = false;
                }
            }
        }

        if cond_jump_crosses || !invert_worked {
            // Both ways out cross; break the fall-through over a fresh
            // block placed right after the source, in its partition.
            match cfg.force_nonfallthru(ft)? {
                Some(new_bb) => {
                    aux.grow(cfg.n_blocks());
                    let cur_next = aux.get(cur).next;
                    aux.get_mut(new_bb).next = cur_next;
                    aux.get_mut(cur).next = Some(new_bb);

                    let partition = cfg.block(cur).partition;
                    cfg.block_mut(new_bb).partition = partition;
                    let jump_edge = cfg.block(new_bb).succs[0];
                    cfg.edge_mut(jump_edge).crossing = true;
                    cfg.block_mut(new_bb).footer.push(Insn::new(InsnKind::Barrier));
                }
                None => {
                    cfg.block_mut(cur).footer.push(Insn::new(InsnKind::Barrier));
                }
            }
        }
    }
    Ok(())
}

/// A crossing predecessor of `jump_dest` that consists of a label and a
/// single unconditional jump, usable as a shared trampoline.
fn find_jump_block(cfg: &Cfg, jump_dest: BlockId) -> Option<BlockId> {
    for e in cfg.pred_ids(jump_dest) {
        if !cfg.edge(e).crossing {
            continue;
        }
        let src = cfg.edge(e).src;
        if !src.is_real() || cfg.head_label(src).is_none() {
            continue;
        }
        let mut execs = cfg.block(src).insns.iter().filter(|i| i.is_executable());
        match (execs.next(), execs.next()) {
            (Some(only), None) if only.is_simple_jump() => return Some(src),
            _ => {}
        }
    }
    None
}

/// Retarget every crossing conditional branch at a same-partition
/// trampoline holding just an unconditional jump (or a return, when the
/// original target was the function return) to the original destination.
fn fix_crossing_conditional_branches(cfg: &mut Cfg, aux: &mut AuxTable) -> Result<(), LayoutError> {
    let Some(mut last_bb) = cfg.last_block() else { return Ok(()) };

    for cur in cfg.block_ids() {
        let succs = cfg.succ_ids(cur);
        // Fall-throughs were dealt with above, so at most one of the two
        // outgoing edges still crosses.
        let Some(ce) = succs.iter().take(2).copied().find(|&e| cfg.edge(e).crossing) else {
            continue;
        };
        let Some(last) = cfg.last_insn(cur) else { continue };
        let InsnKind::CondJump { taken, .. } = last.kind.clone() else { continue };
        let dest = cfg.edge(ce).dest;

        // The taken target and the crossing edge must agree.
        if let JumpTarget::Label(l) = taken {
            if cfg.head_label(dest) != Some(l) {
                return Err(LayoutError::MalformedJump(cur.0));
            }
        }

        let (new_bb, new_label) = match find_jump_block(cfg, dest) {
            Some(b) => {
                let l = cfg.block_label(b);
                (b, l)
            }
            None => {
                let nb = cfg.create_basic_block(last_bb);
                aux.grow(cfg.n_blocks());
                let after_last = aux.get(last_bb).next;
                aux.get_mut(nb).next = after_last;
                aux.get_mut(last_bb).next = Some(nb);
                let prev_bb = last_bb;
                last_bb = nb;

                // Keep liveness information alive on the new block.
                let live = cfg.block(prev_bb).live_at_end.clone();
                {
                    let b = cfg.block_mut(nb);
                    b.live_at_start = live.clone();
                    b.live_at_end = live;
                }
                let l = cfg.block_label(nb);
                let freq = cfg.edge_frequency(ce).min(crate::cfg::BB_FREQ_MAX as u64) as u32;
                let count = cfg.edge(ce).count;
                let partition = cfg.block(cur).partition;
                {
                    let b = cfg.block_mut(nb);
                    match taken {
                        JumpTarget::Label(old_label) => b.insns.push(Insn::jump(old_label)),
                        JumpTarget::Return => b.insns.push(Insn::ret()),
                    }
                    b.footer.push(Insn::new(InsnKind::Barrier));
                    b.partition = partition;
                    b.frequency = freq;
                    b.count = count;
                }
                (nb, l)
            }
        };

        if !cfg.redirect_jump(cur, new_label) {
            return Err(LayoutError::MalformedJump(cur.0));
        }
        cfg.redirect_edge_succ(ce, new_bb);

        let new_edge = match cfg.block(new_bb).succs.first() {
            Some(&e) => e,
            None => {
                let count = cfg.edge(ce).count;
                let e = cfg.make_edge(new_bb, dest, PROB_BASE, count);
                cfg.edge_mut(e).can_fallthru = true;
                e
            }
        };
        cfg.edge_mut(ce).crossing = false;
        cfg.edge_mut(new_edge).crossing = true;
    }
    Ok(())
}

/// Lower every crossing unconditional direct jump to an indirect jump
/// through a fresh register, for targets whose direct branches cannot span
/// sections.
fn fix_crossing_unconditional_branches(cfg: &mut Cfg) -> Result<(), LayoutError> {
    for cur in cfg.block_ids() {
        let Some(&succ) = cfg.block(cur).succs.first() else { continue };
        if !cfg.edge(succ).crossing {
            continue;
        }
        let Some(last) = cfg.last_insn(cur) else { continue };
        if !last.is_jump() {
            continue;
        }
        // No crossing jump may still be conditional at this point.
        if last.is_cond_jump() {
            return Err(LayoutError::CrossingConditional(cur.0));
        }
        if last.is_computed_jump() || last.is_table_jump() {
            continue;
        }
        let InsnKind::Jump(label) = last.kind.clone() else { continue };

        let reg = cfg.new_reg();
        let block = cfg.block_mut(cur);
        block.insns.pop();
        block.insns.push(Insn::new(InsnKind::Move {
            dest: reg,
            src: Operand::LabelAddr(label),
        }));
        block.insns.push(Insn::new(InsnKind::IndirectJump(reg)));
    }
    Ok(())
}

/// Annotate every crossing jump for downstream passes.
fn add_reg_crossing_jump_notes(cfg: &mut Cfg) {
    for bb in cfg.block_ids() {
        let crosses = cfg.succ_ids(bb).iter().any(|&e| cfg.edge(e).crossing);
        if crosses && cfg.ends_in_jump(bb) {
            if let Some(last) = cfg.block_mut(bb).insns.last_mut() {
                last.crossing_note = true;
            }
        }
    }
}

/// Mark every cold block for the unlikely-to-be-executed output section.
pub(crate) fn add_unlikely_executed_notes(cfg: &mut Cfg) {
    for bb in cfg.block_ids() {
        if cfg.block(bb).partition == Partition::Cold {
            mark_bb_for_unlikely_executed_section(cfg, bb);
        }
    }
}

/// Insert the unlikely-executed note before the first instruction that is
/// neither a note nor a label (after the tail when the block has nothing
/// else). Re-marking an already-marked block changes nothing.
fn mark_bb_for_unlikely_executed_section(cfg: &mut Cfg, bb: BlockId) {
    let block = cfg.block_mut(bb);
    if block
        .insns
        .iter()
        .any(|i| matches!(i.kind, InsnKind::Note(NoteKind::UnlikelyExecutedCode { .. })))
    {
        return;
    }
    let note = Insn::new(InsnKind::Note(NoteKind::UnlikelyExecutedCode { block: bb }));
    match block.insns.iter().position(|i| !i.is_note() && !i.is_label()) {
        Some(at) => block.insns.insert(at, note),
        None => block.insns.push(note),
    }
}
