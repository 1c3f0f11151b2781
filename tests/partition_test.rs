// Hot/cold partitioning and crossing-edge fix-up scenarios.
use bblayout::cfg::builder::CfgBuilder;
use bblayout::cfg::insn::{Cond, Insn, InsnKind, JumpTarget, NoteKind};
use bblayout::cfg::{BlockId, Cfg, Partition, ProfileKind};
use bblayout::error::LayoutError;
use bblayout::layout::{partition_hot_cold_basic_blocks, reorder_basic_blocks, LayoutOptions};
use bblayout::target::{TargetArch, TargetSpec};

/// Short conditional and unconditional branches: both rewrite phases run.
fn short_branch_target() -> TargetSpec {
    TargetSpec::for_arch(TargetArch::Arm64)
}

/// Diamond with a cold side: b0 branches to cold b2 or falls through to
/// hot b1; both rejoin at b3.
fn hot_cold_diamond() -> (Cfg, [BlockId; 4]) {
    let mut b = CfgBuilder::new(ProfileKind::Feedback);
    let b0 = b.block_with_insns(100, 100, vec![Insn::body(4)]);
    let b1 = b.block_with_insns(90, 90, vec![Insn::body(4)]);
    let b2 = b.block_with_insns(10, 0, vec![Insn::body(4)]);
    let b3 = b.block_with_insns(100, 100, vec![Insn::body(4), Insn::ret()]);
    let l2 = b.cfg_mut().block_label(b2);
    let l3 = b.cfg_mut().block_label(b3);
    b.cfg_mut()
        .block_mut(b0)
        .insns
        .push(Insn::cond_jump(Cond::Eq, JumpTarget::Label(l2)));
    b.cfg_mut().block_mut(b1).insns.push(Insn::jump(l3));
    b.entry_edge(b0);
    b.fallthru_edge(b0, b1, 9000, 90);
    b.edge(b0, b2, 1000, 5);
    b.edge(b1, b3, 10000, 90);
    b.fallthru_edge(b2, b3, 10000, 0);
    b.exit_edge(b3, 10000, 100);
    let cfg = b.finish().expect("bad cfg");
    (cfg, [b0, b1, b2, b3])
}

fn no_crossing_fallthru(cfg: &Cfg) -> bool {
    cfg.block_ids().into_iter().all(|bb| {
        cfg.succ_ids(bb)
            .iter()
            .all(|&e| !(cfg.edge(e).fallthru && cfg.edge(e).crossing))
    })
}

#[test]
fn diamond_cold_side_is_partitioned_and_fixed_up() {
    let (mut cfg, [b0, b1, b2, b3]) = hot_cold_diamond();
    let target = short_branch_target();

    let order = partition_hot_cold_basic_blocks(&mut cfg, &target).expect("partition failed");

    assert_eq!(cfg.block(b2).partition, Partition::Cold);
    for hot in [b0, b1, b3] {
        assert_eq!(cfg.block(hot).partition, Partition::Hot);
    }

    // A trampoline was synthesized for the crossing conditional.
    assert_eq!(cfg.n_blocks(), 5);
    let tramp = BlockId(4);
    assert_eq!(order, vec![b0, b1, b2, b3, tramp]);
    assert_eq!(cfg.block(tramp).partition, Partition::Hot);
    assert!(cfg.head_label(tramp).is_some());

    // b0's conditional now stays in the hot section.
    let taken = match &cfg.last_insn(b0).expect("b0 terminator").kind {
        InsnKind::CondJump { taken, .. } => *taken,
        other => panic!("b0 should still end in a conditional, got {:?}", other),
    };
    assert_eq!(taken, JumpTarget::Label(cfg.head_label(tramp).expect("tramp label")));

    // Crossing unconditional jumps were lowered to indirect jumps.
    for crossing_src in [tramp, b2] {
        let last = cfg.last_insn(crossing_src).expect("terminator");
        assert!(
            matches!(last.kind, InsnKind::IndirectJump(_)),
            "{} should end in an indirect jump, got {:?}",
            crossing_src,
            last.kind
        );
        assert!(last.crossing_note);
        assert!(
            cfg.block(crossing_src)
                .insns
                .iter()
                .any(|i| matches!(i.kind, InsnKind::Move { .. })),
            "the jump target must be materialized into a register"
        );
    }

    // b2's fall-through into b3 became an explicit jump with a detached
    // barrier, so no fall-through crosses the boundary.
    assert!(!cfg.block(b2).footer.is_empty());
    assert!(no_crossing_fallthru(&cfg));

    // The crossing edges are exactly trampoline->b2 and b2->b3.
    let mut crossing: Vec<(BlockId, BlockId)> = cfg
        .block_ids()
        .into_iter()
        .flat_map(|bb| cfg.succ_ids(bb))
        .filter(|&e| cfg.edge(e).crossing)
        .map(|e| (cfg.edge(e).src, cfg.edge(e).dest))
        .collect();
    crossing.sort_by_key(|(s, d)| (s.0, d.0));
    assert_eq!(crossing, vec![(b2, b3), (tramp, b2)]);
}

#[test]
fn reorder_after_partitioning_isolates_the_cold_chain() {
    let (mut cfg, [b0, b1, b2, b3]) = hot_cold_diamond();
    let target = short_branch_target();

    partition_hot_cold_basic_blocks(&mut cfg, &target).expect("partition failed");
    let tramp = BlockId(4);

    let opts = LayoutOptions { reorder_blocks_and_partition: true, optimize_size: false };
    let order = reorder_basic_blocks(&mut cfg, &target, &opts).expect("reorder failed");

    // Hot chain first, the cold block last, the trampoline in between.
    assert_eq!(order, vec![b0, b1, b3, tramp, b2]);

    // Cold blocks form one contiguous suffix.
    let first_cold = order
        .iter()
        .position(|&bb| cfg.block(bb).partition == Partition::Cold)
        .expect("no cold block");
    assert!(order[first_cold..]
        .iter()
        .all(|&bb| cfg.block(bb).partition == Partition::Cold));

    // The cold block carries the unlikely-executed section note.
    assert!(cfg
        .block(b2)
        .insns
        .iter()
        .any(|i| matches!(i.kind, InsnKind::Note(NoteKind::UnlikelyExecutedCode { .. }))));
    assert!(no_crossing_fallthru(&cfg));
}

#[test]
fn partition_fixup_is_idempotent() {
    let (mut cfg, _) = hot_cold_diamond();
    let target = short_branch_target();

    partition_hot_cold_basic_blocks(&mut cfg, &target).expect("first run failed");
    let snapshot = format!("{:?}", cfg);

    partition_hot_cold_basic_blocks(&mut cfg, &target).expect("second run failed");
    assert_eq!(format!("{:?}", cfg), snapshot);
}

#[test]
fn crossing_fallthru_is_inverted_when_the_conditional_can_swap_roles() {
    // b0 falls through to cold b2 but its conditional targets hot b1,
    // which is next in layout order: inverting the jump fixes the
    // crossing without new blocks.
    let mut b = CfgBuilder::new(ProfileKind::Feedback);
    let b0 = b.block_with_insns(100, 100, vec![Insn::body(4)]);
    let b1 = b.block_with_insns(95, 95, vec![Insn::body(4), Insn::ret()]);
    let b2 = b.block_with_insns(5, 0, vec![Insn::body(4), Insn::ret()]);
    let l1 = b.cfg_mut().block_label(b1);
    b.cfg_mut()
        .block_mut(b0)
        .insns
        .push(Insn::cond_jump(Cond::Eq, JumpTarget::Label(l1)));
    b.entry_edge(b0);
    let cond_edge = b.edge(b0, b1, 9500, 95);
    let ft_edge = b.fallthru_edge(b0, b2, 500, 0);
    b.exit_edge(b1, 10000, 95);
    b.exit_edge(b2, 10000, 0);
    // Long branches: only labeling and fall-through fixing run.
    let target = TargetSpec::for_arch(TargetArch::X86_64);
    let mut cfg = b.finish().expect("bad cfg");

    let order = partition_hot_cold_basic_blocks(&mut cfg, &target).expect("partition failed");

    // No block was added; the jump was inverted instead.
    assert_eq!(cfg.n_blocks(), 3);
    assert_eq!(order, vec![b0, b1, b2]);
    match &cfg.last_insn(b0).expect("terminator").kind {
        InsnKind::CondJump { cond, taken } => {
            assert_eq!(*cond, Cond::Ne);
            assert_eq!(*taken, JumpTarget::Label(cfg.head_label(b2).expect("b2 label")));
        }
        other => panic!("expected a conditional jump, got {:?}", other),
    }
    // Roles swapped: the conditional edge now falls through and the old
    // fall-through is the crossing taken branch.
    assert!(cfg.edge(cond_edge).fallthru);
    assert!(!cfg.edge(cond_edge).crossing);
    assert!(!cfg.edge(ft_edge).fallthru);
    assert!(cfg.edge(ft_edge).crossing);
    // The note pass observed the post-inversion state.
    assert!(cfg.last_insn(b0).expect("terminator").crossing_note);
    assert!(no_crossing_fallthru(&cfg));
}

#[test]
fn doubly_crossing_block_gets_a_forced_fallthru_break() {
    // Both ways out of b0 are cold: the fall-through must be routed over a
    // fresh hot block that jumps across.
    let mut b = CfgBuilder::new(ProfileKind::Feedback);
    let b0 = b.block_with_insns(100, 100, vec![Insn::body(4)]);
    let b1 = b.block_with_insns(5, 0, vec![Insn::body(4), Insn::ret()]);
    let b2 = b.block_with_insns(5, 0, vec![Insn::body(4), Insn::ret()]);
    let l1 = b.cfg_mut().block_label(b1);
    b.cfg_mut()
        .block_mut(b0)
        .insns
        .push(Insn::cond_jump(Cond::Gt, JumpTarget::Label(l1)));
    b.entry_edge(b0);
    b.edge(b0, b1, 5000, 0);
    let ft = b.fallthru_edge(b0, b2, 5000, 0);
    b.exit_edge(b1, 10000, 0);
    b.exit_edge(b2, 10000, 0);
    let target = TargetSpec::for_arch(TargetArch::X86_64);
    let mut cfg = b.finish().expect("bad cfg");

    let order = partition_hot_cold_basic_blocks(&mut cfg, &target).expect("partition failed");

    assert_eq!(cfg.n_blocks(), 4);
    let forced = BlockId(3);
    // The fresh block sits right after its source, in the hot partition.
    assert_eq!(order, vec![b0, forced, b1, b2]);
    assert_eq!(cfg.block(forced).partition, Partition::Hot);
    assert!(!cfg.block(forced).footer.is_empty());
    // The old fall-through edge became the fresh block's crossing jump.
    assert_eq!(cfg.edge(ft).src, forced);
    assert_eq!(cfg.edge(ft).dest, b2);
    assert!(cfg.edge(ft).crossing);
    assert!(!cfg.edge(ft).fallthru);
    assert!(matches!(
        cfg.last_insn(forced).expect("terminator").kind,
        InsnKind::Jump(_)
    ));
    assert!(no_crossing_fallthru(&cfg));
}

#[test]
fn crossing_conditionals_share_one_trampoline() {
    // Two hot conditionals target the same cold block; the second reuses
    // the trampoline the first created.
    let mut b = CfgBuilder::new(ProfileKind::Feedback);
    let b0 = b.block_with_insns(100, 100, vec![Insn::body(4)]);
    let b1 = b.block_with_insns(90, 90, vec![Insn::body(4)]);
    let b2 = b.block_with_insns(80, 80, vec![Insn::body(4), Insn::ret()]);
    let b3 = b.block_with_insns(5, 0, vec![Insn::body(4), Insn::ret()]);
    let l3 = b.cfg_mut().block_label(b3);
    b.cfg_mut()
        .block_mut(b0)
        .insns
        .push(Insn::cond_jump(Cond::Eq, JumpTarget::Label(l3)));
    b.cfg_mut()
        .block_mut(b1)
        .insns
        .push(Insn::cond_jump(Cond::Lt, JumpTarget::Label(l3)));
    b.entry_edge(b0);
    b.fallthru_edge(b0, b1, 9000, 90);
    b.edge(b0, b3, 1000, 0);
    b.fallthru_edge(b1, b2, 9000, 80);
    b.edge(b1, b3, 1000, 0);
    b.exit_edge(b2, 10000, 80);
    b.exit_edge(b3, 10000, 0);
    // Short conditional branches, long unconditional ones: trampolines
    // keep their direct jumps.
    let target = TargetSpec::for_arch(TargetArch::PowerPC);
    let mut cfg = b.finish().expect("bad cfg");

    partition_hot_cold_basic_blocks(&mut cfg, &target).expect("partition failed");

    // One trampoline serves both conditionals.
    assert_eq!(cfg.n_blocks(), 5);
    let tramp = BlockId(4);
    let mut tramp_preds: Vec<BlockId> = cfg
        .block(tramp)
        .preds
        .iter()
        .map(|&e| cfg.edge(e).src)
        .collect();
    tramp_preds.sort_by_key(|b| b.0);
    assert_eq!(tramp_preds, vec![b0, b1]);
    // With long unconditional branches the trampoline keeps a direct jump.
    assert!(matches!(
        cfg.last_insn(tramp).expect("terminator").kind,
        InsnKind::Jump(_)
    ));
    assert!(no_crossing_fallthru(&cfg));
}

#[test]
fn mismatched_conditional_shape_is_fatal() {
    // The crossing edge says b0 branches to cold b2, but the jump targets
    // b1: the CFG is corrupt and the pass must say so.
    let mut b = CfgBuilder::new(ProfileKind::Feedback);
    let b0 = b.block_with_insns(100, 100, vec![Insn::body(4)]);
    let b1 = b.block_with_insns(95, 95, vec![Insn::body(4), Insn::ret()]);
    let b2 = b.block_with_insns(5, 0, vec![Insn::body(4), Insn::ret()]);
    let l1 = b.cfg_mut().block_label(b1);
    b.cfg_mut()
        .block_mut(b0)
        .insns
        .push(Insn::cond_jump(Cond::Eq, JumpTarget::Label(l1)));
    b.entry_edge(b0);
    b.fallthru_edge(b0, b1, 9500, 95);
    b.edge(b0, b2, 500, 0);
    b.exit_edge(b1, 10000, 95);
    b.exit_edge(b2, 10000, 0);
    let target = short_branch_target();
    let mut cfg = b.finish().expect("bad cfg");

    let result = partition_hot_cold_basic_blocks(&mut cfg, &target);
    assert_eq!(result, Err(LayoutError::MalformedJump(b0.0)));
    // Layout mode is released even on the error path.
    assert!(!cfg.in_layout_mode());
}

#[test]
fn jumpless_block_with_two_successors_is_fatal() {
    let mut b = CfgBuilder::new(ProfileKind::Feedback);
    let b0 = b.block_with_insns(100, 100, vec![Insn::body(4)]);
    let b1 = b.block_with_insns(95, 95, vec![Insn::body(4), Insn::ret()]);
    let b2 = b.block_with_insns(5, 0, vec![Insn::body(4), Insn::ret()]);
    b.entry_edge(b0);
    b.fallthru_edge(b0, b1, 9500, 95);
    b.edge(b0, b2, 500, 0);
    b.exit_edge(b1, 10000, 95);
    b.exit_edge(b2, 10000, 0);
    let target = short_branch_target();
    let mut cfg = b.finish().expect("bad cfg");

    let result = partition_hot_cold_basic_blocks(&mut cfg, &target);
    assert_eq!(result, Err(LayoutError::AmbiguousFallThru(b0.0, 2)));
    assert!(!cfg.in_layout_mode());
}

#[test]
fn all_cold_procedure_reorders_in_the_final_round() {
    // Every block is cold: there is no hot chain, but the last round still
    // consumes everything and the layout covers all blocks.
    let mut b = CfgBuilder::new(ProfileKind::Feedback);
    let b0 = b.block_with_insns(1, 0, vec![Insn::body(4)]);
    let b1 = b.block_with_insns(1, 0, vec![Insn::body(4)]);
    let b2 = b.block_with_insns(1, 0, vec![Insn::body(4)]);
    b.entry_edge(b0);
    b.fallthru_edge(b0, b1, 10000, 0);
    b.fallthru_edge(b1, b2, 10000, 0);
    b.exit_edge(b2, 10000, 0);
    let target = short_branch_target();
    let mut cfg = b.finish().expect("bad cfg");

    partition_hot_cold_basic_blocks(&mut cfg, &target).expect("partition failed");
    assert!(cfg
        .block_ids()
        .into_iter()
        .all(|bb| cfg.block(bb).partition == Partition::Cold));

    let opts = LayoutOptions { reorder_blocks_and_partition: true, optimize_size: false };
    let order = reorder_basic_blocks(&mut cfg, &target, &opts).expect("reorder failed");
    assert_eq!(order, vec![b0, b1, b2]);
}
