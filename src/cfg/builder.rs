//! CFG Construction Helper
//!
//! `CfgBuilder` assembles a weighted CFG from block and edge descriptions.
//! Integration tests and tools use it; production callers hand the pass a
//! CFG built by their own front end.

use anyhow::Result;

use super::insn::Insn;
use super::{BlockId, Cfg, EdgeId, ProfileKind, PROB_BASE};

pub struct CfgBuilder {
    cfg: Cfg,
}

impl CfgBuilder {
    pub fn new(profile: ProfileKind) -> Self {
        CfgBuilder { cfg: Cfg::new(profile) }
    }

    /// Append a block with the given weights to the natural order.
    pub fn block(&mut self, frequency: u32, count: u64) -> BlockId {
        self.cfg.add_block(frequency, count)
    }

    /// Append a block with weights and an instruction stream.
    pub fn block_with_insns(&mut self, frequency: u32, count: u64, insns: Vec<Insn>) -> BlockId {
        let id = self.cfg.add_block(frequency, count);
        self.cfg.block_mut(id).insns = insns;
        id
    }

    /// Plain edge; flags all cleared.
    pub fn edge(&mut self, src: BlockId, dest: BlockId, probability: u32, count: u64) -> EdgeId {
        self.cfg.make_edge(src, dest, probability, count)
    }

    /// Edge carrying the current fall-through out of `src`.
    pub fn fallthru_edge(
        &mut self,
        src: BlockId,
        dest: BlockId,
        probability: u32,
        count: u64,
    ) -> EdgeId {
        let e = self.cfg.make_edge(src, dest, probability, count);
        self.cfg.edge_mut(e).fallthru = true;
        e
    }

    /// Abnormal edge (EH, sibcall); layout never straightens it.
    pub fn complex_edge(
        &mut self,
        src: BlockId,
        dest: BlockId,
        probability: u32,
        count: u64,
    ) -> EdgeId {
        let e = self.cfg.make_edge(src, dest, probability, count);
        self.cfg.edge_mut(e).complex = true;
        e
    }

    pub fn entry_edge(&mut self, dest: BlockId) -> EdgeId {
        let e = self.cfg.make_edge(BlockId::ENTRY, dest, PROB_BASE, 0);
        self.cfg.edge_mut(e).fallthru = true;
        e
    }

    pub fn exit_edge(&mut self, src: BlockId, probability: u32, count: u64) -> EdgeId {
        self.cfg.make_edge(src, BlockId::EXIT, probability, count)
    }

    pub fn cfg_mut(&mut self) -> &mut Cfg {
        &mut self.cfg
    }

    /// Validate and hand over the finished graph.
    pub fn finish(self) -> Result<Cfg> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}
