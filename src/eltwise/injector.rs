//! `EltwiseInjector`: emits an activation function in place over vector registers.
//!
//! Usage from a kernel generator:
//!
//! ```text
//! let inj = EltwiseInjector::new(e, cfg)?;   // allocates the table label
//! inj.load_table_addr(e)?;                   // only when save_state is off
//! ... load data into v0..v3 ...
//! inj.compute_vector_range(e, 0..4)?;
//! ... store v0..v3, epilogue ...
//! inj.prepare_table(e)?;                     // emit the constant blob once
//! ```
//!
//! Each call runs preamble → passes → postamble:
//! - preamble: push the table register and aux GPRs, allocate the spill
//!   frame, save out-of-set scratch vectors and the predicate mask, load the
//!   table address (all only with `save_state`).
//! - passes: one per `PassPlan`; in-set scratch is spilled around the pass.
//! - postamble: the preamble undone in reverse.

use std::ops::Range;

use super::regs::{InjectorRegisterPlan, RegisterArena, ScratchScope};
use super::table::{ConstKey, ConstTableBuilder};
use super::{backward, forward, Direction, EltwiseAlg, EltwiseConfig};
use crate::compiler::codegen::simd_ops::{GReg, Label, MaskReg, MemOperand, SimdOps, VOperand, VReg};
use crate::compiler::codegen::target_desc::TargetDesc;
use crate::types::{JitError, JitResult};

/// Activation-function code generator bound to one kernel.
#[derive(Debug)]
pub struct EltwiseInjector {
    cfg: EltwiseConfig,
    target: TargetDesc,
    table: ConstTableBuilder,
    table_label: Label,
}

impl EltwiseInjector {
    /// Validate `cfg` for the emitter's target and lay out the constant table.
    pub fn new<E: SimdOps>(e: &mut E, cfg: EltwiseConfig) -> JitResult<Self> {
        if cfg.direction == Direction::Backward && !cfg.alg.info().backward {
            return Err(JitError::Unsupported(format!(
                "{:?} has no backward variant",
                cfg.alg
            )));
        }
        if cfg.use_dst && !cfg.alg.uses_dst() {
            return Err(JitError::InvalidConfig(format!(
                "{:?} cannot compute its derivative from the forward output",
                cfg.alg
            )));
        }
        if cfg.table_reg == GReg::RSP {
            return Err(JitError::InvalidConfig(
                "the stack pointer cannot hold the constant table".into(),
            ));
        }
        let target = e.target();
        let table = ConstTableBuilder::for_config(&cfg, target.simd_bytes());
        let table_label = e.alloc_label();
        Ok(EltwiseInjector {
            cfg,
            target,
            table,
            table_label,
        })
    }

    pub fn config(&self) -> &EltwiseConfig {
        &self.cfg
    }

    pub fn table(&self) -> &ConstTableBuilder {
        &self.table
    }

    /// Register plan `compute_vector_set(set)` would use.
    pub fn plan(&self, set: &[usize]) -> InjectorRegisterPlan {
        let set = normalize(set);
        RegisterArena::new(self.target, &set, self.cfg.aux_vecs_count()).plan(
            &set,
            self.cfg.aux_gprs_count(),
            self.cfg.table_reg,
            self.cfg.save_state,
        )
    }

    /// Point the table register at the constant table.
    pub fn load_table_addr<E: SimdOps>(&self, e: &mut E) -> JitResult<()> {
        e.lea_label(self.cfg.table_reg, self.table_label)
    }

    /// Emit the constant table. Call once per kernel, after the code.
    pub fn prepare_table<E: SimdOps>(&self, e: &mut E) -> JitResult<()> {
        e.emit_data(self.table_label, &self.table.words())
    }

    pub fn compute_vector<E: SimdOps>(&self, e: &mut E, idx: usize) -> JitResult<()> {
        self.compute_vector_set(e, &[idx])
    }

    pub fn compute_vector_range<E: SimdOps>(&self, e: &mut E, range: Range<usize>) -> JitResult<()> {
        let set: Vec<usize> = range.collect();
        self.compute_vector_set(e, &set)
    }

    /// Transform every register in `set` in place.
    pub fn compute_vector_set<E: SimdOps>(&self, e: &mut E, set: &[usize]) -> JitResult<()> {
        let set = normalize(set);
        if set.is_empty() {
            return Ok(());
        }
        let plan = self.plan(&set);
        let vlen = self.target.simd_bytes();
        log::debug!(
            "eltwise {:?} {:?}: {} regs from v{}, {} pass(es), tail at {}",
            self.cfg.alg,
            self.cfg.direction,
            set.len(),
            set[0],
            plan.passes.len(),
            plan.tail_start
        );

        if self.cfg.save_state {
            e.gpr_push(self.cfg.table_reg)?;
            for &g in &plan.preserved_gprs {
                e.gpr_push(g)?;
            }
        }
        if plan.frame_bytes > 0 {
            e.stack_alloc(plan.frame_bytes)?;
        }
        let outer = ScratchScope::acquire(e, &plan.outer_spill, plan.pred_slot(&self.target), vlen)?;
        if self.cfg.save_state {
            self.load_table_addr(e)?;
        }

        for pass in &plan.passes {
            let ctx = Ctx {
                cfg: &self.cfg,
                table: &self.table,
                target: self.target,
                aux: pass.aux(self.target.mask_kind),
                mask: pass.mask(self.target.mask_kind),
                gprs: &plan.preserved_gprs,
            };
            ScratchScope::with(e, &pass.spill, vlen, |e| {
                for &idx in &pass.compute {
                    self.compute_body(e, &ctx, VReg(idx as u8))?;
                }
                Ok(())
            })?;
        }

        outer.release(e)?;
        if plan.frame_bytes > 0 {
            e.stack_free(plan.frame_bytes)?;
        }
        if self.cfg.save_state {
            for &g in plan.preserved_gprs.iter().rev() {
                e.gpr_pop(g)?;
            }
            e.gpr_pop(self.cfg.table_reg)?;
        }
        Ok(())
    }

    fn compute_body<E: SimdOps>(&self, e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
        match self.cfg.direction {
            Direction::Forward => forward::emit(e, c, x)?,
            Direction::Backward => backward::emit(e, c, x)?,
        }
        if self.cfg.scale != 1.0 {
            e.vmul(x, x, c.t(ConstKey::Scale))?;
        }
        Ok(())
    }
}

fn normalize(set: &[usize]) -> Vec<usize> {
    let mut set = set.to_vec();
    set.sort_unstable();
    set.dedup();
    set
}

/// Registers and constants available to one pass of function emission.
pub(super) struct Ctx<'a> {
    pub cfg: &'a EltwiseConfig,
    table: &'a ConstTableBuilder,
    pub target: TargetDesc,
    aux: Vec<VReg>,
    pub mask: MaskReg,
    gprs: &'a [GReg],
}

impl Ctx<'_> {
    pub fn alg(&self) -> EltwiseAlg {
        self.cfg.alg.base()
    }

    /// Broadcast constant as a memory operand.
    pub fn t(&self, key: ConstKey) -> VOperand {
        self.ti(key, 0)
    }

    pub fn ti(&self, key: ConstKey, index: usize) -> VOperand {
        MemOperand::new(self.cfg.table_reg, self.off(key, index)).into()
    }

    /// Byte offset of a table entry.
    pub fn off(&self, key: ConstKey, index: usize) -> i32 {
        self.table.offset(key, index) as i32
    }

    pub fn table_reg(&self) -> GReg {
        self.cfg.table_reg
    }

    pub fn aux(&self, i: usize) -> VReg {
        match self.aux.get(i) {
            Some(&r) => r,
            None => panic!("{:?} uses aux vector {i} beyond its budget", self.cfg.alg),
        }
    }

    pub fn gpr(&self, i: usize) -> GReg {
        match self.gprs.get(i) {
            Some(&g) => g,
            None => panic!("{:?} uses aux GPR {i} beyond its budget", self.cfg.alg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::interp::Interpreter;
    use crate::compiler::codegen::target_desc::MaskKind;

    #[test]
    fn test_round_backward_rejected() {
        let mut e = Interpreter::new(TargetDesc::PORTABLE);
        let err = EltwiseInjector::new(&mut e, EltwiseConfig::new(EltwiseAlg::Round).backward());
        assert!(matches!(err, Err(JitError::Unsupported(_))));
    }

    #[test]
    fn test_use_dst_requires_dst_variant() {
        let mut e = Interpreter::new(TargetDesc::PORTABLE);
        let mut cfg = EltwiseConfig::new(EltwiseAlg::GeluTanh).backward();
        cfg.use_dst = true;
        assert!(matches!(
            EltwiseInjector::new(&mut e, cfg),
            Err(JitError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_plan_matches_budget() {
        let mut e = Interpreter::new(TargetDesc::portable(8, 16, MaskKind::Vector));
        let inj = EltwiseInjector::new(&mut e, EltwiseConfig::new(EltwiseAlg::Tanh)).unwrap();
        let p = inj.plan(&[3, 1, 2, 1]);
        assert_eq!(p.vecs_to_preserve, 5);
        assert_eq!(p.preserved_vec_idxs, vec![0, 4, 5, 6, 7]);
        assert_eq!(p.preserved_gprs.len(), 1);
        assert!(!p.is_split());
    }

    #[test]
    fn test_empty_set_emits_nothing() {
        let mut e = Interpreter::new(TargetDesc::PORTABLE);
        let inj = EltwiseInjector::new(&mut e, EltwiseConfig::new(EltwiseAlg::Exp)).unwrap();
        inj.compute_vector_set(&mut e, &[]).unwrap();
        assert!(e.is_empty());
    }
}
