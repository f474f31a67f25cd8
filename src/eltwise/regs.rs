//! Scratch-register negotiation for the injector.
//!
//! The injector transforms a caller-chosen set of vector registers in place
//! and needs a fixed number of scratch vectors (plus a mask register on
//! targets where masks live in vectors). Scratch comes from registers outside
//! the set first. When the set covers so much of the register file that not
//! enough remain, registers are borrowed from the front of the set: the
//! first pass computes the rest of the set (the tail), then the borrowed
//! registers are re-homed onto already-processed ones and computed in a
//! following pass.
//!
//! ```text
//!   set = {0..31}, need = 5, 32 regs
//!   pass 0: scratch = 0..5 (borrowed)   compute = 5..32
//!   pass 1: scratch = 5..10 (processed) compute = 0..5
//! ```
//!
//! In-set scratch registers always hold live data (pending inputs or
//! finished results), so every pass spills and restores them. Registers
//! outside the set are only preserved when the caller asks for it.

use crate::compiler::codegen::simd_ops::{
    GReg, MaskReg, MemOperand, SimdOps, VReg, SCRATCH_GPR_POOL,
};
use crate::compiler::codegen::target_desc::{MaskKind, TargetDesc};
use crate::types::JitResult;

/// Predicate register used for comparisons on predicate targets.
pub const INJECTOR_PRED: u8 = 1;

/// One computation pass over part of the index set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassPlan {
    /// Register indices transformed in this pass, ascending.
    pub compute: Vec<usize>,
    /// Scratch vectors: aux registers first, then the vector mask if any.
    pub scratch: Vec<usize>,
    /// In-set scratch registers spilled around this pass.
    pub spill: Vec<usize>,
}

impl PassPlan {
    /// Comparison mask for this pass: the shared predicate register, or
    /// the last scratch vector.
    pub fn mask(&self, kind: MaskKind) -> MaskReg {
        match (kind, self.scratch.last()) {
            (MaskKind::Vector, Some(&r)) => MaskReg::Vec(VReg(r as u8)),
            _ => MaskReg::Pred(INJECTOR_PRED),
        }
    }

    /// Aux vectors for this pass (scratch without the mask).
    pub fn aux(&self, kind: MaskKind) -> Vec<VReg> {
        let n = match kind {
            MaskKind::Vector => self.scratch.len().saturating_sub(1),
            MaskKind::Predicate => self.scratch.len(),
        };
        self.scratch[..n].iter().map(|&r| VReg(r as u8)).collect()
    }
}

/// Register usage of one `compute_vector_set` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectorRegisterPlan {
    /// Scratch vectors per pass (aux count plus a vector mask).
    pub vecs_to_preserve: usize,
    /// Scratch vectors of the first pass.
    pub preserved_vec_idxs: Vec<usize>,
    /// Aux GPRs, in allocation order.
    pub preserved_gprs: Vec<GReg>,
    /// Position in the sorted index set where the first pass starts.
    pub tail_start: usize,
    pub passes: Vec<PassPlan>,
    /// Out-of-set scratch registers saved for the whole call.
    pub outer_spill: Vec<usize>,
    /// Whether the predicate mask register is saved for the whole call.
    pub spill_pred: bool,
    /// Stack frame for spills (0 when nothing is spilled).
    pub frame_bytes: u32,
}

impl InjectorRegisterPlan {
    /// True when the set did not fit beside the scratch registers.
    pub fn is_split(&self) -> bool {
        self.passes.len() > 1
    }

    /// Stack offset of the predicate spill slot, after the vector slots.
    pub fn pred_slot(&self, target: &TargetDesc) -> Option<i32> {
        self.spill_pred
            .then(|| (target.num_simd_regs * target.simd_bytes()) as i32)
    }
}

/// Fixed-size arena of vector register slots for one target.
#[derive(Debug, Clone)]
pub struct RegisterArena {
    target: TargetDesc,
    need: usize,
    outside: Vec<usize>,
}

impl RegisterArena {
    /// Arena for `aux` scratch vectors around the (sorted, unique) `set`.
    pub fn new(target: TargetDesc, set: &[usize], aux: usize) -> Self {
        let n = target.num_simd_regs;
        assert!(
            set.iter().all(|&i| i < n),
            "register index out of range for {n} vector registers"
        );
        let need = aux + usize::from(target.mask_kind == MaskKind::Vector);
        assert!(need < n, "{need} scratch vectors do not fit in {n} registers");
        let outside = (0..n).filter(|i| set.binary_search(i).is_err()).collect();
        RegisterArena {
            target,
            need,
            outside,
        }
    }

    pub fn need(&self) -> usize {
        self.need
    }

    /// Next pass given what is already done and what is left.
    ///
    /// Candidates are taken from outside the set, then from processed
    /// registers, then borrowed from the front of `pending`. Borrowed
    /// registers are left for a later pass.
    pub fn rehome_tail(&self, processed: &[usize], pending: &[usize]) -> PassPlan {
        let mut scratch = Vec::with_capacity(self.need);
        scratch.extend(self.outside.iter().copied().take(self.need));
        let from_done = self.need - scratch.len();
        scratch.extend(processed.iter().copied().take(from_done));
        let borrowed = self.need - scratch.len();
        scratch.extend(pending.iter().copied().take(borrowed));

        let spill = scratch
            .iter()
            .copied()
            .filter(|r| self.outside.binary_search(r).is_err())
            .collect();
        PassPlan {
            compute: pending[borrowed.min(pending.len())..].to_vec(),
            scratch,
            spill,
        }
    }

    /// Full register plan for transforming `set`.
    pub fn plan(
        &self,
        set: &[usize],
        aux_gprs: usize,
        table_reg: GReg,
        save_state: bool,
    ) -> InjectorRegisterPlan {
        let preserved_gprs: Vec<GReg> = SCRATCH_GPR_POOL
            .iter()
            .copied()
            .filter(|&g| g != table_reg)
            .take(aux_gprs)
            .collect();
        assert_eq!(preserved_gprs.len(), aux_gprs, "not enough scratch GPRs");

        let mut passes = Vec::new();
        let mut processed: Vec<usize> = Vec::with_capacity(set.len());
        let mut pending = set.to_vec();
        while !pending.is_empty() {
            let pass = self.rehome_tail(&processed, &pending);
            assert!(!pass.compute.is_empty(), "register plan made no progress");
            let borrowed = pending.len() - pass.compute.len();
            processed.extend_from_slice(&pass.compute);
            pending.truncate(borrowed);
            passes.push(pass);
        }

        let tail_start = passes
            .first()
            .map_or(0, |p| set.len() - p.compute.len());
        let preserved_vec_idxs = passes.first().map_or_else(Vec::new, |p| p.scratch.clone());
        let outer_spill: Vec<usize> = if save_state {
            self.outside.iter().copied().take(self.need).collect()
        } else {
            Vec::new()
        };
        let spill_pred = save_state && self.target.mask_kind == MaskKind::Predicate;

        let spills =
            !outer_spill.is_empty() || spill_pred || passes.iter().any(|p| !p.spill.is_empty());
        let frame_bytes = if spills {
            // one slot per physical vector register, then the predicate
            let bytes = self.target.num_simd_regs * self.target.simd_bytes()
                + if spill_pred { 16 } else { 0 };
            ((bytes + 15) & !15) as u32
        } else {
            0
        };

        InjectorRegisterPlan {
            vecs_to_preserve: self.need,
            preserved_vec_idxs,
            preserved_gprs,
            tail_start,
            passes,
            outer_spill,
            spill_pred,
            frame_bytes,
        }
    }
}

/// Scoped spill of scratch registers.
///
/// `acquire` stores each register into its slot; `release` reloads them in
/// reverse order. Slots are `index * vlen` above the stack pointer, so the
/// stack pointer must not move between the two.
#[must_use = "a scratch scope must be released to restore the spilled registers"]
#[derive(Debug)]
pub struct ScratchScope {
    regs: Vec<usize>,
    pred_slot: Option<i32>,
    vlen: usize,
}

impl ScratchScope {
    pub fn acquire<E: SimdOps>(
        e: &mut E,
        regs: &[usize],
        pred_slot: Option<i32>,
        vlen: usize,
    ) -> JitResult<Self> {
        for &r in regs {
            e.vstore(MemOperand::stack((r * vlen) as i32), VReg(r as u8))?;
        }
        if let Some(off) = pred_slot {
            e.mask_store(MemOperand::stack(off), INJECTOR_PRED)?;
        }
        Ok(ScratchScope {
            regs: regs.to_vec(),
            pred_slot,
            vlen,
        })
    }

    pub fn release<E: SimdOps>(self, e: &mut E) -> JitResult<()> {
        if let Some(off) = self.pred_slot {
            e.mask_load(INJECTOR_PRED, MemOperand::stack(off))?;
        }
        for &r in self.regs.iter().rev() {
            e.vmov(VReg(r as u8), MemOperand::stack((r * self.vlen) as i32).into())?;
        }
        Ok(())
    }

    /// Spill `regs`, emit `body`, restore.
    pub fn with<E: SimdOps, R>(
        e: &mut E,
        regs: &[usize],
        vlen: usize,
        body: impl FnOnce(&mut E) -> JitResult<R>,
    ) -> JitResult<R> {
        let scope = ScratchScope::acquire(e, regs, None, vlen)?;
        let out = body(e)?;
        scope.release(e)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::interp::Interpreter;
    use crate::compiler::codegen::simd_ops::BaseReg;

    fn arena(t: TargetDesc, set: &[usize], aux: usize) -> (RegisterArena, InjectorRegisterPlan) {
        let a = RegisterArena::new(t, set, aux);
        let p = a.plan(set, 0, GReg::RBP, true);
        (a, p)
    }

    #[test]
    fn test_single_pass_uses_outside_registers() {
        let set: Vec<usize> = (0..4).collect();
        let (_, p) = arena(TargetDesc::PORTABLE, &set, 3);
        assert!(!p.is_split());
        assert_eq!(p.tail_start, 0);
        assert_eq!(p.preserved_vec_idxs, vec![4, 5, 6]);
        assert!(p.passes[0].spill.is_empty());
        assert_eq!(p.outer_spill, vec![4, 5, 6]);
        assert_eq!(p.passes[0].compute, set);
    }

    #[test]
    fn test_full_range_splits() {
        let set: Vec<usize> = (0..32).collect();
        let (_, p) = arena(TargetDesc::PORTABLE, &set, 5);
        assert!(p.is_split());
        assert_eq!(p.tail_start, 5);
        assert_eq!(p.passes[0].scratch, vec![0, 1, 2, 3, 4]);
        assert_eq!(p.passes[0].compute, (5..32).collect::<Vec<_>>());
        assert_eq!(p.passes[1].scratch, vec![5, 6, 7, 8, 9]);
        assert_eq!(p.passes[1].compute, vec![0, 1, 2, 3, 4]);
        assert!(p.outer_spill.is_empty());
        assert!(p.frame_bytes >= 32 * 64);
    }

    #[test]
    fn test_every_index_computed_once() {
        let t = TargetDesc::portable(8, 16, MaskKind::Vector);
        for len in 1..=16 {
            let set: Vec<usize> = (16 - len..16).collect();
            for aux in 0..8 {
                let (a, p) = arena(t, &set, aux);
                let mut seen: Vec<usize> = p.passes.iter().flat_map(|p| p.compute.clone()).collect();
                seen.sort_unstable();
                assert_eq!(seen, set);
                for pass in &p.passes {
                    assert_eq!(pass.scratch.len(), a.need());
                    assert!(pass.scratch.iter().all(|r| !pass.compute.contains(r)));
                }
            }
        }
    }

    #[test]
    fn test_vector_mask_is_last_scratch() {
        let t = TargetDesc::portable(8, 16, MaskKind::Vector);
        let (_, p) = arena(t, &[0, 1], 2);
        let pass = &p.passes[0];
        assert_eq!(pass.scratch, vec![2, 3, 4]);
        assert_eq!(pass.mask(MaskKind::Vector), MaskReg::Vec(VReg(4)));
        assert_eq!(pass.aux(MaskKind::Vector), vec![VReg(2), VReg(3)]);
        assert!(!p.spill_pred);
    }

    #[test]
    fn test_gprs_skip_table_register() {
        let a = RegisterArena::new(TargetDesc::PORTABLE, &[0], 1);
        let p = a.plan(&[0], 2, GReg::R15, false);
        assert_eq!(p.preserved_gprs, vec![GReg::R14, GReg::R13]);
        assert_eq!(p.frame_bytes, 0);
        assert!(!p.spill_pred);
    }

    #[test]
    #[should_panic(expected = "do not fit")]
    fn test_too_many_scratch() {
        RegisterArena::new(TargetDesc::portable(8, 16, MaskKind::Vector), &[0], 15);
    }

    #[test]
    fn test_scope_restores_registers() {
        let mut e = Interpreter::new(TargetDesc::PORTABLE);
        let vlen = TargetDesc::PORTABLE.simd_bytes();
        let a = MemOperand::new(BaseReg::Arg(0), 0);
        e.emit_prologue().unwrap();
        e.stack_alloc(4 * vlen as u32).unwrap();
        e.vmov(VReg(2), a.into()).unwrap();
        ScratchScope::with(&mut e, &[2], vlen, |e| e.vzero(VReg(2))).unwrap();
        e.vstore(a, VReg(2)).unwrap();
        e.stack_free(4 * vlen as u32).unwrap();
        e.emit_epilogue().unwrap();
        let prog = e.finalize().unwrap();
        let mut buf = vec![7.0f32; 16];
        unsafe { prog.invoke(&[buf.as_mut_ptr() as u64]) };
        assert!(buf.iter().all(|&v| v == 7.0));
    }
}
