//! `EltwiseKernel`: applies one injector configuration over a whole buffer.
//!
//! Generated signature: `fn(src: *const f32, dst: *mut f32, n: i64)`.
//! Layout of the emitted loop nest:
//!
//! ```text
//! block:  while n >= U*W   U vectors per step, one injector call over v0..vU
//! vector: while n >= W     one vector
//! tail:   while n >= 1     one lane through vload_scalar / vstore_scalar
//! ```

use super::{EltwiseConfig, EltwiseInjector};
use crate::compiler::codegen::simd_ops::{BaseReg, MemOperand, SimdOps, VReg};
use crate::compiler::codegen::target_desc::MaskKind;
use crate::compiler::codegen::{compile, compile_portable, Kernel, KernelSource, TargetDesc};
use crate::dispatch::IsaLevel;
use crate::types::JitResult;

const SRC: BaseReg = BaseReg::Arg(0);
const DST: BaseReg = BaseReg::Arg(1);
const N: BaseReg = BaseReg::Arg(2);

/// Kernel source for a buffer-wide activation.
#[derive(Debug, Clone)]
pub struct EltwiseKernel {
    cfg: EltwiseConfig,
    unroll: usize,
}

impl EltwiseKernel {
    /// The injector runs without `save_state`: the kernel owns every register.
    pub fn new(cfg: EltwiseConfig) -> Self {
        EltwiseKernel {
            cfg: cfg.save_state(false),
            unroll: 4,
        }
    }

    /// Vectors transformed per block iteration (clamped to what the register file allows).
    pub fn unroll(mut self, unroll: usize) -> Self {
        assert!(unroll > 0, "unroll must be positive");
        self.unroll = unroll;
        self
    }

    pub fn config(&self) -> &EltwiseConfig {
        &self.cfg
    }

    fn block_regs(&self, target: TargetDesc) -> usize {
        let mask = usize::from(target.mask_kind == MaskKind::Vector);
        let free = target.num_simd_regs - self.cfg.aux_vecs_count() - mask;
        self.unroll.min(free).max(1)
    }

    /// Generate for `isa`, falling back to the portable backend.
    pub fn compile(&self, isa: IsaLevel) -> JitResult<EltwiseFn> {
        Ok(EltwiseFn {
            kernel: compile(self, isa)?,
        })
    }

    pub fn compile_portable(&self, target: TargetDesc) -> JitResult<EltwiseFn> {
        Ok(EltwiseFn {
            kernel: compile_portable(self, target)?,
        })
    }
}

impl KernelSource for EltwiseKernel {
    fn emit<E: SimdOps>(&self, e: &mut E) -> JitResult<()> {
        let target = e.target();
        let vlen = target.simd_bytes() as i32;
        let w = target.simd_width_f32 as i32;
        let u = self.block_regs(target);
        let block = u as i32 * w;

        let inj = EltwiseInjector::new(e, self.cfg.clone())?;
        let (l_block, l_vec, l_tail, l_done) =
            (e.alloc_label(), e.alloc_label(), e.alloc_label(), e.alloc_label());

        e.emit_prologue()?;
        inj.load_table_addr(e)?;

        e.define_label(l_block)?;
        e.cmp_and_branch_lt(N, block, l_vec)?;
        for i in 0..u {
            e.vmov(VReg(i as u8), MemOperand::new(SRC, i as i32 * vlen).into())?;
        }
        inj.compute_vector_range(e, 0..u)?;
        for i in 0..u {
            e.vstore(MemOperand::new(DST, i as i32 * vlen), VReg(i as u8))?;
        }
        advance(e, block)?;
        e.jump(l_block)?;

        e.define_label(l_vec)?;
        e.cmp_and_branch_lt(N, w, l_tail)?;
        e.vmov(VReg(0), MemOperand::new(SRC, 0).into())?;
        inj.compute_vector(e, 0)?;
        e.vstore(MemOperand::new(DST, 0), VReg(0))?;
        advance(e, w)?;
        e.jump(l_vec)?;

        e.define_label(l_tail)?;
        e.cmp_and_branch_lt(N, 1, l_done)?;
        e.vload_scalar(VReg(0), MemOperand::new(SRC, 0))?;
        inj.compute_vector(e, 0)?;
        e.vstore_scalar(MemOperand::new(DST, 0), VReg(0))?;
        advance(e, 1)?;
        e.jump(l_tail)?;

        e.define_label(l_done)?;
        e.emit_epilogue()?;
        inj.prepare_table(e)?;
        log::debug!(
            "eltwise kernel {:?} {:?}: {} vectors per block on {}",
            self.cfg.alg,
            self.cfg.direction,
            u,
            target.isa
        );
        Ok(())
    }
}

fn advance<E: SimdOps>(e: &mut E, elems: i32) -> JitResult<()> {
    e.gpr_add_imm(SRC, elems * 4)?;
    e.gpr_add_imm(DST, elems * 4)?;
    e.gpr_add_imm(N, -elems)
}

/// A compiled `EltwiseKernel`.
#[derive(Debug)]
pub struct EltwiseFn {
    kernel: Kernel,
}

impl EltwiseFn {
    /// `dst[i] = f(src[i])` over the common length.
    pub fn run(&self, src: &[f32], dst: &mut [f32]) {
        let n = src.len().min(dst.len());
        if n == 0 {
            return;
        }
        // SAFETY: the kernel reads n floats from src and writes n to dst.
        unsafe {
            self.kernel
                .invoke(&[src.as_ptr() as u64, dst.as_mut_ptr() as u64, n as u64])
        };
    }

    /// In-place variant of `run`.
    pub fn run_inplace(&self, buf: &mut [f32]) {
        if buf.is_empty() {
            return;
        }
        let p = buf.as_mut_ptr() as u64;
        // SAFETY: src and dst alias element-for-element; each lane is read before it is written.
        unsafe { self.kernel.invoke(&[p, p, buf.len() as u64]) };
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }
}
