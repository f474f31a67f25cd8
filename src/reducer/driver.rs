//! Reduction driver: generated code summing `n_src` strided source buffers
//! into a destination.
//!
//! Generated signature: `fn(dst, src, ny, nx)`. For each of `ny` rows:
//!
//! ```text
//! dst[0..nx] (=|+=) src[k*src_ld + 0..nx]   for k in 0..n_src
//! dst += dst_step; src += src_step
//! ```
//!
//! Each row is consumed in three widths: `num_regs/2` vectors at a time,
//! one vector, then one element.

use std::marker::PhantomData;

use crate::compiler::codegen::simd_ops::{BaseReg, MemOperand, SimdOps, VOperand, VReg};
use crate::compiler::codegen::{compile, Kernel, KernelSource};
use crate::dispatch::IsaLevel;
use crate::types::{DataType, JitError, JitResult, ReduceElem};

const DST: BaseReg = BaseReg::Arg(0);
const SRC: BaseReg = BaseReg::Arg(1);
const NY: BaseReg = BaseReg::Arg(2);
const NX: BaseReg = BaseReg::Arg(3);
const SRC_CNT: BaseReg = BaseReg::Arg(4);
const X: BaseReg = BaseReg::Arg(5);

/// Shape of a driver. Strides and steps are in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverParams {
    pub dtype: DataType,
    /// Number of source buffers summed per element.
    pub n_src: usize,
    /// Distance between consecutive source buffers.
    pub src_ld: usize,
    /// Source advance per row.
    pub src_step: usize,
    /// Destination advance per row.
    pub dst_step: usize,
    /// Overwrite the destination instead of accumulating into it.
    pub nullify_dst: bool,
}

impl DriverParams {
    pub fn new(
        dtype: DataType,
        n_src: usize,
        src_ld: usize,
        src_step: usize,
        dst_step: usize,
        nullify_dst: bool,
    ) -> Self {
        DriverParams {
            dtype,
            n_src,
            src_ld,
            src_step,
            dst_step,
            nullify_dst,
        }
    }

    fn add<E: SimdOps>(&self, e: &mut E, dst: VReg, src: VOperand) -> JitResult<()> {
        match self.dtype {
            DataType::F32 => e.vadd(dst, dst, src),
            DataType::S32 => e.vadd_i32(dst, dst, src),
        }
    }

    /// One `while x >= nloads*len` loop. `len` is in bytes.
    fn loop_x<E: SimdOps>(&self, e: &mut E, nloads: usize, len: i32, vlen: i32) -> JitResult<()> {
        let scalar = len != vlen;
        let (l_loop, l_end) = (e.alloc_label(), e.alloc_label());
        let step = nloads as i32 * len;
        let src_ld = bytes(self.src_ld)?;
        let vr = |i: usize| VReg(i as u8);
        let at = |base: BaseReg, off: i32| MemOperand::new(base, off);

        e.define_label(l_loop)?;
        e.cmp_and_branch_lt(X, step, l_end)?;

        for i in 0..nloads {
            let off = i as i32 * len;
            if self.nullify_dst {
                e.vzero(vr(i))?;
            } else if scalar {
                e.vload_scalar(vr(i), at(DST, off))?;
            } else {
                e.vmov(vr(i), at(DST, off).into())?;
            }
        }

        let tmp = vr(nloads);
        let accumulate = |e: &mut E, src_off: i32| -> JitResult<()> {
            for i in 0..nloads {
                let m = at(SRC, src_off + i as i32 * len);
                if scalar {
                    e.vload_scalar(tmp, m)?;
                    self.add(e, vr(i), tmp.into())?;
                } else {
                    self.add(e, vr(i), m.into())?;
                }
            }
            Ok(())
        };

        if self.n_src > 1 {
            let l_src = e.alloc_label();
            e.gpr_load_imm(SRC_CNT, self.n_src as i64)?;
            e.define_label(l_src)?;
            accumulate(e, 0)?;
            e.gpr_add_imm(SRC, src_ld)?;
            e.dec_and_branch_nz(SRC_CNT, l_src)?;
            e.gpr_add_imm(SRC, -bytes(self.n_src * self.src_ld)?)?;
        } else {
            for src_id in 0..self.n_src {
                accumulate(e, bytes(src_id * self.src_ld)?)?;
            }
        }

        for i in 0..nloads {
            let m = at(DST, i as i32 * len);
            if scalar {
                e.vstore_scalar(m, vr(i))?;
            } else {
                e.vstore(m, vr(i))?;
            }
        }

        e.gpr_add_imm(SRC, step)?;
        e.gpr_add_imm(DST, step)?;
        e.gpr_add_imm(X, -step)?;
        e.jump(l_loop)?;
        e.define_label(l_end)
    }
}

fn bytes(elems: usize) -> JitResult<i32> {
    elems
        .checked_mul(4)
        .and_then(|b| i32::try_from(b).ok())
        .ok_or_else(|| JitError::InvalidConfig(format!("driver offset of {elems} elements overflows")))
}

impl KernelSource for DriverParams {
    fn emit<E: SimdOps>(&self, e: &mut E) -> JitResult<()> {
        assert!(self.n_src > 0, "driver needs at least one source");
        let target = e.target();
        let vlen = target.simd_bytes() as i32;
        let unroll = (target.num_simd_regs / 2).max(1);
        let l_row = e.alloc_label();
        let l_done = e.alloc_label();

        e.emit_prologue()?;
        e.cmp_and_branch_lt(NY, 1, l_done)?;
        e.gpr_shl_imm(NX, 2)?;

        e.define_label(l_row)?;
        e.gpr_mov(X, NX)?;
        self.loop_x(e, unroll, vlen, vlen)?;
        self.loop_x(e, 1, vlen, vlen)?;
        self.loop_x(e, 1, 4, vlen)?;
        e.gpr_sub(SRC, NX)?;
        e.gpr_sub(DST, NX)?;
        e.gpr_add_imm(DST, bytes(self.dst_step)?)?;
        e.gpr_add_imm(SRC, bytes(self.src_step)?)?;
        e.dec_and_branch_nz(NY, l_row)?;

        e.define_label(l_done)?;
        e.emit_epilogue()
    }
}

/// A compiled `DriverParams`, callable from any thread.
#[derive(Debug)]
pub struct ReductionDriver<T: ReduceElem> {
    params: DriverParams,
    kernel: Kernel,
    _elem: PhantomData<T>,
}

impl<T: ReduceElem> ReductionDriver<T> {
    /// Generate the driver once for `isa` (portable fallback when unavailable).
    pub fn new(
        isa: IsaLevel,
        n_src: usize,
        src_ld: usize,
        src_step: usize,
        dst_step: usize,
        nullify_dst: bool,
    ) -> JitResult<Self> {
        let params = DriverParams::new(T::DATA_TYPE, n_src, src_ld, src_step, dst_step, nullify_dst);
        let kernel = compile(&params, isa)?;
        log::debug!(
            "reduction driver {}: n_src={n_src} src_ld={src_ld} nullify={nullify_dst}, \
             {} backend, {} bytes",
            T::DATA_TYPE,
            kernel.backend_name(),
            kernel.code_size()
        );
        Ok(ReductionDriver {
            params,
            kernel,
            _elem: PhantomData,
        })
    }

    pub fn params(&self) -> &DriverParams {
        &self.params
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Reduce `ny` rows of `nx` elements.
    ///
    /// # Safety
    /// For every row `r < ny`, `dst + r*dst_step` must be valid for `nx`
    /// reads and writes, and `src + r*src_step + k*src_ld` for `nx` reads,
    /// `k < n_src`. No other thread may touch those destination elements.
    #[inline]
    pub unsafe fn invoke(&self, dst: *mut T, src: *const T, ny: usize, nx: usize) {
        self.kernel
            .invoke(&[dst as u64, src as u64, ny as u64, nx as u64]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver<T: ReduceElem>(n_src: usize, src_ld: usize, nullify: bool) -> ReductionDriver<T> {
        ReductionDriver::new(IsaLevel::Portable, n_src, src_ld, 0, 0, nullify).unwrap()
    }

    #[test]
    fn test_single_source_accumulate() {
        let d = driver::<f32>(1, 0, false);
        for n in [1usize, 15, 16, 17, 255, 256, 300] {
            let src: Vec<f32> = (0..n).map(|i| i as f32).collect();
            let mut dst = vec![1.0f32; n + 1];
            unsafe { d.invoke(dst.as_mut_ptr(), src.as_ptr(), 1, n) };
            for i in 0..n {
                assert_eq!(dst[i], i as f32 + 1.0);
            }
            assert_eq!(dst[n], 1.0, "overran the row for n={n}");
        }
    }

    #[test]
    fn test_many_sources_s32() {
        let (n_src, ld, n) = (5, 40, 37);
        let d = driver::<i32>(n_src, ld, false);
        let src: Vec<i32> = (0..n_src * ld).map(|i| i as i32).collect();
        let mut dst = vec![i32::MAX; n];
        unsafe { d.invoke(dst.as_mut_ptr(), src.as_ptr(), 1, n) };
        for i in 0..n {
            let sum: i32 = (0..n_src).map(|k| src[k * ld + i]).sum();
            assert_eq!(dst[i], i32::MAX.wrapping_add(sum));
        }
    }

    #[test]
    fn test_nullify_and_rows() {
        let d = ReductionDriver::<f32>::new(IsaLevel::Portable, 2, 6, 3, 4, true).unwrap();
        let src: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let mut dst = vec![-1.0f32; 8];
        unsafe { d.invoke(dst.as_mut_ptr(), src.as_ptr(), 2, 3) };
        // row 0: src[0..3] + src[6..9]; row 1: src[3..6] + src[9..12]
        assert_eq!(&dst[..3], &[6.0, 8.0, 10.0]);
        assert_eq!(dst[3], -1.0);
        assert_eq!(&dst[4..7], &[12.0, 14.0, 16.0]);
        assert_eq!(dst[7], -1.0);
    }

    #[test]
    fn test_zero_rows_is_noop() {
        let d = driver::<f32>(1, 0, true);
        let mut dst = vec![7.0f32; 4];
        unsafe { d.invoke(dst.as_mut_ptr(), std::ptr::null(), 0, 4) };
        assert_eq!(dst, vec![7.0; 4]);
    }
}
