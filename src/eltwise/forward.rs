//! Forward emission: one function per activation, each transforming `x` in place.
//!
//! Register use is listed per function as `aN` (aux vector N), `M` (mask)
//! and `gN` (aux GPR N). Helpers called from other functions (exp, tanh,
//! logistic) only touch the registers they list, so callers keep state in
//! higher aux slots.

use super::constants::TANH_N_INTERVALS;
use super::injector::Ctx;
use super::table::ConstKey as K;
use super::EltwiseAlg;
use crate::compiler::codegen::simd_ops::{
    CmpPred, MemOperand, RoundMode, SimdOps, VReg, CALLER_SAVED_GPRS,
};
use crate::compiler::codegen::target_desc::MaskKind;
use crate::types::{JitError, JitResult};

pub(super) fn emit<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    match c.alg() {
        EltwiseAlg::Relu => relu(e, c, x),
        EltwiseAlg::Elu => elu(e, c, x),
        EltwiseAlg::Tanh => tanh(e, c, x),
        EltwiseAlg::Square => e.vmul(x, x, x.into()),
        EltwiseAlg::Abs => e.vand(x, x, c.t(K::PositiveMask)),
        EltwiseAlg::Sqrt => e.vsqrt(x, x),
        EltwiseAlg::Linear => {
            e.vmul(x, x, c.t(K::Alpha))?;
            e.vadd(x, x, c.t(K::Beta))
        }
        EltwiseAlg::BoundedRelu => {
            e.vmax(x, x, c.t(K::Zero))?;
            e.vmin(x, x, c.t(K::Alpha))
        }
        EltwiseAlg::SoftRelu => soft_relu(e, c, x),
        EltwiseAlg::Logistic => logistic(e, c, x),
        EltwiseAlg::Exp => exp(e, c, x),
        EltwiseAlg::GeluTanh => gelu_tanh(e, c, x),
        EltwiseAlg::Swish => swish(e, c, x),
        EltwiseAlg::Log => log(e, c, x),
        EltwiseAlg::Clip => {
            e.vmax(x, x, c.t(K::Alpha))?;
            e.vmin(x, x, c.t(K::Beta))
        }
        EltwiseAlg::Pow => pow(e, c, x),
        EltwiseAlg::GeluErf => gelu_erf(e, c, x),
        EltwiseAlg::Round => e.vround(x, x, RoundMode::Nearest),
        alg => Err(JitError::Unsupported(format!("{alg:?} is not a base function"))),
    }
}

/// `x > 0 ? x : alpha*x`. Uses a0, M.
pub(super) fn relu<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    if c.cfg.alpha == 0.0 {
        return e.vmax(x, x, c.t(K::Zero));
    }
    let a0 = c.aux(0);
    e.vmov(a0, x.into())?;
    e.vcmp(c.mask, x, c.t(K::Zero), CmpPred::Gt)?;
    e.vmul(x, x, c.t(K::Alpha))?;
    e.vblend(x, c.mask, a0.into())
}

/// `x > 0 ? x : alpha*(exp(x)-1)`. Uses a0..a2, M.
pub(super) fn elu<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let a2 = c.aux(2);
    e.vmov(a2, x.into())?;
    exp(e, c, x)?;
    e.vsub(x, x, c.t(K::One))?;
    e.vmul(x, x, c.t(K::Alpha))?;
    e.vcmp(c.mask, a2, c.t(K::Zero), CmpPred::Gt)?;
    e.vblend(x, c.mask, a2.into())
}

/// Cody-Waite reduction, degree-5 polynomial, 2^(n-1) * 2 scaling.
/// Uses a0, a1, M.
pub(super) fn exp<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let (a0, a1, m) = (c.aux(0), c.aux(1), c.mask);
    // lanes below ln(FLT_MIN) flush to zero
    e.vcmp(m, x, c.t(K::ExpLnFltMin), CmpPred::Lt)?;
    e.vmin(x, x, c.t(K::ExpLnFltMax))?;
    e.vmax(x, x, c.t(K::ExpLnFltMin))?;
    e.vmov(a0, x.into())?;

    // n = floor(x * log2(e) + 0.5)
    e.vmul(x, x, c.t(K::ExpLog2ef))?;
    e.vadd(x, x, c.t(K::Half))?;
    e.vround(a1, x, RoundMode::Floor)?;
    e.vmov(x, a1.into())?;
    // r = x - n * ln2
    e.vfnmadd231(a0, a1, c.t(K::Ln2f))?;

    // 2^(n-1): n can reach 128, which has no f32 exponent
    e.vsub(x, x, c.t(K::One))?;
    e.vcvt_f32_i32(a1, x)?;
    e.vadd_i32(a1, a1, c.t(K::ExponentBias))?;
    e.vshl_i32(a1, a1, 23)?;
    e.vblend(a1, m, c.t(K::Zero))?;

    e.vmov(x, c.ti(K::ExpPol, 4))?;
    for i in (0..4).rev() {
        e.vfmadd213(x, a0, c.ti(K::ExpPol, i))?;
    }
    e.vfmadd213(x, a0, c.t(K::One))?;
    e.vmul(x, x, a1.into())?;
    e.vmul(x, x, c.t(K::Two))
}

/// Piecewise degree-6 polynomials over 32 half-binade intervals of |x|.
/// Uses a0..a3, M, g0.
pub(super) fn tanh<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let (a0, a1, a2, a3, m) = (c.aux(0), c.aux(1), c.aux(2), c.aux(3), c.mask);
    let g = c.gpr(0);
    let stride = (TANH_N_INTERVALS * 4) as i32;

    // tanh(-x) = -tanh(x)
    e.vmov(a3, x.into())?;
    e.vand(x, x, c.t(K::PositiveMask))?;

    // interval index from exponent and leading mantissa bit
    e.vsub_i32(a2, x, c.t(K::TanhIdxBias))?;
    e.vand(a2, a2, c.t(K::TanhIdxMask))?;
    e.vshr_i32(a2, a2, 22)?;
    e.vand(a2, a2, c.t(K::FiveBitOffset))?;

    // offset from the interval start
    e.vand(a0, x, c.t(K::TanhIdxMask))?;
    e.vsub(x, x, a0.into())?;

    e.gpr_mov(g.into(), c.table_reg().into())?;
    e.gpr_add_imm(g.into(), c.off(K::TanhPolTable, 0))?;
    e.vgather(a1, g, a2, 6 * stride, m)?;
    for deg in (0..6).rev() {
        e.vgather(a0, g, a2, deg * stride, m)?;
        e.vfmadd213(a1, x, a0.into())?;
    }

    e.vmov(x, a3.into())?;
    e.vand(a3, a3, c.t(K::SignMask))?;
    e.vand(x, x, c.t(K::PositiveMask))?;

    // saturated: 1, polynomial range: P(x), linear range: x
    e.vmov(a0, c.t(K::One))?;
    e.vcmp(m, x, c.t(K::TanhSaturationLbound), CmpPred::Lt)?;
    e.vblend(a0, m, a1.into())?;
    e.vcmp(m, x, c.t(K::TanhLinearUbound), CmpPred::Lt)?;
    e.vblend(a0, m, x.into())?;

    e.vxor(a0, a0, a3.into())?;
    e.vmov(x, a0.into())
}

/// `0.5x(1 + tanh(sqrt(2/pi)(x + c x^3)))`. Uses a0..a4, M, g0.
fn gelu_tanh<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let a4 = c.aux(4);
    e.vmov(a4, x.into())?;
    e.vmul(x, x, x.into())?;
    e.vmul(x, x, c.t(K::GeluTanhFittingConst))?;
    e.vadd(x, x, c.t(K::One))?;
    e.vmul(x, x, a4.into())?;
    e.vmul(x, x, c.t(K::GeluTanhSqrtTwoOverPi))?;
    tanh(e, c, x)?;
    e.vadd(x, x, c.t(K::One))?;
    e.vmul(x, x, c.t(K::Half))?;
    e.vmul(x, x, a4.into())
}

/// `log(1 + exp(x))`, linear above ln(FLT_MAX). Uses a0..a3, M.
fn soft_relu<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let (a0, a1, a2, a3, m) = (c.aux(0), c.aux(1), c.aux(2), c.aux(3), c.mask);
    e.vmov(a2, x.into())?;
    e.vmin(x, x, c.t(K::ExpLnFltMax))?;
    e.vmax(x, x, c.t(K::ExpLnFltMin))?;
    e.vmov(a1, x.into())?;

    // x = n*ln2 + r
    e.vmul(x, x, c.t(K::ExpLog2ef))?;
    e.vadd(x, x, c.t(K::Half))?;
    e.vround(a0, x, RoundMode::Floor)?;
    e.vmov(x, a0.into())?;
    e.vmul(a0, a0, c.t(K::Ln2f))?;
    e.vsub(a1, a1, a0.into())?;

    // a3 = exp(r)
    e.vmov(a3, c.ti(K::ExpPol, 4))?;
    for i in (0..4).rev() {
        e.vfmadd213(a3, a1, c.ti(K::ExpPol, i))?;
    }
    e.vfmadd213(a3, a1, c.t(K::One))?;

    // a3 = exp(r) + 2^-n, so log(1 + exp(x)) = n*ln2 + log(a3)
    e.vmul(a1, x, c.t(K::MinusOne))?;
    e.vcvt_f32_i32(a1, a1)?;
    e.vadd_i32(a1, a1, c.t(K::ExponentBias))?;
    e.vshl_i32(a1, a1, 23)?;
    e.vadd(a3, a3, a1.into())?;

    // frexp: a3 = 2^k * y, y in [0.5, 1)
    e.vshr_i32(x, a3, 23)?;
    e.vcvt_i32_f32(x, x)?;
    e.vsub(x, x, c.t(K::SoftReluOneTwentySix))?;
    e.vand(a3, a3, c.t(K::SoftReluMantissaSignMask))?;
    e.vor(a3, a3, c.t(K::Half))?;
    e.vsub(a3, a3, c.t(K::One))?;

    // log1p(y - 1)
    e.vmov(a1, c.ti(K::SoftReluPol, 8))?;
    for i in (0..8).rev() {
        e.vfmadd213(a1, a3, c.ti(K::SoftReluPol, i))?;
    }

    e.vmul(x, x, c.t(K::Ln2f))?;
    e.vadd(x, x, a1.into())?;
    e.vadd(x, x, a0.into())?;

    e.vcmp(m, a2, c.t(K::ExpLnFltMax), CmpPred::Gt)?;
    e.vblend(x, m, a2.into())
}

/// Sigmoid on -|x|, mirrored for positive lanes. Uses a0..a3, M.
pub(super) fn logistic<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let (a1, a2, a3, m) = (c.aux(1), c.aux(2), c.aux(3), c.mask);
    e.vand(a3, x, c.t(K::SignMask))?;
    e.vor(x, x, c.t(K::SignMask))?;
    exp(e, c, x)?;

    // e / (1 + e)
    e.vadd(a1, x, c.t(K::One))?;
    e.vdiv(x, x, a1.into())?;
    e.vmov(a2, c.t(K::One))?;
    e.vsub(a2, a2, x.into())?;

    // sign bit clear: the i32 view is above that of -1.0f
    e.vcmpgt_i32(m, a3, c.t(K::MinusOne))?;
    e.vblend(x, m, a2.into())
}

/// `x * logistic(alpha*x)`. Uses a0..a4, M.
fn swish<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let a4 = c.aux(4);
    e.vmov(a4, x.into())?;
    e.vmul(x, x, c.t(K::Alpha))?;
    logistic(e, c, x)?;
    e.vmul(x, x, a4.into())
}

/// `E*ln2 + log1p(m*r_i - 1) - log(r_i)`, r_i looked up by the top five
/// mantissa bits. Uses a0..a3, M, g0.
pub(super) fn log<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let (a0, a1, a2, a3, m) = (c.aux(0), c.aux(1), c.aux(2), c.aux(3), c.mask);
    let g = c.gpr(0);
    e.vmov(a3, x.into())?;

    // table index i (pairs, so doubled)
    e.vshr_i32(a0, x, 23 - 5)?;
    e.vand(a0, a0, c.t(K::FiveBitOffset))?;
    e.vshl_i32(a0, a0, 1)?;

    // upper half of the intervals moves to the next binade
    e.vshr_i32(a1, a0, 5)?;
    e.vshr_i32(a2, x, 23)?;
    e.vadd_i32(a2, a2, a1.into())?;
    e.vcvt_i32_f32(a2, a2)?;

    // mantissa with exponent 127 or 126
    e.vxor(a1, a1, c.t(K::ExponentBias))?;
    e.vshl_i32(a1, a1, 23)?;
    e.vand(x, x, c.t(K::LogMantissaMask))?;
    e.vor(x, x, a1.into())?;

    e.gpr_mov(g.into(), c.table_reg().into())?;
    e.gpr_add_imm(g.into(), c.off(K::LogPredefinedVals, 0))?;

    // relative error z = m * r_i - 1
    e.vgather(a1, g, a0, 0, m)?;
    e.vmul(a1, a1, x.into())?;
    e.vsub(a1, a1, c.t(K::One))?;

    e.vmov(x, c.ti(K::LogPol, 3))?;
    for i in (0..3).rev() {
        e.vfmadd213(x, a1, c.ti(K::LogPol, i))?;
    }
    e.vfmadd213(x, a1, c.t(K::One))?;
    e.vmul(x, x, a1.into())?;

    // E*ln2 - log(r_i); the table carries the exponent bias
    e.vgather(a1, g, a0, 4, m)?;
    e.vfmadd231(a1, a2, c.t(K::Ln2f))?;

    e.vadd(a0, x, a1.into())?;
    e.vsub(a2, a0, a1.into())?;
    e.vsub(a2, a2, x.into())?;
    e.vadd(x, a0, a2.into())?;

    e.vcmp(m, a3, c.t(K::Zero), CmpPred::Eq)?;
    e.vblend(x, m, c.t(K::LogMinusInf))?;
    e.vcmp(m, a3, c.t(K::Zero), CmpPred::Lt)?;
    e.vblend(x, m, c.t(K::LogQnan))
}

/// `alpha * x^beta`. Uses a0 for `beta == -1`.
pub(super) fn pow<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let beta = c.cfg.beta;
    if beta == -1.0 {
        let a0 = c.aux(0);
        e.vmov(a0, c.t(K::Alpha))?;
        return e.vdiv(x, a0, x.into());
    }
    if beta == 0.0 {
        return e.vmov(x, c.t(K::Alpha));
    }
    if beta == 0.5 {
        e.vsqrt(x, x)?;
    } else if beta == 2.0 {
        e.vmul(x, x, x.into())?;
    } else if beta != 1.0 {
        pow_call(e, c, x)?;
    }
    e.vmul(x, x, c.t(K::Alpha))
}

extern "C" fn powf_shim(x: f32, y: f32) -> f32 {
    x.powf(y)
}

/// Per-lane native `powf` call.
///
/// The callee may clobber every caller-saved register, so all vector
/// registers, the predicate registers and the caller-saved GPRs are saved
/// around the calls. `x` is updated through its own spill slot.
fn pow_call<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let vlen = c.target.simd_bytes();
    let nregs = c.target.num_simd_regs;
    let preds = c.target.mask_kind == MaskKind::Predicate;
    let mask_off = (nregs * vlen) as i32;
    let beta_off = mask_off + 16;
    let frame = ((beta_off as u32 + 4) + 15) & !15;

    for &g in &CALLER_SAVED_GPRS {
        e.gpr_push(g)?;
    }
    e.stack_alloc(frame)?;
    for i in 0..nregs {
        e.vstore(MemOperand::stack((i * vlen) as i32), VReg(i as u8))?;
    }
    if preds {
        for k in 1..8u8 {
            e.mask_store(MemOperand::stack(mask_off + 2 * (k as i32 - 1)), k)?;
        }
    }

    e.vmov(x, c.t(K::Beta))?;
    e.vstore_scalar(MemOperand::stack(beta_off), x)?;
    let base = (x.0 as usize * vlen) as i32;
    for lane in 0..c.target.simd_width_f32 {
        let slot = MemOperand::stack(base + 4 * lane as i32);
        e.call_scalar2(powf_shim, slot, MemOperand::stack(beta_off), slot)?;
    }

    if preds {
        for k in (1..8u8).rev() {
            e.mask_load(k, MemOperand::stack(mask_off + 2 * (k as i32 - 1)))?;
        }
    }
    for i in (0..nregs).rev() {
        e.vmov(VReg(i as u8), MemOperand::stack((i * vlen) as i32).into())?;
    }
    e.stack_free(frame)?;
    for &g in CALLER_SAVED_GPRS.iter().rev() {
        e.gpr_pop(g)?;
    }
    Ok(())
}

/// `0.5x(1 + erf(x/sqrt2))` with a rational erf approximation.
/// Uses a0..a4, M.
fn gelu_erf<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let (a0, a1, a2, a3, a4) = (c.aux(0), c.aux(1), c.aux(2), c.aux(3), c.aux(4));
    e.vmul(x, x, c.t(K::GeluErfOneOverSqrtTwo))?;
    e.vmov(a3, x.into())?;

    // -exp(-s^2)
    e.vmul(x, x, x.into())?;
    e.vxor(x, x, c.t(K::SignMask))?;
    exp(e, c, x)?;
    e.vxor(x, x, c.t(K::SignMask))?;

    erf_tail(e, c, x, a3, [a0, a1, a2, a4])?;

    // 0.5 * x * (1 + erf) with x = s*sqrt2
    e.vmul(a3, a3, c.t(K::GeluErfOneOverSqrtTwo))?;
    e.vfmadd213(x, a3, a3.into())
}

/// `x = -exp(-s^2)` in, `x = erf(s)` out. `s` is read, not modified.
pub(super) fn erf_tail<E: SimdOps>(
    e: &mut E,
    c: &Ctx<'_>,
    x: VReg,
    s: VReg,
    [sign, abs, den, t]: [VReg; 4],
) -> JitResult<()> {
    e.vand(sign, s, c.t(K::SignMask))?;
    e.vand(abs, s, c.t(K::PositiveMask))?;

    // t = 1 / (1 + p|s|)
    e.vmul(den, abs, c.t(K::GeluErfApproxConst))?;
    e.vadd(den, den, c.t(K::One))?;
    e.vmov(t, c.t(K::One))?;
    e.vdiv(t, t, den.into())?;
    e.vmul(x, x, t.into())?;

    e.vmov(abs, c.ti(K::GeluErfPol, 4))?;
    for i in (0..4).rev() {
        e.vfmadd213(abs, t, c.ti(K::GeluErfPol, i))?;
    }
    e.vfmadd213(x, abs, c.t(K::One))?;
    e.vxor(x, x, sign.into())
}
