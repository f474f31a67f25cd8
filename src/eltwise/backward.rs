//! Derivative emission. `x` holds the forward input, or the forward output
//! for the `*UseDst` variants when `use_dst` is set.

use super::forward::{self, erf_tail};
use super::injector::Ctx;
use super::table::ConstKey as K;
use super::EltwiseAlg;
use crate::compiler::codegen::simd_ops::{CmpPred, SimdOps, VReg};
use crate::types::{JitError, JitResult};

pub(super) fn emit<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let dst = c.cfg.use_dst;
    match c.alg() {
        EltwiseAlg::Relu => relu(e, c, x),
        EltwiseAlg::Elu => elu(e, c, x, dst),
        EltwiseAlg::Tanh => tanh(e, c, x, dst),
        EltwiseAlg::Square => e.vmul(x, x, c.t(K::Two)),
        EltwiseAlg::Abs => {
            e.vcmp(c.mask, x, c.t(K::Zero), CmpPred::Gt)?;
            e.vblend(x, c.mask, c.t(K::One))?;
            e.vcmp(c.mask, x, c.t(K::Zero), CmpPred::Lt)?;
            e.vblend(x, c.mask, c.t(K::MinusOne))
        }
        EltwiseAlg::Sqrt => sqrt(e, c, x, dst),
        EltwiseAlg::Linear => e.vmov(x, c.t(K::Alpha)),
        EltwiseAlg::BoundedRelu => {
            e.vcmp(c.mask, x, c.t(K::Alpha), CmpPred::Gt)?;
            e.vblend(x, c.mask, c.t(K::Zero))?;
            e.vmax(x, x, c.t(K::Zero))?;
            e.vcmp(c.mask, x, c.t(K::Zero), CmpPred::Gt)?;
            e.vblend(x, c.mask, c.t(K::One))
        }
        EltwiseAlg::SoftRelu => forward::logistic(e, c, x),
        EltwiseAlg::Logistic => logistic(e, c, x, dst),
        EltwiseAlg::Exp if dst => Ok(()),
        EltwiseAlg::Exp => forward::exp(e, c, x),
        EltwiseAlg::GeluTanh => gelu_tanh(e, c, x),
        EltwiseAlg::Swish => swish(e, c, x),
        EltwiseAlg::Log => {
            let a0 = c.aux(0);
            e.vmov(a0, c.t(K::One))?;
            e.vdiv(x, a0, x.into())
        }
        EltwiseAlg::Clip => clip(e, c, x),
        EltwiseAlg::Pow => pow(e, c, x),
        EltwiseAlg::GeluErf => gelu_erf(e, c, x),
        alg => Err(JitError::Unsupported(format!("{alg:?} has no backward variant"))),
    }
}

/// `x > 0 ? 1 : alpha`; the same predicate holds on the output.
fn relu<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    e.vcmp(c.mask, x, c.t(K::Zero), CmpPred::Gt)?;
    e.vmov(x, c.t(K::Alpha))?;
    e.vblend(x, c.mask, c.t(K::One))
}

/// `x > 0 ? 1 : alpha*exp(x)`, or `d > 0 ? 1 : d + alpha`.
fn elu<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg, dst: bool) -> JitResult<()> {
    if dst {
        e.vcmp(c.mask, x, c.t(K::Zero), CmpPred::Gt)?;
        e.vadd(x, x, c.t(K::Alpha))?;
    } else {
        forward::exp(e, c, x)?;
        // exp(x) > 1 exactly when x > 0
        e.vcmp(c.mask, x, c.t(K::One), CmpPred::Gt)?;
        e.vmul(x, x, c.t(K::Alpha))?;
    }
    e.vblend(x, c.mask, c.t(K::One))
}

/// `1 - tanh(x)^2`.
fn tanh<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg, dst: bool) -> JitResult<()> {
    if !dst {
        forward::tanh(e, c, x)?;
    }
    let a0 = c.aux(0);
    e.vmov(a0, c.t(K::One))?;
    e.vfnmadd231(a0, x, x.into())?;
    e.vmov(x, a0.into())
}

/// `0.5 / sqrt(x)`.
fn sqrt<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg, dst: bool) -> JitResult<()> {
    if !dst {
        e.vsqrt(x, x)?;
    }
    let a0 = c.aux(0);
    e.vmov(a0, c.t(K::Half))?;
    e.vdiv(x, a0, x.into())
}

/// `s * (1 - s)`.
fn logistic<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg, dst: bool) -> JitResult<()> {
    if !dst {
        forward::logistic(e, c, x)?;
    }
    let a0 = c.aux(0);
    e.vmov(a0, c.t(K::One))?;
    e.vsub(a0, a0, x.into())?;
    e.vmul(x, x, a0.into())
}

/// `0.5(1 + t) + 0.5 * k x (1 + 3c x^2)(1 - t^2)` with
/// `t = tanh(k x (1 + c x^2))`.
fn gelu_tanh<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let (a4, a5) = (c.aux(4), c.aux(5));
    e.vmov(a4, x.into())?;
    e.vmul(x, x, x.into())?;

    e.vmov(a5, c.t(K::GeluTanhFittingConstTimesThree))?;
    e.vfmadd213(a5, x, c.t(K::One))?;
    e.vmul(x, x, c.t(K::GeluTanhFittingConst))?;
    e.vadd(x, x, c.t(K::One))?;

    e.vmul(a4, a4, c.t(K::GeluTanhSqrtTwoOverPi))?;
    e.vmul(x, x, a4.into())?;
    e.vmul(a5, a5, a4.into())?;

    forward::tanh(e, c, x)?;

    // (1 + t)(1 + g'(1 - t)) / 2
    e.vfnmadd231(a5, a5, x.into())?;
    e.vadd(x, x, c.t(K::One))?;
    e.vfmadd231(x, x, a5.into())?;
    e.vmul(x, x, c.t(K::Half))
}

/// `s + alpha x s (1 - s)` with `s = logistic(alpha x)`.
fn swish<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let a4 = c.aux(4);
    e.vmul(x, x, c.t(K::Alpha))?;
    e.vmov(a4, x.into())?;
    forward::logistic(e, c, x)?;
    e.vfnmadd231(a4, a4, x.into())?;
    e.vfmadd231(x, x, a4.into())
}

/// 1 on `(alpha, beta]`, 0 elsewhere.
fn clip<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let a0 = c.aux(0);
    e.vmov(a0, c.t(K::One))?;
    e.vcmp(c.mask, x, c.t(K::Beta), CmpPred::Gt)?;
    e.vblend(a0, c.mask, c.t(K::Zero))?;
    e.vcmp(c.mask, x, c.t(K::Alpha), CmpPred::Le)?;
    e.vblend(a0, c.mask, c.t(K::Zero))?;
    e.vmov(x, a0.into())
}

/// `alpha * beta * x^(beta-1)`, as `beta * pow(x) / x` in the general case.
fn pow<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let beta = c.cfg.beta;
    if beta == 0.0 {
        return e.vmov(x, c.t(K::Zero));
    }
    if beta == 0.5 {
        sqrt(e, c, x, false)?;
        return e.vmul(x, x, c.t(K::Alpha));
    }
    if beta == 1.0 {
        return e.vmov(x, c.t(K::Alpha));
    }
    let a1 = c.aux(1);
    e.vmov(a1, x.into())?;
    forward::pow(e, c, x)?;
    e.vdiv(x, x, a1.into())?;
    e.vmul(x, x, c.t(K::Beta))?;
    if beta >= 1.0 {
        // x^(beta-1) is 0 at the origin, not 0/0
        e.vcmp(c.mask, a1, c.t(K::Zero), CmpPred::Eq)?;
        e.vblend(x, c.mask, c.t(K::Zero))?;
    }
    Ok(())
}

/// `0.5(1 + erf(s)) + s exp(-s^2) / sqrt(pi)` with `s = x / sqrt2`.
fn gelu_erf<E: SimdOps>(e: &mut E, c: &Ctx<'_>, x: VReg) -> JitResult<()> {
    let (a0, a1, a2, a3, a4) = (c.aux(0), c.aux(1), c.aux(2), c.aux(3), c.aux(4));
    e.vmul(x, x, c.t(K::GeluErfOneOverSqrtTwo))?;
    e.vmov(a3, x.into())?;
    e.vmul(x, x, x.into())?;
    e.vxor(x, x, c.t(K::SignMask))?;
    forward::exp(e, c, x)?;

    e.vmul(a2, a3, c.t(K::GeluErfOneOverSqrtPi))?;
    e.vmul(a2, a2, x.into())?;
    e.vxor(x, x, c.t(K::SignMask))?;

    // s is dead once its sign and magnitude are split off
    erf_tail(e, c, x, a3, [a0, a1, a3, a4])?;

    e.vadd(a2, a2, c.t(K::Half))?;
    e.vmul(x, x, c.t(K::Half))?;
    e.vadd(x, x, a2.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::codegen::interp::Interpreter;
    use crate::compiler::codegen::simd_ops::{BaseReg, MemOperand};
    use crate::compiler::codegen::target_desc::TargetDesc;
    use crate::eltwise::{EltwiseConfig, EltwiseInjector};

    fn run(cfg: EltwiseConfig, xs: &[f32]) -> Vec<f32> {
        let mut e = Interpreter::new(TargetDesc::PORTABLE);
        let inj = EltwiseInjector::new(&mut e, cfg).unwrap();
        let p = MemOperand::new(BaseReg::Arg(0), 0);
        e.emit_prologue().unwrap();
        e.vmov(VReg(3), p.into()).unwrap();
        inj.compute_vector(&mut e, 3).unwrap();
        e.vstore(p, VReg(3)).unwrap();
        e.emit_epilogue().unwrap();
        inj.prepare_table(&mut e).unwrap();
        let prog = e.finalize().unwrap();
        let mut buf = vec![1.0f32; 16];
        buf[..xs.len()].copy_from_slice(xs);
        unsafe { prog.invoke(&[buf.as_mut_ptr() as u64]) };
        buf.truncate(xs.len());
        buf
    }

    #[test]
    fn test_dst_variants_match_src() {
        let xs = [-2.0f32, -0.3, 0.2, 1.5, 3.0];
        for (alg, fwd) in [
            (EltwiseAlg::Elu, EltwiseAlg::EluUseDst),
            (EltwiseAlg::Tanh, EltwiseAlg::TanhUseDst),
            (EltwiseAlg::Logistic, EltwiseAlg::LogisticUseDst),
            (EltwiseAlg::Exp, EltwiseAlg::ExpUseDst),
            (EltwiseAlg::Relu, EltwiseAlg::ReluUseDst),
        ] {
            let from_src = run(EltwiseConfig::new(alg).alpha(0.5).backward(), &xs);
            let d = run(EltwiseConfig::new(fwd).alpha(0.5), &xs);
            let from_dst = run(EltwiseConfig::new(fwd).alpha(0.5).backward(), &d);
            for i in 0..xs.len() {
                assert!(
                    (from_src[i] - from_dst[i]).abs() < 1e-5,
                    "{alg:?} at {}: {} vs {}",
                    xs[i],
                    from_src[i],
                    from_dst[i]
                );
            }
        }
    }

    #[test]
    fn test_sqrt_dst() {
        let out = run(EltwiseConfig::new(EltwiseAlg::SqrtUseDst).backward(), &[2.0, 0.5]);
        assert_eq!(out, vec![0.25, 1.0]);
        let out = run(EltwiseConfig::new(EltwiseAlg::Sqrt).backward(), &[4.0]);
        assert_eq!(out, vec![0.25]);
    }

    #[test]
    fn test_piecewise_derivatives() {
        let xs = [-2.0f32, -0.5, 0.0, 0.5, 2.0];
        let abs = run(EltwiseConfig::new(EltwiseAlg::Abs).backward(), &xs);
        assert_eq!(abs, vec![-1.0, -1.0, 0.0, 1.0, 1.0]);
        let br = run(EltwiseConfig::new(EltwiseAlg::BoundedRelu).alpha(1.0).backward(), &xs);
        assert_eq!(br, vec![0.0, 0.0, 0.0, 1.0, 0.0]);
        let clip = run(
            EltwiseConfig::new(EltwiseAlg::Clip).alpha(-0.5).beta(0.5).backward(),
            &xs,
        );
        assert_eq!(clip, vec![0.0, 0.0, 1.0, 1.0, 0.0]);
        let relu = run(EltwiseConfig::new(EltwiseAlg::Relu).alpha(0.25).backward(), &xs);
        assert_eq!(relu, vec![0.25, 0.25, 0.25, 1.0, 1.0]);
    }

    #[test]
    fn test_pow_origin() {
        let out = run(EltwiseConfig::new(EltwiseAlg::Pow).alpha(1.0).beta(3.0).backward(), &[0.0, 2.0]);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 12.0).abs() < 1e-5);
    }
}
