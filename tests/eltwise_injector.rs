//! Integration tests for the eltwise injector on the portable backend.
//!
//! - forward values against f64 closed forms
//! - derivatives against central differences of the closed forms
//! - known edge values
//! - register-range splitting and spill bookkeeping

use proptest::prelude::*;

use jitkern::compiler::codegen::simd_ops::{BaseReg, MemOperand, VReg};
use jitkern::{
    compile_portable, EltwiseAlg, EltwiseConfig, EltwiseInjector, EltwiseKernel, IsaLevel,
    JitResult, KernelSource, MaskKind, SimdOps, TargetDesc,
};

fn run(cfg: EltwiseConfig, xs: &[f32]) -> Vec<f32> {
    let f = EltwiseKernel::new(cfg).compile(IsaLevel::Portable).unwrap();
    let mut out = vec![0.0f32; xs.len()];
    f.run(xs, &mut out);
    out
}

fn close(got: f32, want: f64, rel: f64, abs: f64) -> bool {
    if want.is_nan() {
        return got.is_nan();
    }
    if want.is_infinite() {
        return got as f64 == want;
    }
    (got as f64 - want).abs() <= rel * want.abs() + abs
}

fn erf(x: f64) -> f64 {
    // erfc(4) < 2e-8
    if x.abs() > 4.0 {
        return x.signum();
    }
    // Maclaurin series; accurate to ~1e-9 for |x| <= 4
    let mut term = x;
    let mut sum = x;
    for n in 1..120 {
        term *= -x * x / n as f64;
        sum += term / (2 * n + 1) as f64;
    }
    sum * 2.0 / std::f64::consts::PI.sqrt()
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn reference(alg: EltwiseAlg, alpha: f64, beta: f64) -> impl Fn(f64) -> f64 {
    move |x: f64| match alg {
        EltwiseAlg::Relu => {
            if x > 0.0 {
                x
            } else {
                alpha * x
            }
        }
        EltwiseAlg::Elu => {
            if x > 0.0 {
                x
            } else {
                alpha * (x.exp() - 1.0)
            }
        }
        EltwiseAlg::Tanh => x.tanh(),
        EltwiseAlg::Square => x * x,
        EltwiseAlg::Abs => x.abs(),
        EltwiseAlg::Sqrt => x.sqrt(),
        EltwiseAlg::Linear => alpha * x + beta,
        EltwiseAlg::BoundedRelu => x.max(0.0).min(alpha),
        EltwiseAlg::SoftRelu => x.exp().ln_1p(),
        EltwiseAlg::Logistic => logistic(x),
        EltwiseAlg::Exp => x.exp(),
        EltwiseAlg::GeluTanh => {
            let k = (2.0 / std::f64::consts::PI).sqrt();
            0.5 * x * (1.0 + (k * (x + 0.044715 * x * x * x)).tanh())
        }
        EltwiseAlg::Swish => x * logistic(alpha * x),
        EltwiseAlg::Log => x.ln(),
        EltwiseAlg::Clip => x.max(alpha).min(beta),
        EltwiseAlg::Pow => alpha * x.powf(beta),
        EltwiseAlg::GeluErf => 0.5 * x * (1.0 + erf(x / std::f64::consts::SQRT_2)),
        EltwiseAlg::Round => x.round_ties_even(),
        other => panic!("{other:?} is not a base function"),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 1. Forward values
// ═══════════════════════════════════════════════════════════════════════

const SAMPLES: [f32; 7] = [-10.0, -1.0, -0.0001, 0.0, 0.0001, 1.0, 10.0];

#[test]
fn forward_matches_closed_forms() {
    let cases: &[(EltwiseAlg, f32, f32)] = &[
        (EltwiseAlg::Relu, 0.0, 0.0),
        (EltwiseAlg::Relu, 0.1, 0.0),
        (EltwiseAlg::Elu, 1.0, 0.0),
        (EltwiseAlg::Tanh, 0.0, 0.0),
        (EltwiseAlg::Logistic, 0.0, 0.0),
        (EltwiseAlg::Exp, 0.0, 0.0),
        (EltwiseAlg::Square, 0.0, 0.0),
        (EltwiseAlg::Abs, 0.0, 0.0),
        (EltwiseAlg::Sqrt, 0.0, 0.0),
        (EltwiseAlg::Linear, 2.0, 0.5),
        (EltwiseAlg::Pow, 1.0, 2.0),
        (EltwiseAlg::BoundedRelu, 3.0, 0.0),
        (EltwiseAlg::SoftRelu, 0.0, 0.0),
        (EltwiseAlg::GeluTanh, 0.0, 0.0),
        (EltwiseAlg::GeluErf, 0.0, 0.0),
        (EltwiseAlg::Swish, 1.0, 0.0),
        (EltwiseAlg::Clip, -1.0, 2.0),
        (EltwiseAlg::Round, 0.0, 0.0),
    ];
    for &(alg, alpha, beta) in cases {
        let got = run(EltwiseConfig::new(alg).alpha(alpha).beta(beta), &SAMPLES);
        let f = reference(alg, alpha as f64, beta as f64);
        for (&x, &g) in SAMPLES.iter().zip(&got) {
            let want = f(x as f64);
            assert!(close(g, want, 1e-4, 1e-6), "{alg:?}({x}) = {g}, expected {want}");
        }
    }
}

#[test]
fn forward_positive_domain() {
    let xs = [1e-30f32, 1e-3, 0.5, 1.0, 1.5, 2.0, 1e3, 3e38];
    for (alg, beta) in [(EltwiseAlg::Log, 0.0f32), (EltwiseAlg::Pow, 2.5), (EltwiseAlg::Pow, -1.0)] {
        let got = run(EltwiseConfig::new(alg).alpha(1.0).beta(beta), &xs);
        let f = reference(alg, 1.0, beta as f64);
        for (&x, &g) in xs.iter().zip(&got) {
            let want = f(x as f64);
            if want.abs() > f32::MAX as f64 || (want != 0.0 && want.abs() < f32::MIN_POSITIVE as f64) {
                continue;
            }
            // the log table carries the exponent bias, which leaves log(1) at about -1.4e-6
            assert!(close(g, want, 1e-5, 2e-6), "{alg:?} beta={beta} ({x}) = {g}, expected {want}");
        }
    }
}

#[test]
fn scale_multiplies_output() {
    let got = run(EltwiseConfig::new(EltwiseAlg::Tanh).scale(-2.0), &[0.5, 3.0]);
    assert!(close(got[0], -2.0 * 0.5f64.tanh(), 1e-6, 0.0));
    assert!(close(got[1], -2.0 * 3.0f64.tanh(), 1e-6, 0.0));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_transcendentals_track_libm(xs in prop::collection::vec(-30.0f32..30.0, 1..40)) {
        for alg in [EltwiseAlg::Tanh, EltwiseAlg::Exp, EltwiseAlg::Logistic, EltwiseAlg::GeluTanh] {
            let got = run(EltwiseConfig::new(alg), &xs);
            let f = reference(alg, 0.0, 0.0);
            for (&x, &g) in xs.iter().zip(&got) {
                let want = f(x as f64);
                prop_assert!(close(g, want, 1e-5, 1e-5), "{:?}({}) = {}, expected {}", alg, x, g, want);
            }
        }
    }

    #[test]
    fn prop_log_tracks_libm(xs in prop::collection::vec(1e-6f32..1e6, 1..40)) {
        let got = run(EltwiseConfig::new(EltwiseAlg::Log), &xs);
        for (&x, &g) in xs.iter().zip(&got) {
            let want = (x as f64).ln();
            prop_assert!(close(g, want, 1e-5, 1e-5), "log({}) = {}, expected {}", x, g, want);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 2. Derivatives
// ═══════════════════════════════════════════════════════════════════════

fn numeric_derivative(f: &impl Fn(f64) -> f64, x: f64) -> f64 {
    let h = 1e-5 * x.abs().max(1.0);
    (f(x + h) - f(x - h)) / (2.0 * h)
}

#[test]
fn backward_matches_central_differences() {
    let anywhere = [-2.5f32, -1.0, -0.3, 0.4, 1.0, 2.5];
    let positive = [0.3f32, 1.0, 2.5, 7.0];
    // clip(-1, 2) has kinks at both bounds
    let inside_clip = [-2.5f32, -0.3, 0.4, 1.0, 2.5];
    let cases: &[(EltwiseAlg, f32, f32, &[f32])] = &[
        (EltwiseAlg::Relu, 0.1, 0.0, &anywhere),
        (EltwiseAlg::Elu, 0.7, 0.0, &anywhere),
        (EltwiseAlg::Tanh, 0.0, 0.0, &anywhere),
        (EltwiseAlg::Square, 0.0, 0.0, &anywhere),
        (EltwiseAlg::Abs, 0.0, 0.0, &anywhere),
        (EltwiseAlg::Sqrt, 0.0, 0.0, &positive),
        (EltwiseAlg::Linear, 2.0, 0.5, &anywhere),
        (EltwiseAlg::BoundedRelu, 2.0, 0.0, &anywhere),
        (EltwiseAlg::SoftRelu, 0.0, 0.0, &anywhere),
        (EltwiseAlg::Logistic, 0.0, 0.0, &anywhere),
        (EltwiseAlg::Exp, 0.0, 0.0, &anywhere),
        (EltwiseAlg::GeluTanh, 0.0, 0.0, &anywhere),
        (EltwiseAlg::GeluErf, 0.0, 0.0, &anywhere),
        (EltwiseAlg::Swish, 1.5, 0.0, &anywhere),
        (EltwiseAlg::Log, 0.0, 0.0, &positive),
        (EltwiseAlg::Clip, -1.0, 2.0, &inside_clip),
        (EltwiseAlg::Pow, 1.5, 2.5, &positive),
        (EltwiseAlg::Pow, 1.5, 2.0, &anywhere),
        (EltwiseAlg::Pow, 1.5, 0.5, &positive),
        (EltwiseAlg::Pow, 1.5, -1.0, &positive),
    ];
    for &(alg, alpha, beta, xs) in cases {
        let got = run(EltwiseConfig::new(alg).alpha(alpha).beta(beta).backward(), xs);
        let f = reference(alg, alpha as f64, beta as f64);
        for (&x, &g) in xs.iter().zip(&got) {
            let want = numeric_derivative(&f, x as f64);
            assert!(
                close(g, want, 1e-3, 1e-3),
                "d{alg:?}(alpha={alpha}, beta={beta})/dx at {x} = {g}, expected {want}"
            );
        }
    }
}

#[test]
fn backward_from_forward_output() {
    let xs = [-2.0f32, -0.5, 0.25, 1.0, 3.0];
    for (alg, dst_alg, alpha) in [
        (EltwiseAlg::Relu, EltwiseAlg::ReluUseDst, 0.2f32),
        (EltwiseAlg::Elu, EltwiseAlg::EluUseDst, 0.7),
        (EltwiseAlg::Tanh, EltwiseAlg::TanhUseDst, 0.0),
        (EltwiseAlg::Logistic, EltwiseAlg::LogisticUseDst, 0.0),
        (EltwiseAlg::Exp, EltwiseAlg::ExpUseDst, 0.0),
    ] {
        let fwd = run(EltwiseConfig::new(dst_alg).alpha(alpha), &xs);
        let got = run(EltwiseConfig::new(dst_alg).alpha(alpha).backward(), &fwd);
        let f = reference(alg, alpha as f64, 0.0);
        for (&x, &g) in xs.iter().zip(&got) {
            let want = numeric_derivative(&f, x as f64);
            assert!(close(g, want, 1e-3, 1e-3), "{dst_alg:?}' at {x} = {g}, expected {want}");
        }
    }

    let xs = [0.5f32, 4.0, 9.0];
    let fwd = run(EltwiseConfig::new(EltwiseAlg::SqrtUseDst), &xs);
    let got = run(EltwiseConfig::new(EltwiseAlg::SqrtUseDst).backward(), &fwd);
    for (&x, &g) in xs.iter().zip(&got) {
        assert!(close(g, 0.5 / (x as f64).sqrt(), 1e-6, 0.0));
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 3. Edge values
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn known_edge_values() {
    let log = run(EltwiseConfig::new(EltwiseAlg::Log), &[0.0, -1.0, 1.0]);
    assert_eq!(log[0], f32::NEG_INFINITY);
    assert!(log[1].is_nan());
    assert!(log[2].abs() < 1e-5);

    let relu = run(EltwiseConfig::new(EltwiseAlg::Relu), &[-5.0, 5.0]);
    assert_eq!(relu, vec![0.0, 5.0]);

    assert_eq!(run(EltwiseConfig::new(EltwiseAlg::Tanh), &[0.0]), vec![0.0]);
    assert_eq!(run(EltwiseConfig::new(EltwiseAlg::Sqrt), &[4.0]), vec![2.0]);

    let exp = run(EltwiseConfig::new(EltwiseAlg::Exp), &[-200.0, 0.0, 100.0]);
    assert_eq!(exp[0], 0.0);
    assert!((exp[1] - 1.0).abs() < 1e-6);
    assert!(exp[2] > 1e38);

    let tanh = run(EltwiseConfig::new(EltwiseAlg::Tanh), &[-50.0, 50.0]);
    assert_eq!(tanh, vec![-1.0, 1.0]);

    let logistic = run(EltwiseConfig::new(EltwiseAlg::Logistic), &[-100.0, 100.0]);
    assert_eq!(logistic, vec![0.0, 1.0]);
}

#[test]
fn gelu_erf_saturates_at_large_inputs() {
    let got = run(EltwiseConfig::new(EltwiseAlg::GeluErf), &[-10.0, -6.0, 6.0, 10.0]);
    assert!(got[0].abs() < 1e-6 && got[1].abs() < 1e-6, "{got:?}");
    assert!(close(got[2], 6.0, 1e-6, 0.0) && close(got[3], 10.0, 1e-6, 0.0), "{got:?}");
}

#[test]
fn log_of_one_is_near_zero() {
    let got = run(EltwiseConfig::new(EltwiseAlg::Log), &[1.0]);
    assert!(got[0].abs() <= 2e-6, "log(1) = {}", got[0]);
}

#[test]
fn clip_derivative_on_each_side_of_the_bounds() {
    let cfg = EltwiseConfig::new(EltwiseAlg::Clip).alpha(-1.0).beta(2.0).backward();
    assert_eq!(run(cfg, &[-1.5, -0.5, 1.5, 2.5]), vec![0.0, 1.0, 1.0, 0.0]);
}

#[test]
fn round_has_no_derivative() {
    let f = EltwiseKernel::new(EltwiseConfig::new(EltwiseAlg::Round).backward()).compile(IsaLevel::Portable);
    assert!(matches!(f, Err(jitkern::JitError::Unsupported(_))));
}

// ═══════════════════════════════════════════════════════════════════════
// 4. Register-range splitting
// ═══════════════════════════════════════════════════════════════════════

/// Loads every vector register from a buffer, runs the injector over each
/// index set in turn and stores every register back.
struct RegisterFile {
    cfg: EltwiseConfig,
    sets: Vec<Vec<usize>>,
}

impl KernelSource for RegisterFile {
    fn emit<E: SimdOps>(&self, e: &mut E) -> JitResult<()> {
        let t = e.target();
        let vlen = t.simd_bytes() as i32;
        let buf = BaseReg::Arg(0);
        let inj = EltwiseInjector::new(e, self.cfg.clone())?;
        e.emit_prologue()?;
        for i in 0..t.num_simd_regs {
            e.vmov(VReg(i as u8), MemOperand::new(buf, i as i32 * vlen).into())?;
        }
        for set in &self.sets {
            inj.compute_vector_set(e, set)?;
        }
        for i in 0..t.num_simd_regs {
            e.vstore(MemOperand::new(buf, i as i32 * vlen), VReg(i as u8))?;
        }
        e.emit_epilogue()?;
        inj.prepare_table(e)
    }
}

fn run_register_file(cfg: &EltwiseConfig, target: TargetDesc, sets: Vec<Vec<usize>>, input: &[f32]) -> Vec<u32> {
    let k = compile_portable(
        &RegisterFile {
            cfg: cfg.clone(),
            sets,
        },
        target,
    )
    .unwrap();
    let mut buf = input.to_vec();
    unsafe { k.invoke(&[buf.as_mut_ptr() as u64]) };
    buf.iter().map(|v| v.to_bits()).collect()
}

fn register_input(target: TargetDesc) -> Vec<f32> {
    let n = target.num_simd_regs * target.simd_width_f32;
    (0..n).map(|i| ((i * 37) % 101) as f32 / 10.0 - 5.0).collect()
}

#[test]
fn full_range_matches_single_registers() {
    let targets = [TargetDesc::PORTABLE, TargetDesc::portable(8, 16, MaskKind::Vector)];
    let cfgs = [
        EltwiseConfig::new(EltwiseAlg::Tanh),
        EltwiseConfig::new(EltwiseAlg::GeluErf),
        EltwiseConfig::new(EltwiseAlg::GeluTanh).backward(),
        EltwiseConfig::new(EltwiseAlg::Log),
        EltwiseConfig::new(EltwiseAlg::Pow).alpha(1.0).beta(1.5),
        EltwiseConfig::new(EltwiseAlg::Relu).alpha(0.5),
    ];
    for target in targets {
        let input = register_input(target);
        let n = target.num_simd_regs;
        for cfg in &cfgs {
            let plan = {
                let mut e = jitkern::compiler::codegen::Interpreter::new(target);
                EltwiseInjector::new(&mut e, cfg.clone()).unwrap().plan(&(0..n).collect::<Vec<_>>())
            };
            if cfg.aux_vecs_count() > 0 {
                assert!(plan.is_split(), "{:?} over all registers should split", cfg.alg);
            }
            let whole = run_register_file(cfg, target, vec![(0..n).collect()], &input);
            let single = run_register_file(cfg, target, (0..n).map(|i| vec![i]).collect(), &input);
            assert_eq!(whole, single, "{:?} {:?} on {} regs", cfg.alg, cfg.direction, n);
        }
    }
}

#[test]
fn registers_outside_the_set_survive() {
    let target = TargetDesc::portable(8, 16, MaskKind::Vector);
    let input = register_input(target);
    let w = target.simd_width_f32;
    let set: Vec<usize> = (3..11).collect();
    for cfg in [
        EltwiseConfig::new(EltwiseAlg::Tanh),
        EltwiseConfig::new(EltwiseAlg::Swish).alpha(1.0).backward(),
        EltwiseConfig::new(EltwiseAlg::Pow).alpha(2.0).beta(3.5),
    ] {
        let out = run_register_file(&cfg, target, vec![set.clone()], &input);
        for r in (0..16).filter(|r| !set.contains(r)) {
            for l in 0..w {
                assert_eq!(out[r * w + l], input[r * w + l].to_bits(), "{:?} clobbered v{r}", cfg.alg);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_any_index_set_matches_single_registers(
        set in prop::collection::btree_set(0usize..16, 1..16),
        alg in prop_oneof![
            Just(EltwiseAlg::Exp),
            Just(EltwiseAlg::Tanh),
            Just(EltwiseAlg::SoftRelu),
            Just(EltwiseAlg::Elu),
        ],
    ) {
        let target = TargetDesc::portable(4, 16, MaskKind::Vector);
        let input = register_input(target);
        let cfg = EltwiseConfig::new(alg).alpha(0.5);
        let set: Vec<usize> = set.into_iter().collect();
        let whole = run_register_file(&cfg, target, vec![set.clone()], &input);
        let single = run_register_file(&cfg, target, set.iter().map(|&i| vec![i]).collect(), &input);
        prop_assert_eq!(whole, single);
    }
}
