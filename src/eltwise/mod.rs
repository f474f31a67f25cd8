//! Eltwise activation injector.
//!
//! `EltwiseInjector` emits in-place evaluation of an activation function (or
//! its derivative) over a set of vector registers of a kernel being
//! generated. The function catalog is the closed `EltwiseAlg` enum; each
//! variant carries an `AlgInfo` describing its scratch budget and the
//! constant groups its code reads.
//!
//! # Layout
//!
//! ```text
//! constants.rs   raw bit patterns (polynomials, tables)
//! table.rs       ConstTableBuilder: register → finalize → emit
//! regs.rs        RegisterArena / InjectorRegisterPlan / ScratchScope
//! injector.rs    EltwiseInjector (preamble, passes, postamble)
//! forward.rs     per-function forward emission
//! backward.rs    per-function derivative emission
//! kernel.rs      EltwiseKernel: a standalone buffer kernel around the injector
//! ```

pub mod constants;
mod backward;
mod forward;
pub mod injector;
pub mod kernel;
pub mod regs;
pub mod table;

pub use injector::EltwiseInjector;
pub use kernel::EltwiseKernel;
pub use regs::{InjectorRegisterPlan, PassPlan, RegisterArena, ScratchScope};
pub use table::{ConstKey, ConstTableBuilder};

use crate::compiler::codegen::simd_ops::GReg;

/// Activation functions the injector can emit.
///
/// The `*UseDst` variants compute the same forward function but their
/// derivative is expressed in terms of the forward output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EltwiseAlg {
    Relu,
    Elu,
    Tanh,
    Square,
    Abs,
    Sqrt,
    Linear,
    BoundedRelu,
    SoftRelu,
    Logistic,
    Exp,
    GeluTanh,
    Swish,
    Log,
    Clip,
    Pow,
    GeluErf,
    Round,
    ReluUseDst,
    EluUseDst,
    TanhUseDst,
    SqrtUseDst,
    LogisticUseDst,
    ExpUseDst,
}

impl EltwiseAlg {
    pub const ALL: [EltwiseAlg; 24] = [
        EltwiseAlg::Relu,
        EltwiseAlg::Elu,
        EltwiseAlg::Tanh,
        EltwiseAlg::Square,
        EltwiseAlg::Abs,
        EltwiseAlg::Sqrt,
        EltwiseAlg::Linear,
        EltwiseAlg::BoundedRelu,
        EltwiseAlg::SoftRelu,
        EltwiseAlg::Logistic,
        EltwiseAlg::Exp,
        EltwiseAlg::GeluTanh,
        EltwiseAlg::Swish,
        EltwiseAlg::Log,
        EltwiseAlg::Clip,
        EltwiseAlg::Pow,
        EltwiseAlg::GeluErf,
        EltwiseAlg::Round,
        EltwiseAlg::ReluUseDst,
        EltwiseAlg::EluUseDst,
        EltwiseAlg::TanhUseDst,
        EltwiseAlg::SqrtUseDst,
        EltwiseAlg::LogisticUseDst,
        EltwiseAlg::ExpUseDst,
    ];

    /// Function computed in the forward direction.
    pub fn base(self) -> EltwiseAlg {
        match self {
            EltwiseAlg::ReluUseDst => EltwiseAlg::Relu,
            EltwiseAlg::EluUseDst => EltwiseAlg::Elu,
            EltwiseAlg::TanhUseDst => EltwiseAlg::Tanh,
            EltwiseAlg::SqrtUseDst => EltwiseAlg::Sqrt,
            EltwiseAlg::LogisticUseDst => EltwiseAlg::Logistic,
            EltwiseAlg::ExpUseDst => EltwiseAlg::Exp,
            other => other,
        }
    }

    /// Whether the derivative takes the forward output as input.
    pub fn uses_dst(self) -> bool {
        self != self.base()
    }

    pub fn info(self) -> AlgInfo {
        AlgInfo::of(self)
    }
}

/// Constant groups a function reads besides the common set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConstGroups {
    pub exp: bool,
    pub tanh: bool,
    pub soft_relu: bool,
    pub gelu_tanh: bool,
    pub gelu_erf: bool,
    pub log: bool,
}

/// Per-function metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgInfo {
    /// Scratch vectors for the forward code.
    pub aux_vecs_fwd: usize,
    /// Scratch vectors for the derivative code.
    pub aux_vecs_bwd: usize,
    /// Scratch GPRs (forward, backward).
    pub aux_gprs: (usize, usize),
    pub consts: ConstGroups,
    pub backward: bool,
}

impl AlgInfo {
    fn of(alg: EltwiseAlg) -> AlgInfo {
        use EltwiseAlg::*;
        const NONE: ConstGroups = ConstGroups {
            exp: false,
            tanh: false,
            soft_relu: false,
            gelu_tanh: false,
            gelu_erf: false,
            log: false,
        };
        let exp = ConstGroups { exp: true, ..NONE };
        let tanh = ConstGroups { tanh: true, ..NONE };
        let (fwd, bwd, gprs, consts) = match alg {
            Relu => (1, 0, (0, 0), NONE),
            ReluUseDst => (1, 0, (0, 0), NONE),
            Elu => (3, 2, (0, 0), exp),
            EluUseDst => (3, 0, (0, 0), exp),
            Tanh => (4, 4, (1, 1), tanh),
            TanhUseDst => (4, 1, (1, 0), tanh),
            Square => (0, 0, (0, 0), NONE),
            Abs => (0, 0, (0, 0), NONE),
            Sqrt => (0, 1, (0, 0), NONE),
            SqrtUseDst => (0, 1, (0, 0), NONE),
            Linear => (0, 0, (0, 0), NONE),
            BoundedRelu => (0, 0, (0, 0), NONE),
            SoftRelu => (4, 4, (0, 0), ConstGroups { soft_relu: true, ..exp }),
            Logistic => (4, 4, (0, 0), exp),
            LogisticUseDst => (4, 1, (0, 0), exp),
            Exp => (2, 2, (0, 0), exp),
            ExpUseDst => (2, 0, (0, 0), exp),
            GeluTanh => (5, 6, (1, 1), ConstGroups { gelu_tanh: true, ..tanh }),
            Swish => (5, 5, (0, 0), exp),
            Log => (4, 1, (1, 0), ConstGroups { log: true, ..NONE }),
            Clip => (0, 1, (0, 0), NONE),
            Pow => (1, 2, (0, 0), NONE),
            GeluErf => (5, 5, (0, 0), ConstGroups { gelu_erf: true, ..exp }),
            Round => (0, 0, (0, 0), NONE),
        };
        AlgInfo {
            aux_vecs_fwd: fwd,
            aux_vecs_bwd: bwd,
            aux_gprs: gprs,
            consts,
            backward: alg != Round,
        }
    }

    /// Scratch vectors for `direction`.
    pub fn aux_vecs(&self, direction: Direction) -> usize {
        match direction {
            Direction::Forward => self.aux_vecs_fwd,
            Direction::Backward => self.aux_vecs_bwd,
        }
    }

    /// Scratch GPRs for `direction`.
    pub fn aux_gprs(&self, direction: Direction) -> usize {
        match direction {
            Direction::Forward => self.aux_gprs.0,
            Direction::Backward => self.aux_gprs.1,
        }
    }
}

/// Forward function or its derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
}

/// Injector configuration.
#[derive(Debug, Clone)]
pub struct EltwiseConfig {
    pub alg: EltwiseAlg,
    pub alpha: f32,
    pub beta: f32,
    /// Output multiplier applied after the function.
    pub scale: f32,
    pub direction: Direction,
    /// Derivative input is the forward output (set from `alg`).
    pub use_dst: bool,
    /// Preserve every register the injector touches.
    pub save_state: bool,
    /// GPR holding the constant table address.
    pub table_reg: GReg,
}

impl EltwiseConfig {
    pub fn new(alg: EltwiseAlg) -> Self {
        EltwiseConfig {
            alg,
            alpha: 0.0,
            beta: 0.0,
            scale: 1.0,
            direction: Direction::Forward,
            use_dst: alg.uses_dst(),
            save_state: true,
            table_reg: GReg::RBP,
        }
    }

    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    pub fn scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn backward(mut self) -> Self {
        self.direction = Direction::Backward;
        self
    }

    pub fn save_state(mut self, save: bool) -> Self {
        self.save_state = save;
        self
    }

    pub fn table_reg(mut self, reg: GReg) -> Self {
        self.table_reg = reg;
        self
    }

    /// Constant groups this configuration reads.
    pub fn const_groups(&self) -> ConstGroups {
        self.alg.info().consts
    }

    pub fn aux_vecs_count(&self) -> usize {
        self.alg.info().aux_vecs(self.direction)
    }

    pub fn aux_gprs_count(&self) -> usize {
        self.alg.info().aux_gprs(self.direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_use_dst_variants() {
        for alg in EltwiseAlg::ALL {
            assert_eq!(alg.uses_dst(), alg != alg.base());
            assert!(!alg.base().uses_dst());
        }
        assert!(EltwiseConfig::new(EltwiseAlg::ExpUseDst).use_dst);
        assert!(!EltwiseConfig::new(EltwiseAlg::Exp).use_dst);
    }

    #[test]
    fn test_round_forward_only() {
        assert!(!EltwiseAlg::Round.info().backward);
        assert!(EltwiseAlg::ALL
            .iter()
            .filter(|&&a| a != EltwiseAlg::Round)
            .all(|a| a.info().backward));
    }

    #[test]
    fn test_const_groups() {
        let g = EltwiseAlg::GeluTanh.info().consts;
        assert!(g.tanh && g.gelu_tanh && !g.exp);
        let g = EltwiseAlg::SoftRelu.info().consts;
        assert!(g.exp && g.soft_relu);
        assert_eq!(EltwiseAlg::Relu.info().consts, ConstGroups::default());
    }

    #[test]
    fn test_config_builder() {
        let c = EltwiseConfig::new(EltwiseAlg::Tanh).alpha(0.5).backward().save_state(false);
        assert_eq!(c.direction, Direction::Backward);
        assert_eq!(c.alpha, 0.5);
        assert_eq!(c.aux_vecs_count(), 4);
        assert_eq!(c.aux_gprs_count(), 1);
        assert!(!c.save_state);
    }
}
