//! jitkern: JIT reduction drivers and elementwise activation injectors for
//! CPU math kernels.
//!
//! - **Reduction**: `ReduceBalancer` groups threads over jobs, a generated
//!   `ReductionDriver` sums partial buffers, `CpuReducer` / `CpuReducer2D`
//!   orchestrate the per-thread reduction step.
//! - **Eltwise injection**: `EltwiseInjector` emits an activation function
//!   (or its derivative) in place over vector registers of a kernel being
//!   generated, with its own constant table and scratch-register plan.
//! - **Backends**: every generator targets the `SimdOps` trait. On x86_64
//!   the default `jit-x86` feature emits native AVX2 / AVX-512 code when the
//!   host supports it; otherwise, and with default features off, code runs
//!   on the portable interpreter.
//!
//! # Quick Start
//!
//! ```ignore
//! use jitkern::{EltwiseAlg, EltwiseConfig, EltwiseKernel, IsaLevel};
//!
//! let gelu = EltwiseKernel::new(EltwiseConfig::new(EltwiseAlg::GeluTanh))
//!     .compile(jitkern::best_isa())?;
//! gelu.run(&input, &mut output);
//! ```

pub mod compiler;
pub mod dispatch;
pub mod eltwise;
pub mod parallel;
pub mod reducer;
pub mod types;

pub use compiler::codegen::{compile, compile_portable, Kernel, KernelSource, MaskKind, TargetDesc};
pub use compiler::codegen::simd_ops::SimdOps;
pub use dispatch::{best_isa, may_use, IsaLevel};
pub use eltwise::{
    Direction, EltwiseAlg, EltwiseConfig, EltwiseInjector, EltwiseKernel, InjectorRegisterPlan,
};
pub use parallel::{parallel_nd, ThreadTeam};
pub use reducer::{
    balance211, BalancerInputs, CpuAccumulator1D, CpuReducer, CpuReducer2D, ReduceBalancer,
    Reducer2DConfig, ReducerConfig, ReductionDriver, Scratchpad, ScratchpadRegistry,
};
pub use types::{DataType, JitError, JitResult, ReduceElem};
