//! JIT compilation layer.
//!
//! ```text
//! KernelSource (driver / eltwise) → SimdOps backend → Kernel
//!                                     codegen/          executable.rs
//! ```

pub mod codegen;
pub mod executable;

pub use codegen::{compile, compile_portable, Kernel, KernelSource};
pub use executable::{CompiledKernel, CompiledKernelFn};
