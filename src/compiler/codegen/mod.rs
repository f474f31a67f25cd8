//! Code generation backends and dispatch.
//!
//! Generators (the reduction driver, eltwise kernels) are written once
//! against the `SimdOps` trait through `KernelSource`. `compile` picks a
//! backend for the requested ISA level:
//!
//! ```text
//! KernelSource ──emit──▶ X86Emitter  ──▶ CompiledKernel  (jit-x86, native ISA)
//!              └─emit──▶ Interpreter ──▶ Program         (everywhere else)
//! ```

pub mod interp;
pub mod simd_ops;
pub mod target_desc;
#[cfg(all(feature = "jit-x86", target_arch = "x86_64"))]
pub mod x86_64;

use std::sync::Once;

pub use interp::{Interpreter, Program};
pub use simd_ops::SimdOps;
pub use target_desc::{MaskKind, TargetDesc};

#[cfg(all(feature = "jit-x86", target_arch = "x86_64"))]
use crate::compiler::executable::CompiledKernel;
use crate::dispatch::IsaLevel;
use crate::types::JitResult;

/// Something that can generate a complete kernel on any backend.
pub trait KernelSource {
    /// Emit the full kernel (prologue, body, epilogue, data).
    fn emit<E: SimdOps>(&self, e: &mut E) -> JitResult<()>;
}

/// A finalized kernel from either backend.
#[derive(Debug)]
pub enum Kernel {
    Portable(Program),
    #[cfg(all(feature = "jit-x86", target_arch = "x86_64"))]
    Native { code: CompiledKernel, target: TargetDesc },
}

impl Kernel {
    /// Call the kernel with up to six integer arguments.
    ///
    /// # Safety
    /// Every pointer in `args` must be valid for the reads and writes the
    /// generated code performs.
    #[inline]
    pub unsafe fn invoke(&self, args: &[u64]) {
        match self {
            Kernel::Portable(p) => p.invoke(args),
            #[cfg(all(feature = "jit-x86", target_arch = "x86_64"))]
            Kernel::Native { code, .. } => code.invoke(args),
        }
    }

    /// Shape the kernel was generated for.
    pub fn target(&self) -> TargetDesc {
        match self {
            Kernel::Portable(p) => p.target(),
            #[cfg(all(feature = "jit-x86", target_arch = "x86_64"))]
            Kernel::Native { target, .. } => *target,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Kernel::Portable(_) => "portable",
            #[cfg(all(feature = "jit-x86", target_arch = "x86_64"))]
            Kernel::Native { .. } => "x86_64",
        }
    }

    /// Bytes of generated code, or recorded instructions for the portable backend.
    pub fn code_size(&self) -> usize {
        match self {
            Kernel::Portable(p) => p.len(),
            #[cfg(all(feature = "jit-x86", target_arch = "x86_64"))]
            Kernel::Native { code, .. } => code.code_size(),
        }
    }
}

/// Portable target with the same shape as `isa`, so a kernel generated for
/// a missing ISA keeps its register plan and loop strides.
pub fn portable_target(isa: IsaLevel) -> TargetDesc {
    match isa {
        IsaLevel::Avx2 => TargetDesc::portable(8, 16, MaskKind::Vector),
        IsaLevel::Avx512 | IsaLevel::Portable => TargetDesc::PORTABLE,
    }
}

static FALLBACK_WARNING: Once = Once::new();

/// Generate `source` for `isa`, on the native backend when it may be used.
pub fn compile<S: KernelSource + ?Sized>(source: &S, isa: IsaLevel) -> JitResult<Kernel> {
    #[cfg(all(feature = "jit-x86", target_arch = "x86_64"))]
    if isa != IsaLevel::Portable && crate::dispatch::may_use(isa) {
        let mut e = x86_64::X86Emitter::new(isa)?;
        let target = e.target();
        source.emit(&mut e)?;
        let code = e.finalize()?;
        log::debug!("compiled {} bytes for {isa}", code.code_size());
        return Ok(Kernel::Native { code, target });
    }
    if isa != IsaLevel::Portable {
        FALLBACK_WARNING.call_once(|| {
            log::warn!("native backend unavailable for {isa}, using the portable backend");
        });
    }
    compile_portable(source, portable_target(isa))
}

/// Generate `source` on the portable backend with an explicit shape.
pub fn compile_portable<S: KernelSource + ?Sized>(
    source: &S,
    target: TargetDesc,
) -> JitResult<Kernel> {
    let mut e = Interpreter::new(target);
    source.emit(&mut e)?;
    Ok(Kernel::Portable(e.finalize()?))
}
