//! Target descriptor: the platform-independent hardware description for codegen.
//!
//! Captures SIMD width, register count and mask flavour. The injector and
//! the reduction driver read these to size register plans and loop strides
//! without knowing the concrete backend.

use crate::dispatch::IsaLevel;

/// How comparison results are held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskKind {
    /// Dedicated predicate registers (AVX-512 opmasks).
    Predicate,
    /// All-ones/all-zeros lanes in an ordinary vector register (AVX2).
    Vector,
}

/// Platform-independent description of the target's SIMD capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetDesc {
    /// ISA the code is generated for.
    pub isa: IsaLevel,
    /// Number of f32 elements per SIMD register (8=AVX2, 16=AVX-512).
    pub simd_width_f32: usize,
    /// Total number of SIMD registers (16=AVX2, 32=AVX-512).
    pub num_simd_regs: usize,
    /// Comparison result flavour.
    pub mask_kind: MaskKind,
}

impl TargetDesc {
    pub const AVX2: TargetDesc = TargetDesc {
        isa: IsaLevel::Avx2,
        simd_width_f32: 8,
        num_simd_regs: 16,
        mask_kind: MaskKind::Vector,
    };

    pub const AVX512: TargetDesc = TargetDesc {
        isa: IsaLevel::Avx512,
        simd_width_f32: 16,
        num_simd_regs: 32,
        mask_kind: MaskKind::Predicate,
    };

    /// Portable target shaped like AVX-512.
    pub const PORTABLE: TargetDesc = TargetDesc {
        isa: IsaLevel::Portable,
        simd_width_f32: 16,
        num_simd_regs: 32,
        mask_kind: MaskKind::Predicate,
    };

    /// Portable target with an explicit shape, used to mirror narrower ISAs.
    pub fn portable(simd_width_f32: usize, num_simd_regs: usize, mask_kind: MaskKind) -> Self {
        assert!(
            matches!(simd_width_f32, 4 | 8 | 16),
            "unsupported portable width {simd_width_f32}"
        );
        assert!(
            (8..=32).contains(&num_simd_regs),
            "unsupported portable register count {num_simd_regs}"
        );
        TargetDesc {
            isa: IsaLevel::Portable,
            simd_width_f32,
            num_simd_regs,
            mask_kind,
        }
    }

    /// Descriptor for a native ISA level (portable for `Portable`).
    pub fn for_isa(isa: IsaLevel) -> Self {
        match isa {
            IsaLevel::Avx512 => Self::AVX512,
            IsaLevel::Avx2 => Self::AVX2,
            IsaLevel::Portable => Self::PORTABLE,
        }
    }

    /// SIMD register width in bytes.
    #[inline]
    pub fn simd_bytes(&self) -> usize {
        self.simd_width_f32 * 4
    }
}
