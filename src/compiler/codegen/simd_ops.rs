//! SimdOps trait: a virtual SIMD instruction set for platform-agnostic codegen.
//!
//! The injector and the reduction driver generate code by calling methods on
//! `SimdOps`. Each backend (portable interpreter, x86_64) provides a concrete
//! implementation: the interpreter records an instruction stream, the x86
//! backend emits real machine instructions.
//!
//! Key design decisions:
//! - `VReg(u8)` / `GReg(u8)` are physical register indices. General-purpose
//!   registers use the x86-64 encoding numbers on every backend so the
//!   calling convention (`ARG_GPRS`) is shared.
//! - The second source of most vector ops is a `VOperand`, so constants can
//!   be read straight from the constant table without a scratch register.
//! - Generic `<E: SimdOps>` ensures monomorphization (no vtable overhead).

use super::target_desc::TargetDesc;
use crate::types::JitResult;

// ── Register model ──────────────────────────────────────────────────────────

/// Physical SIMD register index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u8);

/// Physical general-purpose register (x86-64 encoding number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GReg(pub u8);

impl GReg {
    pub const RAX: GReg = GReg(0);
    pub const RCX: GReg = GReg(1);
    pub const RDX: GReg = GReg(2);
    pub const RBX: GReg = GReg(3);
    pub const RSP: GReg = GReg(4);
    pub const RBP: GReg = GReg(5);
    pub const RSI: GReg = GReg(6);
    pub const RDI: GReg = GReg(7);
    pub const R8: GReg = GReg(8);
    pub const R9: GReg = GReg(9);
    pub const R10: GReg = GReg(10);
    pub const R11: GReg = GReg(11);
    pub const R12: GReg = GReg(12);
    pub const R13: GReg = GReg(13);
    pub const R14: GReg = GReg(14);
    pub const R15: GReg = GReg(15);
}

/// Number of general-purpose registers in the model.
pub const NUM_GPRS: usize = 16;

/// Integer argument registers, in argument order (System V).
pub const ARG_GPRS: [GReg; 6] = [GReg::RDI, GReg::RSI, GReg::RDX, GReg::RCX, GReg::R8, GReg::R9];

/// Registers a callee may clobber.
pub const CALLER_SAVED_GPRS: [GReg; 9] = [
    GReg::RAX,
    GReg::RCX,
    GReg::RDX,
    GReg::RSI,
    GReg::RDI,
    GReg::R8,
    GReg::R9,
    GReg::R10,
    GReg::R11,
];

/// Scratch GPR pool handed to injectors, highest preference first.
pub const SCRATCH_GPR_POOL: [GReg; 8] = [
    GReg::R15,
    GReg::R14,
    GReg::R13,
    GReg::R12,
    GReg::RBX,
    GReg::R11,
    GReg::R10,
    GReg::RAX,
];

/// Comparison mask register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskReg {
    /// Predicate register `k<n>`.
    Pred(u8),
    /// Vector register holding all-ones / all-zeros lanes.
    Vec(VReg),
}

/// Base register for memory addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseReg {
    /// Function argument register (0=first arg, 1=second, etc.)
    Arg(u8),
    /// Stack pointer.
    StackPtr,
    /// Explicit general-purpose register.
    Gpr(GReg),
}

impl BaseReg {
    /// Physical register this base resolves to.
    #[inline]
    pub fn gpr(self) -> GReg {
        match self {
            BaseReg::Arg(i) => ARG_GPRS[i as usize],
            BaseReg::StackPtr => GReg::RSP,
            BaseReg::Gpr(g) => g,
        }
    }
}

impl From<GReg> for BaseReg {
    fn from(g: GReg) -> Self {
        BaseReg::Gpr(g)
    }
}

/// Memory operand for load/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemOperand {
    pub base: BaseReg,
    pub offset: i32,
}

impl MemOperand {
    #[inline]
    pub fn new(base: impl Into<BaseReg>, offset: i32) -> Self {
        MemOperand {
            base: base.into(),
            offset,
        }
    }

    /// Stack slot `offset` bytes above the stack pointer.
    #[inline]
    pub fn stack(offset: i32) -> Self {
        MemOperand {
            base: BaseReg::StackPtr,
            offset,
        }
    }
}

/// Second source of a vector op: register or memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VOperand {
    Reg(VReg),
    Mem(MemOperand),
}

impl From<VReg> for VOperand {
    fn from(r: VReg) -> Self {
        VOperand::Reg(r)
    }
}

impl From<MemOperand> for VOperand {
    fn from(m: MemOperand) -> Self {
        VOperand::Mem(m)
    }
}

/// Label for branch targets and data blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// Ordered floating-point comparison predicates (false on NaN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpPred {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpPred {
    /// Evaluate the predicate on two lanes.
    #[inline]
    pub fn eval(self, a: f32, b: f32) -> bool {
        match self {
            CmpPred::Eq => a == b,
            CmpPred::Lt => a < b,
            CmpPred::Le => a <= b,
            CmpPred::Gt => a > b,
            CmpPred::Ge => a >= b,
        }
    }
}

/// Rounding mode for `vround`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundMode {
    /// Round half to even.
    Nearest,
    /// Toward negative infinity.
    Floor,
}

/// Native binary scalar function callable from generated code.
pub type ScalarFn2 = extern "C" fn(f32, f32) -> f32;

// ── SimdOps trait ───────────────────────────────────────────────────────────

/// Platform-agnostic SIMD instruction interface.
///
/// Vector ops act on all `simd_width_f32` lanes. Binary ops read `a` as a
/// register and `b` as register or memory (`b` memory is a full-width,
/// unaligned read).
pub trait SimdOps {
    /// Finalized artifact (recorded program or machine code).
    type Output;

    /// Shape of the target.
    fn target(&self) -> TargetDesc;

    // ── Vector arithmetic ───────────────────────────────────────────────

    /// dst = a + b
    fn vadd(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = a - b
    fn vsub(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = a * b
    fn vmul(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = a / b
    fn vdiv(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = a < b ? a : b  (second operand on NaN)
    fn vmin(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = a > b ? a : b  (second operand on NaN)
    fn vmax(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = sqrt(a)
    fn vsqrt(&mut self, dst: VReg, a: VReg) -> JitResult<()>;
    /// dst = round(a) as f32
    fn vround(&mut self, dst: VReg, a: VReg, mode: RoundMode) -> JitResult<()>;

    // ── FMA variants for Horner polynomial evaluation ───────────────────

    /// dst = dst * a + b
    fn vfmadd213(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = a * b + dst
    fn vfmadd231(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = dst - a * b
    fn vfnmadd231(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;

    // ── Bitwise / integer operations ────────────────────────────────────

    /// dst = a & b
    fn vand(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = a | b
    fn vor(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = a ^ b
    fn vxor(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = !a & b
    fn vandn(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = a + b  (wrapping 32-bit integer lanes)
    fn vadd_i32(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = a - b  (wrapping 32-bit integer lanes)
    fn vsub_i32(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = a << imm  (logical, 32-bit lanes)
    fn vshl_i32(&mut self, dst: VReg, a: VReg, imm: u8) -> JitResult<()>;
    /// dst = a >> imm  (logical, 32-bit lanes)
    fn vshr_i32(&mut self, dst: VReg, a: VReg, imm: u8) -> JitResult<()>;
    /// dst = i32 lanes converted to f32
    fn vcvt_i32_f32(&mut self, dst: VReg, a: VReg) -> JitResult<()>;
    /// dst = f32 lanes truncated to i32 (0x80000000 when out of range)
    fn vcvt_f32_i32(&mut self, dst: VReg, a: VReg) -> JitResult<()>;

    // ── Moves ───────────────────────────────────────────────────────────

    /// dst = src  (full-width load when `src` is memory)
    fn vmov(&mut self, dst: VReg, src: VOperand) -> JitResult<()>;
    /// store full vector to memory
    fn vstore(&mut self, mem: MemOperand, src: VReg) -> JitResult<()>;
    /// dst = all zeros
    fn vzero(&mut self, dst: VReg) -> JitResult<()>;
    /// Load one 32-bit element into lane 0, zeroing the other lanes.
    fn vload_scalar(&mut self, dst: VReg, mem: MemOperand) -> JitResult<()>;
    /// Store lane 0 as one 32-bit element.
    fn vstore_scalar(&mut self, mem: MemOperand, src: VReg) -> JitResult<()>;

    // ── Masks ───────────────────────────────────────────────────────────

    /// mask = a <pred> b  (ordered float compare)
    fn vcmp(&mut self, mask: MaskReg, a: VReg, b: VOperand, pred: CmpPred) -> JitResult<()>;
    /// mask = (a as i32) > (b as i32)
    fn vcmpgt_i32(&mut self, mask: MaskReg, a: VReg, b: VOperand) -> JitResult<()>;
    /// dst = mask ? src : dst
    fn vblend(&mut self, dst: VReg, mask: MaskReg, src: VOperand) -> JitResult<()>;
    /// Spill a predicate mask register.
    fn mask_store(&mut self, mem: MemOperand, mask: u8) -> JitResult<()>;
    /// Fill a predicate mask register.
    fn mask_load(&mut self, mask: u8, mem: MemOperand) -> JitResult<()>;

    /// dst[i] = *(f32*)(base + idx[i]*4 + disp) for every lane.
    ///
    /// `mask` is clobbered. `dst`, `idx` and a vector `mask` must differ.
    fn vgather(
        &mut self,
        dst: VReg,
        base: GReg,
        idx: VReg,
        disp: i32,
        mask: MaskReg,
    ) -> JitResult<()>;

    // ── GPR operations ──────────────────────────────────────────────────

    /// Load immediate value into GPR.
    fn gpr_load_imm(&mut self, dst: BaseReg, imm: i64) -> JitResult<()>;
    /// dst = src
    fn gpr_mov(&mut self, dst: BaseReg, src: BaseReg) -> JitResult<()>;
    /// dst = dst + imm
    fn gpr_add_imm(&mut self, dst: BaseReg, imm: i32) -> JitResult<()>;
    /// dst = dst + src
    fn gpr_add(&mut self, dst: BaseReg, src: BaseReg) -> JitResult<()>;
    /// dst = dst - src
    fn gpr_sub(&mut self, dst: BaseReg, src: BaseReg) -> JitResult<()>;
    /// dst = dst << imm
    fn gpr_shl_imm(&mut self, dst: BaseReg, imm: u8) -> JitResult<()>;
    /// Push a GPR (stack pointer moves down 8 bytes).
    fn gpr_push(&mut self, reg: GReg) -> JitResult<()>;
    /// Pop a GPR.
    fn gpr_pop(&mut self, reg: GReg) -> JitResult<()>;
    /// Move the stack pointer down by `bytes`.
    fn stack_alloc(&mut self, bytes: u32) -> JitResult<()>;
    /// Move the stack pointer up by `bytes`.
    fn stack_free(&mut self, bytes: u32) -> JitResult<()>;

    // ── Labels, branches, data ──────────────────────────────────────────

    /// Allocate a new label (returns unique label ID).
    fn alloc_label(&mut self) -> Label;
    /// Define a label at the current code position.
    fn define_label(&mut self, label: Label) -> JitResult<()>;
    /// Unconditional jump to label.
    fn jump(&mut self, label: Label) -> JitResult<()>;
    /// Decrement GPR and branch to label if non-zero.
    fn dec_and_branch_nz(&mut self, counter: BaseReg, label: Label) -> JitResult<()>;
    /// Compare GPR to immediate (signed) and branch if less than.
    fn cmp_and_branch_lt(&mut self, reg: BaseReg, imm: i32, label: Label) -> JitResult<()>;
    /// Compare GPR to immediate (signed) and branch if greater-or-equal.
    fn cmp_and_branch_ge(&mut self, reg: BaseReg, imm: i32, label: Label) -> JitResult<()>;
    /// dst = address of `label`.
    fn lea_label(&mut self, dst: GReg, label: Label) -> JitResult<()>;
    /// Bind `label` to a block of 32-bit words placed after the code.
    fn emit_data(&mut self, label: Label, words: &[u32]) -> JitResult<()>;

    // ── External calls ──────────────────────────────────────────────────

    /// `*ret = f(*a, *b)` through the native calling convention.
    ///
    /// All caller-saved registers (vector, mask, GPR) are clobbered.
    fn call_scalar2(
        &mut self,
        f: ScalarFn2,
        a: MemOperand,
        b: MemOperand,
        ret: MemOperand,
    ) -> JitResult<()>;

    // ── Function frame ──────────────────────────────────────────────────

    /// Emit function prologue.
    fn emit_prologue(&mut self) -> JitResult<()>;
    /// Emit function epilogue (restore frame, return).
    fn emit_epilogue(&mut self) -> JitResult<()>;
    /// Finalize code generation.
    fn finalize(self) -> JitResult<Self::Output>
    where
        Self: Sized;
}
