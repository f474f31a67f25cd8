//! x86_64 JIT code generation via iced-x86 CodeAssembler.
//!
//! `X86Emitter` implements `SimdOps` for two shapes:
//! - AVX2: 16 ymm registers, comparison masks held in ymm lanes
//!   (`vblendvps`, `vgatherdps` with a vector mask).
//! - AVX-512: 32 zmm registers, opmask `k1..k7` for compares, blends
//!   (`vblendmps`) and gathers. Bitwise ops use the `vpandd` family so
//!   only AVX512F is required.
//!
//! Data blobs registered through `emit_data` are appended after the code and
//! addressed RIP-relative, so the assembled buffer is position independent.

use iced_x86::code_asm::*;

use super::simd_ops::{
    BaseReg, CmpPred, GReg, Label, MaskReg, MemOperand, RoundMode, ScalarFn2, SimdOps, VOperand,
    VReg,
};
use super::target_desc::TargetDesc;
use crate::compiler::executable::CompiledKernel;
use crate::dispatch::IsaLevel;
use crate::types::{JitError, JitResult};

/// Callee-saved GPRs pushed by the prologue (System V).
fn callee_saved() -> [AsmRegister64; 6] {
    [rbx, rbp, r12, r13, r14, r15]
}

fn gpr(r: GReg) -> AsmRegister64 {
    match r.0 {
        0 => rax,
        1 => rcx,
        2 => rdx,
        3 => rbx,
        4 => rsp,
        5 => rbp,
        6 => rsi,
        7 => rdi,
        8 => r8,
        9 => r9,
        10 => r10,
        11 => r11,
        12 => r12,
        13 => r13,
        14 => r14,
        15 => r15,
        n => panic!("gpr index {n} out of range (0..15)"),
    }
}

fn xmm(r: VReg) -> AsmRegisterXmm {
    match r.0 {
        0 => xmm0,
        1 => xmm1,
        2 => xmm2,
        3 => xmm3,
        4 => xmm4,
        5 => xmm5,
        6 => xmm6,
        7 => xmm7,
        8 => xmm8,
        9 => xmm9,
        10 => xmm10,
        11 => xmm11,
        12 => xmm12,
        13 => xmm13,
        14 => xmm14,
        15 => xmm15,
        16 => xmm16,
        17 => xmm17,
        18 => xmm18,
        19 => xmm19,
        20 => xmm20,
        21 => xmm21,
        22 => xmm22,
        23 => xmm23,
        24 => xmm24,
        25 => xmm25,
        26 => xmm26,
        27 => xmm27,
        28 => xmm28,
        29 => xmm29,
        30 => xmm30,
        31 => xmm31,
        n => panic!("xmm index {n} out of range (0..31)"),
    }
}

fn ymm(r: VReg) -> AsmRegisterYmm {
    match r.0 {
        0 => ymm0,
        1 => ymm1,
        2 => ymm2,
        3 => ymm3,
        4 => ymm4,
        5 => ymm5,
        6 => ymm6,
        7 => ymm7,
        8 => ymm8,
        9 => ymm9,
        10 => ymm10,
        11 => ymm11,
        12 => ymm12,
        13 => ymm13,
        14 => ymm14,
        15 => ymm15,
        n => panic!("ymm index {n} out of range (0..15)"),
    }
}

fn zmm(r: VReg) -> AsmRegisterZmm {
    match r.0 {
        0 => zmm0,
        1 => zmm1,
        2 => zmm2,
        3 => zmm3,
        4 => zmm4,
        5 => zmm5,
        6 => zmm6,
        7 => zmm7,
        8 => zmm8,
        9 => zmm9,
        10 => zmm10,
        11 => zmm11,
        12 => zmm12,
        13 => zmm13,
        14 => zmm14,
        15 => zmm15,
        16 => zmm16,
        17 => zmm17,
        18 => zmm18,
        19 => zmm19,
        20 => zmm20,
        21 => zmm21,
        22 => zmm22,
        23 => zmm23,
        24 => zmm24,
        25 => zmm25,
        26 => zmm26,
        27 => zmm27,
        28 => zmm28,
        29 => zmm29,
        30 => zmm30,
        31 => zmm31,
        n => panic!("zmm index {n} out of range (0..31)"),
    }
}

fn kreg(k: u8) -> AsmRegisterK {
    match k {
        0 => k0,
        1 => k1,
        2 => k2,
        3 => k3,
        4 => k4,
        5 => k5,
        6 => k6,
        7 => k7,
        n => panic!("opmask index {n} out of range (0..7)"),
    }
}

/// `r{k}` write-masked destination. `k0` cannot be a write mask.
fn zmm_masked(r: AsmRegisterZmm, k: u8) -> JitResult<AsmRegisterZmm> {
    match k {
        1 => Ok(r.k1()),
        2 => Ok(r.k2()),
        3 => Ok(r.k3()),
        4 => Ok(r.k4()),
        5 => Ok(r.k5()),
        6 => Ok(r.k6()),
        7 => Ok(r.k7()),
        _ => Err(JitError::Unsupported(format!("k{k} as write mask"))),
    }
}

#[inline]
fn mem(m: MemOperand) -> AsmMemoryOperand {
    gpr(m.base.gpr()) + m.offset
}

/// `vcmpps` immediate for an ordered predicate.
fn cmp_imm(pred: CmpPred) -> i32 {
    match pred {
        CmpPred::Eq => 0x00,  // EQ_OQ
        CmpPred::Lt => 0x01,  // LT_OS
        CmpPred::Le => 0x02,  // LE_OS
        CmpPred::Ge => 0x0D,  // GE_OS
        CmpPred::Gt => 0x0E,  // GT_OS
    }
}

/// `vroundps`/`vrndscaleps` immediate (precision exception suppressed).
fn round_imm(mode: RoundMode) -> i32 {
    match mode {
        RoundMode::Nearest => 0x08,
        RoundMode::Floor => 0x09,
    }
}

/// Dispatch a three-operand op over ymm/zmm with a register-or-memory `b`.
macro_rules! vop3 {
    ($s:ident, $y:ident, $z:ident, $dst:expr, $a:expr, $b:expr) => {{
        $s.check($dst);
        $s.check($a);
        if $s.wide {
            match $b {
                VOperand::Reg(r) => {
                    $s.check(r);
                    $s.asm.$z(zmm($dst), zmm($a), zmm(r))?
                }
                VOperand::Mem(m) => $s.asm.$z(zmm($dst), zmm($a), zmmword_ptr(mem(m)))?,
            }
        } else {
            match $b {
                VOperand::Reg(r) => {
                    $s.check(r);
                    $s.asm.$y(ymm($dst), ymm($a), ymm(r))?
                }
                VOperand::Mem(m) => $s.asm.$y(ymm($dst), ymm($a), ymmword_ptr(mem(m)))?,
            }
        }
        Ok(())
    }};
}

/// Dispatch a two-operand register op over ymm/zmm.
macro_rules! vop2 {
    ($s:ident, $op:ident, $dst:expr, $a:expr $(, $imm:expr)?) => {{
        $s.check($dst);
        $s.check($a);
        if $s.wide {
            $s.asm.$op(zmm($dst), zmm($a) $(, $imm)?)?;
        } else {
            $s.asm.$op(ymm($dst), ymm($a) $(, $imm)?)?;
        }
        Ok(())
    }};
}

/// iced-x86 backed `SimdOps` implementation.
pub struct X86Emitter {
    asm: CodeAssembler,
    target: TargetDesc,
    wide: bool,
    labels: Vec<CodeLabel>,
    bound: Vec<bool>,
    data: Vec<(usize, Vec<u32>)>,
}

impl X86Emitter {
    /// Create an emitter for a native ISA level.
    pub fn new(isa: IsaLevel) -> JitResult<Self> {
        if isa == IsaLevel::Portable {
            return Err(JitError::Unsupported("x86 emitter needs avx2 or avx512".into()));
        }
        Ok(X86Emitter {
            asm: CodeAssembler::new(64)?,
            target: TargetDesc::for_isa(isa),
            wide: isa == IsaLevel::Avx512,
            labels: Vec::new(),
            bound: Vec::new(),
            data: Vec::new(),
        })
    }

    fn check(&self, r: VReg) {
        assert!(
            (r.0 as usize) < self.target.num_simd_regs,
            "vector register {} beyond register file of {}",
            r.0,
            self.target.num_simd_regs
        );
    }

    fn label(&self, l: Label) -> JitResult<CodeLabel> {
        self.labels
            .get(l.0 as usize)
            .copied()
            .ok_or_else(|| JitError::Assembler(format!("label {} was never allocated", l.0)))
    }

    fn bind(&mut self, l: Label) -> JitResult<()> {
        let i = l.0 as usize;
        if i >= self.labels.len() {
            return Err(JitError::Assembler(format!("label {} was never allocated", l.0)));
        }
        if self.bound[i] {
            return Err(JitError::Assembler(format!("label {} bound twice", l.0)));
        }
        self.bound[i] = true;
        self.asm.set_label(&mut self.labels[i])?;
        Ok(())
    }

    fn mask_vec(&self, mask: MaskReg) -> JitResult<VReg> {
        match mask {
            MaskReg::Vec(r) if !self.wide => {
                self.check(r);
                Ok(r)
            }
            other => Err(JitError::Unsupported(format!(
                "{other:?} on {}",
                self.target.isa
            ))),
        }
    }

    fn mask_pred(&self, mask: MaskReg) -> JitResult<u8> {
        match mask {
            MaskReg::Pred(k) if self.wide => Ok(k),
            other => Err(JitError::Unsupported(format!(
                "{other:?} on {}",
                self.target.isa
            ))),
        }
    }
}

impl SimdOps for X86Emitter {
    type Output = CompiledKernel;

    fn target(&self) -> TargetDesc {
        self.target
    }

    fn vadd(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vaddps, vaddps, dst, a, b)
    }
    fn vsub(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vsubps, vsubps, dst, a, b)
    }
    fn vmul(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vmulps, vmulps, dst, a, b)
    }
    fn vdiv(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vdivps, vdivps, dst, a, b)
    }
    fn vmin(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vminps, vminps, dst, a, b)
    }
    fn vmax(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vmaxps, vmaxps, dst, a, b)
    }
    fn vsqrt(&mut self, dst: VReg, a: VReg) -> JitResult<()> {
        vop2!(self, vsqrtps, dst, a)
    }
    fn vround(&mut self, dst: VReg, a: VReg, mode: RoundMode) -> JitResult<()> {
        self.check(dst);
        self.check(a);
        if self.wide {
            self.asm.vrndscaleps(zmm(dst), zmm(a), round_imm(mode))?;
        } else {
            self.asm.vroundps(ymm(dst), ymm(a), round_imm(mode))?;
        }
        Ok(())
    }

    fn vfmadd213(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vfmadd213ps, vfmadd213ps, dst, a, b)
    }
    fn vfmadd231(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vfmadd231ps, vfmadd231ps, dst, a, b)
    }
    fn vfnmadd231(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vfnmadd231ps, vfnmadd231ps, dst, a, b)
    }

    fn vand(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vandps, vpandd, dst, a, b)
    }
    fn vor(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vorps, vpord, dst, a, b)
    }
    fn vxor(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vxorps, vpxord, dst, a, b)
    }
    fn vandn(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vandnps, vpandnd, dst, a, b)
    }
    fn vadd_i32(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vpaddd, vpaddd, dst, a, b)
    }
    fn vsub_i32(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        vop3!(self, vpsubd, vpsubd, dst, a, b)
    }
    fn vshl_i32(&mut self, dst: VReg, a: VReg, imm: u8) -> JitResult<()> {
        vop2!(self, vpslld, dst, a, imm as i32)
    }
    fn vshr_i32(&mut self, dst: VReg, a: VReg, imm: u8) -> JitResult<()> {
        vop2!(self, vpsrld, dst, a, imm as i32)
    }
    fn vcvt_i32_f32(&mut self, dst: VReg, a: VReg) -> JitResult<()> {
        vop2!(self, vcvtdq2ps, dst, a)
    }
    fn vcvt_f32_i32(&mut self, dst: VReg, a: VReg) -> JitResult<()> {
        vop2!(self, vcvttps2dq, dst, a)
    }

    fn vmov(&mut self, dst: VReg, src: VOperand) -> JitResult<()> {
        self.check(dst);
        match (self.wide, src) {
            (true, VOperand::Reg(r)) => {
                self.check(r);
                self.asm.vmovaps(zmm(dst), zmm(r))?
            }
            (true, VOperand::Mem(m)) => self.asm.vmovups(zmm(dst), zmmword_ptr(mem(m)))?,
            (false, VOperand::Reg(r)) => {
                self.check(r);
                self.asm.vmovaps(ymm(dst), ymm(r))?
            }
            (false, VOperand::Mem(m)) => self.asm.vmovups(ymm(dst), ymmword_ptr(mem(m)))?,
        }
        Ok(())
    }
    fn vstore(&mut self, m: MemOperand, src: VReg) -> JitResult<()> {
        self.check(src);
        if self.wide {
            self.asm.vmovups(zmmword_ptr(mem(m)), zmm(src))?;
        } else {
            self.asm.vmovups(ymmword_ptr(mem(m)), ymm(src))?;
        }
        Ok(())
    }
    fn vzero(&mut self, dst: VReg) -> JitResult<()> {
        self.check(dst);
        if self.wide {
            self.asm.vpxord(zmm(dst), zmm(dst), zmm(dst))?;
        } else {
            self.asm.vxorps(ymm(dst), ymm(dst), ymm(dst))?;
        }
        Ok(())
    }
    fn vload_scalar(&mut self, dst: VReg, m: MemOperand) -> JitResult<()> {
        self.check(dst);
        self.asm.vmovss(xmm(dst), dword_ptr(mem(m)))?;
        Ok(())
    }
    fn vstore_scalar(&mut self, m: MemOperand, src: VReg) -> JitResult<()> {
        self.check(src);
        self.asm.vmovss(dword_ptr(mem(m)), xmm(src))?;
        Ok(())
    }

    fn vcmp(&mut self, mask: MaskReg, a: VReg, b: VOperand, pred: CmpPred) -> JitResult<()> {
        self.check(a);
        let imm = cmp_imm(pred);
        if self.wide {
            let k = kreg(self.mask_pred(mask)?);
            match b {
                VOperand::Reg(r) => self.asm.vcmpps(k, zmm(a), zmm(r), imm)?,
                VOperand::Mem(m) => self.asm.vcmpps(k, zmm(a), zmmword_ptr(mem(m)), imm)?,
            }
        } else {
            let mv = ymm(self.mask_vec(mask)?);
            match b {
                VOperand::Reg(r) => self.asm.vcmpps(mv, ymm(a), ymm(r), imm)?,
                VOperand::Mem(m) => self.asm.vcmpps(mv, ymm(a), ymmword_ptr(mem(m)), imm)?,
            }
        }
        Ok(())
    }
    fn vcmpgt_i32(&mut self, mask: MaskReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.check(a);
        if self.wide {
            let k = kreg(self.mask_pred(mask)?);
            match b {
                VOperand::Reg(r) => self.asm.vpcmpgtd(k, zmm(a), zmm(r))?,
                VOperand::Mem(m) => self.asm.vpcmpgtd(k, zmm(a), zmmword_ptr(mem(m)))?,
            }
        } else {
            let mv = ymm(self.mask_vec(mask)?);
            match b {
                VOperand::Reg(r) => self.asm.vpcmpgtd(mv, ymm(a), ymm(r))?,
                VOperand::Mem(m) => self.asm.vpcmpgtd(mv, ymm(a), ymmword_ptr(mem(m)))?,
            }
        }
        Ok(())
    }
    fn vblend(&mut self, dst: VReg, mask: MaskReg, src: VOperand) -> JitResult<()> {
        self.check(dst);
        if self.wide {
            let d = zmm_masked(zmm(dst), self.mask_pred(mask)?)?;
            match src {
                VOperand::Reg(r) => self.asm.vblendmps(d, zmm(dst), zmm(r))?,
                VOperand::Mem(m) => self.asm.vblendmps(d, zmm(dst), zmmword_ptr(mem(m)))?,
            }
        } else {
            let mv = ymm(self.mask_vec(mask)?);
            match src {
                VOperand::Reg(r) => self.asm.vblendvps(ymm(dst), ymm(dst), ymm(r), mv)?,
                VOperand::Mem(m) => {
                    self.asm.vblendvps(ymm(dst), ymm(dst), ymmword_ptr(mem(m)), mv)?
                }
            }
        }
        Ok(())
    }
    fn mask_store(&mut self, m: MemOperand, mask: u8) -> JitResult<()> {
        if !self.wide {
            return Err(JitError::Unsupported("opmask spill on avx2".into()));
        }
        self.asm.kmovw(word_ptr(mem(m)), kreg(mask))?;
        Ok(())
    }
    fn mask_load(&mut self, mask: u8, m: MemOperand) -> JitResult<()> {
        if !self.wide {
            return Err(JitError::Unsupported("opmask fill on avx2".into()));
        }
        self.asm.kmovw(kreg(mask), word_ptr(mem(m)))?;
        Ok(())
    }
    fn vgather(
        &mut self,
        dst: VReg,
        base: GReg,
        idx: VReg,
        disp: i32,
        mask: MaskReg,
    ) -> JitResult<()> {
        self.check(dst);
        self.check(idx);
        if dst == idx || mask == MaskReg::Vec(dst) || mask == MaskReg::Vec(idx) {
            return Err(JitError::Assembler(
                "gather destination, index and mask must be distinct".into(),
            ));
        }
        if self.wide {
            let k = self.mask_pred(mask)?;
            let kr = kreg(k);
            self.asm.kxnorw(kr, kr, kr)?;
            let d = zmm_masked(zmm(dst), k)?;
            self.asm.vgatherdps(d, ptr(gpr(base) + zmm(idx) * 4 + disp))?;
        } else {
            let mv = ymm(self.mask_vec(mask)?);
            self.asm.vpcmpeqd(mv, mv, mv)?;
            self.asm
                .vgatherdps_3(ymm(dst), ptr(gpr(base) + ymm(idx) * 4 + disp), mv)?;
        }
        Ok(())
    }

    fn gpr_load_imm(&mut self, dst: BaseReg, imm: i64) -> JitResult<()> {
        self.asm.mov(gpr(dst.gpr()), imm)?;
        Ok(())
    }
    fn gpr_mov(&mut self, dst: BaseReg, src: BaseReg) -> JitResult<()> {
        self.asm.mov(gpr(dst.gpr()), gpr(src.gpr()))?;
        Ok(())
    }
    fn gpr_add_imm(&mut self, dst: BaseReg, imm: i32) -> JitResult<()> {
        self.asm.add(gpr(dst.gpr()), imm)?;
        Ok(())
    }
    fn gpr_add(&mut self, dst: BaseReg, src: BaseReg) -> JitResult<()> {
        self.asm.add(gpr(dst.gpr()), gpr(src.gpr()))?;
        Ok(())
    }
    fn gpr_sub(&mut self, dst: BaseReg, src: BaseReg) -> JitResult<()> {
        self.asm.sub(gpr(dst.gpr()), gpr(src.gpr()))?;
        Ok(())
    }
    fn gpr_shl_imm(&mut self, dst: BaseReg, imm: u8) -> JitResult<()> {
        self.asm.shl(gpr(dst.gpr()), imm as u32)?;
        Ok(())
    }
    fn gpr_push(&mut self, reg: GReg) -> JitResult<()> {
        self.asm.push(gpr(reg))?;
        Ok(())
    }
    fn gpr_pop(&mut self, reg: GReg) -> JitResult<()> {
        self.asm.pop(gpr(reg))?;
        Ok(())
    }
    fn stack_alloc(&mut self, bytes: u32) -> JitResult<()> {
        self.asm.sub(rsp, bytes as i32)?;
        Ok(())
    }
    fn stack_free(&mut self, bytes: u32) -> JitResult<()> {
        self.asm.add(rsp, bytes as i32)?;
        Ok(())
    }

    fn alloc_label(&mut self) -> Label {
        self.labels.push(self.asm.create_label());
        self.bound.push(false);
        Label((self.labels.len() - 1) as u32)
    }
    fn define_label(&mut self, label: Label) -> JitResult<()> {
        self.bind(label)?;
        // consecutive labels need an instruction between them
        self.asm.zero_bytes()?;
        Ok(())
    }
    fn jump(&mut self, label: Label) -> JitResult<()> {
        let l = self.label(label)?;
        self.asm.jmp(l)?;
        Ok(())
    }
    fn dec_and_branch_nz(&mut self, counter: BaseReg, label: Label) -> JitResult<()> {
        let l = self.label(label)?;
        self.asm.dec(gpr(counter.gpr()))?;
        self.asm.jne(l)?;
        Ok(())
    }
    fn cmp_and_branch_lt(&mut self, reg: BaseReg, imm: i32, label: Label) -> JitResult<()> {
        let l = self.label(label)?;
        self.asm.cmp(gpr(reg.gpr()), imm)?;
        self.asm.jl(l)?;
        Ok(())
    }
    fn cmp_and_branch_ge(&mut self, reg: BaseReg, imm: i32, label: Label) -> JitResult<()> {
        let l = self.label(label)?;
        self.asm.cmp(gpr(reg.gpr()), imm)?;
        self.asm.jge(l)?;
        Ok(())
    }
    fn lea_label(&mut self, dst: GReg, label: Label) -> JitResult<()> {
        let l = self.label(label)?;
        self.asm.lea(gpr(dst), ptr(l))?;
        Ok(())
    }
    fn emit_data(&mut self, label: Label, words: &[u32]) -> JitResult<()> {
        self.label(label)?;
        self.data.push((label.0 as usize, words.to_vec()));
        Ok(())
    }

    fn call_scalar2(
        &mut self,
        f: ScalarFn2,
        a: MemOperand,
        b: MemOperand,
        ret: MemOperand,
    ) -> JitResult<()> {
        // operands may be stack relative: read them before moving rsp
        self.asm.vmovss(xmm0, dword_ptr(mem(a)))?;
        self.asm.vmovss(xmm1, dword_ptr(mem(b)))?;
        self.asm.push(r12)?;
        self.asm.mov(r12, rsp)?;
        self.asm.and(rsp, -16i32)?;
        self.asm.mov(rax, f as usize as u64)?;
        self.asm.vzeroupper()?;
        self.asm.call(rax)?;
        self.asm.mov(rsp, r12)?;
        self.asm.pop(r12)?;
        self.asm.vmovss(dword_ptr(mem(ret)), xmm0)?;
        Ok(())
    }

    fn emit_prologue(&mut self) -> JitResult<()> {
        for r in callee_saved() {
            self.asm.push(r)?;
        }
        Ok(())
    }
    fn emit_epilogue(&mut self) -> JitResult<()> {
        for r in callee_saved().into_iter().rev() {
            self.asm.pop(r)?;
        }
        self.asm.vzeroupper()?;
        self.asm.ret()?;
        Ok(())
    }

    fn finalize(mut self) -> JitResult<CompiledKernel> {
        let data = std::mem::take(&mut self.data);
        for (idx, words) in data {
            self.bind(Label(idx as u32))?;
            if words.is_empty() {
                self.asm.zero_bytes()?;
            } else {
                self.asm.dd(&words)?;
            }
        }
        if let Some(i) = self.bound.iter().position(|b| !b) {
            return Err(JitError::Assembler(format!("label {i} never bound")));
        }
        let code = self.asm.assemble(0)?;
        log::trace!("x86 backend: {} bytes for {}", code.len(), self.target.isa);
        CompiledKernel::from_code(&code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::may_use;

    fn native_levels() -> Vec<IsaLevel> {
        [IsaLevel::Avx2, IsaLevel::Avx512]
            .into_iter()
            .filter(|&l| may_use(l))
            .collect()
    }

    #[test]
    fn test_vector_add_kernel() {
        for isa in native_levels() {
            let mut e = X86Emitter::new(isa).unwrap();
            e.emit_prologue().unwrap();
            e.vmov(VReg(0), MemOperand::new(BaseReg::Arg(0), 0).into()).unwrap();
            e.vadd(VReg(0), VReg(0), MemOperand::new(BaseReg::Arg(1), 0).into()).unwrap();
            e.vstore(MemOperand::new(BaseReg::Arg(0), 0), VReg(0)).unwrap();
            e.emit_epilogue().unwrap();
            let k = e.finalize().unwrap();

            let mut a: Vec<f32> = (0..16).map(|i| i as f32).collect();
            let b = vec![0.5f32; 16];
            unsafe { k.invoke(&[a.as_mut_ptr() as u64, b.as_ptr() as u64]) };
            let w = TargetDesc::for_isa(isa).simd_width_f32;
            for (i, v) in a.iter().enumerate() {
                let want = if i < w { i as f32 + 0.5 } else { i as f32 };
                assert_eq!(*v, want);
            }
        }
    }

    #[test]
    fn test_gather_encodes_for_both_widths() {
        // assembly only; runs on hosts without the ISA too
        for (isa, mask) in [
            (IsaLevel::Avx2, MaskReg::Vec(VReg(2))),
            (IsaLevel::Avx512, MaskReg::Pred(1)),
        ] {
            let mut e = X86Emitter::new(isa).unwrap();
            e.emit_prologue().unwrap();
            e.vgather(VReg(0), GReg::RAX, VReg(1), 64, mask).unwrap();
            e.emit_epilogue().unwrap();
            assert!(e.finalize().unwrap().code_size() > 0, "{isa}");
        }
    }

    #[test]
    fn test_gather_from_data_section() {
        for isa in native_levels() {
            let mut e = X86Emitter::new(isa).unwrap();
            let mask = match TargetDesc::for_isa(isa).mask_kind {
                super::super::target_desc::MaskKind::Predicate => MaskReg::Pred(1),
                super::super::target_desc::MaskKind::Vector => MaskReg::Vec(VReg(2)),
            };
            let table = e.alloc_label();
            e.emit_prologue().unwrap();
            e.lea_label(GReg::RAX, table).unwrap();
            e.vmov(VReg(1), MemOperand::new(BaseReg::Arg(0), 0).into()).unwrap();
            e.vgather(VReg(0), GReg::RAX, VReg(1), 0, mask).unwrap();
            e.vstore(MemOperand::new(BaseReg::Arg(1), 0), VReg(0)).unwrap();
            e.emit_epilogue().unwrap();
            let words: Vec<u32> = (100..132).collect();
            e.emit_data(table, &words).unwrap();
            let k = e.finalize().unwrap();

            let idx: Vec<u32> = (0..16).map(|i| (i * 7) % 32).collect();
            let mut out = vec![0u32; 16];
            unsafe { k.invoke(&[idx.as_ptr() as u64, out.as_mut_ptr() as u64]) };
            let w = TargetDesc::for_isa(isa).simd_width_f32;
            for i in 0..w {
                assert_eq!(out[i], 100 + idx[i]);
            }
        }
    }

    #[test]
    fn test_portable_rejected() {
        assert!(X86Emitter::new(IsaLevel::Portable).is_err());
    }
}
