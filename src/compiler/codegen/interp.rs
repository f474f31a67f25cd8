//! Portable backend: records `SimdOps` calls and replays them.
//!
//! `Interpreter` is a `SimdOps` implementation that builds a `Program`
//! (a flat instruction stream plus a data section) instead of machine code.
//! `Program::invoke` executes it on a simulated register file over real
//! memory, so generated drivers and injected activation code run on any
//! host and produce results lane-for-lane identical to the x86 backend:
//! min/max, compares, conversions and shifts follow x86 semantics.

use super::simd_ops::{
    BaseReg, CmpPred, GReg, Label, MaskReg, MemOperand, RoundMode, ScalarFn2, SimdOps, VOperand,
    VReg, ARG_GPRS, NUM_GPRS,
};
use super::target_desc::TargetDesc;
use crate::types::{JitError, JitResult};

/// Widest vector the interpreter models (16 x f32).
pub const MAX_LANES: usize = 16;

/// Number of predicate registers.
const NUM_PRED: usize = 8;

/// Stack reserved per invocation of a program that touches the stack.
const STACK_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    And,
    Or,
    Xor,
    AndN,
    AddI32,
    SubI32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VUnOp {
    Sqrt,
    CvtI32F32,
    CvtF32I32,
    Round(RoundMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FmaKind {
    /// dst = dst * a + b
    F213,
    /// dst = a * b + dst
    F231,
    /// dst = dst - a * b
    Fn231,
}

#[derive(Debug, Clone, Copy)]
enum Insn {
    VBin { op: VBinOp, dst: VReg, a: VReg, b: VOperand },
    VFma { kind: FmaKind, dst: VReg, a: VReg, b: VOperand },
    VUn { op: VUnOp, dst: VReg, a: VReg },
    VShl { dst: VReg, a: VReg, imm: u8 },
    VShr { dst: VReg, a: VReg, imm: u8 },
    VMov { dst: VReg, src: VOperand },
    VStore { mem: MemOperand, src: VReg },
    VZero { dst: VReg },
    VLoadScalar { dst: VReg, mem: MemOperand },
    VStoreScalar { mem: MemOperand, src: VReg },
    VCmp { mask: MaskReg, a: VReg, b: VOperand, pred: CmpPred },
    VCmpGtI32 { mask: MaskReg, a: VReg, b: VOperand },
    VBlend { dst: VReg, mask: MaskReg, src: VOperand },
    MaskStore { mem: MemOperand, k: u8 },
    MaskLoad { k: u8, mem: MemOperand },
    VGather { dst: VReg, base: GReg, idx: VReg, disp: i32, mask: MaskReg },
    GprLoadImm { dst: GReg, imm: i64 },
    GprMov { dst: GReg, src: GReg },
    GprAddImm { dst: GReg, imm: i32 },
    GprAdd { dst: GReg, src: GReg },
    GprSub { dst: GReg, src: GReg },
    GprShl { dst: GReg, imm: u8 },
    Push(GReg),
    Pop(GReg),
    StackAlloc(u32),
    StackFree(u32),
    Jump(Label),
    DecJnz(GReg, Label),
    CmpJl(GReg, i32, Label),
    CmpJge(GReg, i32, Label),
    LeaLabel(GReg, Label),
    Call2 { f: ScalarFn2, a: MemOperand, b: MemOperand, ret: MemOperand },
    Ret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelTarget {
    Code(usize),
    Data(usize),
}

/// Recording `SimdOps` backend.
pub struct Interpreter {
    target: TargetDesc,
    insns: Vec<Insn>,
    labels: Vec<Option<LabelTarget>>,
    data: Vec<u32>,
    uses_stack: bool,
}

impl Interpreter {
    pub fn new(target: TargetDesc) -> Self {
        assert!(target.simd_width_f32 <= MAX_LANES);
        Interpreter {
            target,
            insns: Vec::new(),
            labels: Vec::new(),
            data: Vec::new(),
            uses_stack: false,
        }
    }

    /// Number of instructions recorded so far.
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    fn check_v(&self, r: VReg) {
        assert!(
            (r.0 as usize) < self.target.num_simd_regs,
            "vector register {} beyond register file of {}",
            r.0,
            self.target.num_simd_regs
        );
    }

    fn check_op(&mut self, op: VOperand) {
        match op {
            VOperand::Reg(r) => self.check_v(r),
            VOperand::Mem(m) => self.note_mem(m),
        }
    }

    fn check_mask(&self, m: MaskReg) {
        match m {
            MaskReg::Pred(k) => assert!((k as usize) < NUM_PRED, "predicate register k{k} out of range"),
            MaskReg::Vec(r) => self.check_v(r),
        }
    }

    fn note_mem(&mut self, m: MemOperand) {
        if m.base == BaseReg::StackPtr {
            self.uses_stack = true;
        }
    }

    fn check_label(&self, l: Label) -> JitResult<()> {
        if (l.0 as usize) < self.labels.len() {
            Ok(())
        } else {
            Err(JitError::Assembler(format!("label {} was never allocated", l.0)))
        }
    }

    fn bin(&mut self, op: VBinOp, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.check_v(dst);
        self.check_v(a);
        self.check_op(b);
        self.insns.push(Insn::VBin { op, dst, a, b });
        Ok(())
    }

    fn fma(&mut self, kind: FmaKind, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.check_v(dst);
        self.check_v(a);
        self.check_op(b);
        self.insns.push(Insn::VFma { kind, dst, a, b });
        Ok(())
    }

    fn un(&mut self, op: VUnOp, dst: VReg, a: VReg) -> JitResult<()> {
        self.check_v(dst);
        self.check_v(a);
        self.insns.push(Insn::VUn { op, dst, a });
        Ok(())
    }
}

impl SimdOps for Interpreter {
    type Output = Program;

    fn target(&self) -> TargetDesc {
        self.target
    }

    fn vadd(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.bin(VBinOp::Add, dst, a, b)
    }
    fn vsub(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.bin(VBinOp::Sub, dst, a, b)
    }
    fn vmul(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.bin(VBinOp::Mul, dst, a, b)
    }
    fn vdiv(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.bin(VBinOp::Div, dst, a, b)
    }
    fn vmin(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.bin(VBinOp::Min, dst, a, b)
    }
    fn vmax(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.bin(VBinOp::Max, dst, a, b)
    }
    fn vsqrt(&mut self, dst: VReg, a: VReg) -> JitResult<()> {
        self.un(VUnOp::Sqrt, dst, a)
    }
    fn vround(&mut self, dst: VReg, a: VReg, mode: RoundMode) -> JitResult<()> {
        self.un(VUnOp::Round(mode), dst, a)
    }

    fn vfmadd213(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.fma(FmaKind::F213, dst, a, b)
    }
    fn vfmadd231(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.fma(FmaKind::F231, dst, a, b)
    }
    fn vfnmadd231(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.fma(FmaKind::Fn231, dst, a, b)
    }

    fn vand(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.bin(VBinOp::And, dst, a, b)
    }
    fn vor(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.bin(VBinOp::Or, dst, a, b)
    }
    fn vxor(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.bin(VBinOp::Xor, dst, a, b)
    }
    fn vandn(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.bin(VBinOp::AndN, dst, a, b)
    }
    fn vadd_i32(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.bin(VBinOp::AddI32, dst, a, b)
    }
    fn vsub_i32(&mut self, dst: VReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.bin(VBinOp::SubI32, dst, a, b)
    }
    fn vshl_i32(&mut self, dst: VReg, a: VReg, imm: u8) -> JitResult<()> {
        self.check_v(dst);
        self.check_v(a);
        self.insns.push(Insn::VShl { dst, a, imm });
        Ok(())
    }
    fn vshr_i32(&mut self, dst: VReg, a: VReg, imm: u8) -> JitResult<()> {
        self.check_v(dst);
        self.check_v(a);
        self.insns.push(Insn::VShr { dst, a, imm });
        Ok(())
    }
    fn vcvt_i32_f32(&mut self, dst: VReg, a: VReg) -> JitResult<()> {
        self.un(VUnOp::CvtI32F32, dst, a)
    }
    fn vcvt_f32_i32(&mut self, dst: VReg, a: VReg) -> JitResult<()> {
        self.un(VUnOp::CvtF32I32, dst, a)
    }

    fn vmov(&mut self, dst: VReg, src: VOperand) -> JitResult<()> {
        self.check_v(dst);
        self.check_op(src);
        self.insns.push(Insn::VMov { dst, src });
        Ok(())
    }
    fn vstore(&mut self, mem: MemOperand, src: VReg) -> JitResult<()> {
        self.check_v(src);
        self.note_mem(mem);
        self.insns.push(Insn::VStore { mem, src });
        Ok(())
    }
    fn vzero(&mut self, dst: VReg) -> JitResult<()> {
        self.check_v(dst);
        self.insns.push(Insn::VZero { dst });
        Ok(())
    }
    fn vload_scalar(&mut self, dst: VReg, mem: MemOperand) -> JitResult<()> {
        self.check_v(dst);
        self.note_mem(mem);
        self.insns.push(Insn::VLoadScalar { dst, mem });
        Ok(())
    }
    fn vstore_scalar(&mut self, mem: MemOperand, src: VReg) -> JitResult<()> {
        self.check_v(src);
        self.note_mem(mem);
        self.insns.push(Insn::VStoreScalar { mem, src });
        Ok(())
    }

    fn vcmp(&mut self, mask: MaskReg, a: VReg, b: VOperand, pred: CmpPred) -> JitResult<()> {
        self.check_mask(mask);
        self.check_v(a);
        self.check_op(b);
        self.insns.push(Insn::VCmp { mask, a, b, pred });
        Ok(())
    }
    fn vcmpgt_i32(&mut self, mask: MaskReg, a: VReg, b: VOperand) -> JitResult<()> {
        self.check_mask(mask);
        self.check_v(a);
        self.check_op(b);
        self.insns.push(Insn::VCmpGtI32 { mask, a, b });
        Ok(())
    }
    fn vblend(&mut self, dst: VReg, mask: MaskReg, src: VOperand) -> JitResult<()> {
        self.check_v(dst);
        self.check_mask(mask);
        self.check_op(src);
        self.insns.push(Insn::VBlend { dst, mask, src });
        Ok(())
    }
    fn mask_store(&mut self, mem: MemOperand, mask: u8) -> JitResult<()> {
        self.check_mask(MaskReg::Pred(mask));
        self.note_mem(mem);
        self.insns.push(Insn::MaskStore { mem, k: mask });
        Ok(())
    }
    fn mask_load(&mut self, mask: u8, mem: MemOperand) -> JitResult<()> {
        self.check_mask(MaskReg::Pred(mask));
        self.note_mem(mem);
        self.insns.push(Insn::MaskLoad { k: mask, mem });
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
        self.check_v(dst);
        self.check_v(idx);
        self.check_mask(mask);
        if dst == idx || mask == MaskReg::Vec(dst) || mask == MaskReg::Vec(idx) {
            return Err(JitError::Assembler(
                "gather destination, index and mask must be distinct".into(),
            ));
        }
        self.insns.push(Insn::VGather { dst, base, idx, disp, mask });
        Ok(())
    }

    fn gpr_load_imm(&mut self, dst: BaseReg, imm: i64) -> JitResult<()> {
        self.insns.push(Insn::GprLoadImm { dst: dst.gpr(), imm });
        Ok(())
    }
    fn gpr_mov(&mut self, dst: BaseReg, src: BaseReg) -> JitResult<()> {
        self.insns.push(Insn::GprMov { dst: dst.gpr(), src: src.gpr() });
        Ok(())
    }
    fn gpr_add_imm(&mut self, dst: BaseReg, imm: i32) -> JitResult<()> {
        self.insns.push(Insn::GprAddImm { dst: dst.gpr(), imm });
        Ok(())
    }
    fn gpr_add(&mut self, dst: BaseReg, src: BaseReg) -> JitResult<()> {
        self.insns.push(Insn::GprAdd { dst: dst.gpr(), src: src.gpr() });
        Ok(())
    }
    fn gpr_sub(&mut self, dst: BaseReg, src: BaseReg) -> JitResult<()> {
        self.insns.push(Insn::GprSub { dst: dst.gpr(), src: src.gpr() });
        Ok(())
    }
    fn gpr_shl_imm(&mut self, dst: BaseReg, imm: u8) -> JitResult<()> {
        self.insns.push(Insn::GprShl { dst: dst.gpr(), imm });
        Ok(())
    }
    fn gpr_push(&mut self, reg: GReg) -> JitResult<()> {
        self.uses_stack = true;
        self.insns.push(Insn::Push(reg));
        Ok(())
    }
    fn gpr_pop(&mut self, reg: GReg) -> JitResult<()> {
        self.insns.push(Insn::Pop(reg));
        Ok(())
    }
    fn stack_alloc(&mut self, bytes: u32) -> JitResult<()> {
        self.uses_stack = true;
        self.insns.push(Insn::StackAlloc(bytes));
        Ok(())
    }
    fn stack_free(&mut self, bytes: u32) -> JitResult<()> {
        self.insns.push(Insn::StackFree(bytes));
        Ok(())
    }

    fn alloc_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }
    fn define_label(&mut self, label: Label) -> JitResult<()> {
        self.check_label(label)?;
        let slot = &mut self.labels[label.0 as usize];
        if slot.is_some() {
            return Err(JitError::Assembler(format!("label {} bound twice", label.0)));
        }
        *slot = Some(LabelTarget::Code(self.insns.len()));
        Ok(())
    }
    fn jump(&mut self, label: Label) -> JitResult<()> {
        self.check_label(label)?;
        self.insns.push(Insn::Jump(label));
        Ok(())
    }
    fn dec_and_branch_nz(&mut self, counter: BaseReg, label: Label) -> JitResult<()> {
        self.check_label(label)?;
        self.insns.push(Insn::DecJnz(counter.gpr(), label));
        Ok(())
    }
    fn cmp_and_branch_lt(&mut self, reg: BaseReg, imm: i32, label: Label) -> JitResult<()> {
        self.check_label(label)?;
        self.insns.push(Insn::CmpJl(reg.gpr(), imm, label));
        Ok(())
    }
    fn cmp_and_branch_ge(&mut self, reg: BaseReg, imm: i32, label: Label) -> JitResult<()> {
        self.check_label(label)?;
        self.insns.push(Insn::CmpJge(reg.gpr(), imm, label));
        Ok(())
    }
    fn lea_label(&mut self, dst: GReg, label: Label) -> JitResult<()> {
        self.check_label(label)?;
        self.insns.push(Insn::LeaLabel(dst, label));
        Ok(())
    }
    fn emit_data(&mut self, label: Label, words: &[u32]) -> JitResult<()> {
        self.check_label(label)?;
        // keep every blob 64-byte aligned relative to the section start
        while self.data.len() % MAX_LANES != 0 {
            self.data.push(0);
        }
        let slot = &mut self.labels[label.0 as usize];
        if slot.is_some() {
            return Err(JitError::Assembler(format!("label {} bound twice", label.0)));
        }
        *slot = Some(LabelTarget::Data(self.data.len()));
        self.data.extend_from_slice(words);
        Ok(())
    }

    fn call_scalar2(
        &mut self,
        f: ScalarFn2,
        a: MemOperand,
        b: MemOperand,
        ret: MemOperand,
    ) -> JitResult<()> {
        self.note_mem(a);
        self.note_mem(b);
        self.note_mem(ret);
        self.insns.push(Insn::Call2 { f, a, b, ret });
        Ok(())
    }

    fn emit_prologue(&mut self) -> JitResult<()> {
        Ok(())
    }
    fn emit_epilogue(&mut self) -> JitResult<()> {
        self.insns.push(Insn::Ret);
        Ok(())
    }

    fn finalize(self) -> JitResult<Program> {
        let mut labels = Vec::with_capacity(self.labels.len());
        for (i, l) in self.labels.iter().enumerate() {
            match l {
                Some(t) => labels.push(*t),
                None => {
                    let used = self.insns.iter().any(|insn| insn_label(insn) == Some(Label(i as u32)));
                    if used {
                        return Err(JitError::Assembler(format!("label {i} used but never bound")));
                    }
                    labels.push(LabelTarget::Code(usize::MAX));
                }
            }
        }
        for insn in &self.insns {
            if let Some(l) = insn_label(insn) {
                let target = labels[l.0 as usize];
                let ok = match insn {
                    Insn::LeaLabel(..) => true,
                    _ => matches!(target, LabelTarget::Code(_)),
                };
                if !ok {
                    return Err(JitError::Assembler(format!("branch to data label {}", l.0)));
                }
            }
        }
        Ok(Program {
            target: self.target,
            insns: self.insns,
            labels,
            data: self.data.into_boxed_slice(),
            uses_stack: self.uses_stack,
        })
    }
}

fn insn_label(insn: &Insn) -> Option<Label> {
    match *insn {
        Insn::Jump(l)
        | Insn::DecJnz(_, l)
        | Insn::CmpJl(_, _, l)
        | Insn::CmpJge(_, _, l)
        | Insn::LeaLabel(_, l) => Some(l),
        _ => None,
    }
}

/// A finalized instruction stream with its data section.
#[derive(Debug)]
pub struct Program {
    target: TargetDesc,
    insns: Vec<Insn>,
    labels: Vec<LabelTarget>,
    data: Box<[u32]>,
    uses_stack: bool,
}

impl Program {
    pub fn target(&self) -> TargetDesc {
        self.target
    }

    /// Number of recorded instructions.
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Size of the data section in bytes.
    pub fn data_bytes(&self) -> usize {
        self.data.len() * 4
    }

    /// Run the program with integer arguments in `ARG_GPRS` order.
    ///
    /// # Safety
    /// Every address the program dereferences (derived from `args`) must be
    /// valid for the accesses the program performs.
    pub unsafe fn invoke(&self, args: &[u64]) {
        assert!(args.len() <= ARG_GPRS.len(), "too many arguments");
        let mut stack = if self.uses_stack {
            vec![0u8; STACK_BYTES + 64]
        } else {
            Vec::new()
        };
        let mut m = Machine {
            v: vec![[0u32; MAX_LANES]; self.target.num_simd_regs],
            k: [0u32; NUM_PRED],
            g: [0u64; NUM_GPRS],
            lanes: self.target.simd_width_f32,
        };
        for (i, &a) in args.iter().enumerate() {
            m.g[ARG_GPRS[i].0 as usize] = a;
        }
        if self.uses_stack {
            let top = stack.as_mut_ptr() as usize + STACK_BYTES;
            m.g[GReg::RSP.0 as usize] = (top & !63) as u64;
        }
        self.run(&mut m);
        drop(stack);
    }

    unsafe fn run(&self, m: &mut Machine) {
        let mut pc = 0usize;
        while pc < self.insns.len() {
            let mut next = pc + 1;
            match self.insns[pc] {
                Insn::VBin { op, dst, a, b } => {
                    let x = m.v[a.0 as usize];
                    let y = m.read_op(b);
                    let mut out = [0u32; MAX_LANES];
                    for i in 0..m.lanes {
                        out[i] = bin_lane(op, x[i], y[i]);
                    }
                    m.v[dst.0 as usize] = out;
                }
                Insn::VFma { kind, dst, a, b } => {
                    let d = m.v[dst.0 as usize];
                    let x = m.v[a.0 as usize];
                    let y = m.read_op(b);
                    let mut out = [0u32; MAX_LANES];
                    for i in 0..m.lanes {
                        let (d, x, y) = (f32::from_bits(d[i]), f32::from_bits(x[i]), f32::from_bits(y[i]));
                        let r = match kind {
                            FmaKind::F213 => d.mul_add(x, y),
                            FmaKind::F231 => x.mul_add(y, d),
                            FmaKind::Fn231 => (-x).mul_add(y, d),
                        };
                        out[i] = r.to_bits();
                    }
                    m.v[dst.0 as usize] = out;
                }
                Insn::VUn { op, dst, a } => {
                    let x = m.v[a.0 as usize];
                    let mut out = [0u32; MAX_LANES];
                    for i in 0..m.lanes {
                        out[i] = un_lane(op, x[i]);
                    }
                    m.v[dst.0 as usize] = out;
                }
                Insn::VShl { dst, a, imm } => {
                    let x = m.v[a.0 as usize];
                    let mut out = [0u32; MAX_LANES];
                    for i in 0..m.lanes {
                        out[i] = if imm >= 32 { 0 } else { x[i] << imm };
                    }
                    m.v[dst.0 as usize] = out;
                }
                Insn::VShr { dst, a, imm } => {
                    let x = m.v[a.0 as usize];
                    let mut out = [0u32; MAX_LANES];
                    for i in 0..m.lanes {
                        out[i] = if imm >= 32 { 0 } else { x[i] >> imm };
                    }
                    m.v[dst.0 as usize] = out;
                }
                Insn::VMov { dst, src } => {
                    m.v[dst.0 as usize] = m.read_op(src);
                }
                Insn::VStore { mem, src } => {
                    let p = m.addr(mem);
                    let x = m.v[src.0 as usize];
                    for (i, lane) in x.iter().enumerate().take(m.lanes) {
                        p.add(4 * i).cast::<u32>().write_unaligned(*lane);
                    }
                }
                Insn::VZero { dst } => {
                    m.v[dst.0 as usize] = [0u32; MAX_LANES];
                }
                Insn::VLoadScalar { dst, mem } => {
                    let mut out = [0u32; MAX_LANES];
                    out[0] = m.addr(mem).cast::<u32>().read_unaligned();
                    m.v[dst.0 as usize] = out;
                }
                Insn::VStoreScalar { mem, src } => {
                    m.addr(mem).cast::<u32>().write_unaligned(m.v[src.0 as usize][0]);
                }
                Insn::VCmp { mask, a, b, pred } => {
                    let x = m.v[a.0 as usize];
                    let y = m.read_op(b);
                    let mut bits = [false; MAX_LANES];
                    for i in 0..m.lanes {
                        bits[i] = pred.eval(f32::from_bits(x[i]), f32::from_bits(y[i]));
                    }
                    m.write_mask(mask, &bits);
                }
                Insn::VCmpGtI32 { mask, a, b } => {
                    let x = m.v[a.0 as usize];
                    let y = m.read_op(b);
                    let mut bits = [false; MAX_LANES];
                    for i in 0..m.lanes {
                        bits[i] = (x[i] as i32) > (y[i] as i32);
                    }
                    m.write_mask(mask, &bits);
                }
                Insn::VBlend { dst, mask, src } => {
                    let sel = m.read_mask(mask);
                    let y = m.read_op(src);
                    let d = &mut m.v[dst.0 as usize];
                    for i in 0..m.lanes {
                        if sel[i] {
                            d[i] = y[i];
                        }
                    }
                }
                Insn::MaskStore { mem, k } => {
                    m.addr(mem).cast::<u16>().write_unaligned(m.k[k as usize] as u16);
                }
                Insn::MaskLoad { k, mem } => {
                    m.k[k as usize] = m.addr(mem).cast::<u16>().read_unaligned() as u32;
                }
                Insn::VGather { dst, base, idx, disp, mask } => {
                    let base = m.g[base.0 as usize] as i64 + disp as i64;
                    let ix = m.v[idx.0 as usize];
                    let mut out = [0u32; MAX_LANES];
                    for i in 0..m.lanes {
                        let off = (ix[i] as i32 as i64) * 4;
                        out[i] = ((base + off) as usize as *const u32).read_unaligned();
                    }
                    m.v[dst.0 as usize] = out;
                    m.write_mask(mask, &[false; MAX_LANES]);
                }
                Insn::GprLoadImm { dst, imm } => m.g[dst.0 as usize] = imm as u64,
                Insn::GprMov { dst, src } => m.g[dst.0 as usize] = m.g[src.0 as usize],
                Insn::GprAddImm { dst, imm } => {
                    let r = &mut m.g[dst.0 as usize];
                    *r = r.wrapping_add(imm as i64 as u64);
                }
                Insn::GprAdd { dst, src } => {
                    let s = m.g[src.0 as usize];
                    let r = &mut m.g[dst.0 as usize];
                    *r = r.wrapping_add(s);
                }
                Insn::GprSub { dst, src } => {
                    let s = m.g[src.0 as usize];
                    let r = &mut m.g[dst.0 as usize];
                    *r = r.wrapping_sub(s);
                }
                Insn::GprShl { dst, imm } => {
                    let r = &mut m.g[dst.0 as usize];
                    *r = if imm >= 64 { 0 } else { *r << imm };
                }
                Insn::Push(reg) => {
                    let v = m.g[reg.0 as usize];
                    m.g[GReg::RSP.0 as usize] -= 8;
                    (m.g[GReg::RSP.0 as usize] as usize as *mut u64).write_unaligned(v);
                }
                Insn::Pop(reg) => {
                    let v = (m.g[GReg::RSP.0 as usize] as usize as *const u64).read_unaligned();
                    m.g[GReg::RSP.0 as usize] += 8;
                    m.g[reg.0 as usize] = v;
                }
                Insn::StackAlloc(n) => m.g[GReg::RSP.0 as usize] -= n as u64,
                Insn::StackFree(n) => m.g[GReg::RSP.0 as usize] += n as u64,
                Insn::Jump(l) => next = self.code_target(l),
                Insn::DecJnz(r, l) => {
                    let c = &mut m.g[r.0 as usize];
                    *c = c.wrapping_sub(1);
                    if *c != 0 {
                        next = self.code_target(l);
                    }
                }
                Insn::CmpJl(r, imm, l) => {
                    if (m.g[r.0 as usize] as i64) < imm as i64 {
                        next = self.code_target(l);
                    }
                }
                Insn::CmpJge(r, imm, l) => {
                    if (m.g[r.0 as usize] as i64) >= imm as i64 {
                        next = self.code_target(l);
                    }
                }
                Insn::LeaLabel(r, l) => {
                    m.g[r.0 as usize] = match self.labels[l.0 as usize] {
                        LabelTarget::Data(off) => self.data.as_ptr().add(off) as u64,
                        // code addresses are instruction indices
                        LabelTarget::Code(i) => i as u64,
                    };
                }
                Insn::Call2 { f, a, b, ret } => {
                    let x = f32::from_bits(m.addr(a).cast::<u32>().read_unaligned());
                    let y = f32::from_bits(m.addr(b).cast::<u32>().read_unaligned());
                    m.addr(ret).cast::<u32>().write_unaligned(f(x, y).to_bits());
                }
                Insn::Ret => return,
            }
            pc = next;
        }
    }

    fn code_target(&self, l: Label) -> usize {
        match self.labels[l.0 as usize] {
            LabelTarget::Code(i) => i,
            LabelTarget::Data(_) => unreachable!("branch to data label checked at finalize"),
        }
    }
}

struct Machine {
    v: Vec<[u32; MAX_LANES]>,
    k: [u32; NUM_PRED],
    g: [u64; NUM_GPRS],
    lanes: usize,
}

impl Machine {
    #[inline]
    fn addr(&self, mem: MemOperand) -> *mut u8 {
        let base = self.g[mem.base.gpr().0 as usize] as i64;
        (base + mem.offset as i64) as usize as *mut u8
    }

    #[inline]
    unsafe fn read_op(&self, op: VOperand) -> [u32; MAX_LANES] {
        match op {
            VOperand::Reg(r) => self.v[r.0 as usize],
            VOperand::Mem(mem) => {
                let p = self.addr(mem);
                let mut out = [0u32; MAX_LANES];
                for (i, lane) in out.iter_mut().enumerate().take(self.lanes) {
                    *lane = p.add(4 * i).cast::<u32>().read_unaligned();
                }
                out
            }
        }
    }

    fn read_mask(&self, mask: MaskReg) -> [bool; MAX_LANES] {
        let mut sel = [false; MAX_LANES];
        match mask {
            MaskReg::Pred(k) => {
                let bits = self.k[k as usize];
                for (i, s) in sel.iter_mut().enumerate().take(self.lanes) {
                    *s = bits & (1 << i) != 0;
                }
            }
            MaskReg::Vec(r) => {
                let x = self.v[r.0 as usize];
                for (i, s) in sel.iter_mut().enumerate().take(self.lanes) {
                    *s = x[i] & 0x8000_0000 != 0;
                }
            }
        }
        sel
    }

    fn write_mask(&mut self, mask: MaskReg, bits: &[bool; MAX_LANES]) {
        match mask {
            MaskReg::Pred(k) => {
                let mut word = 0u32;
                for (i, &b) in bits.iter().enumerate().take(self.lanes) {
                    if b {
                        word |= 1 << i;
                    }
                }
                self.k[k as usize] = word;
            }
            MaskReg::Vec(r) => {
                let mut out = [0u32; MAX_LANES];
                for i in 0..self.lanes {
                    out[i] = if bits[i] { u32::MAX } else { 0 };
                }
                self.v[r.0 as usize] = out;
            }
        }
    }
}

#[inline]
fn bin_lane(op: VBinOp, a: u32, b: u32) -> u32 {
    let (x, y) = (f32::from_bits(a), f32::from_bits(b));
    match op {
        VBinOp::Add => (x + y).to_bits(),
        VBinOp::Sub => (x - y).to_bits(),
        VBinOp::Mul => (x * y).to_bits(),
        VBinOp::Div => (x / y).to_bits(),
        VBinOp::Min => {
            if x < y {
                a
            } else {
                b
            }
        }
        VBinOp::Max => {
            if x > y {
                a
            } else {
                b
            }
        }
        VBinOp::And => a & b,
        VBinOp::Or => a | b,
        VBinOp::Xor => a ^ b,
        VBinOp::AndN => !a & b,
        VBinOp::AddI32 => a.wrapping_add(b),
        VBinOp::SubI32 => a.wrapping_sub(b),
    }
}

#[inline]
fn un_lane(op: VUnOp, a: u32) -> u32 {
    let x = f32::from_bits(a);
    match op {
        VUnOp::Sqrt => x.sqrt().to_bits(),
        VUnOp::CvtI32F32 => (a as i32 as f32).to_bits(),
        VUnOp::CvtF32I32 => {
            if x.is_nan() || x >= 2_147_483_648.0 || x < -2_147_483_648.0 {
                0x8000_0000
            } else {
                x as i32 as u32
            }
        }
        VUnOp::Round(RoundMode::Nearest) => x.round_ties_even().to_bits(),
        VUnOp::Round(RoundMode::Floor) => x.floor().to_bits(),
    }
}
