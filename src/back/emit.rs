//! The code emitter: register-allocated IR to AT&T assembly text.
//!
//! # Frame discipline
//!
//! Every function gets the standard prologue
//!
//! ```txt
//!     pushq %rbp
//!     movq  %rsp, %rbp
//!     subq  $N, %rsp
//! ```
//!
//! with `N = ((frame + 8 + 15) & !15) - 8`.  After `pushq %rbp` the
//! stack pointer is 16-byte aligned minus 8; subtracting N restores
//! `rsp % 16 == 8`, which is exactly what the `call` instruction needs
//! to re-establish System V alignment in the callee.  No alignment
//! fixups are ever emitted at call sites.
//!
//! # Scratch registers
//!
//! The emitter keeps a small set of conventions to avoid overwrite
//! hazards:
//!   - array base addresses are formed in %rdx (never %rax, which is
//!     routinely the destination);
//!   - pointers for indirect stores are held in %r11;
//!   - idiv divisors always go through %r11 (idiv has no immediate
//!     form);
//!   - memory-to-memory movement is routed through %rax.

use log::debug;

use crate::common::{Id, Map};
use crate::middle::ir::*;

/// Emitter output: the text section (assembler input), the full
/// listing (`-S` output), and the raw data-section images the linker
/// lays out.
#[derive(Debug, Default)]
pub struct Asm {
    /// Instruction and label lines only.
    pub text_section: String,
    /// Human-facing listing with directives and data sections.
    pub listing: String,
    pub rodata: Vec<u8>,
    pub rodata_syms: Vec<(Id, u64)>,
    pub data: Vec<u8>,
    pub data_syms: Vec<(Id, u64)>,
    /// Offsets in `.data` holding 8-byte addresses of other symbols.
    pub data_relocs: Vec<(u64, Id)>,
    pub bss_syms: Vec<(Id, u64, u64)>,
    pub bss_size: u64,
    pub externs: Vec<Id>,
}

/// Pad a frame so that `rsp % 16 == 8` holds at every call site.
pub fn padded_frame(frame: i64) -> i64 {
    ((frame + 8 + 15) & !15) - 8
}

pub fn emit(module: &Module) -> Asm {
    let mut e = Emitter {
        text: String::new(),
        starts: module
            .funcs
            .iter()
            .map(|f| (f.start, padded_frame(f.frame_size)))
            .collect(),
    };
    e.startup();
    for (idx, instr) in module.code.iter().enumerate() {
        e.instr(idx, instr);
    }
    let mut asm = Asm { text_section: e.text, ..Asm::default() };
    layout_data(module, &mut asm);
    asm.listing = listing(module, &asm);
    debug!("emitted {} text bytes of assembly", asm.text_section.len());
    asm
}

struct Emitter {
    text: String,
    /// Function entry index -> padded frame size.
    starts: Map<usize, i64>,
}

const SCRATCH: [Reg; 3] = [Reg::Rax, Reg::R10, Reg::R11];

fn pick_scratch(avoid: &[Reg]) -> Reg {
    *SCRATCH.iter().find(|r| !avoid.contains(r)).unwrap_or(&Reg::Rax)
}

fn reg_of(op: &Operand) -> Option<Reg> {
    match op {
        Operand::Reg(r) => Some(*r),
        _ => None,
    }
}

fn imm_of(op: &Operand) -> Option<i64> {
    match op {
        Operand::Imm(text) => text.parse().ok(),
        _ => None,
    }
}

fn fits32(v: i64) -> bool {
    i32::try_from(v).is_ok()
}

/// rbp-relative or RIP-relative memory reference for Var/Mem operands.
fn mem_ref(op: &Operand) -> String {
    match op {
        Operand::Var { global: true, name, .. } => format!("{name}(%rip)"),
        Operand::Var { offset, .. } => format!("{offset}(%rbp)"),
        Operand::Mem(offset) => format!("{offset}(%rbp)"),
        _ => unreachable!("not a memory operand: {op}"),
    }
}

fn mov_suffix(size: i64) -> &'static str {
    match size {
        1 => "b",
        2 => "w",
        4 => "l",
        _ => "q",
    }
}

impl Emitter {
    fn line(&mut self, s: impl AsRef<str>) {
        self.text.push_str("    ");
        self.text.push_str(s.as_ref());
        self.text.push('\n');
    }

    fn label_line(&mut self, name: &str) {
        self.text.push_str(name);
        self.text.push_str(":\n");
    }

    /// The process entry point: zero the frame pointer, run main, exit
    /// with its return value via syscall 60.
    fn startup(&mut self) {
        self.label_line("_start");
        self.line("xorq %rbp, %rbp");
        self.line("call main");
        self.line("movq %rax, %rdi");
        self.line("movq $60, %rax");
        self.line("syscall");
    }

    fn instr(&mut self, idx: usize, instr: &Instr) {
        match instr.op {
            Op::Label => {
                let Some(Operand::Label(name)) = &instr.dst else { return };
                let name = *name;
                self.label_line(name.as_str());
                if let Some(pad) = self.starts.get(&idx).copied() {
                    self.line("pushq %rbp");
                    self.line("movq %rsp, %rbp");
                    self.line(format!("subq ${pad}, %rsp"));
                }
            }
            Op::Ret => {
                self.line("movq %rbp, %rsp");
                self.line("popq %rbp");
                self.line("ret");
            }
            Op::Jmp => {
                let Some(Operand::Label(l)) = &instr.dst else { return };
                self.line(format!("jmp {l}"));
            }
            Op::Jz | Op::Jnz => self.branch(instr),
            Op::Call => {
                let Some(Operand::Label(l)) = &instr.dst else { return };
                self.line(format!("call {l}"));
            }
            Op::Mov => self.mov(instr),
            Op::Load => self.load(instr),
            Op::Store => self.store(instr),
            Op::LoadAddr => self.load_addr(instr),
            Op::Add | Op::Sub | Op::And | Op::Or | Op::Xor | Op::Mul => self.arith(instr),
            Op::Div | Op::Mod => self.divide(instr),
            Op::Shl | Op::Shr => self.shift(instr),
            Op::Neg | Op::Not => self.negate(instr),
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => self.compare(instr),
            Op::Push | Op::Param => self.push_operand(instr.src1.as_ref().unwrap()),
            Op::Pop => {
                if let Some(Operand::Reg(r)) = &instr.dst {
                    self.line(format!("popq %{}", r.name64()));
                }
            }
        }
    }

    // --------------------------------------------------------------
    // Value plumbing

    /// A width-aware load from a memory reference string into `d`.
    /// Sub-word reads leave the upper bits zero.
    fn sized_load(&mut self, d: Reg, mem: &str, size: i64) {
        match size {
            1 => self.line(format!("movzbq {mem}, %{}", d.name64())),
            2 => {
                self.line(format!("xorq %{0}, %{0}", d.name64()));
                self.line(format!("movw {mem}, %{}", d.name16()));
            }
            4 => self.line(format!("movl {mem}, %{}", d.name32())),
            _ => self.line(format!("movq {mem}, %{}", d.name64())),
        }
    }

    /// Materialize any value operand into register `d`.
    fn load_into(&mut self, d: Reg, src: &Operand) {
        match src {
            Operand::Imm(v) => self.line(format!("movq ${v}, %{}", d.name64())),
            Operand::Reg(r) => {
                if *r != d {
                    self.line(format!("movq %{}, %{}", r.name64(), d.name64()));
                }
            }
            Operand::Var { size, .. } => {
                let size = *size;
                let mem = mem_ref(src);
                self.sized_load(d, &mem, size);
            }
            Operand::Mem(_) => {
                let mem = mem_ref(src);
                self.line(format!("movq {mem}, %{}", d.name64()));
            }
            Operand::Label(l) => {
                if l.as_str().starts_with(".FC") {
                    // Float literals move as 64-bit bit patterns.
                    self.line(format!("movq {l}(%rip), %{}", d.name64()));
                } else {
                    self.line(format!("leaq {l}(%rip), %{}", d.name64()));
                }
            }
            Operand::Ptr { base, size } => {
                let base_reg = self.base_into_reg(base, &[d]);
                if *size == 2 && base_reg == d {
                    // The xor pre-clear would wipe the address.
                    let alt = pick_scratch(&[d, base_reg]);
                    self.sized_load(alt, &format!("(%{})", base_reg.name64()), 2);
                    self.line(format!("movq %{}, %{}", alt.name64(), d.name64()));
                } else {
                    self.sized_load(d, &format!("(%{})", base_reg.name64()), *size);
                }
            }
            Operand::Array { .. } => self.array_access(src, AccessKind::Load(d)),
            Operand::Addr { name, offset, global } => {
                if *global {
                    self.line(format!("leaq {name}(%rip), %{}", d.name64()));
                } else {
                    self.line(format!("leaq {offset}(%rbp), %{}", d.name64()));
                }
            }
            Operand::Temp(t) => unreachable!("unallocated temp t{t} reached the emitter"),
        }
    }

    /// Get a pointer value into a register, loading through %r11 when
    /// it was spilled.  `avoid` lists registers the caller still needs.
    fn base_into_reg(&mut self, base: &Operand, avoid: &[Reg]) -> Reg {
        match base {
            Operand::Reg(r) => *r,
            Operand::Mem(_) | Operand::Var { .. } => {
                let scratch = if avoid.contains(&Reg::R11) { Reg::R10 } else { Reg::R11 };
                let mem = mem_ref(base);
                self.line(format!("movq {mem}, %{}", scratch.name64()));
                scratch
            }
            other => unreachable!("bad pointer base {other}"),
        }
    }

    fn write_reg(&mut self, s: Reg, dst: &Operand) {
        match dst {
            Operand::Reg(d) => {
                if *d != s {
                    self.line(format!("movq %{}, %{}", s.name64(), d.name64()));
                }
            }
            Operand::Var { .. } | Operand::Mem(_) => {
                let mem = mem_ref(dst);
                self.line(format!("movq %{}, {mem}", s.name64()));
            }
            other => unreachable!("bad arithmetic destination {other}"),
        }
    }

    /// The source form usable directly as the second operand of an
    /// ALU instruction, if any.
    fn alu_src(&self, op: &Operand) -> Option<String> {
        match op {
            Operand::Imm(v) => {
                let n: i64 = v.parse().ok()?;
                fits32(n).then(|| format!("${n}"))
            }
            Operand::Reg(r) => Some(format!("%{}", r.name64())),
            Operand::Var { .. } | Operand::Mem(_) => Some(mem_ref(op)),
            _ => None,
        }
    }

    // --------------------------------------------------------------
    // Instruction families

    fn mov(&mut self, instr: &Instr) {
        let dst = instr.dst.as_ref().unwrap();
        let src = instr.src1.as_ref().unwrap();
        match dst {
            Operand::Reg(d) => self.load_into(*d, src),
            Operand::Mem(_) | Operand::Var { .. } => {
                let mem = mem_ref(dst);
                if let Some(v) = imm_of(src) {
                    if fits32(v) {
                        self.line(format!("movq ${v}, {mem}"));
                        return;
                    }
                }
                self.load_into(Reg::Rax, src);
                self.line(format!("movq %rax, {mem}"));
            }
            other => unreachable!("bad mov destination {other}"),
        }
    }

    fn load(&mut self, instr: &Instr) {
        let dst = instr.dst.as_ref().unwrap();
        let src = instr.src1.as_ref().unwrap();
        match dst {
            Operand::Reg(d) => self.load_into(*d, src),
            Operand::Mem(_) | Operand::Var { .. } => {
                self.load_into(Reg::Rax, src);
                let mem = mem_ref(dst);
                self.line(format!("movq %rax, {mem}"));
            }
            other => unreachable!("bad load destination {other}"),
        }
    }

    fn load_addr(&mut self, instr: &Instr) {
        let dst = instr.dst.as_ref().unwrap();
        let src = instr.src1.as_ref().unwrap();
        let lea = |s: &Operand| -> String {
            match s {
                Operand::Var { global: true, name, .. } => format!("{name}(%rip)"),
                Operand::Var { offset, .. } => format!("{offset}(%rbp)"),
                Operand::Mem(offset) => format!("{offset}(%rbp)"),
                Operand::Addr { global: true, name, .. } => format!("{name}(%rip)"),
                Operand::Addr { offset, .. } => format!("{offset}(%rbp)"),
                Operand::Label(l) => format!("{l}(%rip)"),
                other => unreachable!("bad lea source {other}"),
            }
        };
        match dst {
            Operand::Reg(d) => {
                let src_ref = lea(src);
                self.line(format!("leaq {src_ref}, %{}", d.name64()));
            }
            Operand::Mem(_) | Operand::Var { .. } => {
                let src_ref = lea(src);
                self.line(format!("leaq {src_ref}, %rax"));
                let mem = mem_ref(dst);
                self.line(format!("movq %rax, {mem}"));
            }
            other => unreachable!("bad lea destination {other}"),
        }
    }

    fn store(&mut self, instr: &Instr) {
        let dst = instr.dst.as_ref().unwrap();
        let src = instr.src1.as_ref().unwrap();
        match dst {
            Operand::Var { size, .. } => {
                let size = *size;
                let mem = mem_ref(dst);
                if let Some(v) = imm_of(src) {
                    if fits32(v) {
                        self.line(format!("mov{} ${v}, {mem}", mov_suffix(size)));
                        return;
                    }
                }
                let value = self.value_reg(src, &[]);
                self.line(format!("mov{} %{}, {mem}", mov_suffix(size), value.name(size)));
            }
            Operand::Mem(_) => {
                let mem = mem_ref(dst);
                if let Some(v) = imm_of(src) {
                    if fits32(v) {
                        self.line(format!("movq ${v}, {mem}"));
                        return;
                    }
                }
                let value = self.value_reg(src, &[]);
                self.line(format!("movq %{}, {mem}", value.name64()));
            }
            Operand::Ptr { base, size } => {
                let size = *size;
                if let Some(v) = imm_of(src) {
                    if fits32(v) {
                        let base_reg = self.base_into_reg(base, &[]);
                        self.line(format!(
                            "mov{} ${v}, (%{})",
                            mov_suffix(size),
                            base_reg.name64()
                        ));
                        return;
                    }
                }
                // Value in %rax (or its own register), pointer in %r11.
                let value = self.value_reg(src, &[Reg::R11]);
                let base_reg = self.base_into_reg(base, &[value]);
                self.line(format!(
                    "mov{} %{}, (%{})",
                    mov_suffix(size),
                    value.name(size),
                    base_reg.name64()
                ));
            }
            Operand::Array { .. } => self.array_access(dst, AccessKind::Store(src.clone())),
            other => unreachable!("bad store destination {other}"),
        }
    }

    /// Value operand into some register, preferring to leave it where
    /// it already is.
    fn value_reg(&mut self, src: &Operand, avoid: &[Reg]) -> Reg {
        if let Some(r) = reg_of(src) {
            return r;
        }
        let scratch = pick_scratch(avoid);
        self.load_into(scratch, src);
        scratch
    }

    /// Shared lowering for array element access.  The base address is
    /// always formed in %rdx: %rax is usually the load destination or
    /// the store value and must stay intact.
    fn array_access(&mut self, operand: &Operand, kind: AccessKind) {
        let Operand::Array { base, offset, global, index, size } = operand else {
            unreachable!("array_access on {operand}");
        };
        let size = *size;

        // Rescue anything living in %rdx before the leaq clobbers it.
        let mut index = index.as_ref().clone();
        if reg_of(&index) == Some(Reg::Rdx) {
            self.line("movq %rdx, %r10");
            index = Operand::Reg(Reg::R10);
        }
        let mut store_value = match &kind {
            AccessKind::Store(v) => Some(v.clone()),
            AccessKind::Load(_) => None,
        };
        if let Some(v) = &store_value {
            if reg_of(v) == Some(Reg::Rdx) {
                self.line("movq %rdx, %rax");
                store_value = Some(Operand::Reg(Reg::Rax));
            }
        }

        if *global {
            self.line(format!("leaq {base}(%rip), %rdx"));
        } else {
            self.line(format!("leaq {offset}(%rbp), %rdx"));
        }

        // Index into a register (or folded into the displacement).
        let element = match &index {
            Operand::Imm(text) => {
                let disp: i64 = text.parse().unwrap_or(0);
                format!("{disp}(%rdx)")
            }
            Operand::Reg(r) => format!("(%rdx, %{}, 1)", r.name64()),
            Operand::Mem(_) => {
                let mem = mem_ref(&index);
                self.line(format!("movq {mem}, %r10"));
                "(%rdx, %r10, 1)".to_string()
            }
            other => unreachable!("bad array index {other}"),
        };
        let index_reg = match &index {
            Operand::Reg(r) => Some(*r),
            Operand::Mem(_) => Some(Reg::R10),
            _ => None,
        };

        match kind {
            AccessKind::Load(d) => {
                if size == 2 && (d == Reg::Rdx || Some(d) == index_reg) {
                    let alt = pick_scratch(&[Reg::Rdx, d, index_reg.unwrap_or(Reg::Rdx)]);
                    self.sized_load(alt, &element, 2);
                    self.line(format!("movq %{}, %{}", alt.name64(), d.name64()));
                } else {
                    self.sized_load(d, &element, size);
                }
            }
            AccessKind::Store(_) => {
                let v = store_value.unwrap();
                if let Some(n) = imm_of(&v) {
                    if fits32(n) {
                        self.line(format!("mov{} ${n}, {element}", mov_suffix(size)));
                        return;
                    }
                }
                let mut avoid = vec![Reg::Rdx];
                if let Some(ir) = index_reg {
                    avoid.push(ir);
                }
                let value = self.value_reg(&v, &avoid);
                self.line(format!("mov{} %{}, {element}", mov_suffix(size), value.name(size)));
            }
        }
    }

    fn arith(&mut self, instr: &Instr) {
        let dst = instr.dst.as_ref().unwrap();
        let s1 = instr.src1.as_ref().unwrap();
        let s2 = instr.src2.as_ref().unwrap();
        let mn = match instr.op {
            Op::Add => "addq",
            Op::Sub => "subq",
            Op::And => "andq",
            Op::Or => "orq",
            Op::Xor => "xorq",
            Op::Mul => "imulq",
            _ => unreachable!(),
        };

        // `addq $n, %rsp`-style in-place adjustment.
        if let (Some(d), Some(r1), Some(v)) = (reg_of(dst), reg_of(s1), imm_of(s2)) {
            if d == r1 && fits32(v) && instr.op != Op::Mul {
                self.line(format!("{mn} ${v}, %{}", d.name64()));
                return;
            }
        }

        let mut avoid = vec![];
        if let Some(r) = reg_of(s2) {
            avoid.push(r);
        }
        let acc = pick_scratch(&avoid);
        self.load_into(acc, s1);
        match self.alu_src(s2) {
            Some(form) if instr.op == Op::Mul && form.starts_with('$') => {
                self.line(format!("imulq {form}, %{0}, %{0}", acc.name64()));
            }
            Some(form) => self.line(format!("{mn} {form}, %{}", acc.name64())),
            None => {
                // Large immediate: materialize it first.
                let other = pick_scratch(&[acc]);
                self.load_into(other, s2);
                self.line(format!("{mn} %{}, %{}", other.name64(), acc.name64()));
            }
        }
        self.write_reg(acc, dst);
    }

    fn divide(&mut self, instr: &Instr) {
        let dst = instr.dst.as_ref().unwrap();
        let s1 = instr.src1.as_ref().unwrap();
        let s2 = instr.src2.as_ref().unwrap();

        // Divisors go through %r11: idiv has no immediate form, and
        // cqto is about to clobber %rdx.
        match (reg_of(s1), reg_of(s2)) {
            (Some(Reg::R11), Some(Reg::Rax)) => {
                self.line("movq %r11, %r10");
                self.line("movq %rax, %r11");
                self.line("movq %r10, %rax");
            }
            (_, Some(Reg::Rax)) => {
                self.line("movq %rax, %r11");
                self.load_into(Reg::Rax, s1);
            }
            (_, Some(Reg::R11)) => {
                self.load_into(Reg::Rax, s1);
            }
            _ => {
                self.load_into(Reg::Rax, s1);
                self.load_into(Reg::R11, s2);
            }
        }
        self.line("cqto");
        self.line("idivq %r11");
        let result = if instr.op == Op::Div { Reg::Rax } else { Reg::Rdx };
        self.write_reg(result, dst);
    }

    fn shift(&mut self, instr: &Instr) {
        let dst = instr.dst.as_ref().unwrap();
        let s1 = instr.src1.as_ref().unwrap();
        let s2 = instr.src2.as_ref().unwrap();
        let mn = if instr.op == Op::Shl { "shlq" } else { "sarq" };

        if let Some(n) = imm_of(s2) {
            self.load_into(Reg::Rax, s1);
            self.line(format!("{mn} ${}, %rax", n & 63));
            self.write_reg(Reg::Rax, dst);
            return;
        }
        // Variable counts shift by %cl.
        if reg_of(s2) == Some(Reg::Rax) {
            if reg_of(s1) == Some(Reg::Rcx) {
                self.line("movq %rcx, %r10");
                self.line("movq %rax, %rcx");
                self.line("movq %r10, %rax");
            } else {
                self.line("movq %rax, %rcx");
                self.load_into(Reg::Rax, s1);
            }
        } else {
            self.load_into(Reg::Rax, s1);
            if reg_of(s2) != Some(Reg::Rcx) {
                let form = self.alu_src(s2).unwrap_or_else(|| "$0".into());
                self.line(format!("movq {form}, %rcx"));
            }
        }
        self.line(format!("{mn} %cl, %rax"));
        self.write_reg(Reg::Rax, dst);
    }

    fn negate(&mut self, instr: &Instr) {
        let dst = instr.dst.as_ref().unwrap();
        let src = instr.src1.as_ref().unwrap();
        self.load_into(Reg::Rax, src);
        match instr.op {
            Op::Neg => self.line("negq %rax"),
            Op::Not => self.line("xorq $-1, %rax"),
            _ => unreachable!(),
        }
        self.write_reg(Reg::Rax, dst);
    }

    fn compare(&mut self, instr: &Instr) {
        let dst = instr.dst.as_ref().unwrap();
        let s1 = instr.src1.as_ref().unwrap();
        let s2 = instr.src2.as_ref().unwrap();
        let set = match instr.op {
            Op::Eq => "sete",
            Op::Ne => "setne",
            Op::Lt => "setl",
            Op::Le => "setle",
            Op::Gt => "setg",
            Op::Ge => "setge",
            _ => unreachable!(),
        };
        let mut avoid = vec![];
        if let Some(r) = reg_of(s2) {
            avoid.push(r);
        }
        let acc = pick_scratch(&avoid);
        self.load_into(acc, s1);
        match self.alu_src(s2) {
            Some(form) => self.line(format!("cmpq {form}, %{}", acc.name64())),
            None => {
                let other = pick_scratch(&[acc]);
                self.load_into(other, s2);
                self.line(format!("cmpq %{}, %{}", other.name64(), acc.name64()));
            }
        }
        self.line(format!("{set} %{}", acc.name8()));
        self.line(format!("movzbq %{}, %{}", acc.name8(), acc.name64()));
        self.write_reg(acc, dst);
    }

    fn branch(&mut self, instr: &Instr) {
        let Some(Operand::Label(target)) = &instr.dst else { return };
        let target = *target;
        let jcc = if instr.op == Op::Jz { "je" } else { "jne" };
        let value = instr.src1.as_ref().unwrap();
        match value {
            Operand::Imm(text) => {
                let v: i64 = text.parse().unwrap_or(0);
                let taken = if instr.op == Op::Jz { v == 0 } else { v != 0 };
                if taken {
                    self.line(format!("jmp {target}"));
                }
            }
            Operand::Reg(r) => {
                self.line(format!("testq %{0}, %{0}", r.name64()));
                self.line(format!("{jcc} {target}"));
            }
            Operand::Var { .. } | Operand::Mem(_) => {
                let mem = mem_ref(value);
                self.line(format!("cmpq $0, {mem}"));
                self.line(format!("{jcc} {target}"));
            }
            other => {
                self.load_into(Reg::Rax, other);
                self.line("testq %rax, %rax");
                self.line(format!("{jcc} {target}"));
            }
        }
    }

    fn push_operand(&mut self, src: &Operand) {
        match src {
            Operand::Imm(text) => {
                let v: i64 = text.parse().unwrap_or(0);
                if fits32(v) {
                    self.line(format!("pushq ${v}"));
                } else {
                    self.load_into(Reg::Rax, src);
                    self.line("pushq %rax");
                }
            }
            Operand::Reg(r) => self.line(format!("pushq %{}", r.name64())),
            Operand::Var { .. } | Operand::Mem(_) => {
                let mem = mem_ref(src);
                self.line(format!("pushq {mem}"));
            }
            other => {
                self.load_into(Reg::Rax, other);
                self.line("pushq %rax");
            }
        }
    }
}

enum AccessKind {
    Load(Reg),
    Store(Operand),
}

// ------------------------------------------------------------------
// Data sections

fn layout_data(module: &Module, asm: &mut Asm) {
    for (label, text) in &module.strings {
        asm.rodata_syms.push((*label, asm.rodata.len() as u64));
        asm.rodata.extend_from_slice(text.as_bytes());
        asm.rodata.push(0);
    }
    for (label, literal) in &module.floats {
        while asm.rodata.len() % 8 != 0 {
            asm.rodata.push(0);
        }
        asm.rodata_syms.push((*label, asm.rodata.len() as u64));
        let bits = literal.parse::<f64>().unwrap_or(0.0).to_bits();
        asm.rodata.extend_from_slice(&bits.to_le_bytes());
    }
    for g in &module.globals {
        match &g.init {
            GlobalInit::External => asm.externs.push(g.name),
            GlobalInit::Zero => {
                asm.bss_syms.push((g.name, asm.bss_size, g.size as u64));
                asm.bss_size += g.size.max(1) as u64;
            }
            GlobalInit::Int(v) => {
                asm.data_syms.push((g.name, asm.data.len() as u64));
                let bytes = v.to_le_bytes();
                let take = (g.size.max(1) as usize).min(8);
                asm.data.extend_from_slice(&bytes[..take]);
                for _ in take..g.size.max(1) as usize {
                    asm.data.push(0);
                }
            }
            GlobalInit::Bytes(b) => {
                asm.data_syms.push((g.name, asm.data.len() as u64));
                asm.data.extend_from_slice(b);
            }
            GlobalInit::Label(target) => {
                let offset = asm.data.len() as u64;
                asm.data_syms.push((g.name, offset));
                asm.data_relocs.push((offset, *target));
                asm.data.extend_from_slice(&[0u8; 8]);
            }
        }
    }
}

/// The `-S` listing: directives plus the text section plus readable
/// data sections.
fn listing(module: &Module, asm: &Asm) -> String {
    let mut out = String::new();
    out.push_str("    .text\n    .globl _start\n");
    out.push_str(&asm.text_section);
    if !module.strings.is_empty() || !module.floats.is_empty() {
        out.push_str("    .section .rodata\n");
        for (label, text) in &module.strings {
            out.push_str(&format!("{label}:\n    .string \"{}\"\n", escape(text)));
        }
        for (label, literal) in &module.floats {
            out.push_str(&format!("{label}:\n    .double {literal}\n"));
        }
    }
    let data: Vec<_> = module
        .globals
        .iter()
        .filter(|g| matches!(g.init, GlobalInit::Int(_) | GlobalInit::Bytes(_) | GlobalInit::Label(_)))
        .collect();
    if !data.is_empty() {
        out.push_str("    .data\n");
        for g in data {
            out.push_str(&format!("{}:\n", g.name));
            match &g.init {
                GlobalInit::Int(v) => {
                    let directive = match g.size {
                        1 => ".byte",
                        2 => ".word",
                        4 => ".long",
                        _ => ".quad",
                    };
                    out.push_str(&format!("    {directive} {v}\n"));
                }
                GlobalInit::Bytes(b) => {
                    let bytes: Vec<String> = b.iter().map(|x| x.to_string()).collect();
                    out.push_str(&format!("    .byte {}\n", bytes.join(", ")));
                }
                GlobalInit::Label(l) => out.push_str(&format!("    .quad {l}\n")),
                _ => {}
            }
        }
    }
    let bss: Vec<_> = module
        .globals
        .iter()
        .filter(|g| g.init == GlobalInit::Zero)
        .collect();
    if !bss.is_empty() {
        out.push_str("    .bss\n");
        for g in bss {
            out.push_str(&format!("    .comm {}, {}\n", g.name, g.size));
        }
    }
    out
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out
}
