//! The linear three-address IR.
//!
//! Instructions are `{op, dst, src1, src2}` records with at most three
//! operands.  Temps are single-assignment by construction; the
//! register allocator rewrites them in place to physical registers or
//! spill slots, so everything downstream of allocation sees only
//! `Reg`, `Mem`, `Var`, `Imm`, `Label`, `Ptr`, `Array`, and `Addr`
//! operands.

use derive_more::Display;

use crate::common::{Id, Map};

/// IR opcodes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum Op {
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("mul")]
    Mul,
    #[display("div")]
    Div,
    #[display("mod")]
    Mod,
    #[display("neg")]
    Neg,
    #[display("and")]
    And,
    #[display("or")]
    Or,
    #[display("xor")]
    Xor,
    #[display("not")]
    Not,
    #[display("shl")]
    Shl,
    #[display("shr")]
    Shr,
    #[display("eq")]
    Eq,
    #[display("ne")]
    Ne,
    #[display("lt")]
    Lt,
    #[display("le")]
    Le,
    #[display("gt")]
    Gt,
    #[display("ge")]
    Ge,
    #[display("mov")]
    Mov,
    #[display("load")]
    Load,
    #[display("store")]
    Store,
    #[display("lea")]
    LoadAddr,
    #[display("jmp")]
    Jmp,
    #[display("jz")]
    Jz,
    #[display("jnz")]
    Jnz,
    #[display("label")]
    Label,
    #[display("call")]
    Call,
    #[display("ret")]
    Ret,
    #[display("push")]
    Push,
    #[display("pop")]
    Pop,
    #[display("param")]
    Param,
}

/// Physical x86-64 general-purpose registers, numbered as encoded.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum Reg {
    #[display("rax")]
    Rax,
    #[display("rcx")]
    Rcx,
    #[display("rdx")]
    Rdx,
    #[display("rbx")]
    Rbx,
    #[display("rsp")]
    Rsp,
    #[display("rbp")]
    Rbp,
    #[display("rsi")]
    Rsi,
    #[display("rdi")]
    Rdi,
    #[display("r8")]
    R8,
    #[display("r9")]
    R9,
    #[display("r10")]
    R10,
    #[display("r11")]
    R11,
    #[display("r12")]
    R12,
    #[display("r13")]
    R13,
    #[display("r14")]
    R14,
    #[display("r15")]
    R15,
}

/// System V integer argument registers, in order.
pub static ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Allocation preference order over the 14 usable registers (rsp and
/// rbp are reserved).  Registers the emitter leans on as scratch and
/// the ABI argument registers come last so they stay free under
/// typical pressure.
pub static ALLOC_ORDER: [Reg; 14] = [
    Reg::Rbx,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
    Reg::Rcx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::Rdx,
    Reg::R10,
    Reg::R11,
    Reg::Rax,
];

impl Reg {
    /// Hardware encoding number (0-15).
    pub fn num(self) -> u8 {
        use Reg::*;
        match self {
            Rax => 0,
            Rcx => 1,
            Rdx => 2,
            Rbx => 3,
            Rsp => 4,
            Rbp => 5,
            Rsi => 6,
            Rdi => 7,
            R8 => 8,
            R9 => 9,
            R10 => 10,
            R11 => 11,
            R12 => 12,
            R13 => 13,
            R14 => 14,
            R15 => 15,
        }
    }

    pub fn name64(self) -> &'static str {
        use Reg::*;
        match self {
            Rax => "rax",
            Rcx => "rcx",
            Rdx => "rdx",
            Rbx => "rbx",
            Rsp => "rsp",
            Rbp => "rbp",
            Rsi => "rsi",
            Rdi => "rdi",
            R8 => "r8",
            R9 => "r9",
            R10 => "r10",
            R11 => "r11",
            R12 => "r12",
            R13 => "r13",
            R14 => "r14",
            R15 => "r15",
        }
    }

    pub fn name32(self) -> &'static str {
        use Reg::*;
        match self {
            Rax => "eax",
            Rcx => "ecx",
            Rdx => "edx",
            Rbx => "ebx",
            Rsp => "esp",
            Rbp => "ebp",
            Rsi => "esi",
            Rdi => "edi",
            R8 => "r8d",
            R9 => "r9d",
            R10 => "r10d",
            R11 => "r11d",
            R12 => "r12d",
            R13 => "r13d",
            R14 => "r14d",
            R15 => "r15d",
        }
    }

    pub fn name16(self) -> &'static str {
        use Reg::*;
        match self {
            Rax => "ax",
            Rcx => "cx",
            Rdx => "dx",
            Rbx => "bx",
            Rsp => "sp",
            Rbp => "bp",
            Rsi => "si",
            Rdi => "di",
            R8 => "r8w",
            R9 => "r9w",
            R10 => "r10w",
            R11 => "r11w",
            R12 => "r12w",
            R13 => "r13w",
            R14 => "r14w",
            R15 => "r15w",
        }
    }

    pub fn name8(self) -> &'static str {
        use Reg::*;
        match self {
            Rax => "al",
            Rcx => "cl",
            Rdx => "dl",
            Rbx => "bl",
            Rsp => "spl",
            Rbp => "bpl",
            Rsi => "sil",
            Rdi => "dil",
            R8 => "r8b",
            R9 => "r9b",
            R10 => "r10b",
            R11 => "r11b",
            R12 => "r12b",
            R13 => "r13b",
            R14 => "r14b",
            R15 => "r15b",
        }
    }

    /// Width-specific AT&T name.
    pub fn name(self, size: i64) -> &'static str {
        match size {
            1 => self.name8(),
            2 => self.name16(),
            4 => self.name32(),
            _ => self.name64(),
        }
    }

    /// Parse any width form back to (register, operand size in bytes).
    pub fn parse(name: &str) -> Option<(Reg, i64)> {
        use Reg::*;
        static ALL: [Reg; 16] = [
            Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi, R8, R9, R10, R11, R12, R13, R14, R15,
        ];
        for r in ALL {
            if r.name64() == name {
                return Some((r, 8));
            }
            if r.name32() == name {
                return Some((r, 4));
            }
            if r.name16() == name {
                return Some((r, 2));
            }
            if r.name8() == name {
                return Some((r, 1));
            }
        }
        None
    }
}

/// IR operands.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// Integer or decimal literal, kept as text.
    Imm(String),
    /// Compiler temporary, single-assignment, register-allocated.
    Temp(u32),
    /// Named stack local or global with its declared type and size.
    Var {
        name: Id,
        offset: i64,
        global: bool,
        ty: String,
        size: i64,
    },
    /// Pinned physical register; opaque to the allocator.
    Reg(Reg),
    /// Pinned rbp-relative stack slot; opaque to the allocator.
    Mem(i64),
    /// Symbolic code or data address.
    Label(Id),
    /// Dereference of the address held in `base`.
    Ptr { base: Box<Operand>, size: i64 },
    /// `base + index` addressing for array elements; `index` holds a
    /// byte offset and `size` the element width.
    Array {
        base: Id,
        offset: i64,
        global: bool,
        index: Box<Operand>,
        size: i64,
    },
    /// Address-of a named storage location.
    Addr { name: Id, offset: i64, global: bool },
}

impl Operand {
    pub fn imm(v: i64) -> Operand {
        Operand::Imm(v.to_string())
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Imm(v) => write!(f, "${v}"),
            Operand::Temp(id) => write!(f, "t{id}"),
            Operand::Var { name, global: true, .. } => write!(f, "@{name}"),
            Operand::Var { name, .. } => write!(f, "{name}"),
            Operand::Reg(r) => write!(f, "%{r}"),
            Operand::Mem(off) => write!(f, "[rbp{off:+}]"),
            Operand::Label(l) => write!(f, "{l}"),
            Operand::Ptr { base, size } => write!(f, "[{base}]:{size}"),
            Operand::Array { base, index, .. } => write!(f, "{base}[{index}]"),
            Operand::Addr { name, .. } => write!(f, "&{name}"),
        }
    }
}

/// One IR instruction.
#[derive(Clone, Debug)]
pub struct Instr {
    pub op: Op,
    pub dst: Option<Operand>,
    pub src1: Option<Operand>,
    pub src2: Option<Operand>,
}

impl Instr {
    pub fn nullary(op: Op) -> Instr {
        Instr { op, dst: None, src1: None, src2: None }
    }

    pub fn un(op: Op, dst: Operand, src: Operand) -> Instr {
        Instr { op, dst: Some(dst), src1: Some(src), src2: None }
    }

    pub fn bin(op: Op, dst: Operand, src1: Operand, src2: Operand) -> Instr {
        Instr { op, dst: Some(dst), src1: Some(src1), src2: Some(src2) }
    }

    pub fn label(name: Id) -> Instr {
        Instr { op: Op::Label, dst: Some(Operand::Label(name)), src1: None, src2: None }
    }

    pub fn jump(op: Op, target: Id) -> Instr {
        Instr { op, dst: Some(Operand::Label(target)), src1: None, src2: None }
    }

    /// Conditional jump on `value` (Jz / Jnz).
    pub fn branch(op: Op, value: Operand, target: Id) -> Instr {
        Instr { op, dst: Some(Operand::Label(target)), src1: Some(value), src2: None }
    }
}

impl std::fmt::Display for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.op)?;
        for operand in [&self.dst, &self.src1, &self.src2].into_iter().flatten() {
            write!(f, " {operand}")?;
        }
        Ok(())
    }
}

/// Per-function bookkeeping: where the function's instructions sit in
/// the stream and how many frame bytes its locals (and later, spills)
/// occupy.
#[derive(Clone, Debug)]
pub struct FuncFrame {
    pub name: Id,
    /// Index of the function's `Label` instruction.
    pub start: usize,
    /// One past the last instruction.
    pub end: usize,
    pub frame_size: i64,
}

/// How a global's storage is initialized.
#[derive(Clone, Debug, PartialEq)]
pub enum GlobalInit {
    /// Zero-initialized: lands in .bss.
    Zero,
    /// Integer constant: lands in .data.
    Int(i64),
    /// Raw bytes (float bit patterns): lands in .data.
    Bytes(Vec<u8>),
    /// Address of another symbol (string literals): .data + ABS64.
    Label(Id),
    /// Defined elsewhere; never laid out here.
    External,
}

#[derive(Clone, Debug)]
pub struct GlobalVar {
    pub name: Id,
    pub size: i64,
    pub init: GlobalInit,
}

/// Everything the selector hands to the allocator and back end.
#[derive(Debug, Default)]
pub struct Module {
    pub code: Vec<Instr>,
    pub funcs: Vec<FuncFrame>,
    /// String literal pool: label -> contents (NUL added at emission).
    pub strings: Vec<(Id, String)>,
    /// Float literal pool: label -> literal text.
    pub floats: Vec<(Id, String)>,
    pub globals: Vec<GlobalVar>,
}

/// Map from temp id to its optional C-type string, maintained by the
/// selector for member resolution through casts and dereferences.
pub type TempTypes = Map<u32, String>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::id;

    #[test]
    fn register_names_by_width() {
        assert_eq!(Reg::Rax.name(8), "rax");
        assert_eq!(Reg::Rax.name(4), "eax");
        assert_eq!(Reg::Rax.name(2), "ax");
        assert_eq!(Reg::Rax.name(1), "al");
        assert_eq!(Reg::R9.name(4), "r9d");
        assert_eq!(Reg::R9.name(1), "r9b");
    }

    #[test]
    fn register_parse_roundtrip() {
        assert_eq!(Reg::parse("rdx"), Some((Reg::Rdx, 8)));
        assert_eq!(Reg::parse("r12d"), Some((Reg::R12, 4)));
        assert_eq!(Reg::parse("sil"), Some((Reg::Rsi, 1)));
        assert_eq!(Reg::parse("xmm0"), None);
    }

    #[test]
    fn encoding_numbers() {
        assert_eq!(Reg::Rax.num(), 0);
        assert_eq!(Reg::Rsp.num(), 4);
        assert_eq!(Reg::R8.num(), 8);
        assert_eq!(Reg::R15.num(), 15);
    }

    #[test]
    fn instr_display() {
        let i = Instr::bin(Op::Add, Operand::Temp(3), Operand::Temp(1), Operand::imm(2));
        assert_eq!(i.to_string(), "add t3 t1 $2");
        let j = Instr::jump(Op::Jmp, id(".L1"));
        assert_eq!(j.to_string(), "jmp .L1");
    }
}
