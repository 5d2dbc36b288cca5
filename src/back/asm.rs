//! The assembler: AT&T text to x86-64 machine code, in two passes.
//!
//! Pass 1 records label offsets; pass 2 encodes for real.  Both passes
//! run the same encoder (pass 1 just withholds the symbol table), so
//! the size estimate and the final byte count agree by construction:
//! branch and RIP-relative displacements are always 32-bit, and every
//! other displacement width depends only on literal text.
//!
//! Encoding follows the usual x86-64 scheme: an optional 0x66
//! operand-size prefix, an optional REX prefix (W = 64-bit operand,
//! R/X/B = register-number extensions), the opcode, a ModR/M byte, an
//! optional SIB byte (rsp/r12 bases and scaled indexes), a
//! displacement, and an immediate.  rbp/r13 cannot take the
//! no-displacement form and get an explicit zero disp8; mod=00 with
//! r/m=101 is RIP-relative addressing.

use derive_more::Display;
use log::debug;

use crate::common::{id, Id, Map};
use crate::middle::ir::Reg;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RelocKind {
    /// 32-bit displacement relative to the end of the field.
    Pc32,
    /// Absolute 64-bit address.
    Abs64,
}

#[derive(Clone, Debug)]
pub struct Reloc {
    pub offset: u64,
    pub symbol: Id,
    pub addend: i64,
    pub kind: RelocKind,
}

/// Assembler output: text-section bytes, label offsets, and the
/// relocations the linker must resolve.
#[derive(Debug, Default)]
pub struct ObjectCode {
    pub code: Vec<u8>,
    pub symbols: Map<Id, u64>,
    pub relocs: Vec<Reloc>,
}

#[derive(Display)]
#[display("encoding error: {}", self.0)]
pub struct EncodeError(String);

impl std::fmt::Debug for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

fn err(line: &str, what: &str) -> EncodeError {
    EncodeError(format!("{what} in '{}'", line.trim()))
}

pub fn assemble(text: &str) -> Result<ObjectCode, EncodeError> {
    // Pass 1: label offsets from exact instruction sizes.
    let mut symbols = Map::new();
    {
        let mut sizing = Encoder { out: vec![], relocs: vec![], symbols: None };
        for line in lines(text) {
            match line {
                Line::Label(name) => {
                    symbols.insert(id(name), sizing.out.len() as u64);
                }
                Line::Instr(text) => sizing.encode(text)?,
            }
        }
    }
    // Pass 2: encode with every label known.
    let (out, relocs) = {
        let mut enc = Encoder { out: vec![], relocs: vec![], symbols: Some(&symbols) };
        for line in lines(text) {
            if let Line::Instr(text) = line {
                enc.encode(text)?;
            }
        }
        (enc.out, enc.relocs)
    };
    debug!("assembled {} bytes, {} relocations", out.len(), relocs.len());
    Ok(ObjectCode { code: out, symbols, relocs })
}

enum Line<'a> {
    Label(&'a str),
    Instr(&'a str),
}

fn lines(text: &str) -> impl Iterator<Item = Line<'_>> {
    text.lines().filter_map(|raw| {
        let line = match raw.find('#') {
            Some(i) => raw[..i].trim(),
            None => raw.trim(),
        };
        if line.is_empty() {
            return None;
        }
        if let Some(name) = line.strip_suffix(':') {
            if !name.contains(char::is_whitespace) {
                return Some(Line::Label(name));
            }
        }
        if line.starts_with('.') {
            // Directives carry no code.
            return None;
        }
        Some(Line::Instr(line))
    })
}

/// A parsed operand.
#[derive(Debug, Clone)]
enum AOp {
    Imm(i64),
    Reg(Reg, i64),
    Mem(MemRef),
    Sym(String),
}

#[derive(Debug, Clone)]
struct MemRef {
    base: Option<Reg>,
    index: Option<Reg>,
    scale: u8,
    disp: i64,
    /// RIP-relative reference to this symbol.
    rip: Option<String>,
}

fn parse_operand(text: &str, line: &str) -> Result<AOp, EncodeError> {
    let text = text.trim();
    if let Some(imm) = text.strip_prefix('$') {
        return imm
            .parse::<i64>()
            .map(AOp::Imm)
            .map_err(|_| err(line, "bad immediate"));
    }
    if let Some(name) = text.strip_prefix('%') {
        return Reg::parse(name)
            .map(|(r, w)| AOp::Reg(r, w))
            .ok_or_else(|| err(line, "unknown register"));
    }
    if let Some(open) = text.find('(') {
        let head = text[..open].trim();
        let inner = text[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| err(line, "unterminated memory operand"))?;
        let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
        if parts.first() == Some(&"%rip") {
            return Ok(AOp::Mem(MemRef {
                base: None,
                index: None,
                scale: 1,
                disp: 0,
                rip: Some(head.to_string()),
            }));
        }
        let disp = if head.is_empty() {
            0
        } else {
            head.parse::<i64>().map_err(|_| err(line, "bad displacement"))?
        };
        let reg = |s: &str| -> Result<Reg, EncodeError> {
            s.strip_prefix('%')
                .and_then(Reg::parse)
                .map(|(r, _)| r)
                .ok_or_else(|| err(line, "bad base or index register"))
        };
        let base = Some(reg(parts[0])?);
        let index = match parts.get(1) {
            Some(p) => Some(reg(p)?),
            None => None,
        };
        let scale = match parts.get(2) {
            Some(p) => p.parse::<u8>().map_err(|_| err(line, "bad scale"))?,
            None => 1,
        };
        return Ok(AOp::Mem(MemRef { base, index, scale, disp, rip: None }));
    }
    Ok(AOp::Sym(text.to_string()))
}

/// Split an operand list on top-level commas (parens keep their
/// commas).
fn split_operands(text: &str) -> Vec<&str> {
    let mut out = vec![];
    let mut depth = 0;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                out.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = text[start..].trim();
    if !last.is_empty() {
        out.push(last);
    }
    out
}

struct Encoder<'s> {
    out: Vec<u8>,
    relocs: Vec<Reloc>,
    /// None while sizing (pass 1): branches encode as zero and no
    /// relocations are recorded.
    symbols: Option<&'s Map<Id, u64>>,
}

impl Encoder<'_> {
    fn u8(&mut self, b: u8) {
        self.out.push(b);
    }

    fn u16le(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u32le(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u64le(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    /// Operand-size and REX prefixes.  `force_rex` is set for the
    /// uniform byte registers (spl/bpl/sil/dil), which are only
    /// reachable with a REX prefix present.
    fn prefixes(&mut self, width: i64, reg: u8, index: u8, base: u8, force_rex: bool) {
        if width == 2 {
            self.u8(0x66);
        }
        let mut rex = 0x40u8;
        if width == 8 {
            rex |= 8;
        }
        if reg >= 8 {
            rex |= 4;
        }
        if index >= 8 {
            rex |= 2;
        }
        if base >= 8 {
            rex |= 1;
        }
        if rex != 0x40 || force_rex {
            self.u8(rex);
        }
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.u8((mode << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    /// ModR/M + SIB + displacement for a memory operand.  RIP-relative
    /// references emit a placeholder and a PC32 relocation; `tail` is
    /// the number of immediate bytes that will follow the displacement
    /// (RIP counts from the end of the whole instruction).
    fn mem(&mut self, reg_field: u8, mem: &MemRef, line: &str, tail: i64) -> Result<(), EncodeError> {
        if let Some(symbol) = &mem.rip {
            self.modrm(0b00, reg_field, 0b101);
            self.reloc_here(symbol, -4 - tail, RelocKind::Pc32);
            self.u32le(0);
            return Ok(());
        }
        let base = mem.base.ok_or_else(|| err(line, "memory operand without base"))?;
        let bnum = base.num();
        let mode = if mem.disp == 0 && bnum & 7 != 5 {
            0b00
        } else if i8::try_from(mem.disp).is_ok() {
            0b01
        } else {
            0b10
        };
        match mem.index {
            Some(index) => {
                if index == Reg::Rsp {
                    return Err(err(line, "rsp cannot be an index register"));
                }
                let scale_bits = match mem.scale {
                    1 => 0,
                    2 => 1,
                    4 => 2,
                    8 => 3,
                    _ => return Err(err(line, "bad scale")),
                };
                self.modrm(mode, reg_field, 0b100);
                self.u8((scale_bits << 6) | ((index.num() & 7) << 3) | (bnum & 7));
            }
            None if bnum & 7 == 4 => {
                // rsp/r12 always need a SIB byte (REX.B picks r12).
                self.modrm(mode, reg_field, 0b100);
                self.u8(0x24);
            }
            None => self.modrm(mode, reg_field, bnum),
        }
        match mode {
            0b01 => self.u8(mem.disp as i8 as u8),
            0b10 => self.u32le(mem.disp as i32 as u32),
            _ => {}
        }
        Ok(())
    }

    fn reloc_here(&mut self, symbol: &str, addend: i64, kind: RelocKind) {
        if self.symbols.is_some() {
            self.relocs.push(Reloc {
                offset: self.out.len() as u64,
                symbol: id(symbol),
                addend,
                kind,
            });
        }
    }

    /// Branch target: direct rel32 when the label is local, otherwise
    /// a PC32 relocation against the symbol.
    fn rel32_target(&mut self, symbol: &str) {
        match self.symbols.and_then(|s| s.get(&id(symbol))) {
            Some(target) => {
                let after = self.out.len() as i64 + 4;
                self.u32le((*target as i64 - after) as i32 as u32);
            }
            None => {
                self.reloc_here(symbol, -4, RelocKind::Pc32);
                self.u32le(0);
            }
        }
    }

    fn encode(&mut self, line: &str) -> Result<(), EncodeError> {
        let (mnemonic, rest) = match line.find(char::is_whitespace) {
            Some(i) => (&line[..i], line[i..].trim()),
            None => (line, ""),
        };
        let ops: Vec<AOp> = split_operands(rest)
            .into_iter()
            .map(|o| parse_operand(o, line))
            .collect::<Result<_, _>>()?;

        match mnemonic {
            "movq" | "movl" | "movw" | "movb" => self.mov(mnemonic, &ops, line),
            "movzbq" => self.movzbq(&ops, line),
            "leaq" => self.leaq(&ops, line),
            "addq" => self.alu(0x01, 0, &ops, line),
            "subq" => self.alu(0x29, 5, &ops, line),
            "andq" => self.alu(0x21, 4, &ops, line),
            "orq" => self.alu(0x09, 1, &ops, line),
            "xorq" => self.alu(0x31, 6, &ops, line),
            "cmpq" => self.alu(0x39, 7, &ops, line),
            "testq" => self.testq(&ops, line),
            "imulq" => self.imulq(&ops, line),
            "idivq" => self.group_f7(7, &ops, line),
            "negq" => self.group_f7(3, &ops, line),
            "cqto" => {
                self.u8(0x48);
                self.u8(0x99);
                Ok(())
            }
            "shlq" => self.shift(4, &ops, line),
            "shrq" => self.shift(5, &ops, line),
            "sarq" => self.shift(7, &ops, line),
            "pushq" => self.pushq(&ops, line),
            "popq" => self.popq(&ops, line),
            "call" => self.branch(0xE8, None, &ops, line),
            "jmp" => self.branch(0xE9, None, &ops, line),
            "je" | "jz" => self.branch(0x0F, Some(0x84), &ops, line),
            "jne" | "jnz" => self.branch(0x0F, Some(0x85), &ops, line),
            "jl" => self.branch(0x0F, Some(0x8C), &ops, line),
            "jle" => self.branch(0x0F, Some(0x8E), &ops, line),
            "jg" => self.branch(0x0F, Some(0x8F), &ops, line),
            "jge" => self.branch(0x0F, Some(0x8D), &ops, line),
            "sete" => self.setcc(0x94, &ops, line),
            "setne" => self.setcc(0x95, &ops, line),
            "setl" => self.setcc(0x9C, &ops, line),
            "setle" => self.setcc(0x9E, &ops, line),
            "setg" => self.setcc(0x9F, &ops, line),
            "setge" => self.setcc(0x9D, &ops, line),
            "syscall" => {
                self.u8(0x0F);
                self.u8(0x05);
                Ok(())
            }
            "ret" => {
                self.u8(0xC3);
                Ok(())
            }
            "nop" => {
                self.u8(0x90);
                Ok(())
            }
            _ => Err(err(line, "unknown mnemonic")),
        }
    }

    fn width_of(mnemonic: &str) -> i64 {
        match mnemonic.as_bytes().last() {
            Some(b'b') => 1,
            Some(b'w') => 2,
            Some(b'l') => 4,
            _ => 8,
        }
    }

    /// A byte access to spl/bpl/sil/dil needs a REX prefix present.
    fn force_rex(width: i64, nums: &[u8]) -> bool {
        width == 1 && nums.iter().any(|n| (4..=7).contains(n))
    }

    fn mov(&mut self, mnemonic: &str, ops: &[AOp], line: &str) -> Result<(), EncodeError> {
        let w = Self::width_of(mnemonic);
        match ops {
            [AOp::Reg(s, _), AOp::Reg(d, _)] => {
                let opcode = if w == 1 { 0x88 } else { 0x89 };
                self.prefixes(w, s.num(), 0, d.num(), Self::force_rex(w, &[s.num(), d.num()]));
                self.u8(opcode);
                self.modrm(0b11, s.num(), d.num());
                Ok(())
            }
            [AOp::Mem(m), AOp::Reg(d, _)] => {
                let opcode = if w == 1 { 0x8A } else { 0x8B };
                self.mem_op(w, opcode, d.num(), m, line, Self::force_rex(w, &[d.num()]), 0)
            }
            [AOp::Reg(s, _), AOp::Mem(m)] => {
                let opcode = if w == 1 { 0x88 } else { 0x89 };
                self.mem_op(w, opcode, s.num(), m, line, Self::force_rex(w, &[s.num()]), 0)
            }
            [AOp::Imm(v), AOp::Reg(d, _)] => {
                match w {
                    8 => {
                        if i32::try_from(*v).is_ok() {
                            self.prefixes(8, 0, 0, d.num(), false);
                            self.u8(0xC7);
                            self.modrm(0b11, 0, d.num());
                            self.u32le(*v as i32 as u32);
                        } else {
                            // movabs
                            self.prefixes(8, 0, 0, d.num(), false);
                            self.u8(0xB8 + (d.num() & 7));
                            self.u64le(*v as u64);
                        }
                    }
                    4 => {
                        self.prefixes(4, 0, 0, d.num(), false);
                        self.u8(0xB8 + (d.num() & 7));
                        self.u32le(*v as i32 as u32);
                    }
                    2 => {
                        self.prefixes(2, 0, 0, d.num(), false);
                        self.u8(0xB8 + (d.num() & 7));
                        self.u16le(*v as i16 as u16);
                    }
                    _ => {
                        self.prefixes(1, 0, 0, d.num(), Self::force_rex(1, &[d.num()]));
                        self.u8(0xB0 + (d.num() & 7));
                        self.u8(*v as i8 as u8);
                    }
                }
                Ok(())
            }
            [AOp::Imm(v), AOp::Mem(m)] => {
                if w == 8 && i32::try_from(*v).is_err() {
                    return Err(err(line, "64-bit immediate store needs a register"));
                }
                let opcode = if w == 1 { 0xC6 } else { 0xC7 };
                let tail = match w {
                    1 => 1,
                    2 => 2,
                    _ => 4,
                };
                self.mem_op(w, opcode, 0, m, line, false, tail)?;
                match w {
                    1 => self.u8(*v as i8 as u8),
                    2 => self.u16le(*v as i16 as u16),
                    _ => self.u32le(*v as i32 as u32),
                }
                Ok(())
            }
            _ => Err(err(line, "unsupported mov form")),
        }
    }

    /// Prefixes + opcode + ModR/M for an instruction with one memory
    /// operand.  The immediate (if any) is appended by the caller.
    fn mem_op(
        &mut self,
        width: i64,
        opcode: u8,
        reg_field: u8,
        m: &MemRef,
        line: &str,
        force_rex: bool,
        tail: i64,
    ) -> Result<(), EncodeError> {
        let index = m.index.map(|r| r.num()).unwrap_or(0);
        let base = m.base.map(|r| r.num()).unwrap_or(0);
        self.prefixes(width, reg_field, index, base, force_rex);
        self.u8(opcode);
        self.mem(reg_field, m, line, tail)
    }

    fn two_byte_mem_op(
        &mut self,
        width: i64,
        opcode: u8,
        reg_field: u8,
        m: &MemRef,
        line: &str,
    ) -> Result<(), EncodeError> {
        let index = m.index.map(|r| r.num()).unwrap_or(0);
        let base = m.base.map(|r| r.num()).unwrap_or(0);
        self.prefixes(width, reg_field, index, base, false);
        self.u8(0x0F);
        self.u8(opcode);
        self.mem(reg_field, m, line, 0)
    }

    fn movzbq(&mut self, ops: &[AOp], line: &str) -> Result<(), EncodeError> {
        match ops {
            [AOp::Reg(s, _), AOp::Reg(d, _)] => {
                let force = Self::force_rex(1, &[s.num()]);
                self.prefixes(8, d.num(), 0, s.num(), force);
                self.u8(0x0F);
                self.u8(0xB6);
                self.modrm(0b11, d.num(), s.num());
                Ok(())
            }
            [AOp::Mem(m), AOp::Reg(d, _)] => self.two_byte_mem_op(8, 0xB6, d.num(), m, line),
            _ => Err(err(line, "unsupported movzbq form")),
        }
    }

    fn leaq(&mut self, ops: &[AOp], line: &str) -> Result<(), EncodeError> {
        match ops {
            [AOp::Mem(m), AOp::Reg(d, _)] => self.mem_op(8, 0x8D, d.num(), m, line, false, 0),
            _ => Err(err(line, "lea needs a memory source and register destination")),
        }
    }

    /// The classic ALU family: reg->rm opcode given, rm->reg is
    /// opcode+2, immediate forms are 0x83 (imm8) / 0x81 (imm32) with
    /// the group extension in the reg field.
    fn alu(&mut self, opcode: u8, ext: u8, ops: &[AOp], line: &str) -> Result<(), EncodeError> {
        match ops {
            [AOp::Reg(s, _), AOp::Reg(d, _)] => {
                self.prefixes(8, s.num(), 0, d.num(), false);
                self.u8(opcode);
                self.modrm(0b11, s.num(), d.num());
                Ok(())
            }
            [AOp::Reg(s, _), AOp::Mem(m)] => self.mem_op(8, opcode, s.num(), m, line, false, 0),
            [AOp::Mem(m), AOp::Reg(d, _)] => self.mem_op(8, opcode + 2, d.num(), m, line, false, 0),
            [AOp::Imm(v), AOp::Reg(d, _)] => {
                let (op, small) = if i8::try_from(*v).is_ok() { (0x83, true) } else { (0x81, false) };
                self.prefixes(8, 0, 0, d.num(), false);
                self.u8(op);
                self.modrm(0b11, ext, d.num());
                if small {
                    self.u8(*v as i8 as u8);
                } else if i32::try_from(*v).is_ok() {
                    self.u32le(*v as i32 as u32);
                } else {
                    return Err(err(line, "immediate does not fit in 32 bits"));
                }
                Ok(())
            }
            [AOp::Imm(v), AOp::Mem(m)] => {
                let (op, small) = if i8::try_from(*v).is_ok() { (0x83, true) } else { (0x81, false) };
                let tail = if small { 1 } else { 4 };
                self.mem_op(8, op, ext, m, line, false, tail)?;
                if small {
                    self.u8(*v as i8 as u8);
                } else if i32::try_from(*v).is_ok() {
                    self.u32le(*v as i32 as u32);
                } else {
                    return Err(err(line, "immediate does not fit in 32 bits"));
                }
                Ok(())
            }
            _ => Err(err(line, "unsupported operand form")),
        }
    }

    fn testq(&mut self, ops: &[AOp], line: &str) -> Result<(), EncodeError> {
        match ops {
            [AOp::Reg(s, _), AOp::Reg(d, _)] => {
                self.prefixes(8, s.num(), 0, d.num(), false);
                self.u8(0x85);
                self.modrm(0b11, s.num(), d.num());
                Ok(())
            }
            [AOp::Imm(v), AOp::Reg(d, _)] => {
                self.prefixes(8, 0, 0, d.num(), false);
                self.u8(0xF7);
                self.modrm(0b11, 0, d.num());
                self.u32le(*v as i32 as u32);
                Ok(())
            }
            _ => Err(err(line, "unsupported test form")),
        }
    }

    fn imulq(&mut self, ops: &[AOp], line: &str) -> Result<(), EncodeError> {
        match ops {
            [AOp::Reg(s, _), AOp::Reg(d, _)] => {
                self.prefixes(8, d.num(), 0, s.num(), false);
                self.u8(0x0F);
                self.u8(0xAF);
                self.modrm(0b11, d.num(), s.num());
                Ok(())
            }
            [AOp::Mem(m), AOp::Reg(d, _)] => self.two_byte_mem_op(8, 0xAF, d.num(), m, line),
            [AOp::Imm(v), AOp::Reg(s, _), AOp::Reg(d, _)] => {
                if i32::try_from(*v).is_err() {
                    return Err(err(line, "imul immediate does not fit in 32 bits"));
                }
                self.prefixes(8, d.num(), 0, s.num(), false);
                self.u8(0x69);
                self.modrm(0b11, d.num(), s.num());
                self.u32le(*v as i32 as u32);
                Ok(())
            }
            _ => Err(err(line, "unsupported imul form")),
        }
    }

    /// The 0xF7 group: neg (/3), idiv (/7), and friends.
    fn group_f7(&mut self, ext: u8, ops: &[AOp], line: &str) -> Result<(), EncodeError> {
        match ops {
            [AOp::Reg(r, _)] => {
                self.prefixes(8, 0, 0, r.num(), false);
                self.u8(0xF7);
                self.modrm(0b11, ext, r.num());
                Ok(())
            }
            [AOp::Mem(m)] => self.mem_op(8, 0xF7, ext, m, line, false, 0),
            _ => Err(err(line, "unsupported operand form")),
        }
    }

    fn shift(&mut self, ext: u8, ops: &[AOp], line: &str) -> Result<(), EncodeError> {
        match ops {
            [AOp::Imm(v), AOp::Reg(d, _)] => {
                self.prefixes(8, 0, 0, d.num(), false);
                self.u8(0xC1);
                self.modrm(0b11, ext, d.num());
                self.u8(*v as u8 & 63);
                Ok(())
            }
            [AOp::Reg(Reg::Rcx, 1), AOp::Reg(d, _)] => {
                // Shift by %cl.
                self.prefixes(8, 0, 0, d.num(), false);
                self.u8(0xD3);
                self.modrm(0b11, ext, d.num());
                Ok(())
            }
            _ => Err(err(line, "shift count must be an immediate or %cl")),
        }
    }

    fn pushq(&mut self, ops: &[AOp], line: &str) -> Result<(), EncodeError> {
        match ops {
            [AOp::Reg(r, _)] => {
                if r.num() >= 8 {
                    self.u8(0x41);
                }
                self.u8(0x50 + (r.num() & 7));
                Ok(())
            }
            [AOp::Imm(v)] => {
                if i32::try_from(*v).is_err() {
                    return Err(err(line, "push immediate does not fit in 32 bits"));
                }
                self.u8(0x68);
                self.u32le(*v as i32 as u32);
                Ok(())
            }
            [AOp::Mem(m)] => {
                // Default operand size is 64-bit; no REX.W needed.
                let index = m.index.map(|r| r.num()).unwrap_or(0);
                let base = m.base.map(|r| r.num()).unwrap_or(0);
                self.prefixes(4, 6, index, base, false);
                self.u8(0xFF);
                self.mem(6, m, line, 0)
            }
            _ => Err(err(line, "unsupported push form")),
        }
    }

    fn popq(&mut self, ops: &[AOp], line: &str) -> Result<(), EncodeError> {
        match ops {
            [AOp::Reg(r, _)] => {
                if r.num() >= 8 {
                    self.u8(0x41);
                }
                self.u8(0x58 + (r.num() & 7));
                Ok(())
            }
            _ => Err(err(line, "unsupported pop form")),
        }
    }

    fn branch(
        &mut self,
        first: u8,
        second: Option<u8>,
        ops: &[AOp],
        line: &str,
    ) -> Result<(), EncodeError> {
        match ops {
            [AOp::Sym(symbol)] => {
                self.u8(first);
                if let Some(b) = second {
                    self.u8(b);
                }
                self.rel32_target(symbol);
                Ok(())
            }
            _ => Err(err(line, "branch target must be a label")),
        }
    }

    fn setcc(&mut self, opcode: u8, ops: &[AOp], line: &str) -> Result<(), EncodeError> {
        match ops {
            [AOp::Reg(r, _)] => {
                self.prefixes(4, 0, 0, r.num(), Self::force_rex(1, &[r.num()]));
                self.u8(0x0F);
                self.u8(opcode);
                self.modrm(0b11, 0, r.num());
                Ok(())
            }
            _ => Err(err(line, "setcc needs a byte register")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(line: &str) -> Vec<u8> {
        assemble(line).unwrap().code
    }

    #[test]
    fn mov_register_forms() {
        assert_eq!(bytes("movq %rbx, %rax"), vec![0x48, 0x89, 0xD8]);
        assert_eq!(bytes("movq %rax, %r8"), vec![0x49, 0x89, 0xC0]);
        assert_eq!(bytes("movq %r8, %rax"), vec![0x4C, 0x89, 0xC0]);
        assert_eq!(bytes("movl %ebx, %eax"), vec![0x89, 0xD8]);
    }

    #[test]
    fn mov_immediates() {
        assert_eq!(bytes("movq $60, %rax"), vec![0x48, 0xC7, 0xC0, 60, 0, 0, 0]);
        // 64-bit immediate switches to movabs.
        assert_eq!(
            bytes("movq $81985529216486895, %rax"),
            vec![0x48, 0xB8, 0xEF, 0xCD, 0xAB, 0x89, 0x67, 0x45, 0x23, 0x01]
        );
        assert_eq!(bytes("movq $-1, %rax"), vec![0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn rbp_relative_memory() {
        // disp8 form for small offsets.
        assert_eq!(bytes("movq -8(%rbp), %rax"), vec![0x48, 0x8B, 0x45, 0xF8]);
        assert_eq!(bytes("movq %rax, -8(%rbp)"), vec![0x48, 0x89, 0x45, 0xF8]);
        // disp32 when it does not fit in a signed byte.
        assert_eq!(
            bytes("movq -256(%rbp), %rax"),
            vec![0x48, 0x8B, 0x85, 0x00, 0xFF, 0xFF, 0xFF]
        );
        // rbp with zero displacement still needs disp8.
        assert_eq!(bytes("movq 0(%rbp), %rax"), vec![0x48, 0x8B, 0x45, 0x00]);
    }

    #[test]
    fn rsp_needs_sib() {
        assert_eq!(bytes("movq (%rsp), %rax"), vec![0x48, 0x8B, 0x04, 0x24]);
        assert_eq!(bytes("movq 8(%rsp), %rax"), vec![0x48, 0x8B, 0x44, 0x24, 0x08]);
    }

    #[test]
    fn sib_indexed_addressing() {
        // movq (%rdx, %rcx, 1), %rax
        assert_eq!(bytes("movq (%rdx, %rcx, 1), %rax"), vec![0x48, 0x8B, 0x04, 0x0A]);
        // extended index sets REX.X.
        assert_eq!(bytes("movq (%rdx, %r9, 1), %rax"), vec![0x4A, 0x8B, 0x04, 0x0A]);
    }

    #[test]
    fn rip_relative_records_pc32() {
        let obj = assemble("movq .FC1(%rip), %rax").unwrap();
        assert_eq!(&obj.code[..3], &[0x48, 0x8B, 0x05]);
        assert_eq!(obj.code.len(), 7);
        assert_eq!(obj.relocs.len(), 1);
        let r = &obj.relocs[0];
        assert_eq!(r.offset, 3);
        assert_eq!(r.addend, -4);
        assert_eq!(r.kind, RelocKind::Pc32);
        assert_eq!(r.symbol.as_str(), ".FC1");
    }

    #[test]
    fn rip_with_trailing_immediate_extends_addend() {
        // RIP displacements count from the end of the instruction, so
        // trailing immediates widen the (negative) addend.
        let obj = assemble("movl $5, counter(%rip)").unwrap();
        assert_eq!(obj.relocs[0].addend, -8);
        let obj = assemble("cmpq $0, flag(%rip)").unwrap();
        assert_eq!(obj.relocs[0].addend, -5);
    }

    #[test]
    fn alu_forms() {
        assert_eq!(bytes("addq %rbx, %rax"), vec![0x48, 0x01, 0xD8]);
        assert_eq!(bytes("addq $8, %rsp"), vec![0x48, 0x83, 0xC4, 0x08]);
        assert_eq!(bytes("subq $300, %rsp"), vec![0x48, 0x81, 0xEC, 0x2C, 0x01, 0x00, 0x00]);
        assert_eq!(bytes("cmpq $0, -8(%rbp)"), vec![0x48, 0x83, 0x7D, 0xF8, 0x00]);
        assert_eq!(bytes("xorq %rbp, %rbp"), vec![0x48, 0x31, 0xED]);
    }

    #[test]
    fn mul_div_shift() {
        assert_eq!(bytes("imulq %rbx, %rax"), vec![0x48, 0x0F, 0xAF, 0xC3]);
        assert_eq!(bytes("imulq $10, %rax, %rax"), vec![0x48, 0x69, 0xC0, 0x0A, 0, 0, 0]);
        assert_eq!(bytes("idivq %r11"), vec![0x49, 0xF7, 0xFB]);
        assert_eq!(bytes("cqto"), vec![0x48, 0x99]);
        assert_eq!(bytes("shlq $3, %rax"), vec![0x48, 0xC1, 0xE0, 0x03]);
        assert_eq!(bytes("sarq %cl, %rax"), vec![0x48, 0xD3, 0xF8]);
        assert_eq!(bytes("negq %rax"), vec![0x48, 0xF7, 0xD8]);
    }

    #[test]
    fn movzbq_and_setcc() {
        assert_eq!(bytes("movzbq %al, %rax"), vec![0x48, 0x0F, 0xB6, 0xC0]);
        assert_eq!(bytes("sete %al"), vec![0x0F, 0x94, 0xC0]);
        // dil needs a REX prefix.
        assert_eq!(bytes("sete %dil"), vec![0x40, 0x0F, 0x94, 0xC7]);
        assert_eq!(bytes("setl %r10b"), vec![0x41, 0x0F, 0x9C, 0xC2]);
    }

    #[test]
    fn push_pop_misc() {
        assert_eq!(bytes("pushq %rbp"), vec![0x55]);
        assert_eq!(bytes("pushq %r12"), vec![0x41, 0x54]);
        assert_eq!(bytes("popq %rbp"), vec![0x5D]);
        assert_eq!(bytes("pushq $0"), vec![0x68, 0, 0, 0, 0]);
        assert_eq!(bytes("syscall"), vec![0x0F, 0x05]);
        assert_eq!(bytes("ret"), vec![0xC3]);
        assert_eq!(bytes("nop"), vec![0x90]);
    }

    #[test]
    fn local_branches_resolve() {
        let obj = assemble("start:\n    jmp start\n").unwrap();
        // jmp rel32 back to offset 0: disp = 0 - 5 = -5.
        assert_eq!(obj.code, vec![0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
        assert!(obj.relocs.is_empty());

        let obj = assemble("    je done\n    nop\ndone:\n    ret\n").unwrap();
        // je rel32 forward over the nop.
        assert_eq!(obj.code, vec![0x0F, 0x84, 0x01, 0x00, 0x00, 0x00, 0x90, 0xC3]);
    }

    #[test]
    fn unknown_calls_become_relocations() {
        let obj = assemble("    call memcpy\n").unwrap();
        assert_eq!(obj.code, vec![0xE8, 0, 0, 0, 0]);
        assert_eq!(obj.relocs.len(), 1);
        assert_eq!(obj.relocs[0].symbol.as_str(), "memcpy");
        assert_eq!(obj.relocs[0].offset, 1);
    }

    #[test]
    fn pass1_offsets_match_pass2() {
        // A listing touching every mnemonic family; the label at the
        // end must land exactly at the final byte count.
        let src = "\
entry:
    movq $1, %rax
    movq %rax, -8(%rbp)
    movb %al, (%r11)
    movw %ax, -2(%rbp)
    movl %eax, %ebx
    movzbq -1(%rbp), %rcx
    leaq -16(%rbp), %rdx
    addq $4, %rax
    subq %rbx, %rax
    andq $15, %rax
    orq %rbx, %rax
    xorq %rax, %rax
    cmpq $100, %rax
    testq %rax, %rax
    imulq $3, %rbx, %rbx
    idivq %r11
    cqto
    shlq $2, %rax
    shrq %cl, %rax
    sarq $1, %rax
    negq %rax
    pushq %rbp
    popq %rbp
    call entry
    jmp entry
    je entry
    jne entry
    jl entry
    jle entry
    jg entry
    jge entry
    sete %al
    setne %bl
    setl %cl
    setle %dl
    setg %r8b
    setge %r9b
    movq .FC1(%rip), %rax
    syscall
    nop
    ret
end:
";
        let obj = assemble(src).unwrap();
        assert_eq!(obj.symbols[&id("entry")], 0);
        assert_eq!(obj.symbols[&id("end")], obj.code.len() as u64);
    }

    #[test]
    fn unknown_mnemonic_is_fatal() {
        let e = assemble("    fldpi\n").unwrap_err();
        assert!(format!("{e}").contains("fldpi"));
    }

    #[test]
    fn shrq_uses_group_5() {
        assert_eq!(bytes("shrq $1, %rax"), vec![0x48, 0xC1, 0xE8, 0x01]);
    }
}
