//! Symbol resolution, relocation, and the ELF64 writer.
//!
//! The executable layout is fixed: load base 0x400000, page-aligned
//! PT_LOAD segments for .text (R+X), .rodata (R, omitted when empty),
//! and .data+.bss (R+W); section data in file order .text .rodata
//! .data .symtab .strtab .shstrtab with the section headers at the
//! end.
//!
//! Two steps fan out across worker threads: relocation patches are
//! computed over disjoint chunks of the relocation list, and symbol
//! table entries are synthesized per chunk and drained through a
//! bounded channel by a single consumer so indices stay sequential.
//! Both are deterministic: chunk boundaries depend only on lengths.

use std::sync::mpsc::sync_channel;

use bitflags::bitflags;
use derive_more::Display;
use log::debug;

use super::asm::{ObjectCode, Reloc, RelocKind};
use super::emit::Asm;
use crate::common::{id, Id, Map};

const BASE: u64 = 0x400000;
const PAGE: u64 = 0x1000;
const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const SHDR_SIZE: u64 = 64;
const SYM_SIZE: usize = 24;
/// Fan-out width for relocation application and symbol staging.
const WORKERS: usize = 4;
/// Bound on the symbol-staging collector.
const STAGE_CAPACITY: usize = 64;

bitflags! {
    /// Program-header permission flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct SegFlags: u32 {
        const X = 1;
        const W = 2;
        const R = 4;
    }
}

#[derive(Display)]
pub enum LinkError {
    #[display("link error: unresolved symbol '{_0}'")]
    Unresolved(String),
    #[display("link error: relocation out of range for '{_0}'")]
    OutOfRange(String),
}

impl std::fmt::Debug for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SectionTag {
    Text,
    Rodata,
    Data,
    Bss,
    Absolute,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Binding {
    Local,
    Global,
    External,
}

#[derive(Clone, Debug)]
struct Symbol {
    name: Id,
    value: u64,
    size: u64,
    section: SectionTag,
    binding: Binding,
}

/// Link assembler output and emitter data sections into an ELF64
/// executable image.
pub fn link(
    obj: &ObjectCode,
    asm: &Asm,
    externs: &Map<String, u64>,
) -> Result<Vec<u8>, LinkError> {
    let text_off = PAGE;
    let text_va = BASE + text_off;
    let rodata_off = align_up(text_off + obj.code.len() as u64, PAGE);
    let rodata_va = BASE + rodata_off;
    let data_off = align_up(rodata_off + asm.rodata.len() as u64, PAGE);
    let data_va = BASE + data_off;
    let bss_va = data_va + asm.data.len() as u64;

    // ------------------------------------------------------------------
    // Symbol table
    let mut symbols: Vec<Symbol> = vec![];
    for (name, off) in &obj.symbols {
        let binding = if name.as_str().starts_with(".L") { Binding::Local } else { Binding::Global };
        symbols.push(Symbol {
            name: *name,
            value: text_va + off,
            size: 0,
            section: SectionTag::Text,
            binding,
        });
    }
    for (name, off) in &asm.rodata_syms {
        symbols.push(Symbol {
            name: *name,
            value: rodata_va + off,
            size: 0,
            section: SectionTag::Rodata,
            binding: Binding::Local,
        });
    }
    for (name, off) in &asm.data_syms {
        symbols.push(Symbol {
            name: *name,
            value: data_va + off,
            size: 0,
            section: SectionTag::Data,
            binding: Binding::Global,
        });
    }
    for (name, off, size) in &asm.bss_syms {
        symbols.push(Symbol {
            name: *name,
            value: bss_va + off,
            size: *size,
            section: SectionTag::Bss,
            binding: Binding::Global,
        });
    }
    for (name, addr) in externs {
        symbols.push(Symbol {
            name: id(name),
            value: *addr,
            size: 0,
            section: SectionTag::Absolute,
            binding: Binding::External,
        });
    }
    // Extern declarations without a supplied address only matter if a
    // relocation actually needs them.
    let by_name: Map<Id, Symbol> = symbols.iter().map(|s| (s.name, s.clone())).collect();

    let entry = by_name
        .get(&id("_start"))
        .ok_or_else(|| LinkError::Unresolved("_start".into()))?
        .value;

    // ------------------------------------------------------------------
    // Relocations
    let mut text = obj.code.clone();
    for (offset, value) in compute_patches(&obj.relocs, &by_name, text_va)? {
        text[offset as usize..offset as usize + 4].copy_from_slice(&value.to_le_bytes());
    }
    let mut data = asm.data.clone();
    for (offset, target) in &asm.data_relocs {
        let sym = by_name
            .get(target)
            .ok_or_else(|| LinkError::Unresolved(target.to_string()))?;
        data[*offset as usize..*offset as usize + 8].copy_from_slice(&sym.value.to_le_bytes());
    }

    // ------------------------------------------------------------------
    // Layout tail: symtab / strtab / shstrtab / shdrs
    // Locals first; sh_info wants the index of the first global.
    let mut ordered = symbols;
    ordered.sort_by_key(|s| (s.binding != Binding::Local, s.name));
    let first_global = ordered
        .iter()
        .position(|s| s.binding != Binding::Local)
        .unwrap_or(ordered.len())
        + 1; // the null symbol

    let mut strtab = vec![0u8];
    let mut name_offsets: Map<Id, u32> = Map::new();
    for s in &ordered {
        name_offsets.insert(s.name, strtab.len() as u32);
        strtab.extend_from_slice(s.name.as_bytes());
        strtab.push(0);
    }
    let symtab = stage_symbols(&ordered, &name_offsets);

    let shstrtab: Vec<u8> =
        b"\0.text\0.rodata\0.data\0.bss\0.symtab\0.strtab\0.shstrtab\0".to_vec();
    let sh_name = |section: &str| -> u32 {
        let needle: Vec<u8> = [section.as_bytes(), &[0]].concat();
        shstrtab
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap_or(0) as u32
    };

    let symtab_off = data_off + data.len() as u64;
    let strtab_off = symtab_off + symtab.len() as u64;
    let shstrtab_off = strtab_off + strtab.len() as u64;
    let shoff = align_up(shstrtab_off + shstrtab.len() as u64, 8);

    let has_rodata = !asm.rodata.is_empty();
    let has_data = !data.is_empty() || asm.bss_size > 0;
    let phnum = 1 + has_rodata as u64 + has_data as u64;

    // ------------------------------------------------------------------
    // File image
    let mut out = Vec::with_capacity(shoff as usize + 8 * SHDR_SIZE as usize);
    // e_ident
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    w16(&mut out, 2); // ET_EXEC
    w16(&mut out, 0x3E); // EM_X86_64
    w32(&mut out, 1); // EV_CURRENT
    w64(&mut out, entry);
    w64(&mut out, EHDR_SIZE); // e_phoff
    w64(&mut out, shoff);
    w32(&mut out, 0); // e_flags
    w16(&mut out, EHDR_SIZE as u16);
    w16(&mut out, PHDR_SIZE as u16);
    w16(&mut out, phnum as u16);
    w16(&mut out, SHDR_SIZE as u16);
    w16(&mut out, 8); // e_shnum
    w16(&mut out, 7); // e_shstrndx

    // Program headers.  The first PT_LOAD covers the headers plus
    // .text so the entry page maps at its link address.
    phdr(
        &mut out,
        SegFlags::R | SegFlags::X,
        0,
        BASE,
        text_off + text.len() as u64,
        text_off + text.len() as u64,
    );
    if has_rodata {
        phdr(
            &mut out,
            SegFlags::R,
            rodata_off,
            rodata_va,
            asm.rodata.len() as u64,
            asm.rodata.len() as u64,
        );
    }
    if has_data {
        phdr(
            &mut out,
            SegFlags::R | SegFlags::W,
            data_off,
            data_va,
            data.len() as u64,
            data.len() as u64 + asm.bss_size,
        );
    }

    pad_to(&mut out, text_off);
    out.extend_from_slice(&text);
    pad_to(&mut out, rodata_off);
    out.extend_from_slice(&asm.rodata);
    pad_to(&mut out, data_off);
    out.extend_from_slice(&data);
    out.extend_from_slice(&symtab);
    out.extend_from_slice(&strtab);
    out.extend_from_slice(&shstrtab);
    pad_to(&mut out, shoff);

    // Section headers.
    shdr(&mut out, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0); // null
    shdr(&mut out, sh_name(".text"), 1, 6, text_va, text_off, text.len() as u64, 0, 0, 16, 0);
    shdr(
        &mut out,
        sh_name(".rodata"),
        1,
        2,
        rodata_va,
        rodata_off,
        asm.rodata.len() as u64,
        0,
        0,
        8,
        0,
    );
    shdr(&mut out, sh_name(".data"), 1, 3, data_va, data_off, data.len() as u64, 0, 0, 8, 0);
    shdr(
        &mut out,
        sh_name(".bss"),
        8, // SHT_NOBITS
        3,
        bss_va,
        data_off + data.len() as u64,
        asm.bss_size,
        0,
        0,
        8,
        0,
    );
    shdr(
        &mut out,
        sh_name(".symtab"),
        2, // SHT_SYMTAB
        0,
        0,
        symtab_off,
        symtab.len() as u64,
        6, // link: .strtab index
        first_global as u32,
        8,
        SYM_SIZE as u64,
    );
    shdr(&mut out, sh_name(".strtab"), 3, 0, 0, strtab_off, strtab.len() as u64, 0, 0, 1, 0);
    shdr(
        &mut out,
        sh_name(".shstrtab"),
        3,
        0,
        0,
        shstrtab_off,
        shstrtab.len() as u64,
        0,
        0,
        1,
        0,
    );

    debug!("linked {} bytes, entry {entry:#x}", out.len());
    Ok(out)
}

/// Compute relocation patches over chunks of the relocation list in
/// parallel.  Writes are to disjoint offsets so the partition is only
/// about spreading the work.
fn compute_patches(
    relocs: &[Reloc],
    by_name: &Map<Id, Symbol>,
    text_va: u64,
) -> Result<Vec<(u64, u32)>, LinkError> {
    if relocs.is_empty() {
        return Ok(vec![]);
    }
    let chunk = relocs.len().div_ceil(WORKERS).max(1);
    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = relocs
            .chunks(chunk)
            .map(|part| {
                scope.spawn(move || {
                    part.iter()
                        .map(|r| patch(r, by_name, text_va))
                        .collect::<Result<Vec<_>, LinkError>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("relocation worker panicked"))
            .collect::<Vec<_>>()
    });
    let mut out = vec![];
    for part in results {
        out.extend(part?);
    }
    Ok(out)
}

fn patch(r: &Reloc, by_name: &Map<Id, Symbol>, text_va: u64) -> Result<(u64, u32), LinkError> {
    let sym = by_name
        .get(&r.symbol)
        .ok_or_else(|| LinkError::Unresolved(r.symbol.to_string()))?;
    match r.kind {
        RelocKind::Pc32 => {
            // S + A - P with P the address of the patched field; the
            // recorded addend of -4 accounts for the field preceding
            // the next instruction.
            let place = (text_va + r.offset) as i64;
            let disp = sym.value as i64 + r.addend - place;
            let disp = i32::try_from(disp)
                .map_err(|_| LinkError::OutOfRange(r.symbol.to_string()))?;
            Ok((r.offset, disp as u32))
        }
        RelocKind::Abs64 => {
            // 64-bit absolute patches are split into two 32-bit writes
            // by the caller; not produced for text today.
            let value = (sym.value as i64 + r.addend) as u64;
            Ok((r.offset, value as u32))
        }
    }
}

/// Synthesize symbol-table entries in parallel chunks; a single
/// consumer drains the bounded channel and writes entries in chunk
/// order so indices match the sorted symbol list.
fn stage_symbols(ordered: &[Symbol], name_offsets: &Map<Id, u32>) -> Vec<u8> {
    let mut out = vec![0u8; SYM_SIZE]; // null symbol
    if ordered.is_empty() {
        return out;
    }
    let chunk = ordered.len().div_ceil(WORKERS).max(1);
    let mut parts: Map<usize, Vec<u8>> = Map::new();
    std::thread::scope(|scope| {
        let (tx, rx) = sync_channel(STAGE_CAPACITY);
        for (i, part) in ordered.chunks(chunk).enumerate() {
            let tx = tx.clone();
            scope.spawn(move || {
                let mut bytes = Vec::with_capacity(part.len() * SYM_SIZE);
                for s in part {
                    encode_symbol(&mut bytes, s, name_offsets[&s.name]);
                }
                let _ = tx.send((i, bytes));
            });
        }
        drop(tx);
        for (i, bytes) in rx {
            parts.insert(i, bytes);
        }
    });
    for (_, bytes) in parts {
        out.extend_from_slice(&bytes);
    }
    out
}

fn encode_symbol(out: &mut Vec<u8>, s: &Symbol, name_off: u32) {
    let bind: u8 = match s.binding {
        Binding::Local => 0,
        Binding::Global | Binding::External => 1,
    };
    let kind: u8 = match s.section {
        SectionTag::Text => 2,     // STT_FUNC
        SectionTag::Absolute => 0, // STT_NOTYPE
        _ => 1,                    // STT_OBJECT
    };
    let shndx: u16 = match s.section {
        SectionTag::Text => 1,
        SectionTag::Rodata => 2,
        SectionTag::Data => 3,
        SectionTag::Bss => 4,
        SectionTag::Absolute => 0xFFF1, // SHN_ABS
    };
    w32(out, name_off);
    out.push((bind << 4) | kind);
    out.push(0);
    w16(out, shndx);
    w64(out, s.value);
    w64(out, s.size);
}

fn phdr(out: &mut Vec<u8>, flags: SegFlags, offset: u64, vaddr: u64, filesz: u64, memsz: u64) {
    w32(out, 1); // PT_LOAD
    w32(out, flags.bits());
    w64(out, offset);
    w64(out, vaddr);
    w64(out, vaddr); // paddr
    w64(out, filesz);
    w64(out, memsz);
    w64(out, PAGE);
}

#[allow(clippy::too_many_arguments)]
fn shdr(
    out: &mut Vec<u8>,
    name: u32,
    kind: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    addralign: u64,
    entsize: u64,
) {
    w32(out, name);
    w32(out, kind);
    w64(out, flags);
    w64(out, addr);
    w64(out, offset);
    w64(out, size);
    w32(out, link);
    w32(out, info);
    w64(out, addralign);
    w64(out, entsize);
}

fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

fn pad_to(out: &mut Vec<u8>, offset: u64) {
    while (out.len() as u64) < offset {
        out.push(0);
    }
}

fn w16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn w32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn w64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::{asm, emit};

    fn tiny_executable() -> Vec<u8> {
        let text = "\
_start:
    xorq %rbp, %rbp
    call main
    movq %rax, %rdi
    movq $60, %rax
    syscall
main:
    movq $7, %rax
    ret
";
        let obj = asm::assemble(text).unwrap();
        let blank = emit::Asm::default();
        link(&obj, &blank, &Map::new()).unwrap()
    }

    #[test]
    fn elf_header_fields() {
        let elf = tiny_executable();
        assert_eq!(&elf[0..4], &[0x7F, b'E', b'L', b'F']);
        assert_eq!(elf[4], 2); // 64-bit
        assert_eq!(elf[5], 1); // little-endian
        assert_eq!(elf[6], 1); // version
        assert_eq!(u16::from_le_bytes([elf[16], elf[17]]), 2); // ET_EXEC
        assert_eq!(u16::from_le_bytes([elf[18], elf[19]]), 0x3E); // x86-64
        assert_eq!(u16::from_le_bytes([elf[54], elf[55]]), 56); // phentsize
        assert_eq!(u16::from_le_bytes([elf[58], elf[59]]), 64); // shentsize
        // Entry points at _start = start of .text.
        let entry = u64::from_le_bytes(elf[24..32].try_into().unwrap());
        assert_eq!(entry, 0x401000);
    }

    #[test]
    fn text_bytes_land_at_page_offset() {
        let elf = tiny_executable();
        // xorq %rbp, %rbp
        assert_eq!(&elf[0x1000..0x1003], &[0x48, 0x31, 0xED]);
    }

    #[test]
    fn call_is_relocated_within_text() {
        let elf = tiny_executable();
        // call main: starts at 0x1003, rel32 at 0x1004, next at 0x1008.
        let disp = i32::from_le_bytes(elf[0x1004..0x1008].try_into().unwrap());
        let call_next = 0x401008i64;
        let main_va = call_next + disp as i64;
        // main sits right after the 5 startup instructions.
        let startup_len = 3 + 5 + 3 + 7 + 2;
        assert_eq!(main_va, 0x401000 + startup_len);
    }

    #[test]
    fn unresolved_symbol_is_fatal() {
        let obj = asm::assemble("_start:\n    call missing\n").unwrap();
        let blank = emit::Asm::default();
        let e = link(&obj, &blank, &Map::new()).unwrap_err();
        assert!(matches!(e, LinkError::Unresolved(_)));
        assert!(format!("{e}").contains("missing"));
    }

    #[test]
    fn extern_addresses_resolve_calls() {
        let obj = asm::assemble("_start:\n    call helper\n    ret\n").unwrap();
        let blank = emit::Asm::default();
        let mut externs = Map::new();
        externs.insert("helper".to_string(), 0x500000u64);
        let elf = link(&obj, &blank, &externs).unwrap();
        let disp = i32::from_le_bytes(elf[0x1001..0x1005].try_into().unwrap());
        assert_eq!(0x401005 + disp as i64, 0x500000);
    }

    #[test]
    fn rodata_and_data_segments() {
        let text = "_start:\n    movq .FC1(%rip), %rax\n    ret\n";
        let obj = asm::assemble(text).unwrap();
        let mut asm_out = emit::Asm::default();
        asm_out.rodata = 2.5f64.to_le_bytes().to_vec();
        asm_out.rodata_syms.push((crate::common::id(".FC1"), 0));
        asm_out.data = vec![7, 0, 0, 0];
        asm_out.data_syms.push((crate::common::id("g"), 0));
        asm_out.bss_size = 32;
        asm_out.bss_syms.push((crate::common::id("z"), 0, 32));
        let elf = link(&obj, &asm_out, &Map::new()).unwrap();

        // Three program headers.
        assert_eq!(u16::from_le_bytes([elf[56], elf[57]]), 3);
        // rodata lands on the page after text and holds the double.
        assert_eq!(&elf[0x2000..0x2008], &2.5f64.to_le_bytes());
        // The RIP-relative displacement reaches it.
        let disp = i32::from_le_bytes(elf[0x1003..0x1007].try_into().unwrap());
        assert_eq!(0x401007 + disp as i64, 0x402000);
        // data page holds the initializer; bss extends memsz beyond filesz.
        assert_eq!(&elf[0x3000..0x3004], &[7, 0, 0, 0]);
    }

    #[test]
    fn symtab_locals_precede_globals() {
        let elf = tiny_executable();
        // Section headers start at e_shoff; symtab is section 5.
        let shoff = u64::from_le_bytes(elf[40..48].try_into().unwrap()) as usize;
        let symtab_hdr = &elf[shoff + 5 * 64..shoff + 6 * 64];
        let info = u32::from_le_bytes(symtab_hdr[44..48].try_into().unwrap());
        let size = u64::from_le_bytes(symtab_hdr[32..40].try_into().unwrap());
        // null + _start + main.
        assert_eq!(size, 3 * 24);
        // No locals here: first global is index 1.
        assert_eq!(info, 1);
    }
}
