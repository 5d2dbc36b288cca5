//! Back-end integration tests: emitter, assembler, and linker working
//! over real IR from the front half of the pipeline.

use crate::back::{asm, elf, emit};
use crate::common::Map;
use crate::front::parse;
use crate::middle::{regalloc, select};

fn build(src: &str) -> (emit::Asm, asm::ObjectCode) {
    let parsed = parse::parse(src).unwrap();
    let mut module = select::lower(&parsed.program, parsed.types, parsed.funcs).unwrap();
    regalloc::allocate(&mut module, regalloc::Strategy::Coloring).unwrap();
    let out = emit::emit(&module);
    let obj = asm::assemble(&out.text_section).unwrap();
    (out, obj)
}

fn build_elf(src: &str) -> Vec<u8> {
    let (out, obj) = build(src);
    elf::link(&obj, &out, &Map::new()).unwrap()
}

#[test]
fn factorial_links_to_an_executable_image() {
    let elf = build_elf(
        "int factorial(int n) { if (n <= 1) return 1; return n * factorial(n - 1); }\n\
         int main() { return factorial(5); }",
    );
    assert_eq!(&elf[0..4], &[0x7F, b'E', b'L', b'F']);
    let entry = u64::from_le_bytes(elf[24..32].try_into().unwrap());
    assert_eq!(entry, 0x401000, "_start leads the text section");
}

#[test]
fn every_frame_keeps_call_alignment() {
    let (out, _) = build(
        "int leaf(int a, int b) { return a + b; }\n\
         int mid(int x) { int tmp[9]; tmp[0] = x; return leaf(tmp[0], 2); }\n\
         int main() { return mid(40); }",
    );
    let mut saw_sub = false;
    for line in out.text_section.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("subq $") {
            if let Some(n) = rest.strip_suffix(", %rsp") {
                let n: i64 = n.parse().unwrap();
                assert_eq!((n + 8) % 16, 0, "prologue adjustment {n} breaks alignment");
                saw_sub = true;
            }
        }
        assert!(!line.starts_with("andq $-16"), "inline realignment is forbidden");
    }
    assert!(saw_sub);
}

#[test]
fn large_struct_call_text_ordering() {
    // Argument moves into rsi..r9 first, then the hidden pointer
    // into rdi, then the call.
    let (out, _) = build(
        "typedef struct Wide { long a; long b; long c; long d; long e; int f; } Wide;\n\
         Wide make(long a, long b, long c, long d, long e);\n\
         Wide make(long a, long b, long c, long d, long e) {\n\
             Wide w = (Wide){ .a = a, .b = b, .c = c, .d = d, .e = e, .f = 9 };\n\
             return w;\n\
         }\n\
         int main() { Wide w = make(1, 2, 3, 4, 5); return w.f; }",
    );
    let main_at = out.text_section.find("main:").unwrap();
    let body = &out.text_section[main_at..];
    let call = body.find("call make").expect("no call");
    let lea_rdi = body.find(", %rdi").expect("no hidden-pointer load");
    assert!(body[..lea_rdi].rfind("leaq").is_some());
    assert!(lea_rdi < call, "hidden pointer must load before the call");
    for reg in ["%rsi", "%rdx", "%rcx", "%r8", "%r9"] {
        let mov = body[..call]
            .find(&format!(", {reg}"))
            .unwrap_or_else(|| panic!("no argument move into {reg}"));
        assert!(mov < lea_rdi, "argument move into {reg} must precede the rdi load");
    }
}

#[test]
fn member_store_through_pointer_uses_r11_and_movl() {
    // A 4-byte member behind a cast pointer stores with movl via
    // the %r11-held pointer.
    let (out, _) = build(
        "typedef struct Card { int id; char *owner; int kind; int flag; } Card;\n\
         int main() { long data[4]; ((Card*)data[0])->flag = 1; return 0; }",
    );
    assert!(out.text_section.contains("movl $1, (%r"), "flag store must be 4 bytes wide");
    assert!(!out.text_section.contains("movq $1, (%r11)"));
}

#[test]
fn float_literal_lives_in_rodata() {
    // The bits come from .rodata via movq, never an immediate.
    let (out, _) = build("int main() { double x = 3.14; return 0; }");
    assert!(out.listing.contains(".FC1:"));
    assert!(out.listing.contains(".double 3.14"));
    assert!(out.text_section.contains("movq .FC1(%rip),"));
    assert!(!out.text_section.contains("$3.14"));
    assert_eq!(out.rodata.len() % 8, 0);
    assert_eq!(&out.rodata[out.rodata.len() - 8..], &3.14f64.to_le_bytes());
}

#[test]
fn assembler_sizes_match_symbol_offsets() {
    // Pass-1 label placement must agree with pass-2 encoding for a
    // full program's worth of generated text.
    let (out, obj) = build(
        "int helper(int x) { return x * 2 + 1; }\n\
         int main() { int sum = 0; for (int i = 0; i < 5; i++) sum += helper(i); return sum; }",
    );
    // The text for each label must start within the code buffer.
    for (name, off) in &obj.symbols {
        assert!(
            *off <= obj.code.len() as u64,
            "symbol {name} at {off} outside {} code bytes",
            obj.code.len()
        );
    }
    // Re-assembling yields identical bytes (the encoder is a pure
    // function of the text).
    let again = asm::assemble(&out.text_section).unwrap();
    assert_eq!(again.code, obj.code);
    assert_eq!(again.symbols, obj.symbols);
}

#[test]
fn string_literals_pool_and_relocate() {
    let elf = build_elf(
        "char *greeting = \"hello\";\n\
         int main() { char *s = \"world\"; return s[0]; }",
    );
    // Both strings land NUL-terminated in .rodata (page 0x2000).
    let rodata = &elf[0x2000..0x2010];
    assert!(rodata.windows(6).any(|w| w == b"hello\0"));
    assert!(rodata.windows(6).any(|w| w == b"world\0"));
    // The global pointer in .data holds the absolute address of the
    // pooled string.
    let addr = u64::from_le_bytes(elf[0x3000..0x3008].try_into().unwrap());
    assert!((0x402000..0x403000).contains(&addr));
}

#[test]
fn externs_stay_out_of_bss() {
    let (out, _) = build(
        "extern int stderr_fd;\n\
         int used;\n\
         int main() { used = 1; return used; }",
    );
    assert!(out.externs.iter().any(|e| e.as_str() == "stderr_fd"));
    assert!(out.bss_syms.iter().all(|(n, _, _)| n.as_str() != "stderr_fd"));
    assert!(out.bss_syms.iter().any(|(n, _, _)| n.as_str() == "used"));
}
