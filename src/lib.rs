//! This is the compiler as a library.  See `src/bin` directory for the
//! executable program using this library.
//!
//! The pipeline is strictly linear: preprocess, parse, select
//! instructions, allocate registers, emit assembly, assemble, link.
//! Each stage owns its output and hands it to the next; the helpers
//! here just wire the stages together.

pub mod common;
pub mod front;
pub mod middle;
pub mod back;

use std::path::{Path, PathBuf};
use std::time::Instant;

use derive_more::{Display, From};
use log::debug;

use common::Map;
use middle::regalloc::Strategy;

/// Any error a compilation can end with.  One variant per stage; the
/// first error aborts the pipeline.
#[derive(Debug, Display, From)]
pub enum CompileError {
    #[display("{_0}")]
    Cpp(front::cpp::CppError),
    #[display("{_0}")]
    Parse(front::parse::ParseError),
    #[display("{_0}")]
    Select(middle::select::SelectError),
    #[display("{_0}")]
    RegAlloc(middle::regalloc::RegAllocError),
    #[display("{_0}")]
    Encode(back::asm::EncodeError),
    #[display("{_0}")]
    Link(back::elf::LinkError),
    #[display("io error: {_0}")]
    Io(std::io::Error),
}

impl std::error::Error for CompileError {}

/// Knobs the driver can turn.  Everything else is fixed by the ABI.
pub struct Options {
    /// Register allocation strategy.
    pub strategy: Strategy,
    /// Ordered include search path for `#include` resolution.
    pub include_dirs: Vec<PathBuf>,
    /// Pre-resolved addresses for symbols not defined by this module.
    pub externs: Map<String, u64>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            strategy: Strategy::Coloring,
            include_dirs: vec![],
            externs: Map::new(),
        }
    }
}

/// Compile a C source file into ELF64 executable bytes.
pub fn compile_file(path: &Path, opts: &Options) -> Result<Vec<u8>, CompileError> {
    let mut cpp = front::cpp::Preprocessor::new(opts.include_dirs.clone());
    let expanded = cpp.preprocess_file(path)?;
    let (types, funcs) = cpp.into_tables();
    compile_expanded(&expanded, types, funcs, opts)
}

/// Compile C source text into ELF64 executable bytes.  Includes are
/// resolved relative to the current directory.
pub fn compile_source(source: &str, opts: &Options) -> Result<Vec<u8>, CompileError> {
    let mut cpp = front::cpp::Preprocessor::new(opts.include_dirs.clone());
    let expanded = cpp.preprocess(source, Path::new("."))?;
    let (types, funcs) = cpp.into_tables();
    compile_expanded(&expanded, types, funcs, opts)
}

/// Compile C source text into an AT&T assembly listing (the `-S` path).
pub fn emit_assembly(source: &str, opts: &Options) -> Result<String, CompileError> {
    let mut cpp = front::cpp::Preprocessor::new(opts.include_dirs.clone());
    let expanded = cpp.preprocess(source, Path::new("."))?;
    let (types, funcs) = cpp.into_tables();
    let parsed = front::parse::parse_with(&expanded, types, funcs)?;
    let mut module = middle::select::lower(&parsed.program, parsed.types, parsed.funcs)?;
    middle::regalloc::allocate(&mut module, opts.strategy)?;
    Ok(back::emit::emit(&module).listing)
}

fn compile_expanded(
    expanded: &str,
    types: front::ast::TypeTable,
    funcs: Map<String, front::ast::FuncSig>,
    opts: &Options,
) -> Result<Vec<u8>, CompileError> {
    let t = Instant::now();
    let parsed = front::parse::parse_with(expanded, types, funcs)?;
    debug!("parse: {:?}", t.elapsed());

    let t = Instant::now();
    let mut module = middle::select::lower(&parsed.program, parsed.types, parsed.funcs)?;
    debug!("select: {:?} ({} instructions)", t.elapsed(), module.code.len());

    let t = Instant::now();
    middle::regalloc::allocate(&mut module, opts.strategy)?;
    debug!("regalloc: {:?}", t.elapsed());

    let t = Instant::now();
    let asm = back::emit::emit(&module);
    debug!("emit: {:?}", t.elapsed());

    let t = Instant::now();
    let obj = back::asm::assemble(&asm.text_section)?;
    debug!("assemble: {:?} ({} bytes)", t.elapsed(), obj.code.len());

    let t = Instant::now();
    let elf = back::elf::link(&obj, &asm, &opts.externs)?;
    debug!("link: {:?} ({} bytes)", t.elapsed(), elf.len());
    Ok(elf)
}
