//! the main compiler binary. takes a C source file and produces an
//! x86-64 Linux executable (default), or assembly text with -S.
//!
//! run with `--help` for more info.

use std::error::Error;
use std::path::PathBuf;
use std::process::{Command, ExitCode};

use clap::{Parser, ValueEnum};
use log::info;

use quickc::middle::regalloc::Strategy;
use quickc::{compile_source, emit_assembly, Options};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input file
    file: PathBuf,
    /// the output path (default: a.out, or <file>.s with -S)
    #[arg(short, long)]
    out: Option<PathBuf>,
    /// emit assembly text instead of an executable
    #[arg(short = 'S', default_value_t = false)]
    assembly: bool,
    /// verbose phase timing
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
    /// libraries to link (external backend only)
    #[arg(short = 'l')]
    libs: Vec<String>,
    /// include search directories
    #[arg(short = 'I')]
    include: Vec<PathBuf>,
    /// register allocation strategy
    #[arg(value_enum, long, default_value_t = Alloc::Color)]
    alloc: Alloc,
    /// native in-process assembler+linker, or the system toolchain
    #[arg(value_enum, long, default_value_t = Backend::Native)]
    backend: Backend,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Alloc {
    /// graph coloring
    Color,
    /// linear scan
    Linear,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Backend {
    /// built-in assembler and ELF linker
    Native,
    /// write assembly and invoke the system toolchain
    System,
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let source = std::fs::read_to_string(&args.file)?;
    let mut opts = Options {
        strategy: match args.alloc {
            Alloc::Color => Strategy::Coloring,
            Alloc::Linear => Strategy::LinearScan,
        },
        ..Options::default()
    };
    if let Some(parent) = args.file.parent() {
        opts.include_dirs.push(parent.to_path_buf());
    }
    opts.include_dirs.extend(args.include.iter().cloned());

    if args.assembly {
        let out = args
            .out
            .clone()
            .unwrap_or_else(|| args.file.with_extension("s"));
        let text = emit_assembly(&source, &opts)?;
        std::fs::write(&out, text)?;
        info!("wrote {}", out.display());
        return Ok(());
    }

    let out = args.out.clone().unwrap_or_else(|| PathBuf::from("a.out"));
    match args.backend {
        Backend::Native => {
            let elf = compile_source(&source, &opts)?;
            std::fs::write(&out, elf)?;
            make_executable(&out)?;
            info!("wrote {}", out.display());
        }
        Backend::System => {
            let asm_path = out.with_extension("s");
            let text = emit_assembly(&source, &opts)?;
            std::fs::write(&asm_path, text)?;
            let mut cmd = Command::new("cc");
            cmd.arg("-nostdlib").arg("-static").arg(&asm_path).arg("-o").arg(&out);
            for lib in &args.libs {
                cmd.arg(format!("-l{lib}"));
            }
            let status = cmd.status()?;
            if !status.success() {
                return Err(format!("system toolchain failed: {status}").into());
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}
