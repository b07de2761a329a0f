//! Command line driver: compiles a text IR file to NASM assembly.

use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use bumpalo::Bump;
use clap::Parser;
use mlc::analysis;
use mlc::ir::{Module, Printer};
use mlc::{CodegenOptions, CompilationSession};

#[derive(Parser, Debug)]
#[command(name = "mlc", version, about = "Lower mlc IR to x86-64 assembly")]
struct Args {
    /// Input IR file; reads stdin when omitted.
    input: Option<PathBuf>,

    /// Write assembly here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the parsed IR and stop.
    #[arg(long)]
    print_ir: bool,

    /// Print the IR annotated with release points and stop.
    #[arg(long)]
    print_destroys: bool,

    /// Print every value's destroy class and stop.
    #[arg(long)]
    print_classes: bool,

    /// Emit `call apply_fn; ret` instead of a tail jump.
    #[arg(long)]
    no_tail_calls: bool,

    /// Do not evaluate constant arithmetic and comparisons.
    #[arg(long)]
    no_fold: bool,

    /// Check allocator invariants after every step (default in debug builds).
    #[arg(long)]
    verify: bool,

    /// Print compilation statistics to stderr.
    #[arg(long)]
    stats: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let text = match &args.input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let mut module = match Module::parse(&text) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if args.print_ir || args.print_destroys || args.print_classes {
        if args.print_ir {
            print!("{module}");
        }
        for func in &mut module.functions {
            if !(args.print_destroys || args.print_classes) {
                break;
            }
            analysis::analyze(func)?;
            let mut printer = Printer::new(func);
            if args.print_destroys {
                printer = printer.with_destroys();
            }
            if args.print_classes {
                printer = printer.with_classes();
            }
            print!("{printer}");
        }
        return Ok(());
    }

    let defaults = CodegenOptions::default();
    let options = CodegenOptions {
        tail_calls: !args.no_tail_calls,
        check_consistency: args.verify || defaults.check_consistency,
        fold_constants: !args.no_fold,
    };
    let arena = Bump::new();
    let session = CompilationSession::with_options(&arena, options);

    let assembly = match module.compile(&session) {
        Ok(assembly) => assembly,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    match &args.output {
        Some(path) => fs::write(path, assembly)?,
        None => print!("{assembly}"),
    }

    if args.stats {
        eprint!("{}", session.stats());
    }
    Ok(())
}
