//! sable - REPL and file runner for the Sable language.
//!
//! Usage:
//!   sable                 # interactive REPL, reads until EOF
//!   sable program.sb      # interpret a file
//!
//! Globals persist across REPL lines, so definitions build up a session.
//! `-v` turns on debug logging (GC cycles, compiled code), `-vv` adds
//! instruction-level execution tracing; both go to stderr.

use std::path::{Path, PathBuf};
use std::process;

use clap::Parser as ClapParser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use sable_core::{GcConfig, InterpretResult, Vm};

#[derive(ClapParser)]
#[command(name = "sable")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "The Sable language", long_about = None)]
struct Args {
    /// Sable source file to run (starts a REPL if not given)
    file: Option<PathBuf>,

    /// Collect garbage on every allocation (GC debugging)
    #[arg(long)]
    gc_stress: bool,

    /// Post-collection heap threshold floor, in bytes
    #[arg(long, value_name = "BYTES")]
    heap_min: Option<usize>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = GcConfig::default();
    config.stress = args.gc_stress;
    if let Some(min) = args.heap_min {
        config.min_threshold = min;
    }
    let mut vm = Vm::with_config(config);

    let code = match &args.file {
        Some(path) => run_file(&mut vm, path),
        None => repl(&mut vm),
    };
    if code != 0 {
        process::exit(code);
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::from_default_env(),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Interpret a whole file. Exit codes follow sysexits: 65 for malformed
/// input, 70 for a runtime failure.
fn run_file(vm: &mut Vm, path: &Path) -> i32 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("sable: cannot read {}: {}", path.display(), err);
            return 66;
        }
    };
    match vm.interpret(&source) {
        InterpretResult::Ok => 0,
        InterpretResult::CompileError => 65,
        InterpretResult::RuntimeError => 70,
    }
}

/// Read a line at a time until EOF, interpreting each as a program.
fn repl(vm: &mut Vm) -> i32 {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("sable: cannot start line editor: {}", err);
            return 74;
        }
    };
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                vm.interpret(&line);
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!();
                return 0;
            }
            Err(err) => {
                eprintln!("sable: {}", err);
                return 74;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_script(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn run_file_ok() {
        let script = write_script("let x = 2 + 3; assert x == 5;");
        let mut vm = Vm::new();
        assert_eq!(run_file(&mut vm, script.path()), 0);
    }

    #[test]
    fn run_file_compile_error() {
        let script = write_script("let = ;");
        let mut vm = Vm::new();
        assert_eq!(run_file(&mut vm, script.path()), 65);
    }

    #[test]
    fn run_file_runtime_error() {
        let script = write_script("assert false;");
        let mut vm = Vm::new();
        assert_eq!(run_file(&mut vm, script.path()), 70);
    }

    #[test]
    fn run_file_missing_path() {
        let mut vm = Vm::new();
        assert_eq!(run_file(&mut vm, Path::new("/no/such/file.sb")), 66);
    }
}
