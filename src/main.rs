// File: src/main.rs
//
// Entry point for the Ember programming language. Parses command-line
// arguments and dispatches to `run`, `repl`, or `disassemble`.

mod builtins;
mod chunk;
mod compiler;
mod debug;
mod errors;
mod lexer;
mod module;
mod repl;
mod table;
mod value;
mod vm;

use std::fs;
use std::path::PathBuf;

use clap::{Parser as ClapParser, Subcommand};

use vm::{InterpretResult, Vm};

#[derive(ClapParser)]
#[command(
    name = "ember",
    about = "Ember: a small class-based scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Compile and run an .mbr file
    Run {
        /// Path to the .mbr file
        file: PathBuf,

        /// Arguments passed through to the script
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        script_args: Vec<String>,
    },

    /// Launch the interactive Ember REPL
    Repl,

    /// Compile an .mbr file and print its bytecode disassembly
    Disassemble {
        /// Path to the .mbr file
        file: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Run { file, script_args } => run(&file, &script_args),
        Commands::Repl => {
            repl::Repl::new().run();
            0
        }
        Commands::Disassemble { file } => disassemble(&file),
    };

    std::process::exit(exit_code);
}

fn run(file: &PathBuf, script_args: &[String]) -> i32 {
    // Ember has no native for reading script arguments, so trailing args
    // are accepted for CLI interface parity with the teacher's `run`
    // subcommand but otherwise unused.
    let _ = script_args;

    let source = match fs::read_to_string(file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file '{}': {err}", file.display());
            return 64;
        }
    };

    let mut vm = Vm::new();

    match vm.interpret(&source) {
        InterpretResult::Ok => 0,
        InterpretResult::CompileError => 65,
        InterpretResult::RuntimeError => 70,
    }
}

fn disassemble(file: &PathBuf) -> i32 {
    let source = match fs::read_to_string(file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file '{}': {err}", file.display());
            return 64;
        }
    };

    let mut vm = Vm::new_headless();
    match compiler::compile(&source, &mut vm) {
        Some(function) => {
            debug::disassemble_function(&function);
            0
        }
        None => 65,
    }
}
