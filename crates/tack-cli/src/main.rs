//! The `tack` command-line front end.
//!
//! Sets up a VM with the standard library and the working directory on
//! the module search path, then loads each file argument as a module.

use std::process::ExitCode;

use clap::Parser;
use tack::{Vm, install_stdlib};

#[derive(Parser)]
#[command(name = "tack", version, about = "Run Tack scripts")]
struct Args {
    /// Dump the parsed AST of each module to stderr.
    #[arg(short = 'A', long = "ast")]
    log_ast: bool,

    /// Dump compiled bytecode of each module to stderr.
    #[arg(short = 'D', long = "bytecode")]
    log_bytecode: bool,

    /// Extra directories to search for modules.
    #[arg(short = 'I', long = "module-dir")]
    module_dirs: Vec<String>,

    /// Script files to run, in order. A `.tack` extension is optional.
    #[arg(required = true)]
    files: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut vm = Vm::new();
    vm.set_log_ast(args.log_ast);
    vm.set_log_bytecode(args.log_bytecode);
    vm.add_module_dir("");
    for dir in &args.module_dirs {
        vm.add_module_dir(dir);
    }
    install_stdlib(&mut vm);

    for file in &args.files {
        let module = file.strip_suffix(".tack").unwrap_or(file);
        if let Err(err) = vm.load_module(module) {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
        if vm.last_error().is_some() {
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}
