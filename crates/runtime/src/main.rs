//! Ilex CLI
//!
//! `ilex <path>` runs a script. `-v`/`version`, `-i`/`info` and
//! `-h`/`help` print metadata; `ilex test <path>` runs with the
//! test-mode flag visible to library code.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ilex_core::{exit_code, ILEX_DATE, ILEX_VERSION};
use ilex_runtime::{Vm, VmOptions};

#[derive(Parser)]
#[command(name = "ilex")]
#[command(about = "The Ilex programming language", long_about = None)]
#[command(disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Script path, or one of: version, info, help, test
    #[arg(value_name = "PATH", allow_hyphen_values = true)]
    command: Option<String>,

    /// Arguments to the command (the script path for `test`)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    rest: Vec<String>,
}

fn print_help() {
    println!("version -v ------ Print version number");
    println!("info    -i ------ Print build info");
    println!("help    -h ------ Print help text");
    println!("test <path> ----- Run a script in test mode");
    println!();
    println!("Usage: ilex [path]");
}

fn run_script(path: &str, test_mode: bool) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open file '{path}'.");
            return ExitCode::from(exit_code::IO as u8);
        }
    };

    let options = VmOptions::from_env().with_test_mode(test_mode);
    let mut vm = Vm::new(options);
    match vm.interpret(path, &source) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            // Runtime/assert/panic errors already reported themselves;
            // compile errors are only carried in the result.
            if let ilex_runtime::VmError::Compile(compile_err) = &err {
                eprintln!("{compile_err}");
            }
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("ILEX_LOG").unwrap_or_else(|_| EnvFilter::new("off")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let Some(command) = cli.command else {
        print_help();
        return ExitCode::from(exit_code::USAGE as u8);
    };

    match command.as_str() {
        "-v" | "version" => {
            println!("{ILEX_VERSION}");
            ExitCode::SUCCESS
        }
        "-i" | "info" => {
            println!("Ilex version {ILEX_VERSION} built in {ILEX_DATE}.");
            ExitCode::SUCCESS
        }
        "-h" | "help" => {
            print_help();
            ExitCode::SUCCESS
        }
        "test" => match cli.rest.first() {
            Some(path) => run_script(path, true),
            None => {
                eprintln!("Usage: ilex test <path>");
                ExitCode::from(exit_code::USAGE as u8)
            }
        },
        path => {
            if !Path::new(path).exists() {
                eprintln!("Could not open file '{path}'.");
                return ExitCode::from(exit_code::IO as u8);
            }
            run_script(path, false)
        }
    }
}
