use std::env;
use std::fs;
use std::io::{self, Write};
use std::process::ExitCode;

use loxvm::{StdPrint, Vm};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    match args.get(1) {
        Some(path) => run_file(path),
        None => run_repl(),
    }
}

fn run_file(path: &str) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: could not read {path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut out = StdPrint;
    match Vm::new(&mut out).interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}

/// Reads one line at a time, interpreting each as a complete script against
/// the same VM, so variables declared on one line stay visible on the next.
/// A line that fails to compile or run is reported to stderr without ending
/// the session.
fn run_repl() -> ExitCode {
    let mut out = StdPrint;
    let mut vm = Vm::new(&mut out);
    let stdin = io::stdin();

    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            return ExitCode::SUCCESS;
        }

        let mut line = String::new();
        let bytes_read = match stdin.read_line(&mut line) {
            Ok(n) => n,
            Err(err) => {
                eprintln!("error reading stdin: {err}");
                return ExitCode::FAILURE;
            }
        };
        if bytes_read == 0 {
            return ExitCode::SUCCESS; // EOF
        }

        if let Err(err) = vm.interpret(&line) {
            eprintln!("{err}");
        }
    }
}
