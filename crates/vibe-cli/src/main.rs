//! Thin driver binary over the runtime.
//!
//! Takes the path to a pre-parsed program tree (JSON, as produced by the
//! external parser) followed by the script's own arguments, runs it, and
//! prints the final value. Fatal errors print in their formatted shape and
//! exit nonzero; `defineArg`-requested exits use their own code.

use std::process::ExitCode;

use vibe::{Driver, DriverConfig, NoopTracer, Payload, Program, StderrTracer, StdPrint};

fn usage() -> ExitCode {
    eprintln!("usage: vibe <program.json> [--verbose] [script args...]");
    ExitCode::from(2)
}

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let Some(program_path) = args.next() else {
        return usage();
    };
    let mut rest: Vec<String> = args.collect();
    let verbose = rest.iter().any(|a| a == "--verbose");
    rest.retain(|a| a != "--verbose");

    let source = match std::fs::read_to_string(&program_path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("cannot read '{program_path}': {e}");
            return ExitCode::from(2);
        }
    };
    let program: Program = match serde_json::from_str(&source) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("'{program_path}' is not a valid program tree: {e}");
            return ExitCode::from(2);
        }
    };

    let root_dir = std::path::Path::new(&program_path)
        .parent()
        .map_or_else(|| std::path::PathBuf::from("."), std::path::Path::to_path_buf);
    let driver = Driver::new().with_config(DriverConfig {
        root_dir,
        program_args: rest,
        ..DriverConfig::default()
    });

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("cannot start runtime: {e}");
            return ExitCode::from(2);
        }
    };

    let mut print = StdPrint::default();
    let result = if verbose {
        let mut tracer = StderrTracer::new();
        runtime.block_on(driver.run(&program, &mut print, &mut tracer))
    } else {
        let mut tracer = NoopTracer;
        runtime.block_on(driver.run(&program, &mut print, &mut tracer))
    };
    drop(print);

    match result {
        Ok(outcome) => {
            if !matches!(outcome.value.payload(), Payload::Null) {
                println!("{}", outcome.value.payload().display_text());
            }
            ExitCode::SUCCESS
        }
        Err(failure) => {
            eprintln!("{failure}");
            let code = failure.exit_code();
            ExitCode::from(u8::try_from(code.clamp(0, 255)).unwrap_or(1))
        }
    }
}
