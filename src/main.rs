use clap::Parser;

use visor::{Emulator, ProgramImage};

/// Run an IA-32 program under supervision, reporting use of uninitialized
/// data, invalid memory accesses and leaked allocations.
#[derive(Parser)]
#[command(name = "visor", version, about)]
struct Args {
    /// Print every executed instruction and the register state after it.
    #[arg(long)]
    trace: bool,

    /// The guest program.
    program: std::path::PathBuf,

    /// Arguments passed to the guest.
    #[arg(trailing_var_arg = true)]
    arguments: Vec<String>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let image = match ProgramImage::from_file(&args.program) {
        Ok(image) => image,
        Err(error) => {
            eprintln!("visor: {}: {error}", args.program.display());
            std::process::exit(1);
        }
    };

    let mut guest_arguments = vec![args.program.display().to_string()];
    guest_arguments.extend(args.arguments.iter().cloned());
    let environment: Vec<String> = std::env::vars()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    let mut emulator = match Emulator::new(image, &guest_arguments, &environment) {
        Ok(emulator) => emulator,
        Err(error) => {
            eprintln!("visor: {error}");
            std::process::exit(1);
        }
    };
    emulator.set_trace(args.trace);

    match emulator.exec() {
        Ok(status) => std::process::exit(status),
        // The fatal diagnostic and backtrace are already on stderr.
        Err(_) => std::process::exit(1),
    }
}
