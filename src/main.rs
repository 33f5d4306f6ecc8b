mod builtins;
mod command;
mod error;
mod exec;
mod jobs;
mod parser;
mod pipeline;
mod shell;
mod signals;
mod spawn;
mod utils;

use std::env;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() {
    // Parse command-line arguments.
    let args: Vec<String> = env::args().collect();
    let mut emit_prompt = true;
    let mut verbose = false;
    for arg in &args[1..] {
        match arg.as_str() {
            "-h" => utils::print_usage(),
            "-v" => verbose = true,
            "-p" => emit_prompt = false,
            _ => {}
        }
    }

    // RUST_LOG wins over -v.
    let default_level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = signals::install_signal_handlers() {
        eprintln!("quash: unable to install signal handlers: {}", e);
    }

    shell::run_shell(emit_prompt);
}
