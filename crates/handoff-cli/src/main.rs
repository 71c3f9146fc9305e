//! Handoff CLI - move a file between two local processes through shared memory
//!
//! One process sends, the other receives; both find each other through a
//! shared System V segment keyed by a common key file.
//!
//! ## Quick Start
//!
//! ```bash
//! # Terminal 1: wait for a file
//! handoff recv -o copy.bin
//!
//! # Terminal 2: send it
//! handoff send original.bin
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]

use std::process::ExitCode;

use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose());

    let json = cli.json();
    let config_path = cli.config.clone();
    let config_path = config_path.as_deref();

    let result = match cli.command {
        Command::Send(args) => commands::send::run(args, config_path),
        Command::Recv(args) => commands::receive::run(args, config_path),
        Command::Config(args) => commands::config::run(args, config_path),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report_error(&err, json),
    }
}

fn report_error(err: &anyhow::Error, json: bool) -> ExitCode {
    let core = err.downcast_ref::<handoff_core::Error>();

    if core.is_some_and(handoff_core::Error::is_cancellation) {
        tracing::info!("Transfer cancelled, resources released");
        if json {
            println!("{}", serde_json::json!({ "status": "cancelled" }));
        } else {
            eprintln!("  Transfer cancelled");
        }
        return ExitCode::SUCCESS;
    }

    if json {
        let output = serde_json::json!({
            "status": "failed",
            "error": format!("{err:#}"),
            "code": core.and_then(handoff_core::Error::code),
        });
        println!("{}", output);
    } else {
        eprintln!("Error: {err:#}");
        if let Some(hint) = core.and_then(handoff_core::Error::suggestion) {
            eprintln!("  Hint: {hint}");
        }
    }

    ExitCode::from(core.map_or(1, handoff_core::Error::exit_code))
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "warn,handoff=debug,handoff_core=debug"
    } else {
        "warn,handoff=info,handoff_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}
