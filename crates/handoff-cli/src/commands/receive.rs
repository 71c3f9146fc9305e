//! Receive command implementation.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};

use handoff_core::interrupt::{self, CancelToken};
use handoff_core::ipc::Role;
use handoff_core::session::TransferSession;

use super::ReceiveArgs;
use crate::ui::{self, ProgressLine};

/// Run the receive command.
pub fn run(args: ReceiveArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    args.transfer.apply(&mut config)?;

    let output_path = args.output.unwrap_or_else(|| config.transfer.output.clone());

    interrupt::install()?;
    let cancel = CancelToken::from_interrupts();

    if args.transfer.interactive() {
        println!();
        println!("Handoff v{}", handoff_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!(
            "  Receiving into {} over the {} backend",
            output_path.display(),
            config.transfer.backend
        );
        println!("  Waiting for a sender...");
        println!();
    }

    let mut session = TransferSession::establish(&config, Role::Receiver, cancel)?;

    if args.transfer.interactive() {
        println!("  Found sender (pid {})", session.peer());
        println!();
    }

    // Created even for an empty transfer; a failed transfer leaves what
    // arrived so far.
    let file = File::create(&output_path)
        .with_context(|| format!("Cannot create '{}'", output_path.display()))?;
    let mut writer = BufWriter::new(file);

    let mut progress = ProgressLine::new(args.transfer.interactive());
    let result = session.receive(&mut writer, |p| progress.update(p));
    progress.finish();
    let report = result?;
    session.release();

    if args.transfer.json {
        let output = serde_json::json!({
            "status": "completed",
            "role": session.role(),
            "backend": config.transfer.backend.to_string(),
            "peer": session.peer().as_raw(),
            "file": output_path.display().to_string(),
            "chunks": report.chunks,
            "bytes": report.bytes,
            "elapsed_ms": u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !args.transfer.quiet {
        println!();
        println!(
            "  Received {} in {} blocks ({})",
            ui::format_size(report.bytes),
            report.chunks,
            ui::format_elapsed(report.elapsed)
        );
        println!("  Saved to {}", output_path.display());
        println!();
    }

    Ok(())
}
