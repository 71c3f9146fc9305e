//! Send command implementation.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};

use handoff_core::interrupt::{self, CancelToken};
use handoff_core::ipc::Role;
use handoff_core::session::TransferSession;

use super::SendArgs;
use crate::ui::{self, ProgressLine};

/// Run the send command.
pub fn run(args: SendArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    args.transfer.apply(&mut config)?;

    let mut file = File::open(&args.file)
        .with_context(|| format!("Cannot open '{}'", args.file.display()))?;
    let total = file.metadata().ok().map(|meta| meta.len());

    interrupt::install()?;
    let cancel = CancelToken::from_interrupts();

    if args.transfer.interactive() {
        println!();
        println!("Handoff v{}", handoff_core::VERSION);
        println!("{}", "-".repeat(37));
        println!();
        println!(
            "  Sending {} ({}) over the {} backend",
            args.file.display(),
            ui::format_size(total.unwrap_or(0)),
            config.transfer.backend
        );
        println!("  Waiting for a receiver...");
        println!();
    }

    let mut session = TransferSession::establish(&config, Role::Sender, cancel)?;

    if args.transfer.interactive() {
        println!("  Found receiver (pid {})", session.peer());
        println!();
    }

    let mut progress = ProgressLine::new(args.transfer.interactive());
    let result = session.send(&mut file, total, |p| progress.update(p));
    progress.finish();
    let report = result?;
    session.release();

    if args.transfer.json {
        let output = serde_json::json!({
            "status": "completed",
            "role": session.role(),
            "backend": config.transfer.backend.to_string(),
            "peer": session.peer().as_raw(),
            "file": args.file.display().to_string(),
            "chunks": report.chunks,
            "bytes": report.bytes,
            "elapsed_ms": u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !args.transfer.quiet {
        println!();
        println!(
            "  Sent {} in {} blocks ({})",
            ui::format_size(report.bytes),
            report.chunks,
            ui::format_elapsed(report.elapsed)
        );
        println!();
    }

    Ok(())
}
