//! UI utilities for Handoff CLI.

use std::io::{self, Write};
use std::time::Duration;

use handoff_core::transfer::TransferProgress;

/// Format bytes as human-readable size.
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Format a duration as "M:SS".
pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let mins = total_secs / 60;
    let secs = total_secs % 60;
    format!("{}:{:02}", mins, secs)
}

/// Render one progress line.
pub fn progress_line(progress: &TransferProgress) -> String {
    let transferred = format_size(progress.bytes_transferred);
    match progress.percentage() {
        Some(pct) => format!(
            "block {} ({} transferred, {:.0}%)",
            progress.chunks, transferred, pct
        ),
        None => format!("block {} ({} transferred)", progress.chunks, transferred),
    }
}

/// A single progress line that is rewritten in place.
pub struct ProgressLine {
    enabled: bool,
    drawn: bool,
}

impl ProgressLine {
    /// Create a progress line; a disabled one prints nothing.
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled,
            drawn: false,
        }
    }

    /// Redraw with the latest progress.
    pub fn update(&mut self, progress: &TransferProgress) {
        if !self.enabled {
            return;
        }
        print!("\r  {}    ", progress_line(progress));
        let _ = io::stdout().flush();
        self.drawn = true;
    }

    /// End the line so later output starts on a fresh one.
    pub fn finish(&mut self) {
        if self.drawn {
            println!();
            self.drawn = false;
        }
    }
}
