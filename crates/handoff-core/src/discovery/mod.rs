//! Peer discovery through shared segment metadata.
//!
//! The kernel records the pid of the last process that attached to or
//! detached from a segment (`shm_lpid`). Each side polls that field until it
//! names a live process other than itself:
//!
//! - the sender polls *before* attaching, so the first foreign pid it sees is
//!   the receiver's attach;
//! - the receiver attaches first, so it initially sees its own pid, which is
//!   expected and simply means "keep waiting", until the sender attaches.
//!
//! A dead last actor is stale when seen before our own attach, so the sender
//! skips it. The receiver has already attached by then, so any other pid it
//! sees is the sender, even one that finished and exited in between polls.
//!
//! Polling backs off exponentially and is bounded by a timeout.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::config::TimeoutConfig;
use crate::error::{Error, Result};
use crate::interrupt::CancelToken;
use crate::shm::RegionMetadata;

/// Upper bound for the backoff between polls.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Polling schedule for [`find_peer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Delay before the second poll
    pub poll_interval: Duration,
    /// Largest delay between polls
    pub max_interval: Duration,
    /// Total time budget
    pub timeout: Duration,
    /// Skip last actors that no longer exist
    pub require_alive: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl From<&TimeoutConfig> for DiscoveryOptions {
    fn from(timeouts: &TimeoutConfig) -> Self {
        Self {
            poll_interval: timeouts.poll_interval,
            max_interval: MAX_POLL_INTERVAL.max(timeouts.poll_interval),
            timeout: timeouts.peer_discovery,
            require_alive: true,
        }
    }
}

/// Whether `pid` names a running process.
///
/// `EPERM` means the process exists but belongs to someone else. A zombie
/// still answers signal 0 but has already exited, so it counts as gone.
#[must_use]
pub fn process_alive(pid: Pid) -> bool {
    matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM)) && !is_zombie(pid)
}

/// Whether `/proc/<pid>/stat` reports state `Z`. Without procfs, never.
fn is_zombie(pid: Pid) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            // The command name may itself contain ')'.
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

/// Resolve the counterpart's pid from the region's last-actor field.
///
/// # Errors
///
/// - [`Error::PeerDiscoveryTimeout`] when no peer shows up within the budget
/// - [`Error::Cancelled`] when `cancel` trips
/// - [`Error::ResourceUnavailable`] when the region can no longer be inspected
pub fn find_peer<M>(
    region: &M,
    self_pid: Pid,
    options: &DiscoveryOptions,
    cancel: &CancelToken,
) -> Result<Pid>
where
    M: RegionMetadata + ?Sized,
{
    let started = Instant::now();
    let mut interval = options.poll_interval;

    loop {
        cancel.check()?;

        match region.last_actor()? {
            Some(pid) if pid != self_pid && (!options.require_alive || process_alive(pid)) => {
                tracing::info!(peer = pid.as_raw(), "Found peer process");
                return Ok(pid);
            }
            Some(pid) if pid != self_pid => {
                tracing::debug!(pid = pid.as_raw(), "Last actor has exited, still waiting");
            }
            _ => {}
        }

        let elapsed = started.elapsed();
        if elapsed >= options.timeout {
            return Err(Error::PeerDiscoveryTimeout(options.timeout));
        }

        std::thread::sleep(interval.min(options.timeout - elapsed));
        interval = (interval * 2).min(options.max_interval);
    }
}
