//! The handshake that hands the shared buffer back and forth.
//!
//! A [`Synchronizer`] carries two one-way notifications:
//!
//! | Notification | Direction | Payload |
//! |--------------|-----------|---------|
//! | DataReady | sender → receiver | chunk length (0 = end of transfer) |
//! | ConsumedAck | receiver → sender | none |
//!
//! Calls strictly alternate: the sender issues `notify_ready` then
//! `wait_consumed`, the receiver `wait_ready` then `notify_consumed`. A
//! second chunk is never written before the previous acknowledgment.
//!
//! Two backends implement the same capability set:
//!
//! - [`QueueSynchronizer`]: typed records on a System V message queue
//! - [`SignalSynchronizer`]: `SIGUSR1`/`SIGUSR2` delivered with `sigqueue`

pub mod queue;
pub mod signal;

pub use queue::{HandshakeMessage, MessageKind, MessageQueue, QueueSynchronizer};
pub use signal::{NotificationKind, SignalRegistration, SignalSynchronizer};

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::config::TimeoutConfig;
use crate::discovery::process_alive;
use crate::error::{Error, Result};
use crate::interrupt::CancelToken;

/// The handshake capability set used by the transfer protocol.
pub trait Synchronizer {
    /// Which backend this is.
    fn backend(&self) -> Backend;

    /// Tell the receiver that `len` bytes are waiting in the buffer.
    fn notify_ready(&mut self, len: usize) -> Result<()>;

    /// Block until the sender announces a chunk; returns its length.
    fn wait_ready(&mut self) -> Result<usize>;

    /// Tell the sender the buffer has been drained.
    fn notify_consumed(&mut self) -> Result<()>;

    /// Block until the receiver acknowledges the last chunk.
    fn wait_consumed(&mut self) -> Result<()>;

    /// Release backend resources this side owns.
    ///
    /// Idempotent. Returns `true` if anything was released.
    fn release(&mut self) -> bool {
        false
    }
}

/// Selects the synchronizer implementation for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// System V message queue
    Queue,
    /// Queued real-time style signals
    #[default]
    Signal,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => f.write_str("queue"),
            Self::Signal => f.write_str("signal"),
        }
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queue" | "msg" => Ok(Self::Queue),
            "signal" | "signals" => Ok(Self::Signal),
            other => Err(Error::InvalidConfig {
                key: "transfer.backend".to_string(),
                reason: format!("unknown backend '{other}' (expected queue or signal)"),
            }),
        }
    }
}

/// Settings shared by both backends.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// The counterpart process
    pub peer: Pid,
    /// Largest acceptable chunk length (the buffer capacity)
    pub max_len: usize,
    /// Budget for a single wait, `None` for unbounded
    pub timeout: Option<Duration>,
    /// How long a wait blocks before probing the peer
    pub liveness_interval: Duration,
    /// Cancellation for blocked waits
    pub cancel: CancelToken,
}

impl SyncOptions {
    /// Build options from configuration.
    #[must_use]
    pub fn new(peer: Pid, max_len: usize, timeouts: &TimeoutConfig, cancel: CancelToken) -> Self {
        Self {
            peer,
            max_len,
            timeout: timeouts.handshake_budget(),
            liveness_interval: timeouts.liveness_interval,
            cancel,
        }
    }

    pub(crate) fn unreachable(&self, reason: impl fmt::Display) -> Error {
        Error::PeerUnreachable {
            pid: self.peer.as_raw(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn ensure_peer_alive(&self) -> Result<()> {
        if process_alive(self.peer) {
            Ok(())
        } else {
            Err(self.unreachable("process no longer exists"))
        }
    }

    /// Check a received length against the buffer capacity.
    pub(crate) fn chunk_len(&self, raw: i64) -> Result<usize> {
        usize::try_from(raw)
            .ok()
            .filter(|len| *len <= self.max_len)
            .ok_or_else(|| {
                Error::ProtocolViolation(format!(
                    "announced chunk length {raw} outside 0..={}",
                    self.max_len
                ))
            })
    }

    pub(crate) fn clock(&self) -> WaitClock {
        WaitClock {
            started: Instant::now(),
            timeout: self.timeout,
        }
    }
}

/// Tracks the handshake budget of one wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitClock {
    started: Instant,
    timeout: Option<Duration>,
}

impl WaitClock {
    /// How long the next blocking slice may last, capped at `slice`.
    pub(crate) fn next_slice(&self, slice: Duration) -> Result<Duration> {
        match self.timeout {
            None => Ok(slice),
            Some(timeout) => {
                let elapsed = self.started.elapsed();
                if elapsed >= timeout {
                    Err(Error::ProtocolTimeout(timeout))
                } else {
                    Ok(slice.min(timeout - elapsed))
                }
            }
        }
    }
}
