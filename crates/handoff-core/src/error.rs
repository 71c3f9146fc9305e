//! Error types for Handoff.
//!
//! Every failure a session can hit maps onto one variant here. None of them
//! is retried inside the protocol: the caller tears the session down and
//! exits, with [`Error::Cancelled`] being the only variant that counts as a
//! successful exit.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// A specialized `Result` type for Handoff operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Handoff.
#[derive(Error, Debug)]
pub enum Error {
    /// Shared segment, message queue or key could not be created or attached (E001)
    #[error("{resource} unavailable: {source}")]
    ResourceUnavailable {
        /// Which resource failed
        resource: &'static str,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Counterpart process was not found in time (E002)
    #[error("no peer attached to the shared buffer within {0:?}")]
    PeerDiscoveryTimeout(Duration),

    /// Counterpart exited or could not be notified (E003)
    #[error("peer process {pid} unreachable: {reason}")]
    PeerUnreachable {
        /// Process id of the peer
        pid: i32,
        /// What went wrong
        reason: String,
    },

    /// Local read or write on the file stream failed (E004)
    #[error("stream I/O failure: {0}")]
    StreamIo(#[from] io::Error),

    /// Unexpected notification or inconsistent length (E005)
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A handshake wait exceeded its budget (E006)
    #[error("handshake timed out after {0:?}")]
    ProtocolTimeout(Duration),

    /// Transfer was cancelled by an interrupt
    #[error("transfer cancelled")]
    Cancelled,

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },
}

impl Error {
    /// Shorthand for a [`Error::ResourceUnavailable`] built from `errno`.
    pub(crate) fn resource(resource: &'static str) -> Self {
        Self::ResourceUnavailable {
            resource,
            source: io::Error::last_os_error(),
        }
    }

    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::ResourceUnavailable { .. } => Some("E001"),
            Self::PeerDiscoveryTimeout(_) => Some("E002"),
            Self::PeerUnreachable { .. } => Some("E003"),
            Self::StreamIo(_) => Some("E004"),
            Self::ProtocolViolation(_) => Some("E005"),
            Self::ProtocolTimeout(_) => Some("E006"),
            _ => None,
        }
    }

    /// Returns whether this error came from an external interrupt.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Process exit status for this error.
    ///
    /// Cancellation exits cleanly; everything else is fatal.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_cancellation() {
            0
        } else {
            1
        }
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::ResourceUnavailable { .. } => Some(
                "Check that the key file exists and is readable by both processes.\n\
                 Stale segments can be listed with `ipcs -m` and removed with `ipcrm`.",
            ),
            Self::PeerDiscoveryTimeout(_) => Some(
                "Start the other side with the same key file and project id,\n\
                 or raise timeouts.peer_discovery in the configuration.",
            ),
            Self::ProtocolViolation(_) => Some(
                "Both sides must use the same backend and buffer capacity.",
            ),
            _ => None,
        }
    }
}
