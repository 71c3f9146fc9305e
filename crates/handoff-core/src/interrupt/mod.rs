//! Cancellation through `SIGINT` and `SIGTERM`.
//!
//! [`install`] registers a handler that only raises a process-wide flag. The
//! handler is installed without `SA_RESTART`, so a process blocked in
//! `msgrcv` or `sigtimedwait` wakes up with `EINTR` and the waiting code
//! turns that into [`Error::Cancelled`](crate::Error::Cancelled) via a
//! [`CancelToken`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{Error, Result};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route `SIGINT` and `SIGTERM` to the cancellation flag.
///
/// # Errors
///
/// Returns [`Error::ResourceUnavailable`] if a handler cannot be installed.
pub fn install() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );

    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        #[allow(unsafe_code)]
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        unsafe { sigaction(signal, &action) }.map_err(|errno| Error::ResourceUnavailable {
            resource: "interrupt handler",
            source: std::io::Error::from(errno),
        })?;
    }

    tracing::debug!("Installed interrupt handler");
    Ok(())
}

/// Whether an interrupt has arrived since [`install`].
#[must_use]
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Cancellation handle passed through discovery, the synchronizers and the
/// transfer loop.
///
/// A token trips when [`cancel`](Self::cancel) is called on it or any clone,
/// or, for tokens built with [`from_interrupts`](Self::from_interrupts), when
/// the process receives `SIGINT`/`SIGTERM`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    interrupts: bool,
}

impl CancelToken {
    /// A token that only trips on explicit [`cancel`](Self::cancel).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also trips on process interrupts.
    #[must_use]
    pub fn from_interrupts() -> Self {
        Self {
            flag: Arc::default(),
            interrupts: true,
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.interrupts && interrupted())
    }

    /// Return [`Error::Cancelled`] if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when the token has tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}
