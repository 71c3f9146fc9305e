//! Signal backend.
//!
//! `SIGUSR1` announces a chunk and carries its length in the `sigqueue`
//! payload; `SIGUSR2` acknowledges it and carries nothing. Each side waits
//! synchronously with `sigtimedwait`, so no handler runs and nothing spins.
//!
//! Standard signals are not queued: a notification that arrives while the
//! signal is unblocked either runs the default action (terminating the
//! process) or is lost. The wait signal therefore has to be blocked before
//! the peer can learn our pid, which happens when we touch the shared
//! segment. [`SignalRegistration`] is that blocking step, and
//! [`SignalSynchronizer::new`] takes it by value so a synchronizer cannot
//! exist without it.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::ipc::Role;

use super::{Backend, SyncOptions, Synchronizer};

/// The two notification identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// A chunk is in the buffer (payload = length)
    DataReady,
    /// The chunk was consumed (no payload)
    ConsumedAck,
}

impl NotificationKind {
    /// Signal used for this notification.
    #[must_use]
    pub const fn signal(self) -> Signal {
        match self {
            Self::DataReady => Signal::SIGUSR1,
            Self::ConsumedAck => Signal::SIGUSR2,
        }
    }

    /// Notification the given role waits for.
    #[must_use]
    pub const fn awaited_by(role: Role) -> Self {
        match role {
            Role::Receiver => Self::DataReady,
            Role::Sender => Self::ConsumedAck,
        }
    }
}

/// Proof that the wait signal for a role is blocked on this thread.
///
/// Install it before creating or attaching the shared segment. The mask is
/// left in place when the registration is dropped, so a late notification
/// stays pending instead of killing the process.
#[derive(Debug)]
pub struct SignalRegistration {
    role: Role,
    set: SigSet,
}

impl SignalRegistration {
    /// Block the signal `role` waits for.
    ///
    /// The calling thread must be the one that later waits, and in a
    /// multi-threaded process every other thread must block it too.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceUnavailable`] if the mask cannot be changed.
    pub fn install(role: Role) -> Result<Self> {
        let kind = NotificationKind::awaited_by(role);
        let mut set = SigSet::empty();
        set.add(kind.signal());
        set.thread_block().map_err(|errno| Error::ResourceUnavailable {
            resource: "signal mask",
            source: std::io::Error::from(errno),
        })?;

        tracing::debug!(%role, signal = %kind.signal(), "Blocked wait signal");
        Ok(Self { role, set })
    }

    /// Role this registration was made for.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Notification this registration waits for.
    #[must_use]
    pub const fn awaits(&self) -> NotificationKind {
        NotificationKind::awaited_by(self.role)
    }
}

/// Encode an `int` payload the way C's `sival_int` lays it out.
#[allow(clippy::cast_sign_loss)]
fn sigval_from_int(value: i32) -> libc::sigval {
    let bits = value as u32 as usize;
    #[cfg(target_endian = "big")]
    let bits = bits << (usize::BITS - 32);
    libc::sigval {
        sival_ptr: bits as *mut libc::c_void,
    }
}

/// Decode `sival_int` from a received payload.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn sigval_to_int(value: libc::sigval) -> i32 {
    let bits = value.sival_ptr as usize;
    #[cfg(target_endian = "big")]
    let bits = bits >> (usize::BITS - 32);
    bits as u32 as i32
}

/// A received notification.
struct Received {
    sender: Pid,
    payload: i32,
}

/// [`Synchronizer`] over `SIGUSR1`/`SIGUSR2`.
#[derive(Debug)]
pub struct SignalSynchronizer {
    registration: SignalRegistration,
    options: SyncOptions,
}

impl SignalSynchronizer {
    /// Build the synchronizer from an installed registration.
    #[must_use]
    pub const fn new(registration: SignalRegistration, options: SyncOptions) -> Self {
        Self {
            registration,
            options,
        }
    }

    fn notify(&self, kind: NotificationKind, payload: i32) -> Result<()> {
        self.options.cancel.check()?;
        let signal = kind.signal();

        #[allow(unsafe_code)]
        // SAFETY: sigqueue takes plain values; the payload is an integer, not a pointer.
        let rc = unsafe {
            libc::sigqueue(
                self.options.peer.as_raw(),
                signal as libc::c_int,
                sigval_from_int(payload),
            )
        };
        if rc == -1 {
            return Err(self.options.unreachable(Errno::last().desc()));
        }

        tracing::trace!(peer = self.options.peer.as_raw(), %signal, payload, "Sent notification");
        Ok(())
    }

    fn wait(&self, kind: NotificationKind) -> Result<Received> {
        if self.registration.awaits() != kind {
            return Err(Error::ProtocolViolation(format!(
                "the {} cannot wait for {kind:?}",
                self.registration.role()
            )));
        }

        let clock = self.options.clock();
        loop {
            self.options.cancel.check()?;
            let slice = clock.next_slice(self.options.liveness_interval)?;

            match timed_wait(&self.registration.set, slice) {
                Ok(received) => {
                    if received.sender != self.options.peer {
                        return Err(Error::ProtocolViolation(format!(
                            "{kind:?} notification from unexpected process {}",
                            received.sender
                        )));
                    }
                    tracing::trace!(?kind, payload = received.payload, "Received notification");
                    return Ok(received);
                }
                Err(Errno::EAGAIN) => self.options.ensure_peer_alive()?,
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(self.options.unreachable(errno.desc())),
            }
        }
    }
}

/// `sigtimedwait` for at most `slice`.
fn timed_wait(set: &SigSet, slice: Duration) -> std::result::Result<Received, Errno> {
    #[allow(unsafe_code)]
    // SAFETY: timespec is plain old data.
    let mut timeout: libc::timespec = unsafe { std::mem::zeroed() };
    timeout.tv_sec = libc::time_t::try_from(slice.as_secs()).unwrap_or(libc::time_t::MAX);
    timeout.tv_nsec = libc::c_long::from(slice.subsec_nanos());

    #[allow(unsafe_code)]
    // SAFETY: siginfo_t is plain old data.
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };

    #[allow(unsafe_code)]
    // SAFETY: all pointers reference live locals.
    let rc = unsafe { libc::sigtimedwait(set.as_ref(), &mut info, &timeout) };
    if rc == -1 {
        return Err(Errno::last());
    }

    #[allow(unsafe_code)]
    // SAFETY: the signals we wait for are sent with kill/sigqueue, which fill
    // the pid and value fields.
    let (pid, value) = unsafe { (info.si_pid(), info.si_value()) };
    Ok(Received {
        sender: Pid::from_raw(pid),
        payload: sigval_to_int(value),
    })
}

impl Synchronizer for SignalSynchronizer {
    fn backend(&self) -> Backend {
        Backend::Signal
    }

    fn notify_ready(&mut self, len: usize) -> Result<()> {
        let payload = i32::try_from(len)
            .map_err(|_| Error::ProtocolViolation(format!("chunk length {len} overflows c_int")))?;
        self.notify(NotificationKind::DataReady, payload)
    }

    fn wait_ready(&mut self) -> Result<usize> {
        let received = self.wait(NotificationKind::DataReady)?;
        self.options.chunk_len(i64::from(received.payload))
    }

    fn notify_consumed(&mut self) -> Result<()> {
        self.notify(NotificationKind::ConsumedAck, 0)
    }

    fn wait_consumed(&mut self) -> Result<()> {
        self.wait(NotificationKind::ConsumedAck).map(|_| ())
    }
}
