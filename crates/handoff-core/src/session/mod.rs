//! Session lifecycle.
//!
//! A [`TransferSession`] owns everything one side of a transfer holds: the
//! shared buffer attachment and the synchronizer. Setup order matters:
//!
//! 1. for the signal backend, block the wait signal
//! 2. derive the IPC key
//! 3. receiver: create-or-attach the segment, then wait for the sender to
//!    attach; sender: wait for the receiver to attach, then attach
//! 4. build the synchronizer for the discovered peer
//!
//! Teardown runs exactly once, whether the transfer finished, failed or was
//! cancelled. The receiver removes the segment and the queue; the sender only
//! detaches.

use std::io::{Read, Write};

use nix::unistd::{getpid, Pid};

use crate::config::Config;
use crate::discovery::{find_peer, DiscoveryOptions};
use crate::error::{Error, Result};
use crate::interrupt::CancelToken;
use crate::ipc::{IpcKey, Ownership, Role};
use crate::shm::{Segment, SharedBuffer};
use crate::sync::{
    Backend, MessageQueue, QueueSynchronizer, SignalRegistration, SignalSynchronizer,
    SyncOptions, Synchronizer,
};
use crate::transfer::{receive_stream, send_stream, TransferProgress, TransferReport};

/// Synchronizer handle held by a session.
pub type BoxedSynchronizer = Box<dyn Synchronizer + Send>;

/// One side of a transfer.
pub struct TransferSession {
    role: Role,
    peer: Pid,
    buffer: SharedBuffer,
    synchronizer: BoxedSynchronizer,
    cancel: CancelToken,
    bytes_transferred: u64,
    released: bool,
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("buffer", &self.buffer)
            .field("backend", &self.synchronizer.backend())
            .field("bytes_transferred", &self.bytes_transferred)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl TransferSession {
    /// Acquire the shared resources for `role` and find the peer.
    ///
    /// Blocks until the counterpart shows up or the discovery timeout
    /// elapses. Anything acquired before a failure is released again.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] for a configuration that cannot work
    /// - [`Error::ResourceUnavailable`] when a resource cannot be created
    /// - [`Error::PeerDiscoveryTimeout`] when the peer never attaches
    /// - [`Error::Cancelled`] when `cancel` trips during setup
    pub fn establish(config: &Config, role: Role, cancel: CancelToken) -> Result<Self> {
        config.validate()?;
        let backend = config.transfer.backend;
        let capacity = config.transfer.capacity;

        // Must precede the attach: the peer learns our pid from it.
        let registration = match backend {
            Backend::Signal => Some(SignalRegistration::install(role)?),
            Backend::Queue => None,
        };

        let key = IpcKey::derive(
            &config.ipc.key_file,
            config.ipc.project_id,
            config.ipc.create_key_file,
        )?;
        tracing::info!(%role, %backend, %key, capacity, "Setting up session");

        let me = getpid();
        let mut discovery = DiscoveryOptions::from(&config.timeouts);
        let (buffer, peer) = match role {
            Role::Receiver => {
                let buffer = SharedBuffer::acquire(key, capacity, Ownership::Owner)?;
                // Our attach replaced any stale pid; a sender that already
                // exited still left its data behind.
                discovery.require_alive = false;
                let peer = find_peer(&buffer, me, &discovery, &cancel)?;
                (buffer, peer)
            }
            Role::Sender => {
                let segment = Segment::get_or_create(key, capacity)?;
                let peer = find_peer(&segment, me, &discovery, &cancel).inspect_err(|_| {
                    // No receiver ever came; don't leave our own segment behind.
                    if let Err(e) = segment.remove_if_unclaimed(me) {
                        tracing::warn!(shmid = segment.id(), error = %e, "Failed to remove segment");
                    }
                })?;
                (SharedBuffer::attach(segment, Ownership::Attached)?, peer)
            }
        };

        let options = SyncOptions::new(peer, capacity, &config.timeouts, cancel.clone());
        let synchronizer: BoxedSynchronizer = match registration {
            Some(registration) => Box::new(SignalSynchronizer::new(registration, options)),
            None => {
                let queue = MessageQueue::open(key, role.ownership())?;
                Box::new(QueueSynchronizer::new(queue, role, options))
            }
        };

        Ok(Self::from_parts(role, peer, buffer, synchronizer, cancel))
    }

    /// Assemble a session from resources set up elsewhere.
    #[must_use]
    pub fn from_parts(
        role: Role,
        peer: Pid,
        buffer: SharedBuffer,
        synchronizer: BoxedSynchronizer,
        cancel: CancelToken,
    ) -> Self {
        Self {
            role,
            peer,
            buffer,
            synchronizer,
            cancel,
            bytes_transferred: 0,
            released: false,
        }
    }

    /// Local role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// The counterpart's pid.
    #[must_use]
    pub const fn peer(&self) -> Pid {
        self.peer
    }

    /// Synchronizer backend in use.
    #[must_use]
    pub fn backend(&self) -> Backend {
        self.synchronizer.backend()
    }

    /// Bytes handed over so far, including by a failed transfer.
    #[must_use]
    pub const fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// The shared buffer.
    #[must_use]
    pub const fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    fn require_role(&self, role: Role) -> Result<()> {
        if self.released {
            return Err(Error::ProtocolViolation("session already released".to_string()));
        }
        if self.role != role {
            return Err(Error::ProtocolViolation(format!(
                "a {} session cannot act as the {role}",
                self.role
            )));
        }
        Ok(())
    }

    /// Stream `input` to the peer.
    ///
    /// # Errors
    ///
    /// See [`send_stream`].
    pub fn send<R, F>(
        &mut self,
        input: &mut R,
        total_bytes: Option<u64>,
        mut observer: F,
    ) -> Result<TransferReport>
    where
        R: Read + ?Sized,
        F: FnMut(&TransferProgress),
    {
        self.require_role(Role::Sender)?;
        let bytes = &mut self.bytes_transferred;
        send_stream(
            &mut self.buffer,
            self.synchronizer.as_mut(),
            input,
            total_bytes,
            &self.cancel,
            |progress| {
                *bytes = progress.bytes_transferred;
                observer(progress);
            },
        )
    }

    /// Drain the peer's stream into `output`.
    ///
    /// # Errors
    ///
    /// See [`receive_stream`].
    pub fn receive<W, F>(&mut self, output: &mut W, mut observer: F) -> Result<TransferReport>
    where
        W: Write + ?Sized,
        F: FnMut(&TransferProgress),
    {
        self.require_role(Role::Receiver)?;
        let bytes = &mut self.bytes_transferred;
        receive_stream(
            &self.buffer,
            self.synchronizer.as_mut(),
            output,
            &self.cancel,
            |progress| {
                *bytes = progress.bytes_transferred;
                observer(progress);
            },
        )
    }

    /// Release the synchronizer and the buffer.
    ///
    /// Safe to call more than once; only the first call does anything.
    /// Failures are logged, never returned. Returns `true` if this call
    /// released anything.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        let synchronizer = self.synchronizer.release();
        let buffer = self.buffer.release();
        tracing::debug!(
            role = %self.role,
            bytes = self.bytes_transferred,
            "Released session resources"
        );
        synchronizer || buffer
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.release();
    }
}
