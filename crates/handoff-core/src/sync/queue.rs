//! Message queue backend.
//!
//! Both directions share one System V queue. The record's `mtype` is the
//! message kind, so each side receives selectively and a `ConsumedAck` can
//! never be taken for a `DataReady`.
//!
//! ## Record Format
//!
//! ```text
//! ┌──────────────────────┬──────────────────────┐
//! │        mtype         │         len          │
//! │   c_long (1 or 2)    │        c_int         │
//! └──────────────────────┴──────────────────────┘
//! ```
//!
//! Only `len` counts toward the `msgsz` passed to the kernel.

use std::io;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::ipc::{IpcKey, Ownership, Role};

use super::{Backend, SyncOptions, Synchronizer};

/// Permissions used when creating the queue.
const QUEUE_MODE: libc::c_int = 0o666;

/// Size of the record body handed to `msgsnd`/`msgrcv`.
const PAYLOAD_SIZE: usize = std::mem::size_of::<libc::c_int>();

/// First delay when the queue is empty.
const MIN_BACKOFF: Duration = Duration::from_micros(20);

/// Largest delay between queue polls.
///
/// Waits poll `msgrcv(IPC_NOWAIT)` rather than block in it, so a record that
/// lands while the waiter sleeps is picked up at most this late. The backoff
/// reaches the cap after about seven empty polls.
const MAX_BACKOFF: Duration = Duration::from_millis(2);

/// Kind of a handshake record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Sender → receiver: the buffer holds a chunk
    DataReady,
    /// Receiver → sender: the chunk was consumed
    ConsumedAck,
}

impl MessageKind {
    /// The `mtype` used on the wire.
    #[must_use]
    pub const fn mtype(self) -> libc::c_long {
        match self {
            Self::DataReady => 1,
            Self::ConsumedAck => 2,
        }
    }

    /// Parse an `mtype`.
    #[must_use]
    pub const fn from_mtype(mtype: libc::c_long) -> Option<Self> {
        match mtype {
            1 => Some(Self::DataReady),
            2 => Some(Self::ConsumedAck),
            _ => None,
        }
    }
}

/// A decoded handshake record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeMessage {
    /// Message kind
    pub kind: MessageKind,
    /// Chunk length, meaningful only for `DataReady`
    pub len: i32,
}

impl HandshakeMessage {
    /// A `DataReady` record.
    #[must_use]
    pub const fn data_ready(len: i32) -> Self {
        Self {
            kind: MessageKind::DataReady,
            len,
        }
    }

    /// A `ConsumedAck` record.
    #[must_use]
    pub const fn consumed_ack() -> Self {
        Self {
            kind: MessageKind::ConsumedAck,
            len: 0,
        }
    }
}

#[repr(C)]
struct QueueRecord {
    mtype: libc::c_long,
    len: libc::c_int,
}

/// A System V message queue handle.
#[derive(Debug)]
pub struct MessageQueue {
    id: libc::c_int,
    ownership: Ownership,
    released: bool,
}

impl MessageQueue {
    /// Create the queue for `key`, or open the existing one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceUnavailable`] if `msgget` fails.
    pub fn open(key: IpcKey, ownership: Ownership) -> Result<Self> {
        #[allow(unsafe_code)]
        // SAFETY: msgget takes plain integers.
        let id = unsafe { libc::msgget(key.as_raw(), QUEUE_MODE | libc::IPC_CREAT) };
        if id == -1 {
            return Err(Error::resource("message queue"));
        }

        tracing::debug!(key = %key, msqid = id, ?ownership, "Opened message queue");
        Ok(Self {
            id,
            ownership,
            released: false,
        })
    }

    /// Wrap a queue id obtained elsewhere, such as another handle in this
    /// process.
    #[must_use]
    pub const fn from_id(id: libc::c_int, ownership: Ownership) -> Self {
        Self {
            id,
            ownership,
            released: false,
        }
    }

    /// Kernel identifier of the queue.
    #[must_use]
    pub const fn id(&self) -> libc::c_int {
        self.id
    }

    /// Enqueue a record, blocking if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns the OS error, including `EINTR` when interrupted.
    pub fn send(&self, message: HandshakeMessage) -> io::Result<()> {
        let record = QueueRecord {
            mtype: message.kind.mtype(),
            len: message.len,
        };
        #[allow(unsafe_code)]
        // SAFETY: `record` is a repr(C) msgbuf with PAYLOAD_SIZE bytes after mtype.
        let rc = unsafe {
            libc::msgsnd(
                self.id,
                std::ptr::addr_of!(record).cast(),
                PAYLOAD_SIZE,
                0,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Dequeue the oldest record of `kind` without blocking.
    ///
    /// Returns `Ok(None)` when no such record is queued.
    ///
    /// # Errors
    ///
    /// Returns the OS error for anything other than an empty queue.
    pub fn try_receive(&self, kind: MessageKind) -> io::Result<Option<HandshakeMessage>> {
        let mut record = QueueRecord { mtype: 0, len: 0 };
        #[allow(unsafe_code)]
        // SAFETY: `record` has room for PAYLOAD_SIZE bytes after mtype.
        let rc = unsafe {
            libc::msgrcv(
                self.id,
                std::ptr::addr_of_mut!(record).cast(),
                PAYLOAD_SIZE,
                kind.mtype(),
                libc::IPC_NOWAIT,
            )
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENOMSG) => Ok(None),
                _ => Err(err),
            };
        }

        let kind = MessageKind::from_mtype(record.mtype).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message type {}", record.mtype),
            )
        })?;
        Ok(Some(HandshakeMessage {
            kind,
            len: record.len,
        }))
    }

    /// Remove the queue if this handle owns it.
    ///
    /// Safe to call any number of times; failures are logged, not returned.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        if self.ownership != Ownership::Owner {
            return false;
        }

        #[allow(unsafe_code)]
        // SAFETY: IPC_RMID ignores the buffer argument.
        let rc = unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if !matches!(err.raw_os_error(), Some(libc::EINVAL | libc::EIDRM)) {
                tracing::warn!(msqid = self.id, error = %err, "Failed to remove message queue");
            }
        } else {
            tracing::debug!(msqid = self.id, "Removed message queue");
        }
        true
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.release();
    }
}

/// [`Synchronizer`] over a [`MessageQueue`].
///
/// Waiting polls the queue with a short exponential backoff so that the
/// handshake budget, peer liveness and cancellation are all observed.
#[derive(Debug)]
pub struct QueueSynchronizer {
    queue: MessageQueue,
    role: Role,
    options: SyncOptions,
}

impl QueueSynchronizer {
    /// Wrap `queue` for `role`.
    #[must_use]
    pub const fn new(queue: MessageQueue, role: Role, options: SyncOptions) -> Self {
        Self {
            queue,
            role,
            options,
        }
    }

    /// The underlying queue.
    #[must_use]
    pub const fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    fn require_role(&self, role: Role, operation: &str) -> Result<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(Error::ProtocolViolation(format!(
                "{operation} is a {role} operation, this side is the {}",
                self.role
            )))
        }
    }

    fn map_queue_error(&self, err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(libc::EIDRM | libc::EINVAL) => self.options.unreachable("message queue removed"),
            _ if err.kind() == io::ErrorKind::InvalidData => {
                Error::ProtocolViolation(err.to_string())
            }
            _ => self.options.unreachable(err),
        }
    }

    fn send(&self, message: HandshakeMessage) -> Result<()> {
        loop {
            self.options.cancel.check()?;
            match self.queue.send(message) {
                Ok(()) => {
                    tracing::trace!(kind = ?message.kind, len = message.len, "Queued message");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.map_queue_error(e)),
            }
        }
    }

    fn receive(&self, kind: MessageKind) -> Result<HandshakeMessage> {
        let clock = self.options.clock();
        let mut backoff = MIN_BACKOFF;
        let mut last_probe = Instant::now();

        loop {
            self.options.cancel.check()?;

            match self.queue.try_receive(kind) {
                Ok(Some(message)) => {
                    tracing::trace!(kind = ?message.kind, len = message.len, "Dequeued message");
                    return Ok(message);
                }
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.map_queue_error(e)),
            }

            let slice = clock.next_slice(backoff)?;
            if last_probe.elapsed() >= self.options.liveness_interval {
                self.options.ensure_peer_alive()?;
                last_probe = Instant::now();
            }

            // A message sent now waits out this sleep: at most MAX_BACKOFF.
            std::thread::sleep(slice);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

impl Synchronizer for QueueSynchronizer {
    fn backend(&self) -> Backend {
        Backend::Queue
    }

    fn notify_ready(&mut self, len: usize) -> Result<()> {
        self.require_role(Role::Sender, "notify_ready")?;
        let len = i32::try_from(len)
            .map_err(|_| Error::ProtocolViolation(format!("chunk length {len} overflows c_int")))?;
        self.send(HandshakeMessage::data_ready(len))
    }

    fn wait_ready(&mut self) -> Result<usize> {
        self.require_role(Role::Receiver, "wait_ready")?;
        let message = self.receive(MessageKind::DataReady)?;
        self.options.chunk_len(i64::from(message.len))
    }

    fn notify_consumed(&mut self) -> Result<()> {
        self.require_role(Role::Receiver, "notify_consumed")?;
        self.send(HandshakeMessage::consumed_ack())
    }

    fn wait_consumed(&mut self) -> Result<()> {
        self.require_role(Role::Sender, "wait_consumed")?;
        self.receive(MessageKind::ConsumedAck).map(|_| ())
    }

    fn release(&mut self) -> bool {
        self.queue.release()
    }
}
