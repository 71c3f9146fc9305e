//! The shared buffer: one System V shared memory segment, attached by both
//! peers for the length of a session.
//!
//! The buffer carries raw chunk bytes only. Chunk lengths travel through the
//! synchronizer, and nothing in the segment records whose turn it is: the
//! handshake alone decides which peer may touch the bytes.
//!
//! ```text
//! receiver                      kernel                      sender
//!    │  shmget(key, C) ──────────► segment ◄────────── shmget(key, C)
//!    │  shmat ───────────────────► lpid = receiver
//!    │                              │◄─────────── IPC_STAT (discover receiver)
//!    │                              lpid = sender ◄──────────────── shmat
//!    │  IPC_STAT (discover sender) ─┤
//!    │  shmdt + IPC_RMID ──────────► destroyed after last detach ◄── shmdt
//! ```

use std::ptr::NonNull;

use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::ipc::{IpcKey, Ownership};

/// Permissions used when creating the segment.
const SEGMENT_MODE: libc::c_int = 0o666;

/// Read access to the kernel's bookkeeping for a shared region.
///
/// Peer discovery is written against this trait so it can be driven by the
/// real segment or by a scripted source.
pub trait RegionMetadata {
    /// Process id of the last process that attached or detached, if any.
    fn last_actor(&self) -> Result<Option<Pid>>;
}

/// Snapshot of `shmid_ds` for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentMetadata {
    /// Last process to attach or detach (`shm_lpid`), `None` before any attach
    pub last_actor: Option<Pid>,
    /// Creator process (`shm_cpid`)
    pub creator: Pid,
    /// Current number of attachments
    pub attachments: u64,
    /// Segment size in bytes
    pub size: usize,
}

/// A System V shared memory segment identifier.
///
/// Holding a `Segment` does not map any memory; it only names the kernel
/// object so it can be inspected, attached or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    id: libc::c_int,
    capacity: usize,
}

impl Segment {
    /// Create the segment for `key`, or look up the existing one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceUnavailable`] if the kernel refuses (limits,
    /// permissions) or an existing segment is smaller than `capacity`.
    pub fn get_or_create(key: IpcKey, capacity: usize) -> Result<Self> {
        #[allow(unsafe_code)]
        // SAFETY: shmget takes plain integers.
        let id = unsafe { libc::shmget(key.as_raw(), capacity, SEGMENT_MODE | libc::IPC_CREAT) };
        if id == -1 {
            return Err(Error::resource("shared memory segment"));
        }

        let segment = Self { id, capacity };
        let metadata = segment.metadata()?;
        if metadata.size < capacity {
            return Err(Error::ResourceUnavailable {
                resource: "shared memory segment",
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "existing segment holds {} bytes, {capacity} required",
                        metadata.size
                    ),
                ),
            });
        }

        tracing::debug!(key = %key, shmid = id, capacity, "Opened shared memory segment");
        Ok(segment)
    }

    /// Kernel identifier of the segment.
    #[must_use]
    pub const fn id(&self) -> libc::c_int {
        self.id
    }

    /// Capacity requested for this session.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read the segment's `shmid_ds`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceUnavailable`] if the segment no longer exists.
    pub fn metadata(&self) -> Result<SegmentMetadata> {
        #[allow(unsafe_code)]
        // SAFETY: shmid_ds is plain old data; zeroed is a valid value.
        let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
        #[allow(unsafe_code)]
        // SAFETY: `ds` is a valid, writable shmid_ds.
        let rc = unsafe { libc::shmctl(self.id, libc::IPC_STAT, &mut ds) };
        if rc == -1 {
            return Err(Error::resource("shared memory segment"));
        }

        Ok(SegmentMetadata {
            last_actor: (ds.shm_lpid > 0).then(|| Pid::from_raw(ds.shm_lpid)),
            creator: Pid::from_raw(ds.shm_cpid),
            attachments: u64::from(ds.shm_nattch),
            size: ds.shm_segsz,
        })
    }

    /// Mark the segment for destruction once the last attachment is gone.
    ///
    /// A segment that is already gone counts as removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceUnavailable`] for any other failure.
    pub fn remove(&self) -> Result<()> {
        #[allow(unsafe_code)]
        // SAFETY: IPC_RMID ignores the buffer argument.
        let rc = unsafe { libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(libc::EINVAL | libc::EIDRM)) {
                return Ok(());
            }
            return Err(Error::ResourceUnavailable {
                resource: "shared memory segment",
                source: err,
            });
        }
        Ok(())
    }

    /// Remove the segment if `creator` made it and nobody has attached.
    ///
    /// Returns `true` if the segment was removed. A segment that is already
    /// gone is left alone and reported as `false`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceUnavailable`] if the removal itself fails.
    pub fn remove_if_unclaimed(&self, creator: Pid) -> Result<bool> {
        let Ok(metadata) = self.metadata() else {
            return Ok(false);
        };
        if metadata.creator != creator || metadata.attachments > 0 {
            return Ok(false);
        }
        self.remove()?;
        tracing::debug!(shmid = self.id, "Removed unclaimed shared memory segment");
        Ok(true)
    }
}

impl RegionMetadata for Segment {
    fn last_actor(&self) -> Result<Option<Pid>> {
        Ok(self.metadata()?.last_actor)
    }
}

/// A local attachment of the shared segment.
///
/// Exclusive access is never enforced here. A peer may call
/// [`write_chunk`](Self::write_chunk) or [`read_chunk`](Self::read_chunk) only
/// while the handshake has handed it the turn.
#[derive(Debug)]
pub struct SharedBuffer {
    segment: Segment,
    addr: Option<NonNull<u8>>,
    ownership: Ownership,
    removed: bool,
}

// SAFETY: the mapping belongs to the process, not the thread that created it.
#[allow(unsafe_code)]
unsafe impl Send for SharedBuffer {}

impl SharedBuffer {
    /// Create-or-attach a buffer of exactly `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceUnavailable`] if the segment cannot be
    /// created or attached.
    pub fn acquire(key: IpcKey, capacity: usize, ownership: Ownership) -> Result<Self> {
        let segment = Segment::get_or_create(key, capacity)?;
        Self::attach(segment, ownership)
    }

    /// Map `segment` into this process.
    ///
    /// If the attach fails and `ownership` is [`Ownership::Owner`] the
    /// segment is removed before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceUnavailable`] if `shmat` fails.
    pub fn attach(segment: Segment, ownership: Ownership) -> Result<Self> {
        #[allow(unsafe_code)]
        // SAFETY: a null address lets the kernel pick the mapping.
        let raw = unsafe { libc::shmat(segment.id, std::ptr::null(), 0) };
        if raw as isize == -1 {
            let err = Error::resource("shared memory attachment");
            if ownership == Ownership::Owner {
                if let Err(e) = segment.remove() {
                    tracing::warn!(shmid = segment.id, error = %e, "Failed to remove segment");
                }
            }
            return Err(err);
        }

        tracing::debug!(shmid = segment.id, ?ownership, "Attached shared buffer");
        Ok(Self {
            segment,
            addr: NonNull::new(raw.cast::<u8>()),
            ownership,
            removed: false,
        })
    }

    /// Capacity in bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.segment.capacity
    }

    /// The underlying segment.
    #[must_use]
    pub const fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Whether [`release`](Self::release) has already run.
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.addr.is_none()
    }

    fn mapping(&self) -> Result<NonNull<u8>> {
        self.addr.ok_or_else(|| Error::ResourceUnavailable {
            resource: "shared memory attachment",
            source: std::io::Error::new(std::io::ErrorKind::NotConnected, "buffer released"),
        })
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.capacity() {
            return Err(Error::ProtocolViolation(format!(
                "chunk of {len} bytes exceeds buffer capacity {}",
                self.capacity()
            )));
        }
        Ok(())
    }

    /// Copy `data` into the start of the buffer.
    ///
    /// # Errors
    ///
    /// Fails if the chunk exceeds the capacity or the buffer was released.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.check_len(data.len())?;
        let dst = self.mapping()?;
        #[allow(unsafe_code)]
        // SAFETY: the mapping holds `capacity` bytes and `data.len() <= capacity`.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len());
        }
        Ok(())
    }

    /// Borrow the first `len` bytes of the buffer.
    ///
    /// # Errors
    ///
    /// Fails if `len` exceeds the capacity or the buffer was released.
    pub fn read_chunk(&self, len: usize) -> Result<&[u8]> {
        self.check_len(len)?;
        let src = self.mapping()?;
        #[allow(unsafe_code)]
        // SAFETY: the mapping holds `capacity` bytes and stays valid while `self`
        // is borrowed; the peer does not write during the reader's turn.
        let chunk = unsafe { std::slice::from_raw_parts(src.as_ptr(), len) };
        Ok(chunk)
    }

    /// Detach, and for owners request destruction of the segment.
    ///
    /// Safe to call any number of times. Failures are logged and swallowed
    /// so teardown always completes. Returns `true` if this call released
    /// anything.
    pub fn release(&mut self) -> bool {
        let mut released = false;

        if let Some(addr) = self.addr.take() {
            #[allow(unsafe_code)]
            // SAFETY: `addr` came from shmat and is detached exactly once.
            let rc = unsafe { libc::shmdt(addr.as_ptr().cast()) };
            if rc == -1 {
                tracing::warn!(
                    shmid = self.segment.id,
                    error = %std::io::Error::last_os_error(),
                    "Failed to detach shared memory"
                );
            } else {
                tracing::debug!(shmid = self.segment.id, "Detached shared buffer");
            }
            released = true;
        }

        if self.ownership == Ownership::Owner && !self.removed {
            self.removed = true;
            match self.segment.remove() {
                Ok(()) => tracing::debug!(shmid = self.segment.id, "Removed shared memory segment"),
                Err(e) => {
                    tracing::warn!(shmid = self.segment.id, error = %e, "Failed to remove segment");
                }
            }
            released = true;
        }

        released
    }
}

impl RegionMetadata for SharedBuffer {
    fn last_actor(&self) -> Result<Option<Pid>> {
        self.segment.last_actor()
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        self.release();
    }
}
