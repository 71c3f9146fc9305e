//! System V key derivation and the role vocabulary shared by every module.
//!
//! Both peers derive the same `key_t` from a key file and a project id. One
//! key names the shared segment and, for the queue backend, the message
//! queue; the two live in separate kernel namespaces.

use std::ffi::CString;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

/// Contents written into a freshly created key file.
const KEY_FILE_CONTENTS: &[u8] = b"Hello world\n";

/// Which end of the transfer this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Reads the input file and fills the buffer
    Sender,
    /// Drains the buffer into the output file
    Receiver,
}

impl Role {
    /// Ownership the role takes over shared resources.
    ///
    /// The receiver removes the segment and queue when it finishes; the
    /// sender only drops its own attachment.
    #[must_use]
    pub const fn ownership(self) -> Ownership {
        match self {
            Self::Sender => Ownership::Attached,
            Self::Receiver => Ownership::Owner,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => f.write_str("sender"),
            Self::Receiver => f.write_str("receiver"),
        }
    }
}

/// Whether releasing a handle also destroys the kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Release detaches and requests destruction
    Owner,
    /// Release only detaches the local handle
    Attached,
}

/// A System V IPC key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcKey(libc::key_t);

impl IpcKey {
    /// Key for a segment or queue nobody else can look up.
    pub const PRIVATE: Self = Self(libc::IPC_PRIVATE);

    /// Derive the key from `key_file` and `project_id` with `ftok(3)`.
    ///
    /// When `create` is set and the file does not exist it is created first;
    /// an existing file is never truncated, so its inode (and the key) stays
    /// stable for a peer that already derived it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceUnavailable`] if the file is missing or
    /// unreadable, or the id is not a single byte.
    pub fn derive(key_file: &Path, project_id: char, create: bool) -> Result<Self> {
        if create && !key_file.exists() {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(key_file)
                .map_err(|source| Error::ResourceUnavailable {
                    resource: "key file",
                    source,
                })?;
            if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
                file.write_all(KEY_FILE_CONTENTS)
                    .map_err(|source| Error::ResourceUnavailable {
                        resource: "key file",
                        source,
                    })?;
            }
            tracing::debug!(path = %key_file.display(), "Created key file");
        }

        let id = u8::try_from(project_id)
            .ok()
            .filter(|id| *id != 0 && id.is_ascii())
            .ok_or_else(|| Error::ResourceUnavailable {
                resource: "IPC key",
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("project id {project_id:?} is not a non-NUL ASCII character"),
                ),
            })?;

        let path = CString::new(key_file.as_os_str().as_bytes()).map_err(|e| {
            Error::ResourceUnavailable {
                resource: "IPC key",
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            }
        })?;

        #[allow(unsafe_code)]
        // SAFETY: `path` is a valid NUL-terminated string for the duration of the call.
        let key = unsafe { libc::ftok(path.as_ptr(), libc::c_int::from(id)) };
        if key == -1 {
            return Err(Error::resource("IPC key"));
        }

        tracing::debug!(key = format_args!("{key:#x}"), path = %key_file.display(), "Derived IPC key");
        Ok(Self(key))
    }

    /// The raw `key_t` value.
    #[must_use]
    pub const fn as_raw(self) -> libc::key_t {
        self.0
    }
}

impl fmt::Display for IpcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
