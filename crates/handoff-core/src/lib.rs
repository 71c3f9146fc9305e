//! # Handoff Core Library
//!
//! `handoff-core` moves a byte stream from one process to another through a
//! single fixed-capacity System V shared memory segment, one chunk at a time,
//! with a strict turn-taking handshake deciding who may touch the buffer.
//!
//! ## Features
//!
//! - **Peer discovery**: the counterpart is found from the segment's
//!   last-attach pid, with bounded backoff
//! - **Two handshake backends**: a System V message queue or
//!   `SIGUSR1`/`SIGUSR2` notifications carrying the chunk length
//! - **Clean teardown**: resources are released exactly once, including on
//!   cancellation
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`discovery`] - Peer discovery through segment metadata
//! - [`error`] - Error types
//! - [`interrupt`] - `SIGINT`/`SIGTERM` cancellation
//! - [`ipc`] - Roles, ownership and IPC key derivation
//! - [`session`] - Session setup and teardown
//! - [`shm`] - The shared buffer
//! - [`sync`] - Handshake backends
//! - [`transfer`] - The chunk transfer protocol
//!
//! ## Example
//!
//! ```rust,ignore
//! use handoff_core::{config::Config, interrupt::CancelToken, ipc::Role, session::TransferSession};
//!
//! let config = Config::load()?;
//! let mut session = TransferSession::establish(&config, Role::Receiver, CancelToken::from_interrupts())?;
//! let mut output = std::fs::File::create(&config.transfer.output)?;
//! let report = session.receive(&mut output, |_| {})?;
//! println!("received {} bytes", report.bytes);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod interrupt;
pub mod ipc;
pub mod session;
pub mod shm;
pub mod sync;
pub mod transfer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default shared buffer capacity in bytes
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default output file for the receiver
pub const DEFAULT_OUTPUT: &str = "recvfile";

/// Default key file for IPC key derivation
pub const DEFAULT_KEY_FILE: &str = "keyfile.txt";

/// Default project id for IPC key derivation
pub const DEFAULT_PROJECT_ID: char = 'a';
