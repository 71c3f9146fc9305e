//! Common test utilities for `Handoff` integration tests.
//!
//! Signal deliveries must never reach the test harness process: libtest runs
//! tests on several threads and only the thread that installed a
//! [`SignalRegistration`](handoff_core::sync::SignalRegistration) has the
//! signal blocked. Anything that exchanges signals runs in forked,
//! single-threaded children started with [`fork_child`].

#![allow(dead_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Duration;

use handoff_core::config::Config;
use handoff_core::sync::Backend;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &Path, path2: &Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1.len(), content2.len(), "File sizes differ");
    assert_eq!(content1, content2, "File contents differ");
}

/// Configuration with a private key file in `dir` and short timeouts.
///
/// The key file is created up front so both peers derive the same key.
pub fn test_config(dir: &Path, backend: Backend) -> Config {
    let key_file = create_test_file(dir, "keyfile.txt", b"Hello world\n");

    let mut config = Config::default();
    config.transfer.backend = backend;
    config.transfer.output = dir.join("recvfile");
    config.ipc.key_file = key_file;
    config.timeouts.peer_discovery = Duration::from_secs(10);
    config.timeouts.handshake = Duration::from_secs(10);
    config.timeouts.poll_interval = Duration::from_millis(5);
    config.timeouts.liveness_interval = Duration::from_millis(50);
    config
}

/// Run `body` in a forked child and return its pid.
///
/// The child exits with status 0 when `body` returns `Ok`, 1 otherwise
/// (including on panic). It never returns into the test harness.
#[allow(unsafe_code)]
pub fn fork_child<F>(body: F) -> Pid
where
    F: FnOnce() -> Result<(), String>,
{
    // SAFETY: the child only runs `body` and then calls _exit.
    match unsafe { fork() }.expect("fork failed") {
        ForkResult::Parent { child } => child,
        ForkResult::Child => {
            let status = match catch_unwind(AssertUnwindSafe(body)) {
                Ok(Ok(())) => 0,
                Ok(Err(message)) => {
                    eprintln!("child {}: {message}", std::process::id());
                    1
                }
                Err(_) => 2,
            };
            // SAFETY: skips the harness's atexit handlers and destructors.
            unsafe { libc::_exit(status) }
        }
    }
}

/// Wait for a forked child and return how it ended.
pub fn wait_child(pid: Pid) -> WaitStatus {
    waitpid(pid, None).expect("waitpid failed")
}

/// Assert that a forked child exited with status 0.
pub fn assert_child_succeeded(pid: Pid, what: &str) {
    match wait_child(pid) {
        WaitStatus::Exited(_, 0) => {}
        status => panic!("{what} failed: {status:?}"),
    }
}

/// Whether a System V segment still exists for `key`.
pub fn segment_exists(key: libc::key_t) -> bool {
    #[allow(unsafe_code)]
    // SAFETY: shmget without IPC_CREAT only looks the key up.
    let id = unsafe { libc::shmget(key, 0, 0) };
    id != -1
}
