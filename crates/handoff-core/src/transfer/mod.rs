//! Chunk transfer protocol.
//!
//! Drives a byte stream through the shared buffer one chunk at a time:
//!
//! ```text
//! sender:   Idle → Reading → Sending → AwaitingAck → (Reading | Finished)
//! receiver: Idle → AwaitingFirstChunk → Writing → Acking → (AwaitingNextChunk | Done)
//! ```
//!
//! A chunk of length 0 is the terminator and the only way a transfer ends.
//! The sender does not wait for an acknowledgment of the terminator, and the
//! receiver never touches the buffer after seeing it. An input whose size is
//! a multiple of the capacity ends with a full chunk followed by a separate
//! terminator; an empty input produces the terminator alone.
//!
//! Both loops are written against [`Synchronizer`] only, so the backend is
//! chosen once by the session.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::interrupt::CancelToken;
use crate::ipc::Role;
use crate::shm::SharedBuffer;
use crate::sync::Synchronizer;

/// Sender side states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// Nothing read yet
    Idle,
    /// Filling the next chunk from the input
    Reading,
    /// Copying into the buffer and announcing it
    Sending,
    /// Waiting for the receiver to drain the buffer
    AwaitingAck,
    /// Terminator sent
    Finished,
}

/// Receiver side states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// Nothing received yet
    Idle,
    /// Waiting for the first announcement
    AwaitingFirstChunk,
    /// Copying a chunk to the output
    Writing,
    /// Handing the buffer back
    Acking,
    /// Waiting for the next announcement
    AwaitingNextChunk,
    /// Terminator seen
    Done,
}

/// State of either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Sender state machine
    Sender(SenderState),
    /// Receiver state machine
    Receiver(ReceiverState),
}

impl TransferState {
    /// Whether the state machine has reached its terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Sender(SenderState::Finished) | Self::Receiver(ReceiverState::Done)
        )
    }
}

/// Progress information for a transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Local role
    pub role: Role,
    /// Current state
    pub state: TransferState,
    /// Data chunks completed (the terminator is not counted)
    pub chunks: u64,
    /// Bytes handed over so far
    pub bytes_transferred: u64,
    /// Input size, when known up front
    pub total_bytes: Option<u64>,
    /// When the transfer loop started
    pub started_at: Instant,
}

impl TransferProgress {
    /// Create a new progress tracker.
    #[must_use]
    pub fn new(role: Role, total_bytes: Option<u64>) -> Self {
        let state = match role {
            Role::Sender => TransferState::Sender(SenderState::Idle),
            Role::Receiver => TransferState::Receiver(ReceiverState::Idle),
        };
        Self {
            role,
            state,
            chunks: 0,
            bytes_transferred: 0,
            total_bytes,
            started_at: Instant::now(),
        }
    }

    /// Overall progress as a percentage (0.0 - 100.0), if the total is known.
    #[must_use]
    pub fn percentage(&self) -> Option<f64> {
        self.total_bytes.map(|total| {
            if total == 0 {
                100.0
            } else {
                (self.bytes_transferred as f64 / total as f64) * 100.0
            }
        })
    }

    /// Time since the transfer loop started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn record_chunk(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes_transferred += len as u64;
    }

    fn report(&self) -> TransferReport {
        TransferReport {
            role: self.role,
            chunks: self.chunks,
            bytes: self.bytes_transferred,
            elapsed: self.elapsed(),
        }
    }
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    /// Local role
    pub role: Role,
    /// Data chunks moved (the terminator is not counted)
    pub chunks: u64,
    /// Total bytes moved
    pub bytes: u64,
    /// Wall time of the transfer loop
    pub elapsed: Duration,
}

/// Read until `buf` is full or the input is exhausted.
///
/// Returns fewer than `buf.len()` bytes only at end of stream.
fn fill<R>(input: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: Read + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Run the sender side until the terminator has been announced.
///
/// `observer` is called after every acknowledged chunk and once more when
/// the terminator has gone out.
///
/// # Errors
///
/// Any error aborts the transfer: a failed read is
/// [`Error::StreamIo`](crate::Error::StreamIo), synchronizer failures are
/// passed through, and a tripped `cancel` yields
/// [`Error::Cancelled`](crate::Error::Cancelled).
pub fn send_stream<S, R, F>(
    buffer: &mut SharedBuffer,
    sync: &mut S,
    input: &mut R,
    total_bytes: Option<u64>,
    cancel: &CancelToken,
    mut observer: F,
) -> Result<TransferReport>
where
    S: Synchronizer + ?Sized,
    R: Read + ?Sized,
    F: FnMut(&TransferProgress),
{
    let mut progress = TransferProgress::new(Role::Sender, total_bytes);
    let mut scratch = vec![0u8; buffer.capacity()];

    loop {
        cancel.check()?;

        progress.state = TransferState::Sender(SenderState::Reading);
        let len = fill(input, &mut scratch)?;

        progress.state = TransferState::Sender(SenderState::Sending);
        if len > 0 {
            buffer.write_chunk(&scratch[..len])?;
        }
        sync.notify_ready(len)?;

        if len == 0 {
            progress.state = TransferState::Sender(SenderState::Finished);
            observer(&progress);
            break;
        }

        progress.state = TransferState::Sender(SenderState::AwaitingAck);
        sync.wait_consumed()?;

        // The buffer is ours again; the next step is reading.
        progress.state = TransferState::Sender(SenderState::Reading);
        progress.record_chunk(len);
        tracing::debug!(chunk = progress.chunks, len, "Chunk acknowledged");
        observer(&progress);
    }

    tracing::info!(
        chunks = progress.chunks,
        bytes = progress.bytes_transferred,
        "Sent terminator"
    );
    Ok(progress.report())
}

/// Run the receiver side until the terminator arrives.
///
/// Every chunk is written to `output` before it is acknowledged, and the
/// output is flushed once the terminator has been seen.
///
/// # Errors
///
/// Any error aborts the transfer: a failed write is
/// [`Error::StreamIo`](crate::Error::StreamIo), synchronizer failures are
/// passed through, and a tripped `cancel` yields
/// [`Error::Cancelled`](crate::Error::Cancelled). Bytes already written are
/// left in `output`.
pub fn receive_stream<S, W, F>(
    buffer: &SharedBuffer,
    sync: &mut S,
    output: &mut W,
    cancel: &CancelToken,
    mut observer: F,
) -> Result<TransferReport>
where
    S: Synchronizer + ?Sized,
    W: Write + ?Sized,
    F: FnMut(&TransferProgress),
{
    let mut progress = TransferProgress::new(Role::Receiver, None);
    progress.state = TransferState::Receiver(ReceiverState::AwaitingFirstChunk);

    loop {
        cancel.check()?;

        let len = sync.wait_ready()?;
        if len == 0 {
            progress.state = TransferState::Receiver(ReceiverState::Done);
            break;
        }

        progress.state = TransferState::Receiver(ReceiverState::Writing);
        output.write_all(buffer.read_chunk(len)?)?;

        progress.state = TransferState::Receiver(ReceiverState::Acking);
        sync.notify_consumed()?;

        progress.state = TransferState::Receiver(ReceiverState::AwaitingNextChunk);
        progress.record_chunk(len);
        tracing::debug!(chunk = progress.chunks, len, "Chunk written");
        observer(&progress);
    }

    output.flush()?;
    observer(&progress);

    tracing::info!(
        chunks = progress.chunks,
        bytes = progress.bytes_transferred,
        "Received terminator"
    );
    Ok(progress.report())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::ipc::{IpcKey, Ownership};
    use crate::sync::Backend;
    use std::collections::VecDeque;

    const CAPACITY: usize = 1000;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Ready(usize),
        Consumed,
    }

    /// Plays the receiver for a sender under test: reads each announced chunk
    /// through its own attachment and records the call sequence.
    struct LoopbackReceiver {
        view: SharedBuffer,
        events: Vec<Event>,
        received: Vec<u8>,
        outstanding: bool,
        fail_ack_after: Option<usize>,
    }

    impl LoopbackReceiver {
        fn new(buffer: &SharedBuffer) -> Self {
            Self {
                view: SharedBuffer::attach(*buffer.segment(), Ownership::Attached).unwrap(),
                events: Vec::new(),
                received: Vec::new(),
                outstanding: false,
                fail_ack_after: None,
            }
        }

        fn chunk_lengths(&self) -> Vec<usize> {
            self.events
                .iter()
                .filter_map(|event| match event {
                    Event::Ready(len) => Some(*len),
                    Event::Consumed => None,
                })
                .collect()
        }
    }

    impl Synchronizer for LoopbackReceiver {
        fn backend(&self) -> Backend {
            Backend::Queue
        }

        fn notify_ready(&mut self, len: usize) -> Result<()> {
            assert!(!self.outstanding, "chunk announced before previous ack");
            self.events.push(Event::Ready(len));
            self.received.extend_from_slice(self.view.read_chunk(len)?);
            self.outstanding = len > 0;
            Ok(())
        }

        fn wait_ready(&mut self) -> Result<usize> {
            unreachable!("sender never waits for data")
        }

        fn notify_consumed(&mut self) -> Result<()> {
            unreachable!("sender never acknowledges")
        }

        fn wait_consumed(&mut self) -> Result<()> {
            assert!(self.outstanding, "ack awaited with nothing in flight");
            if self.fail_ack_after == Some(self.chunk_lengths().len()) {
                return Err(Error::PeerUnreachable {
                    pid: 1,
                    reason: "gone".to_string(),
                });
            }
            self.events.push(Event::Consumed);
            self.outstanding = false;
            Ok(())
        }
    }

    /// Plays the sender for a receiver under test: writes scripted chunks
    /// through its own attachment.
    struct ScriptedSender {
        view: SharedBuffer,
        chunks: VecDeque<Vec<u8>>,
        events: Vec<Event>,
        outstanding: bool,
    }

    impl ScriptedSender {
        fn new(buffer: &SharedBuffer, chunks: Vec<Vec<u8>>) -> Self {
            Self {
                view: SharedBuffer::attach(*buffer.segment(), Ownership::Attached).unwrap(),
                chunks: chunks.into(),
                events: Vec::new(),
                outstanding: false,
            }
        }
    }

    impl Synchronizer for ScriptedSender {
        fn backend(&self) -> Backend {
            Backend::Queue
        }

        fn notify_ready(&mut self, _len: usize) -> Result<()> {
            unreachable!("receiver never announces")
        }

        fn wait_ready(&mut self) -> Result<usize> {
            assert!(!self.outstanding, "data awaited before previous ack");
            let chunk = self.chunks.pop_front().expect("wait_ready after terminator");
            self.view.write_chunk(&chunk)?;
            self.events.push(Event::Ready(chunk.len()));
            self.outstanding = !chunk.is_empty();
            Ok(chunk.len())
        }

        fn notify_consumed(&mut self) -> Result<()> {
            assert!(self.outstanding, "ack without a chunk");
            self.events.push(Event::Consumed);
            self.outstanding = false;
            Ok(())
        }

        fn wait_consumed(&mut self) -> Result<()> {
            unreachable!("receiver never waits for acks")
        }
    }

    fn buffer() -> SharedBuffer {
        SharedBuffer::acquire(IpcKey::PRIVATE, CAPACITY, Ownership::Owner).unwrap()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn send(data: &[u8]) -> (TransferReport, LoopbackReceiver) {
        let mut buffer = buffer();
        let mut peer = LoopbackReceiver::new(&buffer);
        let report = send_stream(
            &mut buffer,
            &mut peer,
            &mut &data[..],
            Some(data.len() as u64),
            &CancelToken::new(),
            |_| {},
        )
        .unwrap();
        (report, peer)
    }

    #[test]
    fn test_chunk_boundaries() {
        let cases: [(usize, &[usize]); 5] = [
            (0, &[0]),
            (CAPACITY, &[CAPACITY, 0]),
            (CAPACITY + 1, &[CAPACITY, 1, 0]),
            (2 * CAPACITY, &[CAPACITY, CAPACITY, 0]),
            (2500, &[1000, 1000, 500, 0]),
        ];

        for (size, expected) in cases {
            let data = payload(size);
            let (report, peer) = send(&data);

            assert_eq!(peer.chunk_lengths(), expected, "size {size}");
            assert_eq!(peer.received, data, "size {size}");
            assert_eq!(report.bytes, size as u64);
            assert_eq!(report.chunks, expected.len() as u64 - 1);
        }
    }

    #[test]
    fn test_terminator_is_not_acknowledged() {
        let (_, peer) = send(&payload(1500));
        assert_eq!(
            peer.events,
            vec![
                Event::Ready(1000),
                Event::Consumed,
                Event::Ready(500),
                Event::Consumed,
                Event::Ready(0),
            ]
        );
    }

    #[test]
    fn test_short_reads_are_filled() {
        struct Trickle(Vec<u8>);

        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let n = buf.len().min(self.0.len()).min(7);
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0.drain(..n);
                Ok(n)
            }
        }

        let data = payload(2100);
        let mut buffer = buffer();
        let mut peer = LoopbackReceiver::new(&buffer);
        send_stream(
            &mut buffer,
            &mut peer,
            &mut Trickle(data.clone()),
            None,
            &CancelToken::new(),
            |_| {},
        )
        .unwrap();

        assert_eq!(peer.chunk_lengths(), vec![1000, 1000, 100, 0]);
        assert_eq!(peer.received, data);
    }

    #[test]
    fn test_read_failure_aborts() {
        struct Broken;

        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("disk on fire"))
            }
        }

        let mut buffer = buffer();
        let mut peer = LoopbackReceiver::new(&buffer);
        let result = send_stream(
            &mut buffer,
            &mut peer,
            &mut Broken,
            None,
            &CancelToken::new(),
            |_| {},
        );

        assert!(matches!(result, Err(Error::StreamIo(_))));
        assert!(peer.events.is_empty());
    }

    #[test]
    fn test_unreachable_peer_aborts_sender() {
        let data = payload(3000);
        let mut buffer = buffer();
        let mut peer = LoopbackReceiver::new(&buffer);
        peer.fail_ack_after = Some(2);

        let result = send_stream(
            &mut buffer,
            &mut peer,
            &mut &data[..],
            None,
            &CancelToken::new(),
            |_| {},
        );

        assert!(matches!(result, Err(Error::PeerUnreachable { .. })));
        assert_eq!(peer.chunk_lengths(), vec![1000, 1000]);
    }

    #[test]
    fn test_sender_progress() {
        let data = payload(2500);
        let mut buffer = buffer();
        let mut peer = LoopbackReceiver::new(&buffer);
        let mut seen = Vec::new();

        send_stream(
            &mut buffer,
            &mut peer,
            &mut &data[..],
            Some(2500),
            &CancelToken::new(),
            |progress| seen.push((progress.bytes_transferred, progress.state)),
        )
        .unwrap();

        assert_eq!(
            seen,
            vec![
                (1000, TransferState::Sender(SenderState::Reading)),
                (2000, TransferState::Sender(SenderState::Reading)),
                (2500, TransferState::Sender(SenderState::Reading)),
                (2500, TransferState::Sender(SenderState::Finished)),
            ]
        );
    }

    #[test]
    fn test_cancelled_sender_stops_before_next_chunk() {
        let data = payload(5000);
        let mut buffer = buffer();
        let mut peer = LoopbackReceiver::new(&buffer);
        let cancel = CancelToken::new();

        let result = send_stream(
            &mut buffer,
            &mut peer,
            &mut &data[..],
            None,
            &cancel,
            |progress| {
                if progress.chunks == 2 {
                    cancel.cancel();
                }
            },
        );

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(peer.chunk_lengths(), vec![1000, 1000]);
    }

    #[test]
    fn test_receiver_writes_chunks_in_order() {
        let data = payload(2500);
        let chunks = vec![
            data[..1000].to_vec(),
            data[1000..2000].to_vec(),
            data[2000..].to_vec(),
            Vec::new(),
        ];
        let buffer = buffer();
        let mut peer = ScriptedSender::new(&buffer, chunks);
        let mut output = Vec::new();

        let report =
            receive_stream(&buffer, &mut peer, &mut output, &CancelToken::new(), |_| {}).unwrap();

        assert_eq!(output, data);
        assert_eq!(report.chunks, 3);
        assert_eq!(report.bytes, 2500);
        assert_eq!(report.role, Role::Receiver);
        assert_eq!(
            peer.events,
            vec![
                Event::Ready(1000),
                Event::Consumed,
                Event::Ready(1000),
                Event::Consumed,
                Event::Ready(500),
                Event::Consumed,
                Event::Ready(0),
            ]
        );
    }

    #[test]
    fn test_receiver_stops_at_first_terminator() {
        let buffer = buffer();
        let mut peer = ScriptedSender::new(
            &buffer,
            vec![b"abc".to_vec(), Vec::new(), b"never".to_vec()],
        );
        let mut output = Vec::new();

        receive_stream(&buffer, &mut peer, &mut output, &CancelToken::new(), |_| {}).unwrap();

        assert_eq!(output, b"abc");
        assert_eq!(peer.chunks.len(), 1);
    }

    #[test]
    fn test_receiver_empty_transfer() {
        let buffer = buffer();
        let mut peer = ScriptedSender::new(&buffer, vec![Vec::new()]);
        let mut output = Vec::new();
        let mut states = Vec::new();

        let report = receive_stream(
            &buffer,
            &mut peer,
            &mut output,
            &CancelToken::new(),
            |progress| states.push(progress.state),
        )
        .unwrap();

        assert!(output.is_empty());
        assert_eq!(report.chunks, 0);
        assert_eq!(states, vec![TransferState::Receiver(ReceiverState::Done)]);
        assert_eq!(peer.events, vec![Event::Ready(0)]);
    }

    #[test]
    fn test_receiver_progress() {
        let buffer = buffer();
        let mut peer = ScriptedSender::new(&buffer, vec![b"abc".to_vec(), b"de".to_vec(), Vec::new()]);
        let mut output = Vec::new();
        let mut seen = Vec::new();

        receive_stream(
            &buffer,
            &mut peer,
            &mut output,
            &CancelToken::new(),
            |progress| seen.push((progress.bytes_transferred, progress.state)),
        )
        .unwrap();

        assert_eq!(output, b"abcde");
        assert_eq!(
            seen,
            vec![
                (3, TransferState::Receiver(ReceiverState::AwaitingNextChunk)),
                (5, TransferState::Receiver(ReceiverState::AwaitingNextChunk)),
                (5, TransferState::Receiver(ReceiverState::Done)),
            ]
        );
    }

    #[test]
    fn test_write_failure_aborts_without_ack() {
        struct Full;

        impl Write for Full {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::StorageFull, "no space"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let buffer = buffer();
        let mut peer = ScriptedSender::new(&buffer, vec![b"data".to_vec(), Vec::new()]);

        let result = receive_stream(&buffer, &mut peer, &mut Full, &CancelToken::new(), |_| {});

        assert!(matches!(result, Err(Error::StreamIo(_))));
        assert_eq!(peer.events, vec![Event::Ready(4)]);
    }

    #[test]
    fn test_percentage() {
        let mut progress = TransferProgress::new(Role::Sender, Some(2000));
        assert_eq!(progress.percentage(), Some(0.0));
        progress.record_chunk(500);
        assert_eq!(progress.percentage(), Some(25.0));

        assert_eq!(TransferProgress::new(Role::Sender, Some(0)).percentage(), Some(100.0));
        assert_eq!(TransferProgress::new(Role::Receiver, None).percentage(), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransferState::Sender(SenderState::Finished).is_terminal());
        assert!(TransferState::Receiver(ReceiverState::Done).is_terminal());
        assert!(!TransferState::Receiver(ReceiverState::Writing).is_terminal());
    }
}
