//! Data stream multiplexer.
//!
//! Streams are numbered logical pipes carried inside a session's secure
//! channel. Each side allocates ports of its own parity (client odd,
//! server even), a frame carries at most one buffer's worth of bytes, and
//! a zero-length frame closes the stream.
//!
//! The read side is a single-slot pipe: the session's read loop cannot
//! deposit a second frame until the consumer has drained the first, which
//! gives per-stream backpressure all the way down to the channel.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Size of a stream's read buffer; also the largest single write (8 KiB).
pub const DATA_STREAM_BUFFER: usize = 8192;

/// Default bound on a blocking [`DataStream::read`].
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on the session feeding a frame into a stream's buffer.
pub const FEED_TIMEOUT: Duration = Duration::from_secs(30);

/// Emits framed packets on behalf of a stream; implemented by the session.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one data frame to `port`. An empty payload closes the stream.
    async fn send_data_frame(&self, port: u16, payload: &[u8]) -> Result<()>;
}

/// Port parity per handshake role: the dialling side opens odd ports,
/// the accepting side even ones, so concurrent allocations never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortParity {
    /// Odd ports.
    Client,
    /// Even ports.
    Server,
}

/// Allocates the next free port of the owner's parity.
#[derive(Debug)]
pub struct PortAllocator {
    last_port: u16,
    parity: PortParity,
}

impl PortAllocator {
    /// New allocator for the given parity.
    pub fn new(parity: PortParity) -> Self {
        let last_port = match parity {
            PortParity::Client => 1,
            PortParity::Server => 0,
        };
        Self { last_port, parity }
    }

    /// Pick the next free port: `last_port += 2`, wrapping near the top
    /// of the range back to the parity base. Port 0 is never returned.
    pub fn next_free(&mut self, in_use: &HashSet<u16>) -> Result<u16> {
        let start = self.last_port;
        loop {
            self.last_port = if self.last_port >= u16::MAX - 3 {
                match self.parity {
                    PortParity::Client => 1,
                    PortParity::Server => 0,
                }
            } else {
                self.last_port + 2
            };

            if self.last_port != 0 && !in_use.contains(&self.last_port) {
                return Ok(self.last_port);
            }
            if self.last_port == start {
                return Err(Error::Policy("no free data stream ports".into()));
            }
        }
    }
}

/// Create the feeder/consumer pair for a stream on `port`.
///
/// The returned sender is registered in the session's stream table; the
/// session deposits one frame at a time with [`FEED_TIMEOUT`].
pub fn stream_pair(
    port: u16,
    sink: Arc<dyn FrameSink>,
) -> (mpsc::Sender<Vec<u8>>, DataStream) {
    let (tx, rx) = mpsc::channel(1);
    (
        tx,
        DataStream {
            port,
            sink,
            rx,
            pending: Vec::new(),
            pending_offset: 0,
            eof: false,
            write_closed: false,
            read_timeout: READ_TIMEOUT,
        },
    )
}

/// A duplex byte pipe multiplexed inside a session.
///
/// Half-duplex from each side's perspective: one in-flight read and one
/// in-flight write at a time, but reading and writing do not block each
/// other across the two endpoints.
pub struct DataStream {
    port: u16,
    sink: Arc<dyn FrameSink>,
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pending_offset: usize,
    eof: bool,
    write_closed: bool,
    read_timeout: Duration,
}

impl DataStream {
    /// The stream's port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Override the read timeout (default 60 s).
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Read bytes into `buf`.
    ///
    /// Blocks until data is available, the stream is closed (returns 0),
    /// or the read timeout elapses ([`Error::Timeout`], distinct from
    /// orderly close).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.pending_offset >= self.pending.len() {
            if self.eof {
                return Ok(0);
            }

            let frame = tokio::time::timeout(self.read_timeout, self.rx.recv())
                .await
                .map_err(|_| Error::Timeout)?
                .ok_or(Error::NoSession)?;

            if frame.is_empty() {
                self.eof = true;
                return Ok(0);
            }
            self.pending = frame;
            self.pending_offset = 0;
        }

        let n = buf.len().min(self.pending.len() - self.pending_offset);
        buf[..n].copy_from_slice(&self.pending[self.pending_offset..self.pending_offset + n]);
        self.pending_offset += n;
        Ok(n)
    }

    /// Write `buf` as exactly one framed packet.
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.write_closed {
            return Err(Error::Policy("stream is closed for writing".into()));
        }
        if buf.is_empty() {
            return Ok(());
        }
        if buf.len() > DATA_STREAM_BUFFER {
            return Err(Error::Policy(format!(
                "write exceeds stream buffer size ({} > {DATA_STREAM_BUFFER})",
                buf.len()
            )));
        }
        self.sink.send_data_frame(self.port, buf).await
    }

    /// Close the write direction by emitting a zero-length frame.
    pub async fn close(&mut self) -> Result<()> {
        if !self.write_closed {
            self.write_closed = true;
            self.sink.send_data_frame(self.port, &[]).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStream")
            .field("port", &self.port)
            .field("eof", &self.eof)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    /// Records frames instead of sending them anywhere.
    struct RecordingSink {
        frames: Mutex<Vec<(u16, Vec<u8>)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_data_frame(&self, port: u16, payload: &[u8]) -> Result<()> {
            self.frames.lock().await.push((port, payload.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn test_port_parity() {
        let used = HashSet::new();
        let mut client = PortAllocator::new(PortParity::Client);
        let mut server = PortAllocator::new(PortParity::Server);

        for _ in 0..64 {
            assert_eq!(client.next_free(&used).unwrap() % 2, 1);
            assert_eq!(server.next_free(&used).unwrap() % 2, 0);
        }
    }

    #[test]
    fn test_allocator_skips_used_ports() {
        let mut allocator = PortAllocator::new(PortParity::Server);
        let used: HashSet<u16> = [2u16, 4].into_iter().collect();
        assert_eq!(allocator.next_free(&used).unwrap(), 6);
    }

    #[test]
    fn test_allocator_wraps_preserving_parity() {
        let mut allocator = PortAllocator::new(PortParity::Client);
        allocator.last_port = u16::MAX - 4;
        let used = HashSet::new();
        assert_eq!(allocator.next_free(&used).unwrap(), u16::MAX - 2);
        // Past the wrap threshold: back to the parity base, then +2.
        assert_eq!(allocator.next_free(&used).unwrap() % 2, 1);
        assert!(allocator.next_free(&used).unwrap() < 16);
    }

    #[tokio::test]
    async fn test_read_after_feed() {
        let sink = RecordingSink::new();
        let (tx, mut stream) = stream_pair(3, sink);

        tx.send(b"hello".to_vec()).await.expect("feed");

        let mut buf = [0u8; 3];
        assert_eq!(stream.read(&mut buf).await.expect("read"), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(stream.read(&mut buf).await.expect("read"), 2);
        assert_eq!(&buf[..2], b"lo");
    }

    #[tokio::test]
    async fn test_close_semantics() {
        let sink = RecordingSink::new();
        let (tx, mut stream) = stream_pair(3, sink);

        // Data queued ahead of the close frame is read first; only then
        // does the stream report end-of-stream. The single-slot buffer
        // means the feeder deposits the close frame after the drain.
        let feeder = tokio::spawn(async move {
            tx.send(b"tail".to_vec()).await.expect("feed");
            tx.send(Vec::new()).await.expect("close frame");
        });

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.expect("read"), 4);
        assert_eq!(stream.read(&mut buf).await.expect("read"), 0);
        assert_eq!(stream.read(&mut buf).await.expect("read"), 0);
        feeder.await.expect("feeder");
    }

    #[tokio::test]
    async fn test_read_timeout_distinct_from_close() {
        let sink = RecordingSink::new();
        let (_tx, mut stream) = stream_pair(3, sink);
        stream.set_read_timeout(Duration::from_millis(20));

        let mut buf = [0u8; 4];
        match stream.read(&mut buf).await {
            Err(Error::Timeout) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_slot_backpressure() {
        let sink = RecordingSink::new();
        let (tx, mut stream) = stream_pair(3, sink);

        tx.send(b"one".to_vec()).await.expect("feed");
        // Second deposit must wait for the consumer.
        let blocked = tokio::time::timeout(
            Duration::from_millis(20),
            tx.send(b"two".to_vec()),
        )
        .await;
        assert!(blocked.is_err(), "second frame should not fit");

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.expect("read"), 3);
        tx.send(b"two".to_vec()).await.expect("feed after drain");
        assert_eq!(stream.read(&mut buf).await.expect("read"), 3);
        assert_eq!(&buf[..3], b"two");
    }

    #[tokio::test]
    async fn test_write_emits_one_frame_and_close_is_empty() {
        let sink = RecordingSink::new();
        let (_tx, mut stream) = stream_pair(5, sink.clone());

        stream.write(b"payload").await.expect("write");
        stream.close().await.expect("close");
        stream.close().await.expect("idempotent close");
        assert!(stream.write(b"late").await.is_err());

        let frames = sink.frames.lock().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], (5, b"payload".to_vec()));
        assert_eq!(frames[1], (5, Vec::new()));
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let sink = RecordingSink::new();
        let (_tx, mut stream) = stream_pair(5, sink);
        let big = vec![0u8; DATA_STREAM_BUFFER + 1];
        assert!(matches!(stream.write(&big).await, Err(Error::Policy(_))));
    }
}
