//! Bidirectional relay engine.
//!
//! [`relay`] pumps bytes between two duplex endpoints, one worker task per
//! direction. Whichever direction ends first (EOF or error) tears the whole
//! session down: the finished worker shuts down its destination, the other
//! worker is aborted, and both endpoints are dropped before `relay` returns.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinError;

/// Transfer buffer size per direction.
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// A duplex byte-stream endpoint a relay session can own.
pub trait Endpoint: AsyncRead + AsyncWrite + Send + 'static {}

impl<T> Endpoint for T where T: AsyncRead + AsyncWrite + Send + 'static {}

/// Direction of a copy worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the first endpoint to the second.
    AToB,
    /// From the second endpoint to the first.
    BToA,
}

/// Why a copy worker stopped.
#[derive(Debug)]
pub enum DirectionEnd {
    /// The source reached end of stream.
    Eof,
    /// Reading from the source failed.
    ReadFailed(io::Error),
    /// Writing to the destination failed.
    WriteFailed(io::Error),
    /// The worker task panicked or was cancelled.
    WorkerFailed(String),
}

impl fmt::Display for DirectionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectionEnd::Eof => write!(f, "end of stream"),
            DirectionEnd::ReadFailed(e) => write!(f, "read failed: {}", e),
            DirectionEnd::WriteFailed(e) => write!(f, "write failed: {}", e),
            DirectionEnd::WorkerFailed(reason) => write!(f, "worker failed: {}", reason),
        }
    }
}

impl From<JoinError> for DirectionEnd {
    fn from(e: JoinError) -> Self {
        DirectionEnd::WorkerFailed(e.to_string())
    }
}

/// Outcome of one relay session.
#[derive(Debug)]
pub struct RelayReport {
    /// Bytes delivered from the first endpoint to the second.
    pub a_to_b: u64,
    /// Bytes delivered from the second endpoint to the first.
    pub b_to_a: u64,
    /// The direction whose end closed the session.
    pub first: Direction,
    /// How that direction ended.
    pub end: DirectionEnd,
}

impl RelayReport {
    /// Returns true if the session ended on an orderly end of stream.
    pub fn is_clean(&self) -> bool {
        matches!(self.end, DirectionEnd::Eof)
    }
}

/// Relays bytes between `a` and `b` until either direction ends.
///
/// Returns after both workers have finished and both endpoints are closed.
pub async fn relay<A, B>(a: A, b: B) -> RelayReport
where
    A: Endpoint,
    B: Endpoint,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let a_to_b_bytes = Arc::new(AtomicU64::new(0));
    let b_to_a_bytes = Arc::new(AtomicU64::new(0));

    let mut a_to_b = tokio::spawn(copy_one_way(a_read, b_write, Arc::clone(&a_to_b_bytes)));
    let mut b_to_a = tokio::spawn(copy_one_way(b_read, a_write, Arc::clone(&b_to_a_bytes)));

    // Dropping a JoinHandle does not cancel the task, so the loser is aborted
    // explicitly and then awaited.
    let (first, end) = tokio::select! {
        result = &mut a_to_b => {
            b_to_a.abort();
            let _ = b_to_a.await;
            (Direction::AToB, result.unwrap_or_else(DirectionEnd::from))
        }
        result = &mut b_to_a => {
            a_to_b.abort();
            let _ = a_to_b.await;
            (Direction::BToA, result.unwrap_or_else(DirectionEnd::from))
        }
    };

    RelayReport {
        a_to_b: a_to_b_bytes.load(Ordering::Relaxed),
        b_to_a: b_to_a_bytes.load(Ordering::Relaxed),
        first,
        end,
    }
}

/// Copies `reader` into `writer` chunk by chunk, then shuts `writer` down.
async fn copy_one_way<R, W>(mut reader: R, mut writer: W, copied: Arc<AtomicU64>) -> DirectionEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    let end = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break DirectionEnd::Eof,
            Ok(n) => n,
            Err(e) => break DirectionEnd::ReadFailed(e),
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            break DirectionEnd::WriteFailed(e);
        }
        if let Err(e) = writer.flush().await {
            break DirectionEnd::WriteFailed(e);
        }
        copied.fetch_add(n as u64, Ordering::Relaxed);
    };

    if let Err(e) = writer.shutdown().await {
        tracing::trace!(error = %e, "shutdown after copy failed");
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (mut a_outer, a_inner) = duplex(RELAY_BUFFER_SIZE);
        let (b_inner, mut b_outer) = duplex(RELAY_BUFFER_SIZE);
        let session = tokio::spawn(relay(a_inner, b_inner));

        a_outer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_outer.write_all(b"pong").await.unwrap();
        a_outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(a_outer);
        let report = tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.first, Direction::AToB);
        assert!(report.is_clean());
        assert_eq!(report.a_to_b, 4);
        assert_eq!(report.b_to_a, 4);
    }

    #[tokio::test]
    async fn test_large_payload_arrives_in_order() {
        let (mut a_outer, a_inner) = duplex(4096);
        let (b_inner, mut b_outer) = duplex(4096);
        let session = tokio::spawn(relay(a_inner, b_inner));

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            a_outer.write_all(&payload).await.unwrap();
            a_outer.shutdown().await.unwrap();
            a_outer
        });

        let mut received = Vec::new();
        b_outer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert!(received == expected, "payload corrupted or reordered");

        let _a_outer = writer.await.unwrap();
        let report = session.await.unwrap();
        assert_eq!(report.a_to_b, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_close_on_one_side_closes_the_other() {
        let (mut a_outer, a_inner) = duplex(1024);
        let (b_inner, b_outer) = duplex(1024);
        let session = tokio::spawn(relay(a_inner, b_inner));

        drop(b_outer);

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), a_outer.read(&mut buf))
            .await
            .expect("paired endpoint was not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);

        let report = tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .expect("relay did not return")
            .unwrap();
        assert_eq!(report.first, Direction::BToA);
    }

    #[tokio::test]
    async fn test_write_failure_ends_session() {
        let (mut a_outer, a_inner) = duplex(1024);
        let (b_inner, mut b_outer) = duplex(1024);

        // Keep b's write side open but stop reading, then drop it after the
        // relay has started so that forwarding into b fails.
        let session = tokio::spawn(relay(a_inner, b_inner));
        b_outer.shutdown().await.unwrap();
        drop(b_outer);

        let _ = a_outer.write_all(b"data nobody reads").await;

        let report = tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .expect("relay did not return")
            .unwrap();
        assert_eq!(report.a_to_b, 0);

        let mut buf = [0u8; 16];
        assert_eq!(a_outer.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[test]
    fn test_direction_end_display() {
        let end = DirectionEnd::WriteFailed(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(end.to_string(), "write failed: gone");
        assert_eq!(DirectionEnd::Eof.to_string(), "end of stream");
    }
}
