//! Single-direction stream copy with an explicit outcome.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Which of the three relayed directions a copy serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Session input into subprocess stdin.
    Input,
    /// Subprocess stdout into the session's primary channel.
    Output,
    /// Subprocess stderr into the session's diagnostic channel.
    Diagnostics,
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
            Self::Diagnostics => write!(f, "diagnostics"),
        }
    }
}

/// How a direction ended.
#[derive(Debug)]
pub enum StreamEnd {
    /// The reader reached end-of-stream and everything was written.
    Eof,
    /// Reading or writing failed; the direction stopped there.
    Failed(io::Error),
}

/// Result of one direction: bytes delivered and how it ended.
#[derive(Debug)]
pub struct RelayOutcome {
    pub direction: StreamDirection,
    pub bytes: u64,
    pub end: StreamEnd,
}

impl RelayOutcome {
    pub const fn is_eof(&self) -> bool {
        matches!(self.end, StreamEnd::Eof)
    }
}

/// Copy `reader` into `writer` until end-of-stream or the first error.
///
/// `bytes` counts only data fully written. The writer is flushed on EOF and
/// dropped on return, which closes pipes such as a child's stdin.
pub async fn copy_stream<R, W>(direction: StreamDirection, mut reader: R, mut writer: W) -> RelayOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break StreamEnd::Eof,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break StreamEnd::Failed(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break StreamEnd::Failed(e);
        }
        bytes += n as u64;
    };

    let end = match end {
        StreamEnd::Eof => match writer.flush().await {
            Ok(()) => StreamEnd::Eof,
            Err(e) => StreamEnd::Failed(e),
        },
        failed => failed,
    };

    RelayOutcome {
        direction,
        bytes,
        end,
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn copies_everything_until_eof() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut out = Vec::new();

        let outcome = copy_stream(StreamDirection::Output, &data[..], &mut out).await;

        assert!(outcome.is_eof());
        assert_eq!(outcome.bytes, data.len() as u64);
        assert_eq!(outcome.direction, StreamDirection::Output);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn empty_reader_is_immediate_eof() {
        let mut out = Vec::new();
        let outcome = copy_stream(StreamDirection::Input, &b""[..], &mut out).await;
        assert!(outcome.is_eof());
        assert_eq!(outcome.bytes, 0);
    }

    #[tokio::test]
    async fn write_failure_ends_direction() {
        let outcome = copy_stream(StreamDirection::Diagnostics, &b"oops"[..], BrokenWriter).await;
        assert_eq!(outcome.bytes, 0);
        match outcome.end {
            StreamEnd::Failed(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            StreamEnd::Eof => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn dropping_writer_signals_eof_downstream() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let outcome = copy_stream(StreamDirection::Input, &b"abc"[..], writer).await;
        assert!(outcome.is_eof());

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"abc");
    }

    #[test]
    fn directions_display_lowercase() {
        assert_eq!(StreamDirection::Diagnostics.to_string(), "diagnostics");
    }
}
