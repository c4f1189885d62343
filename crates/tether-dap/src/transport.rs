//! Byte-stream transport to a debug-adapter server.
//!
//! A [`TransportChannel`] is a duplex byte stream obtained either from a TCP
//! socket (after the readiness monitor resolved) or from a spawned process's
//! standard streams. A channel is owned by exactly one session and never
//! shared.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, ChildStdout};

use crate::error::{SessionError, SessionResult};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Observer for the trace decorator. Receives every byte read from and
/// written to the peer, without affecting the data itself.
pub trait TraceSink: Send + Sync {
    fn bytes_read(&self, bytes: &[u8]);
    fn bytes_written(&self, bytes: &[u8]);
}

pub struct TransportChannel {
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
}

impl TransportChannel {
    /// Connect to an adapter listening on the loopback interface. Fails with
    /// a connection error when the port is not accepting connections, so
    /// callers must only invoke this after readiness resolved.
    pub async fn open_socket(port: u16) -> SessionResult<Self> {
        Self::open_socket_addr(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await
    }

    pub async fn open_socket_addr(addr: SocketAddr) -> SessionResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(SessionError::Connection)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_streams(reader, writer))
    }

    /// Wire the channel directly to a spawned adapter's standard streams.
    pub fn open_process_streams(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self::from_streams(stdout, stdin)
    }

    pub fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Some(Box::new(reader)),
            writer: Some(Box::new(writer)),
        }
    }

    /// Decorate the channel so every byte in both directions is mirrored to
    /// `sink`. The peer sees the exact same bytes.
    pub fn with_trace(mut self, sink: Arc<dyn TraceSink>) -> Self {
        if let (Some(reader), Some(writer)) = (self.reader.take(), self.writer.take()) {
            self.reader = Some(Box::new(TraceReader {
                inner: reader,
                sink: Arc::clone(&sink),
            }));
            self.writer = Some(Box::new(TraceWriter { inner: writer, sink }));
        }
        self
    }

    /// Release both directions. Best-effort and idempotent: a failure to
    /// shut down the write half still releases the read half.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.shutdown().await {
                tracing::debug!(target: "tether.transport", "shutdown failed: {err}");
            }
        }
        // Dropping the read half closes it (and, for sockets, the socket
        // once both halves are gone).
        self.reader.take();
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }

    /// Split into the raw halves for the protocol client. Fails once the
    /// channel has been closed.
    pub fn into_parts(mut self) -> io::Result<(BoxedReader, BoxedWriter)> {
        match (self.reader.take(), self.writer.take()) {
            (Some(reader), Some(writer)) => Ok((reader, writer)),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport channel is closed",
            )),
        }
    }
}

struct TraceReader {
    inner: BoxedReader,
    sink: Arc<dyn TraceSink>,
}

impl AsyncRead for TraceReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let me = &mut *self;
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                me.sink.bytes_read(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

struct TraceWriter {
    inner: BoxedWriter,
    sink: Arc<dyn TraceSink>,
}

impl AsyncWrite for TraceWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;
        match Pin::new(&mut me.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                me.sink.bytes_written(&buf[..written]);
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct RecordingSink {
        read: Mutex<Vec<u8>>,
        written: Mutex<Vec<u8>>,
    }

    impl TraceSink for RecordingSink {
        fn bytes_read(&self, bytes: &[u8]) {
            self.read.lock().extend_from_slice(bytes);
        }
        fn bytes_written(&self, bytes: &[u8]) {
            self.written.lock().extend_from_slice(bytes);
        }
    }

    #[tokio::test]
    async fn trace_decorator_mirrors_without_altering_bytes() {
        let (client_side, mut server_side) = tokio::io::duplex(256);
        let (read_half, write_half) = tokio::io::split(client_side);

        let sink = Arc::new(RecordingSink::default());
        let channel = TransportChannel::from_streams(read_half, write_half)
            .with_trace(Arc::clone(&sink) as Arc<dyn TraceSink>);
        let (mut reader, mut writer) = channel.into_parts().unwrap();

        writer.write_all(b"ping").await.unwrap();
        writer.flush().await.unwrap();
        let mut on_wire = [0u8; 4];
        server_side.read_exact(&mut on_wire).await.unwrap();
        assert_eq!(&on_wire, b"ping");

        server_side.write_all(b"pong!").await.unwrap();
        let mut received = [0u8; 5];
        reader.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"pong!");

        assert_eq!(sink.written.lock().as_slice(), b"ping");
        assert_eq!(sink.read.lock().as_slice(), b"pong!");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_use() {
        let (client_side, _server_side) = tokio::io::duplex(64);
        let (read_half, write_half) = tokio::io::split(client_side);
        let mut channel = TransportChannel::from_streams(read_half, write_half);

        channel.close().await;
        assert!(channel.is_closed());
        channel.close().await;
        assert!(channel.is_closed());

        let err = channel.into_parts().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn open_socket_fails_when_nothing_listens() {
        // Bind to grab a port that is then released again.
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        match TransportChannel::open_socket(port).await {
            Err(SessionError::Connection(_)) => {}
            other => panic!("expected connection error, got {:?}", other.map(|_| ())),
        }
    }
}
