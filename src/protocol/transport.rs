//! Socket plumbing shared by TCP and Unix-domain peer connections.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::FrameCodec;

/// Boxed read half of a peer socket.
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a peer socket.
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// A peer socket: TCP for cross-host, Unix-domain for same-host.
#[derive(Debug)]
pub enum SocketStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl SocketStream {
    /// Split into boxed halves for independent send/recv tasks.
    #[must_use]
    pub fn into_split(self) -> (BoxedRead, BoxedWrite) {
        match self {
            Self::Tcp(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            Self::Unix(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        }
    }
}

impl AsyncRead for SocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Framed halves of one peer connection.
pub struct Connection {
    pub reader: FramedRead<BoxedRead, FrameCodec>,
    pub writer: FramedWrite<BoxedWrite, FrameCodec>,
}

impl Connection {
    /// Frame a freshly registered socket.
    #[must_use]
    pub fn new(stream: SocketStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: FramedRead::new(read, FrameCodec::new()),
            writer: FramedWrite::new(write, FrameCodec::new()),
        }
    }
}
