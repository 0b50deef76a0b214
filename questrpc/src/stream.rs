//! Framed byte-stream substrate.
//!
//! The protocol rides on any ordered full-duplex stream that delivers whole
//! frames; here that is a u32-big-endian length prefix over TCP or a unix
//! socket. Keepalive, upgrade handshakes and TLS are the substrate's
//! business, not the protocol's.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Upper bound on one frame; larger is a protocol violation.
pub const MAX_FRAME_BYTES: usize = 200_000_000;

/// A connected byte stream, either TCP or a unix domain socket.
///
/// Address formats follow the listener: `tcp:host:port` and
/// `unix:/path/to/socket`.
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    /// Connect to a server address.
    pub async fn connect(address: &str) -> io::Result<Stream> {
        if let Some(addr) = address.strip_prefix("tcp:") {
            Ok(Stream::Tcp(TcpStream::connect(addr).await?))
        } else if let Some(path) = address.strip_prefix("unix:") {
            #[cfg(unix)]
            {
                Ok(Stream::Unix(UnixStream::connect(path).await?))
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unix sockets unsupported on this platform",
                ))
            }
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid address={}", address),
            ))
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Reads whole length-prefixed frames. One read outstanding at a time.
pub struct FrameReader<R> {
    inner: R,
    max_frame: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            max_frame: MAX_FRAME_BYTES,
        }
    }

    /// Next frame, or `None` on clean EOF.
    pub async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut hdr = [0u8; 4];
        match self.inner.read_exact(&mut hdr).await {
            Ok(_) => {}
            // Peer closed between frames (or mid-header; either way the
            // stream is done).
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(hdr) as usize;
        if len > self.max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame len={} exceeds max={}", len, self.max_frame),
            ));
        }
        let mut frame = vec![0u8; len];
        self.inner.read_exact(&mut frame).await?;
        Ok(Some(frame))
    }
}

/// Writes whole length-prefixed frames.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        FrameWriter { inner }
    }

    pub async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if frame.len() > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame len={} exceeds max={}", frame.len(), MAX_FRAME_BYTES),
            ));
        }
        self.inner.write_all(&(frame.len() as u32).to_be_bytes()).await?;
        self.inner.write_all(frame).await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Split a stream into its framed halves.
pub fn framed<S>(stream: S) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(stream);
    (FrameReader::new(r), FrameWriter::new(w))
}
