//! TCP link to a companion radio.
//!
//! Frames are exchanged over a plain TCP socket with a 2-byte little-endian
//! length prefix. The transport owns only the socket plumbing; frame
//! interpretation lives in [`super::protocol`].

use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Largest frame we will accept from the radio. Companion frames are small;
/// anything beyond this indicates a desynchronized stream.
const MAX_FRAME_LEN: usize = 4096;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Writing half of the radio link, usable independently of the read loop.
pub struct FrameWriter {
    inner: OwnedWriteHalf,
}

impl FrameWriter {
    /// Send one frame with its length prefix.
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        if frame.is_empty() || frame.len() > MAX_FRAME_LEN {
            bail!("outbound frame has invalid size: {} bytes", frame.len());
        }
        let len = (frame.len() as u16).to_le_bytes();
        self.inner
            .write_all(&len)
            .await
            .context("writing frame length")?;
        self.inner
            .write_all(frame)
            .await
            .context("writing frame body")?;
        self.inner.flush().await.context("flushing frame")?;
        debug!("tx frame: {} bytes, code {:#04x}", frame.len(), frame[0]);
        Ok(())
    }
}

/// Reading half of the radio link.
pub struct FrameReader {
    inner: OwnedReadHalf,
}

impl FrameReader {
    /// Receive one frame, blocking until a full frame arrives.
    ///
    /// Returns `Ok(None)` on clean EOF.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 2];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("reading frame length"),
        }
        let len = u16::from_le_bytes(len_buf) as usize;
        if len == 0 {
            warn!("zero-length frame from radio, skipping");
            return Ok(Some(Vec::new()));
        }
        if len > MAX_FRAME_LEN {
            bail!("inbound frame length {len} exceeds maximum, stream desynchronized");
        }
        let mut frame = vec![0u8; len];
        self.inner
            .read_exact(&mut frame)
            .await
            .context("reading frame body")?;
        Ok(Some(frame))
    }
}

/// Open a TCP connection to the radio and split it into framed halves.
pub async fn connect(host: &str, port: u16) -> Result<(FrameReader, FrameWriter)> {
    let addr = format!("{host}:{port}");
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .with_context(|| format!("connection to {addr} timed out"))?
        .with_context(|| format!("connecting to {addr}"))?;
    stream.set_nodelay(true).context("setting TCP_NODELAY")?;
    let (read_half, write_half) = stream.into_split();
    Ok((
        FrameReader { inner: read_half },
        FrameWriter { inner: write_half },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_roundtrip_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut reader = FrameReader { inner: read_half };
            let mut writer = FrameWriter { inner: write_half };
            let frame = reader.recv().await.unwrap().unwrap();
            writer.send(&frame).await.unwrap();
        });

        let (mut reader, mut writer) = connect("127.0.0.1", addr.port()).await.unwrap();
        writer.send(&[0x01, 0xaa, 0xbb]).await.unwrap();
        let echoed = reader.recv().await.unwrap().unwrap();
        assert_eq!(echoed, vec![0x01, 0xaa, 0xbb]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        let (mut reader, _writer) = connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(reader.recv().await.unwrap().is_none());
        server.await.unwrap();
    }
}
