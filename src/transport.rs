//! Framed duplex message channel over one TCP connection.
//!
//! Every frame carries a kind tag (text, binary, close) in its header, so
//! control messages and archive bytes never need content sniffing. The read
//! half and the write half are split so that a receive loop and a send path
//! can run as independent tasks; the write half is the only writer.

use crate::error::{DeployError, Result};
use crate::protocol::timeouts::{read_deadline_ms, write_deadline_ms, CONNECT_MS};
use crate::protocol::{frame, ControlMessage};
use crate::protocol_core::{build_frame_header, parse_frame_header, validate_frame_size, FRAME_HEADER_LEN};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

/// One inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

pub struct MessageReader<R = OwnedReadHalf> {
    inner: R,
}

pub struct MessageWriter<W = OwnedWriteHalf> {
    inner: W,
    closed: bool,
}

/// Split a connected stream into its two halves
pub fn split(stream: TcpStream) -> (MessageReader, MessageWriter) {
    let _ = stream.set_nodelay(true);
    let (r, w) = stream.into_split();
    (MessageReader::new(r), MessageWriter::new(w))
}

pub async fn connect(addr: &str) -> Result<(MessageReader, MessageWriter)> {
    let stream = match timeout(Duration::from_millis(CONNECT_MS), TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(DeployError::connection(format!("connect {}", addr), e)),
        Err(_) => {
            return Err(DeployError::connection(
                format!("connect {}", addr),
                io::Error::new(io::ErrorKind::TimedOut, format!("timeout ({} ms)", CONNECT_MS)),
            ))
        }
    };
    Ok(split(stream))
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Wait for the next frame. Blocks until data arrives; `None` means the
    /// peer closed the stream at a frame boundary.
    pub async fn next(&mut self) -> Result<Option<Message>> {
        let mut hdr = [0u8; FRAME_HEADER_LEN];
        // Only an EOF before the first header byte is an orderly close
        loop {
            match self.inner.read(&mut hdr[..1]).await {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DeployError::connection("read frame header", e)),
            }
        }
        self.inner
            .read_exact(&mut hdr[1..])
            .await
            .map_err(|e| DeployError::connection("read frame header", e))?;
        let (kind, len) = parse_frame_header(&hdr)?;
        let len = len as usize;

        let mut payload = vec![0u8; len];
        if len > 0 {
            let ms = read_deadline_ms(len);
            match timeout(Duration::from_millis(ms), self.inner.read_exact(&mut payload)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(DeployError::connection("read frame payload", e)),
                Err(_) => {
                    return Err(DeployError::connection(
                        "read frame payload",
                        io::Error::new(io::ErrorKind::TimedOut, format!("timeout ({} ms)", ms)),
                    ))
                }
            }
        }

        match kind {
            frame::TEXT => String::from_utf8(payload)
                .map(|t| Some(Message::Text(t)))
                .map_err(|_| DeployError::protocol("text frame is not valid UTF-8")),
            frame::BINARY => Ok(Some(Message::Binary(payload))),
            frame::CLOSE => Ok(Some(Message::Close)),
            other => Err(DeployError::protocol(format!("unknown frame kind: {}", other))),
        }
    }
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    async fn write_frame(&mut self, kind: u8, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(DeployError::ConnectionClosed);
        }
        validate_frame_size(payload.len())?;
        let ms = write_deadline_ms(payload.len());
        let hdr = build_frame_header(kind, payload.len() as u32);
        let write = async {
            self.inner.write_all(&hdr).await?;
            if !payload.is_empty() {
                self.inner.write_all(payload).await?;
            }
            self.inner.flush().await
        };
        match timeout(Duration::from_millis(ms), write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DeployError::connection("write frame", e)),
            Err(_) => Err(DeployError::connection(
                "write frame",
                io::Error::new(io::ErrorKind::TimedOut, format!("timeout ({} ms)", ms)),
            )),
        }
    }

    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.write_frame(frame::TEXT, text.as_bytes()).await
    }

    pub async fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.write_frame(frame::BINARY, data).await
    }

    pub async fn send_control(&mut self, msg: &ControlMessage) -> Result<()> {
        self.send_text(&msg.to_string()).await
    }

    /// Send a close frame and shut the write side down. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let sent = self.write_frame(frame::CLOSE, &[]).await;
        self.closed = true;
        let _ = self.inner.shutdown().await;
        sent
    }
}
