//! Control channel used for pair coordination.
//!
//! A [`ControlChannel`] is an ordered, reliable, duplex message pipe between
//! exactly two endpoints. The reactive side binds and waits for the single
//! connection, the initiating side connects. Every message is framed as a
//! 4-byte big-endian length header followed by the payload.
//!
//! `send` only enqueues: a background task owns the write half and flushes
//! frames in order. `recv` waits for the next complete frame.

use std::{io::ErrorKind, net::SocketAddr, time::Duration};

use log::{debug, info, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedReadHalf, TcpListener, TcpStream},
    sync::mpsc,
    time::Instant,
};
use xfer_error::{BenchError, Result};

/// Largest payload accepted in one frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

pub struct ControlChannel {
    remote_addr: SocketAddr,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    reader: Option<OwnedReadHalf>,
}

impl ControlChannel {
    /// Binds `addr` and waits for the remote endpoint to connect.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            BenchError::Setup(format!(
                "Failed to bind control channel on {}: {}",
                addr, e
            ))
        })?;
        debug!("Control channel listening on {}", addr);

        let (stream, remote_addr) =
            listener.accept().await.map_err(|e| {
                BenchError::Setup(format!(
                    "Failed to accept control connection on {}: {}",
                    addr, e
                ))
            })?;
        info!("Control channel on {} accepted {}", addr, remote_addr);
        Ok(Self::from_stream(stream, remote_addr))
    }

    /// Connects to a bound endpoint.
    ///
    /// The listener may not exist yet when both sides start together, so
    /// a refused connection is tried again until `timeout` elapses. Any
    /// other failure is returned at once.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let remote_addr = stream.peer_addr()?;
                    info!("Control channel connected to {}", remote_addr);
                    return Ok(Self::from_stream(stream, remote_addr));
                }
                Err(e)
                    if e.kind() == ErrorKind::ConnectionRefused
                        && Instant::now() < deadline =>
                {
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(BenchError::Setup(format!(
                        "Failed to connect control channel to {}: {}",
                        addr, e
                    )));
                }
            }
        }
    }

    fn from_stream(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Could not disable Nagle on {}: {}", remote_addr, e);
        }
        let (reader, mut writer) = stream.into_split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            while let Some(payload) = queue.recv().await {
                let mut frame = Vec::with_capacity(4 + payload.len());
                frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                frame.extend_from_slice(&payload);
                if let Err(e) = writer.write_all(&frame).await {
                    warn!("Control channel to {} dropped: {}", remote_addr, e);
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        Self {
            remote_addr,
            outbound: Some(outbound),
            reader: Some(reader),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_none()
    }

    /// Queues one message for delivery. Never waits on the network.
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > MAX_FRAME_LEN {
            return Err(BenchError::ProtocolDesync(format!(
                "Message of {} bytes exceeds the {} byte frame limit",
                payload.len(),
                MAX_FRAME_LEN
            )));
        }
        self.outbound
            .as_ref()
            .ok_or_else(|| {
                BenchError::Setup("Control channel is closed".to_string())
            })?
            .send(payload)
            .map_err(|_| {
                BenchError::Setup(format!(
                    "Control channel writer to {} stopped",
                    self.remote_addr
                ))
            })
    }

    /// Waits for the next message from the remote endpoint.
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        let remote_addr = self.remote_addr;
        let reader = self.reader.as_mut().ok_or_else(|| {
            BenchError::Setup("Control channel is closed".to_string())
        })?;

        let mut header = [0u8; 4];
        reader
            .read_exact(&mut header)
            .await
            .map_err(|e| Self::read_error(remote_addr, e))?;
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(BenchError::ProtocolDesync(format!(
                "Frame of {} bytes from {} exceeds the {} byte limit",
                len, remote_addr, MAX_FRAME_LEN
            )));
        }

        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| Self::read_error(remote_addr, e))?;
        Ok(payload)
    }

    /// Releases the transport. Queued messages are flushed on a best
    /// effort basis. Safe to call more than once.
    pub fn close(&mut self) {
        if self.outbound.take().is_some() {
            debug!("Closing control channel to {}", self.remote_addr);
        }
        self.reader = None;
    }

    fn read_error(remote_addr: SocketAddr, e: std::io::Error) -> BenchError {
        if e.kind() == ErrorKind::UnexpectedEof {
            BenchError::Setup(format!(
                "Control channel closed by {}",
                remote_addr
            ))
        } else {
            BenchError::Setup(format!(
                "Control channel read from {} failed: {}",
                remote_addr, e
            ))
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.close();
    }
}
