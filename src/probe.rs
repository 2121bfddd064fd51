//! Client-level readiness probing.
//!
//! The server has no health endpoint: it counts as ready once a client can
//! connect, complete the handshake and disconnect again. [`ReadinessProbe`] is
//! the seam for that connect operation; [`NatsProbe`] implements it with the
//! INFO / CONNECT / PING / PONG exchange.

use futures::StreamExt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, trace};

/// Longest protocol line the probe accepts from the server.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Where and how to connect for a readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub addr: SocketAddr,
    pub auth_token: Option<String>,
}

impl ProbeTarget {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }
}

/// Opens and immediately closes a client connection to a server.
pub trait ReadinessProbe: Send + Sync {
    fn probe(&self, target: &ProbeTarget) -> impl Future<Output = io::Result<()>> + Send;
}

/// Deliberate protocol faults for exercising failure paths in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFault {
    /// Treat the server's INFO line as unparseable.
    RejectInfo,
    /// Send CONNECT but never PING, so no PONG can arrive.
    WithholdPing,
}

/// Readiness probe speaking the NATS client handshake.
#[derive(Debug, Clone, Default)]
pub struct NatsProbe {
    fault: Option<ProbeFault>,
}

impl NatsProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a probe that injects `fault` into every handshake.
    pub fn with_fault(fault: ProbeFault) -> Self {
        Self { fault: Some(fault) }
    }

    fn connect_line(target: &ProbeTarget) -> String {
        let auth = target
            .auth_token
            .as_ref()
            .map(|token| format!(",\"auth_token\":\"{}\"", token))
            .unwrap_or_default();
        format!(
            "CONNECT {{\"verbose\":false,\"pedantic\":false,\"name\":\"natsfix-probe\"{}}}\r\n",
            auth
        )
    }

    async fn handshake(&self, target: &ProbeTarget) -> io::Result<()> {
        let stream = TcpStream::connect(target.addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        let info = next_line(&mut lines).await?;
        trace!("probe {} <- {}", target.addr, info);
        if !info.starts_with("INFO ") || self.fault == Some(ProbeFault::RejectInfo) {
            return Err(protocol_error(format!("unexpected greeting: {}", info)));
        }

        let mut handshake = Self::connect_line(target);
        if self.fault != Some(ProbeFault::WithholdPing) {
            handshake.push_str("PING\r\n");
        }
        write_half.write_all(handshake.as_bytes()).await?;

        loop {
            let line = next_line(&mut lines).await?;
            trace!("probe {} <- {}", target.addr, line);
            match line.as_str() {
                "PONG" => break,
                "PING" => write_half.write_all(b"PONG\r\n").await?,
                l if l.starts_with("-ERR") => return Err(protocol_error(l.to_string())),
                // +OK and async INFO updates
                _ => {}
            }
        }

        write_half.shutdown().await?;
        debug!("Readiness probe against {} succeeded", target.addr);
        Ok(())
    }
}

impl ReadinessProbe for NatsProbe {
    fn probe(&self, target: &ProbeTarget) -> impl Future<Output = io::Result<()>> + Send {
        self.handshake(target)
    }
}

async fn next_line<R>(lines: &mut FramedRead<R, LinesCodec>) -> io::Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines.next().await {
        Some(Ok(line)) => Ok(line),
        Some(Err(e)) => Err(protocol_error(e.to_string())),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "server closed the connection during the handshake",
        )),
    }
}

fn protocol_error(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
