//! Bind/detect handshake responder.
//!
//! Slicers probe this plain-TCP service before trusting a printer. Each
//! connection carries exactly one request frame and gets at most one reply.

pub mod frame;

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vprinter_core::DeviceIdentity;
use vprinter_core::identity::FIRMWARE_VERSION;

pub use frame::{FrameError, build_frame, parse_frame};

/// Largest request accepted.
pub const MAX_REQUEST: usize = 4096;

/// Time allowed for the request frame to arrive.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a connection was closed without a reply.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("timed out waiting for request")]
    Timeout,

    #[error("connection closed before a full frame arrived")]
    Incomplete,

    #[error("request exceeds {MAX_REQUEST} bytes")]
    TooLarge,

    #[error("unexpected command {0:?}")]
    UnexpectedCommand(Option<String>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reply body for a detect request.
pub fn detect_response(identity: &DeviceIdentity, sequence_id: i64) -> Value {
    json!({
        "login": {
            "bind": "free",
            "command": "detect",
            "connect": "lan",
            "dev_cap": 1,
            "id": identity.serial,
            "model": identity.model_code,
            "name": identity.display_name,
            "sequence_id": sequence_id,
            "version": FIRMWARE_VERSION,
        }
    })
}

/// Validate a request body and extract its sequence id.
///
/// Sequence ids arrive as numbers or numeric strings depending on the
/// slicer build; anything else counts as zero.
pub fn detect_sequence_id(request: &Value) -> Result<i64, HandshakeError> {
    let login = request.get("login");
    let command = login
        .and_then(|l| l.get("command"))
        .and_then(Value::as_str);
    if command != Some("detect") {
        return Err(HandshakeError::UnexpectedCommand(command.map(str::to_string)));
    }

    let sequence_id = match login.and_then(|l| l.get("sequence_id")) {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    };
    Ok(sequence_id)
}

/// Serve a single handshake exchange on `stream`.
pub async fn serve_connection<S>(
    stream: &mut S,
    identity: &DeviceIdentity,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = tokio::time::timeout(READ_TIMEOUT, read_frame(stream))
        .await
        .map_err(|_| HandshakeError::Timeout)??;
    let sequence_id = detect_sequence_id(&request)?;

    let reply = build_frame(&detect_response(identity, sequence_id))?;
    stream.write_all(&reply).await?;
    stream.flush().await?;
    let _ = stream.shutdown().await;
    Ok(())
}

async fn read_frame<S>(stream: &mut S) -> Result<Value, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Incomplete);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some((body, _)) = parse_frame(&buf)? {
            return Ok(body);
        }
        if buf.len() >= MAX_REQUEST {
            return Err(HandshakeError::TooLarge);
        }
    }
}

/// Handshake listener for one port.
pub struct HandshakeResponder {
    listener: TcpListener,
    identity: DeviceIdentity,
}

impl HandshakeResponder {
    pub async fn bind(addr: SocketAddr, identity: DeviceIdentity) -> std::io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            identity,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?self.listener.local_addr().ok(), "Handshake responder listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (mut stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "Handshake accept failed");
                            continue;
                        }
                    };
                    let identity = self.identity.clone();
                    connections.spawn(async move {
                        match serve_connection(&mut stream, &identity).await {
                            Ok(()) => debug!(peer = %peer, "Answered detect request"),
                            Err(e) => warn!(peer = %peer, error = %e, "Handshake rejected"),
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        connections.shutdown().await;
        info!("Handshake responder stopped");
    }
}
