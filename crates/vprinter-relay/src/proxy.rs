//! TLS-terminating byte relay.
//!
//! One `TlsRelay` per forwarded port. Each accepted slicer connection is
//! handshaken with the emulated leaf first; only then is a fresh outbound
//! TLS session opened to the real printer. Once both are up the relay is
//! byte-transparent, and either side closing tears down both.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::error::RelayError;

/// Outbound TCP connect plus TLS handshake budget.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A bound TLS relay for one port.
pub struct TlsRelay {
    name: &'static str,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    target_host: String,
    target_port: u16,
    server_name: ServerName<'static>,
}

impl TlsRelay {
    /// Bind `listen` and prepare to forward to `target_host:target_port`.
    ///
    /// `server_config` faces the slicer; `client_config` faces the printer.
    /// They are kept separate so relaxed verification on the outbound leg
    /// can never leak into the slicer-facing side.
    pub async fn bind(
        name: &'static str,
        listen: SocketAddr,
        server_config: Arc<rustls::ServerConfig>,
        client_config: Arc<rustls::ClientConfig>,
        target_host: &str,
        target_port: u16,
    ) -> Result<Self, RelayError> {
        let server_name = ServerName::try_from(target_host.to_string())
            .map_err(|e| RelayError::InvalidTarget(format!("{target_host}: {e}")))?;
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|source| RelayError::Bind {
                addr: listen,
                source,
            })?;

        Ok(Self {
            name,
            listener,
            acceptor: TlsAcceptor::from(server_config),
            connector: TlsConnector::from(client_config),
            target_host: target_host.to_string(),
            target_port,
            server_name,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and forward until `shutdown` flips to `true`.
    ///
    /// Live connections belong to a `JoinSet` and are aborted when the relay
    /// stops.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let target = format!("{}:{}", self.target_host, self.target_port);
        info!(
            relay = self.name,
            addr = ?self.listener.local_addr().ok(),
            target = %target,
            "TLS relay listening"
        );

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(relay = self.name, error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let link = Link {
                        name: self.name,
                        acceptor: self.acceptor.clone(),
                        connector: self.connector.clone(),
                        target: target.clone(),
                        server_name: self.server_name.clone(),
                    };
                    connections.spawn(async move {
                        match link.serve(stream, peer).await {
                            Ok((up, down)) => {
                                debug!(relay = link.name, peer = %peer, up, down, "Relay connection closed");
                            }
                            Err(e) => warn!(relay = link.name, peer = %peer, error = %e, "Relay connection failed"),
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        connections.shutdown().await;
        info!(relay = self.name, "TLS relay stopped");
    }
}

/// Everything one forwarded connection needs.
struct Link {
    name: &'static str,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    target: String,
    server_name: ServerName<'static>,
}

impl Link {
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> Result<(u64, u64), RelayError> {
        let inbound = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| RelayError::Handshake(format!("slicer {peer}: {e}")))?;

        let outbound = tokio::time::timeout(CONNECT_TIMEOUT, self.connect())
            .await
            .map_err(|_| RelayError::Timeout {
                target: self.target.clone(),
            })??;

        debug!(relay = self.name, peer = %peer, target = %self.target, "Relay link established");
        Ok(forward(inbound, outbound).await)
    }

    async fn connect(
        &self,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, RelayError> {
        let tcp = TcpStream::connect(&self.target)
            .await
            .map_err(|source| RelayError::Connect {
                target: self.target.clone(),
                source,
            })?;
        tcp.set_nodelay(true)?;
        self.connector
            .connect(self.server_name.clone(), tcp)
            .await
            .map_err(|e| RelayError::Handshake(format!("printer {}: {e}", self.target)))
    }
}

/// Copy bytes both ways until either direction ends.
///
/// Returns bytes moved `(a → b, b → a)`. When one direction finishes the
/// other is dropped and both write halves are shut down, so neither socket
/// lingers half-open.
pub async fn forward<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (up, down) = tokio::select! {
        r = tokio::io::copy(&mut a_read, &mut b_write) => (r.unwrap_or(0), 0),
        r = tokio::io::copy(&mut b_read, &mut a_write) => (0, r.unwrap_or(0)),
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
    (up, down)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "proxy_tests.rs"]
mod tests;
