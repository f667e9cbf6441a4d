//! Control-channel listener.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::session::{SessionContext, run_session};

/// A bound file-transfer server.
///
/// With a TLS acceptor the control channel is implicit TLS: the handshake
/// happens before the greeting.
pub struct FtpServer {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    ctx: SessionContext,
}

impl FtpServer {
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        ctx: SessionContext,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, tls, ctx })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            addr = ?self.listener.local_addr().ok(),
            tls = self.tls.is_some(),
            upload_dir = %self.ctx.upload_dir.display(),
            "FTP server listening"
        );

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "FTP accept failed");
                            continue;
                        }
                    };
                    let tls = self.tls.clone();
                    let ctx = self.ctx.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve(stream, peer, tls, ctx).await {
                            debug!(peer = %peer, error = %e, "FTP session ended with error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        connections.shutdown().await;
        info!("FTP server stopped");
    }
}

async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    ctx: SessionContext,
) -> std::io::Result<()> {
    let local = stream.local_addr()?;
    debug!(peer = %peer, "FTP connection accepted");

    let Some(acceptor) = tls else {
        return run_session(stream, peer, local, ctx).await;
    };
    match tokio::time::timeout(ctx.timeouts.handshake, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => run_session(stream, peer, local, ctx).await,
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "FTP TLS handshake failed");
            Ok(())
        }
        Err(_) => {
            warn!(peer = %peer, "FTP TLS handshake timed out");
            Ok(())
        }
    }
}
