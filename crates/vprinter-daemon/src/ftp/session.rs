//! Per-connection session state machine.
//!
//! A session owns at most one data channel. Its lifecycle:
//!
//! ```text
//! Idle --PASV/EPSV--> Listening --client connects--> Connected
//!   ^                     |                             |
//!   |                     +-------STOR/LIST/NLST--------+--> Transferring
//!   +---------------------------- done / ABOR ---------------------+
//! ```
//!
//! A new PASV/EPSV in any state tears the old channel down first.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::command::{Command, sanitize_filename};
use super::passive::PassivePorts;
use super::{FTP_USER, FtpError, Timeouts};
use crate::events::FileReceivedHandler;

const READ_CHUNK: usize = 64 * 1024;

/// Byte stream for a data connection (plain or TLS).
pub trait DataIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> DataIo for T {}

pub type DataStream = Box<dyn DataIo>;

/// Shared, per-server inputs to every session.
#[derive(Clone)]
pub struct SessionContext {
    /// Current access code; updated live by the lifecycle manager.
    pub access_code: watch::Receiver<String>,
    pub upload_dir: PathBuf,
    pub passive: PassivePorts,
    /// Address passive listeners bind to.
    pub data_bind: IpAddr,
    /// Wraps data connections in TLS when set.
    pub data_tls: Option<TlsAcceptor>,
    pub on_file: Option<Arc<dyn FileReceivedHandler>>,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Ascii,
    Binary,
}

/// Observable data-channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataState {
    Idle,
    Listening,
    Connected,
    Transferring,
}

/// Whether the control loop keeps reading commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// A passive listener waiting for its single connection.
///
/// Dropping it aborts the acceptor and releases the port.
struct PassiveListener {
    port: u16,
    task: JoinHandle<()>,
    ready: oneshot::Receiver<DataStream>,
}

impl Drop for PassiveListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum DataChannel {
    Idle,
    Listening(PassiveListener),
    Connected(DataStream),
    Transferring,
}

pub struct FtpSession {
    peer: SocketAddr,
    /// Address advertised in PASV replies.
    reply_ip: Ipv4Addr,
    authenticated: bool,
    username: Option<String>,
    transfer_type: TransferType,
    data: DataChannel,
}

impl FtpSession {
    /// `local` is the control connection's local address; PASV replies
    /// point the client back at it.
    pub fn new(peer: SocketAddr, local: SocketAddr) -> Self {
        let reply_ip = match vprinter_core::net::canonical_ip(local.ip()) {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        Self {
            peer,
            reply_ip,
            authenticated: false,
            username: None,
            transfer_type: TransferType::Ascii,
            data: DataChannel::Idle,
        }
    }

    pub const fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub const fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    /// Current data-channel state, picking up a connection that arrived
    /// since the last command.
    pub fn poll_data_state(&mut self) -> DataState {
        self.promote_connected();
        match self.data {
            DataChannel::Idle => DataState::Idle,
            DataChannel::Listening(_) => DataState::Listening,
            DataChannel::Connected(_) => DataState::Connected,
            DataChannel::Transferring => DataState::Transferring,
        }
    }

    fn promote_connected(&mut self) {
        if let DataChannel::Listening(listener) = &mut self.data {
            match listener.ready.try_recv() {
                Ok(stream) => self.data = DataChannel::Connected(stream),
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => self.data = DataChannel::Idle,
            }
        }
    }

    /// Execute one command, writing every reply to `out`.
    pub async fn execute<W>(
        &mut self,
        command: Command,
        out: &mut W,
        ctx: &SessionContext,
    ) -> std::io::Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        self.promote_connected();

        if command.requires_login() && !self.authenticated {
            reply(out, 530, "Not logged in.").await?;
            return Ok(Flow::Continue);
        }

        match command {
            Command::User(name) => {
                self.authenticated = false;
                if name == FTP_USER {
                    self.username = Some(name);
                    reply(out, 331, "User name okay, need password.").await?;
                } else {
                    self.username = None;
                    warn!(peer = %self.peer, "FTP login with unknown user");
                    reply(out, 530, "Login incorrect.").await?;
                }
            }
            Command::Pass(password) => {
                let code = ctx.access_code.borrow().clone();
                if self.username.is_some() && !code.is_empty() && password == code {
                    self.authenticated = true;
                    info!(peer = %self.peer, "FTP login accepted");
                    reply(out, 230, "User logged in, proceed.").await?;
                } else {
                    self.authenticated = false;
                    self.username = None;
                    warn!(peer = %self.peer, "FTP login rejected");
                    reply(out, 530, "Login incorrect.").await?;
                }
            }
            Command::Pasv => match self.open_passive(ctx).await {
                Ok(port) => {
                    let [a, b, c, d] = self.reply_ip.octets();
                    let text = format!(
                        "Entering Passive Mode ({a},{b},{c},{d},{},{}).",
                        port >> 8,
                        port & 0xff
                    );
                    reply(out, 227, &text).await?;
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Passive listener failed");
                    reply(out, 425, "Can't open passive connection.").await?;
                }
            },
            Command::Epsv => match self.open_passive(ctx).await {
                Ok(port) => {
                    let text = format!("Entering Extended Passive Mode (|||{port}|)");
                    reply(out, 229, &text).await?;
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Passive listener failed");
                    reply(out, 425, "Can't open passive connection.").await?;
                }
            },
            Command::Stor(arg) => self.store(&arg, out, ctx).await?,
            Command::List | Command::Nlst => self.send_empty_listing(out, ctx).await?,
            Command::Pwd => reply(out, 257, "\"/\" is the current directory.").await?,
            Command::Cwd(_) | Command::Cdup => {
                reply(out, 250, "Directory successfully changed.").await?;
            }
            Command::Mkd(arg) => {
                let name = sanitize_filename(&arg).unwrap_or_default();
                reply(out, 257, &format!("\"/{name}\" created.")).await?;
            }
            Command::Size(_) => reply(out, 550, "Could not get file size.").await?,
            Command::Dele(_) => reply(out, 250, "File deleted.").await?,
            Command::Type(arg) => match arg.trim().chars().next().map(|c| c.to_ascii_uppercase()) {
                Some('A') => {
                    self.transfer_type = TransferType::Ascii;
                    reply(out, 200, "Type set to A.").await?;
                }
                Some('I' | 'L') => {
                    self.transfer_type = TransferType::Binary;
                    reply(out, 200, "Type set to I.").await?;
                }
                _ => reply(out, 504, "Type not supported.").await?,
            },
            Command::Pbsz(_) => reply(out, 200, "PBSZ=0").await?,
            Command::Prot(level) => {
                if level.trim().eq_ignore_ascii_case("P") {
                    reply(out, 200, "Protection level set to P.").await?;
                } else {
                    reply(out, 536, "Only PROT P is supported.").await?;
                }
            }
            Command::Syst => reply(out, 215, "UNIX Type: L8").await?,
            Command::Feat => {
                out.write_all(
                    b"211-Features:\r\n EPSV\r\n PASV\r\n PBSZ\r\n PROT\r\n SIZE\r\n UTF8\r\n211 End\r\n",
                )
                .await?;
                out.flush().await?;
            }
            Command::Opts(arg) => {
                if arg.to_ascii_uppercase().starts_with("UTF8") {
                    reply(out, 200, "UTF8 mode enabled.").await?;
                } else {
                    reply(out, 501, "Option not understood.").await?;
                }
            }
            Command::Abor => {
                self.close_data().await;
                reply(out, 226, "Abort successful.").await?;
            }
            Command::Auth(_) => reply(out, 534, "Already using TLS.").await?,
            Command::Noop => reply(out, 200, "NOOP ok.").await?,
            Command::Quit => {
                reply(out, 221, "Goodbye.").await?;
                return Ok(Flow::Close);
            }
            Command::Unknown(verb) => {
                debug!(peer = %self.peer, verb = %verb, "Unsupported FTP command");
                reply(out, 502, "Command not implemented.").await?;
            }
        }

        Ok(Flow::Continue)
    }

    /// Replace any data channel with a fresh passive listener.
    async fn open_passive(&mut self, ctx: &SessionContext) -> std::io::Result<u16> {
        self.close_data().await;

        let listener = ctx.passive.bind(ctx.data_bind).await?;
        let port = listener.local_addr()?.port();
        let (tx, ready) = oneshot::channel();
        let tls = ctx.data_tls.clone();
        let handshake = ctx.timeouts.handshake;
        let peer = self.peer;

        let task = tokio::spawn(async move {
            let (tcp, from) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Data connection accept failed");
                    return;
                }
            };
            let stream: DataStream = match tls {
                Some(acceptor) => {
                    match tokio::time::timeout(handshake, acceptor.accept(tcp)).await {
                        Ok(Ok(tls)) => Box::new(tls),
                        Ok(Err(e)) => {
                            warn!(peer = %from, error = %e, "Data channel TLS handshake failed");
                            return;
                        }
                        Err(_) => {
                            warn!(peer = %from, "Data channel TLS handshake timed out");
                            return;
                        }
                    }
                }
                None => Box::new(tcp),
            };
            debug!(peer = %from, port, "Data connection established");
            let _ = tx.send(stream);
        });

        self.data = DataChannel::Listening(PassiveListener { port, task, ready });
        debug!(peer = %self.peer, port, "Passive listener opened");
        Ok(port)
    }

    /// Tear down the data channel and wait until its port is released.
    async fn close_data(&mut self) {
        if let DataChannel::Listening(mut listener) =
            std::mem::replace(&mut self.data, DataChannel::Idle)
        {
            listener.task.abort();
            let _ = (&mut listener.task).await;
            debug!(port = listener.port, "Passive listener closed");
        }
    }

    /// Take the data stream, waiting for the client if it has not connected.
    async fn take_data_stream(&mut self, ctx: &SessionContext) -> Result<DataStream, FtpError> {
        match std::mem::replace(&mut self.data, DataChannel::Idle) {
            DataChannel::Connected(stream) => Ok(stream),
            DataChannel::Listening(mut listener) => {
                let wait = ctx.timeouts.data_connect;
                match tokio::time::timeout(wait, &mut listener.ready).await {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(_)) => Err(FtpError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "data connection failed",
                    ))),
                    Err(_) => Err(FtpError::DataConnectTimeout(wait)),
                }
            }
            DataChannel::Idle | DataChannel::Transferring => Err(FtpError::Io(
                std::io::Error::new(std::io::ErrorKind::NotConnected, "no data channel"),
            )),
        }
    }

    async fn store<W>(&mut self, arg: &str, out: &mut W, ctx: &SessionContext) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(name) = sanitize_filename(arg) else {
            return reply(out, 501, "Invalid file name.").await;
        };
        if matches!(self.data, DataChannel::Idle) {
            return reply(out, 425, "Use PASV or EPSV first.").await;
        }

        reply(out, 150, "Opening data connection.").await?;
        let mut stream = match self.take_data_stream(ctx).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "No data connection for STOR");
                return reply(out, 425, "Can't open data connection.").await;
            }
        };

        self.data = DataChannel::Transferring;
        let received = receive_all(&mut stream, ctx.timeouts.data_read).await;
        drop(stream);
        self.data = DataChannel::Idle;

        let bytes = match received {
            Ok(bytes) if bytes.is_empty() => {
                warn!(peer = %self.peer, file = %name, "Upload carried no data");
                return reply(out, 451, "Transfer failed: no data received.").await;
            }
            Ok(bytes) => bytes,
            Err(FtpError::Truncated(received)) => {
                warn!(
                    peer = %self.peer,
                    file = %name,
                    received,
                    "Data channel closed without TLS close_notify, discarding upload"
                );
                return reply(out, 426, "Connection closed; transfer aborted.").await;
            }
            Err(e) => {
                warn!(peer = %self.peer, file = %name, error = %e, "Upload aborted");
                return reply(out, 426, "Connection closed; transfer aborted.").await;
            }
        };

        let path = ctx.upload_dir.join(&name);
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            warn!(path = %path.display(), error = %e, "Failed to write upload");
            return reply(out, 451, "Local error in processing.").await;
        }

        info!(peer = %self.peer, file = %name, bytes = bytes.len(), "Upload received");
        reply(out, 226, "Transfer complete.").await?;

        if let Some(handler) = &ctx.on_file {
            handler.on_file_received(path, self.peer.ip()).await;
        }
        Ok(())
    }

    async fn send_empty_listing<W>(&mut self, out: &mut W, ctx: &SessionContext) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if matches!(self.data, DataChannel::Idle) {
            return reply(out, 425, "Use PASV or EPSV first.").await;
        }
        reply(out, 150, "Here comes the directory listing.").await?;
        match self.take_data_stream(ctx).await {
            Ok(mut stream) => {
                let _ = stream.shutdown().await;
                reply(out, 226, "Directory send OK.").await
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "No data connection for listing");
                reply(out, 425, "Can't open data connection.").await
            }
        }
    }
}

/// Read until EOF, failing if any single read stalls past `read_timeout`.
async fn receive_all(stream: &mut DataStream, read_timeout: std::time::Duration) -> Result<Vec<u8>, FtpError> {
    let mut bytes = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match tokio::time::timeout(read_timeout, stream.read(&mut chunk)).await {
            Err(_) => return Err(FtpError::DataReadTimeout(read_timeout)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FtpError::Truncated(bytes.len()));
            }
            Ok(read) => read?,
        };
        if n == 0 {
            return Ok(bytes);
        }
        bytes.extend_from_slice(&chunk[..n]);
    }
}

async fn reply<W>(out: &mut W, code: u16, text: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(format!("{code} {text}\r\n").as_bytes()).await?;
    out.flush().await
}

/// Drive one control connection until QUIT, EOF or idle timeout.
pub async fn run_session<S>(
    stream: S,
    peer: SocketAddr,
    local: SocketAddr,
    ctx: SessionContext,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut session = FtpSession::new(peer, local);
    let mut line = String::new();

    reply(&mut writer, 220, "Service ready for new user.").await?;
    loop {
        line.clear();
        let Ok(read) = tokio::time::timeout(ctx.timeouts.idle, reader.read_line(&mut line)).await
        else {
            info!(peer = %peer, "FTP session idle, closing");
            reply(&mut writer, 421, "Idle timeout, closing control connection.").await?;
            break;
        };
        if read? == 0 {
            break;
        }

        let command = Command::parse(&line);
        debug!(peer = %peer, verb = %command.verb(), "FTP command");
        if session.execute(command, &mut writer, &ctx).await? == Flow::Close {
            break;
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[path = "session_tests.rs"]
mod tests;
