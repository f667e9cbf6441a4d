//! Single-device broker.
//!
//! Slicers connect, authenticate with the LAN user and access code, and
//! subscribe to the report topic. Everything they publish is a command for
//! the one emulated device; everything sent back is a report on that
//! device's topic. There is no routing between clients.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::codec::{
    self, CONNACK_ACCEPTED, CONNACK_BAD_PROTOCOL, CONNACK_NOT_AUTHORIZED, CodecError, Connect,
    Packet, Publish,
};
use super::request::{Request, parse_request};
use super::status::{GcodeState, JobTracker, command_ack, report_topic, status_report, version_report};
use crate::events::PrintCommandHandler;

/// The only accepted user name.
pub const BROKER_USER: &str = "bblp";

/// Interval between unsolicited status pushes.
pub const PUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Time allowed between accept and a valid CONNECT.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 8 * 1024;

/// Pushes queued per session before new ones are dropped.
const OUTBOUND_QUEUE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("no traffic within {0:?}")]
    Expired(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inputs shared by every session of one broker.
#[derive(Clone)]
pub struct BrokerContext {
    /// Serial the report topic is built from.
    pub serial: String,
    pub access_code: watch::Receiver<String>,
    pub job: JobTracker,
    pub on_print: Option<Arc<dyn PrintCommandHandler>>,
    pub push_interval: Duration,
    pub connect_timeout: Duration,
}

struct Shared {
    ctx: BrokerContext,
    topic: String,
    /// Authenticated sessions, keyed by session id.
    sessions: RwLock<HashMap<u64, mpsc::Sender<Vec<u8>>>>,
    next_session: AtomicU64,
    push_sequence: AtomicU64,
}

impl Shared {
    fn report(&self, payload: &Value) -> Vec<u8> {
        let publish = Publish::at_most_once(self.topic.clone(), payload.to_string().into_bytes());
        codec::encode(&Packet::Publish(publish))
    }

    fn status_packet(&self) -> Vec<u8> {
        let sequence = self.push_sequence.fetch_add(1, Ordering::Relaxed);
        self.report(&status_report(&self.ctx.job.current(), sequence))
    }

    /// Queue a status snapshot for every authenticated session.
    async fn push_status(&self) {
        let sessions = self.sessions.read().await;
        if sessions.is_empty() {
            return;
        }
        let packet = self.status_packet();
        for (id, tx) in sessions.iter() {
            if tx.try_send(packet.clone()).is_err() {
                debug!(session = id, "Status push dropped, session is behind");
            }
        }
    }
}

/// A bound broker.
pub struct MqttBroker {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    shared: Arc<Shared>,
}

impl MqttBroker {
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        ctx: BrokerContext,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let topic = report_topic(&ctx.serial);
        Ok(Self {
            listener,
            tls,
            shared: Arc::new(Shared {
                ctx,
                topic,
                sessions: RwLock::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                push_sequence: AtomicU64::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Job state this broker reports.
    pub fn job(&self) -> JobTracker {
        self.shared.ctx.job.clone()
    }

    /// Accept sessions and push status until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            addr = ?self.listener.local_addr().ok(),
            topic = %self.shared.topic,
            tls = self.tls.is_some(),
            "Broker listening"
        );

        let mut push = tokio::time::interval(self.shared.ctx.push_interval);
        push.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "Broker accept failed");
                            continue;
                        }
                    };
                    let tls = self.tls.clone();
                    let shared = Arc::clone(&self.shared);
                    connections.spawn(async move {
                        match accept(stream, peer, tls, shared).await {
                            Ok(()) => debug!(peer = %peer, "Broker session closed"),
                            Err(e) => warn!(peer = %peer, error = %e, "Broker session ended"),
                        }
                    });
                }
                _ = push.tick() => self.shared.push_status().await,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        connections.shutdown().await;
        self.shared.sessions.write().await.clear();
        info!("Broker stopped");
    }
}

async fn accept(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    shared: Arc<Shared>,
) -> Result<(), BrokerError> {
    stream.set_nodelay(true)?;
    let Some(acceptor) = tls else {
        return serve(stream, peer, shared).await;
    };
    let timeout = shared.ctx.connect_timeout;
    match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => serve(stream, peer, shared).await,
        Ok(Err(e)) => Err(BrokerError::Io(e)),
        Err(_) => Err(BrokerError::Expired(timeout)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Per-connection session state.
struct Session {
    peer: SocketAddr,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Vec<u8>>,
    /// Set once CONNECT is accepted.
    id: Option<u64>,
    keep_alive: Option<Duration>,
}

impl Session {
    const fn authenticated(&self) -> bool {
        self.id.is_some()
    }

    /// How long the client may stay silent: the CONNECT budget before
    /// authentication, one and a half keep-alive periods after.
    fn silence_limit(&self) -> Option<Duration> {
        if self.authenticated() {
            self.keep_alive.map(|k| k.mul_f32(1.5))
        } else {
            Some(self.shared.ctx.connect_timeout)
        }
    }

    async fn handle<W>(&mut self, packet: Packet, out: &mut W) -> Result<Flow, BrokerError>
    where
        W: AsyncWrite + Unpin,
    {
        debug!(peer = %self.peer, packet = packet.name(), "Broker packet");
        match packet {
            Packet::Connect(connect) => return self.connect(&connect, out).await,
            _ if !self.authenticated() => return Err(BrokerError::Protocol("packet before CONNECT")),
            Packet::Publish(publish) => {
                match (publish.qos, publish.packet_id) {
                    (1, Some(packet_id)) => send(out, &Packet::PubAck { packet_id }).await?,
                    (2, _) => debug!(peer = %self.peer, "QoS 2 publish handled as QoS 0"),
                    _ => {}
                }
                self.request(&publish.payload, out).await?;
            }
            Packet::Subscribe { packet_id, filters } => {
                debug!(peer = %self.peer, ?filters, "Subscribe");
                let codes = vec![0; filters.len()];
                send(out, &Packet::SubAck { packet_id, codes }).await?;
                write(out, &self.shared.status_packet()).await?;
            }
            Packet::Unsubscribe { packet_id, .. } => {
                send(out, &Packet::UnsubAck { packet_id }).await?;
            }
            Packet::PingReq => send(out, &Packet::PingResp).await?,
            Packet::Disconnect => return Ok(Flow::Close),
            Packet::PubAck { .. } => {}
            Packet::ConnAck { .. }
            | Packet::SubAck { .. }
            | Packet::UnsubAck { .. }
            | Packet::PingResp => return Err(BrokerError::Protocol("server-only packet from client")),
        }
        Ok(Flow::Continue)
    }

    async fn connect<W>(&mut self, connect: &Connect, out: &mut W) -> Result<Flow, BrokerError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.authenticated() {
            return Err(BrokerError::Protocol("second CONNECT"));
        }
        let connack = |code| Packet::ConnAck {
            session_present: false,
            code,
        };
        if !matches!(connect.protocol_level, 3 | 4) {
            warn!(peer = %self.peer, level = connect.protocol_level, "Unsupported broker protocol level");
            send(out, &connack(CONNACK_BAD_PROTOCOL)).await?;
            return Ok(Flow::Close);
        }

        let code = self.shared.ctx.access_code.borrow().clone();
        let accepted = !code.is_empty()
            && connect.username.as_deref() == Some(BROKER_USER)
            && connect.password.as_deref() == Some(code.as_bytes());
        if !accepted {
            warn!(peer = %self.peer, client = %connect.client_id, "Broker login rejected");
            send(out, &connack(CONNACK_NOT_AUTHORIZED)).await?;
            return Ok(Flow::Close);
        }

        send(out, &connack(CONNACK_ACCEPTED)).await?;
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        self.shared
            .sessions
            .write()
            .await
            .insert(id, self.outbound.clone());
        self.id = Some(id);
        self.keep_alive =
            (connect.keep_alive > 0).then(|| Duration::from_secs(u64::from(connect.keep_alive)));
        info!(peer = %self.peer, client = %connect.client_id, session = id, "Broker session authenticated");

        write(out, &self.shared.status_packet()).await?;
        Ok(Flow::Continue)
    }

    async fn request<W>(&self, payload: &[u8], out: &mut W) -> Result<(), BrokerError>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(request) = parse_request(payload) else {
            debug!(peer = %self.peer, bytes = payload.len(), "Ignoring unrecognised publish");
            return Ok(());
        };
        let shared = &self.shared;
        let job = &shared.ctx.job;

        match request {
            Request::PushAll => write(out, &shared.status_packet()).await?,
            Request::GetVersion { sequence_id } => {
                let report = version_report(&shared.ctx.serial, &sequence_id);
                write(out, &shared.report(&report)).await?;
            }
            Request::ProjectFile {
                sequence_id,
                filename,
                payload,
            } => {
                info!(peer = %self.peer, filename = %filename, "Print start requested");
                job.set_job_state(GcodeState::Prepare, &filename, 0);
                let ack = command_ack("project_file", &sequence_id, &job.current());
                write(out, &shared.report(&ack)).await?;
                if let Some(handler) = &shared.ctx.on_print {
                    handler.on_print_command(&filename, &payload).await;
                }
            }
            Request::Pause { sequence_id } => {
                write(out, &shared.report(&command_ack("pause", &sequence_id, &job.current()))).await?;
            }
            Request::Resume { sequence_id } => {
                write(out, &shared.report(&command_ack("resume", &sequence_id, &job.current()))).await?;
            }
            Request::Stop { sequence_id } => {
                job.set_job_state(GcodeState::Idle, "", 0);
                write(out, &shared.report(&command_ack("stop", &sequence_id, &job.current()))).await?;
            }
            Request::OtherPrint {
                command,
                sequence_id,
            } => {
                debug!(peer = %self.peer, command = %command, "Acknowledging unsupported print command");
                write(out, &shared.report(&command_ack(&command, &sequence_id, &job.current()))).await?;
            }
        }
        Ok(())
    }

    /// Handle every complete packet at the front of `buf`.
    async fn drain<W>(&mut self, buf: &mut Vec<u8>, out: &mut W) -> Result<Flow, BrokerError>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some((packet, used)) = codec::decode(buf)? {
            buf.drain(..used);
            if self.handle(packet, out).await? == Flow::Close {
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    async fn unregister(&mut self) {
        if let Some(id) = self.id.take() {
            self.shared.sessions.write().await.remove(&id);
        }
    }
}

/// Drive one connection until DISCONNECT, EOF, a protocol error or silence.
///
/// Replies are written inline; pushes from the broker's timer arrive on the
/// session's queue and are interleaved between reads.
async fn serve<S>(stream: S, peer: SocketAddr, shared: Arc<Shared>) -> Result<(), BrokerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (outbound, mut pushes) = mpsc::channel(OUTBOUND_QUEUE);
    let mut session = Session {
        peer,
        shared,
        outbound,
        id: None,
        keep_alive: None,
    };

    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut last_inbound = Instant::now();

    let result = async {
        loop {
            let limit = session.silence_limit();
            tokio::select! {
                read = reader.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    last_inbound = Instant::now();
                    buf.extend_from_slice(&chunk[..n]);
                    if session.drain(&mut buf, &mut writer).await? == Flow::Close {
                        return Ok(());
                    }
                }
                Some(packet) = pushes.recv() => write(&mut writer, &packet).await?,
                () = expire(limit.map(|l| last_inbound + l)) => {
                    return Err(BrokerError::Expired(limit.unwrap_or_default()));
                }
            }
        }
    }
    .await;

    session.unregister().await;
    let _ = writer.shutdown().await;
    result
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn send<W>(out: &mut W, packet: &Packet) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write(out, &codec::encode(packet)).await
}

async fn write<W>(out: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(bytes).await?;
    out.flush().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[path = "broker_tests.rs"]
mod tests;
