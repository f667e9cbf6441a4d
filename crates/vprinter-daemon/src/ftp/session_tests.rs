//! Tests for the file-transfer session state machine.

use std::path::Path;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::ReadBuf;
use tokio::net::TcpStream;

use super::*;
use crate::ftp::Timeouts;

const CODE: &str = "12345678";

#[derive(Default)]
struct Recorder(Mutex<Vec<(PathBuf, IpAddr)>>);

#[async_trait]
impl FileReceivedHandler for Recorder {
    async fn on_file_received(&self, path: PathBuf, source: IpAddr) {
        self.0.lock().unwrap().push((path, source));
    }
}

struct Harness {
    session: FtpSession,
    ctx: SessionContext,
    code_tx: watch::Sender<String>,
    recorder: Arc<Recorder>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (code_tx, code_rx) = watch::channel(CODE.to_string());
        let recorder = Arc::new(Recorder::default());
        let ctx = SessionContext {
            access_code: code_rx,
            upload_dir: dir.path().to_path_buf(),
            // Port 0: let the OS pick, so parallel tests never collide.
            passive: PassivePorts::new(0, 0),
            data_bind: "127.0.0.1".parse().unwrap(),
            data_tls: None,
            on_file: Some(Arc::clone(&recorder) as Arc<dyn FileReceivedHandler>),
            timeouts: Timeouts {
                data_connect: Duration::from_secs(2),
                data_read: Duration::from_secs(2),
                ..Timeouts::default()
            },
        };
        Self {
            session: FtpSession::new(
                "127.0.0.1:40000".parse().unwrap(),
                "127.0.0.1:990".parse().unwrap(),
            ),
            ctx,
            code_tx,
            recorder,
            dir,
        }
    }

    async fn send(&mut self, line: &str) -> String {
        let mut out = Vec::new();
        self.session
            .execute(Command::parse(line), &mut out, &self.ctx)
            .await
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    async fn login(&mut self) {
        assert!(self.send("USER bblp").await.starts_with("331"));
        assert!(self.send(&format!("PASS {CODE}")).await.starts_with("230"));
    }

    fn upload_dir(&self) -> &Path {
        self.dir.path()
    }

    fn received(&self) -> Vec<(PathBuf, IpAddr)> {
        self.recorder.0.lock().unwrap().clone()
    }
}

fn pasv_port(reply: &str) -> u16 {
    let inner = reply
        .split_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .map(|(inner, _)| inner)
        .unwrap();
    let parts: Vec<u16> = inner.split(',').map(|p| p.parse().unwrap()).collect();
    assert_eq!(parts.len(), 6, "{reply}");
    parts[4] * 256 + parts[5]
}

fn epsv_port(reply: &str) -> u16 {
    reply
        .split("(|||")
        .nth(1)
        .and_then(|rest| rest.split('|').next())
        .unwrap()
        .parse()
        .unwrap()
}

/// Connect to the data port, send `payload`, then close.
fn spawn_uploader(port: u16, payload: &'static [u8]) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(payload).await.unwrap();
        stream.shutdown().await.unwrap();
    })
}

#[tokio::test]
async fn login_with_access_code() {
    let mut h = Harness::new();
    h.login().await;
    assert!(h.session.is_authenticated());
}

#[tokio::test]
async fn wrong_password_blocks_privileged_commands() {
    let mut h = Harness::new();
    assert!(h.send("USER bblp").await.starts_with("331"));
    assert!(h.send("PASS 00000000").await.starts_with("530"));
    assert!(!h.session.is_authenticated());

    for cmd in ["STOR job.3mf", "LIST", "PWD", "PASV", "CWD /cache"] {
        let reply = h.send(cmd).await;
        assert!(reply.starts_with("530 Not logged in"), "{cmd}: {reply}");
    }
}

#[tokio::test]
async fn failed_attempts_share_one_code_without_lockout() {
    let mut h = Harness::new();
    assert!(h.send("PASS 12345678").await.starts_with("530"), "PASS before USER");
    assert!(h.send("USER root").await.starts_with("530"));
    assert!(h.send("PASS 12345678").await.starts_with("530"), "PASS after bad USER");
    h.send("USER bblp").await;
    assert!(h.send("PASS nope").await.starts_with("530"));

    h.login().await;
    assert!(h.session.is_authenticated());
}

#[tokio::test]
async fn empty_access_code_never_authenticates() {
    let mut h = Harness::new();
    h.code_tx.send_replace(String::new());
    h.send("USER bblp").await;
    assert!(h.send("PASS ").await.starts_with("530"));
    assert!(!h.session.is_authenticated());
}

#[tokio::test]
async fn access_code_change_applies_to_next_login() {
    let mut h = Harness::new();
    h.code_tx.send_replace("87654321".to_string());
    h.send("USER bblp").await;
    assert!(h.send(&format!("PASS {CODE}")).await.starts_with("530"));
    h.send("USER bblp").await;
    assert!(h.send("PASS 87654321").await.starts_with("230"));
}

#[tokio::test]
async fn pasv_reply_points_at_control_address() {
    let mut h = Harness::new();
    h.login().await;
    let reply = h.send("PASV").await;
    assert!(reply.starts_with("227 Entering Passive Mode (127,0,0,1,"), "{reply}");
    assert!(pasv_port(&reply) > 0);
    assert_eq!(h.session.poll_data_state(), DataState::Listening);
}

#[tokio::test]
async fn epsv_reply_is_port_only() {
    let mut h = Harness::new();
    h.login().await;
    let reply = h.send("EPSV").await;
    assert!(reply.starts_with("229 Entering Extended Passive Mode (|||"), "{reply}");
    assert!(epsv_port(&reply) > 0);
}

#[tokio::test]
async fn pasv_after_pasv_releases_old_listener() {
    let mut h = Harness::new();
    h.login().await;
    let first = pasv_port(&h.send("PASV").await);
    let second = pasv_port(&h.send("PASV").await);
    assert_eq!(h.session.poll_data_state(), DataState::Listening);

    if first != second {
        assert!(TcpStream::connect(("127.0.0.1", first)).await.is_err());
    }
    TcpStream::connect(("127.0.0.1", second)).await.unwrap();
}

#[tokio::test]
async fn stor_writes_file_and_notifies() {
    let mut h = Harness::new();
    h.login().await;
    let port = pasv_port(&h.send("PASV").await);
    let uploader = spawn_uploader(port, b"PK\x03\x04 plate data");

    let reply = h.send("STOR /cache/Benchy Plate.3mf").await;
    uploader.await.unwrap();

    assert!(reply.starts_with("150"), "{reply}");
    assert!(reply.contains("226 Transfer complete"), "{reply}");
    let path = h.upload_dir().join("Benchy Plate.3mf");
    assert_eq!(std::fs::read(&path).unwrap(), b"PK\x03\x04 plate data");
    assert_eq!(h.received(), vec![(path, "127.0.0.1".parse().unwrap())]);
    assert_eq!(h.session.poll_data_state(), DataState::Idle);
}

#[tokio::test]
async fn zero_byte_upload_leaves_no_file() {
    let mut h = Harness::new();
    h.login().await;
    let port = pasv_port(&h.send("PASV").await);
    let uploader = spawn_uploader(port, b"");

    let reply = h.send("STOR empty.3mf").await;
    uploader.await.unwrap();

    assert!(reply.contains("451"), "{reply}");
    assert!(!reply.contains("226"));
    assert!(!h.upload_dir().join("empty.3mf").exists());
    assert!(h.received().is_empty());
}

#[tokio::test]
async fn stalled_upload_is_aborted() {
    let mut h = Harness::new();
    h.ctx.timeouts.data_read = Duration::from_millis(200);
    h.login().await;
    let port = pasv_port(&h.send("PASV").await);

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"partial").await.unwrap();

    let reply = h.send("STOR partial.3mf").await;
    assert!(reply.contains("426"), "{reply}");
    assert!(!h.upload_dir().join("partial.3mf").exists());
    assert!(h.received().is_empty());
    drop(client);
}

/// Yields `rest`, then fails the way a TLS stream does when the peer closes
/// the socket without `close_notify`.
struct CutStream {
    rest: &'static [u8],
}

impl AsyncRead for CutStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.rest.is_empty() {
            return Poll::Ready(Err(std::io::ErrorKind::UnexpectedEof.into()));
        }
        let n = self.rest.len().min(buf.remaining());
        buf.put_slice(&self.rest[..n]);
        self.rest = &self.rest[n..];
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for CutStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn missing_close_notify_is_reported_as_truncation() {
    let mut stream: DataStream = Box::new(CutStream { rest: b"partial" });

    let result = receive_all(&mut stream, Duration::from_secs(1)).await;

    assert!(matches!(result, Err(FtpError::Truncated(7))), "{result:?}");
}

#[tokio::test]
async fn stor_without_passive_is_refused() {
    let mut h = Harness::new();
    h.login().await;
    assert!(h.send("STOR job.3mf").await.starts_with("425"));
}

#[tokio::test]
async fn data_connection_that_never_arrives() {
    let mut h = Harness::new();
    h.ctx.timeouts.data_connect = Duration::from_millis(200);
    h.login().await;
    h.send("PASV").await;

    let reply = h.send("STOR job.3mf").await;
    assert!(reply.starts_with("150"));
    assert!(reply.contains("425"), "{reply}");
    assert_eq!(h.session.poll_data_state(), DataState::Idle);
}

#[tokio::test]
async fn early_data_connection_is_connected_until_abor() {
    let mut h = Harness::new();
    h.login().await;
    let port = pasv_port(&h.send("PASV").await);
    let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let mut state = h.session.poll_data_state();
    for _ in 0..100 {
        if state == DataState::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        state = h.session.poll_data_state();
    }
    assert_eq!(state, DataState::Connected);

    assert!(h.send("ABOR").await.starts_with("226"));
    assert_eq!(h.session.poll_data_state(), DataState::Idle);
}

#[tokio::test]
async fn list_returns_empty_listing() {
    let mut h = Harness::new();
    h.login().await;
    let port = pasv_port(&h.send("PASV").await);
    let reader = tokio::spawn(async move {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut listing = Vec::new();
        stream.read_to_end(&mut listing).await.unwrap();
        listing
    });

    let reply = h.send("LIST").await;
    assert!(reply.starts_with("150") && reply.contains("226"), "{reply}");
    assert!(reader.await.unwrap().is_empty());
}

#[tokio::test]
async fn static_replies() {
    let mut h = Harness::new();
    assert!(h.send("SYST").await.starts_with("215"));
    assert!(h.send("FEAT").await.starts_with("211-"));
    assert!(h.send("PBSZ 0").await.starts_with("200"));
    assert!(h.send("PROT C").await.starts_with("536"));
    assert!(h.send("PROT P").await.starts_with("200"));
    assert!(h.send("AUTH TLS").await.starts_with("534"));
    assert!(h.send("SITE HELP").await.starts_with("502"));

    h.login().await;
    assert!(h.send("PWD").await.starts_with("257 \"/\""));
    assert!(h.send("CWD /sdcard/cache").await.starts_with("250"));
    assert!(h.send("CDUP").await.starts_with("250"));
    assert!(h.send("MKD ../x").await.starts_with("257 \"/x\""));
    assert!(h.send("SIZE job.3mf").await.starts_with("550"));
    assert!(h.send("TYPE X").await.starts_with("504"));
    assert!(h.send("TYPE I").await.starts_with("200"));
    assert_eq!(h.session.transfer_type(), TransferType::Binary);
    assert!(h.send("NOOP").await.starts_with("200"));
}

#[tokio::test]
async fn quit_closes_the_session() {
    let mut h = Harness::new();
    let mut out = Vec::new();
    let flow = h
        .session
        .execute(Command::Quit, &mut out, &h.ctx)
        .await
        .unwrap();
    assert_eq!(flow, Flow::Close);
    assert!(out.starts_with(b"221"));
}

#[tokio::test]
async fn control_loop_greets_and_times_out() {
    let mut h = Harness::new();
    h.ctx.timeouts.idle = Duration::from_millis(200);
    let (client, server) = tokio::io::duplex(4096);
    let ctx = h.ctx.clone();
    let task = tokio::spawn(run_session(
        server,
        "127.0.0.1:40000".parse().unwrap(),
        "127.0.0.1:990".parse().unwrap(),
        ctx,
    ));

    let mut lines = BufReader::new(client);
    let mut line = String::new();
    lines.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("220"));

    lines.get_mut().write_all(b"USER bblp\r\n").await.unwrap();
    line.clear();
    lines.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("331"));

    line.clear();
    lines.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("421"), "{line}");
    task.await.unwrap().unwrap();
}
