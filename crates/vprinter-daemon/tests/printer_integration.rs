#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests against a running virtual printer.
//!
//! Every service listens on an ephemeral `127.0.0.1` port and is reached the
//! way a slicer reaches it: implicit TLS with no certificate pinning.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use vprinter_core::{EmulationMode, PortConfig, VirtualPrinterConfig};
use vprinter_daemon::archive::DirectoryArchive;
use vprinter_daemon::manager::{
    Collaborators, ManagerStatus, StoragePaths, VirtualPrinterManager,
};
use vprinter_daemon::mqtt::codec::{CONNACK_ACCEPTED, Connect};
use vprinter_daemon::mqtt::{Packet, decode, encode};

const CODE: &str = "12345678";
const SERIAL: &str = "01P09A391800001";

struct Printer {
    manager: VirtualPrinterManager,
    _dir: TempDir,
}

impl Printer {
    async fn start(mode: EmulationMode) -> Self {
        vprinter_crypto::install_crypto_provider();
        let dir = tempfile::tempdir().unwrap();
        let paths = StoragePaths::new(dir.path(), "it");
        let collaborators = Collaborators {
            archive: Arc::new(DirectoryArchive::new(paths.archive_dir())),
            print: None,
        };
        let manager = VirtualPrinterManager::new(paths, collaborators);
        manager.configure(config(mode)).await.unwrap();
        Self { manager, _dir: dir }
    }

    async fn addr(&self, name: &str) -> SocketAddr {
        listener(&self.manager.status().await, name)
    }

    fn archive_bucket(&self, bucket: &str) -> PathBuf {
        self.manager.paths().archive_dir().join(bucket)
    }
}

fn config(mode: EmulationMode) -> VirtualPrinterConfig {
    VirtualPrinterConfig {
        enabled: true,
        mode,
        device_model: "C12".into(),
        access_code: CODE.into(),
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ports: PortConfig {
            discovery: 0,
            handshake: vec![0],
            file_transfer: 0,
            broker: 0,
            passive_start: 0,
            passive_end: 0,
        },
        ..VirtualPrinterConfig::default()
    }
}

fn listener(status: &ManagerStatus, name: &str) -> SocketAddr {
    status
        .listeners
        .iter()
        .find(|l| l.name == name)
        .unwrap_or_else(|| panic!("{name} is not listening"))
        .addr
}

async fn tls_connect(addr: SocketAddr) -> TlsStream<TcpStream> {
    let connector = TlsConnector::from(vprinter_crypto::insecure_client_config().unwrap());
    let tcp = TcpStream::connect(addr).await.unwrap();
    connector
        .connect(ServerName::try_from("bblp.local").unwrap(), tcp)
        .await
        .unwrap()
}

/// Wait until `dir` holds a file, returning its contents.
async fn wait_for_file(dir: &Path) -> Vec<u8> {
    for _ in 0..100 {
        let first = std::fs::read_dir(dir).ok().and_then(|mut entries| entries.next());
        if let Some(entry) = first {
            return std::fs::read(entry.unwrap().path()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing arrived in {}", dir.display());
}

// =========================================================================
// File transfer
// =========================================================================

struct Ftp {
    reader: BufReader<tokio::io::ReadHalf<TlsStream<TcpStream>>>,
    writer: tokio::io::WriteHalf<TlsStream<TcpStream>>,
}

impl Ftp {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(tls_connect(addr).await);
        let mut ftp = Self {
            reader: BufReader::new(reader),
            writer,
        };
        assert_eq!(ftp.reply().await.0, 220);
        ftp
    }

    async fn reply(&mut self) -> (u16, String) {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        (line[..3].parse().unwrap(), line)
    }

    async fn cmd(&mut self, line: &str) -> (u16, String) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.reply().await
    }

    async fn login(&mut self, code: &str) -> u16 {
        assert_eq!(self.cmd("USER bblp").await.0, 331);
        self.cmd(&format!("PASS {code}")).await.0
    }

    /// Open a passive data channel and return its TLS stream.
    async fn passive(&mut self) -> TlsStream<TcpStream> {
        let (code, line) = self.cmd("PASV").await;
        assert_eq!(code, 227, "{line}");
        let inner = &line[line.find('(').unwrap() + 1..line.find(')').unwrap()];
        let parts: Vec<u16> = inner.split(',').map(|p| p.parse().unwrap()).collect();
        let port = (parts[4] << 8) | parts[5];
        tls_connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await
    }

    async fn store(&mut self, name: &str, body: &[u8]) -> u16 {
        let mut data = self.passive().await;
        assert_eq!(self.cmd(&format!("STOR {name}")).await.0, 150);
        data.write_all(body).await.unwrap();
        data.shutdown().await.unwrap();
        drop(data);
        self.reply().await.0
    }
}

#[tokio::test]
async fn upload_over_tls_is_archived() {
    let printer = Printer::start(EmulationMode::ServerImmediate).await;
    let mut ftp = Ftp::connect(printer.addr("ftp").await).await;
    assert_eq!(ftp.login(CODE).await, 230);
    assert_eq!(ftp.cmd("TYPE I").await.0, 200);

    let job = b"PK\x03\x04 print job";
    assert_eq!(ftp.store("Benchy.3mf", job).await, 226);
    assert_eq!(ftp.cmd("QUIT").await.0, 221);

    assert_eq!(wait_for_file(&printer.archive_bucket("archived")).await, job);
    printer.manager.stop().await;
}

#[tokio::test]
async fn empty_upload_is_rejected() {
    let printer = Printer::start(EmulationMode::ServerImmediate).await;
    let mut ftp = Ftp::connect(printer.addr("ftp").await).await;
    assert_eq!(ftp.login(CODE).await, 230);

    assert_eq!(ftp.store("Empty.3mf", b"").await, 451);
    assert!(!printer.manager.paths().upload_dir().join("Empty.3mf").exists());
    printer.manager.stop().await;
}

#[tokio::test]
async fn wrong_access_code_blocks_transfers() {
    let printer = Printer::start(EmulationMode::ServerImmediate).await;
    let mut ftp = Ftp::connect(printer.addr("ftp").await).await;

    assert_eq!(ftp.login("00000000").await, 530);
    assert_eq!(ftp.cmd("PASV").await.0, 530);
    assert_eq!(ftp.cmd("STOR Benchy.3mf").await.0, 530);

    assert_eq!(ftp.login(CODE).await, 230);
    printer.manager.stop().await;
}

#[tokio::test]
async fn access_code_change_applies_to_new_logins() {
    let printer = Printer::start(EmulationMode::ServerImmediate).await;
    let addr = printer.addr("ftp").await;

    let mut updated = config(EmulationMode::ServerImmediate);
    updated.access_code = "87654321".into();
    printer.manager.configure(updated).await.unwrap();

    assert_eq!(printer.addr("ftp").await, addr, "no restart");
    let mut ftp = Ftp::connect(addr).await;
    assert_eq!(ftp.login(CODE).await, 530);
    assert_eq!(ftp.login("87654321").await, 230);
    printer.manager.stop().await;
}

#[tokio::test]
async fn mode_switch_changes_the_pipeline() {
    let printer = Printer::start(EmulationMode::ServerImmediate).await;
    printer
        .manager
        .configure(config(EmulationMode::ServerReview))
        .await
        .unwrap();

    let mut ftp = Ftp::connect(printer.addr("ftp").await).await;
    assert_eq!(ftp.login(CODE).await, 230);
    assert_eq!(ftp.store("Review.3mf", b"PK\x03\x04").await, 226);

    assert_eq!(wait_for_file(&printer.archive_bucket("review")).await, b"PK\x03\x04");
    assert!(!printer.archive_bucket("archived").exists());
    printer.manager.stop().await;
}

// =========================================================================
// Message broker
// =========================================================================

async fn read_packet(stream: &mut TlsStream<TcpStream>, buf: &mut Vec<u8>) -> Packet {
    loop {
        if let Some((packet, used)) = decode(buf).unwrap() {
            buf.drain(..used);
            return packet;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert_ne!(n, 0, "broker closed the connection");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn broker_connack_then_status_push() {
    let printer = Printer::start(EmulationMode::ServerImmediate).await;
    let mut stream = tls_connect(printer.addr("broker").await).await;
    let connect = Packet::Connect(Connect {
        protocol_level: 4,
        client_id: "slicer".into(),
        clean_session: true,
        keep_alive: 60,
        username: Some("bblp".into()),
        password: Some(CODE.as_bytes().to_vec()),
    });
    stream.write_all(&encode(&connect)).await.unwrap();

    let mut buf = Vec::new();
    let connack = read_packet(&mut stream, &mut buf).await;
    assert_eq!(
        connack,
        Packet::ConnAck {
            session_present: false,
            code: CONNACK_ACCEPTED
        }
    );

    let push = tokio::time::timeout(Duration::from_secs(1), read_packet(&mut stream, &mut buf))
        .await
        .expect("no status push within a second");
    let Packet::Publish(publish) = push else {
        panic!("expected a publish, got {}", push.name());
    };
    assert_eq!(publish.topic, format!("device/{SERIAL}/report"));
    let body: serde_json::Value = serde_json::from_slice(&publish.payload).unwrap();
    assert_eq!(body["print"]["command"], "push_status");
    assert_eq!(body["print"]["gcode_state"], "IDLE");
    printer.manager.stop().await;
}
