//! Virtual printer lifecycle.
//!
//! The manager owns every running service. A configuration change either
//! updates the running services in place (access code only), or stops them
//! all and starts the set the new mode needs. Each service is an independent
//! task sharing one shutdown signal, so a failing listener never takes the
//! others down with it.

pub mod paths;
pub mod router;

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use vprinter_core::config::requires_restart;
use vprinter_core::{DeviceIdentity, EmulationMode, PortConfig, VirtualPrinterConfig, net};
use vprinter_crypto::{CertError, CertificateAuthority};
use vprinter_relay::{DiscoveryRelay, RelayError, TlsRelay};

pub use paths::StoragePaths;
pub use router::{JOB_EXTENSION, Pipeline, UploadRouter};

use crate::discovery::{DiscoveryResponder, advertisement};
use crate::events::{JobArchive, PrintCommandHandler};
use crate::ftp::{FtpServer, PassivePorts, SessionContext, Timeouts};
use crate::handshake::HandshakeResponder;
use crate::mqtt::{BrokerContext, JobTracker, MqttBroker, PUSH_INTERVAL, broker};

/// Pause between stopping and restarting so the OS releases the ports.
pub const PORT_RELEASE_DELAY: Duration = Duration::from_millis(500);

/// How long each service gets to exit after the shutdown signal.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] vprinter_core::Error),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Cannot resolve relay target {0}")]
    InvalidTarget(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// External services the manager hands events to.
#[derive(Clone)]
pub struct Collaborators {
    pub archive: Arc<dyn JobArchive>,
    pub print: Option<Arc<dyn PrintCommandHandler>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Stopped,
    ServerRunning,
    RelayRunning,
}

/// A listener that bound successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub name: &'static str,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStatus {
    pub state: ManagerState,
    pub mode: Option<EmulationMode>,
    /// Serial the device presents, in relay mode the real printer's.
    pub serial: Option<String>,
    pub listeners: Vec<ListenerInfo>,
}

struct Service {
    info: ListenerInfo,
    task: JoinHandle<()>,
}

struct Running {
    state: ManagerState,
    mode: EmulationMode,
    serial: String,
    access_code: String,
    shutdown: watch::Sender<bool>,
    access_code_tx: watch::Sender<String>,
    services: Vec<Service>,
}

#[derive(Default)]
struct Inner {
    config: Option<VirtualPrinterConfig>,
    running: Option<Running>,
}

/// Collects the services of one start attempt.
struct Launcher {
    shutdown: watch::Receiver<bool>,
    services: Vec<Service>,
}

impl Launcher {
    fn spawn<F>(&mut self, name: &'static str, addr: SocketAddr, run: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(service = name, addr = %addr, "Service started");
        self.services.push(Service {
            info: ListenerInfo { name, addr },
            task: tokio::spawn(run),
        });
    }

    fn shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }
}

fn bind_failed(service: &'static str, addr: SocketAddr, error: &dyn std::fmt::Display) {
    warn!(service, addr = %addr, error = %error, "Listener unavailable, continuing without it");
}

pub struct VirtualPrinterManager {
    paths: StoragePaths,
    collaborators: Collaborators,
    job: JobTracker,
    inner: Mutex<Inner>,
}

impl VirtualPrinterManager {
    pub fn new(paths: StoragePaths, collaborators: Collaborators) -> Self {
        Self {
            paths,
            collaborators,
            job: JobTracker::new(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub const fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Job state reported by the broker.
    pub fn job(&self) -> JobTracker {
        self.job.clone()
    }

    /// Apply a new configuration.
    ///
    /// Invalid configurations are rejected before anything is touched.
    pub async fn configure(&self, config: VirtualPrinterConfig) -> Result<(), ManagerError> {
        config.validate()?;
        let mut inner = self.inner.lock().await;
        let previous = inner.config.replace(config.clone());

        if !config.enabled {
            if inner.running.is_some() {
                info!("Virtual printer disabled");
                Self::stop_locked(&mut inner).await;
            }
            return Ok(());
        }

        if inner.running.is_none() {
            return self.start_locked(&mut inner, &config).await;
        }

        let restart = previous.as_ref().is_none_or(|old| requires_restart(old, &config));
        if restart {
            info!(mode = %config.mode, model = %config.device_model, "Configuration changed, restarting");
            Self::stop_locked(&mut inner).await;
            tokio::time::sleep(PORT_RELEASE_DELAY).await;
            return self.start_locked(&mut inner, &config).await;
        }

        let changed = inner
            .running
            .as_mut()
            .filter(|running| running.access_code != config.access_code);
        if let Some(running) = changed {
            running.access_code.clone_from(&config.access_code);
            running.access_code_tx.send_replace(config.access_code);
            info!("Access code updated");
        }
        Ok(())
    }

    /// Stop every service.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        Self::stop_locked(&mut inner).await;
    }

    pub async fn status(&self) -> ManagerStatus {
        let inner = self.inner.lock().await;
        match &inner.running {
            Some(running) => ManagerStatus {
                state: running.state,
                mode: Some(running.mode),
                serial: Some(running.serial.clone()),
                listeners: running.services.iter().map(|s| s.info.clone()).collect(),
            },
            None => ManagerStatus {
                state: ManagerState::Stopped,
                mode: None,
                serial: None,
                listeners: Vec::new(),
            },
        }
    }

    async fn stop_locked(inner: &mut Inner) {
        let Some(running) = inner.running.take() else {
            return;
        };
        running.shutdown.send_replace(true);

        for mut service in running.services {
            if tokio::time::timeout(STOP_TIMEOUT, &mut service.task)
                .await
                .is_err()
            {
                warn!(service = service.info.name, "Service did not stop in time, aborting");
                service.task.abort();
                let _ = service.task.await;
            }
        }
        info!(serial = %running.serial, "Virtual printer stopped");
    }

    async fn start_locked(
        &self,
        inner: &mut Inner,
        config: &VirtualPrinterConfig,
    ) -> Result<(), ManagerError> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (access_code_tx, access_code_rx) = watch::channel(config.access_code.clone());
        let mut launcher = Launcher {
            shutdown: shutdown_rx,
            services: Vec::new(),
        };

        let (state, serial) = if let Some(pipeline) = Pipeline::for_mode(config.mode) {
            let serial = self
                .start_server(config, pipeline, access_code_rx, &mut launcher)
                .await?;
            (ManagerState::ServerRunning, serial)
        } else {
            let serial = self.start_relay(config, &mut launcher).await?;
            (ManagerState::RelayRunning, serial)
        };

        if launcher.services.is_empty() {
            warn!(serial = %serial, "No listener could be bound");
        }
        info!(
            mode = %config.mode,
            serial = %serial,
            listeners = launcher.services.len(),
            "Virtual printer started"
        );
        inner.running = Some(Running {
            state,
            mode: config.mode,
            serial,
            access_code: config.access_code.clone(),
            shutdown,
            access_code_tx,
            services: launcher.services,
        });
        Ok(())
    }

    /// Leaf addresses beyond the defaults: a specific bind address and the
    /// secondary advertise address.
    fn extra_addresses(config: &VirtualPrinterConfig) -> Vec<String> {
        let mut extra = Vec::new();
        if !config.bind_address.is_unspecified() {
            extra.push(config.bind_address.to_string());
        }
        if let Some(secondary) = config.secondary_advertise_address {
            extra.push(secondary.to_string());
        }
        extra
    }

    /// Make sure the leaf matches `serial` and `extra`, then build the
    /// slicer-facing TLS configuration.
    fn provision(&self, serial: &str, extra: &[String]) -> Result<Arc<ServerConfig>, ManagerError> {
        let ca = CertificateAuthority::new(self.paths.authority_dir(), self.paths.leaf_dir());
        if !ca.leaf_matches(serial, extra) {
            ca.invalidate_leaf()?;
        }
        let chain = ca.ensure_chain(serial, extra)?;
        Ok(vprinter_crypto::server_config(&chain)?)
    }

    async fn start_server(
        &self,
        config: &VirtualPrinterConfig,
        pipeline: Pipeline,
        access_code: watch::Receiver<String>,
        launcher: &mut Launcher,
    ) -> Result<String, ManagerError> {
        let identity = DeviceIdentity::derive(&config.device_model, config.display_name.as_deref())?;
        let tls = TlsAcceptor::from(self.provision(&identity.serial, &Self::extra_addresses(config))?);
        let upload_dir = self.paths.upload_dir();
        tokio::fs::create_dir_all(&upload_dir).await?;

        let bind = config.bind_address;
        let ports = &config.ports;
        Self::start_discovery(&identity, config, launcher).await;

        for &port in &ports.handshake {
            let addr = SocketAddr::new(bind, port);
            match HandshakeResponder::bind(addr, identity.clone()).await {
                Ok(responder) => {
                    let addr = responder.local_addr().unwrap_or(addr);
                    launcher.spawn("handshake", addr, responder.run(launcher.shutdown()));
                }
                Err(e) => bind_failed("handshake", addr, &e),
            }
        }

        let router = UploadRouter::new(pipeline, Arc::clone(&self.collaborators.archive), self.job.clone());
        let ctx = SessionContext {
            access_code: access_code.clone(),
            upload_dir,
            passive: PassivePorts::new(ports.passive_start, ports.passive_end),
            data_bind: bind,
            data_tls: Some(tls.clone()),
            on_file: Some(Arc::new(router)),
            timeouts: Timeouts::default(),
        };
        let addr = SocketAddr::new(bind, ports.file_transfer);
        match FtpServer::bind(addr, Some(tls.clone()), ctx).await {
            Ok(server) => {
                let addr = server.local_addr().unwrap_or(addr);
                launcher.spawn("ftp", addr, server.run(launcher.shutdown()));
            }
            Err(e) => bind_failed("ftp", addr, &e),
        }

        let ctx = BrokerContext {
            serial: identity.serial.clone(),
            access_code,
            job: self.job.clone(),
            on_print: self.collaborators.print.clone(),
            push_interval: PUSH_INTERVAL,
            connect_timeout: broker::CONNECT_TIMEOUT,
        };
        let addr = SocketAddr::new(bind, ports.broker);
        match MqttBroker::bind(addr, Some(tls), ctx).await {
            Ok(broker) => {
                let addr = broker.local_addr().unwrap_or(addr);
                launcher.spawn("broker", addr, broker.run(launcher.shutdown()));
            }
            Err(e) => bind_failed("broker", addr, &e),
        }

        Ok(identity.serial)
    }

    async fn start_discovery(
        identity: &DeviceIdentity,
        config: &VirtualPrinterConfig,
        launcher: &mut Launcher,
    ) {
        let bind = config.bind_address;
        let location = config
            .secondary_advertise_address
            .unwrap_or_else(|| net::advertise_address(bind));
        let addr = SocketAddr::new(bind, config.ports.discovery);
        match DiscoveryResponder::bind(bind, config.ports.discovery, advertisement(identity, location)).await {
            Ok(responder) => {
                let addr = responder.local_addr().unwrap_or(addr);
                launcher.spawn("discovery", addr, responder.run(launcher.shutdown()));
            }
            Err(e) => bind_failed("discovery", addr, &e),
        }
    }

    async fn start_relay(
        &self,
        config: &VirtualPrinterConfig,
        launcher: &mut Launcher,
    ) -> Result<String, ManagerError> {
        let target_host = config
            .target_host()
            .ok_or_else(|| ManagerError::InvalidTarget("(unset)".to_string()))?;
        let target_ip = resolve(target_host).await?;

        let derived = DeviceIdentity::derive(&config.device_model, config.display_name.as_deref())?;
        let serial = config
            .target_serial()
            .map_or_else(|| derived.serial.clone(), str::to_string);
        let identity = derived.with_serial(serial.clone());

        let server_config = self.provision(&serial, &Self::extra_addresses(config))?;
        let client_config = vprinter_crypto::insecure_client_config()?;

        if let Some(secondary) = config.secondary_advertise_address {
            let primary = net::route_source_address(target_ip)?;
            match DiscoveryRelay::bind(target_ip, primary, secondary, config.ports.discovery).await {
                Ok(relay) => {
                    let addr = relay
                        .local_addr()
                        .unwrap_or_else(|_| SocketAddr::new(primary, config.ports.discovery));
                    launcher.spawn("discovery-relay", addr, relay.run(launcher.shutdown()));
                }
                Err(e) => bind_failed("discovery-relay", SocketAddr::new(primary, config.ports.discovery), &e),
            }
        } else {
            Self::start_discovery(&identity, config, launcher).await;
        }

        // Real printers always listen on the vendor ports.
        let printer = PortConfig::default();
        for (name, listen_port, target_port) in [
            ("ftp-relay", config.ports.file_transfer, printer.file_transfer),
            ("broker-relay", config.ports.broker, printer.broker),
        ] {
            let addr = SocketAddr::new(config.bind_address, listen_port);
            match TlsRelay::bind(
                name,
                addr,
                Arc::clone(&server_config),
                Arc::clone(&client_config),
                target_host,
                target_port,
            )
            .await
            {
                Ok(relay) => {
                    let addr = relay.local_addr().unwrap_or(addr);
                    launcher.spawn(name, addr, relay.run(launcher.shutdown()));
                }
                Err(e @ RelayError::Bind { .. }) => bind_failed(name, addr, &e),
                Err(e) => return Err(e.into()),
            }
        }

        info!(target = %target_host, serial = %serial, "Relaying to printer");
        Ok(serial)
    }
}

/// First address `host` resolves to.
async fn resolve(host: &str) -> Result<IpAddr, ManagerError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ManagerError::InvalidTarget(format!("{host}: {e}")))?
        .map(|addr| net::canonical_ip(addr.ip()))
        .next()
        .ok_or_else(|| ManagerError::InvalidTarget(host.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[path = "manager_tests.rs"]
mod tests;
