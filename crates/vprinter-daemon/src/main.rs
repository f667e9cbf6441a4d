//! `VPrinter` Daemon
//!
//! Runs one virtual printer from a JSON configuration file. `SIGHUP` reloads
//! the file and applies it; `SIGTERM` or Ctrl+C stops every service.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use vprinter_core::VirtualPrinterConfig;
use vprinter_core::config::load_config_file;
use vprinter_core::tracing_init::{DEFAULT_FILTER, filter_for_level, init_tracing};
use vprinter_daemon::archive::DirectoryArchive;
use vprinter_daemon::events::LoggingPrintHandler;
use vprinter_daemon::manager::{Collaborators, StoragePaths, VirtualPrinterManager};

#[derive(Parser, Debug)]
#[command(name = "vprinter")]
#[command(version, about = "VPrinter daemon - virtual network 3D printer")]
struct Args {
    /// Configuration file (JSON). Defaults to `<data-dir>/config.json`.
    #[arg(long, env = "VPRINTER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for certificates, staged uploads and the job archive.
    #[arg(long, env = "VPRINTER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Instance name; each instance keeps its own leaf certificate and uploads.
    #[arg(long, default_value = "default", env = "VPRINTER_INSTANCE")]
    instance: String,

    /// Log level for every vprinter crate (e.g. "info", "debug"). `RUST_LOG` wins when set.
    #[arg(long, env = "VPRINTER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "VPRINTER_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = args
        .log_level
        .as_deref()
        .map_or_else(|| DEFAULT_FILTER.to_string(), filter_for_level);
    init_tracing(&filter, args.log_json);
    vprinter_crypto::install_crypto_provider();

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let config_path = args
        .config
        .unwrap_or_else(|| data_dir.join("config.json"));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config = %config_path.display(),
        instance = %args.instance,
        "Starting vprinter"
    );

    let paths = StoragePaths::new(&data_dir, args.instance);
    let collaborators = Collaborators {
        archive: Arc::new(DirectoryArchive::new(paths.archive_dir())),
        print: Some(Arc::new(LoggingPrintHandler)),
    };
    let manager = VirtualPrinterManager::new(paths, collaborators);
    manager.configure(read_config(&config_path)?).await?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    let status = manager.status().await;
    info!(state = ?status.state, listeners = status.listeners.len(), "vprinter ready");

    loop {
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();
        #[cfg(unix)]
        let sighup_future = sighup.recv();
        #[cfg(not(unix))]
        let sighup_future = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
                break;
            }
            _ = sigterm_future => {
                info!("Received SIGTERM shutdown signal");
                break;
            }
            _ = sighup_future => {
                info!("Received SIGHUP, reloading configuration");
                match read_config(&config_path) {
                    Ok(config) => {
                        if let Err(e) = manager.configure(config).await {
                            warn!(error = %e, "Failed to apply reloaded configuration");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to reload configuration"),
                }
            }
        }
    }

    manager.stop().await;
    info!("vprinter stopped");
    Ok(())
}

/// Load `path`, or a disabled default record when the file does not exist yet.
fn read_config(path: &Path) -> anyhow::Result<VirtualPrinterConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, virtual printer disabled");
        return Ok(VirtualPrinterConfig::default());
    }
    Ok(load_config_file(path)?)
}

/// Default data directory: ~/.vprinter
fn default_data_dir() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".vprinter"))
}
