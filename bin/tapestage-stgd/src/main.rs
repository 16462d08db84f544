//! Tapestage STGD - Staging Daemon
//!
//! Accepts stage requests from clients, keeps the stage catalog and runs the
//! mover workers that copy files between the stage pools and their archives.

mod connection;

use anyhow::{Context, Result};
use clap::Parser;
use connection::{ConnectionSettings, accept_loop};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tapestage_catalog::CatalogStore;
use tapestage_common::Config;
use tapestage_common::config::LogFormat;
use tapestage_stager::{LocalNameServer, ProcessLauncher, Stager, StagerEvent};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tapestage-stgd")]
#[command(about = "Tapestage Staging Daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        env = "TAPESTAGE_CONFIG",
        default_value = "/etc/tapestage/stgd.toml"
    )]
    config: PathBuf,

    /// Listen address for client requests
    #[arg(short, long)]
    listen: Option<String>,

    /// Directory holding the persistent catalog
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long)]
    log_level: Option<String>,

    /// Keep the catalog in memory only
    #[arg(long)]
    ephemeral: bool,
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        eprintln!(
            "Config file {} not found, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Config::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn open_store(data_dir: &Path) -> Result<Arc<CatalogStore>> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let path = data_dir.join("stage.redb");
    let store = CatalogStore::open(&path).with_context(|| format!("opening {}", path.display()))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e:#}");
            std::process::exit(1);
        }
    };
    if let Some(listen) = &args.listen {
        config.daemon.listen.clone_from(listen);
    }
    if let Some(data_dir) = &args.data_dir {
        config.daemon.data_dir.clone_from(data_dir);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }

    init_logging(&config.logging.level, config.logging.format);

    let host = gethostname::gethostname().to_string_lossy().into_owned();
    info!("Starting Tapestage STGD {}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config.display());
    info!("Host: {}", host);
    info!("Pools: {}", config.pools.len());

    let store = if args.ephemeral {
        warn!("Running with an in-memory catalog, nothing survives a restart");
        None
    } else {
        info!("Data directory: {}", config.daemon.data_dir.display());
        match open_store(&config.daemon.data_dir) {
            Ok(store) => Some(store),
            Err(e) => {
                error!("Failed to open catalog: {:#}", e);
                std::process::exit(1);
            }
        }
    };

    let settings = ConnectionSettings {
        read_timeout: Duration::from_secs(config.daemon.read_timeout_secs),
        max_message_size: config.daemon.max_message_size,
    };
    let listen = config.daemon.listen.clone();

    let (tx, rx) = mpsc::unbounded_channel();
    let launcher = Arc::new(ProcessLauncher::new(tx.clone()));
    let names = Arc::new(LocalNameServer::default());
    let stager = match Stager::new(config, launcher, names, store, tx.clone()) {
        Ok(stager) => stager.with_config_path(&args.config),
        Err(e) => {
            error!("Failed to start stager: {}", e);
            std::process::exit(1);
        }
    };

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!("Listening on {}", listen);

    let coordinator = tokio::spawn(stager.run(rx));
    let acceptor = tokio::spawn(accept_loop(listener, tx.clone(), settings));

    let shutdown = tx;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, draining running work");
            let _ = shutdown.send(StagerEvent::Shutdown);
        }
    });

    coordinator.await.context("stager task")?;
    acceptor.abort();
    info!("Tapestage STGD stopped");
    Ok(())
}
