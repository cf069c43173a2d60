//! faythed — the Faythe daemon.
//!
//! Wires the pieces together: keyspace client, cluster membership, the
//! scaler and healer managers, and the HTTP API. A supervisor task
//! reacts to fatal keyspace errors, membership reloads, and signals.
//!
//! # Usage
//!
//! ```text
//! faythed --config.file /etc/faythe/config.yml --listen-address 0.0.0.0:8600
//! faythed --cluster-id 4f3a... --listen-address 10.0.0.2:8600
//! ```
//!
//! An empty `--cluster-id` founds a new cluster. Exit code 2 means a
//! configuration or initialization failure.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use faythe_autohealer::HealerFactory;
use faythe_autoscaler::ScalerFactory;
use faythe_cluster::{Cluster, ClusterOptions};
use faythe_kv::etcd::EtcdBackend;
use faythe_kv::memory::MemoryBackend;
use faythe_kv::{KvBackend, KvClient, KvConfig, KvError};
use faythe_manager::Manager;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "faythed", about = "The Faythe server")]
struct Cli {
    /// Configuration file path.
    #[arg(long = "config.file", default_value = "/etc/faythe/config.yml")]
    config_file: PathBuf,

    /// Address to listen on for the API.
    #[arg(long = "listen-address", default_value = "0.0.0.0:8600")]
    listen_address: String,

    /// The URL under which Faythe is externally reachable.
    #[arg(long = "external-url")]
    external_url: Option<String>,

    /// Unique cluster ID; leave empty to initialize a new cluster.
    #[arg(long = "cluster-id", default_value = "")]
    cluster_id: String,

    /// Log level when RUST_LOG is not set.
    #[arg(long = "log.level", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                cli.log_level
                    .parse()
                    .unwrap_or_else(|_| "info".parse().unwrap())
            }),
        )
        .init();

    info!("starting Faythe");

    // ── Configuration ──────────────────────────────────────────
    let config = match Config::load(&cli.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "error loading configuration file");
            std::process::exit(2);
        }
    };

    // ── Keyspace client ────────────────────────────────────────
    let backend: Arc<dyn KvBackend> = if config.etcd.endpoints.is_empty() {
        info!("no etcd endpoints configured, running standalone with in-memory keyspace");
        Arc::new(MemoryBackend::new())
    } else {
        let credentials = match (&config.etcd.username, &config.etcd.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };
        match EtcdBackend::connect(&config.etcd.endpoints, credentials).await {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                error!(error = %e, "error connecting to etcd");
                std::process::exit(2);
            }
        }
    };
    let (kv, err_rx) = KvClient::new(backend, KvConfig::default());

    // ── Cluster membership ─────────────────────────────────────
    let options = ClusterOptions::new(&cli.cluster_id, &cli.listen_address)
        .with_lease_ttl(config.cluster.lease_ttl_secs);
    let (cluster, reload_rx) = match Cluster::join(options, kv.clone()).await {
        Ok(joined) => joined,
        Err(e) => {
            error!(error = %e, "error initializing cluster");
            std::process::exit(2);
        }
    };
    faythe_exporter::report_cluster_members(
        cluster.cluster_id(),
        cluster.members().len() as i64,
    );

    let external_url = cli
        .external_url
        .clone()
        .unwrap_or_else(|| format!("http://{}/", cli.listen_address));
    info!(
        cluster_id = %cluster.cluster_id(),
        node_id = %cluster.local_id(),
        %external_url,
        "cluster membership established"
    );

    // ── Managers ───────────────────────────────────────────────
    let scaler_manager = Manager::start(
        kv.clone(),
        Arc::clone(&cluster),
        Arc::new(ScalerFactory::new(kv.clone(), cluster.cluster_id())),
    )
    .await;
    let healer_manager = Manager::start(
        kv.clone(),
        Arc::clone(&cluster),
        Arc::new(HealerFactory::new(kv.clone(), cluster.cluster_id())),
    )
    .await;

    // ── API server ─────────────────────────────────────────────
    let router = faythe_api::build_router(
        kv.clone(),
        vec![Arc::clone(&scaler_manager), Arc::clone(&healer_manager)],
    );
    let listener = match tokio::net::TcpListener::bind(&cli.listen_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, address = %cli.listen_address, "error binding listen address");
            std::process::exit(2);
        }
    };
    info!(address = %cli.listen_address, "listening");

    // ── Supervisor ─────────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(supervise(
        err_rx,
        reload_rx,
        Arc::clone(&cluster),
        Arc::clone(&scaler_manager),
        Arc::clone(&healer_manager),
        cli.config_file.clone(),
        shutdown_tx,
    ));

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    });
    if let Err(e) = server.await {
        error!(error = %e, "API server error");
    }

    // ── Graceful teardown ──────────────────────────────────────
    scaler_manager.stop().await;
    healer_manager.stop().await;
    cluster.stop().await;
    supervisor.abort();
    info!("Faythe stopped, bye");
}

/// React to fatal keyspace errors, membership reloads, and signals.
async fn supervise(
    mut err_rx: mpsc::Receiver<KvError>,
    mut reload_rx: mpsc::Receiver<()>,
    cluster: Arc<Cluster>,
    scaler_manager: Arc<Manager>,
    healer_manager: Arc<Manager>,
    config_file: PathBuf,
    shutdown_tx: watch::Sender<bool>,
) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGINT handler");
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "cannot install SIGHUP handler");
            return;
        }
    };

    loop {
        tokio::select! {
            fatal = err_rx.recv() => {
                if let Some(e) = fatal {
                    error!(error = %e, "fatal keyspace error, shutting down");
                }
                let _ = shutdown_tx.send(true);
                return;
            }
            _ = reload_rx.recv() => {
                info!("membership changed, rebalancing");
                scaler_manager.reload().await;
                healer_manager.reload().await;
                faythe_exporter::report_cluster_members(
                    cluster.cluster_id(),
                    cluster.members().len() as i64,
                );
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading");
                match Config::load(&config_file) {
                    // Backend endpoints cannot change without a restart;
                    // a SIGHUP re-read is for the rest of the file.
                    Ok(_) => info!("configuration re-read"),
                    Err(e) => warn!(error = %e, "configuration reload failed, keeping previous"),
                }
                if let Err(e) = cluster.refresh_members().await {
                    warn!(error = %e, "membership refresh failed");
                }
                scaler_manager.reload().await;
                healer_manager.reload().await;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, exiting gracefully");
                let _ = shutdown_tx.send(true);
                return;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, exiting gracefully");
                let _ = shutdown_tx.send(true);
                return;
            }
        }
    }
}
