use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::meshport::{api, config, logging, net, registry::Registry};

const DEFAULT_ASSETS_DIR: &str = "./dashboard/dist";

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config::resolve_config_path(config_path);
    let store = config::ConfigStore::new(path.clone());

    let cfg = store
        .load()
        .with_context(|| format!("load config: {}", path.display()))?;

    // Held until shutdown so buffered log lines flush.
    let _log_guard = logging::init(&cfg.logging)?;

    let prom = init_prometheus()?;

    tracing::info!(
        config = %path.display(),
        routes = cfg.routes.len(),
        cluster = cfg.kubernetes.is_some(),
        listen_addr = %cfg.listen_addr,
        "meshport: starting"
    );

    let listen_addr = net::normalize_bind_addr(&cfg.listen_addr).into_owned();
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr: {}", cfg.listen_addr))?;

    let registry = Arc::new(Registry::new(cfg, store).await?);
    registry.start_all().await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let state = api::ApiState {
        registry: registry.clone(),
        assets_dir: PathBuf::from(DEFAULT_ASSETS_DIR),
        metrics: prom,
    };
    let admin = tokio::spawn(api::serve(addr, state, shutdown_rx));

    shutdown_signal().await;
    tracing::info!("shutdown: signal");
    let _ = shutdown_tx.send(true);

    registry.close().await;
    match admin.await {
        Ok(res) => res?,
        Err(join_err) => return Err(join_err.into()),
    }

    Ok(())
}

/// Installs a Prometheus recorder for the `metrics` crate; the handle renders
/// the exposition format for the admin `/metrics` endpoint.
fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
