use std::{net::SocketAddr, sync::Arc};

use serde::Serialize;

use crate::meshport::{
    config::RouteConfig,
    overlay::OverlayClient,
    timeseries::{DataPoint, Throughput},
};

pub mod http;
pub mod network;

pub use http::{HttpForwarder, HttpRoute};
pub use network::NetworkRoute;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("resolve listen address {addr:?}: {source}")]
    Resolve {
        addr: String,
        source: std::net::AddrParseError,
    },
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Read-only projection handed to API callers: config plus runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    #[serde(flatten)]
    pub config: RouteConfig,
    pub status: RouteStatus,
    pub stats: Throughput,
}

/// A forwarding rule plus its runtime state machine.
///
/// Two concrete kinds share the capability set; operations dispatch by match
/// rather than inheritance. UDP routes use the network variant and dial the
/// overlay with the UDP protocol.
pub enum Route {
    Network(NetworkRoute),
    Http(HttpRoute),
}

impl Route {
    pub fn new(config: RouteConfig) -> Self {
        if config.kind.is_network() {
            Route::Network(NetworkRoute::new(config))
        } else {
            Route::Http(HttpRoute::new(config))
        }
    }

    pub async fn start(&mut self, overlay: Arc<dyn OverlayClient>) -> Result<(), RouteError> {
        match self {
            Route::Network(r) => r.start(overlay).await,
            Route::Http(r) => {
                r.start();
                Ok(())
            }
        }
    }

    pub async fn stop(&mut self) {
        match self {
            Route::Network(r) => r.stop().await,
            Route::Http(r) => r.stop(),
        }
    }

    /// Stop, swap the config, start (network); config swap only (http).
    pub async fn update(
        &mut self,
        config: RouteConfig,
        overlay: Arc<dyn OverlayClient>,
    ) -> Result<(), RouteError> {
        match self {
            Route::Network(r) => r.update(config, overlay).await,
            Route::Http(r) => {
                r.update(config);
                Ok(())
            }
        }
    }

    pub fn config(&self) -> &RouteConfig {
        match self {
            Route::Network(r) => r.config(),
            Route::Http(r) => r.config(),
        }
    }

    pub fn status(&self) -> RouteStatus {
        match self {
            Route::Network(r) => r.status(),
            Route::Http(r) => r.status(),
        }
    }

    pub fn stats(&self) -> Throughput {
        match self {
            Route::Network(r) => r.data().total(),
            Route::Http(r) => r.data().total(),
        }
    }

    pub fn points(&self) -> Vec<DataPoint> {
        match self {
            Route::Network(r) => r.data().points(),
            Route::Http(r) => r.data().points(),
        }
    }

    pub fn info(&self) -> RouteInfo {
        RouteInfo {
            config: self.config().clone(),
            status: self.status(),
            stats: self.stats(),
        }
    }
}
