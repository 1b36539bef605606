use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::meshport::{
    cluster::ClusterReconciler,
    config::{
        Config, ConfigError, ConfigStore, DashboardConfig, KubernetesConfig, LoggingConfig,
        RouteConfig, TailscaleConfig,
    },
    overlay::{DirectOverlay, OverlayClient},
    route::{HttpForwarder, Route, RouteError, RouteInfo},
    timeseries::DataPoint,
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("route {id:?} not found")]
    NotFound { id: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Route(#[from] RouteError),
}

/// Owns the route set and the overlay client.
///
/// All mutating operations hold the write guard for their entire critical
/// section (the registry acts as a single writer); readers clone `RouteInfo`
/// projections out of the read guard. Every mutation rewrites the config file
/// (best-effort) and feeds the current route set to the cluster reconciler.
pub struct Registry {
    state: RwLock<State>,
    store: ConfigStore,
    cluster: Option<ClusterReconciler>,
}

struct State {
    routes: HashMap<String, Route>,
    overlay: Arc<dyn OverlayClient>,
    tailscale: TailscaleConfig,
    dashboard: DashboardConfig,
    kubernetes: Option<KubernetesConfig>,
    logging: LoggingConfig,
    listen_addr: String,
}

impl Registry {
    pub async fn new(cfg: Config, store: ConfigStore) -> anyhow::Result<Self> {
        let overlay: Arc<dyn OverlayClient> = Arc::new(DirectOverlay::new(&cfg.tailscale)?);

        let cluster = match &cfg.kubernetes {
            Some(kc) => Some(ClusterReconciler::new(kc).await?),
            None => None,
        };

        let mut routes = HashMap::new();
        for mut rc in cfg.routes {
            if let Err(err) = rc.validate() {
                tracing::warn!(route = %rc.name, err = %err, "registry: skipping invalid route from config");
                continue;
            }
            if rc.id.is_empty() {
                rc.id = Uuid::new_v4().to_string();
            }
            if routes.contains_key(&rc.id) {
                tracing::warn!(route = %rc.name, id = %rc.id, "registry: skipping duplicate route id from config");
                continue;
            }
            routes.insert(rc.id.clone(), Route::new(rc));
        }

        Ok(Self {
            state: RwLock::new(State {
                routes,
                overlay,
                tailscale: cfg.tailscale,
                dashboard: cfg.dashboard,
                kubernetes: cfg.kubernetes,
                logging: cfg.logging,
                listen_addr: cfg.listen_addr,
            }),
            store,
            cluster,
        })
    }

    pub async fn add_route(&self, mut cfg: RouteConfig) -> Result<RouteInfo, RegistryError> {
        cfg.validate()?;
        let mut st = self.state.write().await;
        if cfg.id.is_empty() {
            cfg.id = Uuid::new_v4().to_string();
        }
        check_unique(&st.routes, &cfg, None)?;

        let route = Route::new(cfg.clone());
        let info = route.info();
        st.routes.insert(cfg.id, route);
        self.sync(&st).await;
        Ok(info)
    }

    /// Stop, swap config, start. A failed restart leaves the route `Stopped`
    /// and surfaces the error; the new config is kept either way.
    pub async fn update_route(&self, cfg: RouteConfig) -> Result<RouteInfo, RegistryError> {
        cfg.validate()?;
        let mut st = self.state.write().await;
        if !st.routes.contains_key(&cfg.id) {
            return Err(RegistryError::NotFound {
                id: cfg.id.clone(),
            });
        }
        check_unique(&st.routes, &cfg, Some(&cfg.id))?;

        let overlay = st.overlay.clone();
        let id = cfg.id.clone();
        let route = st.routes.get_mut(&id).ok_or(RegistryError::NotFound {
            id: id.clone(),
        })?;

        // A change of route class swaps the concrete variant.
        let res = if route.config().kind.is_network() == cfg.kind.is_network() {
            route.update(cfg, overlay).await
        } else {
            route.stop().await;
            let mut fresh = Route::new(cfg);
            let res = fresh.start(overlay).await;
            *route = fresh;
            res
        };
        let info = route.info();

        self.sync(&st).await;
        res?;
        Ok(info)
    }

    pub async fn delete_route(&self, id: &str) -> Result<(), RegistryError> {
        let mut st = self.state.write().await;
        let Some(mut route) = st.routes.remove(id) else {
            return Err(RegistryError::NotFound { id: id.into() });
        };
        route.stop().await;
        self.sync(&st).await;
        Ok(())
    }

    /// No-op for disabled routes.
    pub async fn start_route(&self, id: &str) -> Result<(), RegistryError> {
        let mut st = self.state.write().await;
        let overlay = st.overlay.clone();
        let Some(route) = st.routes.get_mut(id) else {
            return Err(RegistryError::NotFound { id: id.into() });
        };
        if !route.config().enabled {
            return Ok(());
        }
        let res = route.start(overlay).await;
        self.sync(&st).await;
        res?;
        Ok(())
    }

    pub async fn stop_route(&self, id: &str) -> Result<(), RegistryError> {
        let mut st = self.state.write().await;
        let Some(route) = st.routes.get_mut(id) else {
            return Err(RegistryError::NotFound { id: id.into() });
        };
        route.stop().await;
        self.sync(&st).await;
        Ok(())
    }

    pub async fn start_all(&self) {
        let mut st = self.state.write().await;
        let overlay = st.overlay.clone();
        for route in st.routes.values_mut() {
            if !route.config().enabled {
                continue;
            }
            if let Err(err) = route.start(overlay.clone()).await {
                tracing::warn!(route = %route.config().name, err = %err, "registry: route start failed");
            }
        }
    }

    /// Blocks until every route has fully stopped and joined its tasks.
    pub async fn stop_all(&self) {
        let mut st = self.state.write().await;
        for route in st.routes.values_mut() {
            route.stop().await;
        }
    }

    /// Tear down the overlay client, stop all routes, rebuild the client from
    /// the new settings, then restart every enabled route.
    pub async fn update_overlay(&self, ts: TailscaleConfig) -> anyhow::Result<()> {
        let mut st = self.state.write().await;
        for route in st.routes.values_mut() {
            route.stop().await;
        }
        st.tailscale = ts;
        st.overlay = Arc::new(DirectOverlay::new(&st.tailscale)?);
        let overlay = st.overlay.clone();
        for route in st.routes.values_mut() {
            if !route.config().enabled {
                continue;
            }
            if let Err(err) = route.start(overlay.clone()).await {
                tracing::warn!(route = %route.config().name, err = %err, "registry: route restart failed");
            }
        }
        self.sync(&st).await;
        Ok(())
    }

    pub async fn close(&self) {
        self.stop_all().await;
    }

    pub async fn get(&self, id: &str) -> Option<RouteInfo> {
        let st = self.state.read().await;
        st.routes.get(id).map(Route::info)
    }

    pub async fn get_by_name(&self, name: &str) -> Option<RouteInfo> {
        let st = self.state.read().await;
        st.routes
            .values()
            .find(|r| r.config().name == name)
            .map(Route::info)
    }

    pub async fn get_all(&self) -> Vec<RouteInfo> {
        let st = self.state.read().await;
        let mut out: Vec<RouteInfo> = st.routes.values().map(Route::info).collect();
        out.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        out
    }

    pub async fn timeseries(&self, id: &str) -> Option<Vec<DataPoint>> {
        let st = self.state.read().await;
        st.routes.get(id).map(Route::points)
    }

    /// Per-request handle for the admin surface's virtual-host demux.
    pub async fn http_forwarder(&self, host: &str) -> Option<HttpForwarder> {
        let st = self.state.read().await;
        let route = st
            .routes
            .values()
            .find(|r| r.config().kind.is_http() && r.config().name == host)?;
        match route {
            Route::Http(r) => Some(r.forwarder(st.overlay.http_client().clone())),
            Route::Network(_) => None,
        }
    }

    pub async fn tailscale_settings(&self) -> TailscaleConfig {
        self.state.read().await.tailscale.clone()
    }

    pub async fn dashboard_settings(&self) -> DashboardConfig {
        self.state.read().await.dashboard.clone()
    }

    pub async fn update_dashboard(&self, dashboard: DashboardConfig) -> DashboardConfig {
        let mut st = self.state.write().await;
        st.dashboard = dashboard;
        self.sync(&st).await;
        st.dashboard.clone()
    }

    /// Persist the full config and reconcile cluster objects. Both are
    /// best-effort: failures are logged, never surfaced to the caller.
    async fn sync(&self, st: &State) {
        let mut routes: Vec<RouteConfig> = st.routes.values().map(|r| r.config().clone()).collect();
        routes.sort_by(|a, b| a.name.cmp(&b.name));

        let cfg = Config {
            tailscale: st.tailscale.clone(),
            dashboard: st.dashboard.clone(),
            kubernetes: st.kubernetes.clone(),
            logging: st.logging.clone(),
            listen_addr: st.listen_addr.clone(),
            routes,
        };
        if let Err(err) = self.store.save(&cfg) {
            tracing::warn!(path = %self.store.path().display(), err = %err, "registry: config save failed");
        }
        if let Some(cluster) = &self.cluster {
            cluster.reconcile(&cfg.routes).await;
        }
    }
}

fn check_unique(
    routes: &HashMap<String, Route>,
    cfg: &RouteConfig,
    exclude_id: Option<&str>,
) -> Result<(), RegistryError> {
    for (id, other) in routes {
        if exclude_id == Some(id.as_str()) {
            continue;
        }
        let oc = other.config();
        if oc.id == cfg.id {
            return Err(RegistryError::Conflict(format!(
                "route id {:?} already exists",
                cfg.id
            )));
        }
        if cfg.kind.is_network() && oc.kind == cfg.kind && oc.port == cfg.port {
            return Err(RegistryError::Conflict(format!(
                "port {} already used by {} route {:?}",
                cfg.port, oc.kind, oc.name
            )));
        }
        if cfg.kind.is_http() && oc.kind.is_http() && oc.name == cfg.name {
            return Err(RegistryError::Conflict(format!(
                "http route name {:?} already exists",
                cfg.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshport::{
        config::{Machine, RouteKind},
        route::RouteStatus,
    };

    fn temp_store(tag: &str) -> ConfigStore {
        let dir = std::env::temp_dir().join(format!(
            "meshport-registry-{}-{}",
            tag,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        ConfigStore::new(dir.join("config.yaml"))
    }

    async fn registry(tag: &str) -> Registry {
        Registry::new(Config::default(), temp_store(tag)).await.unwrap()
    }

    fn tcp_cfg(name: &str, port: u16) -> RouteConfig {
        RouteConfig {
            id: String::new(),
            enabled: true,
            name: name.into(),
            kind: RouteKind::Tcp,
            port,
            machine: Machine {
                address: "10.0.0.1".into(),
                port: 9000,
            },
        }
    }

    fn http_cfg(name: &str) -> RouteConfig {
        RouteConfig {
            id: String::new(),
            enabled: true,
            name: name.into(),
            kind: RouteKind::Http,
            port: 0,
            machine: Machine {
                address: "10.0.0.2".into(),
                port: 80,
            },
        }
    }

    #[tokio::test]
    async fn add_assigns_id_and_projects_config() {
        let reg = registry("add").await;
        let info = reg.add_route(tcp_cfg("ssh", 7000)).await.unwrap();
        assert!(!info.config.id.is_empty());
        assert_eq!(info.status, RouteStatus::Stopped);

        let got = reg.get(&info.config.id).await.unwrap();
        assert_eq!(got.config.name, "ssh");
        assert_eq!(got.config.port, 7000);
    }

    #[tokio::test]
    async fn delete_removes_route() {
        let reg = registry("delete").await;
        let info = reg.add_route(tcp_cfg("ssh", 7001)).await.unwrap();
        reg.delete_route(&info.config.id).await.unwrap();
        assert!(reg.get(&info.config.id).await.is_none());
        assert!(matches!(
            reg.delete_route(&info.config.id).await,
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn uniqueness_is_enforced() {
        let reg = registry("unique").await;
        reg.add_route(tcp_cfg("one", 7002)).await.unwrap();
        assert!(matches!(
            reg.add_route(tcp_cfg("two", 7002)).await,
            Err(RegistryError::Conflict(_))
        ));

        reg.add_route(http_cfg("svc.example")).await.unwrap();
        assert!(matches!(
            reg.add_route(http_cfg("svc.example")).await,
            Err(RegistryError::Conflict(_))
        ));

        // Same port across different network protocols is allowed.
        let mut udp = tcp_cfg("udp-one", 7002);
        udp.kind = RouteKind::Udp;
        reg.add_route(udp).await.unwrap();
    }

    #[tokio::test]
    async fn disabled_routes_stay_stopped() {
        let reg = registry("disabled").await;
        let mut cfg = tcp_cfg("off", 1);
        cfg.enabled = false;
        let info = reg.add_route(cfg).await.unwrap();

        reg.start_all().await;
        assert_eq!(
            reg.get(&info.config.id).await.unwrap().status,
            RouteStatus::Stopped
        );

        // Explicit start is also a no-op while disabled.
        reg.start_route(&info.config.id).await.unwrap();
        assert_eq!(
            reg.get(&info.config.id).await.unwrap().status,
            RouteStatus::Stopped
        );
    }

    #[tokio::test]
    async fn update_unknown_route_fails() {
        let reg = registry("upd-missing").await;
        let mut cfg = tcp_cfg("ghost", 7003);
        cfg.id = "nope".into();
        assert!(matches!(
            reg.update_route(cfg).await,
            Err(RegistryError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn start_stop_through_registry() {
        let reg = registry("lifecycle").await;

        // Reserve a free port, then hand it to the route.
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut cfg = tcp_cfg("live", port);
        cfg.machine = Machine {
            address: "127.0.0.1".into(),
            port: 1,
        };
        let info = reg.add_route(cfg).await.unwrap();

        reg.start_route(&info.config.id).await.unwrap();
        assert_eq!(
            reg.get(&info.config.id).await.unwrap().status,
            RouteStatus::Running
        );

        reg.stop_route(&info.config.id).await.unwrap();
        assert_eq!(
            reg.get(&info.config.id).await.unwrap().status,
            RouteStatus::Stopped
        );
    }

    #[tokio::test]
    async fn lookup_by_name_and_host() {
        let reg = registry("names").await;
        reg.add_route(http_cfg("svc.example")).await.unwrap();

        let info = reg.get_by_name("svc.example").await.unwrap();
        assert!(info.config.kind.is_http());

        assert!(reg.http_forwarder("svc.example").await.is_some());
        assert!(reg.http_forwarder("other.example").await.is_none());
    }

    #[tokio::test]
    async fn mutations_persist_to_store() {
        let store = temp_store("persist");
        let reg = Registry::new(Config::default(), store.clone()).await.unwrap();
        reg.add_route(tcp_cfg("saved", 7004)).await.unwrap();

        let on_disk = store.load().unwrap();
        assert_eq!(on_disk.routes.len(), 1);
        assert_eq!(on_disk.routes[0].name, "saved");
    }
}
