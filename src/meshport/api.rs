use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tower::util::ServiceExt;
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

use crate::meshport::{
    auth,
    config::{DashboardConfig, RouteConfig, TailscaleConfig},
    net,
    registry::{Registry, RegistryError},
};

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub assets_dir: PathBuf,
    pub metrics: PrometheusHandle,
}

pub fn router(state: ApiState) -> Router {
    let protected = Router::new()
        .route(
            "/api/settings/tailscale",
            get(get_tailscale).post(update_tailscale),
        )
        .route(
            "/api/settings/dashboard",
            get(get_dashboard).post(update_dashboard),
        )
        .route("/api/routes", get(list_routes).post(create_route))
        .route(
            "/api/routes/{id}",
            get(get_route).put(update_route).delete(delete_route),
        )
        .route("/api/routes/{id}/start", post(start_route))
        .route("/api/routes/{id}/stop", post(stop_route))
        .route("/api/routes/{id}/timeseries", get(route_timeseries))
        .route_layer(middleware::from_fn(auth::require_token));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/login", post(login))
        .route("/metrics", get(render_metrics))
        .merge(protected)
        .fallback(fallback)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(state);
    let ln = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(listen = %addr, "admin: listening");

    axum::serve(ln, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn render_metrics(State(st): State<ApiState>) -> String {
    st.metrics.render()
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    authorization_token: String,
}

async fn login(State(st): State<ApiState>, Json(body): Json<LoginRequest>) -> Response {
    let dashboard = st.registry.dashboard_settings().await;
    if dashboard.username.is_empty()
        || body.username != dashboard.username
        || body.password != dashboard.password
    {
        return (StatusCode::UNAUTHORIZED, "authentication failed").into_response();
    }
    match auth::generate_token(&body.username) {
        Ok(token) => Json(LoginResponse {
            authorization_token: token,
        })
        .into_response(),
        Err(err) => {
            tracing::error!(err = %err, "auth: token generation failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_tailscale(State(st): State<ApiState>) -> Json<TailscaleConfig> {
    Json(st.registry.tailscale_settings().await)
}

async fn update_tailscale(
    State(st): State<ApiState>,
    Json(ts): Json<TailscaleConfig>,
) -> Response {
    match st.registry.update_overlay(ts).await {
        Ok(()) => Json(st.registry.tailscale_settings().await).into_response(),
        Err(err) => {
            tracing::error!(err = %err, "admin: overlay update failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_dashboard(State(st): State<ApiState>) -> Json<DashboardConfig> {
    Json(st.registry.dashboard_settings().await)
}

async fn update_dashboard(
    State(st): State<ApiState>,
    Json(dashboard): Json<DashboardConfig>,
) -> Json<DashboardConfig> {
    Json(st.registry.update_dashboard(dashboard).await)
}

async fn list_routes(State(st): State<ApiState>) -> Response {
    Json(st.registry.get_all().await).into_response()
}

async fn create_route(State(st): State<ApiState>, Json(cfg): Json<RouteConfig>) -> Response {
    match st.registry.add_route(cfg).await {
        Ok(info) => Json(info).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_route(State(st): State<ApiState>, Path(id): Path<String>) -> Response {
    match st.registry.get(&id).await {
        Some(info) => Json(info).into_response(),
        None => not_found(&id),
    }
}

async fn update_route(
    State(st): State<ApiState>,
    Path(id): Path<String>,
    Json(mut cfg): Json<RouteConfig>,
) -> Response {
    cfg.id = id;
    match st.registry.update_route(cfg).await {
        Ok(info) => Json(info).into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_route(State(st): State<ApiState>, Path(id): Path<String>) -> Response {
    match st.registry.delete_route(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn start_route(State(st): State<ApiState>, Path(id): Path<String>) -> Response {
    match st.registry.start_route(&id).await {
        Ok(()) => status_json(&st, &id).await,
        Err(err) => error_response(err),
    }
}

async fn stop_route(State(st): State<ApiState>, Path(id): Path<String>) -> Response {
    match st.registry.stop_route(&id).await {
        Ok(()) => status_json(&st, &id).await,
        Err(err) => error_response(err),
    }
}

async fn route_timeseries(State(st): State<ApiState>, Path(id): Path<String>) -> Response {
    match st.registry.timeseries(&id).await {
        Some(points) => Json(points).into_response(),
        None => not_found(&id),
    }
}

async fn status_json(st: &ApiState, id: &str) -> Response {
    match st.registry.get(id).await {
        Some(info) => Json(info).into_response(),
        None => not_found(id),
    }
}

/// Virtual-host demux before the dashboard: requests whose Host matches an
/// HTTP route are proxied; everything else falls through to static assets.
async fn fallback(State(st): State<ApiState>, req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(net::host_without_port)
        .unwrap_or_default()
        .to_string();

    if !host.is_empty() {
        if let Some(info) = st.registry.get_by_name(&host).await {
            if !info.config.kind.is_http() {
                return StatusCode::BAD_REQUEST.into_response();
            }
            if let Some(fw) = st.registry.http_forwarder(&host).await {
                return fw.forward(req).await;
            }
        }
    }

    if !st.registry.dashboard_settings().await.enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    // Single-page dashboard: unknown paths fall back to the index document.
    let assets = ServeDir::new(&st.assets_dir)
        .append_index_html_on_directories(true)
        .not_found_service(ServeFile::new(st.assets_dir.join("index.html")));
    match assets.oneshot(req).await {
        Ok(res) => res.map(Body::new),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("route {id:?} not found") })),
    )
        .into_response()
}

fn error_response(err: RegistryError) -> Response {
    let code = match &err {
        RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
        RegistryError::Config(_) | RegistryError::Conflict(_) => StatusCode::BAD_REQUEST,
        RegistryError::Route(_) => StatusCode::BAD_REQUEST,
    };
    (code, Json(json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshport::config::{Config, ConfigStore, Machine, RouteKind};
    use axum::body::to_bytes;
    use metrics_exporter_prometheus::PrometheusBuilder;

    async fn test_state(tag: &str) -> ApiState {
        let dir = std::env::temp_dir().join(format!("meshport-api-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = ConfigStore::new(dir.join("config.yaml"));

        let cfg = Config {
            dashboard: DashboardConfig {
                enabled: true,
                username: "admin".into(),
                password: "secret".into(),
            },
            ..Default::default()
        };
        let registry = Arc::new(Registry::new(cfg, store).await.unwrap());

        ApiState {
            registry,
            assets_dir: dir,
            metrics: PrometheusBuilder::new().build_recorder().handle(),
        }
    }

    async fn request(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, token);
        }
        let body = match body {
            Some(v) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&v).unwrap())
            }
            None => Body::empty(),
        };
        app.clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap()
    }

    async fn json_body(res: Response) -> serde_json::Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn tcp_route_json() -> serde_json::Value {
        json!({
            "name": "ssh",
            "type": "tcp",
            "port": 7000,
            "enabled": false,
            "machine": {"address": "10.0.0.1", "port": 22}
        })
    }

    #[tokio::test]
    async fn healthz_is_open() {
        let app = router(test_state("health").await);
        let res = request(&app, "GET", "/healthz", None, None).await;
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn login_issues_token_and_rejects_bad_credentials() {
        let app = router(test_state("login").await);

        let res = request(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({"username": "admin", "password": "wrong"})),
        )
        .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = request(
            &app,
            "POST",
            "/auth/login",
            None,
            Some(json!({"username": "admin", "password": "secret"})),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert!(body["authorization_token"].as_str().unwrap().len() > 10);
    }

    #[tokio::test]
    async fn api_group_requires_token() {
        let app = router(test_state("guard").await);

        let res = request(&app, "GET", "/api/routes", None, None).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let token = auth::generate_token("admin").unwrap();
        let res = request(&app, "GET", "/api/routes", Some(&token), None).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn route_crud_over_http() {
        let app = router(test_state("crud").await);
        let token = auth::generate_token("admin").unwrap();

        let res = request(
            &app,
            "POST",
            "/api/routes",
            Some(&token),
            Some(tcp_route_json()),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        let created = json_body(res).await;
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["status"], "Stopped");

        let res = request(&app, "GET", &format!("/api/routes/{id}"), Some(&token), None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["name"], "ssh");

        let res = request(
            &app,
            "GET",
            &format!("/api/routes/{id}/timeseries"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);

        let res = request(
            &app,
            "DELETE",
            &format!("/api/routes/{id}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = request(&app, "GET", &format!("/api/routes/{id}"), Some(&token), None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_route_is_rejected() {
        let app = router(test_state("invalid").await);
        let token = auth::generate_token("admin").unwrap();

        // tcp route without a listen port
        let res = request(
            &app,
            "POST",
            "/api/routes",
            Some(&token),
            Some(json!({
                "name": "bad",
                "type": "tcp",
                "machine": {"address": "10.0.0.1", "port": 22}
            })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn virtual_host_fallback_proxies_matching_requests() {
        use axum::routing::get as axum_get;

        // Real upstream behind the "overlay".
        let upstream_app =
            Router::new().route("/hello", axum_get(|| async { "from upstream" }));
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(ln, upstream_app).await.unwrap();
        });

        let state = test_state("vhost").await;
        let info = state
            .registry
            .add_route(RouteConfig {
                id: String::new(),
                enabled: true,
                name: "svc.example".into(),
                kind: RouteKind::Http,
                port: 0,
                machine: Machine {
                    address: "127.0.0.1".into(),
                    port: upstream_addr.port(),
                },
            })
            .await
            .unwrap();
        state.registry.start_route(&info.config.id).await.unwrap();

        let app = router(state);
        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/hello")
                    .header(header::HOST, "svc.example:8081")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"from upstream");

        // Non-matching hosts fall through to the dashboard handler.
        let res = app
            .oneshot(
                Request::builder()
                    .uri("/hello")
                    .header(header::HOST, "other.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_ne!(res.status(), StatusCode::OK);
    }
}
