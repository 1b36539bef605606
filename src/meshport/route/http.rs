use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use futures_util::StreamExt;

use crate::meshport::{config::RouteConfig, route::RouteStatus, timeseries::TimeSeries};

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Virtual-host route: owns no listener. The admin surface matches incoming
/// Host headers against these routes and hands matching requests to a
/// forwarder cloned out of the registry.
pub struct HttpRoute {
    config: RouteConfig,
    status: Arc<Mutex<RouteStatus>>,
    data: Arc<TimeSeries>,
}

impl HttpRoute {
    pub fn new(config: RouteConfig) -> Self {
        Self {
            config,
            status: Arc::new(Mutex::new(RouteStatus::Stopped)),
            data: Arc::new(TimeSeries::default()),
        }
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn status(&self) -> RouteStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn data(&self) -> &Arc<TimeSeries> {
        &self.data
    }

    pub fn start(&mut self) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = RouteStatus::Running;
    }

    pub fn stop(&mut self) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = RouteStatus::Stopped;
    }

    pub fn update(&mut self, config: RouteConfig) {
        self.config = config;
    }

    /// Cheap per-request handle; taken under the registry read lock and used
    /// after it is released so long proxied responses never block mutations.
    pub fn forwarder(&self, client: reqwest::Client) -> HttpForwarder {
        HttpForwarder {
            status: self.status.clone(),
            address: self.config.machine.address.clone(),
            port: self.config.machine.port,
            data: self.data.clone(),
            client,
        }
    }
}

#[derive(Clone)]
pub struct HttpForwarder {
    status: Arc<Mutex<RouteStatus>>,
    address: String,
    port: u16,
    data: Arc<TimeSeries>,
    client: reqwest::Client,
}

impl HttpForwarder {
    fn status(&self) -> RouteStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Proxy one request to the overlay target.
    ///
    /// The client carries redirect-following disabled, so upstream 3xx
    /// responses pass through unchanged.
    pub async fn forward(&self, req: Request) -> Response {
        if self.status() != RouteStatus::Running {
            return status_response(StatusCode::BAD_GATEWAY);
        }

        let (parts, body) = req.into_parts();

        let original_host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{}:{}{}", self.address, self.port, path_and_query);

        if let Some(len) = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.data.log_received(len);
        }

        let mut headers = parts.headers.clone();
        headers.remove(header::HOST);
        if let Ok(v) = HeaderValue::from_str(&self.address) {
            headers.insert(header::HOST, v);
        }
        if !original_host.is_empty() {
            if let Ok(v) = HeaderValue::from_str(&original_host) {
                headers.insert(X_FORWARDED_HOST, v);
            }
        }

        let upstream = match self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
        {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(upstream = %self.address, err = %err, "http: upstream request failed");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };

        let mut builder = Response::builder().status(upstream.status());
        if let Some(out) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                // The body is re-streamed, so framing headers must not be copied.
                if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
                    continue;
                }
                out.append(name.clone(), value.clone());
            }
        }

        let data = self.data.clone();
        let counted = upstream.bytes_stream().inspect(move |chunk| {
            if let Ok(bytes) = chunk {
                data.log_sent(bytes.len() as u64);
            }
        });

        builder
            .body(Body::from_stream(counted))
            .unwrap_or_else(|_| status_response(StatusCode::BAD_GATEWAY))
    }
}

fn status_response(code: StatusCode) -> Response {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = code;
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshport::config::{Machine, RouteKind};
    use axum::{
        http::HeaderMap,
        response::IntoResponse,
        routing::{get, post},
        Router,
    };
    use std::net::SocketAddr;

    async fn spawn_upstream() -> SocketAddr {
        async fn show_headers(headers: HeaderMap) -> impl IntoResponse {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let forwarded = headers
                .get("x-forwarded-host")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            (
                [("echo-host", host), ("echo-forwarded-host", forwarded)],
                "hello from upstream",
            )
        }

        async fn redirect() -> impl IntoResponse {
            (
                StatusCode::FOUND,
                [(header::LOCATION, "http://elsewhere.example/")],
            )
        }

        async fn swallow(body: String) -> impl IntoResponse {
            format!("got {} bytes", body.len())
        }

        let app = Router::new()
            .route("/path", get(show_headers))
            .route("/redirect", get(redirect))
            .route("/upload", post(swallow));

        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(ln, app).await.unwrap();
        });
        addr
    }

    fn http_route(upstream: SocketAddr) -> HttpRoute {
        HttpRoute::new(RouteConfig {
            id: "b".into(),
            enabled: true,
            name: "svc.example".into(),
            kind: RouteKind::Http,
            port: 0,
            machine: Machine {
                address: "127.0.0.1".into(),
                port: upstream.port(),
            },
        })
    }

    fn proxy_client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn rewrites_host_and_forwards_body() {
        let upstream = spawn_upstream().await;
        let mut route = http_route(upstream);
        route.start();
        let fw = route.forwarder(proxy_client());

        let req = Request::builder()
            .uri("/path")
            .header(header::HOST, "svc.example")
            .body(Body::empty())
            .unwrap();
        let res = fw.forward(req).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["echo-host"], "127.0.0.1");
        assert_eq!(res.headers()["echo-forwarded-host"], "svc.example");

        let body = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello from upstream");
        assert!(route.data().total().sent >= body.len() as u64);
    }

    #[tokio::test]
    async fn surfaces_redirects_unchanged() {
        let upstream = spawn_upstream().await;
        let mut route = http_route(upstream);
        route.start();
        let fw = route.forwarder(proxy_client());

        let req = Request::builder()
            .uri("/redirect")
            .header(header::HOST, "svc.example")
            .body(Body::empty())
            .unwrap();
        let res = fw.forward(req).await;
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(res.headers()[header::LOCATION], "http://elsewhere.example/");
    }

    #[tokio::test]
    async fn stopped_route_responds_bad_gateway() {
        let upstream = spawn_upstream().await;
        let route = http_route(upstream);
        let fw = route.forwarder(proxy_client());

        let req = Request::builder()
            .uri("/path")
            .body(Body::empty())
            .unwrap();
        let res = fw.forward(req).await;
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn counts_request_content_length_as_received() {
        let upstream = spawn_upstream().await;
        let mut route = http_route(upstream);
        route.start();
        let fw = route.forwarder(proxy_client());

        let payload = "0123456789";
        let req = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(header::HOST, "svc.example")
            .header(header::CONTENT_LENGTH, payload.len())
            .body(Body::from(payload))
            .unwrap();
        let res = fw.forward(req).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(route.data().total().received >= payload.len() as u64);
    }

    #[tokio::test]
    async fn unreachable_upstream_responds_bad_gateway() {
        let mut route = http_route("127.0.0.1:1".parse().unwrap());
        route.start();
        let fw = route.forwarder(proxy_client());

        let req = Request::builder()
            .uri("/path")
            .body(Body::empty())
            .unwrap();
        let res = fw.forward(req).await;
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    }
}
