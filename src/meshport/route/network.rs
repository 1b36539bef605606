use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{mpsc, oneshot, watch},
    task::JoinSet,
    time,
};

use crate::meshport::{
    config::{RouteConfig, RouteKind},
    monitor::{ConnMonitor, MonitorCounters},
    net,
    overlay::{BoxedStream, OverlayClient},
    route::{RouteError, RouteStatus},
    timeseries::TimeSeries,
};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const UDP_FLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const UDP_DATAGRAM_BUF: usize = 64 * 1024;

/// TCP/UDP route: owns a local listener while running and splices every
/// accepted connection (or datagram flow) to the configured overlay target.
///
/// `stop` is synchronous: it returns only once the serve task and every
/// handler it spawned have exited and every owned socket is closed.
pub struct NetworkRoute {
    config: RouteConfig,
    status: RouteStatus,
    data: Arc<TimeSeries>,
    serving: Option<ServeHandle>,
}

struct ServeHandle {
    quit: watch::Sender<bool>,
    exited: oneshot::Receiver<()>,
    local_addr: SocketAddr,
}

#[derive(Clone)]
struct Target {
    protocol: &'static str,
    address: String,
    port: u16,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.address, self.port)
    }
}

impl NetworkRoute {
    pub fn new(config: RouteConfig) -> Self {
        Self {
            config,
            status: RouteStatus::Stopped,
            data: Arc::new(TimeSeries::default()),
            serving: None,
        }
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn status(&self) -> RouteStatus {
        self.status
    }

    pub fn data(&self) -> &Arc<TimeSeries> {
        &self.data
    }

    /// Address the listener actually bound (differs from config when port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.serving.as_ref().map(|s| s.local_addr)
    }

    pub async fn start(&mut self, overlay: Arc<dyn OverlayClient>) -> Result<(), RouteError> {
        if self.serving.is_some() {
            self.stop().await;
        }
        self.status = RouteStatus::Starting;

        let bind = net::normalize_bind_addr(&format!(":{}", self.config.port)).into_owned();
        let addr: SocketAddr = match bind.parse() {
            Ok(a) => a,
            Err(source) => {
                self.status = RouteStatus::Stopped;
                return Err(RouteError::Resolve { addr: bind, source });
            }
        };

        let target = Target {
            protocol: self.config.kind.protocol(),
            address: self.config.machine.address.clone(),
            port: self.config.machine.port,
        };

        let (quit_tx, quit_rx) = watch::channel(false);
        let (exited_tx, exited_rx) = oneshot::channel();

        let local_addr = match self.config.kind {
            RouteKind::Udp => {
                let sock = match UdpSocket::bind(addr).await {
                    Ok(s) => s,
                    Err(source) => {
                        self.status = RouteStatus::Stopped;
                        return Err(RouteError::Bind { addr, source });
                    }
                };
                let local_addr = sock.local_addr().unwrap_or(addr);
                tracing::info!(route = %self.config.name, listen = %local_addr, upstream = %target, "udp: listening");
                tokio::spawn(serve_udp(
                    sock,
                    target,
                    overlay,
                    self.data.clone(),
                    quit_rx,
                    exited_tx,
                ));
                local_addr
            }
            _ => {
                let ln = match TcpListener::bind(addr).await {
                    Ok(l) => l,
                    Err(source) => {
                        self.status = RouteStatus::Stopped;
                        return Err(RouteError::Bind { addr, source });
                    }
                };
                let local_addr = ln.local_addr().unwrap_or(addr);
                tracing::info!(route = %self.config.name, listen = %local_addr, upstream = %target, "tcp: listening");
                tokio::spawn(serve_tcp(
                    ln,
                    target,
                    overlay,
                    self.data.clone(),
                    quit_rx,
                    exited_tx,
                ));
                local_addr
            }
        };

        self.serving = Some(ServeHandle {
            quit: quit_tx,
            exited: exited_rx,
            local_addr,
        });
        self.status = RouteStatus::Running;
        Ok(())
    }

    /// No-op when already stopped.
    pub async fn stop(&mut self) {
        let Some(handle) = self.serving.take() else {
            self.status = RouteStatus::Stopped;
            return;
        };
        self.status = RouteStatus::Stopping;
        let _ = handle.quit.send(true);
        let _ = handle.exited.await;
        tracing::info!(route = %self.config.name, "route stopped");
        self.status = RouteStatus::Stopped;
    }

    pub async fn update(
        &mut self,
        config: RouteConfig,
        overlay: Arc<dyn OverlayClient>,
    ) -> Result<(), RouteError> {
        self.stop().await;
        self.config = config;
        self.start(overlay).await
    }
}

struct ActiveConnGuard;

impl ActiveConnGuard {
    fn new() -> Self {
        metrics::counter!("meshport_connections_total").increment(1);
        metrics::gauge!("meshport_active_connections").increment(1.0);
        Self
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("meshport_active_connections").decrement(1.0);
    }
}

async fn serve_tcp(
    ln: TcpListener,
    target: Target,
    overlay: Arc<dyn OverlayClient>,
    data: Arc<TimeSeries>,
    mut quit: watch::Receiver<bool>,
    exited: oneshot::Sender<()>,
) {
    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            res = quit.changed() => {
                if res.is_err() || *quit.borrow() {
                    break;
                }
            }
            res = ln.accept() => match res {
                Ok((conn, peer)) => {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %peer, "tcp: accepted");
                    }
                    let target = target.clone();
                    let overlay = overlay.clone();
                    let data = data.clone();
                    let quit = quit.clone();
                    handlers.spawn(async move {
                        handle_tcp_conn(conn, target, overlay, data, quit).await;
                    });
                }
                Err(err) => {
                    tracing::warn!(err = %err, "tcp: accept failed");
                }
            }
        }
    }

    // Close the listener first so no new connections arrive while draining.
    drop(ln);
    while handlers.join_next().await.is_some() {}
    let _ = exited.send(());
}

async fn handle_tcp_conn(
    inbound: TcpStream,
    target: Target,
    overlay: Arc<dyn OverlayClient>,
    data: Arc<TimeSeries>,
    quit: watch::Receiver<bool>,
) {
    let _guard = ActiveConnGuard::new();

    let upstream = match overlay
        .user_dial(target.protocol, &target.address, target.port)
        .await
    {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(upstream = %target, err = %err, "tcp: upstream dial failed");
            return;
        }
    };

    let inbound = ConnMonitor::new(inbound);
    let upstream = ConnMonitor::new(upstream);
    let counters = upstream.counters();

    splice_monitored(inbound, upstream, counters, data, quit).await;
}

/// One copy task per direction plus one sampler task; the handler joins all
/// three before returning.
async fn splice_monitored<A, B>(
    client: ConnMonitor<A>,
    upstream: ConnMonitor<B>,
    counters: Arc<MonitorCounters>,
    data: Arc<TimeSeries>,
    quit: watch::Receiver<bool>,
) where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (cr, cw) = tokio::io::split(client);
    let (ur, uw) = tokio::io::split(upstream);

    // Either direction finishing signals the counterpart to tear down, so
    // both connections close together.
    let (done_tx, done_rx) = watch::channel(false);

    let client_to_upstream = tokio::spawn(copy_task(
        cr,
        uw,
        done_tx.clone(),
        done_rx.clone(),
        quit.clone(),
    ));
    let upstream_to_client = tokio::spawn(copy_task(ur, cw, done_tx, done_rx, quit.clone()));

    let (halt_tx, halt_rx) = oneshot::channel();
    let sampler = tokio::spawn(sampler_task(counters, data, quit, halt_rx));

    let _ = client_to_upstream.await;
    let _ = upstream_to_client.await;
    let _ = halt_tx.send(());
    let _ = sampler.await;
}

/// Copies until EOF or an I/O error, or until the counterpart direction or
/// the route shuts down. Dropping the halves on exit is what closes the
/// connection once the counterpart task has dropped its halves too.
async fn copy_task<R, W>(
    mut from: R,
    mut to: W,
    done: watch::Sender<bool>,
    mut peer_done: watch::Receiver<bool>,
    mut quit: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::select! {
        _ = tokio::io::copy(&mut from, &mut to) => {}
        _ = peer_done.changed() => {}
        _ = quit.changed() => {}
    }
    let _ = done.send(true);
}

/// Folds the upstream monitor's counters into the route time series at 1 Hz;
/// exits when the route shuts down or the handler reports its copies done,
/// flushing the final delta either way.
async fn sampler_task(
    counters: Arc<MonitorCounters>,
    data: Arc<TimeSeries>,
    mut quit: watch::Receiver<bool>,
    mut halt: oneshot::Receiver<()>,
) {
    let mut sampler = Sampler::new(counters, data);
    let mut tick = time::interval(SAMPLE_INTERVAL);

    loop {
        tokio::select! {
            res = quit.changed() => {
                if res.is_err() || *quit.borrow() {
                    break;
                }
            }
            _ = &mut halt => break,
            _ = tick.tick() => sampler.sample(),
        }
    }

    sampler.sample();
}

/// Folds monitor counter deltas into the route time series so route totals
/// match bytes actually transferred.
struct Sampler {
    counters: Arc<MonitorCounters>,
    data: Arc<TimeSeries>,
    last_read: u64,
    last_written: u64,
}

impl Sampler {
    fn new(counters: Arc<MonitorCounters>, data: Arc<TimeSeries>) -> Self {
        Self {
            counters,
            data,
            last_read: 0,
            last_written: 0,
        }
    }

    fn sample(&mut self) {
        let read = self.counters.bytes_read();
        let written = self.counters.bytes_written();
        self.data.log_received(read - self.last_read);
        self.data.log_sent(written - self.last_written);
        self.last_read = read;
        self.last_written = written;
    }
}

struct UdpFlow {
    tx: mpsc::Sender<Vec<u8>>,
    last: Instant,
}

async fn serve_udp(
    sock: UdpSocket,
    target: Target,
    overlay: Arc<dyn OverlayClient>,
    data: Arc<TimeSeries>,
    mut quit: watch::Receiver<bool>,
    exited: oneshot::Sender<()>,
) {
    let sock = Arc::new(sock);
    let mut flows: HashMap<SocketAddr, UdpFlow> = HashMap::new();
    let mut tasks = JoinSet::new();
    let mut sweep = time::interval(UDP_SWEEP_INTERVAL);
    let mut buf = vec![0u8; UDP_DATAGRAM_BUF];

    loop {
        tokio::select! {
            res = quit.changed() => {
                if res.is_err() || *quit.borrow() {
                    break;
                }
            }
            _ = sweep.tick() => {
                let now = Instant::now();
                flows.retain(|_, f| now.duration_since(f.last) <= UDP_FLOW_IDLE_TIMEOUT);
                while tasks.try_join_next().is_some() {}
            }
            res = sock.recv_from(&mut buf) => {
                let (n, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(err = %err, "udp: recv failed");
                        continue;
                    }
                };
                if n == 0 {
                    continue;
                }
                let payload = buf[..n].to_vec();

                if let Some(flow) = flows.get_mut(&peer) {
                    flow.last = Instant::now();
                    if flow.tx.try_send(payload).is_err() {
                        // Flow closed or congested; drop it with the datagram.
                        flows.remove(&peer);
                    }
                    continue;
                }

                let stream = match overlay
                    .user_dial(target.protocol, &target.address, target.port)
                    .await
                {
                    Ok(s) => s,
                    Err(err) => {
                        tracing::warn!(upstream = %target, err = %err, "udp: upstream dial failed");
                        continue;
                    }
                };

                if tracing::enabled!(tracing::Level::DEBUG) {
                    tracing::debug!(client = %peer, "udp: flow created");
                }

                let (tx, rx) = mpsc::channel::<Vec<u8>>(128);
                let _ = tx.try_send(payload);

                let monitored = ConnMonitor::new(stream);
                let counters = monitored.counters();
                tasks.spawn(udp_flow_loop(
                    monitored,
                    counters,
                    sock.clone(),
                    peer,
                    rx,
                    data.clone(),
                    quit.clone(),
                ));
                flows.insert(peer, UdpFlow { tx, last: Instant::now() });
            }
        }
    }

    // Dropping the senders ends each flow's uplink; flows also observe quit.
    drop(flows);
    while tasks.join_next().await.is_some() {}
    let _ = exited.send(());
}

async fn udp_flow_loop(
    stream: ConnMonitor<BoxedStream>,
    counters: Arc<MonitorCounters>,
    sock: Arc<UdpSocket>,
    peer: SocketAddr,
    mut rx: mpsc::Receiver<Vec<u8>>,
    data: Arc<TimeSeries>,
    mut quit: watch::Receiver<bool>,
) {
    let _guard = ActiveConnGuard::new();

    let (mut rd, mut wr) = tokio::io::split(stream);
    let (halt_tx, halt_rx) = oneshot::channel();
    let sampler = tokio::spawn(sampler_task(counters, data, quit.clone(), halt_rx));
    let mut buf = vec![0u8; UDP_DATAGRAM_BUF];

    loop {
        tokio::select! {
            res = quit.changed() => {
                if res.is_err() || *quit.borrow() {
                    break;
                }
            }
            msg = rx.recv() => match msg {
                // One write per datagram preserves message boundaries.
                Some(payload) => {
                    if wr.write(&payload).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            res = rd.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => {
                    let _ = sock.send_to(&buf[..n], peer).await;
                }
                Err(_) => break,
            }
        }
    }

    let _ = halt_tx.send(());
    let _ = sampler.await;
}
