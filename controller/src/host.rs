use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    serve::Listener,
    Router,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info, trace, warn};

use ledstrip_common::{
    assets::{AssetService, ChunkSink, MountedFs, StreamError},
    config::{AssetConfig, LedConfig, RuntimeConfig},
    control::{handle_control_request, ControlResponse, MAX_CONTROL_BODY},
    device_routes, ActuationTask, ConnectionId, ConnectionRegistry, ConnectivityManager,
    DeviceState, Endpoint, Eviction, LedSnapshot, Method, NetEvent, PixelSink, ReconnectGate,
    Resolution, RouteTable, ServerLauncher, Station,
};

const HOST_DEFAULT_PORT: u16 = 8080;
const STREAM_QUEUE_DEPTH: usize = 4;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut runtime = load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        host_default_config()
    });
    apply_overrides(&mut runtime, &HostOverrides::from_env());
    runtime.sanitize();

    info!(
        "serving assets from `{}`, {} leds every {}ms",
        runtime.assets.mount_root, runtime.leds.num_leds, runtime.leds.frame_period_ms
    );

    let bind_ip = std::env::var("CONTROLLER_BIND")
        .ok()
        .and_then(|value| value.parse::<IpAddr>().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let state = Arc::new(DeviceState::new(runtime.leds.num_leds));
    let _actuation = spawn_actuation_loop(state.clone(), &runtime.leds);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let station = LoopbackStation::new(events_tx.clone(), station_address(bind_ip));
    let launcher = HostServerLauncher::new(
        SocketAddr::new(bind_ip, runtime.server.port),
        &runtime,
        state,
    );
    let manager = ConnectivityManager::new(station, launcher, &runtime.reconnect);

    events_tx
        .send(NetEvent::StationStarted)
        .context("station event channel closed")?;

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                manager.handle_event(event);
                debug!("connectivity state: {}", manager.state().as_str());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    Ok(())
}

fn host_default_config() -> RuntimeConfig {
    let mut runtime = RuntimeConfig::default();
    runtime.server.port = HOST_DEFAULT_PORT;
    runtime
}

fn load_runtime_config() -> anyhow::Result<RuntimeConfig> {
    let Some(path) = std::env::var_os("LEDSTRIP_CONFIG").map(PathBuf::from) else {
        return Ok(host_default_config());
    };

    let raw = std::fs::read(&path)
        .with_context(|| format!("failed to read runtime config {}", path.display()))?;
    parse_runtime_config(&raw).with_context(|| format!("invalid runtime config {}", path.display()))
}

/// A file without `server.port` keeps the host port instead of the device's 80.
fn parse_runtime_config(raw: &[u8]) -> anyhow::Result<RuntimeConfig> {
    let value: serde_json::Value = serde_json::from_slice(raw)?;
    let has_port = value
        .get("server")
        .and_then(|server| server.get("port"))
        .is_some();

    let mut runtime: RuntimeConfig = serde_json::from_value(value)?;
    if !has_port {
        runtime.server.port = HOST_DEFAULT_PORT;
    }
    Ok(runtime)
}

#[derive(Debug, Default)]
struct HostOverrides {
    http_port: Option<String>,
    web_root: Option<String>,
}

impl HostOverrides {
    fn from_env() -> Self {
        Self {
            http_port: std::env::var("CONTROLLER_HTTP_PORT").ok(),
            web_root: std::env::var("LEDSTRIP_WEB_ROOT").ok(),
        }
    }
}

/// `LEDSTRIP_WEB_ROOT` wins; otherwise a configured root is kept and only the
/// device default is swapped for the bundled `web/` directory. The path budget
/// grows by the difference in root length so request paths keep the same limit.
fn apply_overrides(runtime: &mut RuntimeConfig, overrides: &HostOverrides) {
    if let Some(port) = overrides
        .http_port
        .as_deref()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.server.port = port;
    }

    let web_root = match &overrides.web_root {
        Some(root) => root.clone(),
        None if runtime.assets.mount_root == AssetConfig::default().mount_root => {
            format!("{}/web", env!("CARGO_MANIFEST_DIR"))
        }
        None => return,
    };
    let device_root_len = runtime.assets.mount_root.len();
    runtime.assets.max_path_len += web_root.len().saturating_sub(device_root_len);
    runtime.assets.mount_root = web_root;
}

fn station_address(bind_ip: IpAddr) -> Ipv4Addr {
    match bind_ip {
        IpAddr::V4(ip) if !ip.is_unspecified() => ip,
        _ => Ipv4Addr::LOCALHOST,
    }
}

#[derive(Debug, Default)]
struct TraceSink {
    last_revision: Option<u64>,
}

impl PixelSink for TraceSink {
    fn show(&mut self, frame: &LedSnapshot) -> anyhow::Result<()> {
        if self.last_revision != Some(frame.revision) {
            trace!(
                "frame revision {} ({} pixels, first {:?})",
                frame.revision,
                frame.pixels.len(),
                frame.pixels.first()
            );
            self.last_revision = Some(frame.revision);
        }
        Ok(())
    }
}

fn spawn_actuation_loop(state: Arc<DeviceState>, leds: &LedConfig) -> JoinHandle<()> {
    let period = Duration::from_millis(leds.frame_period_ms);
    tokio::spawn(async move {
        let mut task = ActuationTask::new(state, TraceSink::default());
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            task.tick();
        }
    })
}

/// Stands in for the Wi-Fi station: every connect succeeds after the
/// requested delay and reports the bind address.
struct LoopbackStation {
    events: mpsc::UnboundedSender<NetEvent>,
    address: Ipv4Addr,
    gate: Arc<ReconnectGate>,
    runtime: Handle,
}

impl LoopbackStation {
    fn new(events: mpsc::UnboundedSender<NetEvent>, address: Ipv4Addr) -> Self {
        Self {
            events,
            address,
            gate: Arc::new(ReconnectGate::new()),
            runtime: Handle::current(),
        }
    }
}

impl Station for LoopbackStation {
    fn schedule_connect(&self, delay: Duration) -> anyhow::Result<()> {
        if !self.gate.try_arm() {
            debug!("connect already pending");
            return Ok(());
        }

        let events = self.events.clone();
        let gate = self.gate.clone();
        let address = self.address;
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            gate.disarm();
            if events.send(NetEvent::AddressAcquired(address)).is_err() {
                warn!("station event channel closed");
            }
        });
        Ok(())
    }
}

#[derive(Clone)]
struct HostApp {
    routes: Arc<RouteTable<Endpoint>>,
    assets: Arc<AssetService<MountedFs>>,
    state: Arc<DeviceState>,
}

impl HostApp {
    fn new(runtime: &RuntimeConfig, state: Arc<DeviceState>) -> Self {
        Self {
            routes: Arc::new(device_routes(&runtime.assets)),
            assets: Arc::new(AssetService::new(
                MountedFs::new(runtime.assets.mount_root.clone()),
                &runtime.assets,
            )),
            state,
        }
    }
}

fn build_router(app: HostApp, request_timeout: Duration) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(app)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
}

struct HostServerLauncher {
    bind: SocketAddr,
    router: Router,
    max_open_sockets: usize,
    lru_purge_enable: bool,
    runtime: Handle,
}

impl HostServerLauncher {
    fn new(bind: SocketAddr, runtime: &RuntimeConfig, state: Arc<DeviceState>) -> Self {
        Self {
            bind,
            router: build_router(
                HostApp::new(runtime, state),
                Duration::from_millis(runtime.server.request_timeout_ms),
            ),
            max_open_sockets: runtime.server.max_open_sockets,
            lru_purge_enable: runtime.server.lru_purge_enable,
            runtime: Handle::current(),
        }
    }
}

struct HostServer {
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    _task: JoinHandle<()>,
}

impl ServerLauncher for HostServerLauncher {
    type Handle = HostServer;

    fn start(&self) -> anyhow::Result<HostServer> {
        let listener = std::net::TcpListener::bind(self.bind)
            .with_context(|| format!("failed to bind controller server at {}", self.bind))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let listener = {
            let _guard = self.runtime.enter();
            TcpListener::from_std(listener)?
        };

        let registry = ConnectionRegistry::new(self.max_open_sockets, self.lru_purge_enable);
        let tracked = TrackedListener {
            inner: listener,
            registry: registry.clone(),
        };
        let router = self.router.clone();
        let task = self.runtime.spawn(async move {
            if let Err(err) = axum::serve(tracked, router).await {
                warn!("http server stopped: {err}");
            }
        });

        info!(
            "controller listening on http://{local_addr} (max {} connections)",
            self.max_open_sockets
        );
        Ok(HostServer {
            local_addr,
            registry,
            _task: task,
        })
    }
}

/// Accept loop that enforces the open-connection cap before hyper sees the socket.
struct TrackedListener {
    inner: TcpListener,
    registry: ConnectionRegistry,
}

impl Listener for TrackedListener {
    type Io = TrackedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, addr) = match self.inner.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            match self.registry.admit() {
                Some((id, eviction)) => {
                    debug!("connection {id} from {addr}");
                    let stream = TrackedStream {
                        inner: stream,
                        id,
                        eviction,
                        registry: self.registry.clone(),
                    };
                    return (stream, addr);
                }
                None => warn!("connection limit reached, dropping {addr}"),
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

struct TrackedStream {
    inner: TcpStream,
    id: ConnectionId,
    eviction: Arc<Eviction>,
    registry: ConnectionRegistry,
}

impl TrackedStream {
    fn evicted(&self, cx: &TaskContext<'_>) -> Option<io::Error> {
        if !self.eviction.is_evicted() {
            self.eviction.register(cx.waker());
            if !self.eviction.is_evicted() {
                return None;
            }
        }
        Some(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "connection evicted by a newer client",
        ))
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = this.evicted(cx) {
            return Poll::Ready(Err(err));
        }

        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.registry.touch(this.id);
        }
        poll
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = this.evicted(cx) {
            return Poll::Ready(Err(err));
        }

        let poll = Pin::new(&mut this.inner).poll_write(cx, data);
        if matches!(poll, Poll::Ready(Ok(written)) if written > 0) {
            this.registry.touch(this.id);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.registry.release(self.id);
        debug!("connection {} closed", self.id);
    }
}

async fn dispatch(State(app): State<HostApp>, request: Request) -> Response {
    let Ok(method) = request.method().as_str().parse::<Method>() else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };

    let (endpoint, path) = match app.routes.resolve(method, request.uri().path()) {
        Resolution::Matched { handler, path } => (*handler, path.to_string()),
        Resolution::MethodNotAllowed => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
        Resolution::NotFound => return StatusCode::NOT_FOUND.into_response(),
    };

    match endpoint {
        Endpoint::Control => handle_control(app, method, request).await,
        Endpoint::Asset => handle_asset(app, path).await,
    }
}

async fn handle_control(app: HostApp, method: Method, request: Request) -> Response {
    if method != Method::Post {
        return control_response(handle_control_request(&app.state, method, None, &[]));
    }

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let body = match axum::body::to_bytes(request.into_body(), MAX_CONTROL_BODY).await {
        Ok(body) => body,
        Err(err) => {
            debug!("control body rejected: {err}");
            return control_response(ControlResponse::payload_too_large());
        }
    };

    control_response(handle_control_request(
        &app.state,
        method,
        content_type.as_deref(),
        &body,
    ))
}

fn control_response(response: ControlResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = response.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Debug, Error)]
#[error("client disconnected")]
struct ClientGone;

/// Feeds chunks from the blocking reader into the response body stream.
struct ChannelSink {
    tx: Option<mpsc::Sender<Result<Bytes, io::Error>>>,
}

impl ChannelSink {
    /// Ends the body with an error so the response is cut short instead of
    /// looking complete.
    fn abort(&mut self, err: io::Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.blocking_send(Err(err));
        }
    }
}

impl ChunkSink for ChannelSink {
    type Error = ClientGone;

    fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), ClientGone> {
        let tx = self.tx.as_ref().ok_or(ClientGone)?;
        tx.blocking_send(Ok(Bytes::copy_from_slice(chunk)))
            .map_err(|_| ClientGone)
    }

    fn finish(&mut self) -> Result<(), ClientGone> {
        self.tx.take();
        Ok(())
    }
}

async fn handle_asset(app: HostApp, path: String) -> Response {
    let (tx, mut rx) = mpsc::channel::<Result<Bytes, io::Error>>(STREAM_QUEUE_DEPTH);
    let (head_tx, head_rx) = oneshot::channel::<Result<&'static str, u16>>();

    tokio::task::spawn_blocking(move || {
        let mut opened = match app.assets.open(&path) {
            Ok(opened) => opened,
            Err(err) => {
                debug!("asset request {path} failed: {err}");
                let _ = head_tx.send(Err(err.status()));
                return;
            }
        };

        if head_tx.send(Ok(opened.asset.content_type)).is_err() {
            return;
        }

        let mut sink = ChannelSink { tx: Some(tx) };
        match app.assets.stream(&mut opened, &mut sink) {
            Ok(_) => {}
            Err(StreamError::Read(err)) => {
                warn!("read failed while streaming {path}: {err}");
                sink.abort(err);
            }
            Err(StreamError::Send(ClientGone)) => {
                debug!("client went away while streaming {path}");
            }
        }
    });

    match head_rx.await {
        Ok(Ok(content_type)) => {
            let body = Body::from_stream(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)));
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Ok(Err(status)) => StatusCode::from_u16(status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
