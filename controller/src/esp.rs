use core::convert::TryInto;
use std::{
    ffi::CString,
    net::Ipv4Addr,
    sync::{
        atomic::AtomicBool,
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method as HttpMethod},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::{EspSubscription, EspSystemEventLoop, System},
    hal::{gpio::AnyOutputPin, prelude::Peripherals, rmt::RMT},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    io::EspIOError,
    log::EspLogger,
    netif::IpEvent,
    nvs::EspDefaultNvsPartition,
    sys::{esp, EspError},
    wifi::{EspWifi, WifiEvent},
};
use log::{debug, info, warn};

use ledstrip_common::{
    assets::{AssetService, ChunkSink, MountedFs, StreamError},
    config::{AssetConfig, LedConfig, NetworkConfig, RuntimeConfig, ServerConfig},
    control::{handle_control_request, ControlResponse, MAX_CONTROL_BODY},
    device_routes, ActuationTask, ConnectivityManager, DeviceState, Endpoint, Method,
    NetEvent, ReconnectGate, Registration, Resolution, RouteTable, ServerLauncher, Station,
};

use crate::strip::LedStrip;

const SPIFFS_MAX_FILES: usize = 8;
const ACTUATION_STACK_SIZE: usize = 8 * 1024;
const RECONNECT_STACK_SIZE: usize = 4 * 1024;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut runtime = RuntimeConfig::default();
    ensure_wifi_defaults(&mut runtime.network);
    runtime.sanitize();

    mount_spiffs(&runtime.assets).context("failed to mount SPIFFS")?;

    let Peripherals { modem, rmt, .. } = Peripherals::take()?;
    let strip = match init_led_strip(rmt, &runtime.leds) {
        Ok(strip) => {
            info!(
                "led strip initialized on RMT channel{} / GPIO{} ({} leds)",
                runtime.leds.rmt_channel, runtime.leds.data_pin, runtime.leds.num_leds
            );
            strip
        }
        Err(err) => {
            warn!("failed to initialize led strip, running disabled: {err:#}");
            LedStrip::disabled()
        }
    };

    let state = Arc::new(DeviceState::new(runtime.leds.num_leds));
    spawn_actuation_loop(state.clone(), strip, &runtime.leds)?;

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let wifi = Arc::new(Mutex::new(
        configure_wifi(modem, sys_loop.clone(), nvs_partition, &runtime.network)
            .context("wifi setup failed")?,
    ));

    let (events_tx, events_rx) = mpsc::channel();
    let _subscriptions = subscribe_net_events(&sys_loop, &events_tx)?;

    let station = EspStation::spawn(wifi.clone(), events_tx)?;
    let launcher = EspServerLauncher::new(&runtime, state);
    let manager = ConnectivityManager::new(station, launcher, &runtime.reconnect);

    wifi.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .start()
        .context("failed to start wifi")?;
    disable_wifi_power_save();
    info!("wifi started, joining `{}`", runtime.network.wifi_ssid);

    run_event_loop(&manager, events_rx);
    Err(anyhow!("network event channel closed"))
}

fn run_event_loop<S, L>(manager: &ConnectivityManager<S, L>, events: Receiver<NetEvent>)
where
    S: Station,
    L: ServerLauncher,
{
    for event in events {
        manager.handle_event(event);
        debug!("connectivity state: {}", manager.state().as_str());
    }
}

fn ensure_wifi_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
}

fn mount_spiffs(assets: &AssetConfig) -> anyhow::Result<()> {
    let base_path = CString::new(assets.mount_root.as_str())
        .map_err(|_| anyhow!("mount root contains NUL"))?;
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: SPIFFS_MAX_FILES,
        format_if_mount_failed: true,
    };

    // The VFS layer copies the base path during registration.
    esp!(unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) })?;

    let mut total = 0;
    let mut used = 0;
    match esp!(unsafe {
        esp_idf_svc::sys::esp_spiffs_info(core::ptr::null(), &mut total, &mut used)
    }) {
        Ok(()) => info!(
            "SPIFFS mounted at {} ({used}/{total} bytes used)",
            assets.mount_root
        ),
        Err(err) => warn!("SPIFFS mounted at {} but info failed: {err}", assets.mount_root),
    }
    Ok(())
}

fn init_led_strip(rmt: RMT, leds: &LedConfig) -> anyhow::Result<LedStrip> {
    if leds.data_pin < 0 {
        return Err(anyhow!("invalid data pin: {}", leds.data_pin));
    }

    let pin = leds.data_pin;
    match leds.rmt_channel {
        0 => unsafe { LedStrip::new(rmt.channel0, AnyOutputPin::new(pin)) },
        1 => unsafe { LedStrip::new(rmt.channel1, AnyOutputPin::new(pin)) },
        2 => unsafe { LedStrip::new(rmt.channel2, AnyOutputPin::new(pin)) },
        3 => unsafe { LedStrip::new(rmt.channel3, AnyOutputPin::new(pin)) },
        #[cfg(any(esp32, esp32s3))]
        4 => unsafe { LedStrip::new(rmt.channel4, AnyOutputPin::new(pin)) },
        #[cfg(any(esp32, esp32s3))]
        5 => unsafe { LedStrip::new(rmt.channel5, AnyOutputPin::new(pin)) },
        #[cfg(any(esp32, esp32s3))]
        6 => unsafe { LedStrip::new(rmt.channel6, AnyOutputPin::new(pin)) },
        #[cfg(any(esp32, esp32s3))]
        7 => unsafe { LedStrip::new(rmt.channel7, AnyOutputPin::new(pin)) },
        _ => Err(anyhow!("unsupported RMT channel: {}", leds.rmt_channel)),
    }
}

fn spawn_actuation_loop(
    state: Arc<DeviceState>,
    strip: LedStrip,
    leds: &LedConfig,
) -> anyhow::Result<()> {
    static STOP: AtomicBool = AtomicBool::new(false);

    let period = Duration::from_millis(leds.frame_period_ms);
    let enabled = strip.is_enabled();
    thread::Builder::new()
        .name("actuation".to_string())
        .stack_size(ACTUATION_STACK_SIZE)
        .spawn(move || {
            let stats = ActuationTask::new(state, strip).run(period, &STOP);
            warn!("actuation loop exited: {stats:?}");
        })
        .context("failed to spawn actuation thread")?;

    if !enabled {
        warn!("actuation running without an output; frames are dropped");
    }
    Ok(())
}

fn configure_wifi(
    modem: esp_idf_svc::hal::modem::Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;

    if network.wifi_ssid.trim().is_empty() {
        warn!("wifi credentials missing; set WIFI_SSID / WIFI_PASS at build time");
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    Ok(wifi)
}

fn subscribe_net_events(
    sys_loop: &EspSystemEventLoop,
    events: &Sender<NetEvent>,
) -> anyhow::Result<[EspSubscription<'static, System>; 2]> {
    let wifi_events = {
        let events = events.clone();
        sys_loop.subscribe::<WifiEvent, _>(move |event| {
            let forwarded = match event {
                WifiEvent::StaStarted => NetEvent::StationStarted,
                WifiEvent::StaDisconnected(..) => NetEvent::Disconnected,
                _ => return,
            };
            if events.send(forwarded).is_err() {
                warn!("network event receiver dropped");
            }
        })?
    };

    let ip_events = {
        let events = events.clone();
        sys_loop.subscribe::<IpEvent, _>(move |event| {
            if let IpEvent::DhcpIpAssigned(assignment) = event {
                let address: Ipv4Addr = assignment.ip();
                if events.send(NetEvent::AddressAcquired(address)).is_err() {
                    warn!("network event receiver dropped");
                }
            }
        })?
    };

    Ok([wifi_events, ip_events])
}

/// Connect attempts run on a dedicated worker so event-loop callbacks never block.
struct EspStation {
    requests: Mutex<Sender<Duration>>,
    gate: Arc<ReconnectGate>,
}

impl EspStation {
    fn spawn(
        wifi: Arc<Mutex<EspWifi<'static>>>,
        events: Sender<NetEvent>,
    ) -> anyhow::Result<Self> {
        let (requests, pending) = mpsc::channel::<Duration>();
        let gate = Arc::new(ReconnectGate::new());

        let worker_gate = gate.clone();
        thread::Builder::new()
            .name("wifi-connect".to_string())
            .stack_size(RECONNECT_STACK_SIZE)
            .spawn(move || {
                for delay in pending {
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    worker_gate.disarm();

                    let result = wifi
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .connect();
                    if let Err(err) = result {
                        warn!("wifi connect request failed: {err}");
                        // No disconnect event follows a rejected request; feed one back.
                        let _ = events.send(NetEvent::Disconnected);
                    }
                }
            })
            .context("failed to spawn wifi connect thread")?;

        Ok(Self {
            requests: Mutex::new(requests),
            gate,
        })
    }
}

impl Station for EspStation {
    fn schedule_connect(&self, delay: Duration) -> anyhow::Result<()> {
        if !self.gate.try_arm() {
            debug!("wifi connect already pending");
            return Ok(());
        }

        let sent = self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(delay);
        if sent.is_err() {
            self.gate.disarm();
            return Err(anyhow!("wifi connect worker stopped"));
        }
        Ok(())
    }
}

struct EspApp {
    routes: RouteTable<Endpoint>,
    assets: AssetService<MountedFs>,
    state: Arc<DeviceState>,
}

struct EspServerLauncher {
    server: ServerConfig,
    app: Arc<EspApp>,
}

impl EspServerLauncher {
    fn new(runtime: &RuntimeConfig, state: Arc<DeviceState>) -> Self {
        Self {
            server: runtime.server.clone(),
            app: Arc::new(EspApp {
                routes: device_routes(&runtime.assets),
                assets: AssetService::new(
                    MountedFs::new(runtime.assets.mount_root.clone()),
                    &runtime.assets,
                ),
                state,
            }),
        }
    }
}

impl ServerLauncher for EspServerLauncher {
    type Handle = EspHttpServer<'static>;

    fn start(&self) -> anyhow::Result<EspHttpServer<'static>> {
        create_http_server(&self.server, self.app.clone())
    }
}

fn http_method(method: Method) -> HttpMethod {
    match method {
        Method::Get => HttpMethod::Get,
        Method::Head => HttpMethod::Head,
        Method::Post => HttpMethod::Post,
        Method::Put => HttpMethod::Put,
        Method::Delete => HttpMethod::Delete,
        Method::Patch => HttpMethod::Patch,
        Method::Options => HttpMethod::Options,
    }
}

fn create_http_server(
    server_config: &ServerConfig,
    app: Arc<EspApp>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let registrations = app.routes.method_registrations();

    let conf = HttpConfiguration {
        http_port: server_config.port,
        max_open_sockets: server_config.max_open_sockets,
        lru_purge_enable: server_config.lru_purge_enable,
        uri_match_wildcard: true,
        stack_size: server_config.stack_size,
        max_uri_handlers: registrations.len(),
        session_timeout: Duration::from_millis(server_config.request_timeout_ms),
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for Registration {
        pattern,
        method,
        handler,
    } in registrations
    {
        let app = app.clone();
        server.fn_handler::<anyhow::Error, _>(&pattern, http_method(method), move |req| {
            match handler {
                Some(endpoint) => app.handle(req, endpoint, method),
                None => app.fallback(req, method),
            }
        })?;
    }

    info!(
        "http server on port {} (max {} sockets, lru purge {})",
        server_config.port, server_config.max_open_sockets, server_config.lru_purge_enable
    );
    Ok(server)
}

impl EspApp {
    fn handle(
        &self,
        req: Request<&mut EspHttpConnection<'_>>,
        endpoint: Endpoint,
        method: Method,
    ) -> anyhow::Result<()> {
        match endpoint {
            Endpoint::Control => self.handle_control(req, method),
            Endpoint::Asset => self.serve_asset(req),
        }
    }

    fn fallback(&self, req: Request<&mut EspHttpConnection<'_>>, method: Method) -> anyhow::Result<()> {
        let uri = req.uri().to_string();
        let resolved = match self.routes.resolve(method, &uri) {
            Resolution::Matched { handler, .. } => Ok(*handler),
            Resolution::MethodNotAllowed => Err(405),
            Resolution::NotFound => Err(404),
        };

        match resolved {
            Ok(endpoint) => self.handle(req, endpoint, method),
            Err(status) => {
                req.into_response(status, None, &[])?;
                Ok(())
            }
        }
    }

    fn handle_control(
        &self,
        mut req: Request<&mut EspHttpConnection<'_>>,
        method: Method,
    ) -> anyhow::Result<()> {
        if method != Method::Post {
            return write_control_response(req, handle_control_request(&self.state, method, None, &[]));
        }

        let content_type = req.header("Content-Type").map(str::to_string);
        let Some(body) = read_request_body(&mut req)? else {
            return write_control_response(req, ControlResponse::payload_too_large());
        };

        let response =
            handle_control_request(&self.state, method, content_type.as_deref(), &body);
        write_control_response(req, response)
    }

    fn serve_asset(&self, req: Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<()> {
        let path = req.uri().to_string();
        let mut opened = match self.assets.open(&path) {
            Ok(opened) => opened,
            Err(err) => {
                info!("asset request {path} failed: {err}");
                req.into_response(err.status(), None, &[])?;
                return Ok(());
            }
        };

        let response =
            req.into_response(200, None, &[("Content-Type", opened.asset.content_type)])?;
        let mut sink = ResponseSink { response };

        // Returning an error leaves the chunked body unterminated.
        match self.assets.stream(&mut opened, &mut sink) {
            Ok(_) => Ok(()),
            Err(StreamError::Read(err)) => {
                Err(anyhow!("read failed while streaming {path}: {err}"))
            }
            Err(StreamError::Send(err)) => {
                Err(anyhow!("send failed while streaming {path}: {err}"))
            }
        }
    }
}

struct ResponseSink<W> {
    response: W,
}

impl<W: Write<Error = EspIOError>> ChunkSink for ResponseSink<W> {
    type Error = EspIOError;

    fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), EspIOError> {
        self.response.write_all(chunk)
    }

    fn finish(&mut self) -> Result<(), EspIOError> {
        self.response.flush()
    }
}

/// `None` when the declared body exceeds the control limit.
fn read_request_body(
    req: &mut Request<&mut EspHttpConnection<'_>>,
) -> anyhow::Result<Option<Vec<u8>>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_CONTROL_BODY {
        return Ok(None);
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(Some(body))
}

fn write_control_response(
    req: Request<&mut EspHttpConnection<'_>>,
    response: ControlResponse,
) -> anyhow::Result<()> {
    let mut headers = Vec::with_capacity(1);
    if let Some(content_type) = response.content_type {
        headers.push(("Content-Type", content_type));
    }

    req.into_response(response.status, None, &headers)?
        .write_all(&response.body)?;
    Ok(())
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if let Err(err) = EspError::convert(rc) {
        warn!("failed to disable wifi power save: {err}");
    }
}
