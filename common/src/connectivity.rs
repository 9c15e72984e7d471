use std::{
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{backoff::ReconnectPolicy, config::ReconnectConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Addressed,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Addressed => "ADDRESSED",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

/// Link and address events delivered by the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEvent {
    StationStarted,
    Disconnected,
    AddressAcquired(Ipv4Addr),
}

/// Station side of the link. Implementations perform the connect on their own
/// context after `delay` and must return promptly.
pub trait Station: Send + Sync {
    fn schedule_connect(&self, delay: Duration) -> anyhow::Result<()>;
}

pub trait ServerLauncher: Send + Sync {
    type Handle: Send;

    fn start(&self) -> anyhow::Result<Self::Handle>;
}

#[derive(Debug)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    Failed(anyhow::Error),
}

/// Holds at most one live server handle. The `starting` flag is claimed with a
/// compare-and-set before the launcher runs, and released only if the start
/// fails.
pub struct ServerSlot<H> {
    starting: AtomicBool,
    handle: Mutex<Option<H>>,
}

impl<H> Default for ServerSlot<H> {
    fn default() -> Self {
        Self {
            starting: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }
}

impl<H> ServerSlot<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_once<F>(&self, start: F) -> StartOutcome
    where
        F: FnOnce() -> anyhow::Result<H>,
    {
        if self
            .starting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return StartOutcome::AlreadyRunning;
        }

        match start() {
            Ok(handle) => {
                *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                StartOutcome::Started
            }
            Err(err) => {
                self.starting.store(false, Ordering::Release);
                StartOutcome::Failed(err)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn with_handle<R>(&self, f: impl FnOnce(&H) -> R) -> Option<R> {
        let guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(f)
    }
}

#[derive(Debug)]
struct LinkState {
    state: ConnectionState,
    address: Option<Ipv4Addr>,
    attempts: u32,
}

pub struct ConnectivityManager<S, L>
where
    S: Station,
    L: ServerLauncher,
{
    station: S,
    launcher: L,
    policy: ReconnectPolicy,
    link: Mutex<LinkState>,
    server: ServerSlot<L::Handle>,
    rng: Mutex<StdRng>,
}

impl<S, L> ConnectivityManager<S, L>
where
    S: Station,
    L: ServerLauncher,
{
    pub fn new(station: S, launcher: L, reconnect: &ReconnectConfig) -> Self {
        Self {
            station,
            launcher,
            policy: ReconnectPolicy::from_config(reconnect),
            link: Mutex::new(LinkState {
                state: ConnectionState::Idle,
                address: None,
                attempts: 0,
            }),
            server: ServerSlot::new(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn handle_event(&self, event: NetEvent) {
        match event {
            NetEvent::StationStarted => {
                self.set_state(ConnectionState::Connecting);
                info!("station started, connecting");
                if let Err(err) = self.station.schedule_connect(Duration::ZERO) {
                    warn!("failed to schedule initial connect: {err:#}");
                }
            }
            NetEvent::Disconnected => self.on_disconnected(),
            NetEvent::AddressAcquired(address) => self.on_address(address),
        }
    }

    fn on_disconnected(&self) {
        let attempt = {
            let mut link = self.lock_link();
            link.state = ConnectionState::Disconnected;
            link.address = None;
            let attempt = link.attempts;
            link.attempts = link.attempts.saturating_add(1);
            attempt
        };

        let delay = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            self.policy.delay_with_jitter(attempt, &mut *rng)
        };

        warn!(
            "station disconnected, reconnect attempt {} in {}ms",
            attempt + 1,
            delay.as_millis()
        );

        match self.station.schedule_connect(delay) {
            Ok(()) => self.set_state(ConnectionState::Connecting),
            Err(err) => warn!("failed to schedule reconnect: {err:#}"),
        }
    }

    fn on_address(&self, address: Ipv4Addr) {
        {
            let mut link = self.lock_link();
            link.state = ConnectionState::Addressed;
            link.address = Some(address);
            link.attempts = 0;
        }
        info!("address acquired: {address}");

        match self.server.start_once(|| self.launcher.start()) {
            StartOutcome::Started => info!("http server started"),
            StartOutcome::AlreadyRunning => debug!("http server already running"),
            StartOutcome::Failed(err) => warn!("http server start failed: {err:#}"),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_link().state
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.lock_link().address
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock_link().attempts
    }

    pub fn server_running(&self) -> bool {
        self.server.is_running()
    }

    pub fn with_server<R>(&self, f: impl FnOnce(&L::Handle) -> R) -> Option<R> {
        self.server.with_handle(f)
    }

    fn set_state(&self, state: ConnectionState) {
        self.lock_link().state = state;
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
