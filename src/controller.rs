//! Reconnection controller
//!
//! One control task drives the connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting ...
//!                      |                                        |
//!                      +---------> Failed <---------------------+
//! ```
//!
//! While connected it owns the datagram proxy and one health check. A
//! stream failure from the proxy or a stall verdict from the monitor
//! tears the session down and reruns the whole fallback loop after a
//! cooldown. Only an exhausted fallback loop is terminal.

use crate::fallback::FallbackDriver;
use crate::health::{HealthMonitor, HealthSettings};
use crate::ledger::SelectionLedger;
use crate::proxy::{CounterHandle, CounterSource, DatagramProxy, ProxyCounters, ProxySettings};
use crate::tunnel::{Destination, Establisher};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the caller event channel
const EVENT_CAPACITY: usize = 64;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why the controller reconnected or gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The tunnel stream closed or failed mid-session
    StreamClosed,
    /// Registered, but too little downlink traffic
    Stalled,
    /// Every disguise candidate failed; carries the per-candidate summary
    AllAttemptsFailed(String),
    /// The loopback endpoint could not be bound
    LocalEndpoint(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StreamClosed => write!(f, "tunnel stream closed"),
            FailureReason::Stalled => write!(f, "tunnel stalled (no inbound traffic)"),
            FailureReason::AllAttemptsFailed(summary) => {
                write!(f, "all disguises failed ({})", summary)
            }
            FailureReason::LocalEndpoint(e) => write!(f, "local endpoint unavailable: {}", e),
        }
    }
}

/// Caller-facing transition events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Connecting,
    Connected {
        disguise: &'static str,
        local_addr: SocketAddr,
    },
    Reconnecting {
        reason: FailureReason,
    },
    Disconnected,
    Error {
        reason: FailureReason,
    },
}

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub proxy: ProxySettings,
    pub health: HealthSettings,
    /// Pause between fallback candidates
    pub attempt_cooldown: Duration,
    /// Pause between teardown and the next connect
    pub reconnect_cooldown: Duration,
    /// Try the whole catalog (true) or only the canonical disguise
    pub mimicry_enabled: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            proxy: ProxySettings::default(),
            health: HealthSettings::default(),
            attempt_cooldown: Duration::from_secs(2),
            reconnect_cooldown: Duration::from_secs(2),
            mimicry_enabled: true,
        }
    }
}

/// State visible outside the control task
struct Shared {
    state: watch::Sender<ConnectionState>,
    counters: RwLock<Option<CounterHandle>>,
    local_addr: RwLock<Option<SocketAddr>>,
    events: broadcast::Sender<TunnelEvent>,
}

impl Shared {
    fn transition(&self, state: ConnectionState, event: TunnelEvent) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("State {} -> {}", previous, state);
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_proxy(&self, proxy: Option<&DatagramProxy>) {
        *self.counters.write().unwrap_or_else(|e| e.into_inner()) = proxy.map(|p| p.counters());
        *self.local_addr.write().unwrap_or_else(|e| e.into_inner()) = proxy.map(|p| p.local_addr());
    }
}

struct ControlHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the connection lifecycle for one destination at a time
pub struct ConnectionController {
    driver: FallbackDriver,
    settings: ControllerSettings,
    shared: Arc<Shared>,
    control: Mutex<Option<ControlHandle>>,
}

impl ConnectionController {
    pub fn new(
        settings: ControllerSettings,
        establisher: Arc<dyn Establisher>,
        ledger: Arc<SelectionLedger>,
    ) -> Self {
        let driver = FallbackDriver::new(establisher, ledger)
            .with_cooldown(settings.attempt_cooldown)
            .with_mimicry(settings.mimicry_enabled);

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            driver,
            settings,
            shared: Arc::new(Shared {
                state,
                counters: RwLock::new(None),
                local_addr: RwLock::new(None),
                events,
            }),
            control: Mutex::new(None),
        }
    }

    /// Start connecting in the background
    ///
    /// Progress is reported through [`subscribe`](Self::subscribe).
    pub fn connect(&self, destination: Destination, auth_token: impl Into<String>) -> crate::Result<()> {
        let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        if control.as_ref().is_some_and(|c| !c.task.is_finished()) {
            return Err(crate::Error::AlreadyConnected);
        }

        let auth_token = auth_token.into();
        info!(host = %destination.host, "Connecting to {} (token: {} bytes)", destination, auth_token.len());

        // Visible before the task is first polled
        self.shared.state.send_replace(ConnectionState::Connecting);

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(control_loop(
            self.driver.clone(),
            self.settings.clone(),
            self.shared.clone(),
            destination,
            auth_token,
            stop_rx,
        ));

        *control = Some(ControlHandle { stop_tx, task });
        Ok(())
    }

    /// Tear down any active session and stop reconnecting
    ///
    /// Idempotent; returns once the control task has finished.
    pub async fn disconnect(&self) {
        let handle = self.control.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(handle) = handle else {
            return;
        };

        let _ = handle.stop_tx.send(true);
        if let Err(e) = handle.task.await {
            error!("Control task ended abnormally: {}", e);
            self.shared.publish_proxy(None);
        }

        // The task may have ended on its own in `Failed`
        if self.state() != ConnectionState::Disconnected {
            info!("Disconnected");
            self.shared
                .transition(ConnectionState::Disconnected, TunnelEvent::Disconnected);
        }
    }

    /// Receive transition events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Relay counters of the active session; zeros when not connected
    pub fn counters(&self) -> ProxyCounters {
        self.shared
            .counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }

    /// Loopback endpoint of the active session
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ledger(&self) -> &Arc<SelectionLedger> {
        self.driver.ledger()
    }

    /// Resolve once the controller is `Disconnected` or `Failed`
    pub async fn wait(&self) -> ConnectionState {
        let mut state = self.shared.state.subscribe();
        let result = state
            .wait_for(|s| matches!(s, ConnectionState::Disconnected | ConnectionState::Failed))
            .await
            .map(|s| *s);
        result.unwrap_or(ConnectionState::Disconnected)
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        if let Some(handle) = self.control.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.stop_tx.send(true);
        }
    }
}

async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn control_loop(
    driver: FallbackDriver,
    settings: ControllerSettings,
    shared: Arc<Shared>,
    destination: Destination,
    auth_token: String,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        shared.transition(ConnectionState::Connecting, TunnelEvent::Connecting);

        let attempt = tokio::select! {
            _ = stop_requested(&mut stop_rx) => break,
            attempt = driver.connect(&destination, &auth_token) => attempt,
        };

        let session = match attempt {
            Ok(session) => session,
            Err(e) => {
                error!(host = %destination.host, "{}", e);
                let reason = FailureReason::AllAttemptsFailed(e.summary());
                shared.transition(ConnectionState::Failed, TunnelEvent::Error { reason });
                return;
            }
        };

        let (failure_tx, mut failure_rx) = mpsc::channel(1);
        let proxy = match DatagramProxy::start(session, &settings.proxy, failure_tx).await {
            Ok(proxy) => proxy,
            Err(e) => {
                error!("{}", e);
                let reason = FailureReason::LocalEndpoint(e.to_string());
                shared.transition(ConnectionState::Failed, TunnelEvent::Error { reason });
                return;
            }
        };

        shared.publish_proxy(Some(&proxy));
        info!(
            host = %destination.host,
            disguise = %proxy.disguise().id,
            "Connected, relaying on {}",
            proxy.local_addr()
        );
        shared.transition(
            ConnectionState::Connected,
            TunnelEvent::Connected {
                disguise: proxy.disguise().id,
                local_addr: proxy.local_addr(),
            },
        );

        let (verdict_tx, mut verdict_rx) = mpsc::channel(1);
        let counters: Arc<dyn CounterSource> = Arc::new(proxy.counters());
        let health = HealthMonitor::new(settings.health.clone()).spawn(counters, verdict_tx);

        let reason = tokio::select! {
            _ = stop_requested(&mut stop_rx) => None,
            Some(failure) = failure_rx.recv() => {
                warn!("Session lost: {}", failure);
                Some(FailureReason::StreamClosed)
            }
            Some(_) = verdict_rx.recv() => Some(FailureReason::Stalled),
        };

        health.abort();
        proxy.stop().await;
        shared.publish_proxy(None);

        let Some(reason) = reason else {
            break;
        };

        info!("Reconnecting: {}", reason);
        shared.transition(
            ConnectionState::Reconnecting,
            TunnelEvent::Reconnecting { reason },
        );

        tokio::select! {
            _ = stop_requested(&mut stop_rx) => break,
            _ = tokio::time::sleep(settings.reconnect_cooldown) => {}
        }
    }

    info!(host = %destination.host, "Disconnected");
    shared.transition(ConnectionState::Disconnected, TunnelEvent::Disconnected);
}
