//! Tunnel session manager.
//!
//! Owns the interface lease, the optional auth relay and the engine for one
//! session at a time:
//!
//! ```text
//!  Stopped ──► Starting ──► Running ──► Stopping ──► Stopped
//!                 │                                     ▲
//!                 └──────────► Failed ──────────────────┘
//! ```
//!
//! Start and stop sequences are serialized behind an async mutex. Status
//! queries read a snapshot and never wait for an in-flight sequence.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use super::activity::{ActivityIndicator, ActivitySummary, LogIndicator};
use super::{InterfaceConfig, InterfaceLease, InterfaceProvider, InterfaceRequest};
use crate::engine::{EngineEvent, EngineEvents, EngineStartParams, TunnelEngine, DEFAULT_RCODE};
use crate::error::{EngineError, Error, Result};
use crate::proxy::{AuthRelay, RelayConfig, RelayStats};
use crate::types::{
    AppId, AppInfo, ProxyTarget, ResolvedEndpoint, SessionConfig, SessionReport, SessionStatus,
    TunnelState,
};

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(TunnelState),
    /// A requested app could not be resolved and was left out.
    AppSkipped(AppId),
    /// The engine stopped translating on its own.
    EngineExited(String),
    EngineError { code: i32, message: String },
}

/// Read-side view of the current session.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    state: TunnelState,
    session: Option<SessionView>,
}

#[derive(Debug, Clone)]
struct SessionView {
    proxy: ProxyTarget,
    endpoint: ResolvedEndpoint,
    apps: Vec<AppInfo>,
}

struct ActiveSession {
    lease: Box<dyn InterfaceLease>,
}

/// State only touched by start/stop sequences.
struct Inner {
    engine: Box<dyn TunnelEngine>,
    engine_error: Option<String>,
    relay: AuthRelay,
    session: Option<ActiveSession>,
}

/// Supervises one capture session at a time.
pub struct TunnelManager {
    provider: Arc<dyn InterfaceProvider>,
    indicator: Arc<dyn ActivityIndicator>,
    interface: InterfaceConfig,
    relay_port: u16,
    inner: Mutex<Inner>,
    snapshot: RwLock<Snapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl TunnelManager {
    /// Create a manager and initialize the engine.
    ///
    /// An engine that fails to initialize leaves the manager usable; every
    /// start then reports [`SessionStatus::EngineUnavailable`].
    pub fn new(
        mut engine: Box<dyn TunnelEngine>,
        provider: Arc<dyn InterfaceProvider>,
        relay: RelayConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);

        let sink = events.clone();
        let engine_name = engine.name().to_string();
        let callbacks = EngineEvents::new(move |event| {
            match &event {
                EngineEvent::Exit { reason } => warn!(%reason, "Engine exited"),
                EngineEvent::Error { code, message } => {
                    warn!(code, %message, "Engine reported an error")
                }
            }
            let _ = sink.send(match event {
                EngineEvent::Exit { reason } => SessionEvent::EngineExited(reason),
                EngineEvent::Error { code, message } => SessionEvent::EngineError { code, message },
            });
        });

        let engine_error = match engine.init(callbacks) {
            Ok(()) => {
                debug!(engine = %engine_name, "Engine initialized");
                None
            }
            Err(e) => {
                error!(engine = %engine_name, error = %e, "Engine initialization failed");
                Some(e.to_string())
            }
        };

        Self {
            provider,
            indicator: Arc::new(LogIndicator),
            interface: InterfaceConfig::default(),
            relay_port: relay.port,
            inner: Mutex::new(Inner {
                engine,
                engine_error,
                relay: AuthRelay::new(relay),
                session: None,
            }),
            snapshot: RwLock::new(Snapshot::default()),
            events,
        }
    }

    /// Replace the activity indicator.
    pub fn with_indicator(mut self, indicator: Arc<dyn ActivityIndicator>) -> Self {
        self.indicator = indicator;
        self
    }

    /// Use interface addressing from the configuration file.
    pub fn with_interface_config(mut self, config: InterfaceConfig) -> Self {
        self.interface = config;
        self
    }

    /// Receive session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start capturing. A running session is stopped first and the result is
    /// reported as [`SessionStatus::AlreadyRunningRestarted`].
    pub async fn start_session(&self, config: SessionConfig) -> Result<SessionReport> {
        if config.target_apps().is_empty() {
            warn!("Start requested without target apps");
            return Err(Error::NoValidTargets);
        }

        let mut inner = self.inner.lock().await;
        let restarted = inner.session.is_some();
        if restarted {
            info!("Session already running, restarting");
            self.stop_locked(&mut inner).await;
        }

        let mut report = self.start_locked(&mut inner, config).await?;
        if restarted {
            report.status = SessionStatus::AlreadyRunningRestarted;
        }
        Ok(report)
    }

    async fn start_locked(&self, inner: &mut Inner, config: SessionConfig) -> Result<SessionReport> {
        if let Some(reason) = &inner.engine_error {
            return Err(EngineError::Unavailable(reason.clone()).into());
        }

        let mtu = match inner.engine.mtu() {
            mtu if mtu > 0 => mtu,
            _ => crate::DEFAULT_MTU,
        };

        let mut apps = Vec::new();
        let mut skipped = Vec::new();
        for id in config.target_apps() {
            match self.provider.resolve_app(id) {
                Some(app) => apps.push(app),
                None => {
                    warn!(app = %id, "App not found, skipping");
                    let _ = self.events.send(SessionEvent::AppSkipped(id.clone()));
                    skipped.push(id.clone());
                }
            }
        }
        if apps.is_empty() {
            warn!("None of the requested apps could be resolved");
            return Err(Error::NoValidTargets);
        }

        self.set_state(TunnelState::Starting, None);

        let request = InterfaceRequest::new(mtu, apps.clone()).with_config(&self.interface);
        let lease = match self.provider.establish(&request) {
            Ok(lease) => lease,
            Err(e) => {
                error!(error = %e, "Failed to establish interface");
                self.fail();
                return Err(match e {
                    Error::PermissionDenied(_) | Error::InterfaceUnavailable(_) => e,
                    other => Error::InterfaceUnavailable(other.to_string()),
                });
            }
        };

        let mut endpoint = ResolvedEndpoint::resolve(&config, self.relay_port);
        if endpoint.is_relayed() {
            match inner
                .relay
                .start(config.proxy.clone(), &config.credentials, self.relay_port)
                .await
            {
                Ok(addr) => endpoint = ResolvedEndpoint::Relayed { port: addr.port() },
                Err(e) => {
                    error!(error = %e, "Failed to start auth relay");
                    release_lease(lease);
                    self.fail();
                    return Err(e);
                }
            }
        }

        let params = EngineStartParams {
            fd: lease.fd(),
            forward_dns: false,
            rcode: DEFAULT_RCODE,
            proxy_host: endpoint.host(),
            proxy_port: endpoint.port(),
        };
        if let Err(e) = inner.engine.start(&params) {
            error!(error = %e, "Failed to start engine");
            inner.relay.stop().await;
            release_lease(lease);
            self.fail();
            return Err(e);
        }

        info!(
            interface = %lease.name(),
            proxy = %config.proxy,
            endpoint = %endpoint,
            apps = apps.len(),
            "Proxy session started"
        );

        inner.session = Some(ActiveSession { lease });
        self.set_state(
            TunnelState::Running,
            Some(SessionView {
                proxy: config.proxy.clone(),
                endpoint: endpoint.clone(),
                apps: apps.clone(),
            }),
        );
        self.indicator
            .show(&ActivitySummary::new(&apps, &config.proxy, endpoint.is_relayed()));

        Ok(SessionReport {
            status: SessionStatus::Ok,
            endpoint,
            apps,
            skipped,
        })
    }

    /// Stop the session. Idempotent.
    pub async fn stop_session(&self) {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await;
    }

    /// The host withdrew the interface.
    pub async fn revoke(&self) {
        warn!("Interface revoked by host");
        self.stop_session().await;
    }

    /// Stop the session and tear the engine down for process exit.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await;
        inner.engine.teardown();
        inner.engine_error = Some("engine torn down".into());
        debug!("Tunnel manager shut down");
    }

    async fn stop_locked(&self, inner: &mut Inner) {
        let Some(session) = inner.session.take() else {
            if self.state() != TunnelState::Stopped {
                self.set_state(TunnelState::Stopped, None);
            }
            return;
        };

        self.set_state(TunnelState::Stopping, None);

        let fd = session.lease.fd();
        if let Err(e) = inner.engine.stop(fd) {
            warn!(fd, error = %e, "Engine stop failed");
        }
        inner.relay.stop().await;
        release_lease(session.lease);

        self.indicator.retract();
        self.set_state(TunnelState::Stopped, None);
        info!("Proxy session stopped");
    }

    /// `Starting → Failed → Stopped`, after cleanup.
    fn fail(&self) {
        self.set_state(TunnelState::Failed, None);
        self.indicator.retract();
        self.set_state(TunnelState::Stopped, None);
    }

    fn set_state(&self, state: TunnelState, session: Option<SessionView>) {
        {
            let mut snapshot = self.snapshot.write();
            snapshot.state = state;
            snapshot.session = session;
        }
        debug!(%state, "Tunnel state changed");
        let _ = self.events.send(SessionEvent::StateChanged(state));
    }

    pub fn state(&self) -> TunnelState {
        self.snapshot.read().state
    }

    /// True between a completed start and the beginning of a stop.
    ///
    /// An engine that exits on its own does not end the session: the state
    /// stays `Running` until `stop_session`, `revoke` or `shutdown`. Watch for
    /// [`SessionEvent::EngineExited`] to learn that translation has stopped.
    pub fn is_running(&self) -> bool {
        self.state() == TunnelState::Running
    }

    /// Endpoint the engine is pointed at while running.
    pub fn resolved_endpoint(&self) -> Option<ResolvedEndpoint> {
        self.snapshot
            .read()
            .session
            .as_ref()
            .map(|s| s.endpoint.clone())
    }

    /// One-line human readable status.
    pub fn describe(&self) -> String {
        let snapshot = self.snapshot.read();
        let Some(session) = snapshot.session.as_ref().filter(|_| snapshot.state == TunnelState::Running)
        else {
            return "HTTP proxy not running".to_string();
        };

        let apps = session
            .apps
            .iter()
            .map(|app| app.display_name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        match &session.endpoint {
            ResolvedEndpoint::Relayed { .. } => format!(
                "HTTP proxy at {} via {} for {}",
                session.proxy, session.endpoint, apps
            ),
            ResolvedEndpoint::Direct(_) => {
                format!("HTTP proxy at {} for {}", session.proxy, apps)
            }
        }
    }

    /// Relay counters accumulated over every session.
    pub async fn relay_stats(&self) -> RelayStats {
        self.inner.lock().await.relay.stats()
    }

    /// Upstream proxy the relay is forwarding to, if the relay is running.
    pub async fn relay_upstream(&self) -> Option<ProxyTarget> {
        self.inner.lock().await.relay.upstream().cloned()
    }
}

fn release_lease(lease: Box<dyn InterfaceLease>) {
    let name = lease.name().to_string();
    if let Err(e) = lease.release() {
        warn!(interface = %name, error = %e, "Failed to release interface");
    }
}
