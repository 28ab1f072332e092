//! Packet-to-socket translation engine boundary.
//!
//! The engine turns IP packets read from a virtual interface into ordinary
//! TCP/UDP flows aimed at one proxy endpoint. shunt never implements that
//! translation itself; it drives an engine through the narrow lifecycle
//! below:
//!
//! ```text
//!   init(events) ──► mtu() ──► start(params) ──► stop(fd) ──► teardown()
//!                                    │
//!                                    └──► events: Exit / Error (any time)
//! ```
//!
//! Engine callbacks are observational. They are logged and republished as
//! session events, never acknowledged.

mod command;

use std::fmt;
use std::sync::Arc;

pub use command::{CommandEngine, EngineConfig};

use crate::error::Result;
use crate::tun::InterfaceFd;

/// DNS response code the engine answers with when DNS forwarding is off.
pub const DEFAULT_RCODE: i32 = 3;

/// Parameters of a single engine start.
///
/// Deliberately carries no credentials: the engine only ever sees the
/// endpoint, which is the local relay whenever authentication is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStartParams {
    /// Interface descriptor to read packets from.
    pub fd: InterfaceFd,
    /// Forward DNS (port 53) traffic instead of answering locally.
    pub forward_dns: bool,
    /// Response code for locally answered DNS queries.
    pub rcode: i32,
    /// Proxy host flows are directed at.
    pub proxy_host: String,
    /// Proxy port flows are directed at.
    pub proxy_port: u16,
}

/// Asynchronous engine notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The engine stopped translating on its own.
    Exit { reason: String },
    /// The engine reported a non-fatal error.
    Error { code: i32, message: String },
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exit { reason } => write!(f, "engine exit: {reason}"),
            Self::Error { code, message } => write!(f, "engine error {code}: {message}"),
        }
    }
}

/// Callback handle given to an engine at `init`.
///
/// Cheap to clone, callable from any thread.
#[derive(Clone)]
pub struct EngineEvents {
    sink: Arc<dyn Fn(EngineEvent) + Send + Sync>,
}

impl EngineEvents {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(EngineEvent) + Send + Sync + 'static,
    {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// A handle that drops every event.
    pub fn discard() -> Self {
        Self::new(|_| {})
    }

    pub fn exit(&self, reason: impl Into<String>) {
        (self.sink)(EngineEvent::Exit {
            reason: reason.into(),
        });
    }

    pub fn error(&self, code: i32, message: impl Into<String>) {
        (self.sink)(EngineEvent::Error {
            code,
            message: message.into(),
        });
    }
}

impl fmt::Debug for EngineEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineEvents").finish_non_exhaustive()
    }
}

/// Lifecycle contract of a packet translation engine.
///
/// Calls are synchronous and expected to return promptly; engines run their
/// translation on their own threads or processes.
pub trait TunnelEngine: Send {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "engine"
    }

    /// One-time setup, called once before any session.
    fn init(&mut self, events: EngineEvents) -> Result<()>;

    /// MTU the engine wants for the interface. Non-positive means "no preference".
    fn mtu(&self) -> i32;

    /// Begin translating packets from `params.fd`.
    fn start(&mut self, params: &EngineStartParams) -> Result<()>;

    /// Halt translation for `fd`.
    fn stop(&mut self, fd: InterfaceFd) -> Result<()>;

    /// Process-wide shutdown.
    fn teardown(&mut self);
}
