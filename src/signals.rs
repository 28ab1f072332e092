//! Process signals for the foreground daemon.
//!
//! - SIGTERM/SIGINT stop the session and exit
//! - SIGHUP reloads the configuration and restarts the session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info};

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Interrupt,
    /// Reload configuration and restart the session.
    Hangup,
}

impl Signal {
    pub fn is_shutdown(self) -> bool {
        matches!(self, Self::Terminate | Self::Interrupt)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Terminate => write!(f, "SIGTERM"),
            Signal::Interrupt => write!(f, "SIGINT"),
            Signal::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Broadcasts received signals to subscribers.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown: Arc<AtomicBool>,
    signal_tx: broadcast::Sender<Signal>,
}

impl SignalHandler {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(16);
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            signal_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signal_tx.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown as if SIGTERM arrived.
    pub fn request_shutdown(&self) {
        self.deliver(Signal::Terminate);
    }

    fn deliver(&self, signal: Signal) {
        info!("Received signal: {}", signal);
        if signal.is_shutdown() {
            self.shutdown.store(true, Ordering::SeqCst);
        }
        let _ = self.signal_tx.send(signal);
    }

    /// Listen until a shutdown signal arrives.
    #[cfg(unix)]
    pub async fn listen(&self) {
        use futures::StreamExt;
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook_tokio::Signals;

        let mut signals = match Signals::new([SIGTERM, SIGINT, SIGHUP]) {
            Ok(s) => s.fuse(),
            Err(e) => {
                error!("Failed to register signal handlers: {}", e);
                return;
            }
        };

        while let Some(raw) = signals.next().await {
            let signal = match raw {
                SIGTERM => Signal::Terminate,
                SIGINT => Signal::Interrupt,
                SIGHUP => Signal::Hangup,
                _ => continue,
            };

            self.deliver(signal);
            if signal.is_shutdown() {
                break;
            }
        }
    }

    #[cfg(not(unix))]
    pub async fn listen(&self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => self.deliver(Signal::Interrupt),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
