//! # shunt
//!
//! Per-app traffic capture into an upstream HTTP proxy, with transparent
//! proxy authentication.
//!
//! Selected applications get a virtual interface; a packet translation
//! engine turns their packets into TCP/UDP flows aimed at the proxy. Apps
//! that cannot authenticate to a proxy themselves go through a local relay
//! that injects `Proxy-Authorization` into every CONNECT.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Session control surface                     │
//! │          start_session / stop_session / describe                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         TunnelManager                           │
//! │  ┌────────────────────┐ ┌──────────────────┐ ┌───────────────┐  │
//! │  │ InterfaceProvider  │ │   TunnelEngine   │ │   AuthRelay   │  │
//! │  │ (TUN + uid routes) │ │ (packets → TCP)  │ │ (127.0.0.1)   │  │
//! │  └────────────────────┘ └──────────────────┘ └───────────────┘  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      Upstream HTTP proxy                        │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::unreadable_literal)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::significant_drop_tightening)] // Lock ordering is intentional
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::redundant_pub_crate)]       // Explicit visibility
#![allow(clippy::too_many_lines)]
#![allow(clippy::future_not_send)]
#![allow(clippy::match_same_arms)]           // Explicit arm per variant is clearer
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use
#![allow(clippy::ignored_unit_patterns)]

pub mod config;
pub mod engine;
pub mod error;
pub mod proxy;
pub mod signals;
pub mod tun;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default loopback port of the authenticating relay
pub const DEFAULT_RELAY_PORT: u16 = 8888;

/// Interface MTU used when the engine has no preference
pub const DEFAULT_MTU: i32 = 1500;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::{CommandEngine, EngineConfig, TunnelEngine};
    pub use crate::error::{Error, Result};
    pub use crate::proxy::{AuthRelay, RelayConfig};
    pub use crate::tun::{InterfaceProvider, LinuxTunProvider, SessionEvent, TunnelManager};
    pub use crate::types::*;
}
