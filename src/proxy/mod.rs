//! Local authenticating proxy relay.
//!
//! Sits between the packet translation engine and an upstream HTTP proxy
//! that requires credentials the captured applications cannot supply.

pub mod auth;
mod relay;

pub use relay::{
    read_request, read_response_head, tunnel_accepted, AuthRelay, ConnectRequest, RelayConfig,
    RelaySession, RelayStats, RelaySummary, ResponseHead,
};
