//! "Ongoing activity" signal shown while a session runs.

use std::fmt;

use tracing::info;

use crate::types::{AppInfo, ProxyTarget};

/// Title of the activity signal.
pub const ACTIVITY_TITLE: &str = "HTTP Proxy Active";

/// Content of the activity signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivitySummary {
    pub title: String,
    pub text: String,
}

impl ActivitySummary {
    /// `<apps> -> HTTP host:port`, suffixed with ` (auth)` when the relay is used.
    pub fn new(apps: &[AppInfo], proxy: &ProxyTarget, authenticated: bool) -> Self {
        let names = apps
            .iter()
            .map(|app| app.display_name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let auth = if authenticated { " (auth)" } else { "" };

        Self {
            title: ACTIVITY_TITLE.to_string(),
            text: format!("{names} -> HTTP {proxy}{auth}"),
        }
    }
}

impl fmt::Display for ActivitySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title, self.text)
    }
}

/// Host-visible indicator of a running session.
pub trait ActivityIndicator: Send + Sync {
    fn show(&self, summary: &ActivitySummary);

    fn retract(&self);
}

/// Indicator that writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogIndicator;

impl ActivityIndicator for LogIndicator {
    fn show(&self, summary: &ActivitySummary) {
        info!(title = %summary.title, "{}", summary.text);
    }

    fn retract(&self) {
        info!("Proxy activity ended");
    }
}
