//! Per-uid policy routing (Linux).
//!
//! Each allowed user gets an `ip rule uidrange U-U lookup <table>` entry and
//! the table holds one route through the TUN device. Traffic of every other
//! user keeps using the main table.

use tracing::{debug, info, warn};

use super::device::run_ip;
use crate::error::Result;

/// Routing rules installed for one session.
#[derive(Debug)]
pub struct UidRouting {
    interface: String,
    route: String,
    table_id: u32,
    priority: u32,
    uids: Vec<u32>,
    installed_rules: Vec<u32>,
    route_installed: bool,
}

impl UidRouting {
    pub fn new(interface: &str, route: &str, table_id: u32, priority: u32, uids: Vec<u32>) -> Self {
        Self {
            interface: interface.to_string(),
            route: route.to_string(),
            table_id,
            priority,
            uids,
            installed_rules: Vec::new(),
            route_installed: false,
        }
    }

    /// Install the table route and the uid rules. Partial installs are rolled back.
    pub fn setup(&mut self) -> Result<()> {
        if let Err(e) = self.setup_inner() {
            self.teardown();
            return Err(e);
        }

        info!(
            interface = %self.interface,
            table = self.table_id,
            uids = ?self.uids,
            "Policy routing installed"
        );
        Ok(())
    }

    fn setup_inner(&mut self) -> Result<()> {
        let args = self.route_args("replace");
        run_ip(&as_strs(&args))?;
        self.route_installed = true;

        for uid in self.uids.clone() {
            let args = self.rule_args("add", uid);
            run_ip(&as_strs(&args))?;
            self.installed_rules.push(uid);
        }
        Ok(())
    }

    /// Remove everything `setup` installed. Failures are logged and skipped.
    pub fn teardown(&mut self) {
        for uid in std::mem::take(&mut self.installed_rules) {
            let args = self.rule_args("del", uid);
            if let Err(e) = run_ip(&as_strs(&args)) {
                warn!(uid, error = %e, "Failed to remove routing rule");
            }
        }

        if self.route_installed {
            let args = self.route_args("del");
            if let Err(e) = run_ip(&as_strs(&args)) {
                warn!(table = self.table_id, error = %e, "Failed to remove table route");
            }
            self.route_installed = false;
        }

        debug!(interface = %self.interface, "Policy routing removed");
    }

    pub fn is_setup(&self) -> bool {
        self.route_installed
    }

    fn route_args(&self, verb: &str) -> Vec<String> {
        vec![
            "route".into(),
            verb.into(),
            self.route.clone(),
            "dev".into(),
            self.interface.clone(),
            "table".into(),
            self.table_id.to_string(),
        ]
    }

    fn rule_args(&self, verb: &str, uid: u32) -> Vec<String> {
        vec![
            "rule".into(),
            verb.into(),
            "uidrange".into(),
            format!("{uid}-{uid}"),
            "lookup".into(),
            self.table_id.to_string(),
            "priority".into(),
            self.priority.to_string(),
        ]
    }
}

impl Drop for UidRouting {
    fn drop(&mut self) {
        if self.route_installed || !self.installed_rules.is_empty() {
            self.teardown();
        }
    }
}

fn as_strs(args: &[String]) -> Vec<&str> {
    args.iter().map(String::as_str).collect()
}
