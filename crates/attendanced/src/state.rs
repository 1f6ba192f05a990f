use attendance_runner::Probe;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::Config;
use crate::ledger::Ledger;
use crate::relay::Relay;

/// Shared daemon state handed to every request.
pub struct AppState {
    pub config: Config,
    pub relay: Relay,
    pub ledger: Ledger,
    /// Interpreter probes made at startup, for diagnostics.
    pub probes: Vec<Probe>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, relay: Relay, ledger: Ledger, probes: Vec<Probe>) -> Arc<Self> {
        Arc::new(Self {
            config,
            relay,
            ledger,
            probes,
            started_at: Utc::now(),
        })
    }
}
