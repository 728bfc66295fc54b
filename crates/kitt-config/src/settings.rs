//! Server runtime settings, read from environment variables.
//!
//! Production injects env vars directly; `.env.local` is picked up by the
//! daemon binary for dev convenience before this module is consulted.

use std::net::SocketAddr;
use std::time::Duration;

pub const ENV_BIND_ADDR: &str = "KITT_SERVER_ADDR";
pub const ENV_DB_PATH: &str = "KITT_DB_PATH";
pub const ENV_ADMIN_TOKEN: &str = "KITT_ADMIN_TOKEN";
pub const ENV_RUN_TIMEOUT_SECS: &str = "KITT_RUN_TIMEOUT_SECS";
pub const ENV_HEARTBEAT_INTERVAL_SECS: &str = "KITT_HEARTBEAT_INTERVAL_SECS";

/// Tunables for the orchestration core. Every value has a default; env vars
/// override.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_addr: SocketAddr,
    /// Path of the SQLite ledger file.
    pub db_path: String,
    /// Operator bearer token. Empty disables admin endpoints (agents still
    /// authenticate with their own tokens).
    pub admin_token: String,
    /// Expected agent heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// An agent is online while now − last_heartbeat ≤ liveness_window.
    pub liveness_window: Duration,
    /// Maximum wall-clock for one run before the watchdog fails it.
    pub run_timeout: Duration,
    /// Per-agent dispatch queue capacity.
    pub dispatch_capacity: usize,
    /// Per-subscriber event buffer before drop-oldest kicks in.
    pub subscriber_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(5);
        ServerSettings {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8088)),
            db_path: "kitt.db".to_string(),
            admin_token: String::new(),
            heartbeat_interval,
            // Recommended L = 3 × heartbeat interval.
            liveness_window: heartbeat_interval * 3,
            run_timeout: Duration::from_secs(30 * 60),
            dispatch_capacity: 64,
            subscriber_capacity: 128,
        }
    }
}

impl ServerSettings {
    /// Defaults overridden by KITT_* environment variables.
    pub fn from_env() -> Self {
        let mut s = ServerSettings::default();

        if let Some(addr) = env_parse::<SocketAddr>(ENV_BIND_ADDR) {
            s.bind_addr = addr;
        }
        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            if !path.is_empty() {
                s.db_path = path;
            }
        }
        if let Ok(token) = std::env::var(ENV_ADMIN_TOKEN) {
            s.admin_token = token;
        }
        if let Some(secs) = env_parse::<u64>(ENV_RUN_TIMEOUT_SECS) {
            s.run_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>(ENV_HEARTBEAT_INTERVAL_SECS) {
            s.heartbeat_interval = Duration::from_secs(secs);
            s.liveness_window = s.heartbeat_interval * 3;
        }

        s
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}
