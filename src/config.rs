//! Runtime settings for one relay process.
//!
//! The only value that must agree across cooperating processes is the shared
//! port: it is both the browser-facing endpoint and the leadership lock.
//! Everything else tunes local timing and exists mostly so tests can run on
//! tight schedules.

use std::time::Duration;

/// Shared well-known port all cooperating processes compete for.
pub const DEFAULT_PORT: u16 = 8765;

/// How often a standby retries binding the shared port.
pub const DEFAULT_ELECTION_INTERVAL: Duration = Duration::from_secs(5);

/// Sessions with no inbound message for this long are evicted by the sweep.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

/// How often the staleness sweep runs. Independent of message traffic.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// How long a standby's cached connection list stays fresh.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Default deadline for commands when the caller does not supply one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub election_interval: Duration,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub cache_ttl: Duration,
    pub command_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            election_interval: DEFAULT_ELECTION_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            cache_ttl: DEFAULT_CACHE_TTL,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl Settings {
    /// Settings for a given port with every other knob at its default.
    pub fn for_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Base URL of the leader's HTTP surface. Single-host by design, so the
    /// leader is always reachable on loopback.
    pub fn leader_base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}
