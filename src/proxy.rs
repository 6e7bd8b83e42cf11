//! Standby-side implementation of the routing contract.
//!
//! Holds no transports; every routing call is forwarded to the leader's
//! HTTP surface on the shared port. Failures are mapped back into the same
//! [`RelayError`] shapes a local call would produce, so callers cannot tell
//! the roles apart.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use crate::config::Settings;
use crate::error::RelayError;
use crate::protocol::{Command, CommandRequest, SessionInfo};

/// Connect timeout for every hop to the leader. Requests carry their own
/// end-to-end deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Cached copy of the leader's connection list.
///
/// Bounds load on the leader when many standbys poll, and doubles as the
/// fallback served when the leader is briefly unreachable (e.g. during a
/// failover window).
struct ConnectionCache {
    entries: Vec<SessionInfo>,
    fetched_at: Option<Instant>,
}

impl ConnectionCache {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            fetched_at: None,
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        matches!(self.fetched_at, Some(at) if at.elapsed() <= ttl)
    }

    fn store(&mut self, entries: Vec<SessionInfo>) {
        self.entries = entries;
        self.fetched_at = Some(Instant::now());
    }
}

pub struct RemoteProxy {
    base_url: String,
    ttl: Duration,
    cache: Mutex<ConnectionCache>,
}

impl RemoteProxy {
    pub fn new(settings: &Settings) -> Self {
        Self {
            base_url: settings.leader_base_url(),
            ttl: settings.cache_ttl,
            cache: Mutex::new(ConnectionCache::new()),
        }
    }

    fn build_client(&self) -> Result<reqwest::Client, RelayError> {
        reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build HTTP client");
                RelayError::TransportSendFailure("leader".to_string())
            })
    }

    /// Forward a command to the leader with an end-to-end deadline equal to
    /// the caller's requested timeout.
    pub async fn send_command(
        &self,
        session_id: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<Value, RelayError> {
        let client = self.build_client()?;
        let body = CommandRequest {
            command,
            session_id: session_id.to_string(),
            timeout_ms: Some(timeout.as_millis() as u64),
        };

        let response = client
            .post(format!("{}/api/command", self.base_url))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayError::CommandTimeout {
                        session_id: session_id.to_string(),
                        command_id: "remote".to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }
                } else {
                    tracing::warn!(session_id, error = %e, "leader unreachable for command forward");
                    RelayError::TransportSendFailure(session_id.to_string())
                }
            })?;

        let status = response.status();
        let payload: Value = response.json().await.map_err(|e| {
            tracing::warn!(session_id, error = %e, "invalid response body from leader");
            RelayError::TransportSendFailure(session_id.to_string())
        })?;

        if status.is_success() {
            return Ok(payload.get("data").cloned().unwrap_or(Value::Null));
        }

        // The leader's error body carries the machine-readable code the
        // local path would have produced; rebuild the matching variant.
        let message = payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        Err(match payload.get("code").and_then(Value::as_str) {
            Some("session_not_found") => RelayError::SessionNotFound(session_id.to_string()),
            Some("command_timeout") => RelayError::CommandTimeout {
                session_id: session_id.to_string(),
                command_id: "remote".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            },
            Some("transport_send_failure") => {
                RelayError::TransportSendFailure(session_id.to_string())
            }
            _ => RelayError::CommandRejected {
                session_id: session_id.to_string(),
                message,
            },
        })
    }

    /// Connection list, served from cache within the TTL. A failed refresh
    /// serves the last good snapshot rather than failing the caller.
    pub async fn connections(&self) -> Vec<SessionInfo> {
        {
            let cache = self.cache.lock();
            if cache.is_fresh(self.ttl) {
                return cache.entries.clone();
            }
        }

        match self.fetch_connections().await {
            Ok(entries) => {
                let mut cache = self.cache.lock();
                cache.store(entries.clone());
                entries
            }
            Err(e) => {
                tracing::warn!(error = %e, "connection list refresh failed, serving cached copy");
                self.cache.lock().entries.clone()
            }
        }
    }

    async fn fetch_connections(&self) -> Result<Vec<SessionInfo>, RelayError> {
        let client = self.build_client()?;
        let response = client
            .get(format!("{}/api/connections", self.base_url))
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await
            .map_err(|_| RelayError::TransportSendFailure("leader".to_string()))?;
        if !response.status().is_success() {
            return Err(RelayError::TransportSendFailure("leader".to_string()));
        }
        response
            .json::<Vec<SessionInfo>>()
            .await
            .map_err(|_| RelayError::TransportSendFailure("leader".to_string()))
    }

    /// First cached session id. Deliberately cache-only: a cheap convenience
    /// lookup that accepts slightly stale results over a network round trip.
    pub fn first_session_id(&self) -> Option<String> {
        self.cache
            .lock()
            .entries
            .iter()
            .find(|s| s.connected)
            .map(|s| s.session_id.clone())
    }

    /// Base URL of the leader this proxy forwards to.
    pub fn leader_url(&self) -> &str {
        &self.base_url
    }
}
