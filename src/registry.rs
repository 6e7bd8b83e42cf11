//! Authoritative map of browser sessions, held only by the leader process.
//!
//! Each entry pairs last-known tab metadata with the sending half of the
//! transport's writer channel. The WebSocket read loop (`api.rs`) classifies
//! inbound messages and calls into the registry; the dispatcher borrows
//! transports from it to transmit command envelopes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{CommandEnvelope, PageMetadata, SessionInfo};
use crate::shutdown::ShutdownCoordinator;

/// Depth of each transport's writer channel. `try_send` failure on a full
/// channel is treated the same as a closed socket: the transport is not
/// keeping up and the command cannot be delivered in time.
pub const TRANSPORT_CHANNEL_CAPACITY: usize = 32;

struct SessionEntry {
    url: Option<String>,
    title: Option<String>,
    user_agent: Option<String>,
    connected: bool,
    /// Monotonic clock for staleness math.
    last_seen: Instant,
    /// Wall clock (unix millis) reported on the wire.
    last_seen_ms: u64,
    transport: mpsc::Sender<CommandEnvelope>,
    /// Cancelling this token closes the owning socket tasks.
    cancel: CancellationToken,
    /// Distinguishes a transport from its replacement after a reconnect, so
    /// the old socket's close handler cannot evict the new entry.
    epoch: u64,
}

impl SessionEntry {
    fn info(&self, session_id: &str) -> SessionInfo {
        SessionInfo {
            session_id: session_id.to_string(),
            url: self.url.clone(),
            title: self.title.clone(),
            user_agent: self.user_agent.clone(),
            connected: self.connected,
            last_seen: self.last_seen_ms,
        }
    }

    fn apply(&mut self, meta: &PageMetadata) {
        // Partial-update semantics: absent fields leave existing values alone.
        if let Some(ref url) = meta.url {
            self.url = Some(url.clone());
        }
        if let Some(ref title) = meta.title {
            self.title = Some(title.clone());
        }
        if let Some(ref ua) = meta.user_agent {
            self.user_agent = Some(ua.clone());
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_ms = unix_millis();
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct RegistryInner {
    sessions: HashMap<String, SessionEntry>,
    next_epoch: u64,
}

/// Manages all connected browser sessions, keyed by session id.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                next_epoch: 0,
            })),
        }
    }

    /// Install a transport under `session_id`, returning the epoch assigned
    /// to this registration.
    ///
    /// If an entry with the same id already exists, its transport is
    /// cancelled and the mapping purged before the new one is installed —
    /// a reconnect replaces, never duplicates. The close/purge and the
    /// insert happen under one write lock, so no reader can observe two
    /// transports for one id.
    pub fn register(
        &self,
        session_id: &str,
        transport: mpsc::Sender<CommandEnvelope>,
        cancel: CancellationToken,
        meta: &PageMetadata,
    ) -> u64 {
        let mut inner = self.inner.write();
        if let Some(old) = inner.sessions.remove(session_id) {
            tracing::info!(session_id, "session reconnected, closing previous transport");
            old.cancel.cancel();
        }
        let epoch = inner.next_epoch;
        inner.next_epoch += 1;

        let mut entry = SessionEntry {
            url: None,
            title: None,
            user_agent: None,
            connected: true,
            last_seen: Instant::now(),
            last_seen_ms: unix_millis(),
            transport,
            cancel,
            epoch,
        };
        entry.apply(meta);
        inner.sessions.insert(session_id.to_string(), entry);
        tracing::info!(session_id, epoch, "session registered");
        epoch
    }

    /// Evict a session unconditionally. Idempotent: evicting an id that is
    /// already gone returns `false` and does nothing.
    pub fn remove_connection(&self, session_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            inner.sessions.remove(session_id)
        };
        match removed {
            Some(mut entry) => {
                entry.connected = false;
                entry.cancel.cancel();
                tracing::info!(session_id, "session removed");
                true
            }
            None => false,
        }
    }

    /// Evict a session only if it still belongs to the given registration
    /// epoch. Socket close handlers use this so a late close event from a
    /// replaced transport cannot evict its successor.
    pub fn remove_connection_if_epoch(&self, session_id: &str, epoch: u64) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            match inner.sessions.get(session_id) {
                Some(entry) if entry.epoch == epoch => inner.sessions.remove(session_id),
                _ => None,
            }
        };
        match removed {
            Some(mut entry) => {
                entry.connected = false;
                entry.cancel.cancel();
                tracing::info!(session_id, epoch, "session removed on transport close");
                true
            }
            None => false,
        }
    }

    /// Partial metadata update: only fields present in `meta` overwrite
    /// existing values. Also refreshes `last_seen`. Returns `false` if the
    /// session is unknown.
    pub fn update_connection_info(&self, session_id: &str, meta: &PageMetadata) -> bool {
        let mut inner = self.inner.write();
        match inner.sessions.get_mut(session_id) {
            Some(entry) => {
                entry.apply(meta);
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// Refresh `last_seen` without touching metadata.
    pub fn touch(&self, session_id: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.sessions.get_mut(session_id) {
            Some(entry) => {
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// Snapshot of all connected sessions.
    pub fn connections(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read();
        inner
            .sessions
            .iter()
            .filter(|(_, e)| e.connected)
            .map(|(id, e)| e.info(id))
            .collect()
    }

    /// Look up one connected session.
    pub fn connection(&self, session_id: &str) -> Option<SessionInfo> {
        let inner = self.inner.read();
        inner
            .sessions
            .get(session_id)
            .filter(|e| e.connected)
            .map(|e| e.info(session_id))
    }

    /// Borrow the transport sender for a connected session. The dispatcher
    /// uses this to transmit command envelopes.
    pub fn transport(&self, session_id: &str) -> Option<mpsc::Sender<CommandEnvelope>> {
        let inner = self.inner.read();
        inner
            .sessions
            .get(session_id)
            .filter(|e| e.connected)
            .map(|e| e.transport.clone())
    }

    /// Convenience lookup for callers that just want "any tab".
    pub fn first_session_id(&self) -> Option<String> {
        let inner = self.inner.read();
        inner
            .sessions
            .iter()
            .find(|(_, e)| e.connected)
            .map(|(id, _)| id.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every session whose `last_seen` age exceeds `max_age`,
    /// returning the evicted ids. Covers half-closed sockets that never
    /// deliver a close event.
    pub fn evict_stale(&self, max_age: Duration) -> Vec<String> {
        let stale: Vec<(String, SessionEntry)> = {
            let mut inner = self.inner.write();
            let ids: Vec<String> = inner
                .sessions
                .iter()
                .filter(|(_, e)| e.last_seen.elapsed() > max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.sessions.remove(&id).map(|e| (id, e)))
                .collect()
        };
        stale
            .into_iter()
            .map(|(id, entry)| {
                entry.cancel.cancel();
                tracing::warn!(session_id = %id, "evicting stale session");
                id
            })
            .collect()
    }

    /// Evict everything. Used on shutdown.
    pub fn clear(&self) {
        let drained: Vec<(String, SessionEntry)> = {
            let mut inner = self.inner.write();
            inner.sessions.drain().collect()
        };
        for (id, entry) in drained {
            entry.cancel.cancel();
            tracing::debug!(session_id = %id, "session evicted on shutdown");
        }
    }

    /// Spawn the periodic staleness sweep. Runs until shutdown; the period
    /// is independent of message traffic.
    pub fn spawn_sweeper(
        &self,
        period: Duration,
        max_age: Duration,
        shutdown: &ShutdownCoordinator,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; consume it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = registry.evict_stale(max_age);
                        if !evicted.is_empty() {
                            tracing::info!(count = evicted.len(), "staleness sweep evicted sessions");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }
}
