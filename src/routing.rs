//! The routing contract shared by both process roles.
//!
//! Tool-execution code always calls through [`RouterHandle`]; whether the
//! call lands on the local registry (leader) or is forwarded over HTTP
//! (standby) is invisible to it. Promotion swaps the handle's inner router
//! exactly once, atomically.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;

use crate::dispatch::CommandDispatcher;
use crate::error::RelayError;
use crate::protocol::{Command, PageMetadata, SessionInfo};
use crate::proxy::RemoteProxy;
use crate::registry::SessionRegistry;

/// Which role this process currently plays. `Leader` is terminal: a process
/// never demotes for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Leader,
    Standby,
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessRole::Leader => write!(f, "leader"),
            ProcessRole::Standby => write!(f, "standby"),
        }
    }
}

/// Leader-side implementation of the routing contract: the authoritative
/// registry plus the correlation dispatcher.
#[derive(Clone)]
pub struct LeaderRouter {
    pub registry: SessionRegistry,
    pub dispatcher: CommandDispatcher,
}

impl LeaderRouter {
    pub fn new() -> Self {
        Self {
            registry: SessionRegistry::new(),
            dispatcher: CommandDispatcher::new(),
        }
    }
}

impl Default for LeaderRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// One process-wide router: local on the leader, HTTP-backed on standbys.
pub enum SessionRouter {
    Leader(LeaderRouter),
    Standby(RemoteProxy),
}

impl SessionRouter {
    pub fn role(&self) -> ProcessRole {
        match self {
            SessionRouter::Leader(_) => ProcessRole::Leader,
            SessionRouter::Standby(_) => ProcessRole::Standby,
        }
    }

    /// Run a command on one session and await its result.
    pub async fn send_command(
        &self,
        session_id: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<Value, RelayError> {
        match self {
            SessionRouter::Leader(leader) => {
                leader
                    .dispatcher
                    .send_command(&leader.registry, session_id, command, timeout)
                    .await
            }
            SessionRouter::Standby(proxy) => proxy.send_command(session_id, command, timeout).await,
        }
    }

    /// List connected sessions. On a standby this may be cached and up to
    /// one TTL stale.
    pub async fn connections(&self) -> Vec<SessionInfo> {
        match self {
            SessionRouter::Leader(leader) => leader.registry.connections(),
            SessionRouter::Standby(proxy) => proxy.connections().await,
        }
    }

    /// Cheap "any tab" lookup. On a standby this consults only the local
    /// cache and never performs a network round trip.
    pub fn first_session_id(&self) -> Option<String> {
        match self {
            SessionRouter::Leader(leader) => leader.registry.first_session_id(),
            SessionRouter::Standby(proxy) => proxy.first_session_id(),
        }
    }

    /// Partial metadata update. Only meaningful against a live transport,
    /// so a standby rejects it as a contract violation.
    pub fn update_connection_info(
        &self,
        session_id: &str,
        meta: &PageMetadata,
    ) -> Result<bool, RelayError> {
        match self {
            SessionRouter::Leader(leader) => {
                Ok(leader.registry.update_connection_info(session_id, meta))
            }
            SessionRouter::Standby(_) => Err(RelayError::Unsupported("update_connection_info")),
        }
    }

    /// Evict a session. Leader only, for the same reason as above.
    pub fn remove_connection(&self, session_id: &str) -> Result<bool, RelayError> {
        match self {
            SessionRouter::Leader(leader) => Ok(leader.registry.remove_connection(session_id)),
            SessionRouter::Standby(_) => Err(RelayError::Unsupported("remove_connection")),
        }
    }
}

/// Process-wide handle to the active router.
///
/// Injected into every request and tool-execution path instead of a global
/// singleton; promotion replaces the inner `Arc` in one swap, so in-flight
/// calls finish against the router they started with while new calls see
/// the leader.
#[derive(Clone)]
pub struct RouterHandle {
    inner: Arc<RwLock<Arc<SessionRouter>>>,
}

impl RouterHandle {
    pub fn new(router: SessionRouter) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(router))),
        }
    }

    /// Snapshot of the active router. Callers hold the `Arc`, never the lock,
    /// across await points.
    pub fn current(&self) -> Arc<SessionRouter> {
        self.inner.read().clone()
    }

    /// Atomically install a new router, returning the role it replaced.
    pub fn replace(&self, router: SessionRouter) -> ProcessRole {
        let mut slot = self.inner.write();
        let old_role = slot.role();
        *slot = Arc::new(router);
        old_role
    }

    pub fn role(&self) -> ProcessRole {
        self.inner.read().role()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn handle_starts_with_given_role() {
        let settings = Settings::for_port(1);
        let handle = RouterHandle::new(SessionRouter::Standby(RemoteProxy::new(&settings)));
        assert_eq!(handle.role(), ProcessRole::Standby);
    }

    #[test]
    fn replace_swaps_role_and_reports_old() {
        let settings = Settings::for_port(1);
        let handle = RouterHandle::new(SessionRouter::Standby(RemoteProxy::new(&settings)));
        let old = handle.replace(SessionRouter::Leader(LeaderRouter::new()));
        assert_eq!(old, ProcessRole::Standby);
        assert_eq!(handle.role(), ProcessRole::Leader);
    }

    #[test]
    fn snapshot_outlives_replacement() {
        let handle = RouterHandle::new(SessionRouter::Leader(LeaderRouter::new()));
        let snapshot = handle.current();
        let settings = Settings::for_port(1);
        handle.replace(SessionRouter::Standby(RemoteProxy::new(&settings)));
        // The old snapshot is still usable; new snapshots see the new role.
        assert_eq!(snapshot.role(), ProcessRole::Leader);
        assert_eq!(handle.current().role(), ProcessRole::Standby);
    }

    #[test]
    fn standby_rejects_transport_operations() {
        let settings = Settings::for_port(1);
        let router = SessionRouter::Standby(RemoteProxy::new(&settings));
        let err = router
            .update_connection_info("tab-1", &PageMetadata::default())
            .unwrap_err();
        assert!(matches!(err, RelayError::Unsupported(_)));
        let err = router.remove_connection("tab-1").unwrap_err();
        assert!(matches!(err, RelayError::Unsupported(_)));
    }

    #[tokio::test]
    async fn leader_router_serves_empty_registry() {
        let router = SessionRouter::Leader(LeaderRouter::new());
        assert!(router.connections().await.is_empty());
        assert!(router.first_session_id().is_none());
    }
}
