//! Command dispatcher: correlates outbound commands to their responses.
//!
//! Every send registers a pending entry keyed by a fresh command id before
//! the envelope is transmitted, so a response can never arrive unmatched.
//! Exactly one of {response, timeout, send failure} completes each entry;
//! whichever path removes the entry from the map first wins, and the loser
//! becomes a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::RelayError;
use crate::protocol::{Command, CommandEnvelope};
use crate::registry::SessionRegistry;

type PendingSender = oneshot::Sender<Result<Value, RelayError>>;

#[derive(Clone)]
pub struct CommandDispatcher {
    pending: Arc<Mutex<HashMap<String, PendingSender>>>,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send a command to one session and await its correlated response.
    ///
    /// Fails with `SessionNotFound` before any I/O if the session is unknown
    /// or disconnected. A transport that rejects the write fails
    /// synchronously with `TransportSendFailure`. Otherwise the call resolves
    /// or rejects strictly within `timeout` plus scheduling jitter.
    pub async fn send_command(
        &self,
        registry: &SessionRegistry,
        session_id: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<Value, RelayError> {
        let transport = registry
            .transport(session_id)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;

        let command_id = Uuid::new_v4().to_string();
        let envelope = CommandEnvelope::new(session_id, &command_id, command);

        // Register before transmitting: a response racing the send call must
        // still find its pending entry.
        let (done_tx, done_rx) = oneshot::channel();
        self.pending.lock().insert(command_id.clone(), done_tx);

        if let Err(e) = transport.try_send(envelope) {
            self.pending.lock().remove(&command_id);
            tracing::warn!(session_id, command_id = %command_id, error = %e, "transport write failed");
            return Err(RelayError::TransportSendFailure(session_id.to_string()));
        }
        tracing::debug!(session_id, command_id = %command_id, "command dispatched");

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(result)) => result,
            // The dispatcher side of the channel was dropped without a
            // completion; only happens when the owning router is torn down.
            Ok(Err(_)) => Err(RelayError::TransportSendFailure(session_id.to_string())),
            Err(_) => {
                // Remove the entry so a late response finds nothing to
                // complete and is dropped.
                self.pending.lock().remove(&command_id);
                Err(RelayError::CommandTimeout {
                    session_id: session_id.to_string(),
                    command_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Complete a pending command from an inbound `command_response`.
    ///
    /// Returns `false` if no entry matched — a late response after timeout,
    /// which is dropped by design (at-most-one resolution, not exactly-once
    /// delivery).
    pub fn complete(
        &self,
        session_id: &str,
        command_id: &str,
        success: bool,
        data: Option<Value>,
        error: Option<String>,
    ) -> bool {
        let sender = self.pending.lock().remove(command_id);
        let Some(sender) = sender else {
            tracing::debug!(session_id, command_id, "dropping response with no pending command");
            return false;
        };
        let result = if success {
            Ok(data.unwrap_or(Value::Null))
        } else {
            Err(RelayError::CommandRejected {
                session_id: session_id.to_string(),
                message: error.unwrap_or_else(|| "unspecified error".to_string()),
            })
        };
        // The receiver may already be gone if the timeout won the race.
        sender.send(result).is_ok()
    }

    /// Number of commands currently awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PageMetadata;
    use crate::registry::TRANSPORT_CHANNEL_CAPACITY;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn command(kind: &str) -> Command {
        Command {
            command_type: kind.into(),
            payload: serde_json::json!({}),
        }
    }

    fn registry_with_session(
        session_id: &str,
    ) -> (SessionRegistry, mpsc::Receiver<CommandEnvelope>) {
        let registry = SessionRegistry::new();
        let (tx, rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        registry.register(session_id, tx, CancellationToken::new(), &PageMetadata::default());
        (registry, rx)
    }

    #[tokio::test]
    async fn unknown_session_fails_without_io() {
        let dispatcher = CommandDispatcher::new();
        let registry = SessionRegistry::new();
        let err = dispatcher
            .send_command(&registry, "ghost", command("click"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::SessionNotFound(_)));
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn response_resolves_with_data() {
        let dispatcher = CommandDispatcher::new();
        let (registry, mut rx) = registry_with_session("tab-1");

        let responder = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let envelope = rx.recv().await.unwrap();
                assert_eq!(envelope.kind, "command");
                assert_eq!(envelope.command_type, "click");
                dispatcher.complete(
                    "tab-1",
                    &envelope.id,
                    true,
                    Some(serde_json::json!({"ok": 1})),
                    None,
                );
            })
        };

        let data = dispatcher
            .send_command(&registry, "tab-1", command("click"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(data["ok"], 1);
        assert_eq!(dispatcher.pending_len(), 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn failure_response_rejects_with_message() {
        let dispatcher = CommandDispatcher::new();
        let (registry, mut rx) = registry_with_session("tab-1");

        let responder = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let envelope = rx.recv().await.unwrap();
                dispatcher.complete(
                    "tab-1",
                    &envelope.id,
                    false,
                    None,
                    Some("no such element".into()),
                );
            })
        };

        let err = dispatcher
            .send_command(&registry, "tab-1", command("click"), Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            RelayError::CommandRejected { message, .. } => {
                assert_eq!(message, "no such element");
            }
            other => panic!("expected CommandRejected, got {:?}", other),
        }
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_rejects_and_cleans_pending_map() {
        let dispatcher = CommandDispatcher::new();
        let (registry, mut rx) = registry_with_session("tab-1");

        let start = std::time::Instant::now();
        let err = dispatcher
            .send_command(&registry, "tab-1", command("click"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::CommandTimeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(dispatcher.pending_len(), 0);

        // A late response for that command id is dropped, not resurrected.
        let envelope = rx.recv().await.unwrap();
        assert!(!dispatcher.complete("tab-1", &envelope.id, true, None, None));
    }

    #[tokio::test]
    async fn closed_transport_fails_synchronously() {
        let dispatcher = CommandDispatcher::new();
        let registry = SessionRegistry::new();
        let (tx, rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        registry.register("tab-1", tx, CancellationToken::new(), &PageMetadata::default());
        drop(rx);

        let start = std::time::Instant::now();
        let err = dispatcher
            .send_command(&registry, "tab-1", command("click"), Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::TransportSendFailure(_)));
        // Rejects without waiting out the deadline.
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn concurrent_commands_use_distinct_ids() {
        let dispatcher = CommandDispatcher::new();
        let registry = SessionRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        let (tx2, mut rx2) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        registry.register("tab-1", tx1, CancellationToken::new(), &PageMetadata::default());
        registry.register("tab-2", tx2, CancellationToken::new(), &PageMetadata::default());

        let responder = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let e1 = rx1.recv().await.unwrap();
                let e2 = rx2.recv().await.unwrap();
                assert_ne!(e1.id, e2.id);
                // Complete each with data naming its own session.
                dispatcher.complete("tab-1", &e1.id, true, Some(serde_json::json!("one")), None);
                dispatcher.complete("tab-2", &e2.id, true, Some(serde_json::json!("two")), None);
            })
        };

        let (r1, r2) = tokio::join!(
            dispatcher.send_command(&registry, "tab-1", command("a"), Duration::from_secs(2)),
            dispatcher.send_command(&registry, "tab-2", command("b"), Duration::from_secs(2)),
        );
        assert_eq!(r1.unwrap(), serde_json::json!("one"));
        assert_eq!(r2.unwrap(), serde_json::json!("two"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn response_with_unknown_id_is_ignored() {
        let dispatcher = CommandDispatcher::new();
        assert!(!dispatcher.complete("tab-1", "never-sent", true, None, None));
    }
}
