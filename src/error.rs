//! Error taxonomy shared by the registry, dispatcher, and remote proxy.
//!
//! Callers of the routing contract see only these variants, so they never
//! need to know whether a call hit the local registry or was forwarded to
//! the leader over HTTP. Port contention and protocol parse failures are
//! handled internally and never appear here.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The session id is unknown or its transport is marked disconnected.
    #[error("session not found or disconnected: {0}")]
    SessionNotFound(String),

    /// No response arrived within the caller's deadline.
    #[error("command {command_id} to session {session_id} timed out after {timeout_ms}ms")]
    CommandTimeout {
        session_id: String,
        command_id: String,
        timeout_ms: u64,
    },

    /// The far end reported an explicit failure for this command.
    #[error("command rejected by session {session_id}: {message}")]
    CommandRejected {
        session_id: String,
        message: String,
    },

    /// The transport write failed (socket closed or writer backlogged).
    #[error("failed to deliver command to session {0}: transport unavailable")]
    TransportSendFailure(String),

    /// An operation that requires a live transport was invoked on a standby.
    /// This is a programming-contract violation, not a runtime condition.
    #[error("{0} requires the leader role; standby processes hold no transports")]
    Unsupported(&'static str),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::CommandTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RelayError::CommandRejected { .. } => StatusCode::BAD_GATEWAY,
            RelayError::TransportSendFailure(_) => StatusCode::BAD_GATEWAY,
            RelayError::Unsupported(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code string carried in error bodies. The proxy uses
    /// it to reconstruct the original variant on the standby side.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::SessionNotFound(_) => "session_not_found",
            RelayError::CommandTimeout { .. } => "command_timeout",
            RelayError::CommandRejected { .. } => "command_rejected",
            RelayError::TransportSendFailure(_) => "transport_send_failure",
            RelayError::Unsupported(_) => "unsupported",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "code": self.code(),
            "error": self.to_string(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}
