//! Shared browser-session relay.
//!
//! Many local processes need to drive the same pool of live browser
//! WebSocket connections, but a socket can only be owned by one process.
//! Exactly one process (the leader, elected by binding a well-known local
//! port) owns the transports; every other process runs as a standby and
//! forwards through the leader's HTTP API. Callers use [`routing::RouterHandle`]
//! and never observe which role the process currently holds.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod election;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod routing;
pub mod shutdown;
