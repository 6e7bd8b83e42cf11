//! Leader election and failover.
//!
//! Leadership is decided by the kernel: whichever process holds a bind on
//! the shared port is the leader. There is no other cross-process lock.
//! Standbys retry the bind on a fixed interval; the first to succeed after
//! the leader dies promotes itself, starts the registry and listeners, and
//! swaps the process-wide routing handle. Promotion is terminal.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;

use crate::api;
use crate::config::Settings;
use crate::routing::{LeaderRouter, RouterHandle, SessionRouter};
use crate::shutdown::ShutdownCoordinator;

/// Result of one bind attempt on the shared port.
pub enum BindOutcome {
    /// This process now holds the port and with it the leadership lock.
    Bound(TcpListener),
    /// Another process holds the port; it is the current leader. Expected
    /// steady state for a standby, not an error.
    Contended,
}

/// Attempt to take the shared port.
///
/// `AddrInUse` is the one outcome that means "a leader is alive" and maps
/// to [`BindOutcome::Contended`]; anything else is a real error (bad
/// permissions, exhausted fds) and propagates.
pub async fn try_bind(port: u16) -> io::Result<BindOutcome> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(BindOutcome::Bound(listener)),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Ok(BindOutcome::Contended),
        Err(e) => Err(e),
    }
}

/// Start the leader stack on a freshly won listener.
///
/// Order matters: the routing handle is swapped to the local router before
/// the HTTP surface starts serving, so no request handled by this process
/// can be forwarded back to its own port.
pub fn start_leader(
    listener: TcpListener,
    settings: &Settings,
    handle: &RouterHandle,
    shutdown: &ShutdownCoordinator,
) -> LeaderRouter {
    let leader = LeaderRouter::new();
    leader
        .registry
        .spawn_sweeper(settings.sweep_interval, settings.stale_after, shutdown);

    let state = api::AppState {
        handle: handle.clone(),
        leader: leader.clone(),
        shutdown: shutdown.clone(),
        settings: settings.clone(),
    };
    let app = api::router(state);

    handle.replace(SessionRouter::Leader(leader.clone()));

    let mut shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        if let Err(e) = serve.await {
            // The leader holds the port until process exit; losing the
            // listener mid-life is unrecoverable and must free the port
            // for a standby to take over.
            tracing::error!(error = %e, "leader HTTP server failed");
            std::process::exit(1);
        }
    });

    leader
}

/// Spawn the standby election loop.
///
/// Every `election_interval` the task attempts [`try_bind`]. Contention is
/// logged at debug level — it is the normal heartbeat of a healthy cluster.
/// On success the task promotes this process and exits; on shutdown it
/// exits without promoting.
pub fn spawn_supervisor(
    handle: RouterHandle,
    settings: Settings,
    shutdown: ShutdownCoordinator,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown_rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(settings.election_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; the boot-time bind attempt
        // already happened, so consume it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match try_bind(settings.port).await {
                        Ok(BindOutcome::Bound(listener)) => {
                            tracing::info!(port = settings.port, "acquired shared port, promoting to leader");
                            start_leader(listener, &settings, &handle, &shutdown);
                            return;
                        }
                        Ok(BindOutcome::Contended) => {
                            tracing::debug!(port = settings.port, "shared port held by current leader");
                        }
                        Err(e) => {
                            tracing::warn!(port = settings.port, error = %e, "bind attempt failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::debug!("election supervisor stopping");
                        return;
                    }
                }
            }
        }
    })
}
