use clap::Parser;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use tabrelay::config::{self, Settings};
use tabrelay::election::{self, BindOutcome};
use tabrelay::proxy::RemoteProxy;
use tabrelay::routing::{RouterHandle, SessionRouter};
use tabrelay::shutdown::ShutdownCoordinator;

#[derive(Parser, Debug)]
#[command(name = "tabrelay", version, about = "Shared browser-session relay")]
struct Cli {
    /// Shared port all cooperating processes compete for. Doubles as the
    /// leadership lock, so every process must use the same value.
    #[arg(long, env = "TABRELAY_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// How often a standby retries binding the shared port (ms).
    #[arg(long, env = "TABRELAY_ELECTION_INTERVAL_MS", default_value_t = 5000)]
    election_interval_ms: u64,

    /// Evict sessions with no inbound message for this long (seconds).
    #[arg(long, env = "TABRELAY_STALE_AFTER_SECS", default_value_t = 300)]
    stale_after_secs: u64,

    /// Standby connection-cache freshness window (ms).
    #[arg(long, env = "TABRELAY_CACHE_TTL_MS", default_value_t = 5000)]
    cache_ttl_ms: u64,

    /// Default command deadline when the request does not supply one (ms).
    #[arg(long, env = "TABRELAY_COMMAND_TIMEOUT_MS", default_value_t = 30_000)]
    command_timeout_ms: u64,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            port: self.port,
            election_interval: Duration::from_millis(self.election_interval_ms),
            stale_after: Duration::from_secs(self.stale_after_secs),
            sweep_interval: config::DEFAULT_SWEEP_INTERVAL,
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tabrelay=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let settings = cli.settings();
    let shutdown = ShutdownCoordinator::new();

    // Every process starts as a standby; promotion swaps the handle in place.
    let handle = RouterHandle::new(SessionRouter::Standby(RemoteProxy::new(&settings)));

    match election::try_bind(settings.port).await {
        Ok(BindOutcome::Bound(listener)) => {
            tracing::info!(port = settings.port, "bound shared port, starting as leader");
            election::start_leader(listener, &settings, &handle, &shutdown);
        }
        Ok(BindOutcome::Contended) => {
            tracing::info!(
                port = settings.port,
                "shared port held by another process, running as standby"
            );
            election::spawn_supervisor(handle.clone(), settings.clone(), shutdown.clone());
        }
        Err(e) => {
            anyhow::bail!("failed to probe shared port {}: {e}", settings.port);
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!(
        active_connections = shutdown.active_connections(),
        "shutdown signal received"
    );
    shutdown.shutdown();

    // Give writer tasks a moment to flush close frames.
    tokio::time::sleep(Duration::from_millis(100)).await;

    if let SessionRouter::Leader(leader) = &*handle.current() {
        leader.registry.clear();
        tracing::info!("leader shut down");
    }
    Ok(())
}
