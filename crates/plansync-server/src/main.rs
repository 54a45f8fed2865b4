use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use plansync_server::{api, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,plansync_server=debug")),
        )
        .init();

    info!("Starting plansync relay server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let http_addr = config.http_addr;
    let app_state = AppState::new(config);

    // -----------------------------------------------------------------------
    // 3. Background maintenance
    // -----------------------------------------------------------------------

    // Every 5 minutes, evict rate limit buckets idle for more than 10 and
    // empty rooms nobody has touched for a day.
    let limiter = app_state.rate_limiter.clone();
    let rooms = app_state.rooms.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let evicted = limiter.purge_stale(Duration::from_secs(600)).await;
            if evicted > 0 {
                tracing::debug!(evicted, "Purged idle rate limit buckets");
            }
            let dropped = rooms.purge_idle(Duration::from_secs(24 * 60 * 60)).await;
            if dropped > 0 {
                info!(dropped, "Purged idle empty rooms");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API until it fails or Ctrl+C
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
