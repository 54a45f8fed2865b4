pub mod config;
pub mod error;
pub mod events;
pub mod http_relay;
pub mod lifecycle;
pub mod reconcile;
pub mod relay;
pub mod session;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::SyncConfig;
pub use error::SyncError;
pub use events::SyncNotification;
pub use http_relay::HttpRelay;
pub use reconcile::{Mutation, RemoteChange, Removed, TaskStore};
pub use relay::{RelayBackend, RelayChange, RelayError, RelaySession};
pub use session::{spawn_session, Snapshot, SyncHandle, SyncStats};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Calling it again is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("plansync_client=debug,plansync_net=debug,plansync_shared=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
