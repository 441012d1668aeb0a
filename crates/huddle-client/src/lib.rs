//! Session client for real-time meetings: joins a session over the
//! signaling channel, keeps one peer link per remote participant and
//! manages local camera, microphone and screen capture.

pub mod config;
pub mod events;
pub mod handle;
pub mod session;
pub mod state;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::{ClientConfig, LocalIdentity, MediaPreferences};
pub use events::{EventBus, EventFilter, SessionEvent, SessionEventKind, SubscriptionToken};
pub use handle::{spawn_session, SessionCommand, SessionHandle};
pub use session::{JoinTicket, SessionClient};
pub use state::{Lifecycle, SessionSnapshot};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("huddle_agent=info,huddle_client=debug,huddle_media=info,huddle_net=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
