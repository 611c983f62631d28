//! Tracing bootstrap for binaries. Libraries never install a subscriber.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the process-global subscriber: env-filtered fmt output.
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
