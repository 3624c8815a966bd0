//! Tracing initialization shared by all SPQR binaries

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over the passed level; `JSON_LOGS=true` switches to
/// JSON output for production log shippers.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let json_logs = std::env::var("JSON_LOGS")
        .map(|v| v == "true")
        .unwrap_or(false);

    let subscriber = tracing_subscriber::registry().with(filter);

    if json_logs {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }
}
