//! Structured logging setup (§10.1). Grounded in the teacher's `main.rs`
//! tracing init — same `EnvFilter`-over-`RUST_LOG` pattern and JSON fmt
//! layer — minus the database-backed sink (`create_database_layer`), since
//! this design has no persistent catalogue to log into.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global `tracing` subscriber. Call once, before anything logs.
pub fn init() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "viewra_transcoder=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
