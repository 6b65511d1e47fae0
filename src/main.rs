//! tunegate - adaptive request orchestration for music metadata APIs.

mod cli;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // TUNEGATE_* overrides may live in .env
    let _ = dotenvy::dotenv();

    // RUST_LOG wins over -v
    let default_filter = if cli::is_verbose() {
        "tunegate=info"
    } else {
        "tunegate=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli::run().await
}
