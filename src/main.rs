use anyhow::Result;
use clap::Parser;
use mailweave::app;
use mailweave::cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // IMAP/SMTP credentials usually live in .env
    dotenvy::dotenv().ok();
    init_tracing();

    app::run(Cli::parse()).await
}

/// `RUST_LOG` when set; otherwise the poller's own activity at info.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mailweave=info"));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
