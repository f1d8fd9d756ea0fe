use anyhow::Result;
use pagefeed::infrastructure::{logging, shutdown};
use pagefeed::{app, config};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config()?;
    let _log_guard = logging::init_tracing(&config.logging)?;

    let shutdown = shutdown::Shutdown::new();
    shutdown::listen_for_signals(&shutdown);

    let app = app::PagefeedApp::initialize(config, shutdown).await?;
    app.run().await
}
