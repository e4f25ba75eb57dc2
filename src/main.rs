use anyhow::Result;
use helicone_proxy::config::{LogFormat, Settings};
use helicone_proxy::Application;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;

    // RUST_LOG wins over logging.level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    match settings.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .init(),
    }

    info!(
        environment = %settings.application.environment,
        "Starting Helicone proxy application"
    );

    let app = Application::with_settings(settings).await?;
    app.run().await?;

    Ok(())
}
