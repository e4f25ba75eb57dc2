use crate::config::{LogSinkKind, Settings};
use crate::infrastructure::{
    InMemoryCounterStore, InMemoryResponseStore, JsonLinesLogSink, LogSink, TracingLogSink,
};
use crate::proxy::{AuthConfig, Collaborators, ProxyService, ReqwestUpstreamClient};
use crate::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

/// Main application struct that coordinates all components
pub struct Application {
    settings: Settings,
    service: ProxyService,
}

impl Application {
    #[instrument]
    pub async fn new() -> Result<Self> {
        let settings = Settings::new()?;
        Self::with_settings(settings).await
    }

    pub async fn with_settings(settings: Settings) -> Result<Self> {
        let config = settings.proxy_config()?;

        let log_sink: Arc<dyn LogSink> = match settings.logging.sink {
            LogSinkKind::Tracing => Arc::new(TracingLogSink),
            LogSinkKind::File => {
                info!(path = %settings.logging.sink_path.display(), "Writing request logs to file");
                Arc::new(JsonLinesLogSink::open(&settings.logging.sink_path).await?)
            }
        };

        let collaborators = Collaborators {
            upstream: Arc::new(ReqwestUpstreamClient::new()?),
            counters: Arc::new(InMemoryCounterStore::new(settings.rate_limit.max_counters)),
            responses: Arc::new(InMemoryResponseStore::new(settings.cache.max_entries)),
            log_sink,
        };

        Ok(Self {
            service: ProxyService::new(config, collaborators),
            settings,
        })
    }

    #[instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let address = self.settings.bind_address();
        let listener = TcpListener::bind(&address).await?;
        info!(
            address = %address,
            upstream = %self.service.config().upstream_base_url,
            "Starting Helicone proxy"
        );

        let log_path = self.service.log_path().clone();
        let drain_timeout = self.service.config().log_body_timeout;
        let router = self.service.into_router(AuthConfig::default());

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!(pending = log_path.pending(), "Server stopped, draining request logs");
        if !log_path.drain(drain_timeout).await {
            warn!("Exiting with request logs still pending");
        }
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
