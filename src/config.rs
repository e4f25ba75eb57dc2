use crate::proxy::types::{ProxyConfig, RequestSizeLimit, UpstreamBaseUrl};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub upstream: UpstreamSettings,
    pub proxy: ProxySettings,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub environment: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamSettings {
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Used when a request sends `Helicone-FF-Increase-Timeout: true`
    pub extended_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    pub max_request_size: usize,
    /// How long the log path waits for a response body, and how long
    /// shutdown waits for pending logs
    pub log_body_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    pub max_entries: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSettings {
    pub max_counters: u64,
    pub cents_per_1k_tokens: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSinkKind {
    /// Records are emitted as `tracing` events
    Tracing,
    /// Records are appended to `logging.sink_path` as JSON lines
    File,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
    pub sink: LogSinkKind,
    pub sink_path: PathBuf,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("application.host", "0.0.0.0")?
            .set_default("application.port", 8787)?
            .set_default("application.environment", environment.clone())?
            .set_default("upstream.base_url", "https://api.openai.com")?
            .set_default("upstream.request_timeout_secs", 600)?
            .set_default("upstream.extended_timeout_secs", 1800)?
            .set_default("proxy.max_request_size", 10 * 1024 * 1024)?
            .set_default("proxy.log_body_timeout_secs", 900)?
            .set_default("cache.max_entries", 10_000)?
            .set_default("rate_limit.max_counters", 100_000)?
            .set_default("rate_limit.cents_per_1k_tokens", 0.2)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("logging.sink", "tracing")?
            .set_default("logging.sink_path", "helicone-requests.jsonl")?
            // Add configuration file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix
            .add_source(Environment::with_prefix("HELICONE_PROXY").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.application.host, self.application.port)
    }

    /// Validated proxy configuration
    pub fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        let upstream_base_url = UpstreamBaseUrl::try_new(self.upstream.base_url.clone())
            .map_err(|e| {
                ConfigError::Message(format!(
                    "upstream.base_url `{}` is invalid: {e}",
                    self.upstream.base_url
                ))
            })?;
        let max_request_size = RequestSizeLimit::try_new(self.proxy.max_request_size)
            .map_err(|e| ConfigError::Message(format!("proxy.max_request_size is invalid: {e}")))?;
        if !(self.rate_limit.cents_per_1k_tokens.is_finite()
            && self.rate_limit.cents_per_1k_tokens >= 0.0)
        {
            return Err(ConfigError::Message(
                "rate_limit.cents_per_1k_tokens must be a non-negative number".to_string(),
            ));
        }

        Ok(ProxyConfig {
            upstream_base_url,
            max_request_size,
            request_timeout: Duration::from_secs(self.upstream.request_timeout_secs),
            extended_timeout: Duration::from_secs(self.upstream.extended_timeout_secs),
            log_body_timeout: Duration::from_secs(self.proxy.log_body_timeout_secs),
            cents_per_1k_tokens: self.rate_limit.cents_per_1k_tokens,
        })
    }
}
