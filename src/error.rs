use crate::infrastructure::LogSinkError;
use crate::proxy::retry::UpstreamError;
use thiserror::Error;

/// Application startup and serving errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Log sink error: {0}")]
    LogSink(#[from] LogSinkError),

    #[error("Upstream client error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_convert() {
        let error: Error = config::ConfigError::Message("bad".to_string()).into();
        assert_eq!(error.to_string(), "Configuration error: bad");

        let error: Error = std::io::Error::new(std::io::ErrorKind::AddrInUse, "taken").into();
        assert!(matches!(error, Error::Io(_)));
    }
}
