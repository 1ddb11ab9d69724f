// Telemetry
//
// Structured logging for the worker and starter binaries: a
// tracing-subscriber registry with an EnvFilter and a fmt layer that
// writes either human-readable text or JSON lines.

use std::str::FromStr;

use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter, Layer,
};

/// Output format of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to startup logs
    pub service_name: String,
    /// Log filter (e.g., "info", "debug", "benchflow_core=debug")
    pub log_filter: Option<String>,
    pub format: LogFormat,
    /// Include the event target (module path) in each line
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "benchflow".to_string(),
            log_filter: None,
            format: LogFormat::Text,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `LOG_FORMAT`: `text` (default) or `json`
    pub fn from_env(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            format: std::env::var("LOG_FORMAT")
                .ok()
                .and_then(|f| f.parse().ok())
                .unwrap_or_default(),
            with_target: true,
        }
    }

    /// Override the filter, e.g. from a `--log-level` flag
    pub fn with_log_filter(mut self, filter: Option<String>) -> Self {
        if filter.is_some() {
            self.log_filter = filter;
        }
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Install the global subscriber
///
/// Fails if a global subscriber is already set.
///
/// # Example
///
/// ```ignore
/// use benchflow_core::telemetry::{init_telemetry, TelemetryConfig};
///
/// let config = TelemetryConfig::from_env("benchflow-worker");
/// init_telemetry(&config)?;
/// ```
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TryInitError> {
    let layer = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(config.with_target)
            .with_filter(config.env_filter())
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_filter(config.env_filter())
            .boxed(),
    };

    tracing_subscriber::registry().with(layer).try_init()?;

    tracing::debug!(service = %config.service_name, format = ?config.format, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_flag_overrides_filter() {
        let config = TelemetryConfig::default()
            .with_log_filter(Some("debug".into()))
            .with_log_filter(None);
        assert_eq!(config.log_filter.as_deref(), Some("debug"));
    }

    #[test]
    fn test_invalid_filter_falls_back_to_info() {
        let config = TelemetryConfig {
            log_filter: Some("benchflow=loudest".into()),
            ..TelemetryConfig::default()
        };
        assert_eq!(config.env_filter().to_string(), "info");
    }
}
