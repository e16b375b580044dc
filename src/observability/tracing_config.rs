//! Tracing subscriber setup
//!
//! Pretty, file-annotated logs for local work; JSON lines with span
//! context once deployed.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::Settings;

/// Directives used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "pangeo_forge_orchestrator=debug,tower_http=debug,sqlx=warn";

/// Tracing configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    /// Fallback level for targets the default filter does not name
    pub log_level: Level,
    pub json_logs: bool,
    /// Log span enter/exit, useful to time background tasks
    pub log_span_events: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "pangeo-forge-orchestrator".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            log_level: Level::INFO,
            json_logs: false,
            log_span_events: false,
        }
    }
}

impl TracingConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let deployed = settings.server.environment.is_deployed();
        Self {
            service_name: settings.tracing.service_name.clone(),
            environment: settings.server.environment.to_string(),
            json_logs: settings.tracing.json_logs,
            log_span_events: deployed,
            ..Self::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{},{}", self.log_level, DEFAULT_FILTER)))
    }
}

/// Install the global subscriber
pub fn init_tracing(config: &TracingConfig) {
    let span_events = if config.log_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_logs {
        Box::new(
            fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_current_span(true)
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .with_filter(config.filter()),
        )
    } else {
        Box::new(
            fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(config.filter()),
        )
    };

    Registry::default().with(fmt_layer).init();

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = %config.environment,
        "Tracing initialized"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert_eq!(config.service_name, "pangeo-forge-orchestrator");
        assert!(!config.json_logs);
        assert!(!config.log_span_events);
    }

    #[test]
    fn test_span_events_follow_environment() {
        let mut settings = Settings::load_for_testing();
        assert!(!TracingConfig::from_settings(&settings).log_span_events);

        settings.server.environment = Environment::Production;
        settings.tracing.json_logs = true;
        let config = TracingConfig::from_settings(&settings);
        assert!(config.log_span_events);
        assert!(config.json_logs);
        assert_eq!(config.environment, "production");
    }
}
