//! Log and Span Output
//!
//! Every run writes formatted events to stderr. Spans are additionally
//! shipped to an OTLP collector over gRPC unless export is switched off or
//! the exporter cannot be built.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: extra filter directives, merged with [`DEFAULT_DIRECTIVES`]
//! - `OTEL_ENABLED`: `false` keeps spans local (default: export)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: collector address (default: http://localhost:4318)
//! - `OTEL_SERVICE_NAME`: `service.name` resource attribute (default: bybit-public-stream)
//! - `NO_COLOR`: any non-empty value disables ANSI colours
//!
//! # Usage
//!
//! ```ignore
//! use bybit_public_stream::infrastructure::telemetry;
//!
//! let _guard = telemetry::init();
//! tracing::info!(symbol = "BTCUSDT", "Subscribed");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// `service.name` reported with exported spans.
const DEFAULT_SERVICE_NAME: &str = "bybit-public-stream";

/// Collector address used when none is configured.
const DEFAULT_COLLECTOR_ENDPOINT: &str = "http://localhost:4318";

/// Levels applied on top of `RUST_LOG`.
pub const DEFAULT_DIRECTIVES: [&str; 3] = [
    "bybit_public_stream=info",
    "tokio_tungstenite=warn",
    "tungstenite=warn",
];

// =============================================================================
// Guard
// =============================================================================

/// Flushes and stops span export on drop. Hold it until `main` returns.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans are being exported to a collector.
    #[must_use]
    pub const fn is_exporting(&self) -> bool {
        self.tracer_provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(provider) = self.tracer_provider.take() else {
            return;
        };
        if let Err(e) = provider.shutdown() {
            eprintln!("Span exporter did not shut down cleanly: {e}");
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Output settings for [`init_with_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Ship spans to the collector.
    pub export_spans: bool,
    /// OTLP collector address.
    pub collector_endpoint: String,
    /// `service.name` resource attribute.
    pub service_name: String,
    /// Colour console output.
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            export_spans: true,
            collector_endpoint: DEFAULT_COLLECTOR_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Read settings from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`. Empty values count as unset.
    #[must_use]
    pub fn from_lookup<L>(lookup: L) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            export_spans: get("OTEL_ENABLED")
                .is_none_or(|v| !v.trim().eq_ignore_ascii_case("false")),
            collector_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or(defaults.collector_endpoint),
            service_name: get("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            ansi: get("NO_COLOR").is_none(),
        }
    }
}

// =============================================================================
// Initialization
// =============================================================================

/// Install the global subscriber using [`TelemetryConfig::from_env`].
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(TelemetryConfig::from_env())
}

/// Install the global subscriber.
///
/// A second call leaves the first subscriber in place. An exporter that
/// cannot be built leaves console output in place.
#[must_use]
pub fn init_with_config(config: TelemetryConfig) -> TelemetryGuard {
    let tracer_provider = if config.export_spans {
        otlp_provider(&config)
    } else {
        None
    };

    let span_layer = tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter())
        .with(console_layer)
        .with(span_layer)
        .try_init()
    {
        eprintln!("Tracing subscriber already installed: {e}");
    }

    TelemetryGuard { tracer_provider }
}

/// `RUST_LOG` merged with [`DEFAULT_DIRECTIVES`]. The defaults win for
/// targets both name.
fn env_filter() -> EnvFilter {
    DEFAULT_DIRECTIVES
        .iter()
        .filter_map(|raw| raw.parse::<Directive>().ok())
        .fold(EnvFilter::from_default_env(), EnvFilter::add_directive)
}

/// Batch span exporter over gRPC, tagged with the service name.
fn otlp_provider(config: &TelemetryConfig) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.collector_endpoint)
        .build()
        .inspect_err(|e| eprintln!("OTLP exporter unavailable, tracing to console only: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build(),
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> TelemetryConfig {
        TelemetryConfig::from_lookup(|key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        })
    }

    #[test]
    fn unset_environment_matches_default() {
        assert_eq!(config_from(&[]), TelemetryConfig::default());
        assert_eq!(config_from(&[]).service_name, "bybit-public-stream");
    }

    #[test]
    fn overrides_are_read() {
        let config = config_from(&[
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4317"),
            ("OTEL_SERVICE_NAME", "ticker-recorder"),
            ("NO_COLOR", "1"),
        ]);

        assert!(config.export_spans);
        assert_eq!(config.collector_endpoint, "http://collector:4317");
        assert_eq!(config.service_name, "ticker-recorder");
        assert!(!config.ansi);
    }

    #[test_case("false", false ; "lowercase false")]
    #[test_case(" FALSE ", false ; "padded uppercase false")]
    #[test_case("true", true ; "true")]
    #[test_case("0", true ; "anything else exports")]
    fn export_switch(raw: &str, expected: bool) {
        assert_eq!(config_from(&[("OTEL_ENABLED", raw)]).export_spans, expected);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = config_from(&[
            ("OTEL_ENABLED", " "),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", ""),
            ("OTEL_SERVICE_NAME", ""),
            ("NO_COLOR", ""),
        ]);
        assert_eq!(config, TelemetryConfig::default());
    }

    #[test]
    fn default_directives_parse() {
        for raw in DEFAULT_DIRECTIVES {
            assert!(raw.parse::<Directive>().is_ok(), "{raw}");
        }
    }

    #[test]
    fn disabled_export_keeps_console_only() {
        let guard = init_with_config(TelemetryConfig {
            export_spans: false,
            ..TelemetryConfig::default()
        });
        assert!(!guard.is_exporting());
    }
}
