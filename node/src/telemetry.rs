//! Tracing setup for the wallet daemon.
//!
//! Log lines always go to stdout at the configured level. Setting `OTEL_EXPORTER_OTLP_ENDPOINT`
//! additionally ships spans over OTLP/HTTP, named by `OTEL_SERVICE_NAME` and sampled at
//! `OTEL_SAMPLING_RATE` (0.0 to 1.0).

use anyhow::{Context, Result};
use opentelemetry::{trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{Sampler, SdkTracerProvider},
    Resource,
};
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

pub const DEFAULT_SERVICE_NAME: &str = "spinwallet-node";

/// Where and how to export spans, read from the `OTEL_*` environment.
#[derive(Clone, Debug, PartialEq)]
pub struct OtlpSettings {
    pub endpoint: String,
    pub service_name: String,
    pub sampling_rate: f64,
}

impl OtlpSettings {
    pub fn from_env() -> Option<Self> {
        Self::from_values(
            std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            std::env::var("OTEL_SERVICE_NAME").ok(),
            std::env::var("OTEL_SAMPLING_RATE").ok(),
        )
    }

    /// `None` when no endpoint is set. A missing or unparsable rate samples everything.
    fn from_values(
        endpoint: Option<String>,
        service_name: Option<String>,
        sampling_rate: Option<String>,
    ) -> Option<Self> {
        let endpoint = non_blank(endpoint)?;
        let service_name =
            non_blank(service_name).unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
        let sampling_rate = sampling_rate
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|rate| rate.is_finite())
            .map_or(1.0, |rate| rate.clamp(0.0, 1.0));
        Some(Self {
            endpoint,
            service_name,
            sampling_rate,
        })
    }

    fn tracer_provider(&self) -> Result<SdkTracerProvider> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(self.endpoint.clone())
            .build()
            .context("failed to build OTLP exporter")?;
        let resource = Resource::builder_empty()
            .with_attributes([KeyValue::new("service.name", self.service_name.clone())])
            .build();
        Ok(SdkTracerProvider::builder()
            .with_sampler(Sampler::TraceIdRatioBased(self.sampling_rate))
            .with_resource(resource)
            .with_batch_exporter(exporter)
            .build())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Install the global subscriber. Call once, before any other tracing.
pub fn init_tracing(level: Level) -> Result<()> {
    let stdout = tracing_subscriber::fmt::layer().with_filter(LevelFilter::from_level(level));
    let Some(otlp) = OtlpSettings::from_env() else {
        tracing_subscriber::registry().with(stdout).init();
        return Ok(());
    };

    let provider = otlp.tracer_provider()?;
    let tracer = provider.tracer(DEFAULT_SERVICE_NAME);
    opentelemetry::global::set_tracer_provider(provider);
    tracing_subscriber::registry()
        .with(stdout)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();
    tracing::info!(
        endpoint = %otlp.endpoint,
        service = %otlp.service_name,
        rate = otlp.sampling_rate,
        "exporting spans over OTLP"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(value: &str) -> Option<String> {
        Some(value.to_string())
    }

    #[test]
    fn test_no_endpoint_disables_export() {
        assert_eq!(OtlpSettings::from_values(None, some("svc"), some("0.5")), None);
        assert_eq!(OtlpSettings::from_values(some("   "), None, None), None);
    }

    #[test]
    fn test_defaults_apply_when_unset() {
        let settings =
            OtlpSettings::from_values(some(" http://collector:4318 "), some(""), None).unwrap();
        assert_eq!(settings.endpoint, "http://collector:4318");
        assert_eq!(settings.service_name, DEFAULT_SERVICE_NAME);
        assert_eq!(settings.sampling_rate, 1.0);
    }

    #[test]
    fn test_sampling_rate_is_clamped() {
        let rate = |raw: &str| {
            OtlpSettings::from_values(some("http://c"), None, some(raw))
                .unwrap()
                .sampling_rate
        };
        assert_eq!(rate("0.25"), 0.25);
        assert_eq!(rate("7"), 1.0);
        assert_eq!(rate("-1"), 0.0);
        assert_eq!(rate("NaN"), 1.0);
        assert_eq!(rate("often"), 1.0);
    }
}
