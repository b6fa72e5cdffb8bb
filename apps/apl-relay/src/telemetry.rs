//! Structured logging, optional span export and the Prometheus recorder.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "apl-relay";
const OTEL_STDOUT_ENV: &str = "APL_RELAY_OTEL_STDOUT";

/// Gatekeeper decisions (counter, labels: outcome).
pub const UPGRADES_TOTAL: &str = "apl_relay_upgrades_total";
/// Workers that could not be launched (counter).
pub const SPAWN_FAILURES_TOTAL: &str = "apl_relay_spawn_failures_total";
/// Sessions with a live worker (gauge).
pub const SESSIONS_ACTIVE: &str = "apl_relay_sessions_active";
/// Text frames accepted from peers (counter).
pub const FRAMES_IN_TOTAL: &str = "apl_relay_frames_in_total";
/// Output frames delivered to peers (counter).
pub const FRAMES_OUT_TOTAL: &str = "apl_relay_frames_out_total";
/// Sessions that reached `Terminated` (counter, labels: reason).
pub const SESSIONS_CLOSED_TOTAL: &str = "apl_relay_sessions_closed_total";
/// Session lifetime in milliseconds (histogram).
pub const SESSION_DURATION_MS: &str = "apl_relay_session_duration_ms";
/// Workers that had to be killed (counter).
pub const TEARDOWN_ESCALATIONS_TOTAL: &str = "apl_relay_teardown_escalations_total";

/// Keeps the tracer provider alive; dropping it flushes pending spans.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(stdout_tracer_provider);
        let span_export = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(span_export)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("span export to stdout enabled via {OTEL_STDOUT_ENV}");
        }
        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let Some(provider) = self.tracer_provider.take() else {
            return;
        };
        if let Err(err) = provider.shutdown() {
            warn!(error = %err, "failed to flush spans on shutdown");
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes([KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn describe_metrics() {
    describe_counter!(UPGRADES_TOTAL, "Requests seen by the gatekeeper, by outcome");
    describe_counter!(SPAWN_FAILURES_TOTAL, "Workers that could not be launched");
    describe_gauge!(SESSIONS_ACTIVE, "Sessions with a live worker");
    describe_counter!(FRAMES_IN_TOTAL, "Text frames accepted from peers");
    describe_counter!(FRAMES_OUT_TOTAL, "Output frames delivered to peers");
    describe_counter!(
        SESSIONS_CLOSED_TOTAL,
        "Sessions that reached Terminated, by close reason"
    );
    describe_histogram!(
        SESSION_DURATION_MS,
        Unit::Milliseconds,
        "Session lifetime from launch to termination"
    );
    describe_counter!(TEARDOWN_ESCALATIONS_TOTAL, "Workers that needed SIGKILL");
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key).is_ok_and(|val| {
        matches!(
            val.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::counter;

    #[test_timeout::timeout]
    fn relay_metrics_reach_the_prometheus_exporter() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            describe_metrics();
            counter!(UPGRADES_TOTAL, "outcome" => "accepted").increment(1);
        });

        let rendered = handle.render();
        assert!(
            rendered.contains("apl_relay_upgrades_total{outcome=\"accepted\"} 1"),
            "{rendered}"
        );
        assert!(rendered.contains("# HELP apl_relay_upgrades_total"), "{rendered}");
    }

    #[test_timeout::timeout]
    fn metric_names_share_the_relay_prefix() {
        for name in [
            UPGRADES_TOTAL,
            SPAWN_FAILURES_TOTAL,
            SESSIONS_ACTIVE,
            FRAMES_IN_TOTAL,
            FRAMES_OUT_TOTAL,
            SESSIONS_CLOSED_TOTAL,
            SESSION_DURATION_MS,
            TEARDOWN_ESCALATIONS_TOTAL,
        ] {
            assert!(name.starts_with("apl_relay_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name}"
            );
        }
    }
}
