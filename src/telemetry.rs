#![allow(dead_code)]
//! Optional OpenTelemetry export (feature `otel`): spans from instrumented
//! driver/orchestrator entry points go to the stdout exporter. Enabled by
//! `ADZ_RUNNER_OTEL=1`.
use std::env;

use once_cell::sync::OnceCell;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::prelude::*;

pub struct TelemetryGuard {
    provider: Option<TracerProvider>,
}

static INIT: OnceCell<()> = OnceCell::new();

fn telemetry_enabled_env() -> bool {
    env::var("ADZ_RUNNER_OTEL").ok().as_deref() == Some("1")
}

fn build_resource() -> Resource {
    let service_name = env::var("OTEL_SERVICE_NAME")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "adz-runner".to_string());

    let mut attrs = Vec::new();
    attrs.push(KeyValue::new("service.name", service_name));
    attrs.push(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")));
    attrs.push(KeyValue::new("process.pid", std::process::id() as i64));
    if let Ok(host) = hostname::get() {
        if let Ok(s) = host.into_string() {
            attrs.push(KeyValue::new("host.name", s));
        }
    }
    Resource::new(attrs)
}

pub fn telemetry_init() -> Option<TelemetryGuard> {
    if INIT.get().is_some() || !telemetry_enabled_env() {
        return None;
    }

    let provider = TracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .with_resource(build_resource())
        .build();
    let tracer = provider.tracer("adz-runner");
    opentelemetry::global::set_tracer_provider(provider.clone());

    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
    let registry = tracing_subscriber::registry().with(otel_layer);

    if registry.try_init().is_err() {
        eprintln!("adz-runner: telemetry init skipped (global subscriber already set)");
        return None;
    }
    let _ = INIT.set(());
    Some(TelemetryGuard {
        provider: Some(provider),
    })
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            let _ = provider.shutdown();
        }
    }
}
