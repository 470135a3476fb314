use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    if PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    describe();
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

fn describe() {
    describe_counter!("grading_jobs_total", "Essay grading attempts by outcome");
    describe_counter!("essays_ingested_total", "Essays admitted by ingestion");
    describe_counter!("essays_skipped_total", "Upload entries skipped by ingestion");
    describe_counter!("retention_purged_total", "Essays whose content was purged");
    describe_counter!("stale_claims_recovered_total", "Abandoned grading claims recovered");
    describe_counter!("http_requests_total", "HTTP responses by status");
    describe_histogram!("grading_duration_seconds", Unit::Seconds, "Claim to result latency");
    describe_histogram!(
        "http_request_duration_seconds",
        Unit::Seconds,
        "HTTP request latency by status"
    );
}
