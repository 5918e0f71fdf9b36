//! Telemetry and structured logging for conversion jobs.

use crate::job::{Job, JobStatus};
use crate::queue::QueueStats;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};

const TRACER_NAME: &str = "weaver";

/// Jobs slower than this are logged as warnings.
const SLOW_JOB_THRESHOLD_MS: i64 = 30_000;

/// Records telemetry for a finished job.
///
/// Emits one OpenTelemetry span per job with its id, format, status,
/// durations and error, plus a structured log line.
pub fn record_job_telemetry(job: &Job) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("conversion_job");

    span.set_attribute(KeyValue::new("job_id", job.job_id.clone()));
    span.set_attribute(KeyValue::new("format", job.source().format().to_string()));
    span.set_attribute(KeyValue::new("status", job.status.to_string()));
    span.set_attribute(KeyValue::new("aggressive", job.source().aggressive()));

    if let Some(wait_ms) = job.queue_wait_ms() {
        span.set_attribute(KeyValue::new("queue_wait_ms", wait_ms));
    }

    if let Some(duration_ms) = job.processing_duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            job_id = %job.job_id,
            duration_ms = duration_ms,
            status = %job.status,
            "Conversion job finished"
        );

        if duration_ms > SLOW_JOB_THRESHOLD_MS {
            warn!(
                job_id = %job.job_id,
                duration_ms = duration_ms,
                "Conversion exceeded performance threshold ({}ms)",
                SLOW_JOB_THRESHOLD_MS
            );
        }
    }

    if matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
        if let Some(ref error) = job.error {
            span.set_attribute(KeyValue::new("error", error.clone()));
        }
    }

    span.end();
}

/// Records a heartbeat with the current queue counters.
pub fn record_worker_heartbeat(stats: &QueueStats) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("queued", stats.queued as i64));
    span.set_attribute(KeyValue::new("active", stats.active as i64));
    span.set_attribute(KeyValue::new("completed", stats.completed as i64));
    span.set_attribute(KeyValue::new("failed", stats.failed as i64));
    span.end();

    info!(
        queued = stats.queued,
        active = stats.active,
        completed = stats.completed,
        failed = stats.failed,
        rejected = stats.rejected,
        "Worker heartbeat"
    );
}

/// Initializes OpenTelemetry with an OTLP exporter.
///
/// Reads configuration from environment variables:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: weaver)
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| TRACER_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}

/// Flushes pending spans before exit.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConversionError;
    use crate::source::{ConversionSource, Format};
    use std::sync::Arc;
    use tokio::sync::Semaphore;
    use tokio_util::sync::CancellationToken;

    fn job() -> Job {
        let permit = Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap();
        let (job, _rx) = Job::new(
            ConversionSource::new("http://example.com", Format::Pdf),
            CancellationToken::new(),
            permit,
        );
        job
    }

    #[test]
    fn test_record_job_telemetry() {
        // No provider installed: spans go to the no-op tracer.
        let mut job = job();
        job.start_processing();
        job.mark_complete();
        record_job_telemetry(&job);
    }

    #[test]
    fn test_record_failed_job() {
        let mut job = job();
        job.start_processing();
        job.settle(&Err(ConversionError::QueueFull));
        record_job_telemetry(&job);
    }

    #[test]
    fn test_record_heartbeat() {
        record_worker_heartbeat(&QueueStats {
            max_workers: 2,
            max_queue: 4,
            queued: 1,
            active: 2,
            peak_active: 2,
            completed: 10,
            failed: 0,
            rejected: 3,
        });
    }
}
