//! Metric names and the sync-task instrumentation wrapper.
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub const SYNC_TYPE_FULL: &str = "full_sync";
pub const SYNC_TYPE_INCR: &str = "incr_sync";
pub const SYNC_TYPE_GAP: &str = "gap_sync";

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Runs a sync task, stamping the last-attempt gauge up front, the fail
/// gauge on error and the duration histogram on success. Alerting keys off
/// "no recent success" and "fail incremented".
pub async fn sync_with_metrics<F, Fut, T, E>(sync_type: &'static str, task: F) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    metrics::gauge!("argus_engine_last_sync_timestamp", "type" => sync_type).set(now_unix() as f64);

    match task().await {
        Ok(value) => {
            metrics::histogram!("argus_engine_sync_task_duration_seconds", "type" => sync_type)
                .record(start.elapsed().as_secs_f64());
            Ok(value)
        }
        Err(err) => {
            metrics::counter!("argus_engine_sync_fail", "type" => sync_type).increment(1);
            Err(err)
        }
    }
}

/// `client_id` is empty for requests that never authenticated.
pub fn record_api_request(
    method: &str,
    path: &str,
    status: u16,
    client_id: &str,
    elapsed_seconds: f64,
) {
    metrics::counter!(
        "argus_engine_api_requests_total",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string(),
        "client_id" => client_id.to_string(),
    )
    .increment(1);
    metrics::histogram!(
        "argus_engine_api_request_duration_seconds",
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string(),
    )
    .record(elapsed_seconds);
}

pub fn record_snapshot_dump_failure() {
    metrics::counter!("argus_engine_snapshot_dump_fail").increment(1);
}

pub fn record_deletion_event(event_type: &str) {
    metrics::counter!("argus_engine_deletion_events_total", "type" => event_type.to_string())
        .increment(1);
}
