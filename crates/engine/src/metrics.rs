use std::time::Duration;

use jobs_core::models::{RunStatus, TriggerSource};
use metrics::{counter, histogram};

pub(crate) fn record_run_started(trigger: TriggerSource) {
    counter!("jobs_runs_started_total", "trigger" => trigger.as_str()).increment(1);
}

pub(crate) fn record_run_finished(status: RunStatus, elapsed: Duration) {
    counter!("jobs_runs_finished_total", "status" => status.to_string()).increment(1);
    histogram!("jobs_run_duration_seconds").record(elapsed.as_secs_f64());
}

pub(crate) fn record_lock_conflict() {
    counter!("jobs_lock_conflicts_total").increment(1);
}

pub(crate) fn record_cron_skipped(reason: &'static str) {
    counter!("jobs_cron_skipped_total", "reason" => reason).increment(1);
}

pub(crate) fn record_stream_event_dropped() {
    counter!("jobs_stream_events_dropped_total").increment(1);
}
