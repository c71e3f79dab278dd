use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

pub const TIMING_TARGET: &str = "server.timing";

#[derive(Debug)]
pub struct PollTimer {
    task_key: String,
    user_id: Option<String>,
    sub_task_count: usize,
    started_at: DateTime<Utc>,
    started_perf: Instant,
    status: String,
    detail: Option<String>,
    completed: bool,
}

impl PollTimer {
    pub fn new(task_key: &str, user_id: Option<&str>, sub_task_count: usize) -> Self {
        PollTimer {
            task_key: task_key.to_string(),
            user_id: user_id.map(str::to_string),
            sub_task_count,
            started_at: Utc::now(),
            started_perf: Instant::now(),
            status: "processing".to_string(),
            detail: None,
            completed: false,
        }
    }

    pub fn log_received(&self) {
        info!(
            target: TIMING_TARGET,
            "event=poll_received task_key={} user_id={:?} sub_tasks={} received_at={}",
            self.task_key,
            self.user_id,
            self.sub_task_count,
            self.started_at.to_rfc3339()
        );
    }

    pub fn mark_status(&mut self, status: &str, detail: Option<String>) {
        self.status = status.to_string();
        self.detail = detail;
    }

    pub fn log_completed(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        let completed_at = Utc::now();
        let duration = self.started_perf.elapsed().as_secs_f64();
        info!(
            target: TIMING_TARGET,
            "event=poll_completed task_key={} user_id={:?} started_at={} responded_at={} duration_s={:.3} status={} detail={}",
            self.task_key,
            self.user_id,
            self.started_at.to_rfc3339(),
            completed_at.to_rfc3339(),
            duration,
            self.status,
            self.detail.clone().unwrap_or_default()
        );
    }
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        if !self.completed {
            self.mark_status("aborted", None);
            self.log_completed();
        }
    }
}

pub fn start_poll_timer(task_key: &str, user_id: Option<&str>, sub_task_count: usize) -> PollTimer {
    let timer = PollTimer::new(task_key, user_id, sub_task_count);
    timer.log_received();
    timer
}

pub fn complete_poll_timer(timer: &mut PollTimer, status: &str, detail: Option<String>) {
    timer.mark_status(status, detail);
    timer.log_completed();
}

pub async fn log_vendor_timing<T, F, Fut>(
    provider: &str,
    operation: &str,
    metadata: Option<JsonValue>,
    call: F,
) -> Result<T, anyhow::Error>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let started_at = Utc::now();
    let started_perf = Instant::now();
    let metadata_text = metadata
        .as_ref()
        .map(|value| value.to_string())
        .unwrap_or_else(|| "{}".to_string());
    info!(
        target: TIMING_TARGET,
        "event=vendor_request provider={} operation={} started_at={} metadata={}",
        provider,
        operation,
        started_at.to_rfc3339(),
        metadata_text
    );

    let result = call().await;
    let status = if result.is_err() { "error" } else { "success" };

    let completed_at = Utc::now();
    let duration = started_perf.elapsed().as_secs_f64();
    info!(
        target: TIMING_TARGET,
        "event=vendor_response provider={} operation={} completed_at={} duration_s={:.3} status={} metadata={}",
        provider,
        operation,
        completed_at.to_rfc3339(),
        duration,
        status,
        metadata_text
    );

    result
}
