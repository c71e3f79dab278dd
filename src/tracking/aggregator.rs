use futures::future::join_all;
use tracing::debug;

use crate::providers::{SourceSelector, SubTaskStatus};

pub const DEFAULT_FAILURE_REASON: &str = "Image generation failed";

/// Overall state of a polled batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Succeeded {
        images: Vec<String>,
        partial: bool,
    },
    Failed {
        reason: String,
    },
    Processing {
        progress: u8,
        completed_count: usize,
        total_count: usize,
    },
}

pub fn parse_task_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

/// Identifier of the generation task row that tracks a batch.
pub fn batch_key(task_ids: &[String]) -> String {
    task_ids.join(",")
}

/// Fetches every sub-task concurrently. The result keeps request order.
pub async fn poll_batch(selector: &SourceSelector, task_ids: &[String]) -> Vec<SubTaskStatus> {
    let fetches = task_ids.iter().map(|task_id| async move {
        match selector.source_for(task_id) {
            Some(source) => source.fetch_status(task_id).await,
            None => SubTaskStatus::failed(task_id, "No status source is configured for this task"),
        }
    });
    let statuses = join_all(fetches).await;
    for status in statuses.iter().filter(|status| status.state.is_failed()) {
        debug!(
            "Sub-task {} failed: {}",
            status.task_id,
            status.reason.as_deref().unwrap_or("no reason given")
        );
    }
    statuses
}

fn collect_images(statuses: &[SubTaskStatus]) -> Vec<String> {
    statuses
        .iter()
        .flat_map(|status| status.images.iter().cloned())
        .collect()
}

fn average_progress(statuses: &[SubTaskStatus]) -> u8 {
    if statuses.is_empty() {
        return 0;
    }
    let total: f64 = statuses
        .iter()
        .map(|status| status.progress_percent.unwrap_or(0.0).clamp(0.0, 100.0))
        .sum();
    (total / statuses.len() as f64).round() as u8
}

fn failure_reason(statuses: &[SubTaskStatus]) -> String {
    statuses
        .iter()
        .filter(|status| status.state.is_failed())
        .filter_map(|status| status.reason.as_deref())
        .map(str::trim)
        .find(|reason| !reason.is_empty())
        .unwrap_or(DEFAULT_FAILURE_REASON)
        .to_string()
}

pub fn classify(statuses: &[SubTaskStatus]) -> BatchOutcome {
    let total_count = statuses.len();
    let completed_count = statuses
        .iter()
        .filter(|status| status.state.is_succeeded())
        .count();

    if total_count > 0 && completed_count == total_count {
        return BatchOutcome::Succeeded {
            images: collect_images(statuses),
            partial: false,
        };
    }

    let any_failed = statuses.iter().any(|status| status.state.is_failed());
    let any_in_flight = statuses.iter().any(|status| status.state.is_in_flight());

    if any_failed && !any_in_flight {
        let images = collect_images(statuses);
        if images.is_empty() {
            return BatchOutcome::Failed {
                reason: failure_reason(statuses),
            };
        }
        // Show whatever rendered instead of failing the whole batch.
        return BatchOutcome::Succeeded {
            images,
            partial: true,
        };
    }

    BatchOutcome::Processing {
        progress: average_progress(statuses),
        completed_count,
        total_count,
    }
}
