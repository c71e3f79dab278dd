use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::providers::source::{SubTaskStatus, TaskStatusSource, VendorTaskState};
use crate::utils::timing::log_vendor_timing;

const TASK_RESULT_PATH: &str = "/v3/async/task-result";
const ERROR_BODY_LIMIT: usize = 300;

#[derive(Debug, Deserialize)]
struct TaskResultResponse {
    task: Option<TaskInfo>,
    #[serde(default)]
    images: Vec<TaskImage>,
}

#[derive(Debug, Deserialize)]
struct TaskInfo {
    status: Option<String>,
    progress_percent: Option<f64>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskImage {
    image_url: Option<String>,
}

fn into_sub_task(task_id: &str, payload: TaskResultResponse) -> SubTaskStatus {
    let (state, progress_percent, reason) = match payload.task {
        Some(task) => (
            task.status
                .as_deref()
                .map(VendorTaskState::parse)
                .unwrap_or(VendorTaskState::Queued),
            task.progress_percent,
            task.reason.filter(|reason| !reason.trim().is_empty()),
        ),
        None => (VendorTaskState::Queued, None, None),
    };

    let images = payload
        .images
        .into_iter()
        .filter_map(|image| image.image_url)
        .filter(|url| !url.trim().is_empty())
        .collect();

    SubTaskStatus {
        task_id: task_id.to_string(),
        state,
        progress_percent,
        images,
        reason,
    }
}

fn truncate_body(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() > ERROR_BODY_LIMIT {
        let truncated: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        format!("{truncated}...")
    } else {
        body.to_string()
    }
}

/// Reads task results from the vendor's async task API.
#[derive(Debug, Clone)]
pub struct HttpVendorSource {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpVendorSource {
    pub fn new(client: Client, base_url: &str, api_key: &str) -> Self {
        HttpVendorSource {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
        }
    }

    async fn request_task_result(&self, task_id: &str) -> Result<SubTaskStatus> {
        let url = format!("{}{}", self.base_url, TASK_RESULT_PATH);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("task_id", task_id)])
            .send()
            .await
            .map_err(|err| anyhow!("Task result request failed: {err}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = truncate_body(&body);
            return Err(if body.is_empty() {
                anyhow!("HTTP {status}")
            } else {
                anyhow!("HTTP {status}: {body}")
            });
        }

        let payload: TaskResultResponse = response
            .json()
            .await
            .map_err(|err| anyhow!("Invalid task result response: {err}"))?;

        Ok(into_sub_task(task_id, payload))
    }
}

#[async_trait]
impl TaskStatusSource for HttpVendorSource {
    fn name(&self) -> &'static str {
        "novita"
    }

    async fn fetch_status(&self, task_id: &str) -> SubTaskStatus {
        let result = log_vendor_timing(
            self.name(),
            "task_result",
            Some(json!({ "task_id": task_id })),
            || self.request_task_result(task_id),
        )
        .await;

        match result {
            Ok(status) => {
                debug!(
                    "Task {} reported {:?} at {:?}%",
                    task_id, status.state, status.progress_percent
                );
                status
            }
            Err(err) => {
                warn!("Treating task {task_id} as failed: {err}");
                SubTaskStatus::failed(task_id, err.to_string())
            }
        }
    }
}
