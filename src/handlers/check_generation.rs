use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::providers::{DatabaseBackedSource, HttpVendorSource, SourceSelector};
use crate::state::AppState;
use crate::tracking::aggregator::{batch_key, classify, parse_task_ids, poll_batch, BatchOutcome};
use crate::tracking::settlement::{record_progress, settle_failure, settle_success, AutoSave};
use crate::utils::timing::{complete_poll_timer, start_poll_timer};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckGenerationQuery {
    pub task_id: Option<String>,
    pub user_id: Option<String>,
    pub auto_save: Option<String>,
    pub character_id: Option<String>,
    pub prompt: Option<String>,
}

impl CheckGenerationQuery {
    fn auto_save(&self) -> Option<AutoSave> {
        let enabled = self
            .auto_save
            .as_deref()
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"));
        let user_id = non_blank(self.user_id.as_deref())?;
        if !enabled {
            return None;
        }
        Some(AutoSave {
            user_id,
            character_id: non_blank(self.character_id.as_deref()),
            prompt: non_blank(self.prompt.as_deref()),
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status")]
pub enum CheckGenerationResponse {
    #[serde(rename = "TASK_STATUS_SUCCEED")]
    Succeeded {
        images: Vec<String>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        partial: bool,
    },
    #[serde(rename = "TASK_STATUS_FAILED")]
    Failed { reason: String, refunded: bool },
    #[serde(rename = "TASK_STATUS_PROCESSING")]
    Processing {
        progress: u8,
        completed_count: usize,
        total_count: usize,
    },
}

impl CheckGenerationResponse {
    fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { partial: true, .. } => "partial",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Processing { .. } => "processing",
        }
    }
}

/// `GET /api/check-generation`: polls a batch of vendor tasks and settles
/// terminal outcomes.
pub async fn check_generation(
    State(state): State<AppState>,
    query: Result<Query<CheckGenerationQuery>, QueryRejection>,
) -> Result<Json<CheckGenerationResponse>, ApiError> {
    let Query(query) = query?;
    let task_ids = parse_task_ids(query.task_id.as_deref().unwrap_or_default());
    if task_ids.is_empty() {
        return Err(ApiError::BadRequest("taskId is required".to_string()));
    }

    let task_key = batch_key(&task_ids);
    let mut timer = start_poll_timer(&task_key, query.user_id.as_deref(), task_ids.len());

    let result = evaluate_batch(&state, &query, &task_ids, &task_key).await;
    match &result {
        Ok(response) => complete_poll_timer(&mut timer, response.label(), None),
        Err(err) => complete_poll_timer(&mut timer, "error", Some(err.to_string())),
    }
    result.map(Json)
}

async fn evaluate_batch(
    state: &AppState,
    query: &CheckGenerationQuery,
    task_ids: &[String],
    task_key: &str,
) -> Result<CheckGenerationResponse, ApiError> {
    let stored = Arc::new(DatabaseBackedSource::new(state.db.clone()));
    let mut selector = SourceSelector::new(&state.vendor.webhook_prefix, stored);

    if selector.needs_vendor(task_ids) {
        let api_key = state
            .resolve_api_key()
            .await?
            .ok_or(ApiError::MissingApiKey)?;
        let vendor = HttpVendorSource::new(state.http.clone(), &state.vendor.base_url, &api_key);
        selector = selector.with_vendor(Arc::new(vendor));
    }

    let statuses = poll_batch(&selector, task_ids).await;

    let response = match classify(&statuses) {
        BatchOutcome::Succeeded { images, partial } => {
            let auto_save = query.auto_save();
            settle_success(&state.db, task_key, &images, auto_save.as_ref()).await;
            CheckGenerationResponse::Succeeded { images, partial }
        }
        BatchOutcome::Failed { reason } => {
            let refunded = settle_failure(&state.db, task_key, &reason).await;
            CheckGenerationResponse::Failed { reason, refunded }
        }
        BatchOutcome::Processing {
            progress,
            completed_count,
            total_count,
        } => {
            record_progress(&state.db, task_key, progress);
            CheckGenerationResponse::Processing {
                progress,
                completed_count,
                total_count,
            }
        }
    };

    Ok(response)
}
