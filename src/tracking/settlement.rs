use tracing::{error, info, warn};

use crate::billing::refund_reason;
use crate::db::database::{Database, FailureSettlement};
use crate::db::models::{GeneratedImageInsert, ProgressUpdate};

pub const AUTO_SAVE_SOURCE: &str = "chat";

/// What to persist when a batch finishes and the caller asked for auto-save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoSave {
    pub user_id: String,
    pub character_id: Option<String>,
    pub prompt: Option<String>,
}

/// Writes a successful outcome back. Returns how many images were saved.
///
/// Bookkeeping errors are logged and never surface: the caller already has
/// the images.
pub async fn settle_success(
    db: &Database,
    task_key: &str,
    images: &[String],
    auto_save: Option<&AutoSave>,
) -> u64 {
    match db.mark_task_succeeded(task_key).await {
        Ok(true) => info!("Generation task {task_key} settled as succeeded"),
        Ok(false) => {}
        Err(err) => warn!("Failed to mark generation task {task_key} succeeded: {err}"),
    }

    let Some(auto_save) = auto_save else {
        return 0;
    };
    if images.is_empty() {
        return 0;
    }

    let rows: Vec<GeneratedImageInsert> = images
        .iter()
        .map(|url| GeneratedImageInsert {
            user_id: auto_save.user_id.clone(),
            character_id: auto_save.character_id.clone(),
            image_url: url.clone(),
            prompt: auto_save.prompt.clone(),
            source: AUTO_SAVE_SOURCE.to_string(),
            task_id: Some(task_key.to_string()),
        })
        .collect();

    match db.insert_generated_images(&rows).await {
        Ok(saved) => {
            info!(
                "Auto-saved {saved} of {} image(s) for user {} (task {task_key})",
                rows.len(),
                auto_save.user_id
            );
            saved
        }
        Err(err) => {
            warn!("Failed to auto-save images for task {task_key}: {err}");
            0
        }
    }
}

/// Settles a batch where nothing rendered. Returns whether the task's tokens
/// have been refunded, by this poll or an earlier one.
pub async fn settle_failure(db: &Database, task_key: &str, reason: &str) -> bool {
    let refund_note = refund_reason(task_key);
    match db.settle_task_failed(task_key, reason, &refund_note).await {
        Ok(outcome) => {
            match &outcome {
                FailureSettlement::Refunded { user_id, amount } => info!(
                    "Generation task {task_key} failed; refunded {amount} tokens to user {user_id}"
                ),
                FailureSettlement::FailedWithoutRefund => {
                    info!("Generation task {task_key} failed; no tokens to refund")
                }
                FailureSettlement::AlreadySettled { .. } => {}
                FailureSettlement::NotTracked => {
                    warn!("No generation task row for failed batch {task_key}")
                }
            }
            outcome.refunded()
        }
        Err(err) => {
            error!("Failed to settle failed generation task {task_key}: {err}");
            false
        }
    }
}

/// Queues a progress hint for the UI. Zero progress is not worth a write.
pub fn record_progress(db: &Database, task_key: &str, progress: u8) {
    if progress == 0 {
        return;
    }
    let update = ProgressUpdate {
        task_id: task_key.to_string(),
        progress: i64::from(progress),
    };
    if let Err(err) = db.queue_progress_update(update) {
        warn!("Dropping progress hint for task {task_key}: {err}");
    }
}
