use async_trait::async_trait;
use tracing::warn;

use crate::db::database::Database;
use crate::providers::source::{SubTaskStatus, TaskStatusSource};

/// Status source for providers that deliver results through a webhook.
///
/// Their images land in `generated_images` through a separate ingestion path,
/// so a task counts as done as soon as rows carrying its id exist.
#[derive(Clone)]
pub struct DatabaseBackedSource {
    db: Database,
}

impl DatabaseBackedSource {
    pub fn new(db: Database) -> Self {
        DatabaseBackedSource { db }
    }
}

#[async_trait]
impl TaskStatusSource for DatabaseBackedSource {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn fetch_status(&self, task_id: &str) -> SubTaskStatus {
        match self.db.find_image_urls_by_task_id(task_id).await {
            Ok(urls) if urls.is_empty() => SubTaskStatus::queued(task_id),
            Ok(urls) => SubTaskStatus::succeeded(task_id, urls),
            Err(err) => {
                warn!("Failed to read stored images for task {task_id}: {err}");
                SubTaskStatus::failed(task_id, format!("Failed to read stored images: {err}"))
            }
        }
    }
}
