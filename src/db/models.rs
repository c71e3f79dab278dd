use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl TaskStatus {
    /// Statuses a poll is still allowed to move out of.
    pub const IN_FLIGHT: [TaskStatus; 2] = [TaskStatus::Pending, TaskStatus::Processing];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[cfg(test)]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct GenerationTaskRow {
    pub id: i64,
    pub task_id: String,
    pub user_id: String,
    pub tokens_deducted: i64,
    pub status: String,
    pub progress: i64,
    pub error_message: Option<String>,
    pub refunded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
impl GenerationTaskRow {
    pub fn status(&self) -> Option<TaskStatus> {
        TaskStatus::from_str(&self.status)
    }
}

#[cfg(test)]
#[derive(Debug, Clone, FromRow)]
pub struct GeneratedImageRow {
    pub id: i64,
    pub user_id: String,
    pub character_id: Option<String>,
    pub image_url: String,
    pub prompt: Option<String>,
    pub source: String,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GeneratedImageInsert {
    pub user_id: String,
    pub character_id: Option<String>,
    pub image_url: String,
    pub prompt: Option<String>,
    pub source: String,
    pub task_id: Option<String>,
}

/// Best-effort progress hint applied by the background writer.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub progress: i64,
}

/// Row handed back by the failure gate when it actually flipped a task.
#[derive(Debug, Clone, FromRow)]
pub struct FailedTaskClaim {
    pub user_id: String,
    pub tokens_deducted: i64,
}
