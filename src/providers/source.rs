use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorTaskState {
    Queued,
    Processing,
    Succeed,
    Failed,
    Other(String),
}

impl VendorTaskState {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "TASK_STATUS_QUEUED" | "QUEUED" => Self::Queued,
            "TASK_STATUS_PROCESSING" | "PROCESSING" => Self::Processing,
            "TASK_STATUS_SUCCEED" | "SUCCEED" => Self::Succeed,
            "TASK_STATUS_FAILED" | "FAILED" => Self::Failed,
            _ => Self::Other(value.trim().to_string()),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Anything the vendor has not finished, including states we do not know.
    pub fn is_in_flight(&self) -> bool {
        !self.is_succeeded() && !self.is_failed()
    }
}

/// One vendor task inside a polled batch. Fetched fresh on every poll.
#[derive(Debug, Clone, PartialEq)]
pub struct SubTaskStatus {
    pub task_id: String,
    pub state: VendorTaskState,
    pub progress_percent: Option<f64>,
    pub images: Vec<String>,
    pub reason: Option<String>,
}

impl SubTaskStatus {
    pub fn failed(task_id: &str, reason: impl Into<String>) -> Self {
        SubTaskStatus {
            task_id: task_id.to_string(),
            state: VendorTaskState::Failed,
            progress_percent: None,
            images: Vec::new(),
            reason: Some(reason.into()),
        }
    }

    pub fn queued(task_id: &str) -> Self {
        SubTaskStatus {
            task_id: task_id.to_string(),
            state: VendorTaskState::Queued,
            progress_percent: Some(0.0),
            images: Vec::new(),
            reason: None,
        }
    }

    pub fn succeeded(task_id: &str, images: Vec<String>) -> Self {
        SubTaskStatus {
            task_id: task_id.to_string(),
            state: VendorTaskState::Succeed,
            progress_percent: Some(100.0),
            images,
            reason: None,
        }
    }
}

/// Where the status of one task id comes from.
///
/// Implementations never fail: problems reaching the backing store are
/// reported as a failed sub-task so one bad id cannot sink the batch.
#[async_trait]
pub trait TaskStatusSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_status(&self, task_id: &str) -> SubTaskStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vendor_states() {
        assert_eq!(
            VendorTaskState::parse("TASK_STATUS_SUCCEED"),
            VendorTaskState::Succeed
        );
        assert_eq!(VendorTaskState::parse("failed"), VendorTaskState::Failed);
        assert_eq!(
            VendorTaskState::parse("TASK_STATUS_PAUSED"),
            VendorTaskState::Other("TASK_STATUS_PAUSED".to_string())
        );
    }

    #[test]
    fn unknown_states_count_as_in_flight() {
        assert!(VendorTaskState::Other("WEIRD".to_string()).is_in_flight());
        assert!(VendorTaskState::Queued.is_in_flight());
        assert!(!VendorTaskState::Failed.is_in_flight());
        assert!(!VendorTaskState::Succeed.is_in_flight());
    }
}
