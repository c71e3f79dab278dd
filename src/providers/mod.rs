pub mod novita;
pub mod source;
pub mod stored;

use std::sync::Arc;

pub use novita::HttpVendorSource;
pub use source::{SubTaskStatus, TaskStatusSource, VendorTaskState};
pub use stored::DatabaseBackedSource;

/// Routes each task id to the source that can answer for it.
#[derive(Clone)]
pub struct SourceSelector {
    webhook_prefix: String,
    stored: Arc<dyn TaskStatusSource>,
    vendor: Option<Arc<dyn TaskStatusSource>>,
}

impl SourceSelector {
    pub fn new(webhook_prefix: &str, stored: Arc<dyn TaskStatusSource>) -> Self {
        SourceSelector {
            webhook_prefix: webhook_prefix.to_string(),
            stored,
            vendor: None,
        }
    }

    pub fn with_vendor(mut self, vendor: Arc<dyn TaskStatusSource>) -> Self {
        self.vendor = Some(vendor);
        self
    }

    pub fn is_webhook_task(&self, task_id: &str) -> bool {
        task_id.starts_with(&self.webhook_prefix)
    }

    pub fn needs_vendor(&self, task_ids: &[String]) -> bool {
        task_ids.iter().any(|task_id| !self.is_webhook_task(task_id))
    }

    pub fn source_for(&self, task_id: &str) -> Option<&dyn TaskStatusSource> {
        if self.is_webhook_task(task_id) {
            Some(self.stored.as_ref())
        } else {
            self.vendor.as_deref()
        }
    }
}
