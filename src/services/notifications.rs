//! Outbound notifications about job lifecycle events

use crate::models::job::{JobRef, JobStatus};
use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct JobNotification {
    pub user_id: i64,
    pub job: JobRef,
    pub status: JobStatus,
    pub message: Option<String>,
}

/// Fire-and-forget; delivery failures never reach the caller
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: JobNotification);
}

#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: JobNotification) {
        info!(
            user_id = notification.user_id,
            job = %notification.job,
            status = %notification.status,
            message = notification.message.as_deref().unwrap_or(""),
            "job status changed"
        );
    }
}
