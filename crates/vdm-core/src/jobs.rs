//! Job status ledger and user notifications
//!
//! Records job rows and their terminal state, and emits notifications for
//! the owning organization.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;

use crate::{Result, VdmError};

pub type JobId = i64;

/// Job lifecycle state as stored in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Failed,
    Complete,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Complete => "complete",
        }
    }
}

/// Result payload attached to a terminal job status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl JobReport {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            message: message.into(),
            error: Some(error.to_string()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// User-facing notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub text_content: String,
    pub symbol: Option<String>,
    pub link: Option<String>,
}

impl Notification {
    pub fn new(text_content: impl Into<String>) -> Self {
        Self {
            text_content: text_content.into(),
            symbol: None,
            link: None,
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }
}

/// Sink for job terminal states and notifications
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Record a job status with its result payload
    async fn update_job(&self, job_id: JobId, status: JobStatus, report: &JobReport)
        -> Result<()>;

    /// Emit a notification for an organization
    async fn notify(&self, organization_id: i64, notification: &Notification) -> Result<()>;
}

/// PostgreSQL job ledger
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a `pending` job row carrying its payload
    pub async fn enqueue(&self, task_name: &str, data: &serde_json::Value) -> Result<JobId> {
        let (id,): (JobId,) = sqlx::query_as(
            r#"
            INSERT INTO jobs (task_name, status, data)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(task_name)
        .bind(JobStatus::Pending.as_str())
        .bind(data)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| VdmError::DatabaseError(format!("Failed to enqueue {task_name}: {e}")))?;

        tracing::debug!(job_id = id, task_name, "Job enqueued");
        Ok(id)
    }
}

#[async_trait]
impl JobLedger for JobStore {
    async fn update_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        report: &JobReport,
    ) -> Result<()> {
        let result = serde_json::to_value(report)
            .map_err(|e| VdmError::DatabaseError(format!("Failed to encode job result: {e}")))?;

        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, result = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(|e| VdmError::DatabaseError(format!("Failed to update job {job_id}: {e}")))?;

        if updated.rows_affected() == 0 {
            return Err(VdmError::NotFound(format!("job {job_id}")));
        }

        tracing::debug!(job_id, status = status.as_str(), "Job status updated");
        Ok(())
    }

    async fn notify(&self, organization_id: i64, notification: &Notification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (organization_id, text_content, symbol, link)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(organization_id)
        .bind(&notification.text_content)
        .bind(&notification.symbol)
        .bind(&notification.link)
        .execute(&self.pool)
        .await
        .map_err(|e| VdmError::DatabaseError(format!("Failed to create notification: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_report_wire_format_omits_empty_fields() {
        let report = JobReport::message("nothing to do");
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({ "message": "nothing to do" })
        );

        let failed = JobReport::failure("Job failed", "timeout").with_details(json!({ "n": 1 }));
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["error"], "timeout");
        assert_eq!(value["details"]["n"], 1);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_value(JobStatus::Complete).unwrap(), json!("complete"));
        assert_eq!(JobStatus::Failed.as_str(), "failed");
    }
}
