//! Job status reporting
//!
//! Every job ends by writing exactly one terminal status. A failure to
//! write that status is logged but never masks the job's own outcome.

use std::sync::Arc;

use serde_json::json;
use vdm_core::{JobId, JobLedger, JobReport, JobStatus, Result};

/// Writes progress and the terminal status of one job
pub struct JobReporter {
    jobs: Arc<dyn JobLedger>,
    job_id: JobId,
}

impl JobReporter {
    pub fn new(jobs: Arc<dyn JobLedger>, job_id: JobId) -> Self {
        Self { jobs, job_id }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Record a `pending` status with a progress message
    pub async fn progress(&self, message: impl Into<String>) {
        let report = JobReport::message(message);
        if let Err(e) = self
            .jobs
            .update_job(self.job_id, JobStatus::Pending, &report)
            .await
        {
            tracing::warn!(job_id = self.job_id, error = %e, "Failed to record job progress");
        }
    }

    /// Record the terminal status for `outcome` and hand the outcome back
    pub async fn finish<T>(
        &self,
        outcome: Result<T>,
        report: impl FnOnce(&T) -> JobReport,
    ) -> Result<T> {
        let (status, job_report) = match &outcome {
            Ok(value) => (JobStatus::Complete, report(value)),
            Err(e) => {
                tracing::error!(job_id = self.job_id, error = %e, "Job failed");
                (
                    JobStatus::Failed,
                    JobReport::failure("Job failed with error", e)
                        .with_details(json!({ "canRetry": e.is_retryable() })),
                )
            }
        };

        if let Err(e) = self
            .jobs
            .update_job(self.job_id, status, &job_report)
            .await
        {
            tracing::error!(job_id = self.job_id, error = %e, "Failed to record job status");
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdm_core::memory::MemoryJobLedger;
    use vdm_core::VdmError;

    #[tokio::test]
    async fn test_success_writes_complete() {
        let ledger = Arc::new(MemoryJobLedger::new());
        let reporter = JobReporter::new(ledger.clone(), 4);

        let value = reporter
            .finish(Ok(3), |n| JobReport::message(format!("{n} done")))
            .await
            .unwrap();
        assert_eq!(value, 3);

        let (status, report) = ledger.last_status(4).await.unwrap();
        assert_eq!(status, JobStatus::Complete);
        assert_eq!(report.message, "3 done");
    }

    #[tokio::test]
    async fn test_failure_writes_failed_with_retry_hint() {
        let ledger = Arc::new(MemoryJobLedger::new());
        let reporter = JobReporter::new(ledger.clone(), 5);

        let outcome: Result<()> = reporter
            .finish(Err(VdmError::ValidationError("empty".into())), |_| {
                JobReport::message("unused")
            })
            .await;
        assert!(outcome.is_err());

        let (status, report) = ledger.last_status(5).await.unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("Validation error: empty"));
        assert_eq!(report.details, Some(json!({ "canRetry": false })));
    }

    #[tokio::test]
    async fn test_progress_is_pending() {
        let ledger = Arc::new(MemoryJobLedger::new());
        let reporter = JobReporter::new(ledger.clone(), 6);
        reporter.progress("Working on namespace 1 of 2").await;

        let (status, report) = ledger.last_status(6).await.unwrap();
        assert_eq!(status, JobStatus::Pending);
        assert_eq!(report.message, "Working on namespace 1 of 2");
    }
}
