// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded polling of background upload jobs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tally_config::UploadConfig;
use tally_service::{AnalysisService, JobStatus, ServiceError, UploadJob};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::JobError;

/// Waits between polls.  Tests swap in a sleeper that records instead of
/// waiting.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer, so a paused test clock advances instantly.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self { interval: Duration::from_millis(1000), max_attempts: 60 }
    }
}

impl From<&UploadConfig> for PollPolicy {
    fn from(cfg: &UploadConfig) -> Self {
        Self { interval: cfg.poll_interval(), max_attempts: cfg.max_attempts }
    }
}

/// Non-terminal status forwarded while polling.
#[derive(Debug, Clone, PartialEq)]
pub struct JobProgress {
    pub job_id: String,
    pub attempt: u32,
    pub status: JobStatus,
    pub progress: u8,
    pub message: Option<String>,
}

/// How polling ended.  Every variant is terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { job: UploadJob, attempts: u32 },
    Failed { job: UploadJob, attempts: u32 },
    /// The attempt bound was reached without a terminal status.
    TimedOut { job_id: String, attempts: u32, last: Option<UploadJob> },
    /// A status request itself failed.
    TransportFailed { job_id: String, attempts: u32, error: ServiceError },
}

impl JobOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            JobOutcome::Completed { attempts, .. }
            | JobOutcome::Failed { attempts, .. }
            | JobOutcome::TimedOut { attempts, .. }
            | JobOutcome::TransportFailed { attempts, .. } => *attempts,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }

    /// The job's result payload on completion.
    pub fn result(&self) -> Option<&Value> {
        match self {
            JobOutcome::Completed { job, .. } => job.result.as_ref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<JobError> {
        match self {
            JobOutcome::Completed { .. } => None,
            JobOutcome::Failed { job, .. } => {
                Some(JobError::Failed(job.error.clone().unwrap_or_else(|| "unknown error".into())))
            }
            JobOutcome::TimedOut { attempts, .. } => Some(JobError::Timeout { attempts: *attempts }),
            JobOutcome::TransportFailed { error, .. } => Some(JobError::Transport(error.to_string())),
        }
    }
}

pub struct JobPoller {
    service: Arc<dyn AnalysisService>,
    policy: PollPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl JobPoller {
    pub fn new(service: Arc<dyn AnalysisService>, policy: PollPolicy) -> Self {
        Self { service, policy, sleeper: Arc::new(TokioSleeper) }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Upload `path`, then poll the job it starts.  Only the upload request
    /// itself can fail; everything after is reported in the outcome.
    pub async fn upload_and_poll(
        &self,
        path: &Path,
        progress: Option<mpsc::Sender<JobProgress>>,
    ) -> Result<JobOutcome, ServiceError> {
        let accepted = self.service.upload(path).await?;
        info!(file = %path.display(), job = %accepted.job_id, "upload accepted");
        Ok(self.poll(&accepted.job_id, progress).await)
    }

    /// Poll `job_id` until it completes, fails, or the attempt bound runs
    /// out.  Each non-terminal status is followed by one interval wait, so
    /// a job that never finishes takes `max_attempts * interval`.
    pub async fn poll(&self, job_id: &str, progress: Option<mpsc::Sender<JobProgress>>) -> JobOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last = None;

        for attempt in 1..=max_attempts {
            let job = match self.service.upload_status(job_id).await {
                Ok(job) => job,
                Err(error) => {
                    warn!(job = job_id, attempt, "status check failed: {error}");
                    return JobOutcome::TransportFailed { job_id: job_id.to_string(), attempts: attempt, error };
                }
            };
            debug!(job = job_id, attempt, status = %job.status, progress = job.progress, "poll");

            match job.status {
                JobStatus::Completed => {
                    info!(job = job_id, attempts = attempt, "job completed");
                    return JobOutcome::Completed { job, attempts: attempt };
                }
                JobStatus::Failed => {
                    warn!(job = job_id, attempts = attempt, error = ?job.error, "job failed");
                    return JobOutcome::Failed { job, attempts: attempt };
                }
                JobStatus::Queued | JobStatus::Processing => {}
            }

            if let Some(tx) = &progress {
                let _ = tx
                    .send(JobProgress {
                        job_id: job_id.to_string(),
                        attempt,
                        status: job.status,
                        progress: job.progress,
                        message: job.message.clone(),
                    })
                    .await;
            }
            last = Some(job);
            self.sleeper.sleep(self.policy.interval).await;
        }

        warn!(job = job_id, attempts = max_attempts, "job polling timed out");
        JobOutcome::TimedOut { job_id: job_id.to_string(), attempts: max_attempts, last }
    }
}
