use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use coldchain_types::error::{ColdchainError, Result};
use coldchain_types::{ArchiveId, JobId};
use coldchain_vault::{JobKind, JobOutput, RemoteJobStatus, VaultClient};

use crate::store;

const HISTORY_LIMIT: usize = 64;
const INVENTORY_KEY: &str = "inventory";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    InProgress,
    Succeeded,
    Failed,
    Expired,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::InProgress => "in-progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
        }
    }
}

/// One remote job, persisted across invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncJob {
    pub job_id: JobId,
    pub kind: JobKind,
    pub submitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Archive the job acts on; `None` for inventory jobs.
    #[serde(default)]
    pub payload_ref: Option<ArchiveId>,
    /// Remote id a delete job targets.
    #[serde(default)]
    pub remote_archive_id: Option<String>,
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
}

impl AsyncJob {
    pub fn retry_key(&self) -> String {
        retry_key(self.kind, self.payload_ref.as_ref())
    }
}

/// Backoff bookkeeping for one payload, kept between runs so that waiting
/// never means sleeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempts: u32,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: String,
    #[serde(default)]
    pub exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// `base * 2^(attempt-1)`, capped at `max_delay`, before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2i64.saturating_pow(attempt.saturating_sub(1));
        let secs = self
            .base_delay
            .num_seconds()
            .saturating_mul(factor)
            .min(self.max_delay.num_seconds());
        Duration::seconds(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPolicy {
    /// Result window of a remote job, counted from submission.
    pub job_expiry: Duration,
    pub retry: RetryPolicy,
}

/// What to submit.
#[derive(Debug, Clone)]
pub enum JobRequest<'a> {
    Inventory,
    Upload {
        archive_id: &'a ArchiveId,
        local_path: &'a Path,
        description: &'a str,
    },
    Delete {
        archive_id: &'a ArchiveId,
        remote_archive_id: &'a str,
    },
}

impl JobRequest<'_> {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Inventory => JobKind::InventoryRetrieve,
            JobRequest::Upload { .. } => JobKind::ArchiveUpload,
            JobRequest::Delete { .. } => JobKind::ArchiveDelete,
        }
    }

    pub fn archive_id(&self) -> Option<&ArchiveId> {
        match self {
            JobRequest::Inventory => None,
            JobRequest::Upload { archive_id, .. } | JobRequest::Delete { archive_id, .. } => {
                Some(archive_id)
            }
        }
    }

    pub fn retry_key(&self) -> String {
        retry_key(self.kind(), self.archive_id())
    }
}

pub fn retry_key(kind: JobKind, archive_id: Option<&ArchiveId>) -> String {
    match archive_id {
        Some(id) => format!("{}:{}", kind.as_str(), id.as_str()),
        None => INVENTORY_KEY.to_string(),
    }
}

/// Whether a payload may be (re)submitted now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryGate {
    Ready,
    Backoff(DateTime<Utc>),
    Exhausted,
}

/// Result of re-polling one job during `resume_all`.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: AsyncJob,
    pub output: Option<JobOutput>,
    /// Transport error; the job keeps its previous status.
    pub poll_error: Option<String>,
}

/// Persisted record of in-flight vault jobs (`ledger.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobLedger {
    #[serde(default)]
    jobs: Vec<AsyncJob>,
    #[serde(default)]
    retries: BTreeMap<String, RetryRecord>,
    #[serde(default)]
    history: Vec<AsyncJob>,
}

impl JobLedger {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(store::read_json_optional(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        store::write_json_atomic(path, self)
    }

    pub fn jobs(&self) -> &[AsyncJob] {
        &self.jobs
    }

    pub fn history(&self) -> &[AsyncJob] {
        &self.history
    }

    pub fn retries(&self) -> &BTreeMap<String, RetryRecord> {
        &self.retries
    }

    pub fn outstanding(&self) -> impl Iterator<Item = &AsyncJob> {
        self.jobs.iter().filter(|j| !j.status.is_terminal())
    }

    pub fn outstanding_inventory(&self) -> Option<&AsyncJob> {
        self.outstanding()
            .find(|j| j.kind == JobKind::InventoryRetrieve)
    }

    pub fn outstanding_for(&self, archive_id: &ArchiveId) -> Option<&AsyncJob> {
        self.outstanding()
            .find(|j| j.payload_ref.as_ref() == Some(archive_id))
    }

    pub fn get(&self, job_id: &JobId) -> Option<&AsyncJob> {
        self.jobs.iter().find(|j| &j.job_id == job_id)
    }

    /// Submit a job, or return the outstanding one for the same payload.
    ///
    /// A submission error is recorded against the payload's retry record
    /// before it is returned.
    pub fn submit(
        &mut self,
        request: JobRequest<'_>,
        vault: &dyn VaultClient,
        now: DateTime<Utc>,
        policy: &LedgerPolicy,
    ) -> Result<AsyncJob> {
        let kind = request.kind();
        let existing = match request.archive_id() {
            None => self.outstanding_inventory(),
            Some(id) => self.outstanding_for(id),
        };
        if let Some(job) = existing {
            if job.kind != kind {
                return Err(ColdchainError::JobConflict(format!(
                    "archive {} already has outstanding {} job {}",
                    request.archive_id().map(|a| a.short()).unwrap_or("-"),
                    job.kind,
                    job.job_id
                )));
            }
            debug!(job_id = %job.job_id, %kind, "reusing outstanding job");
            return Ok(job.clone());
        }

        let submitted = match &request {
            JobRequest::Inventory => vault.submit_inventory_job(),
            JobRequest::Upload {
                local_path,
                description,
                ..
            } => vault.submit_upload_job(local_path, description),
            JobRequest::Delete {
                remote_archive_id, ..
            } => vault.submit_delete_job(remote_archive_id),
        };
        let job_id = match submitted {
            Ok(id) => id,
            Err(e) => {
                self.record_failure(&request.retry_key(), &e.to_string(), now, &policy.retry);
                return Err(e);
            }
        };

        let job = AsyncJob {
            job_id,
            kind,
            submitted_at: now,
            expires_at: now + policy.job_expiry,
            status: JobStatus::Submitted,
            payload_ref: request.archive_id().cloned(),
            remote_archive_id: match &request {
                JobRequest::Delete {
                    remote_archive_id, ..
                } => Some(remote_archive_id.to_string()),
                _ => None,
            },
            last_polled_at: None,
            message: None,
        };
        info!(job_id = %job.job_id, %kind, "vault job submitted");
        self.jobs.push(job.clone());
        Ok(job)
    }

    /// Refresh one job's status.
    ///
    /// A job past `expires_at` turns EXPIRED without contacting the vault.
    /// Transport errors leave the status untouched.
    pub fn poll(
        &mut self,
        job_id: &JobId,
        vault: &dyn VaultClient,
        now: DateTime<Utc>,
    ) -> Result<(JobStatus, Option<JobOutput>)> {
        let job = self
            .jobs
            .iter_mut()
            .find(|j| &j.job_id == job_id)
            .ok_or_else(|| ColdchainError::Other(format!("unknown job {job_id}")))?;
        if job.status.is_terminal() {
            return Ok((job.status, None));
        }
        if now >= job.expires_at {
            debug!(%job_id, "job passed its result window");
            job.status = JobStatus::Expired;
            return Ok((job.status, None));
        }

        let poll = vault.poll_job(job_id)?;
        job.last_polled_at = Some(now);
        job.message = poll.message.clone();
        job.status = match poll.status {
            RemoteJobStatus::InProgress => JobStatus::InProgress,
            RemoteJobStatus::Succeeded => JobStatus::Succeeded,
            RemoteJobStatus::Failed => JobStatus::Failed,
            RemoteJobStatus::Expired => JobStatus::Expired,
        };
        if job.status == JobStatus::Succeeded && poll.output.is_none() {
            job.status = JobStatus::Failed;
            job.message = Some("vault reported success without a result".into());
        }
        Ok((job.status, poll.output))
    }

    /// Re-poll every non-terminal job. Must run before anything new is
    /// submitted in an invocation.
    pub fn resume_all(&mut self, vault: &dyn VaultClient, now: DateTime<Utc>) -> Vec<JobOutcome> {
        let pending: Vec<JobId> = self.outstanding().map(|j| j.job_id.clone()).collect();
        let mut outcomes = Vec::with_capacity(pending.len());
        for job_id in pending {
            let (output, poll_error) = match self.poll(&job_id, vault, now) {
                Ok((_, output)) => (output, None),
                Err(e) => {
                    warn!(%job_id, "poll failed, will retry next run: {e}");
                    (None, Some(e.to_string()))
                }
            };
            if let Some(job) = self.get(&job_id) {
                outcomes.push(JobOutcome {
                    job: job.clone(),
                    output,
                    poll_error,
                });
            }
        }
        outcomes
    }

    /// Move a terminal job into the bounded history. Call only after its
    /// effects are durable in the catalog.
    pub fn retire(&mut self, job_id: &JobId) {
        if let Some(pos) = self
            .jobs
            .iter()
            .position(|j| &j.job_id == job_id && j.status.is_terminal())
        {
            let job = self.jobs.remove(pos);
            self.history.push(job);
            if self.history.len() > HISTORY_LIMIT {
                let excess = self.history.len() - HISTORY_LIMIT;
                self.history.drain(..excess);
            }
        }
    }

    /// Count a failed attempt and schedule the next one.
    pub fn record_failure(
        &mut self,
        key: &str,
        message: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> RetryRecord {
        let record = self
            .retries
            .entry(key.to_string())
            .or_insert_with(|| RetryRecord {
                attempts: 0,
                next_attempt_at: None,
                last_error: String::new(),
                exhausted: false,
            });
        record.attempts += 1;
        record.last_error = message.to_string();
        if record.attempts >= policy.max_attempts {
            record.exhausted = true;
            record.next_attempt_at = None;
            warn!(key, attempts = record.attempts, "retries exhausted: {message}");
        } else {
            let delay = policy.backoff(record.attempts);
            let jitter_cap = delay.num_seconds() / 10;
            let jitter = if jitter_cap > 0 {
                rand::random::<u64>() % (jitter_cap as u64 + 1)
            } else {
                0
            };
            record.next_attempt_at = Some(now + delay + Duration::seconds(jitter as i64));
            debug!(key, attempts = record.attempts, next = ?record.next_attempt_at, "retry scheduled");
        }
        record.clone()
    }

    pub fn clear_retry(&mut self, key: &str) {
        self.retries.remove(key);
    }

    pub fn gate(&self, key: &str, now: DateTime<Utc>) -> RetryGate {
        match self.retries.get(key) {
            None => RetryGate::Ready,
            Some(r) if r.exhausted => RetryGate::Exhausted,
            Some(r) => match r.next_attempt_at {
                Some(at) if at > now => RetryGate::Backoff(at),
                _ => RetryGate::Ready,
            },
        }
    }

    pub fn exhausted(&self) -> impl Iterator<Item = (&String, &RetryRecord)> {
        self.retries.iter().filter(|(_, r)| r.exhausted)
    }

    /// Forget exhausted records so their payloads are attempted again.
    pub fn clear_exhausted(&mut self) -> usize {
        let before = self.retries.len();
        self.retries.retain(|_, r| !r.exhausted);
        before - self.retries.len()
    }
}
