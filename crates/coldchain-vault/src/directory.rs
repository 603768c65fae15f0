use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use coldchain_types::error::{ColdchainError, Result};
use coldchain_types::JobId;

use crate::{InventoryEntry, InventorySnapshot, JobKind, JobOutput, JobPoll, VaultClient};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A vault kept in a local (or mounted) directory.
///
/// Jobs behave like a real cold vault: they complete `job_latency` after
/// submission and their output disappears `result_retention` after
/// completion. Work happens lazily inside `poll_job`, so no background
/// process is needed.
///
/// Layout:
/// ```text
/// jobs/<job_id>.json          job records
/// staging/<job_id>.data       upload bodies waiting for their job
/// archives/<remote_id>.data   stored archives
/// archives/<remote_id>.json   archive metadata (inventory entry)
/// ```
pub struct DirectoryVault {
    root: PathBuf,
    job_latency: Duration,
    result_retention: Duration,
    clock: Clock,
}

#[derive(Debug, Serialize, Deserialize)]
struct VaultJobRecord {
    job_id: String,
    kind: JobKind,
    submitted_at: DateTime<Utc>,
    ready_at: DateTime<Utc>,
    #[serde(default)]
    remote_archive_id: Option<String>,
    #[serde(default)]
    description: String,
    state: VaultJobState,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum VaultJobState {
    Pending,
    Done {
        completed_at: DateTime<Utc>,
        output: JobOutput,
    },
    Failed {
        completed_at: DateTime<Utc>,
        message: String,
    },
}

impl DirectoryVault {
    pub fn open(root: &Path, job_latency: Duration, result_retention: Duration) -> Result<Self> {
        for sub in ["jobs", "staging", "archives"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            job_latency,
            result_retention,
            clock: Arc::new(Utc::now),
        })
    }

    /// Replace the wall clock, for simulating hours of vault latency in tests.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current contents, read directly (tests and diagnostics only; the
    /// engine must go through an inventory job).
    pub fn list_archives(&self) -> Result<Vec<InventoryEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.root.join("archives"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read(&path)?;
            let meta: InventoryEntry = serde_json::from_slice(&data)
                .map_err(|e| ColdchainError::Vault(format!("{}: {e}", path.display())))?;
            entries.push(meta);
        }
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.root.join("jobs").join(format!("{job_id}.json"))
    }

    fn staging_path(&self, job_id: &str) -> PathBuf {
        self.root.join("staging").join(format!("{job_id}.data"))
    }

    fn archive_data_path(&self, remote_id: &str) -> PathBuf {
        self.root.join("archives").join(format!("{remote_id}.data"))
    }

    fn archive_meta_path(&self, remote_id: &str) -> PathBuf {
        self.root.join("archives").join(format!("{remote_id}.json"))
    }

    fn new_job(&self, kind: JobKind) -> VaultJobRecord {
        let now = self.now();
        VaultJobRecord {
            job_id: format!("{:032x}", rand::random::<u128>()),
            kind,
            submitted_at: now,
            ready_at: now + self.job_latency,
            remote_archive_id: None,
            description: String::new(),
            state: VaultJobState::Pending,
        }
    }

    fn save_job(&self, job: &VaultJobRecord) -> Result<()> {
        let data = serde_json::to_vec_pretty(job)?;
        atomic_write(&self.job_path(&job.job_id), &data)
    }

    fn load_job(&self, job_id: &str) -> Result<Option<VaultJobRecord>> {
        let path = self.job_path(job_id);
        match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| ColdchainError::Vault(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Carry out a job whose latency has elapsed.
    fn execute(&self, job: &VaultJobRecord, now: DateTime<Utc>) -> VaultJobState {
        let result = match job.kind {
            JobKind::InventoryRetrieve => self.list_archives().map(|archives| {
                JobOutput::Inventory(InventorySnapshot {
                    inventory_date: now,
                    archives,
                })
            }),
            JobKind::ArchiveUpload => self.store_upload(job, now),
            JobKind::ArchiveDelete => self.delete_archive(job),
        };
        match result {
            Ok(output) => VaultJobState::Done {
                completed_at: now,
                output,
            },
            Err(e) => VaultJobState::Failed {
                completed_at: now,
                message: e.to_string(),
            },
        }
    }

    fn store_upload(&self, job: &VaultJobRecord, now: DateTime<Utc>) -> Result<JobOutput> {
        let staged = self.staging_path(&job.job_id);
        let size_bytes = fs::metadata(&staged)
            .map_err(|e| ColdchainError::Vault(format!("staged upload missing: {e}")))?
            .len();
        let remote_id = format!(
            "{:032x}{:032x}",
            rand::random::<u128>(),
            rand::random::<u128>()
        );
        fs::rename(&staged, self.archive_data_path(&remote_id))?;
        let meta = InventoryEntry {
            remote_archive_id: remote_id.clone(),
            size_bytes,
            created_at: now,
            description: job.description.clone(),
        };
        atomic_write(
            &self.archive_meta_path(&remote_id),
            &serde_json::to_vec_pretty(&meta)?,
        )?;
        Ok(JobOutput::Uploaded {
            remote_archive_id: remote_id,
        })
    }

    fn delete_archive(&self, job: &VaultJobRecord) -> Result<JobOutput> {
        let remote_id = job
            .remote_archive_id
            .as_deref()
            .ok_or_else(|| ColdchainError::Vault("delete job without archive id".into()))?;
        // Deleting an archive that is already gone counts as success so that
        // a retried delete converges.
        remove_if_present(&self.archive_meta_path(remote_id))?;
        remove_if_present(&self.archive_data_path(remote_id))?;
        Ok(JobOutput::Deleted)
    }
}

impl VaultClient for DirectoryVault {
    fn submit_inventory_job(&self) -> Result<JobId> {
        let job = self.new_job(JobKind::InventoryRetrieve);
        self.save_job(&job)
            .map_err(|e| ColdchainError::submission("inventory", e))?;
        debug!(job_id = %job.job_id, "directory vault: inventory job submitted");
        Ok(JobId::new(job.job_id))
    }

    fn submit_upload_job(&self, local_path: &Path, description: &str) -> Result<JobId> {
        let mut job = self.new_job(JobKind::ArchiveUpload);
        job.description = description.to_string();
        let staged = self.staging_path(&job.job_id);
        let copy = (|| -> Result<()> {
            let dir = self.root.join("staging");
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            let mut src = fs::File::open(local_path)?;
            std::io::copy(&mut src, tmp.as_file_mut())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&staged).map_err(|e| e.error)?;
            Ok(())
        })();
        if let Err(e) = copy {
            return Err(ColdchainError::submission(
                "upload",
                format!("{}: {e}", local_path.display()),
            ));
        }
        if let Err(e) = self.save_job(&job) {
            let _ = fs::remove_file(&staged);
            return Err(ColdchainError::submission("upload", e));
        }
        debug!(job_id = %job.job_id, path = %local_path.display(), "directory vault: upload job submitted");
        Ok(JobId::new(job.job_id))
    }

    fn submit_delete_job(&self, remote_archive_id: &str) -> Result<JobId> {
        if remote_archive_id.is_empty() || remote_archive_id.contains(['/', '\\', '.']) {
            return Err(ColdchainError::submission(
                "delete",
                format!("invalid archive id '{remote_archive_id}'"),
            ));
        }
        let mut job = self.new_job(JobKind::ArchiveDelete);
        job.remote_archive_id = Some(remote_archive_id.to_string());
        self.save_job(&job)
            .map_err(|e| ColdchainError::submission("delete", e))?;
        debug!(job_id = %job.job_id, remote_archive_id, "directory vault: delete job submitted");
        Ok(JobId::new(job.job_id))
    }

    fn poll_job(&self, job_id: &JobId) -> Result<JobPoll> {
        if job_id.as_str().contains(['/', '\\', '.']) {
            return Err(ColdchainError::Vault(format!("invalid job id '{job_id}'")));
        }
        let now = self.now();
        let Some(mut job) = self.load_job(job_id.as_str())? else {
            return Ok(JobPoll::expired());
        };

        if matches!(job.state, VaultJobState::Pending) {
            if now < job.ready_at {
                return Ok(JobPoll::in_progress());
            }
            job.state = self.execute(&job, now);
            self.save_job(&job)?;
        }

        match &job.state {
            VaultJobState::Pending => Ok(JobPoll::in_progress()),
            VaultJobState::Done {
                completed_at,
                output,
            } => {
                if now > *completed_at + self.result_retention {
                    remove_if_present(&self.job_path(job_id.as_str()))?;
                    return Ok(JobPoll::expired());
                }
                Ok(JobPoll::succeeded(output.clone()))
            }
            VaultJobState::Failed {
                completed_at,
                message,
            } => {
                if now > *completed_at + self.result_retention {
                    remove_if_present(&self.job_path(job_id.as_str()))?;
                    return Ok(JobPoll::expired());
                }
                Ok(JobPoll::failed(message.clone()))
            }
        }
    }

    fn label(&self) -> String {
        format!("dir://{}", self.root.display())
    }
}

/// Write to a temp file in the same directory, then rename into place.
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ColdchainError::Vault(format!("no parent for {}", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
