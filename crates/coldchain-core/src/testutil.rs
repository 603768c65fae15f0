use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};

use coldchain_types::error::{ColdchainError, Result};
use coldchain_types::{ArchiveId, ChainId, JobId};
use coldchain_vault::{InventoryEntry, InventorySnapshot, JobKind, JobOutput, JobPoll, VaultClient};

use crate::catalog::{Archive, ArchiveCatalog, UploadState};
use crate::config::{parse_config, ColdchainConfig};
use crate::producer::{archive_file_name, ArchiveProducer, ProduceRequest, ProducedArchive};

/// Fixed test clock: 2024-01-`day` `hour`:00 UTC.
pub fn ts(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
}

pub fn aid(n: u8) -> ArchiveId {
    ArchiveId::new(format!("{n:02x}").repeat(32))
}

/// Config rooted in `dir`: state, archives and a directory vault under it.
pub fn test_config(dir: &Path) -> ColdchainConfig {
    test_config_with(dir, 2, 1_000_000)
}

pub fn test_config_with(dir: &Path, max_level: u32, budget: u64) -> ColdchainConfig {
    let yaml = format!(
        r#"
state_dir: {state}
archive:
  dir: {archives}
  command: "true"
sequence:
  full_interval: 7d
  max_incremental_level: {max_level}
vault:
  url: dir://{vault}
  size_budget_bytes: {budget}
  job_latency: 0s
  retry:
    max_attempts: 3
    base_delay: 1h
    max_delay: 4h
"#,
        state = dir.join("state").display(),
        archives = dir.join("archives").display(),
        vault = dir.join("vault").display(),
    );
    parse_config(&yaml).unwrap()
}

/// Catalog row in UPLOADED state.
pub fn uploaded(id: u8, chain: &str, level: u32, created: DateTime<Utc>, size: u64) -> Archive {
    let mut archive = Archive::new(aid(id), ChainId::new(chain), level, created, size, None);
    archive.upload_state = UploadState::Uploaded;
    archive.remote_archive_id = Some(format!("remote-{id:02x}"));
    archive.uploaded_at = Some(created);
    archive
}

pub fn catalog_of(archives: Vec<Archive>) -> ArchiveCatalog {
    let mut catalog = ArchiveCatalog::new();
    for archive in archives {
        catalog.record(archive).unwrap();
    }
    catalog
}

/// Producer writing unique content padded to `size` bytes (at least 8).
pub struct StubProducer {
    size: usize,
    counter: AtomicU64,
}

impl StubProducer {
    pub fn new() -> Self {
        Self::with_size(64)
    }

    pub fn with_size(size: usize) -> Self {
        Self {
            size,
            counter: AtomicU64::new(0),
        }
    }
}

impl ArchiveProducer for StubProducer {
    fn produce(&self, request: &ProduceRequest<'_>) -> Result<ProducedArchive> {
        std::fs::create_dir_all(request.output_dir)?;
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut content = format!("{n:08}").into_bytes();
        content.resize(self.size.max(content.len()), b'.');
        let path = request
            .output_dir
            .join(archive_file_name(request.chain_id, request.level, request.now));
        std::fs::write(&path, &content)?;
        Ok(ProducedArchive {
            size_bytes: content.len() as u64,
            checksum: ArchiveId::checksum_file(&path)?,
            local_path: path,
        })
    }
}

/// Writes the same bytes every run, as a no-change incremental might.
pub struct RepeatingProducer;

impl ArchiveProducer for RepeatingProducer {
    fn produce(&self, request: &ProduceRequest<'_>) -> Result<ProducedArchive> {
        std::fs::create_dir_all(request.output_dir)?;
        let path = request
            .output_dir
            .join(archive_file_name(request.chain_id, request.level, request.now));
        std::fs::write(&path, b"unchanged")?;
        Ok(ProducedArchive {
            size_bytes: 9,
            checksum: ArchiveId::checksum_file(&path)?,
            local_path: path,
        })
    }
}

pub struct FailingProducer;

impl ArchiveProducer for FailingProducer {
    fn produce(&self, _request: &ProduceRequest<'_>) -> Result<ProducedArchive> {
        Err(ColdchainError::ArchiveProduction("disk full".into()))
    }
}

#[derive(Debug, Clone)]
enum FakePayload {
    Inventory,
    Upload { size: u64, description: String },
    Delete { remote_archive_id: String },
}

#[derive(Debug, Clone)]
enum FakeState {
    Running,
    Done(JobOutput),
    Failed(String),
    Expired,
}

#[derive(Debug, Clone)]
struct FakeJob {
    payload: FakePayload,
    state: FakeState,
}

#[derive(Default)]
struct FakeVaultState {
    next_id: u64,
    jobs: BTreeMap<String, FakeJob>,
    archives: BTreeMap<String, InventoryEntry>,
    submit_error: Option<String>,
    uploads_submitted: usize,
    deletes_submitted: usize,
    polls: usize,
}

/// In-memory vault whose jobs finish only when a test says so.
#[derive(Default)]
pub struct FakeVault {
    state: Mutex<FakeVaultState>,
}

impl FakeVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every pending job as of `now`.
    pub fn complete_all(&self, now: DateTime<Utc>) {
        let mut st = self.state.lock().unwrap();
        let ids: Vec<String> = st
            .jobs
            .iter()
            .filter(|(_, j)| matches!(j.state, FakeState::Running))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let payload = st.jobs[&id].payload.clone();
            let output = match payload {
                FakePayload::Inventory => JobOutput::Inventory(InventorySnapshot {
                    inventory_date: now,
                    archives: st.archives.values().cloned().collect(),
                }),
                FakePayload::Upload { size, description } => {
                    st.next_id += 1;
                    let remote_archive_id = format!("vault-{:04}", st.next_id);
                    st.archives.insert(
                        remote_archive_id.clone(),
                        InventoryEntry {
                            remote_archive_id: remote_archive_id.clone(),
                            size_bytes: size,
                            created_at: now,
                            description,
                        },
                    );
                    JobOutput::Uploaded { remote_archive_id }
                }
                FakePayload::Delete { remote_archive_id } => {
                    st.archives.remove(&remote_archive_id);
                    JobOutput::Deleted
                }
            };
            if let Some(job) = st.jobs.get_mut(&id) {
                job.state = FakeState::Done(output);
            }
        }
    }

    /// Forget every job result, finished or not. Work already done stays done.
    pub fn expire_all(&self) {
        let mut st = self.state.lock().unwrap();
        for job in st.jobs.values_mut() {
            job.state = FakeState::Expired;
        }
    }

    pub fn fail_pending(&self, message: &str) {
        let mut st = self.state.lock().unwrap();
        for job in st.jobs.values_mut() {
            if matches!(job.state, FakeState::Running) {
                job.state = FakeState::Failed(message.to_string());
            }
        }
    }

    pub fn set_submit_error(&self, message: Option<&str>) {
        self.state.lock().unwrap().submit_error = message.map(str::to_string);
    }

    /// Put an archive into the vault behind the catalog's back.
    pub fn insert_archive(&self, entry: InventoryEntry) {
        let mut st = self.state.lock().unwrap();
        st.archives.insert(entry.remote_archive_id.clone(), entry);
    }

    pub fn remove_archive(&self, remote_archive_id: &str) {
        self.state.lock().unwrap().archives.remove(remote_archive_id);
    }

    pub fn archives(&self) -> Vec<InventoryEntry> {
        self.state.lock().unwrap().archives.values().cloned().collect()
    }

    pub fn uploads_submitted(&self) -> usize {
        self.state.lock().unwrap().uploads_submitted
    }

    pub fn deletes_submitted(&self) -> usize {
        self.state.lock().unwrap().deletes_submitted
    }

    pub fn polls(&self) -> usize {
        self.state.lock().unwrap().polls
    }

    fn submit(&self, payload: FakePayload) -> Result<JobId> {
        let mut st = self.state.lock().unwrap();
        if let Some(message) = &st.submit_error {
            return Err(ColdchainError::submission(kind_of(&payload).as_str(), message.clone()));
        }
        match &payload {
            FakePayload::Upload { .. } => st.uploads_submitted += 1,
            FakePayload::Delete { .. } => st.deletes_submitted += 1,
            FakePayload::Inventory => {}
        }
        st.next_id += 1;
        let job_id = format!("job-{:04}", st.next_id);
        st.jobs.insert(
            job_id.clone(),
            FakeJob {
                payload,
                state: FakeState::Running,
            },
        );
        Ok(JobId::new(job_id))
    }
}

fn kind_of(payload: &FakePayload) -> JobKind {
    match payload {
        FakePayload::Inventory => JobKind::InventoryRetrieve,
        FakePayload::Upload { .. } => JobKind::ArchiveUpload,
        FakePayload::Delete { .. } => JobKind::ArchiveDelete,
    }
}

impl VaultClient for FakeVault {
    fn submit_inventory_job(&self) -> Result<JobId> {
        self.submit(FakePayload::Inventory)
    }

    fn submit_upload_job(&self, local_path: &Path, description: &str) -> Result<JobId> {
        let size = std::fs::metadata(local_path)
            .map_err(|e| ColdchainError::submission(JobKind::ArchiveUpload.as_str(), e))?
            .len();
        self.submit(FakePayload::Upload {
            size,
            description: description.to_string(),
        })
    }

    fn submit_delete_job(&self, remote_archive_id: &str) -> Result<JobId> {
        self.submit(FakePayload::Delete {
            remote_archive_id: remote_archive_id.to_string(),
        })
    }

    fn poll_job(&self, job_id: &JobId) -> Result<JobPoll> {
        let mut st = self.state.lock().unwrap();
        st.polls += 1;
        Ok(match st.jobs.get(job_id.as_str()).map(|j| &j.state) {
            None | Some(FakeState::Expired) => JobPoll::expired(),
            Some(FakeState::Running) => JobPoll::in_progress(),
            Some(FakeState::Done(output)) => JobPoll::succeeded(output.clone()),
            Some(FakeState::Failed(message)) => JobPoll::failed(message.clone()),
        })
    }

    fn label(&self) -> String {
        "fake".to_string()
    }
}
