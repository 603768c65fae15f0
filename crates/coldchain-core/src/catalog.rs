use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coldchain_types::error::{ColdchainError, Result};
use coldchain_types::{ArchiveId, ChainId};

use crate::sequencer::ChainSequencer;
use crate::store;

/// Where an archive stands with respect to the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadState {
    Pending,
    Uploading,
    Uploaded,
    DeletePending,
    Deleted,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Pending => "pending",
            UploadState::Uploading => "uploading",
            UploadState::Uploaded => "uploaded",
            UploadState::DeletePending => "delete-pending",
            UploadState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One produced (or adopted) archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    pub archive_id: ArchiveId,
    /// 0 = FULL, N = incremental depth.
    pub level: u32,
    pub chain_id: ChainId,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Absent for archives adopted from the vault inventory.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    pub upload_state: UploadState,
    #[serde(default)]
    pub remote_archive_id: Option<String>,
    #[serde(default)]
    pub uploaded_at: Option<DateTime<Utc>>,
    /// Set when an upload's result was lost; the archive must not be
    /// uploaded again until an inventory at or after this instant is seen.
    #[serde(default)]
    pub awaiting_inventory_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Archive {
    pub fn new(
        archive_id: ArchiveId,
        chain_id: ChainId,
        level: u32,
        created_at: DateTime<Utc>,
        size_bytes: u64,
        local_path: Option<PathBuf>,
    ) -> Self {
        Self {
            archive_id,
            level,
            chain_id,
            created_at,
            size_bytes,
            local_path,
            upload_state: UploadState::Pending,
            remote_archive_id: None,
            uploaded_at: None,
            awaiting_inventory_since: None,
            last_error: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.level == 0
    }

    pub fn is_live(&self) -> bool {
        self.upload_state != UploadState::Deleted
    }

    /// Still needs to reach the vault.
    pub fn needs_upload(&self) -> bool {
        matches!(
            self.upload_state,
            UploadState::Pending | UploadState::Uploading
        )
    }
}

/// Aggregate view of one chain, for listing and pruning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSummary {
    pub chain_id: ChainId,
    pub full_created_at: Option<DateTime<Utc>>,
    pub archive_count: usize,
    pub max_level: u32,
    pub size_bytes: u64,
    pub status: ChainStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// At least one member still has to be uploaded.
    Pending,
    Uploaded,
    Deleting,
    Deleted,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Pending => "pending",
            ChainStatus::Uploaded => "uploaded",
            ChainStatus::Deleting => "deleting",
            ChainStatus::Deleted => "deleted",
        }
    }
}

/// Durable record of every produced archive.
///
/// Rows are append-only; only the upload fields change after `record`.
/// Chain integrity is enforced on every mutation: an incremental always has
/// a live FULL in its chain, and a FULL is deleted last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveCatalog {
    #[serde(default)]
    archives: Vec<Archive>,
}

impl ArchiveCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archives(&self) -> &[Archive] {
        &self.archives
    }

    pub fn len(&self) -> usize {
        self.archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }

    pub fn get(&self, archive_id: &ArchiveId) -> Option<&Archive> {
        self.archives.iter().find(|a| &a.archive_id == archive_id)
    }

    fn get_mut(&mut self, archive_id: &ArchiveId) -> Result<&mut Archive> {
        self.archives
            .iter_mut()
            .find(|a| &a.archive_id == archive_id)
            .ok_or_else(|| ColdchainError::ArchiveNotFound(archive_id.to_string()))
    }

    pub fn record(&mut self, archive: Archive) -> Result<()> {
        if self.get(&archive.archive_id).is_some() {
            return Err(ColdchainError::DuplicateArchive(
                archive.archive_id.as_str().to_string(),
            ));
        }
        let live_full = self.live_full(&archive.chain_id).map(|a| a.archive_id.clone());
        match (archive.is_full(), live_full) {
            (true, Some(existing)) => {
                return Err(ColdchainError::ChainIntegrity(format!(
                    "chain {} already has FULL {existing}",
                    archive.chain_id
                )))
            }
            (false, None) => {
                return Err(ColdchainError::ChainIntegrity(format!(
                    "level {} archive {} references chain {} without a live FULL",
                    archive.level, archive.archive_id, archive.chain_id
                )))
            }
            _ => {}
        }
        self.archives.push(archive);
        Ok(())
    }

    pub fn mark_uploading(&mut self, archive_id: &ArchiveId) -> Result<()> {
        let archive = self.get_mut(archive_id)?;
        match archive.upload_state {
            UploadState::Pending | UploadState::Uploading => {
                archive.upload_state = UploadState::Uploading;
                Ok(())
            }
            other => Err(ColdchainError::Other(format!(
                "cannot upload archive {archive_id} in state {other}"
            ))),
        }
    }

    /// Record a confirmed remote copy. Returns `false` when the archive was
    /// already uploaded under the same remote id.
    pub fn mark_uploaded(
        &mut self,
        archive_id: &ArchiveId,
        remote_archive_id: &str,
        uploaded_at: DateTime<Utc>,
    ) -> Result<bool> {
        let archive = self.get_mut(archive_id)?;
        match archive.upload_state {
            UploadState::Uploaded
                if archive.remote_archive_id.as_deref() == Some(remote_archive_id) =>
            {
                return Ok(false)
            }
            UploadState::Pending | UploadState::Uploading => {}
            other => {
                return Err(ColdchainError::ReconciliationConflict(format!(
                    "archive {archive_id} is {other} as {}; refusing second remote copy {remote_archive_id}",
                    archive.remote_archive_id.as_deref().unwrap_or("-")
                )))
            }
        }
        archive.upload_state = UploadState::Uploaded;
        archive.remote_archive_id = Some(remote_archive_id.to_string());
        archive.uploaded_at = Some(uploaded_at);
        archive.awaiting_inventory_since = None;
        archive.last_error = None;
        Ok(true)
    }

    /// Return an archive to PENDING, forgetting any remote copy.
    pub fn mark_pending(&mut self, archive_id: &ArchiveId, reason: Option<&str>) -> Result<()> {
        let archive = self.get_mut(archive_id)?;
        if matches!(
            archive.upload_state,
            UploadState::DeletePending | UploadState::Deleted
        ) {
            return Err(ColdchainError::ChainIntegrity(format!(
                "archive {archive_id} is {}; cannot return it to pending",
                archive.upload_state
            )));
        }
        archive.upload_state = UploadState::Pending;
        archive.remote_archive_id = None;
        archive.uploaded_at = None;
        if let Some(reason) = reason {
            archive.last_error = Some(reason.to_string());
        }
        Ok(())
    }

    /// Park an archive whose upload outcome is unknown until an inventory
    /// taken at or after `since` settles it.
    pub fn hold_for_inventory(&mut self, archive_id: &ArchiveId, since: DateTime<Utc>) -> Result<()> {
        self.mark_pending(archive_id, Some("upload result lost; waiting for vault inventory"))?;
        let archive = self.get_mut(archive_id)?;
        archive.awaiting_inventory_since = Some(since);
        Ok(())
    }

    pub fn release_hold(&mut self, archive_id: &ArchiveId) -> Result<()> {
        let archive = self.get_mut(archive_id)?;
        archive.awaiting_inventory_since = None;
        Ok(())
    }

    pub fn set_error(&mut self, archive_id: &ArchiveId, message: Option<String>) -> Result<()> {
        self.get_mut(archive_id)?.last_error = message;
        Ok(())
    }

    pub fn set_local_path(&mut self, archive_id: &ArchiveId, path: Option<PathBuf>) -> Result<()> {
        self.get_mut(archive_id)?.local_path = path;
        Ok(())
    }

    /// Move every member of a chain to DELETE_PENDING in one step.
    ///
    /// Refuses unless every live member is UPLOADED (or already staged), so
    /// a chain can never mix DELETED and UPLOADED members.
    pub fn stage_chain_deletion(&mut self, chain_id: &ChainId) -> Result<Vec<ArchiveId>> {
        let members: Vec<&Archive> = self
            .archives
            .iter()
            .filter(|a| &a.chain_id == chain_id && a.is_live())
            .collect();
        if members.is_empty() {
            return Err(ColdchainError::ChainIntegrity(format!(
                "chain {chain_id} has no live archives"
            )));
        }
        if let Some(blocker) = members.iter().find(|a| {
            !matches!(
                a.upload_state,
                UploadState::Uploaded | UploadState::DeletePending
            )
        }) {
            return Err(ColdchainError::ChainIntegrity(format!(
                "chain {chain_id} cannot be deleted: archive {} is {}",
                blocker.archive_id, blocker.upload_state
            )));
        }
        let mut staged = Vec::new();
        for archive in self
            .archives
            .iter_mut()
            .filter(|a| &a.chain_id == chain_id && a.is_live())
        {
            archive.upload_state = UploadState::DeletePending;
            staged.push(archive.archive_id.clone());
        }
        Ok(staged)
    }

    /// Confirm a remote deletion. The FULL of a chain is only accepted once
    /// every other member is DELETED.
    pub fn mark_deleted(&mut self, archive_id: &ArchiveId) -> Result<()> {
        let archive = self
            .get(archive_id)
            .ok_or_else(|| ColdchainError::ArchiveNotFound(archive_id.to_string()))?;
        match archive.upload_state {
            UploadState::Deleted => return Ok(()),
            UploadState::DeletePending => {}
            other => {
                return Err(ColdchainError::ChainIntegrity(format!(
                    "archive {archive_id} is {other}; only staged archives can be deleted"
                )))
            }
        }
        if archive.is_full() {
            let chain_id = archive.chain_id.clone();
            if let Some(dependent) = self.archives.iter().find(|a| {
                a.chain_id == chain_id && !a.is_full() && a.is_live()
            }) {
                return Err(ColdchainError::ChainIntegrity(format!(
                    "FULL {archive_id} still has live incremental {}",
                    dependent.archive_id
                )));
            }
        }
        let archive = self.get_mut(archive_id)?;
        archive.upload_state = UploadState::Deleted;
        archive.awaiting_inventory_since = None;
        archive.last_error = None;
        Ok(())
    }

    /// Members of a chain ordered by level.
    pub fn query_by_chain(&self, chain_id: &ChainId) -> Vec<&Archive> {
        let mut members: Vec<&Archive> = self
            .archives
            .iter()
            .filter(|a| &a.chain_id == chain_id)
            .collect();
        members.sort_by_key(|a| (a.level, a.created_at));
        members
    }

    pub fn total_uploaded_size(&self) -> u64 {
        self.archives
            .iter()
            .filter(|a| a.upload_state == UploadState::Uploaded)
            .map(|a| a.size_bytes)
            .sum()
    }

    /// Find the catalog entry backed by a remote copy (deleted rows included,
    /// since a lagging inventory may still list them).
    pub fn find_by_remote_id(&self, remote_archive_id: &str) -> Option<&Archive> {
        self.archives
            .iter()
            .find(|a| a.remote_archive_id.as_deref() == Some(remote_archive_id))
    }

    pub fn live_full(&self, chain_id: &ChainId) -> Option<&Archive> {
        self.archives
            .iter()
            .find(|a| &a.chain_id == chain_id && a.is_full() && a.is_live())
    }

    /// Most recently uploaded archive, used to estimate the next upload.
    pub fn last_uploaded(&self) -> Option<&Archive> {
        self.archives
            .iter()
            .filter(|a| a.upload_state == UploadState::Uploaded)
            .max_by_key(|a| a.uploaded_at)
    }

    /// Summaries of every chain, ordered by chain id.
    pub fn chains(&self) -> Vec<ChainSummary> {
        let mut grouped: BTreeMap<&ChainId, Vec<&Archive>> = BTreeMap::new();
        for archive in &self.archives {
            grouped.entry(&archive.chain_id).or_default().push(archive);
        }
        grouped
            .into_iter()
            .map(|(chain_id, members)| {
                let status = if members.iter().all(|a| !a.is_live()) {
                    ChainStatus::Deleted
                } else if members
                    .iter()
                    .any(|a| a.upload_state == UploadState::DeletePending)
                {
                    ChainStatus::Deleting
                } else if members.iter().any(|a| a.needs_upload()) {
                    ChainStatus::Pending
                } else {
                    ChainStatus::Uploaded
                };
                ChainSummary {
                    chain_id: chain_id.clone(),
                    full_created_at: members
                        .iter()
                        .filter(|a| a.is_full())
                        .map(|a| a.created_at)
                        .min(),
                    archive_count: members.len(),
                    max_level: members.iter().map(|a| a.level).max().unwrap_or(0),
                    size_bytes: members.iter().map(|a| a.size_bytes).sum(),
                    status,
                }
            })
            .collect()
    }

    /// Chains with at least one DELETE_PENDING member.
    pub fn chains_pending_deletion(&self) -> Vec<ChainId> {
        let mut ids: Vec<ChainId> = self
            .archives
            .iter()
            .filter(|a| a.upload_state == UploadState::DeletePending)
            .map(|a| a.chain_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// On-disk `catalog.json`: the catalog and the sequencer state, committed
/// together so a new archive and its chain transition land atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default = "catalog_version")]
    pub version: u32,
    #[serde(default)]
    pub catalog: ArchiveCatalog,
    #[serde(default)]
    pub sequencer: ChainSequencer,
}

impl Default for CatalogDocument {
    fn default() -> Self {
        Self {
            version: catalog_version(),
            catalog: ArchiveCatalog::default(),
            sequencer: ChainSequencer::default(),
        }
    }
}

fn catalog_version() -> u32 {
    1
}

pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document; a missing file is an empty catalog.
    pub fn load(&self) -> Result<CatalogDocument> {
        let doc: CatalogDocument = store::read_json_optional(&self.path)?.unwrap_or_default();
        if doc.version != catalog_version() {
            return Err(ColdchainError::corrupt(
                &self.path,
                format!("unsupported catalog version {}", doc.version),
            ));
        }
        Ok(doc)
    }

    pub fn save(&self, doc: &CatalogDocument) -> Result<()> {
        store::write_json_atomic(&self.path, doc)
    }
}
