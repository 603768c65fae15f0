use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use coldchain_types::error::{ColdchainError, Result};
use coldchain_types::{ArchiveId, ChainId};
use coldchain_vault::{InventoryEntry, InventorySnapshot};

use crate::catalog::{Archive, ArchiveCatalog, UploadState};

const DESCRIPTION_PREFIX: &str = "coldchain:v1:";

/// Description attached to an upload so the remote copy can be matched back
/// to its catalog entry: `coldchain:v1:<archive_id>:<chain_id>:<level>`.
pub fn encode_description(archive: &Archive) -> String {
    format!(
        "{DESCRIPTION_PREFIX}{}:{}:{}",
        archive.archive_id.as_str(),
        archive.chain_id.as_str(),
        archive.level
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDescription {
    pub archive_id: ArchiveId,
    pub chain_id: ChainId,
    pub level: u32,
}

pub fn parse_description(description: &str) -> Option<ParsedDescription> {
    let rest = description.strip_prefix(DESCRIPTION_PREFIX)?;
    let (archive_id, rest) = rest.split_once(':')?;
    let (chain_id, level) = rest.rsplit_once(':')?;
    if archive_id.is_empty() || chain_id.is_empty() {
        return None;
    }
    Some(ParsedDescription {
        archive_id: ArchiveId::new(archive_id),
        chain_id: ChainId::new(chain_id),
        level: level.parse().ok()?,
    })
}

/// A remote archive the catalog did not know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostRecord {
    pub remote_archive_id: String,
    pub archive_id: ArchiveId,
    pub chain_id: ChainId,
    pub level: u32,
    /// Set when the ghost could not join the chain its description names.
    pub note: Option<String>,
}

/// A second remote copy of an archive that is already uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateCopy {
    pub remote_archive_id: String,
    pub archive_id: ArchiveId,
}

/// A remote archive that could not be merged into the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConflict {
    pub remote_archive_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeMismatch {
    pub archive_id: ArchiveId,
    pub catalog_size: u64,
    pub vault_size: u64,
}

/// Everything one reconciliation changed or noticed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inventory_date: DateTime<Utc>,
    /// Uploaded archives missing from the vault, now pending re-upload.
    pub orphans: Vec<ArchiveId>,
    pub orphan_chains: BTreeSet<ChainId>,
    /// Remote copies matched to catalog entries that were not yet uploaded.
    pub adopted: Vec<ArchiveId>,
    /// Remote copies recorded as new catalog entries.
    pub ghosts: Vec<GhostRecord>,
    pub duplicates: Vec<DuplicateCopy>,
    /// Remote copies left out of the catalog; the rest of the merge went ahead.
    pub conflicts: Vec<ReconcileConflict>,
    pub size_mismatches: Vec<SizeMismatch>,
    /// Lost-result uploads the inventory did not contain; free to re-upload.
    pub released_holds: Vec<ArchiveId>,
    /// Staged deletions the inventory shows as already gone.
    pub confirmed_deletions: Vec<ArchiveId>,
}

impl ReconcileReport {
    fn new(inventory_date: DateTime<Utc>) -> Self {
        Self {
            inventory_date,
            orphans: Vec::new(),
            orphan_chains: BTreeSet::new(),
            adopted: Vec::new(),
            ghosts: Vec::new(),
            duplicates: Vec::new(),
            conflicts: Vec::new(),
            size_mismatches: Vec::new(),
            released_holds: Vec::new(),
            confirmed_deletions: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty()
            && self.adopted.is_empty()
            && self.ghosts.is_empty()
            && self.duplicates.is_empty()
            && self.conflicts.is_empty()
            && self.size_mismatches.is_empty()
            && self.released_holds.is_empty()
    }
}

/// Merge a fresh inventory into the catalog.
///
/// The inventory is authoritative for anything uploaded at or before its
/// date. Uploads newer than the inventory are trusted from the catalog.
/// Local state is never deleted: missing archives go back to PENDING and
/// unknown remote copies are recorded, not removed. A remote copy that
/// cannot be merged is reported as a conflict; only errors that make local
/// state untrustworthy are returned.
pub fn reconcile(snapshot: &InventorySnapshot, catalog: &mut ArchiveCatalog) -> Result<ReconcileReport> {
    let inventory_date = snapshot.inventory_date;
    let mut report = ReconcileReport::new(inventory_date);
    let remote: HashMap<&str, &InventoryEntry> = snapshot
        .archives
        .iter()
        .map(|e| (e.remote_archive_id.as_str(), e))
        .collect();

    // Known remote copies: size check, orphans, confirmed deletions.
    let known: Vec<Archive> = catalog
        .archives()
        .iter()
        .filter(|a| a.remote_archive_id.is_some())
        .cloned()
        .collect();
    let mut gone_staged = Vec::new();
    for archive in &known {
        let Some(remote_id) = archive.remote_archive_id.as_deref() else {
            continue;
        };
        match remote.get(remote_id) {
            Some(entry) => {
                if archive.is_live() && entry.size_bytes != archive.size_bytes {
                    warn!(
                        archive_id = %archive.archive_id,
                        catalog = archive.size_bytes,
                        vault = entry.size_bytes,
                        "vault reports a different size; keeping catalog size"
                    );
                    report.size_mismatches.push(SizeMismatch {
                        archive_id: archive.archive_id.clone(),
                        catalog_size: archive.size_bytes,
                        vault_size: entry.size_bytes,
                    });
                }
            }
            None => match archive.upload_state {
                UploadState::Uploaded
                    if archive.uploaded_at.is_some_and(|t| t <= inventory_date) =>
                {
                    warn!(
                        archive_id = %archive.archive_id,
                        chain_id = %archive.chain_id,
                        remote_archive_id = remote_id,
                        "archive missing from vault inventory; scheduling re-upload"
                    );
                    catalog.mark_pending(
                        &archive.archive_id,
                        Some(&format!(
                            "missing from vault inventory of {}",
                            inventory_date.to_rfc3339()
                        )),
                    )?;
                    report.orphans.push(archive.archive_id.clone());
                    report.orphan_chains.insert(archive.chain_id.clone());
                }
                UploadState::DeletePending => gone_staged.push(archive.clone()),
                _ => {}
            },
        }
    }

    // Incrementals before their FULL.
    gone_staged.sort_by_key(|a| std::cmp::Reverse(a.level));
    for archive in gone_staged {
        if archive.is_full()
            && catalog
                .query_by_chain(&archive.chain_id)
                .iter()
                .any(|a| !a.is_full() && a.is_live())
        {
            continue;
        }
        catalog.mark_deleted(&archive.archive_id)?;
        report.confirmed_deletions.push(archive.archive_id);
    }

    // Unknown remote copies, FULLs first so incrementals can join them.
    let mut unknown: Vec<(&InventoryEntry, Option<ParsedDescription>)> = snapshot
        .archives
        .iter()
        .filter(|e| catalog.find_by_remote_id(&e.remote_archive_id).is_none())
        .map(|e| (e, parse_description(&e.description)))
        .collect();
    unknown.sort_by_key(|(e, parsed)| (parsed.as_ref().map(|p| p.level).unwrap_or(0), e.created_at));

    for (entry, parsed) in unknown {
        // The same remote id listed twice.
        if let Some(known) = catalog.find_by_remote_id(&entry.remote_archive_id) {
            report.duplicates.push(DuplicateCopy {
                remote_archive_id: entry.remote_archive_id.clone(),
                archive_id: known.archive_id.clone(),
            });
            continue;
        }
        if let Err(err) = adopt_or_record(entry, parsed, catalog, &mut report) {
            if err.is_fatal() {
                return Err(err);
            }
            warn!(
                remote_archive_id = entry.remote_archive_id.as_str(),
                "cannot merge vault archive into catalog: {err}"
            );
            report.conflicts.push(ReconcileConflict {
                remote_archive_id: entry.remote_archive_id.clone(),
                reason: conflict_reason(err),
            });
        }
    }

    // Held uploads the inventory should have contained but did not.
    let held: Vec<ArchiveId> = catalog
        .archives()
        .iter()
        .filter(|a| {
            a.upload_state == UploadState::Pending
                && a.awaiting_inventory_since.is_some_and(|since| since <= inventory_date)
        })
        .map(|a| a.archive_id.clone())
        .collect();
    for archive_id in held {
        info!(%archive_id, "lost upload not in vault inventory; releasing for re-upload");
        catalog.release_hold(&archive_id)?;
        catalog.set_error(
            &archive_id,
            Some("upload result lost and archive absent from vault inventory".into()),
        )?;
        report.released_holds.push(archive_id);
    }

    Ok(report)
}

fn adopt_or_record(
    entry: &InventoryEntry,
    parsed: Option<ParsedDescription>,
    catalog: &mut ArchiveCatalog,
    report: &mut ReconcileReport,
) -> Result<()> {
    let remote_id = entry.remote_archive_id.as_str();

    if let Some(desc) = &parsed {
        if let Some(existing) = catalog.get(&desc.archive_id) {
            if existing.needs_upload() {
                info!(
                    archive_id = %desc.archive_id,
                    remote_archive_id = remote_id,
                    "adopting remote copy of pending archive"
                );
                catalog.mark_uploaded(&desc.archive_id, remote_id, entry.created_at)?;
                report.adopted.push(desc.archive_id.clone());
            } else {
                warn!(
                    archive_id = %desc.archive_id,
                    remote_archive_id = remote_id,
                    "duplicate remote copy; leaving it in the vault"
                );
                report.duplicates.push(DuplicateCopy {
                    remote_archive_id: remote_id.to_string(),
                    archive_id: desc.archive_id.clone(),
                });
            }
            return Ok(());
        }
    }

    let (archive_id, chain_id, level, note) = match parsed {
        Some(desc) => {
            let fits = if desc.level == 0 {
                catalog.live_full(&desc.chain_id).is_none()
            } else {
                catalog
                    .live_full(&desc.chain_id)
                    .is_some_and(|full| full.upload_state != UploadState::DeletePending)
            };
            if fits {
                (desc.archive_id, desc.chain_id, desc.level, None)
            } else {
                let note = format!(
                    "level {} archive of chain {} could not join its chain; kept as standalone FULL",
                    desc.level, desc.chain_id
                );
                warn!(archive_id = %desc.archive_id, "{note}");
                let chain = ChainId::ghost(remote_id);
                (desc.archive_id, chain, 0, Some(note))
            }
        }
        None => (ArchiveId::ghost(remote_id), ChainId::ghost(remote_id), 0, None),
    };

    let mut archive = Archive::new(
        archive_id.clone(),
        chain_id.clone(),
        level,
        entry.created_at,
        entry.size_bytes,
        None,
    );
    archive.upload_state = UploadState::Uploaded;
    archive.remote_archive_id = Some(remote_id.to_string());
    archive.uploaded_at = Some(entry.created_at);
    catalog.record(archive)?;
    info!(%archive_id, %chain_id, level, remote_archive_id = remote_id, "recorded ghost archive from vault inventory");
    report.ghosts.push(GhostRecord {
        remote_archive_id: remote_id.to_string(),
        archive_id,
        chain_id,
        level,
        note,
    });
    Ok(())
}

fn conflict_reason(err: ColdchainError) -> String {
    match err {
        ColdchainError::ReconciliationConflict(reason) => reason,
        other => other.to_string(),
    }
}
