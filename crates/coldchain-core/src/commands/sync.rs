use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use coldchain_types::error::{ColdchainError, Result};
use coldchain_types::{ArchiveId, ChainId, JobId};
use coldchain_vault::{InventorySnapshot, JobKind, JobOutput, VaultClient};

use crate::catalog::{CatalogDocument, CatalogStore, UploadState};
use crate::commands::util::with_state_lock;
use crate::config::ColdchainConfig;
use crate::ledger::{retry_key, JobLedger, JobOutcome, JobRequest, JobStatus, LedgerPolicy, RetryGate};
use crate::marker::MarkerStore;
use crate::prune::{select_for_deletion, PrunePolicy};
use crate::reconcile::{encode_description, reconcile, ReconcileReport};
use crate::report::{Component, SyncReport};
use crate::store::{self, StatePaths};

pub struct SyncRequest {
    pub now: DateTime<Utc>,
    /// Forget exhausted retry records before running.
    pub retry_exhausted: bool,
}

/// Policies the engine needs, resolved from config once per run.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    pub ledger: LedgerPolicy,
    pub prune: PrunePolicy,
    pub inventory_interval: Duration,
    pub keep_local_copies: bool,
}

impl SyncPolicy {
    pub fn from_config(config: &ColdchainConfig) -> Result<Self> {
        Ok(Self {
            ledger: config.ledger_policy()?,
            prune: config.prune_policy()?,
            inventory_interval: config.inventory_interval()?,
            keep_local_copies: config.archive.keep_local_copies,
        })
    }
}

/// One sync invocation against `vault`.
pub fn run(config: &ColdchainConfig, vault: &dyn VaultClient, req: SyncRequest) -> Result<SyncReport> {
    let paths = StatePaths::new(config.state_dir());
    let policy = SyncPolicy::from_config(config)?;
    with_state_lock(paths.root(), || {
        SyncEngine::open(&paths, vault, &policy, req.now)?.run(req.retry_exhausted)
    })
}

/// Crash-safe driver of the vault state machine.
///
/// Ordering within a run: resume outstanding jobs, reconcile a fresh
/// inventory, prune, retry staged deletions, request an inventory if due,
/// submit uploads for marked chains, consume finished markers. The catalog
/// is saved before the ledger retires the jobs that changed it and before
/// any marker is consumed.
pub struct SyncEngine<'a> {
    vault: &'a dyn VaultClient,
    policy: &'a SyncPolicy,
    now: DateTime<Utc>,
    paths: StatePaths,
    catalog_store: CatalogStore,
    markers: MarkerStore,
    doc: CatalogDocument,
    ledger: JobLedger,
    last_inventory: Option<InventorySnapshot>,
    force_inventory: bool,
    report: SyncReport,
}

impl<'a> SyncEngine<'a> {
    pub fn open(
        paths: &StatePaths,
        vault: &'a dyn VaultClient,
        policy: &'a SyncPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let catalog_store = CatalogStore::new(paths.catalog());
        let doc = catalog_store.load()?;
        let ledger = JobLedger::load(&paths.ledger())?;
        let last_inventory = store::read_json_optional(&paths.inventory())?;
        Ok(Self {
            vault,
            policy,
            now,
            paths: paths.clone(),
            catalog_store,
            markers: MarkerStore::new(paths.markers()),
            doc,
            ledger,
            last_inventory,
            force_inventory: false,
            report: SyncReport::default(),
        })
    }

    pub fn run(mut self, retry_exhausted: bool) -> Result<SyncReport> {
        if retry_exhausted {
            let cleared = self.ledger.clear_exhausted();
            if cleared > 0 {
                self.report.events.info(
                    Component::Ledger,
                    format!("cleared {cleared} exhausted retry record(s)"),
                );
            }
        }

        let fresh_inventory = self.resume_jobs()?;
        self.recover_orphaned_uploads()?;
        if let Some(snapshot) = fresh_inventory {
            self.reconcile_and_prune(snapshot)?;
        }
        self.retry_staged_deletions()?;
        self.request_inventory_if_due()?;
        self.submit_uploads()?;
        self.consume_markers()?;
        self.report_exhausted();

        self.save_catalog()?;
        self.save_ledger()?;
        Ok(self.report)
    }

    fn save_catalog(&self) -> Result<()> {
        self.catalog_store.save(&self.doc)
    }

    fn save_ledger(&self) -> Result<()> {
        self.ledger.save(&self.paths.ledger())
    }

    // --- resume ---

    /// Poll every outstanding job and apply finished results to the catalog.
    /// Returns the newest inventory that arrived.
    fn resume_jobs(&mut self) -> Result<Option<InventorySnapshot>> {
        let outcomes = self.ledger.resume_all(self.vault, self.now);
        self.report.jobs_resumed = outcomes.len();

        let mut fresh: Option<InventorySnapshot> = None;
        let mut finished: Vec<JobId> = Vec::new();
        for outcome in outcomes {
            if let Some(err) = &outcome.poll_error {
                self.report.events.warn(
                    Component::Ledger,
                    format!("{} job {} could not be polled: {err}", outcome.job.kind, outcome.job.job_id),
                );
                continue;
            }
            if !outcome.job.status.is_terminal() {
                debug!(job_id = %outcome.job.job_id, status = outcome.job.status.as_str(), "job still running");
                continue;
            }
            finished.push(outcome.job.job_id.clone());
            match outcome.job.status {
                JobStatus::Succeeded => {
                    if let Some(snapshot) = self.apply_success(&outcome) {
                        if fresh
                            .as_ref()
                            .map_or(true, |f| snapshot.inventory_date > f.inventory_date)
                        {
                            fresh = Some(snapshot);
                        }
                    }
                }
                JobStatus::Failed => self.apply_failure(&outcome),
                JobStatus::Expired => self.apply_expiry(&outcome),
                JobStatus::Submitted | JobStatus::InProgress => {}
            }
        }

        // Write-ahead: results are durable in the catalog before the jobs
        // that produced them leave the ledger.
        self.save_catalog()?;
        if let Some(snapshot) = &fresh {
            store::write_json_atomic(&self.paths.inventory(), snapshot)?;
        }
        for job_id in &finished {
            self.ledger.retire(job_id);
        }
        self.save_ledger()?;
        Ok(fresh)
    }

    fn apply_success(&mut self, outcome: &JobOutcome) -> Option<InventorySnapshot> {
        let job = &outcome.job;
        let key = job.retry_key();
        match (&outcome.output, job.payload_ref.as_ref()) {
            (Some(JobOutput::Inventory(snapshot)), _) => {
                info!(
                    job_id = %job.job_id,
                    archives = snapshot.archives.len(),
                    inventory_date = %snapshot.inventory_date,
                    "vault inventory received"
                );
                self.ledger.clear_retry(&key);
                // Only uploads confirmed before the request are guaranteed to
                // be listed, so the snapshot counts as of the request.
                let mut snapshot = snapshot.clone();
                snapshot.inventory_date = snapshot.inventory_date.min(job.submitted_at);
                return Some(snapshot);
            }
            (Some(JobOutput::Uploaded { remote_archive_id }), Some(archive_id)) => {
                self.confirm_upload(archive_id, remote_archive_id);
                self.ledger.clear_retry(&key);
            }
            (Some(JobOutput::Deleted), Some(archive_id)) => {
                match self.doc.catalog.mark_deleted(archive_id) {
                    Ok(()) => {
                        info!(%archive_id, "remote deletion confirmed");
                        self.report.deletions_confirmed.push(archive_id.clone());
                    }
                    Err(e) => self.report.events.error(Component::Catalog, e.to_string()),
                }
                self.ledger.clear_retry(&key);
            }
            (output, _) => {
                self.report.events.warn(
                    Component::Ledger,
                    format!("{} job {} returned an unexpected result: {output:?}", job.kind, job.job_id),
                );
            }
        }
        None
    }

    fn confirm_upload(&mut self, archive_id: &ArchiveId, remote_archive_id: &str) {
        let Some(archive) = self.doc.catalog.get(archive_id) else {
            self.report.events.warn(
                Component::Catalog,
                format!("upload finished for unknown archive {archive_id} (remote {remote_archive_id})"),
            );
            return;
        };
        if archive.upload_state == UploadState::Uploaded
            && archive.remote_archive_id.as_deref() != Some(remote_archive_id)
        {
            self.report.events.warn(
                Component::Reconciler,
                format!(
                    "archive {archive_id} now has a second remote copy {remote_archive_id}; left in the vault"
                ),
            );
            return;
        }
        match self
            .doc
            .catalog
            .mark_uploaded(archive_id, remote_archive_id, self.now)
        {
            Ok(changed) => {
                if changed {
                    info!(%archive_id, remote_archive_id, "upload confirmed");
                    self.report.uploads_confirmed.push(archive_id.clone());
                }
            }
            Err(e) => self.report.events.warn(Component::Catalog, e.to_string()),
        }
    }

    fn apply_failure(&mut self, outcome: &JobOutcome) {
        let job = &outcome.job;
        let message = job
            .message
            .clone()
            .unwrap_or_else(|| "vault reported failure".to_string());
        let record = self.ledger.record_failure(
            &job.retry_key(),
            &message,
            self.now,
            &self.policy.ledger.retry,
        );
        if let (JobKind::ArchiveUpload, Some(archive_id)) = (job.kind, job.payload_ref.as_ref()) {
            if self
                .doc
                .catalog
                .get(archive_id)
                .is_some_and(|a| a.needs_upload())
            {
                if let Err(e) = self.doc.catalog.mark_pending(archive_id, Some(&message)) {
                    self.report.events.error(Component::Catalog, e.to_string());
                }
            }
        }
        let target = job
            .payload_ref
            .as_ref()
            .map(|a| format!(" for archive {a}"))
            .unwrap_or_default();
        if !record.exhausted {
            self.report.events.warn(
                Component::Ledger,
                format!(
                    "{} job{target} failed (attempt {}): {message}",
                    job.kind, record.attempts
                ),
            );
        }
    }

    fn apply_expiry(&mut self, outcome: &JobOutcome) {
        let job = &outcome.job;
        match (job.kind, job.payload_ref.as_ref()) {
            (JobKind::ArchiveUpload, Some(archive_id)) => {
                let needs_upload = self
                    .doc
                    .catalog
                    .get(archive_id)
                    .is_some_and(|a| a.needs_upload());
                if needs_upload {
                    // The upload may have succeeded; only an inventory can tell.
                    if let Err(e) = self.doc.catalog.hold_for_inventory(archive_id, self.now) {
                        self.report.events.error(Component::Catalog, e.to_string());
                    }
                    self.force_inventory = true;
                    self.report.events.warn(
                        Component::Ledger,
                        format!(
                            "upload job {} for archive {archive_id} expired; holding it until the next vault inventory",
                            job.job_id
                        ),
                    );
                }
            }
            (JobKind::InventoryRetrieve, _) => {
                self.force_inventory = true;
                self.report.events.warn(
                    Component::Ledger,
                    format!("inventory job {} expired; requesting a new one", job.job_id),
                );
            }
            (kind, _) => {
                self.report.events.warn(
                    Component::Ledger,
                    format!("{kind} job {} expired; it will be resubmitted", job.job_id),
                );
            }
        }
    }

    /// Archives left UPLOADING without a job: the process died between the
    /// catalog write and the ledger write, so the submission may or may not
    /// have reached the vault.
    fn recover_orphaned_uploads(&mut self) -> Result<()> {
        let stranded: Vec<ArchiveId> = self
            .doc
            .catalog
            .archives()
            .iter()
            .filter(|a| {
                a.upload_state == UploadState::Uploading
                    && self.ledger.outstanding_for(&a.archive_id).is_none()
            })
            .map(|a| a.archive_id.clone())
            .collect();
        if stranded.is_empty() {
            return Ok(());
        }
        for archive_id in &stranded {
            self.doc.catalog.hold_for_inventory(archive_id, self.now)?;
            self.report.events.warn(
                Component::Ledger,
                format!("archive {archive_id} was uploading without a job record; holding it until the next vault inventory"),
            );
        }
        self.force_inventory = true;
        self.save_catalog()
    }

    // --- reconcile + prune ---

    fn reconcile_and_prune(&mut self, snapshot: InventorySnapshot) -> Result<()> {
        let outcome = reconcile(&snapshot, &mut self.doc.catalog)?;
        self.report_reconciliation(&outcome);
        for chain_id in &outcome.orphan_chains {
            let final_level = self
                .doc
                .catalog
                .query_by_chain(chain_id)
                .iter()
                .map(|a| a.level)
                .max()
                .unwrap_or(0);
            self.markers.ensure(chain_id, final_level, self.now)?;
        }
        self.report.reconciliation = Some(outcome);
        self.last_inventory = Some(snapshot);

        let selection = select_for_deletion(
            &self.doc.catalog,
            self.doc.sequencer.open_chain(),
            &self.policy.prune,
            self.now,
        );
        for chain_id in &selection.chains {
            let staged = self.doc.catalog.stage_chain_deletion(chain_id)?;
            info!(%chain_id, archives = staged.len(), "chain staged for deletion");
            self.report.events.info(
                Component::Pruner,
                format!("chain {chain_id} staged for deletion ({} archives)", staged.len()),
            );
        }
        self.report.chains_staged_for_deletion = selection.chains.clone();
        if selection.shortfall > 0 {
            let err = ColdchainError::BudgetViolation {
                excess: selection.shortfall,
            };
            warn!("{err}");
            self.report.events.warn(Component::Pruner, err.to_string());
        }
        self.save_catalog()
    }

    fn report_reconciliation(&mut self, outcome: &ReconcileReport) {
        let events = &mut self.report.events;
        for archive_id in &outcome.orphans {
            events.warn(
                Component::Reconciler,
                format!("archive {archive_id} missing from vault; scheduled for re-upload"),
            );
        }
        for archive_id in &outcome.adopted {
            events.info(
                Component::Reconciler,
                format!("archive {archive_id} confirmed uploaded by vault inventory"),
            );
        }
        for ghost in &outcome.ghosts {
            let note = ghost.note.as_deref().map(|n| format!(" ({n})")).unwrap_or_default();
            events.warn(
                Component::Reconciler,
                format!(
                    "unknown vault archive {} recorded as {} in chain {}{note}",
                    ghost.remote_archive_id, ghost.archive_id, ghost.chain_id
                ),
            );
        }
        for dup in &outcome.duplicates {
            events.warn(
                Component::Reconciler,
                format!(
                    "vault archive {} duplicates archive {}; not deleted automatically",
                    dup.remote_archive_id, dup.archive_id
                ),
            );
        }
        for conflict in &outcome.conflicts {
            events.warn(
                Component::Reconciler,
                format!(
                    "vault archive {} left out of catalog: {}",
                    conflict.remote_archive_id, conflict.reason
                ),
            );
        }
        for mismatch in &outcome.size_mismatches {
            events.warn(
                Component::Reconciler,
                format!(
                    "archive {}: catalog size {} differs from vault size {}",
                    mismatch.archive_id, mismatch.catalog_size, mismatch.vault_size
                ),
            );
        }
        for archive_id in &outcome.released_holds {
            events.info(
                Component::Reconciler,
                format!("archive {archive_id} not in vault; released for re-upload"),
            );
        }
        for archive_id in &outcome.confirmed_deletions {
            events.info(
                Component::Reconciler,
                format!("archive {archive_id} gone from vault; deletion confirmed"),
            );
        }
    }

    // --- deletions ---

    /// Submit delete jobs for staged chains: incrementals first, the FULL
    /// only once every other member is DELETED.
    fn retry_staged_deletions(&mut self) -> Result<()> {
        for chain_id in self.doc.catalog.chains_pending_deletion() {
            let targets = self.deletion_targets(&chain_id);
            for (archive_id, remote) in targets {
                let Some(remote_archive_id) = remote else {
                    // Never reached the vault; nothing to delete remotely.
                    self.doc.catalog.mark_deleted(&archive_id)?;
                    self.report.deletions_confirmed.push(archive_id);
                    continue;
                };
                if self.ledger.outstanding_for(&archive_id).is_some() {
                    continue;
                }
                let key = retry_key(JobKind::ArchiveDelete, Some(&archive_id));
                match self.ledger.gate(&key, self.now) {
                    RetryGate::Ready => {}
                    RetryGate::Backoff(until) => {
                        debug!(%archive_id, %until, "delete in backoff");
                        continue;
                    }
                    RetryGate::Exhausted => continue,
                }
                let request = JobRequest::Delete {
                    archive_id: &archive_id,
                    remote_archive_id: &remote_archive_id,
                };
                match self
                    .ledger
                    .submit(request, self.vault, self.now, &self.policy.ledger)
                {
                    Ok(_) => self.report.deletes_submitted.push(archive_id.clone()),
                    Err(e) => self.report.events.warn(
                        Component::Ledger,
                        format!("delete of archive {archive_id} not submitted: {e}"),
                    ),
                }
                self.save_ledger()?;
            }
        }
        self.save_catalog()
    }

    fn deletion_targets(&self, chain_id: &ChainId) -> Vec<(ArchiveId, Option<String>)> {
        let staged: Vec<_> = self
            .doc
            .catalog
            .query_by_chain(chain_id)
            .into_iter()
            .filter(|a| a.upload_state == UploadState::DeletePending)
            .collect();
        let incrementals: Vec<_> = staged.iter().filter(|a| !a.is_full()).collect();
        let live_incrementals = self
            .doc
            .catalog
            .query_by_chain(chain_id)
            .iter()
            .any(|a| !a.is_full() && a.is_live());
        if !incrementals.is_empty() {
            incrementals
                .iter()
                .map(|a| (a.archive_id.clone(), a.remote_archive_id.clone()))
                .collect()
        } else if !live_incrementals {
            staged
                .iter()
                .filter(|a| a.is_full())
                .map(|a| (a.archive_id.clone(), a.remote_archive_id.clone()))
                .collect()
        } else {
            Vec::new()
        }
    }

    // --- inventory ---

    fn inventory_due(&self) -> Option<&'static str> {
        if self.force_inventory {
            return Some("previous result lost");
        }
        if self
            .doc
            .catalog
            .archives()
            .iter()
            .any(|a| a.awaiting_inventory_since.is_some())
        {
            return Some("uploads awaiting confirmation");
        }
        let Some(last) = &self.last_inventory else {
            return Some("no inventory taken yet");
        };
        if self.now.signed_duration_since(last.inventory_date) >= self.policy.inventory_interval {
            return Some("last inventory too old");
        }
        let over_budget = self.doc.catalog.total_uploaded_size() > self.policy.prune.budget_bytes;
        let newer_uploads = self
            .doc
            .catalog
            .archives()
            .iter()
            .any(|a| {
                a.upload_state == UploadState::Uploaded
                    && a.uploaded_at.is_some_and(|t| t > last.inventory_date)
            });
        if over_budget && newer_uploads {
            return Some("over budget; pruning needs a current inventory");
        }
        None
    }

    fn request_inventory_if_due(&mut self) -> Result<()> {
        if self.ledger.outstanding_inventory().is_some() {
            return Ok(());
        }
        let Some(reason) = self.inventory_due() else {
            return Ok(());
        };
        match self.ledger.gate(&retry_key(JobKind::InventoryRetrieve, None), self.now) {
            RetryGate::Ready => {}
            RetryGate::Backoff(_) | RetryGate::Exhausted => return Ok(()),
        }
        match self
            .ledger
            .submit(JobRequest::Inventory, self.vault, self.now, &self.policy.ledger)
        {
            Ok(job) => {
                info!(job_id = %job.job_id, reason, "inventory requested");
                self.report.inventory_requested = true;
            }
            Err(e) => self.report.events.warn(
                Component::Ledger,
                format!("inventory request not submitted: {e}"),
            ),
        }
        self.save_ledger()
    }

    // --- uploads ---

    fn submit_uploads(&mut self) -> Result<()> {
        for marker in self.markers.list()? {
            let candidates: Vec<(ArchiveId, Option<std::path::PathBuf>, String)> = self
                .doc
                .catalog
                .query_by_chain(&marker.chain_id)
                .into_iter()
                .filter(|a| {
                    a.upload_state == UploadState::Pending && a.awaiting_inventory_since.is_none()
                })
                .map(|a| (a.archive_id.clone(), a.local_path.clone(), encode_description(a)))
                .collect();

            for (archive_id, local_path, description) in candidates {
                if self.ledger.outstanding_for(&archive_id).is_some() {
                    continue;
                }
                let key = retry_key(JobKind::ArchiveUpload, Some(&archive_id));
                if self.ledger.gate(&key, self.now) != RetryGate::Ready {
                    continue;
                }
                let Some(path) = local_path.filter(|p| p.is_file()) else {
                    let message = "no local copy available for upload".to_string();
                    self.doc.catalog.set_error(&archive_id, Some(message.clone()))?;
                    self.report
                        .events
                        .error(Component::Catalog, format!("archive {archive_id}: {message}"));
                    continue;
                };

                // Write-ahead: a crash after submission leaves the archive
                // UPLOADING, which the next run resolves via inventory.
                self.doc.catalog.mark_uploading(&archive_id)?;
                self.save_catalog()?;
                let request = JobRequest::Upload {
                    archive_id: &archive_id,
                    local_path: &path,
                    description: &description,
                };
                match self
                    .ledger
                    .submit(request, self.vault, self.now, &self.policy.ledger)
                {
                    Ok(job) => {
                        info!(%archive_id, job_id = %job.job_id, "upload submitted");
                        self.report.uploads_submitted.push(archive_id.clone());
                        self.save_ledger()?;
                    }
                    Err(e) => {
                        self.doc
                            .catalog
                            .mark_pending(&archive_id, Some(&e.to_string()))?;
                        self.save_ledger()?;
                        self.save_catalog()?;
                        self.report.events.warn(
                            Component::Ledger,
                            format!("upload of archive {archive_id} not submitted: {e}"),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    // --- markers ---

    fn consume_markers(&mut self) -> Result<()> {
        for marker in self.markers.list()? {
            let members: Vec<ArchiveId> = self
                .doc
                .catalog
                .query_by_chain(&marker.chain_id)
                .iter()
                .map(|a| a.archive_id.clone())
                .collect();
            let done = self
                .doc
                .catalog
                .query_by_chain(&marker.chain_id)
                .iter()
                .all(|a| !a.needs_upload());
            if members.is_empty() {
                self.report.events.warn(
                    Component::Markers,
                    format!("marker for unknown chain {} removed", marker.chain_id),
                );
                self.markers.consume(&marker.chain_id)?;
                continue;
            }
            if !done {
                continue;
            }

            if !self.policy.keep_local_copies {
                for archive_id in &members {
                    self.remove_local_copy(archive_id)?;
                }
            }
            self.save_catalog()?;
            self.markers.consume(&marker.chain_id)?;
            info!(chain_id = %marker.chain_id, "chain fully uploaded; marker consumed");
            self.report.markers_consumed.push(marker.chain_id);
        }
        Ok(())
    }

    fn remove_local_copy(&mut self, archive_id: &ArchiveId) -> Result<()> {
        let Some(path) = self
            .doc
            .catalog
            .get(archive_id)
            .and_then(|a| a.local_path.clone())
        else {
            return Ok(());
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "local archive copy removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                self.report.events.warn(
                    Component::Markers,
                    format!("could not remove local copy {}: {e}", path.display()),
                );
                return Ok(());
            }
        }
        self.doc.catalog.set_local_path(archive_id, None)
    }

    fn report_exhausted(&mut self) {
        let lines: Vec<String> = self
            .ledger
            .exhausted()
            .map(|(key, record)| {
                format!(
                    "{key}: gave up after {} attempts ({}); run `coldchain sync --retry-exhausted` to try again",
                    record.attempts, record.last_error
                )
            })
            .collect();
        for line in lines {
            self.report.events.error(Component::Ledger, line);
        }
    }
}
