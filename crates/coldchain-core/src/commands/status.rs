use chrono::{DateTime, Utc};

use coldchain_types::error::Result;
use coldchain_types::ChainId;
use coldchain_vault::InventorySnapshot;

use crate::catalog::{Archive, CatalogStore, ChainSummary};
use crate::config::ColdchainConfig;
use crate::ledger::{AsyncJob, JobLedger, RetryRecord};
use crate::lock::{self, LockEntry};
use crate::marker::{Marker, MarkerStore};
use crate::sequencer::{ActiveChain, SequencerPhase};
use crate::store::{self, StatePaths};

/// Used for the next-upload estimate until something has been uploaded.
pub const DEFAULT_UPLOAD_ESTIMATE: u64 = 110 * 1024 * 1024;

/// Summary of the last inventory the engine reconciled against.
#[derive(Debug, Clone, PartialEq)]
pub struct InventorySummary {
    pub inventory_date: DateTime<Utc>,
    pub archive_count: usize,
    pub total_size: u64,
}

impl From<&InventorySnapshot> for InventorySummary {
    fn from(snapshot: &InventorySnapshot) -> Self {
        Self {
            inventory_date: snapshot.inventory_date,
            archive_count: snapshot.archives.len(),
            total_size: snapshot.total_size(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub phase: SequencerPhase,
    pub active_chain: Option<ActiveChain>,
    pub chains: Vec<ChainSummary>,
    pub uploaded_bytes: u64,
    pub budget_bytes: u64,
    pub next_upload_estimate: u64,
    pub outstanding_jobs: Vec<AsyncJob>,
    pub exhausted_retries: Vec<(String, RetryRecord)>,
    pub last_inventory: Option<InventorySummary>,
    pub markers: Vec<Marker>,
    pub lock_holder: Option<LockEntry>,
}

impl StatusReport {
    /// Vault space left under the budget; zero when already over it.
    pub fn remaining_capacity(&self) -> u64 {
        self.budget_bytes.saturating_sub(self.uploaded_bytes)
    }

    /// Whether the next estimated upload still fits the budget.
    pub fn next_upload_fits(&self) -> bool {
        self.next_upload_estimate <= self.remaining_capacity()
    }
}

/// Last uploaded archive size plus 10%.
pub fn next_upload_estimate(last_uploaded: Option<&Archive>) -> u64 {
    match last_uploaded {
        Some(archive) => archive.size_bytes.saturating_mul(11) / 10,
        None => DEFAULT_UPLOAD_ESTIMATE,
    }
}

/// Read-only snapshot of the state directory. Does not take the lock.
pub fn run(config: &ColdchainConfig) -> Result<StatusReport> {
    let paths = StatePaths::new(config.state_dir());
    let doc = CatalogStore::new(paths.catalog()).load()?;
    let ledger = JobLedger::load(&paths.ledger())?;
    let inventory: Option<InventorySnapshot> = store::read_json_optional(&paths.inventory())?;
    let markers = MarkerStore::new(paths.markers()).list()?;

    Ok(StatusReport {
        phase: doc.sequencer.state(),
        active_chain: doc.sequencer.active.clone(),
        chains: doc.catalog.chains(),
        uploaded_bytes: doc.catalog.total_uploaded_size(),
        budget_bytes: config.vault.size_budget_bytes,
        next_upload_estimate: next_upload_estimate(doc.catalog.last_uploaded()),
        outstanding_jobs: ledger.outstanding().cloned().collect(),
        exhausted_retries: ledger
            .exhausted()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect(),
        last_inventory: inventory.as_ref().map(InventorySummary::from),
        markers,
        lock_holder: lock::current_holder(paths.root()),
    })
}

/// Catalog rows, optionally restricted to one chain, in creation order.
pub fn list_archives(config: &ColdchainConfig, chain: Option<&ChainId>) -> Result<Vec<Archive>> {
    let paths = StatePaths::new(config.state_dir());
    let doc = CatalogStore::new(paths.catalog()).load()?;
    let mut archives: Vec<Archive> = doc
        .catalog
        .archives()
        .iter()
        .filter(|a| chain.map_or(true, |c| &a.chain_id == c))
        .cloned()
        .collect();
    archives.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.level.cmp(&b.level))
    });
    Ok(archives)
}
