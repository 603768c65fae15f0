use chrono::{DateTime, Utc};
use tracing::{info, warn};

use coldchain_types::error::Result;

use crate::catalog::{Archive, CatalogStore};
use crate::commands::util::with_state_lock;
use crate::config::ColdchainConfig;
use crate::marker::MarkerStore;
use crate::producer::{ArchiveProducer, PriorInput, ProduceRequest};
use crate::report::{BackupReport, Component, EventLog};
use crate::sequencer::{heal_markers, write_plan_markers, SequencePolicy};
use crate::store::StatePaths;

pub struct BackupRequest<'a> {
    pub producer: &'a dyn ArchiveProducer,
    pub now: DateTime<Utc>,
}

/// One local run: plan the level, produce the archive, commit it together
/// with the sequencer transition, then write any markers it triggers.
///
/// A producer failure aborts before anything is recorded, so the next run
/// retries the same level.
pub fn run(config: &ColdchainConfig, req: BackupRequest<'_>) -> Result<BackupReport> {
    let paths = StatePaths::new(config.state_dir());
    let policy = config.sequence_policy()?;
    with_state_lock(paths.root(), || run_locked(config, &paths, &policy, &req))
}

fn run_locked(
    config: &ColdchainConfig,
    paths: &StatePaths,
    policy: &SequencePolicy,
    req: &BackupRequest<'_>,
) -> Result<BackupReport> {
    let store = CatalogStore::new(paths.catalog());
    let markers = MarkerStore::new(paths.markers());
    let mut doc = store.load()?;
    let mut events = EventLog::default();

    let healed = heal_markers(&doc.sequencer, &doc.catalog, &markers, req.now)?;
    for chain_id in &healed {
        events.warn(
            Component::Markers,
            format!("re-created missing upload marker for chain {chain_id}"),
        );
    }

    let plan = doc.sequencer.plan_next_run(req.now, policy);
    info!(
        chain_id = %plan.chain_id,
        level = plan.level,
        new_chain = plan.new_chain,
        "planned backup run"
    );

    let prior = plan.prior_archive.as_ref().map(|p| PriorInput {
        archive_id: &p.archive_id,
        created_at: p.created_at,
        local_path: doc
            .catalog
            .get(&p.archive_id)
            .and_then(|a| a.local_path.as_deref()),
    });
    let archive_dir = config.archive_dir();
    let produced = req.producer.produce(&ProduceRequest {
        chain_id: &plan.chain_id,
        level: plan.level,
        sources: &config.sources,
        output_dir: &archive_dir,
        prior,
        now: req.now,
    })?;

    let local_path = produced.local_path.clone();
    let archive = Archive::new(
        produced.checksum,
        plan.chain_id.clone(),
        plan.level,
        req.now,
        produced.size_bytes,
        Some(produced.local_path),
    );
    let committed = doc.catalog.record(archive.clone()).and_then(|()| {
        doc.sequencer.apply(&plan, &archive);
        store.save(&doc)
    });
    if let Err(err) = committed {
        // Nothing references the file now.
        if let Err(e) = std::fs::remove_file(&local_path) {
            warn!(path = %local_path.display(), "cannot remove unrecorded archive: {e}");
        }
        return Err(err);
    }

    let marked = write_plan_markers(&plan, &doc.catalog, &markers, req.now)?;
    if let Some(closed) = &plan.closes {
        events.info(Component::Sequencer, format!("chain {closed} closed by new FULL"));
    }
    if plan.seals {
        events.info(
            Component::Sequencer,
            format!("chain {} sealed at level {}", plan.chain_id, plan.level),
        );
    }
    for chain_id in &marked {
        events.info(Component::Markers, format!("chain {chain_id} ready for upload"));
    }

    Ok(BackupReport {
        plan,
        archive,
        markers: marked,
        healed_markers: healed,
        events,
    })
}
