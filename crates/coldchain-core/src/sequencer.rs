use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use coldchain_types::error::Result;
use coldchain_types::{ArchiveId, ChainId};

use crate::catalog::{Archive, ArchiveCatalog};
use crate::marker::MarkerStore;

/// When to start a new chain and how deep a chain may grow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePolicy {
    pub full_interval: Duration,
    /// 0 makes every run a sealed FULL.
    pub max_incremental_level: u32,
}

/// The chain currently receiving archives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveChain {
    pub chain_id: ChainId,
    pub full_created_at: DateTime<Utc>,
    pub level: u32,
    /// The cap was reached; the next run starts a new chain.
    pub sealed: bool,
    pub last_archive_id: ArchiveId,
    pub last_created_at: DateTime<Utc>,
}

/// Explicit sequencer state, persisted inside `catalog.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainSequencer {
    #[serde(default)]
    pub active: Option<ActiveChain>,
    #[serde(default)]
    pub chain_counter: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerPhase {
    AwaitingFull,
    AccumulatingIncremental(u32),
    CycleComplete,
}

/// The archive immediately preceding a planned incremental.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorArchive {
    pub archive_id: ArchiveId,
    pub created_at: DateTime<Utc>,
}

/// What the next local run will produce.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub level: u32,
    pub chain_id: ChainId,
    pub new_chain: bool,
    pub prior_archive: Option<PriorArchive>,
    /// Previous chain closed by this run's new FULL.
    pub closes: Option<ChainId>,
    /// This run reaches the cap and seals its chain.
    pub seals: bool,
}

impl RunPlan {
    /// Chains whose marker must exist once this plan is committed.
    pub fn chains_to_mark(&self) -> Vec<ChainId> {
        let mut chains: Vec<ChainId> = self.closes.iter().cloned().collect();
        if self.seals {
            chains.push(self.chain_id.clone());
        }
        chains
    }
}

impl ChainSequencer {
    pub fn state(&self) -> SequencerPhase {
        match &self.active {
            None => SequencerPhase::AwaitingFull,
            Some(chain) if chain.sealed => SequencerPhase::CycleComplete,
            Some(chain) => SequencerPhase::AccumulatingIncremental(chain.level),
        }
    }

    /// Chain still accepting incrementals, if any.
    pub fn open_chain(&self) -> Option<&ChainId> {
        self.active
            .as_ref()
            .filter(|chain| !chain.sealed)
            .map(|chain| &chain.chain_id)
    }

    pub fn plan_next_run(&self, now: DateTime<Utc>, policy: &SequencePolicy) -> RunPlan {
        let cap = policy.max_incremental_level;
        match &self.active {
            Some(chain)
                if !chain.sealed
                    && chain.level < cap
                    && now.signed_duration_since(chain.full_created_at) < policy.full_interval =>
            {
                let level = chain.level + 1;
                RunPlan {
                    level,
                    chain_id: chain.chain_id.clone(),
                    new_chain: false,
                    prior_archive: Some(PriorArchive {
                        archive_id: chain.last_archive_id.clone(),
                        created_at: chain.last_created_at,
                    }),
                    closes: None,
                    seals: level >= cap,
                }
            }
            other => {
                let closes = other.as_ref().map(|chain| chain.chain_id.clone());
                RunPlan {
                    level: 0,
                    chain_id: self.next_chain_id(now),
                    new_chain: true,
                    prior_archive: None,
                    closes,
                    seals: cap == 0,
                }
            }
        }
    }

    fn next_chain_id(&self, now: DateTime<Utc>) -> ChainId {
        let stamp = now.format("%Y%m%dT%H%M%S").to_string();
        ChainId::sequenced(self.chain_counter + 1, &stamp)
    }

    /// Advance the state after `archive` was produced for `plan`.
    pub fn apply(&mut self, plan: &RunPlan, archive: &Archive) {
        if plan.new_chain {
            self.chain_counter += 1;
            self.active = Some(ActiveChain {
                chain_id: plan.chain_id.clone(),
                full_created_at: archive.created_at,
                level: 0,
                sealed: plan.seals,
                last_archive_id: archive.archive_id.clone(),
                last_created_at: archive.created_at,
            });
        } else if let Some(chain) = self.active.as_mut() {
            chain.level = plan.level;
            chain.sealed = plan.seals;
            chain.last_archive_id = archive.archive_id.clone();
            chain.last_created_at = archive.created_at;
        }
    }

    /// Chains that no longer accept archives.
    pub fn is_closed(&self, chain_id: &ChainId) -> bool {
        self.open_chain() != Some(chain_id)
    }
}

/// Re-create missing markers for closed chains that still have archives
/// waiting for upload. Covers a crash between the catalog commit and the
/// marker write. Returns the chains that got a marker.
pub fn heal_markers(
    sequencer: &ChainSequencer,
    catalog: &ArchiveCatalog,
    markers: &MarkerStore,
    now: DateTime<Utc>,
) -> Result<Vec<ChainId>> {
    let mut healed = Vec::new();
    for summary in catalog.chains() {
        if !sequencer.is_closed(&summary.chain_id) {
            continue;
        }
        let waiting = catalog
            .query_by_chain(&summary.chain_id)
            .iter()
            .any(|a| a.needs_upload());
        if waiting && markers.ensure(&summary.chain_id, summary.max_level, now)? {
            info!(chain_id = %summary.chain_id, "re-created missing upload marker");
            healed.push(summary.chain_id);
        }
    }
    Ok(healed)
}

/// Make sure every chain `plan` closes or seals has a marker, as long as it
/// still has archives waiting for upload. A chain whose marker was already
/// consumed is fully uploaded and is left alone.
pub fn write_plan_markers(
    plan: &RunPlan,
    catalog: &ArchiveCatalog,
    markers: &MarkerStore,
    now: DateTime<Utc>,
) -> Result<Vec<ChainId>> {
    let mut written = Vec::new();
    for chain_id in plan.chains_to_mark() {
        let members = catalog.query_by_chain(&chain_id);
        if !members.iter().any(|a| a.needs_upload()) {
            continue;
        }
        let final_level = members.iter().map(|a| a.level).max().unwrap_or(0);
        if markers.ensure(&chain_id, final_level, now)? {
            debug!(%chain_id, final_level, "upload marker written");
        }
        written.push(chain_id);
    }
    Ok(written)
}
