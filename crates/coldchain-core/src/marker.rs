use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coldchain_types::error::{ColdchainError, Result};
use coldchain_types::ChainId;

use crate::store;

/// "The chain ending here is ready for upload."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub chain_id: ChainId,
    pub final_level: u32,
    pub sealed_at: DateTime<Utc>,
}

/// One JSON file per chain under `<state_dir>/markers/`.
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, chain_id: &ChainId) -> PathBuf {
        self.dir.join(format!("{}.json", chain_id.file_stem()))
    }

    pub fn exists(&self, chain_id: &ChainId) -> bool {
        self.path_for(chain_id).exists()
    }

    /// Create the marker unless it already exists. Returns whether a file
    /// was written.
    pub fn ensure(&self, chain_id: &ChainId, final_level: u32, now: DateTime<Utc>) -> Result<bool> {
        let path = self.path_for(chain_id);
        if path.exists() {
            return Ok(false);
        }
        let marker = Marker {
            chain_id: chain_id.clone(),
            final_level,
            sealed_at: now,
        };
        store::write_json_atomic(&path, &marker)?;
        Ok(true)
    }

    /// All markers, oldest chain first.
    pub fn list(&self) -> Result<Vec<Marker>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut markers = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let marker: Marker = store::read_json_optional(&path)?
                .ok_or_else(|| ColdchainError::corrupt(&path, "marker vanished while listing"))?;
            markers.push(marker);
        }
        markers.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));
        Ok(markers)
    }

    /// Delete the marker. Callers must have made the chain's UPLOADED state
    /// durable first.
    pub fn consume(&self, chain_id: &ChainId) -> Result<()> {
        match std::fs::remove_file(self.path_for(chain_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
