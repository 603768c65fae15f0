use std::fmt;
use std::io::Read;
use std::path::Path;

use blake2::digest::consts::U32;
use blake2::digest::{Update, VariableOutput};
use blake2::{Blake2b, Blake2bVar, Digest};
use serde::{Deserialize, Serialize};

use crate::error::{ColdchainError, Result};

/// Identifier of one archive: the hex BLAKE2b-256 checksum of its content.
///
/// Archives adopted from a vault inventory without a usable description get a
/// synthetic `ghost-<hash of remote id>` id instead.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveId(String);

impl ArchiveId {
    pub fn new(id: impl Into<String>) -> Self {
        ArchiveId(id.into())
    }

    /// Build an id from raw checksum bytes.
    pub fn from_checksum(bytes: &[u8]) -> Self {
        ArchiveId(hex::encode(bytes))
    }

    /// Synthetic id for a remote archive nothing local knows about.
    ///
    /// Derived from the whole remote id, so distinct remote archives never
    /// share a ghost id.
    pub fn ghost(remote_archive_id: &str) -> Self {
        ArchiveId(format!("ghost-{}", ghost_digest(remote_archive_id)))
    }

    /// Stream a file through BLAKE2b-256 and return its id.
    pub fn checksum_file(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Blake2bVar::new(32)
            .map_err(|e| ColdchainError::Other(format!("blake2b init: {e}")))?;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let mut out = [0u8; 32];
        hasher
            .finalize_variable(&mut out)
            .map_err(|e| ColdchainError::Other(format!("blake2b finalize: {e}")))?;
        Ok(Self::from_checksum(&out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_ghost(&self) -> bool {
        self.0.starts_with("ghost-")
    }

    /// First 16 characters, for log lines and tables.
    pub fn short(&self) -> &str {
        self.0
            .char_indices()
            .nth(16)
            .map_or(&self.0[..], |(end, _)| &self.0[..end])
    }
}

/// Hex BLAKE2b-256 of a remote archive id.
pub(crate) fn ghost_digest(remote_archive_id: &str) -> String {
    hex::encode(Blake2b::<U32>::digest(remote_archive_id.as_bytes()))
}

impl fmt::Debug for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveId({})", self.short())
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}
