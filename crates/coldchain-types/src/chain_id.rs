use serde::{Deserialize, Serialize};
use std::fmt;

use crate::archive_id::ghost_digest;

/// Groups a FULL archive with the incrementals that depend on it.
///
/// Sequenced ids (`c000042-20240101T030000`) sort in creation order.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        ChainId(id.into())
    }

    /// Build the id for the `counter`-th chain, stamped with a compact timestamp.
    pub fn sequenced(counter: u64, stamp: &str) -> Self {
        ChainId(format!("c{counter:06}-{stamp}"))
    }

    /// Standalone chain for a ghost archive, keyed by its full remote id.
    pub fn ghost(remote_archive_id: &str) -> Self {
        ChainId(format!("ghost-{}", ghost_digest(remote_archive_id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name-safe form used for marker files.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainId({})", self.0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequenced_ids_sort_by_counter() {
        let a = ChainId::sequenced(9, "20240101T000000");
        let b = ChainId::sequenced(10, "20230101T000000");
        assert!(a < b);
        assert_eq!(a.as_str(), "c000009-20240101T000000");
    }

    #[test]
    fn file_stem_replaces_unsafe_characters() {
        let id = ChainId::new("../evil chain");
        assert_eq!(id.file_stem(), "___evil_chain");
    }
}
