use chrono::{DateTime, Duration, Utc};

use coldchain_types::ChainId;

use crate::catalog::{ArchiveCatalog, UploadState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunePolicy {
    pub budget_bytes: u64,
    /// Members must have been uploaded at least this long ago.
    pub min_retention: Option<Duration>,
}

/// Chains chosen for deletion, oldest FULL first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneSelection {
    pub chains: Vec<ChainId>,
    pub total_before: u64,
    pub projected_total: u64,
    /// Bytes still over budget after every eligible chain was selected.
    pub shortfall: u64,
}

impl PruneSelection {
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

struct Candidate {
    chain_id: ChainId,
    full_created_at: DateTime<Utc>,
    size_bytes: u64,
}

/// Pick whole chains to delete until the uploaded total fits the budget.
///
/// A chain is eligible when every live member is UPLOADED, it is not the
/// chain still receiving incrementals, and every member satisfies the
/// minimum retention. Ties on FULL age go to the smaller chain id.
pub fn select_for_deletion(
    catalog: &ArchiveCatalog,
    open_chain: Option<&ChainId>,
    policy: &PrunePolicy,
    now: DateTime<Utc>,
) -> PruneSelection {
    let total_before = catalog.total_uploaded_size();
    let mut total = total_before;
    let mut chains = Vec::new();

    if total > policy.budget_bytes {
        let mut candidates = eligible_chains(catalog, open_chain, policy, now);
        candidates.sort_by(|a, b| {
            a.full_created_at
                .cmp(&b.full_created_at)
                .then_with(|| a.chain_id.cmp(&b.chain_id))
        });
        for candidate in candidates {
            if total <= policy.budget_bytes {
                break;
            }
            total = total.saturating_sub(candidate.size_bytes);
            chains.push(candidate.chain_id);
        }
    }

    PruneSelection {
        chains,
        total_before,
        projected_total: total,
        shortfall: total.saturating_sub(policy.budget_bytes),
    }
}

fn eligible_chains(
    catalog: &ArchiveCatalog,
    open_chain: Option<&ChainId>,
    policy: &PrunePolicy,
    now: DateTime<Utc>,
) -> Vec<Candidate> {
    let retention_cutoff = policy.min_retention.map(|d| now - d);
    catalog
        .chains()
        .into_iter()
        .filter(|summary| Some(&summary.chain_id) != open_chain)
        .filter_map(|summary| {
            let members: Vec<_> = catalog
                .query_by_chain(&summary.chain_id)
                .into_iter()
                .filter(|a| a.is_live())
                .collect();
            if members.is_empty()
                || members
                    .iter()
                    .any(|a| a.upload_state != UploadState::Uploaded)
            {
                return None;
            }
            if let Some(cutoff) = retention_cutoff {
                if members
                    .iter()
                    .any(|a| a.uploaded_at.map_or(true, |t| t > cutoff))
                {
                    return None;
                }
            }
            let full_created_at = members
                .iter()
                .find(|a| a.is_full())
                .map(|a| a.created_at)
                .or_else(|| members.iter().map(|a| a.created_at).min())?;
            Some(Candidate {
                chain_id: summary.chain_id,
                full_created_at,
                size_bytes: members.iter().map(|a| a.size_bytes).sum(),
            })
        })
        .collect()
}
