use thiserror::Error;

pub type Result<T> = std::result::Result<T, ColdchainError>;

#[derive(Debug, Error)]
pub enum ColdchainError {
    #[error("archive production failed: {0}")]
    ArchiveProduction(String),

    #[error("vault rejected {kind} submission: {message}")]
    Submission { kind: String, message: String },

    #[error("job {0} outlived its result window")]
    JobExpired(String),

    #[error("reconciliation conflict: {0}")]
    ReconciliationConflict(String),

    #[error("vault is {excess} bytes over budget and no chain is eligible for deletion")]
    BudgetViolation { excess: u64 },

    #[error("archive already recorded: {0}")]
    DuplicateArchive(String),

    #[error("archive not found in catalog: {0}")]
    ArchiveNotFound(String),

    #[error("chain integrity violation: {0}")]
    ChainIntegrity(String),

    #[error("job conflict: {0}")]
    JobConflict(String),

    #[error("corrupt state file '{path}': {reason}")]
    CorruptState { path: String, reason: String },

    #[error("state directory is locked by another process (lock: {0})")]
    Locked(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("vault error: {0}")]
    Vault(String),

    #[error("unsupported vault url: '{0}'")]
    UnsupportedVault(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ColdchainError {
    pub fn submission(kind: impl Into<String>, message: impl ToString) -> Self {
        ColdchainError::Submission {
            kind: kind.into(),
            message: message.to_string(),
        }
    }

    pub fn corrupt(path: &std::path::Path, reason: impl ToString) -> Self {
        ColdchainError::CorruptState {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error means local state cannot be trusted and the run must halt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ColdchainError::CorruptState { .. } | ColdchainError::Io(_) | ColdchainError::Locked(_)
        )
    }
}
