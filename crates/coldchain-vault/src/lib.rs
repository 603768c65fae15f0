pub mod directory;
pub mod rest;
pub mod retry;

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use coldchain_types::error::{ColdchainError, Result};
use coldchain_types::JobId;

pub use directory::DirectoryVault;
pub use rest::RestVault;

/// The three asynchronous operations a cold vault exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    InventoryRetrieve,
    ArchiveUpload,
    ArchiveDelete,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::InventoryRetrieve => "inventory",
            JobKind::ArchiveUpload => "upload",
            JobKind::ArchiveDelete => "delete",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a job as reported by the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteJobStatus {
    InProgress,
    Succeeded,
    Failed,
    /// The job (or its result) is gone; vaults of this class discard output
    /// after a fixed window.
    Expired,
}

/// Result payload of a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutput {
    Inventory(InventorySnapshot),
    Uploaded { remote_archive_id: String },
    Deleted,
}

/// Answer to a single `poll_job` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPoll {
    pub status: RemoteJobStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub output: Option<JobOutput>,
}

impl JobPoll {
    pub fn in_progress() -> Self {
        Self {
            status: RemoteJobStatus::InProgress,
            message: None,
            output: None,
        }
    }

    pub fn succeeded(output: JobOutput) -> Self {
        Self {
            status: RemoteJobStatus::Succeeded,
            message: None,
            output: Some(output),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: RemoteJobStatus::Failed,
            message: Some(message.into()),
            output: None,
        }
    }

    pub fn expired() -> Self {
        Self {
            status: RemoteJobStatus::Expired,
            message: None,
            output: None,
        }
    }
}

/// Remote-authoritative listing of the vault, as of `inventory_date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub inventory_date: DateTime<Utc>,
    #[serde(default)]
    pub archives: Vec<InventoryEntry>,
}

impl InventorySnapshot {
    pub fn total_size(&self) -> u64 {
        self.archives.iter().map(|a| a.size_bytes).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub remote_archive_id: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
}

/// Client for an eventually consistent cold vault.
///
/// Every operation is a job: submission returns a handle immediately and the
/// result has to be collected by polling, usually hours later and from a
/// different process.
pub trait VaultClient: Send + Sync {
    fn submit_inventory_job(&self) -> Result<JobId>;

    fn submit_upload_job(&self, local_path: &Path, description: &str) -> Result<JobId>;

    fn submit_delete_job(&self, remote_archive_id: &str) -> Result<JobId>;

    fn poll_job(&self, job_id: &JobId) -> Result<JobPoll>;

    /// Short human-readable name used in log lines.
    fn label(&self) -> String;
}

/// In-call retry parameters for HTTP transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for HttpRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

/// Everything needed to construct a vault client.
#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub url: String,
    pub access_token: Option<String>,
    /// How long a `DirectoryVault` job takes before it completes.
    pub job_latency: Duration,
    /// How long a `DirectoryVault` keeps finished job output.
    pub result_retention: Duration,
    pub http_retry: HttpRetryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedVaultUrl {
    Directory { path: PathBuf },
    Rest { url: String },
}

/// Classify a vault URL. Bare paths and `dir://` / `file://` select the
/// directory vault; `http://` and `https://` select the REST vault.
pub fn parse_vault_url(url: &str) -> Result<ParsedVaultUrl> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ColdchainError::Config("vault url is empty".into()));
    }
    if let Some(path) = url
        .strip_prefix("dir://")
        .or_else(|| url.strip_prefix("file://"))
    {
        return Ok(ParsedVaultUrl::Directory {
            path: PathBuf::from(path),
        });
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(ParsedVaultUrl::Rest {
            url: url.to_string(),
        });
    }
    if url.contains("://") {
        return Err(ColdchainError::UnsupportedVault(url.to_string()));
    }
    Ok(ParsedVaultUrl::Directory {
        path: PathBuf::from(url),
    })
}

/// Build a vault client from settings.
pub fn vault_from_settings(settings: &VaultSettings) -> Result<Box<dyn VaultClient>> {
    match parse_vault_url(&settings.url)? {
        ParsedVaultUrl::Directory { path } => Ok(Box::new(DirectoryVault::open(
            &path,
            settings.job_latency,
            settings.result_retention,
        )?)),
        ParsedVaultUrl::Rest { url } => Ok(Box::new(RestVault::new(
            &url,
            settings.access_token.as_deref(),
            settings.http_retry.clone(),
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_directory_urls() {
        assert_eq!(
            parse_vault_url("dir:///srv/vault").unwrap(),
            ParsedVaultUrl::Directory {
                path: PathBuf::from("/srv/vault")
            }
        );
        assert_eq!(
            parse_vault_url("file:///srv/vault").unwrap(),
            ParsedVaultUrl::Directory {
                path: PathBuf::from("/srv/vault")
            }
        );
        assert_eq!(
            parse_vault_url("relative/vault").unwrap(),
            ParsedVaultUrl::Directory {
                path: PathBuf::from("relative/vault")
            }
        );
    }

    #[test]
    fn parse_rest_urls() {
        assert_eq!(
            parse_vault_url("https://vault.example.com/v1").unwrap(),
            ParsedVaultUrl::Rest {
                url: "https://vault.example.com/v1".into()
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_schemes() {
        assert!(matches!(
            parse_vault_url("s3://bucket/prefix"),
            Err(ColdchainError::UnsupportedVault(_))
        ));
        assert!(parse_vault_url("  ").is_err());
    }

    #[test]
    fn job_poll_json_shape() {
        let poll = JobPoll::succeeded(JobOutput::Uploaded {
            remote_archive_id: "r1".into(),
        });
        let json = serde_json::to_value(&poll).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["output"]["type"], "uploaded");
        assert_eq!(json["output"]["remote_archive_id"], "r1");

        let back: JobPoll = serde_json::from_value(json).unwrap();
        assert_eq!(back, poll);
    }

    #[test]
    fn inventory_output_round_trips_through_json() {
        let snapshot = InventorySnapshot {
            inventory_date: Utc::now(),
            archives: vec![InventoryEntry {
                remote_archive_id: "abc".into(),
                size_bytes: 42,
                created_at: Utc::now(),
                description: "coldchain:v1:x:c:0".into(),
            }],
        };
        let poll = JobPoll::succeeded(JobOutput::Inventory(snapshot.clone()));
        let text = serde_json::to_string(&poll).unwrap();
        let back: JobPoll = serde_json::from_str(&text).unwrap();
        assert_eq!(back.output, Some(JobOutput::Inventory(snapshot)));
    }
}
