use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use coldchain_types::error::{ColdchainError, Result};
use coldchain_vault::HttpRetryConfig;

use crate::ledger::{LedgerPolicy, RetryPolicy};
use crate::prune::PrunePolicy;
use crate::sequencer::SequencePolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColdchainConfig {
    /// Directory holding catalog, ledger, inventory, markers and the lock.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default)]
    pub sources: Vec<String>,
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveConfig {
    /// Where produced archives are written before upload.
    #[serde(default = "default_archive_dir")]
    pub dir: String,
    /// Shell command that writes one archive to `$COLDCHAIN_OUTPUT`.
    pub command: String,
    /// Optional post-step reading `$COLDCHAIN_INPUT`, writing `$COLDCHAIN_OUTPUT`.
    #[serde(default)]
    pub encrypt_command: Option<String>,
    #[serde(default = "default_archive_timeout")]
    pub timeout: String,
    /// Keep local archive files after their chain is fully uploaded.
    #[serde(default = "default_true")]
    pub keep_local_copies: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SequenceConfig {
    /// Age of the current FULL after which a new chain is started.
    #[serde(default = "default_full_interval")]
    pub full_interval: String,
    /// Deepest incremental level; reaching it seals the chain.
    #[serde(default = "default_max_incremental_level")]
    pub max_incremental_level: u32,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            full_interval: default_full_interval(),
            max_incremental_level: default_max_incremental_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    /// `dir:///path`, a bare path, or `http(s)://...`.
    pub url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    pub size_budget_bytes: u64,
    #[serde(default = "default_job_expiry")]
    pub job_expiry: String,
    #[serde(default = "default_inventory_interval")]
    pub inventory_interval: String,
    /// Cold vaults charge for deleting archives younger than this.
    #[serde(default)]
    pub min_retention: Option<String>,
    #[serde(default = "default_job_latency")]
    pub job_latency: String,
    #[serde(default = "default_result_retention")]
    pub result_retention: String,
    #[serde(default)]
    pub retry: JobRetryConfig,
    #[serde(default)]
    pub http_retry: HttpRetryConfig,
}

/// Cross-invocation retry of failed vault jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay: String,
    #[serde(default = "default_max_delay")]
    pub max_delay: String,
}

impl Default for JobRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

fn default_state_dir() -> String {
    "~/.coldchain".to_string()
}

fn default_archive_dir() -> String {
    "~/.coldchain/archives".to_string()
}

fn default_archive_timeout() -> String {
    "6h".to_string()
}

fn default_true() -> bool {
    true
}

fn default_full_interval() -> String {
    "7d".to_string()
}

fn default_max_incremental_level() -> u32 {
    7
}

fn default_job_expiry() -> String {
    "24h".to_string()
}

fn default_inventory_interval() -> String {
    "7d".to_string()
}

fn default_job_latency() -> String {
    "4h".to_string()
}

fn default_result_retention() -> String {
    "24h".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> String {
    "15min".to_string()
}

fn default_max_delay() -> String {
    "24h".to_string()
}

impl ColdchainConfig {
    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.state_dir)
    }

    pub fn archive_dir(&self) -> PathBuf {
        PathBuf::from(&self.archive.dir)
    }

    pub fn sequence_policy(&self) -> Result<SequencePolicy> {
        Ok(SequencePolicy {
            full_interval: parse_duration(&self.sequence.full_interval)?,
            max_incremental_level: self.sequence.max_incremental_level,
        })
    }

    pub fn ledger_policy(&self) -> Result<LedgerPolicy> {
        Ok(LedgerPolicy {
            job_expiry: parse_duration(&self.vault.job_expiry)?,
            retry: RetryPolicy {
                max_attempts: self.vault.retry.max_attempts,
                base_delay: parse_duration(&self.vault.retry.base_delay)?,
                max_delay: parse_duration(&self.vault.retry.max_delay)?,
            },
        })
    }

    pub fn prune_policy(&self) -> Result<PrunePolicy> {
        Ok(PrunePolicy {
            budget_bytes: self.vault.size_budget_bytes,
            min_retention: self
                .vault
                .min_retention
                .as_deref()
                .map(parse_duration)
                .transpose()?,
        })
    }

    pub fn inventory_interval(&self) -> Result<Duration> {
        parse_duration(&self.vault.inventory_interval)
    }

    pub fn archive_timeout(&self) -> Result<std::time::Duration> {
        let d = parse_duration(&self.archive.timeout)?;
        d.to_std()
            .map_err(|_| ColdchainError::Config(format!("invalid timeout '{}'", self.archive.timeout)))
    }

    /// Check every derived value once so that later accessors cannot fail
    /// halfway through a run.
    pub fn validate(&self) -> Result<()> {
        if self.archive.command.trim().is_empty() {
            return Err(ColdchainError::Config("archive.command must not be empty".into()));
        }
        if self.vault.size_budget_bytes == 0 {
            return Err(ColdchainError::Config(
                "vault.size_budget_bytes must be greater than zero".into(),
            ));
        }
        if self.vault.retry.max_attempts == 0 {
            return Err(ColdchainError::Config(
                "vault.retry.max_attempts must be at least 1".into(),
            ));
        }
        self.sequence_policy()?;
        let ledger = self.ledger_policy()?;
        if ledger.retry.base_delay > ledger.retry.max_delay {
            return Err(ColdchainError::Config(
                "vault.retry.base_delay exceeds vault.retry.max_delay".into(),
            ));
        }
        self.prune_policy()?;
        self.inventory_interval()?;
        self.archive_timeout()?;
        parse_duration(&self.vault.job_latency)?;
        parse_duration(&self.vault.result_retention)?;
        coldchain_vault::parse_vault_url(&self.vault.url)?;
        Ok(())
    }

    fn expand_paths(&mut self) {
        self.state_dir = expand_tilde(&self.state_dir);
        self.archive.dir = expand_tilde(&self.archive.dir);
        for source in &mut self.sources {
            *source = expand_tilde(source);
        }
        if let Some(rest) = self.vault.url.strip_prefix("dir://") {
            self.vault.url = format!("dir://{}", expand_tilde(rest));
        } else if !self.vault.url.contains("://") {
            self.vault.url = expand_tilde(&self.vault.url);
        }
    }
}

/// Parse a duration such as `90s`, `15min`, `4h`, `7d`, `2w`, `3m` (30-day
/// months) or `1y`. A bare number is a count of days.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ColdchainError::Config("empty duration string".into()));
    }

    if let Ok(n) = s.parse::<i64>() {
        return Ok(Duration::days(n));
    }

    let (num_str, suffix) = s.split_at(
        s.find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ColdchainError::Config(format!("invalid duration: '{s}'")))?,
    );
    let n: i64 = num_str
        .parse()
        .map_err(|_| ColdchainError::Config(format!("invalid duration number: '{num_str}'")))?;

    match suffix {
        "s" | "S" => Ok(Duration::seconds(n)),
        "min" | "MIN" => Ok(Duration::minutes(n)),
        "h" | "H" => Ok(Duration::hours(n)),
        "d" | "D" => Ok(Duration::days(n)),
        "w" | "W" => Ok(Duration::weeks(n)),
        "m" | "M" => Ok(Duration::days(n * 30)),
        "y" | "Y" => Ok(Duration::days(n * 365)),
        _ => Err(ColdchainError::Config(format!(
            "unknown duration suffix: '{suffix}'"
        ))),
    }
}

/// Expand a leading `~` or `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().to_string();
        }
    }
    if let Some(suffix) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(suffix).to_string_lossy().to_string();
        }
    }
    path.to_string()
}

// --- Config resolution ---

/// Tracks where the config file was found.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Explicitly passed via `--config`.
    CliArg(PathBuf),
    /// Set via the `COLDCHAIN_CONFIG` env var.
    EnvVar(PathBuf),
    /// Found by searching standard locations.
    SearchOrder { path: PathBuf, level: &'static str },
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CliArg(p) => p,
            ConfigSource::EnvVar(p) => p,
            ConfigSource::SearchOrder { path, .. } => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::CliArg(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::EnvVar(p) => write!(f, "{} (COLDCHAIN_CONFIG)", p.display()),
            ConfigSource::SearchOrder { path, level } => {
                write!(f, "{} ({})", path.display(), level)
            }
        }
    }
}

/// Returns search locations in priority order: project, user, system.
pub fn default_config_search_paths() -> Vec<(PathBuf, &'static str)> {
    let mut paths = vec![(PathBuf::from("coldchain.yaml"), "project")];

    let user_config = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|base| base.join("coldchain").join("config.yaml"));

    if let Some(p) = user_config {
        paths.push((p, "user"));
    }

    paths.push((PathBuf::from("/etc/coldchain/config.yaml"), "system"));

    paths
}

/// Resolve which config file to use.
///
/// Priority: CLI arg > `COLDCHAIN_CONFIG` env var > first existing file from
/// search paths. Returns `None` if nothing is found.
pub fn resolve_config_path(cli_config: Option<&str>) -> Option<ConfigSource> {
    if let Some(path) = cli_config {
        return Some(ConfigSource::CliArg(PathBuf::from(path)));
    }

    if let Ok(val) = std::env::var("COLDCHAIN_CONFIG") {
        if !val.is_empty() {
            return Some(ConfigSource::EnvVar(PathBuf::from(val)));
        }
    }

    for (path, level) in default_config_search_paths() {
        if path.exists() {
            return Some(ConfigSource::SearchOrder { path, level });
        }
    }

    None
}

/// Load, expand and validate a config file.
pub fn load_config(path: &Path) -> Result<ColdchainConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ColdchainError::Config(format!("cannot read '{}': {e}", path.display()))
    })?;
    parse_config(&contents)
        .map_err(|e| ColdchainError::Config(format!("invalid config '{}': {e}", path.display())))
}

/// Parse config text (already read from disk).
pub fn parse_config(contents: &str) -> Result<ColdchainConfig> {
    let mut config: ColdchainConfig =
        serde_yaml::from_str(contents).map_err(|e| ColdchainError::Config(e.to_string()))?;
    config.expand_paths();
    config.validate()?;
    Ok(config)
}

/// Returns a minimal YAML config template suitable for bootstrapping.
pub fn minimal_config_template() -> &'static str {
    r#"# coldchain configuration file

state_dir: ~/.coldchain

sources:
  - /home/user/documents

archive:
  dir: ~/.coldchain/archives
  # Writes one archive to $COLDCHAIN_OUTPUT. Incremental runs get
  # $COLDCHAIN_SINCE (RFC 3339) and $COLDCHAIN_PRIOR_ARCHIVE.
  command: >-
    tar -cjf "$COLDCHAIN_OUTPUT"
    ${COLDCHAIN_SINCE:+--newer-mtime="$COLDCHAIN_SINCE"}
    $(echo "$COLDCHAIN_SOURCES" | tr ':' ' ')
  # encrypt_command: 'gpg --batch -e -r backup -o "$COLDCHAIN_OUTPUT" "$COLDCHAIN_INPUT"'
  timeout: 6h
  keep_local_copies: true

sequence:
  full_interval: 7d
  max_incremental_level: 7

vault:
  url: dir:///srv/coldchain-vault
  # access_token: secret
  size_budget_bytes: 107374182400
  job_expiry: 24h
  inventory_interval: 7d
  # min_retention: 90d
  retry:
    max_attempts: 5
    base_delay: 15min
    max_delay: 24h
"#
}
