use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use coldchain_types::error::{ColdchainError, Result};
use coldchain_types::{ArchiveId, ChainId};

use crate::platform::shell;

/// Inputs for producing one archive.
#[derive(Debug, Clone)]
pub struct ProduceRequest<'a> {
    pub chain_id: &'a ChainId,
    pub level: u32,
    pub sources: &'a [String],
    pub output_dir: &'a Path,
    /// The archive this incremental builds on; `None` for a FULL.
    pub prior: Option<PriorInput<'a>>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PriorInput<'a> {
    pub archive_id: &'a ArchiveId,
    pub created_at: DateTime<Utc>,
    pub local_path: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducedArchive {
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub checksum: ArchiveId,
}

/// Writes one archive file. File selection, compression and encryption are
/// the producer's business; the sequencer only needs the finished file.
pub trait ArchiveProducer {
    fn produce(&self, request: &ProduceRequest<'_>) -> Result<ProducedArchive>;
}

/// File name for an archive: `<chain>-L<level>-<timestamp>.archive`.
pub fn archive_file_name(chain_id: &ChainId, level: u32, now: DateTime<Utc>) -> String {
    format!(
        "{}-L{level:02}-{}.archive",
        chain_id.file_stem(),
        now.format("%Y%m%dT%H%M%S")
    )
}

/// Runs `archive.command` (and optionally `archive.encrypt_command`) via `sh -c`.
pub struct CommandProducer {
    command: String,
    encrypt_command: Option<String>,
    timeout: Duration,
}

impl CommandProducer {
    pub fn new(command: impl Into<String>, encrypt_command: Option<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            encrypt_command,
            timeout,
        }
    }

    fn run_step(&self, label: &str, script: &str, env: &[(&str, String)]) -> Result<()> {
        let mut cmd = shell::command_for_script(script);
        for (key, value) in env {
            cmd.env(key, value);
        }
        let output = shell::run_command_with_timeout(&mut cmd, self.timeout)
            .map_err(|e| ColdchainError::ArchiveProduction(format!("{label}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ColdchainError::ArchiveProduction(format!(
                "{label} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        debug!(label, "archive step finished");
        Ok(())
    }
}

impl ArchiveProducer for CommandProducer {
    fn produce(&self, request: &ProduceRequest<'_>) -> Result<ProducedArchive> {
        std::fs::create_dir_all(request.output_dir).map_err(|e| {
            ColdchainError::ArchiveProduction(format!(
                "cannot create {}: {e}",
                request.output_dir.display()
            ))
        })?;
        let name = archive_file_name(request.chain_id, request.level, request.now);
        let final_path = request.output_dir.join(&name);
        let raw_path = request.output_dir.join(format!("{name}.partial"));

        let mut env = vec![
            ("COLDCHAIN_LEVEL", request.level.to_string()),
            ("COLDCHAIN_CHAIN_ID", request.chain_id.as_str().to_string()),
            ("COLDCHAIN_OUTPUT", raw_path.to_string_lossy().to_string()),
            ("COLDCHAIN_SOURCES", request.sources.join(":")),
        ];
        if let Some(prior) = &request.prior {
            env.push(("COLDCHAIN_SINCE", prior.created_at.to_rfc3339()));
            env.push((
                "COLDCHAIN_PRIOR_ARCHIVE",
                prior
                    .local_path
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_else(|| prior.archive_id.as_str().to_string()),
            ));
        }

        let result = (|| -> Result<()> {
            self.run_step("archive command", &self.command, &env)?;
            require_output(&raw_path)?;
            match &self.encrypt_command {
                Some(encrypt) => {
                    let enc_path = request.output_dir.join(format!("{name}.enc.partial"));
                    let enc_env = [
                        ("COLDCHAIN_INPUT", raw_path.to_string_lossy().to_string()),
                        ("COLDCHAIN_OUTPUT", enc_path.to_string_lossy().to_string()),
                    ];
                    let step = self
                        .run_step("encrypt command", encrypt, &enc_env)
                        .and_then(|()| require_output(&enc_path));
                    let _ = std::fs::remove_file(&raw_path);
                    if let Err(e) = step {
                        let _ = std::fs::remove_file(&enc_path);
                        return Err(e);
                    }
                    std::fs::rename(&enc_path, &final_path)?;
                }
                None => std::fs::rename(&raw_path, &final_path)?,
            }
            Ok(())
        })();
        if let Err(e) = result {
            let _ = std::fs::remove_file(&raw_path);
            return Err(match e {
                ColdchainError::ArchiveProduction(_) => e,
                other => ColdchainError::ArchiveProduction(other.to_string()),
            });
        }

        let size_bytes = std::fs::metadata(&final_path)?.len();
        let checksum = ArchiveId::checksum_file(&final_path)?;
        info!(
            chain_id = %request.chain_id,
            level = request.level,
            size_bytes,
            path = %final_path.display(),
            "archive produced"
        );
        Ok(ProducedArchive {
            local_path: final_path,
            size_bytes,
            checksum,
        })
    }
}

fn require_output(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(ColdchainError::ArchiveProduction(format!(
            "command did not write {}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request<'a>(chain: &'a ChainId, dir: &'a Path, prior: Option<PriorInput<'a>>) -> ProduceRequest<'a> {
        ProduceRequest {
            chain_id: chain,
            level: if prior.is_some() { 1 } else { 0 },
            sources: &[],
            output_dir: dir,
            prior,
            now: Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap(),
        }
    }

    #[test]
    fn command_output_becomes_the_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let chain = ChainId::new("c000001-20240301T020000");
        let producer = CommandProducer::new(
            "printf 'level=%s chain=%s' \"$COLDCHAIN_LEVEL\" \"$COLDCHAIN_CHAIN_ID\" > \"$COLDCHAIN_OUTPUT\"",
            None,
            Duration::from_secs(30),
        );
        let produced = producer.produce(&request(&chain, tmp.path(), None)).unwrap();
        assert_eq!(
            produced.local_path.file_name().unwrap().to_str().unwrap(),
            "c000001-20240301T020000-L00-20240301T020000.archive"
        );
        let content = std::fs::read_to_string(&produced.local_path).unwrap();
        assert_eq!(content, "level=0 chain=c000001-20240301T020000");
        assert_eq!(produced.size_bytes, content.len() as u64);
        assert_eq!(produced.checksum, ArchiveId::checksum_file(&produced.local_path).unwrap());
    }

    #[test]
    fn incremental_runs_see_the_prior_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let chain = ChainId::new("c1");
        let prior_id = ArchiveId::new("ab".repeat(32));
        let prior_path = tmp.path().join("prior.archive");
        let since = Utc.with_ymd_and_hms(2024, 2, 29, 2, 0, 0).unwrap();
        let producer = CommandProducer::new(
            "printf '%s|%s' \"$COLDCHAIN_SINCE\" \"$COLDCHAIN_PRIOR_ARCHIVE\" > \"$COLDCHAIN_OUTPUT\"",
            None,
            Duration::from_secs(30),
        );
        let prior = PriorInput {
            archive_id: &prior_id,
            created_at: since,
            local_path: Some(&prior_path),
        };
        let produced = producer
            .produce(&request(&chain, tmp.path(), Some(prior)))
            .unwrap();
        let content = std::fs::read_to_string(&produced.local_path).unwrap();
        assert_eq!(content, format!("{}|{}", since.to_rfc3339(), prior_path.display()));
    }

    #[test]
    fn encrypt_step_replaces_the_plain_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let chain = ChainId::new("c1");
        let producer = CommandProducer::new(
            "printf plain > \"$COLDCHAIN_OUTPUT\"",
            Some("{ printf 'enc:'; cat \"$COLDCHAIN_INPUT\"; } > \"$COLDCHAIN_OUTPUT\"".into()),
            Duration::from_secs(30),
        );
        let produced = producer.produce(&request(&chain, tmp.path(), None)).unwrap();
        assert_eq!(std::fs::read_to_string(&produced.local_path).unwrap(), "enc:plain");
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "only the final archive should remain: {leftovers:?}");
    }

    #[test]
    fn failing_command_is_archive_production_error() {
        let tmp = tempfile::tempdir().unwrap();
        let chain = ChainId::new("c1");
        let producer = CommandProducer::new("echo boom >&2; exit 2", None, Duration::from_secs(30));
        let err = producer.produce(&request(&chain, tmp.path(), None)).unwrap_err();
        match err {
            ColdchainError::ArchiveProduction(msg) => assert!(msg.contains("boom"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_output_is_archive_production_error() {
        let tmp = tempfile::tempdir().unwrap();
        let chain = ChainId::new("c1");
        let producer = CommandProducer::new("true", None, Duration::from_secs(30));
        let err = producer.produce(&request(&chain, tmp.path(), None)).unwrap_err();
        assert!(matches!(err, ColdchainError::ArchiveProduction(_)));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
