use std::fmt;
use std::time::Duration;

use crate::HttpRetryConfig;

/// Failure of one request to a REST vault.
///
/// Vault gateways answer slowly and are rate limited, so the split that
/// matters is transient versus final:
///
/// - no answer at all, or a broken body stream, is transient;
/// - `408`, `425`, `429` and any `5xx` are transient;
/// - any other status is the vault's final word on the request;
/// - `404`/`410` on a job poll mean the job result is gone (see
///   [`VaultHttpError::is_gone`]);
/// - `Local` covers problems on this side (unreadable archive file) and is
///   never retried.
#[derive(Debug)]
pub enum VaultHttpError {
    Status { code: u16, text: String },
    Transport(String),
    Body(std::io::Error),
    Local(String),
}

impl From<ureq::Error> for VaultHttpError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, resp) => VaultHttpError::Status {
                code,
                text: resp.status_text().to_string(),
            },
            ureq::Error::Transport(t) => VaultHttpError::Transport(t.to_string()),
        }
    }
}

impl VaultHttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            VaultHttpError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The vault no longer knows the job or archive addressed.
    pub fn is_gone(&self) -> bool {
        matches!(self.status(), Some(404) | Some(410))
    }

    pub fn is_transient(&self) -> bool {
        match self {
            VaultHttpError::Status { code, .. } => matches!(*code, 408 | 425 | 429 | 500..=599),
            VaultHttpError::Transport(_) => true,
            VaultHttpError::Body(e) => is_retryable_io(e),
            VaultHttpError::Local(_) => false,
        }
    }
}

impl fmt::Display for VaultHttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultHttpError::Status { code, text } => write!(f, "vault answered {code} {text}"),
            VaultHttpError::Transport(msg) => write!(f, "vault unreachable: {msg}"),
            VaultHttpError::Body(e) => write!(f, "body I/O error: {e}"),
            VaultHttpError::Local(msg) => write!(f, "{msg}"),
        }
    }
}

/// Whether an I/O error while streaming a body is worth another attempt.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

/// Doubling delays capped at `retry_max_delay_ms`, each with up to one
/// extra delay of random jitter.
struct Backoff {
    next_ms: u64,
    max_ms: u64,
}

impl Backoff {
    fn new(config: &HttpRetryConfig) -> Self {
        Self {
            next_ms: config.retry_delay_ms,
            max_ms: config.retry_max_delay_ms,
        }
    }

    /// Base delay for the next wait, before jitter.
    fn advance(&mut self) -> u64 {
        let current = self.next_ms.min(self.max_ms);
        self.next_ms = current.saturating_mul(2);
        current
    }

    fn wait(&mut self) {
        let base = self.advance();
        let jitter = rand::random::<u64>() % base.max(1);
        std::thread::sleep(Duration::from_millis(base + jitter));
    }
}

/// Send one vault request, retrying transient failures up to
/// `config.max_retries` extra times.
///
/// A final answer from the vault, including a rejected submission, goes
/// straight back to the caller; the job ledger decides what happens next.
pub fn with_retry<T>(
    config: &HttpRetryConfig,
    op_name: &str,
    f: impl Fn() -> std::result::Result<T, VaultHttpError>,
) -> std::result::Result<T, VaultHttpError> {
    let mut backoff = Backoff::new(config);
    let mut attempt = 0;
    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                tracing::warn!(
                    op = op_name,
                    attempt,
                    max_retries = config.max_retries,
                    "transient vault error, retrying: {e}"
                );
                backoff.wait();
            }
            Err(e) => return Err(e),
        }
    }
}
