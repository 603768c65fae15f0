use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use coldchain_types::error::{ColdchainError, Result};
use coldchain_types::JobId;

use crate::retry::{with_retry, VaultHttpError};
use crate::{HttpRetryConfig, JobPoll, VaultClient};

/// HTTP vault gateway.
///
/// ```text
/// POST   {base}/jobs              {"type":"inventory-retrieval"} -> {"job_id": ..}
/// POST   {base}/archives          body = archive, X-Archive-Description -> {"job_id": ..}
/// DELETE {base}/archives/{id}     -> {"job_id": ..}
/// GET    {base}/jobs/{id}         -> JobPoll (404/410 = expired)
/// ```
pub struct RestVault {
    base_url: String,
    agent: ureq::Agent,
    token: Option<String>,
    retry: HttpRetryConfig,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

impl RestVault {
    pub fn new(base_url: &str, token: Option<&str>, retry: HttpRetryConfig) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        let base = base_url.trim_end_matches('/').to_string();
        if base.is_empty() {
            return Err(ColdchainError::Config("vault url is empty".into()));
        }

        Ok(Self {
            base_url: base,
            agent,
            token: token.map(|t| t.to_string()),
            retry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn apply_auth(&self, req: ureq::Request) -> ureq::Request {
        if let Some(ref token) = self.token {
            req.set("Authorization", &format!("Bearer {token}"))
        } else {
            req
        }
    }

    fn submit(
        &self,
        kind: &str,
        f: impl Fn() -> std::result::Result<ureq::Response, VaultHttpError>,
    ) -> Result<JobId> {
        let resp = with_retry(&self.retry, kind, || {
            let resp = f()?;
            resp.into_json::<SubmitResponse>()
                .map_err(VaultHttpError::Body)
        })
        .map_err(|e| ColdchainError::submission(kind, e))?;
        if resp.job_id.is_empty() {
            return Err(ColdchainError::submission(kind, "vault returned an empty job id"));
        }
        Ok(JobId::new(resp.job_id))
    }
}

impl VaultClient for RestVault {
    fn submit_inventory_job(&self) -> Result<JobId> {
        let url = self.url("jobs");
        self.submit("inventory", || {
            self.apply_auth(self.agent.post(&url))
                .send_json(serde_json::json!({ "type": "inventory-retrieval" }))
                .map_err(VaultHttpError::from)
        })
    }

    fn submit_upload_job(&self, local_path: &Path, description: &str) -> Result<JobId> {
        let url = self.url("archives");
        let size = std::fs::metadata(local_path)
            .map_err(|e| ColdchainError::submission("upload", format!("{}: {e}", local_path.display())))?
            .len();
        self.submit("upload", || {
            // Reopen per attempt; a half-sent body cannot be rewound.
            let file = std::fs::File::open(local_path).map_err(|e| {
                VaultHttpError::Local(format!("{}: {e}", local_path.display()))
            })?;
            self.apply_auth(self.agent.post(&url))
                .set("Content-Type", "application/octet-stream")
                .set("Content-Length", &size.to_string())
                .set("X-Archive-Description", description)
                .send(file)
                .map_err(VaultHttpError::from)
        })
    }

    fn submit_delete_job(&self, remote_archive_id: &str) -> Result<JobId> {
        let url = self.url(&format!("archives/{remote_archive_id}"));
        self.submit("delete", || {
            self.apply_auth(self.agent.delete(&url))
                .call()
                .map_err(VaultHttpError::from)
        })
    }

    fn poll_job(&self, job_id: &JobId) -> Result<JobPoll> {
        let url = self.url(&format!("jobs/{job_id}"));
        let result = with_retry(&self.retry, "poll", || {
            let resp = self
                .apply_auth(self.agent.get(&url))
                .call()
                .map_err(VaultHttpError::from)?;
            let mut buf = Vec::new();
            resp.into_reader()
                .read_to_end(&mut buf)
                .map_err(VaultHttpError::Body)?;
            Ok(buf)
        });
        match result {
            Ok(body) => serde_json::from_slice(&body)
                .map_err(|e| ColdchainError::Vault(format!("poll {job_id}: bad response: {e}"))),
            Err(e) if e.is_gone() => Ok(JobPoll::expired()),
            Err(e) => Err(ColdchainError::Vault(format!("poll {job_id}: {e}"))),
        }
    }

    fn label(&self) -> String {
        self.base_url.clone()
    }
}
