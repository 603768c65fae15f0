use coldchain_types::error::Result;
use coldchain_vault::{VaultClient, VaultSettings};

use crate::config::{parse_duration, ColdchainConfig};

pub fn settings_from_config(config: &ColdchainConfig) -> Result<VaultSettings> {
    Ok(VaultSettings {
        url: config.vault.url.clone(),
        access_token: config.vault.access_token.clone(),
        job_latency: parse_duration(&config.vault.job_latency)?,
        result_retention: parse_duration(&config.vault.result_retention)?,
        http_retry: config.vault.http_retry.clone(),
    })
}

/// Build the vault client named by `vault.url`.
pub fn vault_from_config(config: &ColdchainConfig) -> Result<Box<dyn VaultClient>> {
    coldchain_vault::vault_from_settings(&settings_from_config(config)?)
}
