use chrono::Utc;

use coldchain_core::commands::sync::{self, SyncRequest};
use coldchain_core::config::ColdchainConfig;
use coldchain_core::report::{RunStatus, SyncReport};
use coldchain_core::vault::vault_from_config;

use crate::cmd::print_events;

pub(crate) fn run_sync(
    config: &ColdchainConfig,
    retry_exhausted: bool,
) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let vault = vault_from_config(config)?;
    tracing::info!(vault = %vault.label(), "syncing");
    let report = sync::run(
        config,
        vault.as_ref(),
        SyncRequest {
            now: Utc::now(),
            retry_exhausted,
        },
    )?;

    print_summary(&report);
    print_events(&report.events);
    Ok(report.status())
}

fn print_summary(report: &SyncReport) {
    println!("Jobs resumed:         {}", report.jobs_resumed);
    println!("Uploads confirmed:    {}", report.uploads_confirmed.len());
    println!("Uploads submitted:    {}", report.uploads_submitted.len());
    println!("Deletions confirmed:  {}", report.deletions_confirmed.len());
    println!("Deletions submitted:  {}", report.deletes_submitted.len());
    if let Some(rec) = &report.reconciliation {
        println!(
            "Inventory of {}: {} orphan(s), {} adopted, {} ghost(s), {} duplicate(s), {} conflict(s)",
            rec.inventory_date.format("%Y-%m-%d %H:%M UTC"),
            rec.orphans.len(),
            rec.adopted.len(),
            rec.ghosts.len(),
            rec.duplicates.len(),
            rec.conflicts.len(),
        );
    }
    for chain_id in &report.chains_staged_for_deletion {
        println!("Chain {chain_id} staged for deletion.");
    }
    for chain_id in &report.markers_consumed {
        println!("Chain {chain_id} fully uploaded.");
    }
    if report.inventory_requested {
        println!("Vault inventory requested.");
    }
}
