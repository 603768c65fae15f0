use chrono::Utc;

use coldchain_core::commands::backup::{self, BackupRequest};
use coldchain_core::config::ColdchainConfig;
use coldchain_core::producer::CommandProducer;
use coldchain_core::report::RunStatus;

use crate::cmd::print_events;
use crate::format::{format_bytes, format_level};

pub(crate) fn run_backup(config: &ColdchainConfig) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let producer = CommandProducer::new(
        config.archive.command.clone(),
        config.archive.encrypt_command.clone(),
        config.archive_timeout()?,
    );
    let report = backup::run(
        config,
        BackupRequest {
            producer: &producer,
            now: Utc::now(),
        },
    )?;

    println!(
        "Archive {} written: {} of chain {} ({})",
        report.archive.archive_id.short(),
        format_level(report.archive.level),
        report.archive.chain_id,
        format_bytes(report.archive.size_bytes),
    );
    if let Some(closed) = &report.plan.closes {
        println!("Chain {closed} closed.");
    }
    if report.plan.seals {
        println!("Chain {} sealed at its level cap.", report.plan.chain_id);
    }
    for chain_id in &report.markers {
        println!("Chain {chain_id} is ready for upload.");
    }
    print_events(&report.events);
    Ok(report.status())
}
