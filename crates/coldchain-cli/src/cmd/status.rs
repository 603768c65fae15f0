use comfy_table::Cell;

use coldchain_core::commands::status::{self, StatusReport};
use coldchain_core::config::ColdchainConfig;
use coldchain_core::sequencer::SequencerPhase;

use crate::format::{format_bytes, format_level, format_time, format_time_opt};
use crate::table::{add_kv_row, CliTableTheme};

pub(crate) fn run_status(config: &ColdchainConfig) -> Result<(), Box<dyn std::error::Error>> {
    let report = status::run(config)?;
    let theme = CliTableTheme::detect();

    let mut t1 = theme.new_kv_table();
    add_kv_row(&mut t1, theme, "Vault", &config.vault.url);
    add_kv_row(&mut t1, theme, "Sequencer", phase_label(report.phase));
    if let Some(active) = &report.active_chain {
        add_kv_row(&mut t1, theme, "Active chain", &active.chain_id);
        add_kv_row(&mut t1, theme, "Chain started", format_time(active.full_created_at));
    }
    add_kv_row(&mut t1, theme, "Uploaded", format_bytes(report.uploaded_bytes));
    add_kv_row(&mut t1, theme, "Budget", format_bytes(report.budget_bytes));
    add_kv_row(&mut t1, theme, "Remaining", format_bytes(report.remaining_capacity()));
    add_kv_row(
        &mut t1,
        theme,
        "Next upload (est.)",
        next_upload_label(&report),
    );
    let inventory = report
        .last_inventory
        .as_ref()
        .map(|inv| {
            format!(
                "{} ({} archives, {})",
                format_time(inv.inventory_date),
                inv.archive_count,
                format_bytes(inv.total_size)
            )
        })
        .unwrap_or_else(|| "-".to_string());
    add_kv_row(&mut t1, theme, "Last inventory", inventory);
    if let Some(holder) = &report.lock_holder {
        add_kv_row(
            &mut t1,
            theme,
            "Locked by",
            format!("{} (pid {}) since {}", holder.hostname, holder.pid, format_time(holder.time)),
        );
    }
    println!("{t1}");

    if !report.chains.is_empty() {
        println!();
        let mut t2 = theme.new_data_table(&["Chain", "Started", "Archives", "Depth", "Size", "State"]);
        for chain in &report.chains {
            t2.add_row(vec![
                Cell::new(&chain.chain_id),
                Cell::new(format_time_opt(chain.full_created_at)),
                Cell::new(chain.archive_count),
                Cell::new(format_level(chain.max_level)),
                Cell::new(format_bytes(chain.size_bytes)),
                Cell::new(chain.status.as_str()),
            ]);
        }
        println!("{t2}");
    }

    if !report.outstanding_jobs.is_empty() {
        println!();
        let mut t3 = theme.new_data_table(&["Job", "Kind", "Archive", "Submitted", "Expires", "Status"]);
        for job in &report.outstanding_jobs {
            t3.add_row(vec![
                Cell::new(&job.job_id),
                Cell::new(job.kind),
                Cell::new(job.payload_ref.as_ref().map_or("-", |a| a.short())),
                Cell::new(format_time(job.submitted_at)),
                Cell::new(format_time(job.expires_at)),
                Cell::new(job.status.as_str()),
            ]);
        }
        println!("{t3}");
    }

    if !report.markers.is_empty() {
        println!();
        for marker in &report.markers {
            println!(
                "Chain {} awaiting upload (final level {}, sealed {})",
                marker.chain_id,
                marker.final_level,
                format_time(marker.sealed_at)
            );
        }
    }

    for (key, record) in &report.exhausted_retries {
        eprintln!(
            "Warning: {key} gave up after {} attempts: {}",
            record.attempts, record.last_error
        );
    }
    Ok(())
}

fn phase_label(phase: SequencerPhase) -> String {
    match phase {
        SequencerPhase::AwaitingFull => "awaiting FULL".to_string(),
        SequencerPhase::AccumulatingIncremental(level) => format!("accumulating (at L{level})"),
        SequencerPhase::CycleComplete => "cycle complete".to_string(),
    }
}

fn next_upload_label(report: &StatusReport) -> String {
    let estimate = format_bytes(report.next_upload_estimate);
    if report.next_upload_fits() {
        estimate
    } else {
        format!("{estimate} (exceeds remaining budget)")
    }
}
