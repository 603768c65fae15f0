use comfy_table::Cell;

use coldchain_core::commands::status;
use coldchain_core::config::ColdchainConfig;
use coldchain_types::ChainId;

use crate::format::{format_bytes, format_level, format_time};
use crate::table::CliTableTheme;

pub(crate) fn run_list(
    config: &ColdchainConfig,
    chain: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let chain = chain.map(ChainId::new);
    let archives = status::list_archives(config, chain.as_ref())?;
    if archives.is_empty() {
        println!("No archives found.");
        return Ok(());
    }

    let theme = CliTableTheme::detect();
    let mut table =
        theme.new_data_table(&["Archive", "Chain", "Level", "Created", "Size", "State", "Remote"]);
    for archive in &archives {
        let mut state = archive.upload_state.to_string();
        if archive.awaiting_inventory_since.is_some() {
            state.push_str(" (held)");
        }
        table.add_row(vec![
            Cell::new(archive.archive_id.short()),
            Cell::new(&archive.chain_id),
            Cell::new(format_level(archive.level)),
            Cell::new(format_time(archive.created_at)),
            Cell::new(format_bytes(archive.size_bytes)),
            Cell::new(state),
            Cell::new(archive.remote_archive_id.as_deref().unwrap_or("-")),
        ]);
    }
    println!("{table}");
    Ok(())
}
