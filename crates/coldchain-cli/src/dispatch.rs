use coldchain_core::config::ColdchainConfig;
use coldchain_core::report::RunStatus;

use crate::cli::Commands;
use crate::cmd;

enum StepResult {
    Ok,
    Partial,
    Failed(String),
}

/// No command given: backup, then sync. Sync runs even when the backup
/// failed so that earlier chains keep moving.
pub(crate) fn run_default_actions(
    cfg: &ColdchainConfig,
) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let start = std::time::Instant::now();
    let mut steps: Vec<(&str, StepResult)> = Vec::new();

    eprintln!("==> Starting backup");
    steps.push(("backup", step(cmd::backup::run_backup(cfg))));

    eprintln!("==> Starting sync");
    steps.push(("sync", step(cmd::sync::run_sync(cfg, false))));

    print_summary(&steps, start)
}

fn step(result: Result<RunStatus, Box<dyn std::error::Error>>) -> StepResult {
    match result {
        Ok(RunStatus::Success) => StepResult::Ok,
        Ok(RunStatus::Partial) => StepResult::Partial,
        Ok(RunStatus::Fatal) => StepResult::Failed("fatal".into()),
        Err(e) => {
            eprintln!("Error: {e}");
            StepResult::Failed(e.to_string())
        }
    }
}

fn print_summary(
    steps: &[(&str, StepResult)],
    start: std::time::Instant,
) -> Result<RunStatus, Box<dyn std::error::Error>> {
    let elapsed = start.elapsed();
    let mut had_failure = false;
    let mut had_partial = false;

    eprintln!();
    eprintln!("=== Summary ===");
    for (name, result) in steps {
        match result {
            StepResult::Ok => eprintln!("  {name:<12} ok"),
            StepResult::Partial => {
                had_partial = true;
                eprintln!("  {name:<12} ok (with warnings)");
            }
            StepResult::Failed(e) => {
                had_failure = true;
                eprintln!("  {name:<12} FAILED: {e}");
            }
        }
    }

    let secs = elapsed.as_secs();
    let mins = secs / 60;
    let secs = secs % 60;
    if mins > 0 {
        eprintln!("  Duration:    {mins}m {secs:02}s");
    } else {
        eprintln!("  Duration:    {secs}s");
    }

    if had_failure {
        Err("one or more steps failed".into())
    } else if had_partial {
        Ok(RunStatus::Partial)
    } else {
        Ok(RunStatus::Success)
    }
}

pub(crate) fn dispatch_command(
    command: &Commands,
    cfg: &ColdchainConfig,
) -> Result<RunStatus, Box<dyn std::error::Error>> {
    match command {
        Commands::Backup => cmd::backup::run_backup(cfg),
        Commands::Sync { retry_exhausted } => cmd::sync::run_sync(cfg, *retry_exhausted),
        Commands::Status => cmd::status::run_status(cfg).map(|()| RunStatus::Success),
        Commands::List { chain } => {
            cmd::list::run_list(cfg, chain.as_deref()).map(|()| RunStatus::Success)
        }
        Commands::BreakLock => cmd::break_lock::run_break_lock(cfg).map(|()| RunStatus::Success),
        Commands::Config { .. } => {
            Err("'config' command should be handled before config resolution".into())
        }
    }
}
