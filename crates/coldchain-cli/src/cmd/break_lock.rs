use coldchain_core::config::ColdchainConfig;
use coldchain_core::lock;

pub(crate) fn run_break_lock(config: &ColdchainConfig) -> Result<(), Box<dyn std::error::Error>> {
    let state_dir = config.state_dir();
    if let Some(holder) = lock::current_holder(&state_dir) {
        eprintln!(
            "Lock held by {} (pid {}) since {}",
            holder.hostname,
            holder.pid,
            holder.time.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if lock::break_lock(&state_dir)? {
        println!("Removed lock.");
    } else {
        println!("No lock found.");
    }
    Ok(())
}
