pub(crate) mod backup;
pub(crate) mod break_lock;
pub(crate) mod list;
pub(crate) mod status;
pub(crate) mod sync;

use coldchain_core::report::{EventLog, Severity};

/// Print warnings and errors to stderr; info events only with `-v`.
pub(crate) fn print_events(events: &EventLog) {
    for event in events.events() {
        match event.severity {
            Severity::Info => tracing::info!("{event}"),
            Severity::Warning => eprintln!("Warning: {event}"),
            Severity::Error => eprintln!("Error: {event}"),
        }
    }
}
