use std::fmt;

use coldchain_types::{ArchiveId, ChainId};

use crate::catalog::Archive;
use crate::reconcile::ReconcileReport;
use crate::sequencer::RunPlan;

/// Terminal status of a run, mapped by the CLI to its exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// Completed, with warnings or errors the operator should look at.
    Partial,
    Fatal,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Sequencer,
    Producer,
    Catalog,
    Ledger,
    Reconciler,
    Pruner,
    Markers,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Component::Sequencer => "sequencer",
            Component::Producer => "producer",
            Component::Catalog => "catalog",
            Component::Ledger => "ledger",
            Component::Reconciler => "reconciler",
            Component::Pruner => "pruner",
            Component::Markers => "markers",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEvent {
    pub component: Component,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.component, self.message)
    }
}

/// Ordered event list shared by backup and sync reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLog {
    events: Vec<RunEvent>,
}

impl EventLog {
    pub fn push(&mut self, component: Component, severity: Severity, message: impl Into<String>) {
        self.events.push(RunEvent {
            component,
            severity,
            message: message.into(),
        });
    }

    pub fn info(&mut self, component: Component, message: impl Into<String>) {
        self.push(component, Severity::Info, message);
    }

    pub fn warn(&mut self, component: Component, message: impl Into<String>) {
        self.push(component, Severity::Warning, message);
    }

    pub fn error(&mut self, component: Component, message: impl Into<String>) {
        self.push(component, Severity::Error, message);
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn worst(&self) -> Option<Severity> {
        self.events.iter().map(|e| e.severity).max()
    }

    pub fn status(&self) -> RunStatus {
        match self.worst() {
            Some(Severity::Warning) | Some(Severity::Error) => RunStatus::Partial,
            _ => RunStatus::Success,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub plan: RunPlan,
    pub archive: Archive,
    /// Chains whose marker exists after this run.
    pub markers: Vec<ChainId>,
    pub healed_markers: Vec<ChainId>,
    pub events: EventLog,
}

impl BackupReport {
    pub fn status(&self) -> RunStatus {
        self.events.status()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub jobs_resumed: usize,
    pub uploads_confirmed: Vec<ArchiveId>,
    pub deletions_confirmed: Vec<ArchiveId>,
    pub reconciliation: Option<ReconcileReport>,
    pub chains_staged_for_deletion: Vec<ChainId>,
    pub uploads_submitted: Vec<ArchiveId>,
    pub deletes_submitted: Vec<ArchiveId>,
    pub inventory_requested: bool,
    pub markers_consumed: Vec<ChainId>,
    pub events: EventLog,
}

impl SyncReport {
    pub fn status(&self) -> RunStatus {
        self.events.status()
    }
}
