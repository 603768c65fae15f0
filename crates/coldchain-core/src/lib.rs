pub mod catalog;
pub mod commands;
pub mod config;
pub mod ledger;
pub mod lock;
pub mod marker;
pub mod platform;
pub mod producer;
pub mod prune;
pub mod reconcile;
pub mod report;
pub mod sequencer;
pub mod store;
pub mod vault;

pub use coldchain_types::error;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
