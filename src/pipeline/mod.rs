//! Relay pipeline.
//!
//! Every observed message, live or reconciled, flows through:
//! 1. `RelayProcessor::process()`: ledger check, SIM resolution, rule selection
//! 2. `DispatchCoordinator::dispatch()`: claim, then relay SMS and email
//! 3. `DeliveryTracker`: transport completions, then the reporting sink
//!
//! The reconciliation scanner re-enters at step 1 on its own timer.

pub mod dispatch;
pub mod processor;
pub mod rules;
pub mod scanner;
pub mod tracker;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use dispatch::DispatchCoordinator;
pub use processor::RelayProcessor;
pub use rules::{MatchPolicy, RuleMatcher};
pub use scanner::{DatabaseInbox, MessageSource, ReconciliationScanner, ScanSummary, spawn_scanner};
pub use tracker::{DeliveryTracker, delivery_channel};
