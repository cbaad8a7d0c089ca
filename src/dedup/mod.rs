//! Message identity and the persistent record of what has been relayed.

pub mod fingerprint;
pub mod ledger;

pub use fingerprint::{BUCKET_MILLIS, Fingerprint, fingerprint};
pub use ledger::DedupLedger;
