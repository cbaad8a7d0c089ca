//! SMS Relay: at-most-once relay of inbound short messages on a dual-SIM device.

pub mod channels;
pub mod config;
pub mod dedup;
pub mod error;
pub mod intake;
pub mod logging;
pub mod pipeline;
pub mod remote;
pub mod sim;
pub mod store;
