//! fluxblox: block sync and indexing pipeline.
//!
//! Pulls verbose blocks from a node daemon, derives the utxo, address,
//! collateral, app payment and governance collections into RocksDB, and
//! rolls them back on reorgs or failures.

pub mod admin;
pub mod api;
pub mod apps;
pub mod atomic_writer;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod db_handles;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod processor;
pub mod restore;
pub mod script_utils;
pub mod sender;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod test_support;
