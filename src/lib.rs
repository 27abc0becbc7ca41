//! Factory deployment sync engine.
//!
//! Watches factory contracts for newly deployed instances and keeps an
//! off-chain cache of each instance's on-chain state up to date.

pub mod api;
pub mod config;
pub mod metrics;
pub mod onchain;
pub mod store;
pub mod sync;
pub mod templates;

#[cfg(test)]
pub(crate) mod testing;
