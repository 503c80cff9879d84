//! ChainBridge Relayer - Library interface
//!
//! Re-exports every module so integration tests can wire listeners, the
//! router and writers against in-memory chains.

pub mod api;
pub mod blockstore;
pub mod chain;
pub mod codec;
pub mod config;
pub mod contracts;
pub mod db;
pub mod errors;
pub mod hash;
pub mod metrics;
pub mod relayer;
pub mod router;
pub mod testing;
pub mod types;
pub mod watchers;
pub mod writers;
