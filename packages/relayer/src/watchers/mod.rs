//! Source-chain watchers
//!
//! One [`EventListener`] runs per configured chain.

pub mod evm;

pub use evm::{scan_window, EventListener, ListenerConfig};
