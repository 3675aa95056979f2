//! Pluggable behaviors of the driver: where requests go, when they are
//! retried, which hosts are used at all, and how advertised addresses
//! are reached.

pub mod address_translator;
pub mod host_filter;
pub mod host_listener;
pub mod load_balancing;
pub mod retry;
pub mod speculative_execution;
