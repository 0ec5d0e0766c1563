//! Prometheus exporter for coturn allocation and traffic events.
//!
//! coturn publishes allocation lifecycle and traffic reports to its Redis
//! statsdb. The exporter consumes them in order, keeps per-realm counters
//! and an allocation gauge, and maintains live distributions of the current
//! per-allocation transfer rates.

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod export;
pub mod gauge;
pub mod source;
pub mod tracker;
