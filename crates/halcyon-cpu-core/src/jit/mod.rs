//! Translation-engine runtime: units, cache, queue, orchestrator.

pub mod cache;
pub mod queue;
pub mod runtime;
pub mod unit;
