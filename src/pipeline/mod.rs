//! Staged, prioritized load pipeline.
//!
//! This module provides:
//! - `StageQueue` - request deque plus worker pool for one stage
//! - `LoadRequest` / `LoadEvent` - what is asked for and what comes back
//! - `ErrorRegistry` - memo of photos that failed to load
//! - `LoadManager` - routes requests, owns caches and drives the stages
//! - `Coalescer` - collapses bursts of refresh triggers

pub mod coalesce;
pub mod errors;
pub mod manager;
pub mod request;
pub mod stage;

pub use coalesce::Coalescer;
pub use errors::ErrorRegistry;
pub use manager::{Enqueued, LoadManager, LoadManagerBuilder};
pub use request::{LoadCallback, LoadEvent, LoadRequest, VisibilityGate};
pub use stage::{StageHandler, StageQueue};
