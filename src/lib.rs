//! p3x-shepherd - process supervision and telemetry for platform tasks.
//!
//! This library implements the in-container supervisor that wraps a single
//! task invocation:
//! - `supervisor` - spawn, event loop, drain and summary
//! - `collector` - kernel process-table snapshots (`/proc`)
//! - `history` - longitudinal per-descendant process records
//! - `fifo` - lifecycle event channel from the preload library
//! - `client` - upstream named-block writer
//! - `clock` - tick conversions and the boot-time anchor

pub mod client;
pub mod clock;
pub mod collector;
pub mod fifo;
pub mod history;
pub mod supervisor;
