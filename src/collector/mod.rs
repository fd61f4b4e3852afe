//! Kernel process-table access for the shepherd.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                SnapshotSource                 │
//! │   /proc enumeration → SystemProcessState      │
//! │   (pid → PidInfo, ppid → children index)      │
//! │                      │                        │
//! │               ┌──────▼──────┐                 │
//! │               │  FileSystem │ (trait)         │
//! │               └──────┬──────┘                 │
//! └──────────────────────┼────────────────────────┘
//!                ┌───────┴───────┐
//!         ┌──────▼──────┐ ┌──────▼──────┐
//!         │   RealFs    │ │   MockFs    │
//!         │  (Linux)    │ │  (testing)  │
//!         └─────────────┘ └─────────────┘
//! ```
//!
//! Parsing of the `/proc` text formats lives in [`parser`] as pure
//! string-in functions.

pub mod mock;
pub mod parser;
pub mod snapshot;
pub mod traits;

pub use mock::{MockFs, SharedFs};
pub use parser::ParseError;
pub use snapshot::{PidInfo, SnapshotSource, SystemProcessState};
pub use traits::{FileSystem, RealFs};
