//! uiprobe-core: UI stability and consistency oracle for tmuxy
//!
//! Two independent checks for a browser-rendered tmux front end:
//!
//! ```text
//! MutationSource ──► MutationTap ─┐
//!                                 ├─► classify ─► GlitchReport ─► format_timeline
//! RenderedTree ───► SizeProbe ────┘
//!
//! tmux ─► TmuxSnapshotter ─┐
//!                          ├─► ConsistencyOracle ─► ConsistencyResult
//! RenderedTree ─► DomSnapshotter ─┘
//! ```
//!
//! # Modules
//!
//! - `selector`, `dom`: element model, CSS-subset selectors, ignore lists
//! - `memory_tree`: in-process rendered tree for tests and replays
//! - `mutation_tap`, `size_probe`: raw timelines
//! - `classifier`, `timeline`: flicker / churn / size jump detection and reporting
//! - `session`: start/stop wrapper over tap and probe
//! - `snapshot`, `tmux`, `dom_snapshot`, `oracle`: authoritative vs rendered state
//! - `config`, `logging`, `retry`, `error`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod classifier;
pub mod config;
pub mod dom;
pub mod dom_snapshot;
pub mod error;
pub mod events;
pub mod logging;
pub mod memory_tree;
pub mod mutation_tap;
pub mod oracle;
pub mod retry;
pub mod selector;
pub mod session;
pub mod size_probe;
pub mod snapshot;
pub mod timeline;
pub mod tmux;

pub use classifier::{
    GlitchBudget, GlitchFinding, GlitchReport, GlitchSummary, GlitchThresholds, Recording,
    SizeMetric, classify, classify_recording,
};
pub use config::Config;
pub use dom::{Element, KeyStrategy, MutationSource, Rect, RenderedTree};
pub use dom_snapshot::{DomSnapshotConfig, DomSnapshotter};
pub use error::{Error, Result};
pub use events::{KeyPrecision, MutationEvent, MutationKind, SizeSample};
pub use memory_tree::MemoryTree;
pub use oracle::{CompareOptions, ConsistencyOracle, ConsistencyResult, Mismatch};
pub use selector::{IgnoreList, Selector};
pub use session::{GlitchOptions, GlitchSession};
pub use snapshot::{Entity, EntityKind, Geometry, Snapshot, Snapshotter};
pub use timeline::{format_summary, format_timeline};
pub use tmux::{ControlChannel, TmuxCli, TmuxSnapshotter};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
