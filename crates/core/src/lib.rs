//! Results engine for an instrumenting CPU profiler.
//!
//! Raw per-thread call events go into a [`CpuResults`], which builds one
//! calling-context tree per thread. [`CpuResults::materialize`] freezes those
//! trees into an immutable [`CpuSnapshot`] from which presentation trees,
//! flat profiles, reverse trees and diffs are derived.

pub mod builder;
pub mod compact;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod model;
pub mod persist;
pub mod presentation;
pub mod timing;
pub mod views;

pub use config::EngineConfig;
pub use context::{SessionContext, SessionStats};
pub use engine::CpuResults;
pub use error::ProfilerError;
pub use model::{CpuSnapshot, MethodTable, ThreadSelector, ViewKind};
pub use presentation::{FilterConfig, FilterMode, SortConfig, SortKey, TreeNode};
pub use timing::{TimeStream, TimingCalibration};
