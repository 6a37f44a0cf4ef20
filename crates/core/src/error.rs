use callprof_protocol::{ThreadId, WireError};
use thiserror::Error;

use crate::persist::SnapshotError;

/// Errors surfaced to callers of the results engine.
///
/// Malformed or racy events are not errors: they are logged, counted in the
/// session context and dropped so ingestion keeps going.
#[derive(Debug, Error)]
pub enum ProfilerError {
    /// No thread has produced a non-empty tree yet. Try again later.
    #[error("no profiling data available yet")]
    NoDataAvailable,
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    #[error("event stream: {0}")]
    Wire(#[from] WireError),
    /// A raw buffer ended in a bad record after `processed` events were
    /// applied.
    #[error("event buffer stopped after {processed} events: {source}")]
    PartialBuffer {
        processed: usize,
        #[source]
        source: WireError,
    },
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
    #[error("invalid filter pattern: {0}")]
    InvalidFilter(#[from] regex::Error),
}
