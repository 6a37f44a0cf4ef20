//! Views derived from compact trees: flat profiles, reverse trees,
//! class/package aggregation and snapshot differences.

mod aggregate;
mod diff;
mod flat;
mod reverse;

pub use aggregate::aggregate;
pub use diff::{DiffMethodId, DiffNode, FlatDiff, FlatDiffRow, SnapshotDiff};
pub use flat::{FlatProfile, FlatRow};
pub use reverse::{ReverseNode, ReverseTree};
