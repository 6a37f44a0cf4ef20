pub mod call_tree;
pub mod names;
pub mod snapshot;

pub use call_tree::{CallTree, FilterStatus, InProgressNode, NodeIdx};
pub use names::{InstrumentationFilter, MethodNameResolver, MethodTable, OwnerMapping};
pub use snapshot::{ALL_THREADS_NAME, CpuSnapshot, ThreadData, ThreadSelector, ThreadTimes, ViewKind};
