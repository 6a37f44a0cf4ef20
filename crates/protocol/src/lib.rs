//! Vocabulary shared between a profiling agent and the callprof results engine.
//!
//! The agent delivers raw event buffers; [`wire::EventDecoder`] turns them into
//! [`CallEvent`]s that the engine's call graph builder consumes.

pub mod event;
pub mod names;
pub mod shared_str;
pub mod wire;

pub use event::{BlockReason, CallEvent, MethodId, MethodType, ThreadId, Timestamps, THREAD_METHOD_ID};
pub use names::MethodName;
pub use shared_str::SharedStr;
pub use wire::{EventDecoder, EventEncoder, WireError};
