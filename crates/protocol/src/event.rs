use serde::{Deserialize, Serialize};

/// Index into the instrumented-method table. `0` is reserved for the
/// synthetic per-thread root node.
pub type MethodId = u16;

/// Profiled-application thread identifier.
pub type ThreadId = u32;

/// Method id of the synthetic thread node at the root of every tree.
pub const THREAD_METHOD_ID: MethodId = 0;

/// How the instrumentation classified the method that produced an
/// entry/exit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodType {
    Normal,
    /// Entry point of a profiled region. Root activations nest and are counted.
    Root,
    /// User-tagged method that opens a profiled region when hit outside one.
    Marker,
}

/// Raw timer readings attached to an event, in timer counts.
///
/// `cpu` is only present when the session collects thread-CPU time as well
/// as absolute time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timestamps {
    pub abs: u64,
    pub cpu: Option<u64>,
}

impl Timestamps {
    pub fn new(abs: u64, cpu: Option<u64>) -> Self {
        Self { abs, cpu }
    }

    pub fn abs_only(abs: u64) -> Self {
        Self { abs, cpu: None }
    }
}

/// Why a thread stopped running inside the current method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockReason {
    Monitor,
    Sleep,
    Wait,
    Park,
}

/// A single decoded profiling event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEvent {
    /// `stamp` is `None` for the unstamped variants.
    MethodEntry {
        thread: ThreadId,
        method: MethodId,
        kind: MethodType,
        stamp: Option<Timestamps>,
    },
    MethodExit {
        thread: ThreadId,
        method: MethodId,
        kind: MethodType,
        stamp: Option<Timestamps>,
    },
    BlockEntry {
        thread: ThreadId,
        reason: BlockReason,
        stamp: Timestamps,
    },
    BlockExit {
        thread: ThreadId,
        reason: BlockReason,
        stamp: Timestamps,
    },
    NewThread {
        thread: ThreadId,
        name: String,
    },
    /// All application threads were stopped by the profiler.
    ThreadsSuspend {
        time: u64,
    },
    ThreadsResume {
        time: u64,
    },
    /// Shift a thread's reference timestamps to hide a profiler-side pause.
    TimeAdjust {
        thread: ThreadId,
        delta: Timestamps,
    },
    ServletRequest {
        thread: ThreadId,
        kind: u8,
        path: String,
    },
}

impl CallEvent {
    /// Thread the event belongs to, or `None` for process-wide events.
    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            Self::MethodEntry { thread, .. }
            | Self::MethodExit { thread, .. }
            | Self::BlockEntry { thread, .. }
            | Self::BlockExit { thread, .. }
            | Self::NewThread { thread, .. }
            | Self::TimeAdjust { thread, .. }
            | Self::ServletRequest { thread, .. } => Some(*thread),
            Self::ThreadsSuspend { .. } | Self::ThreadsResume { .. } => None,
        }
    }

    /// Convenience constructor for a stamped entry.
    pub fn entry(thread: ThreadId, method: MethodId, kind: MethodType, stamp: Timestamps) -> Self {
        Self::MethodEntry {
            thread,
            method,
            kind,
            stamp: Some(stamp),
        }
    }

    /// Convenience constructor for a stamped exit.
    pub fn exit(thread: ThreadId, method: MethodId, kind: MethodType, stamp: Timestamps) -> Self {
        Self::MethodExit {
            thread,
            method,
            kind,
            stamp: Some(stamp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_wide_events_have_no_thread() {
        assert_eq!(CallEvent::ThreadsSuspend { time: 5 }.thread(), None);
        let e = CallEvent::entry(3, 7, MethodType::Root, Timestamps::abs_only(1));
        assert_eq!(e.thread(), Some(3));
    }

    #[test]
    fn serde_roundtrip() {
        let e = CallEvent::BlockExit {
            thread: 1,
            reason: BlockReason::Park,
            stamp: Timestamps::new(10, Some(4)),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: CallEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
