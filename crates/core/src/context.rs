use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Informational counters for one profiling session.
///
/// Shared by reference with every component that reports into it, so the
/// counters need no lock of their own.
#[derive(Debug, Default)]
pub struct SessionContext {
    events: AtomicU64,
    ignored_events: AtomicU64,
    unknown_tags: AtomicU64,
    malformed_strings: AtomicU64,
    dropped_children: AtomicU64,
    stack_mismatches: AtomicU64,
    bounds_errors: AtomicU64,
    injected_code_micros: AtomicU64,
    clamped_nodes: AtomicU64,
    clamped_micros: AtomicU64,
}

/// Point-in-time copy of [`SessionContext`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub events: u64,
    /// Events that arrived in a state where they carry no meaning, e.g. a
    /// normal entry outside any root method or an event for an unseen thread.
    pub ignored_events: u64,
    pub unknown_tags: u64,
    /// Thread names or servlet paths that were not valid UTF-8.
    pub malformed_strings: u64,
    /// Children beyond the per-node limit of a compact tree.
    pub dropped_children: u64,
    pub stack_mismatches: u64,
    pub bounds_errors: u64,
    /// Instrumentation overhead removed while cleansing, in microseconds.
    pub injected_code_micros: u64,
    /// Nodes whose cleansed self time went negative and was clamped to zero.
    pub clamped_nodes: u64,
    /// Total magnitude clamped away, in microseconds.
    pub clamped_micros: u64,
}

macro_rules! counter {
    ($add:ident, $field:ident) => {
        pub fn $add(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(add_events, events);
    counter!(add_ignored_events, ignored_events);
    counter!(add_unknown_tags, unknown_tags);
    counter!(add_malformed_strings, malformed_strings);
    counter!(add_dropped_children, dropped_children);
    counter!(add_stack_mismatches, stack_mismatches);
    counter!(add_bounds_errors, bounds_errors);
    counter!(add_injected_code_micros, injected_code_micros);
    counter!(add_clamped_nodes, clamped_nodes);
    counter!(add_clamped_micros, clamped_micros);

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            events: self.events.load(Ordering::Relaxed),
            ignored_events: self.ignored_events.load(Ordering::Relaxed),
            unknown_tags: self.unknown_tags.load(Ordering::Relaxed),
            malformed_strings: self.malformed_strings.load(Ordering::Relaxed),
            dropped_children: self.dropped_children.load(Ordering::Relaxed),
            stack_mismatches: self.stack_mismatches.load(Ordering::Relaxed),
            bounds_errors: self.bounds_errors.load(Ordering::Relaxed),
            injected_code_micros: self.injected_code_micros.load(Ordering::Relaxed),
            clamped_nodes: self.clamped_nodes.load(Ordering::Relaxed),
            clamped_micros: self.clamped_micros.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for c in [
            &self.events,
            &self.ignored_events,
            &self.unknown_tags,
            &self.malformed_strings,
            &self.dropped_children,
            &self.stack_mismatches,
            &self.bounds_errors,
            &self.injected_code_micros,
            &self.clamped_nodes,
            &self.clamped_micros,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let ctx = SessionContext::new();
        ctx.add_unknown_tags(2);
        ctx.add_unknown_tags(1);
        ctx.add_clamped_micros(40);
        let stats = ctx.stats();
        assert_eq!(stats.unknown_tags, 3);
        assert_eq!(stats.clamped_micros, 40);

        ctx.reset();
        assert_eq!(ctx.stats(), SessionStats::default());
    }
}
