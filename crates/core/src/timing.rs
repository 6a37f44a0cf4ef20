//! Conversion of raw timer deltas into cleansed microsecond times.
//!
//! Instrumented code pays for its own hooks: every call adds a fixed cost
//! inside the callee's measured interval ("inner") and another inside the
//! caller's interval for each nested call ("outer"). Calibration measures both
//! per timer stream, and cleansing subtracts them again.

use serde::{Deserialize, Serialize};

use crate::context::SessionContext;

/// Which of the two per-event timer readings a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeStream {
    /// Absolute (wall-clock) time.
    Absolute,
    /// Thread-CPU time, only collected in two-timestamp mode.
    ThreadCpu,
}

impl TimeStream {
    pub const ALL: [TimeStream; 2] = [TimeStream::Absolute, TimeStream::ThreadCpu];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Self::Absolute => 0,
            Self::ThreadCpu => 1,
        }
    }
}

/// Overhead constants measured by the agent's calibration run, in timer
/// counts, indexed by [`TimeStream::index`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingCalibration {
    pub timer_counts_in_second: [u64; 2],
    /// Cost of one complete instrumented call as seen from outside it.
    pub method_entry_exit_call_time: [f64; 2],
    /// Hook cost falling inside the callee's own interval.
    pub method_entry_exit_inner_time: [f64; 2],
    /// Hook cost charged to the caller for each nested call.
    pub method_entry_exit_outer_time: [f64; 2],
}

impl Default for TimingCalibration {
    fn default() -> Self {
        Self {
            timer_counts_in_second: [1_000_000, 1_000_000],
            method_entry_exit_call_time: [0.0; 2],
            method_entry_exit_inner_time: [0.0; 2],
            method_entry_exit_outer_time: [0.0; 2],
        }
    }
}

/// A cleansed time together with the value it had before clamping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cleansed {
    pub micros: u64,
    /// Negative when timer granularity made the overhead exceed the measured
    /// interval.
    pub pre_clamp: f64,
}

impl Cleansed {
    pub fn was_clamped(&self) -> bool {
        self.pre_clamp < 0.0
    }
}

#[derive(Debug, Clone)]
pub struct TimingAdjuster {
    calibration: TimingCalibration,
}

impl TimingAdjuster {
    pub fn new(calibration: TimingCalibration) -> Self {
        Self { calibration }
    }

    pub fn calibration(&self) -> &TimingCalibration {
        &self.calibration
    }

    fn micros_per_count(&self, stream: TimeStream) -> f64 {
        let per_second = self.calibration.timer_counts_in_second[stream.index()].max(1);
        1_000_000.0 / per_second as f64
    }

    pub fn counts_to_micros(&self, counts: u64, stream: TimeStream) -> u64 {
        (counts as f64 * self.micros_per_count(stream)).round() as u64
    }

    /// Instrumentation overhead, in microseconds, contained in a node's raw
    /// net time.
    pub fn overhead_micros(&self, n_calls: u64, n_callee_calls: u64, stream: TimeStream) -> f64 {
        let i = stream.index();
        let counts = n_calls as f64 * self.calibration.method_entry_exit_inner_time[i]
            + n_callee_calls as f64 * self.calibration.method_entry_exit_outer_time[i];
        counts * self.micros_per_count(stream)
    }

    /// Cleansed self time of a node that was called `n_calls` times and whose
    /// children were called `n_callee_calls` times in total.
    pub fn cleanse_self(
        &self,
        raw_counts: u64,
        n_calls: u64,
        n_callee_calls: u64,
        stream: TimeStream,
    ) -> Cleansed {
        let raw = raw_counts as f64 * self.micros_per_count(stream);
        clamp(raw - self.overhead_micros(n_calls, n_callee_calls, stream))
    }

    /// Cleansed gross time of a thread that made `n_invocations` instrumented
    /// calls in total.
    pub fn cleanse_gross(&self, raw_counts: u64, n_invocations: u64, stream: TimeStream) -> Cleansed {
        let i = stream.index();
        let raw = raw_counts as f64 * self.micros_per_count(stream);
        let overhead = n_invocations as f64
            * self.calibration.method_entry_exit_call_time[i]
            * self.micros_per_count(stream);
        clamp(raw - overhead)
    }

    /// [`Self::cleanse_self`], reporting removed overhead and clamping into
    /// the session counters.
    pub fn cleanse_self_reported(
        &self,
        raw_counts: u64,
        n_calls: u64,
        n_callee_calls: u64,
        stream: TimeStream,
        ctx: &SessionContext,
    ) -> u64 {
        let cleansed = self.cleanse_self(raw_counts, n_calls, n_callee_calls, stream);
        if stream == TimeStream::Absolute {
            let overhead = self.overhead_micros(n_calls, n_callee_calls, stream);
            ctx.add_injected_code_micros(overhead.round() as u64);
        }
        if cleansed.was_clamped() {
            ctx.add_clamped_nodes(1);
            ctx.add_clamped_micros((-cleansed.pre_clamp).round() as u64);
        }
        cleansed.micros
    }
}

impl Default for TimingAdjuster {
    fn default() -> Self {
        Self::new(TimingCalibration::default())
    }
}

fn clamp(value: f64) -> Cleansed {
    Cleansed {
        micros: if value > 0.0 { value.round() as u64 } else { 0 },
        pre_clamp: value,
    }
}
