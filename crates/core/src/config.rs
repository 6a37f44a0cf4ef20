use serde::{Deserialize, Serialize};

use crate::error::ProfilerError;
use crate::presentation::SortConfig;
use crate::timing::TimingCalibration;

/// Session-wide settings for the results engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Events carry a thread-CPU stamp after the absolute one.
    pub two_timestamps: bool,
    /// The agent's thread-CPU timer was on, so whole-thread CPU time is
    /// meaningful.
    pub thread_cpu_timer_on: bool,
    /// Leave wait/monitor/park intervals out of net time.
    pub exclude_wait_time: bool,
    /// Leave sleep intervals out of net time.
    pub exclude_sleep_time: bool,
    pub calibration: TimingCalibration,
    /// Initial sort for new presentation trees.
    pub sort: SortConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            two_timestamps: false,
            thread_cpu_timer_on: false,
            exclude_wait_time: true,
            exclude_sleep_time: true,
            calibration: TimingCalibration::default(),
            sort: SortConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(data: &[u8]) -> Result<Self, ProfilerError> {
        Ok(serde_json::from_slice(data)?)
    }
}
