//! Timing configuration for simulated devices.
//!
//! Defines hardware-like delays. The default is zero everywhere so tests run
//! fast; [`TimingConfig::realistic`] approximates a real rig.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Simulated device delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Frame readout time in milliseconds (camera)
    #[serde(default)]
    pub frame_readout_ms: u64,
    /// Settling time in milliseconds after a move (stages)
    #[serde(default)]
    pub settling_time_ms: u64,
}

impl TimingConfig {
    /// 30 fps camera readout and 20 ms stage settling.
    #[must_use]
    pub fn realistic() -> Self {
        Self {
            frame_readout_ms: 33,
            settling_time_ms: 20,
        }
    }

    /// Frame readout as a duration.
    #[must_use]
    pub fn readout(&self) -> Duration {
        Duration::from_millis(self.frame_readout_ms)
    }

    /// Settling time as a duration.
    #[must_use]
    pub fn settling(&self) -> Duration {
        Duration::from_millis(self.settling_time_ms)
    }
}
