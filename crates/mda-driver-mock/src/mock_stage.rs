//! Mock stages and configuration presets.

use crate::timing::TimingConfig;
use anyhow::{bail, Result};
use async_trait::async_trait;
use mda_core::capabilities::DeviceControl;
use mda_core::plan::XyPosition;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;
use tracing::debug;

/// A command received by [`MockDevices`], in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    /// Single-axis move.
    SetPosition {
        /// Device label.
        device: String,
        /// Target.
        value: f64,
    },
    /// XY move.
    SetXy {
        /// Device label.
        device: String,
        /// Target.
        position: XyPosition,
    },
    /// Preset change.
    SetConfig {
        /// Group.
        group: String,
        /// Preset.
        preset: String,
    },
}

#[derive(Default)]
struct State {
    positions: HashMap<String, f64>,
    xy: HashMap<String, XyPosition>,
    busy_until: HashMap<String, Instant>,
    config: HashMap<String, String>,
    stuck: HashSet<String>,
    failing: HashSet<String>,
    calls: Vec<DeviceCall>,
}

/// Simulated focus and XY stages plus configuration presets.
///
/// Every move makes its device busy for the configured settling time.
#[derive(Default)]
pub struct MockDevices {
    timing: TimingConfig,
    state: Mutex<State>,
}

impl MockDevices {
    /// Devices that settle instantly.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Devices with the given settling time.
    #[must_use]
    pub fn with_timing(timing: TimingConfig) -> Self {
        Self {
            timing,
            state: Mutex::default(),
        }
    }

    /// Makes `device` report busy forever once it has been moved.
    pub fn make_stuck(&self, device: &str) {
        self.state.lock().stuck.insert(device.to_string());
    }

    /// Makes every command to `device` fail.
    pub fn make_failing(&self, device: &str) {
        self.state.lock().failing.insert(device.to_string());
    }

    /// Every command received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    /// Last commanded position of a single-axis device.
    #[must_use]
    pub fn position(&self, device: &str) -> Option<f64> {
        self.state.lock().positions.get(device).copied()
    }

    /// Last commanded XY position.
    #[must_use]
    pub fn xy_position(&self, device: &str) -> Option<XyPosition> {
        self.state.lock().xy.get(device).copied()
    }

    /// Preset currently applied in `group`.
    #[must_use]
    pub fn current_preset(&self, group: &str) -> Option<String> {
        self.state.lock().config.get(group).cloned()
    }

    fn begin_move(&self, state: &mut State, device: &str) {
        state
            .busy_until
            .insert(device.to_string(), Instant::now() + self.timing.settling());
    }
}

#[async_trait]
impl DeviceControl for MockDevices {
    async fn is_device_busy(&self, device: &str) -> Result<bool> {
        let state = self.state.lock();
        if state.stuck.contains(device) && state.busy_until.contains_key(device) {
            return Ok(true);
        }
        Ok(state
            .busy_until
            .get(device)
            .is_some_and(|until| Instant::now() < *until))
    }

    async fn set_position(&self, device: &str, value: f64) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing.contains(device) {
            bail!("Simulated failure moving {device}");
        }
        debug!(device, value, "Mock stage move");
        state.positions.insert(device.to_string(), value);
        state.calls.push(DeviceCall::SetPosition {
            device: device.to_string(),
            value,
        });
        self.begin_move(&mut state, device);
        Ok(())
    }

    async fn set_xy_position(&self, device: &str, position: XyPosition) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing.contains(device) {
            bail!("Simulated failure moving {device}");
        }
        debug!(device, x = position.x, y = position.y, "Mock XY move");
        state.xy.insert(device.to_string(), position);
        state.calls.push(DeviceCall::SetXy {
            device: device.to_string(),
            position,
        });
        self.begin_move(&mut state, device);
        Ok(())
    }

    async fn set_config(&self, group: &str, preset: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing.contains(group) {
            bail!("Simulated failure applying {group}/{preset}");
        }
        state.config.insert(group.to_string(), preset.to_string());
        state.calls.push(DeviceCall::SetConfig {
            group: group.to_string(),
            preset: preset.to_string(),
        });
        Ok(())
    }
}
