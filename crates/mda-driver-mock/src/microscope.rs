//! A complete simulated microscope.

use crate::mock_camera::{MockCamera, MockCameraConfig};
use crate::mock_stage::MockDevices;
use crate::mock_trigger::MockTrigger;
use crate::timing::TimingConfig;
use mda_core::capabilities::Hardware;
use mda_core::plan::FirmwareVersion;
use std::sync::Arc;

/// Camera, stages and an optional trigger controller sharing one timing setup.
///
/// Keeps concrete handles so tests can inspect recorded calls after a run.
#[derive(Clone)]
pub struct MockMicroscope {
    /// Simulated camera.
    pub camera: Arc<MockCamera>,
    /// Simulated stages and presets.
    pub devices: Arc<MockDevices>,
    /// Simulated trigger controller.
    pub trigger: Option<Arc<MockTrigger>>,
}

impl MockMicroscope {
    /// Camera of `width` x `height` 16-bit pixels and instant stages, no trigger.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_timing(width, height, TimingConfig::default())
    }

    /// Same as [`MockMicroscope::new`] with simulated delays.
    #[must_use]
    pub fn with_timing(width: u32, height: u32, timing: TimingConfig) -> Self {
        let camera = MockCamera::with_config(MockCameraConfig {
            width,
            height,
            timing,
            ..Default::default()
        });
        Self {
            camera: Arc::new(camera),
            devices: Arc::new(MockDevices::with_timing(timing)),
            trigger: None,
        }
    }

    /// Adds a trigger controller named `PLogic` with the given firmware.
    #[must_use]
    pub fn with_trigger(mut self, firmware: FirmwareVersion) -> Self {
        self.trigger = Some(Arc::new(MockTrigger::new("PLogic", firmware)));
        self
    }

    /// Capability bundle for the engine.
    #[must_use]
    pub fn hardware(&self) -> Hardware {
        let hardware = Hardware::new(self.camera.clone(), self.devices.clone());
        match &self.trigger {
            Some(trigger) => hardware.with_trigger(trigger.clone()),
            None => hardware,
        }
    }
}
