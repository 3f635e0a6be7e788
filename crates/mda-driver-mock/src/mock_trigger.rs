//! Mock hardware trigger controller.

use anyhow::{bail, Result};
use async_trait::async_trait;
use mda_core::capabilities::TriggerController;
use mda_core::event::HardwareVolume;
use mda_core::plan::FirmwareVersion;
use parking_lot::Mutex;
use tracing::debug;

/// Trigger controller that records every loaded sequence.
pub struct MockTrigger {
    name: String,
    firmware: FirmwareVersion,
    loaded: Mutex<Vec<HardwareVolume>>,
}

impl MockTrigger {
    /// Controller with the given label and firmware.
    pub fn new(name: impl Into<String>, firmware: FirmwareVersion) -> Self {
        Self {
            name: name.into(),
            firmware,
            loaded: Mutex::new(Vec::new()),
        }
    }

    /// Sequences loaded so far.
    #[must_use]
    pub fn loaded(&self) -> Vec<HardwareVolume> {
        self.loaded.lock().clone()
    }
}

#[async_trait]
impl TriggerController for MockTrigger {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn firmware_version(&self) -> FirmwareVersion {
        self.firmware
    }

    async fn load_sequence(&self, volume: &HardwareVolume) -> Result<()> {
        if volume.frame_count() == 0 {
            bail!("Empty trigger sequence");
        }
        debug!(
            device = %self.name,
            frames = volume.frame_count(),
            mode = %volume.mode,
            "Trigger sequence loaded"
        );
        self.loaded.lock().push(volume.clone());
        Ok(())
    }
}
