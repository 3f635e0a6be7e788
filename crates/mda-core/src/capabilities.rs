//! Hardware capabilities consumed by the acquisition engine.
//!
//! The engine never talks to drivers directly. It holds `Arc`s to three small
//! capability traits, each async, thread-safe and returning `anyhow::Result`:
//!
//! - [`CaptureSource`]: the camera, either snapping single frames or running a
//!   hardware sequence into its own buffer
//! - [`DeviceControl`]: stages and configuration presets
//! - [`TriggerController`]: the optional hardware trigger that switches
//!   channels during a sequence
//!
//! # Example
//!
//! ```rust,ignore
//! let hardware = Hardware::new(camera, stages).with_trigger(plogic);
//! let engine = AcquisitionEngine::new(hardware, EngineSettings::default());
//! ```

use crate::error::{AcqError, AcqResult};
use crate::event::HardwareVolume;
use crate::image::{PixelType, TaggedImage};
use crate::plan::{DeviceInventory, FirmwareVersion, TriggerDeviceInfo, XyPosition};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Interval between busy polls while waiting for a device.
pub const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Frame size reported by a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel format.
    pub pixel_type: PixelType,
}

impl FrameGeometry {
    /// Bytes in one frame.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        TaggedImage::expected_len(self.width, self.height, self.pixel_type)
    }
}

/// A camera that produces tagged images.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Device label.
    fn camera_name(&self) -> &str;

    /// Current frame geometry.
    fn geometry(&self) -> FrameGeometry;

    /// Sets exposure for subsequent frames.
    async fn set_exposure(&self, exposure_ms: f64) -> Result<()>;

    /// Captures one frame.
    async fn snap_single(&self) -> Result<TaggedImage>;

    /// Starts a hardware-paced sequence of `frame_count` frames.
    async fn start_sequence_capture(&self, frame_count: usize, interval_ms: f64) -> Result<()>;

    /// Stops the running sequence, if any.
    async fn stop_sequence_capture(&self) -> Result<()>;

    /// Whether a sequence is still producing.
    fn is_sequence_running(&self) -> bool;

    /// Frames captured by the sequence but not yet popped.
    fn remaining_image_count(&self) -> usize;

    /// Oldest unpopped sequence frame. Fails when none is ready.
    async fn pop_next_image(&self) -> Result<TaggedImage>;
}

/// Stages and configuration presets.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Whether `device` is still executing a command.
    async fn is_device_busy(&self, device: &str) -> Result<bool>;

    /// Moves a single-axis device.
    async fn set_position(&self, device: &str, value: f64) -> Result<()>;

    /// Moves an XY stage.
    async fn set_xy_position(&self, device: &str, position: XyPosition) -> Result<()>;

    /// Applies a configuration preset.
    async fn set_config(&self, group: &str, preset: &str) -> Result<()>;

    /// Polls [`DeviceControl::is_device_busy`] until the device settles.
    ///
    /// Returns [`AcqError::HardwareTimeout`] once `timeout` elapses.
    async fn wait_for_device(&self, device: &str, timeout: Duration) -> AcqResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let busy = self
                .is_device_busy(device)
                .await
                .map_err(|e| AcqError::hardware("is_device_busy", e))?;
            if !busy {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AcqError::HardwareTimeout {
                    device: device.to_string(),
                    timeout,
                });
            }
            sleep(DEVICE_POLL_INTERVAL).await;
        }
    }
}

/// Hardware trigger controller for channel sequencing.
#[async_trait]
pub trait TriggerController: Send + Sync {
    /// Device label.
    fn device_name(&self) -> &str;

    /// Reported firmware version.
    fn firmware_version(&self) -> FirmwareVersion;

    /// Loads the channel (and slice) sequence for the next volume.
    async fn load_sequence(&self, volume: &HardwareVolume) -> Result<()>;
}

/// The hardware handed to an engine.
#[derive(Clone)]
pub struct Hardware {
    /// Camera.
    pub camera: Arc<dyn CaptureSource>,
    /// Stages and presets.
    pub devices: Arc<dyn DeviceControl>,
    /// Optional trigger controller.
    pub trigger: Option<Arc<dyn TriggerController>>,
}

impl Hardware {
    /// Camera and stages without a trigger controller.
    pub fn new(camera: Arc<dyn CaptureSource>, devices: Arc<dyn DeviceControl>) -> Self {
        Self {
            camera,
            devices,
            trigger: None,
        }
    }

    /// Adds a trigger controller.
    #[must_use]
    pub fn with_trigger(mut self, trigger: Arc<dyn TriggerController>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Inventory describing this hardware with the given stage labels.
    #[must_use]
    pub fn inventory(&self, z_stage: Option<&str>, xy_stage: Option<&str>) -> DeviceInventory {
        DeviceInventory {
            camera: Some(self.camera.camera_name().to_string()),
            z_stage: z_stage.map(str::to_string),
            xy_stage: xy_stage.map(str::to_string),
            trigger: self.trigger.as_ref().map(|t| TriggerDeviceInfo {
                name: t.device_name().to_string(),
                firmware: t.firmware_version(),
            }),
            devices: Default::default(),
        }
    }
}

impl std::fmt::Debug for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hardware")
            .field("camera", &self.camera.camera_name())
            .field(
                "trigger",
                &self.trigger.as_ref().map(|t| t.device_name().to_string()),
            )
            .finish()
    }
}
