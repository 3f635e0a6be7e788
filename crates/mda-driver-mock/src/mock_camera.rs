//! Mock camera with snap and hardware-sequence support.

use crate::pattern::{generate_test_pattern, to_gray8};
use crate::timing::TimingConfig;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use mda_core::capabilities::{CaptureSource, FrameGeometry};
use mda_core::image::{tags, PixelType, TaggedImage};
use mda_storage::CircularBuffer;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

/// Configuration for [`MockCamera`].
#[derive(Debug, Clone, Deserialize)]
pub struct MockCameraConfig {
    /// Device label (default: `Camera`)
    #[serde(default = "default_name")]
    pub name: String,

    /// Frame width in pixels (default: 64)
    #[serde(default = "default_width")]
    pub width: u32,

    /// Frame height in pixels (default: 64)
    #[serde(default = "default_height")]
    pub height: u32,

    /// Pixel format (default: GRAY16)
    #[serde(default = "default_pixel_type")]
    pub pixel_type: PixelType,

    /// Frames the camera's own sequence buffer holds (default: 256)
    #[serde(default = "default_sequence_buffer")]
    pub sequence_buffer_frames: usize,

    /// Simulated delays
    #[serde(default)]
    pub timing: TimingConfig,
}

fn default_name() -> String {
    "Camera".to_string()
}
fn default_width() -> u32 {
    64
}
fn default_height() -> u32 {
    64
}
fn default_pixel_type() -> PixelType {
    PixelType::Gray16
}
fn default_sequence_buffer() -> usize {
    256
}

impl Default for MockCameraConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            width: default_width(),
            height: default_height(),
            pixel_type: default_pixel_type(),
            sequence_buffer_frames: default_sequence_buffer(),
            timing: TimingConfig::default(),
        }
    }
}

struct Frames {
    config: MockCameraConfig,
    counter: AtomicU64,
}

impl Frames {
    fn next(&self) -> Result<TaggedImage> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let pattern = generate_test_pattern(self.config.width, self.config.height, n);
        let image = match self.config.pixel_type {
            PixelType::Gray16 => {
                TaggedImage::from_u16(self.config.width, self.config.height, &pattern)?
            }
            PixelType::Gray8 => TaggedImage::new(
                self.config.width,
                self.config.height,
                PixelType::Gray8,
                to_gray8(&pattern),
            )?,
        };
        Ok(image
            .with_tag(tags::CAMERA, self.config.name.as_str())
            .with_tag("CameraFrame", n as i64))
    }
}

/// Simulated camera.
///
/// Snaps generate a test pattern after the configured readout delay. A
/// sequence runs on a background task and fills the camera's own circular
/// buffer, from which [`CaptureSource::pop_next_image`] reads.
pub struct MockCamera {
    frames: Arc<Frames>,
    exposure_ms: Mutex<f64>,
    sequence_buffer: Arc<CircularBuffer>,
    sequence_running: Arc<AtomicBool>,
    sequence_task: Mutex<Option<JoinHandle<()>>>,
    failing_snaps: AtomicU32,
    sequences_started: AtomicU32,
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCamera {
    /// Camera with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockCameraConfig::default())
    }

    /// Camera with the given configuration.
    #[must_use]
    pub fn with_config(config: MockCameraConfig) -> Self {
        let geometry = FrameGeometry {
            width: config.width,
            height: config.height,
            pixel_type: config.pixel_type,
        };
        let sequence_buffer = Arc::new(CircularBuffer::with_capacity(
            config.sequence_buffer_frames,
            geometry,
        ));
        sequence_buffer.finish();
        Self {
            frames: Arc::new(Frames {
                config,
                counter: AtomicU64::new(0),
            }),
            exposure_ms: Mutex::new(10.0),
            sequence_buffer,
            sequence_running: Arc::new(AtomicBool::new(false)),
            sequence_task: Mutex::new(None),
            failing_snaps: AtomicU32::new(0),
            sequences_started: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` snaps fail.
    pub fn fail_next_snaps(&self, count: u32) {
        self.failing_snaps.store(count, Ordering::SeqCst);
    }

    /// Current exposure.
    #[must_use]
    pub fn exposure_ms(&self) -> f64 {
        *self.exposure_ms.lock()
    }

    /// Frames generated so far (snaps and sequence frames).
    #[must_use]
    pub fn frames_generated(&self) -> u64 {
        self.frames.counter.load(Ordering::SeqCst)
    }

    /// Hardware sequences started so far.
    #[must_use]
    pub fn sequences_started(&self) -> u32 {
        self.sequences_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureSource for MockCamera {
    fn camera_name(&self) -> &str {
        &self.frames.config.name
    }

    fn geometry(&self) -> FrameGeometry {
        let config = &self.frames.config;
        FrameGeometry {
            width: config.width,
            height: config.height,
            pixel_type: config.pixel_type,
        }
    }

    async fn set_exposure(&self, exposure_ms: f64) -> Result<()> {
        if exposure_ms <= 0.0 {
            bail!("Exposure must be positive, got {exposure_ms}");
        }
        *self.exposure_ms.lock() = exposure_ms;
        Ok(())
    }

    async fn snap_single(&self) -> Result<TaggedImage> {
        if self.sequence_running.load(Ordering::SeqCst) {
            bail!("Cannot snap while a sequence is running");
        }
        let failing = self.failing_snaps.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_snaps.store(failing - 1, Ordering::SeqCst);
            bail!("Simulated snap failure");
        }
        sleep(self.frames.config.timing.readout()).await;
        self.frames.next()
    }

    async fn start_sequence_capture(&self, frame_count: usize, interval_ms: f64) -> Result<()> {
        if self.sequence_running.swap(true, Ordering::SeqCst) {
            bail!("Sequence already running");
        }
        self.sequence_buffer.reset();
        self.sequences_started.fetch_add(1, Ordering::SeqCst);

        let readout = self.frames.config.timing.readout();
        let period = readout.max(Duration::from_secs_f64(interval_ms.max(0.0) / 1000.0));
        let frames = self.frames.clone();
        let buffer = self.sequence_buffer.clone();
        let running = self.sequence_running.clone();
        info!(frame_count, ?period, "Mock camera sequence started");

        let task = tokio::spawn(async move {
            for _ in 0..frame_count {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                sleep(period).await;
                match frames.next() {
                    Ok(frame) => {
                        if let Err(err) = buffer.push(frame) {
                            debug!(error = %err, "Mock camera dropped a frame");
                        }
                    }
                    Err(err) => debug!(error = %err, "Mock camera frame generation failed"),
                }
            }
            buffer.finish();
            running.store(false, Ordering::SeqCst);
        });
        *self.sequence_task.lock() = Some(task);
        Ok(())
    }

    async fn stop_sequence_capture(&self) -> Result<()> {
        self.sequence_running.store(false, Ordering::SeqCst);
        let task = self.sequence_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.sequence_buffer.finish();
        Ok(())
    }

    fn is_sequence_running(&self) -> bool {
        self.sequence_running.load(Ordering::SeqCst)
    }

    fn remaining_image_count(&self) -> usize {
        self.sequence_buffer.remaining_count()
    }

    async fn pop_next_image(&self) -> Result<TaggedImage> {
        self.sequence_buffer
            .try_pop_oldest()
            .ok_or_else(|| anyhow!("No sequence image available"))
    }
}
