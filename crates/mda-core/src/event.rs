//! Acquisition events.
//!
//! The scheduler (or an external queue) produces a stream of
//! [`AcquisitionEvent`]s and the engine consumes each one exactly once. Every
//! case carries only the fields that belong to it.

use crate::plan::{ChannelMode, ChannelSpec, XyPosition};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Position of a capture in the acquisition's axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AxisCoords {
    /// Time point.
    pub time: usize,
    /// Stage position.
    pub position: usize,
    /// Enabled-channel index.
    pub channel: usize,
    /// Slice index.
    pub slice: usize,
}

/// What a hardware-sequenced volume needs loaded before it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareVolume {
    /// Switching mode driving the frame order.
    pub mode: ChannelMode,
    /// Enabled channels in acquisition order. Empty for the implicit channel.
    pub channels: Vec<ChannelSpec>,
    /// Slices per channel.
    pub slices: usize,
    /// Per-slice Z targets before channel offsets. Empty when Z is untouched.
    pub z_positions: Vec<f64>,
}

impl HardwareVolume {
    /// Frames the camera must deliver for this volume.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.channels.len().max(1) * self.slices.max(1)
    }
}

/// How a capture relates to camera sequencing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum SequenceRole {
    /// Software-timed single snap.
    #[default]
    Snap,
    /// First frame of a hardware-sequenced volume.
    SequenceStart(HardwareVolume),
    /// Subsequent frame of the running sequence.
    Sequenced,
}

/// A single image capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEvent {
    /// Axis indices.
    pub coords: AxisCoords,
    /// Channel to use. `None` keeps the current configuration.
    pub channel: Option<ChannelSpec>,
    /// Z target including the channel offset. `None` leaves focus alone.
    pub z_position: Option<f64>,
    /// XY target. `None` leaves the stage alone.
    pub xy_position: Option<XyPosition>,
    /// Label of the stage position.
    pub position_label: Option<String>,
    /// Earliest start, relative to the start of the run.
    pub min_start: Duration,
    /// Hardware sequencing role.
    pub role: SequenceRole,
}

impl CaptureEvent {
    /// Software snap at the given coordinates with nothing else set.
    #[must_use]
    pub fn snap(coords: AxisCoords) -> Self {
        Self {
            coords,
            channel: None,
            z_position: None,
            xy_position: None,
            position_label: None,
            min_start: Duration::ZERO,
            role: SequenceRole::Snap,
        }
    }

    /// Whether this capture is part of a hardware sequence.
    #[must_use]
    pub fn is_sequenced(&self) -> bool {
        !matches!(self.role, SequenceRole::Snap)
    }
}

/// One instruction for the execution loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AcquisitionEvent {
    /// Capture one image.
    Capture(CaptureEvent),
    /// Every capture of `time` has been issued.
    TimepointFinished {
        /// Finished time point.
        time: usize,
    },
    /// The plan is exhausted.
    AcquisitionFinished,
    /// Move a focus device before time point `time`.
    AutofocusAdjustment {
        /// Focus device.
        device: String,
        /// Time point about to start.
        time: usize,
        /// Target position.
        target_z: f64,
    },
    /// Ends the execution loop for the current source.
    EngineTaskFinished,
    /// Wakes a loop blocked on an event queue; otherwise ignored.
    RequeryQueue,
}

impl AcquisitionEvent {
    /// Capture payload, if this is a capture.
    #[must_use]
    pub fn as_capture(&self) -> Option<&CaptureEvent> {
        match self {
            Self::Capture(capture) => Some(capture),
            _ => None,
        }
    }

    /// True for captures.
    #[must_use]
    pub fn is_capture(&self) -> bool {
        matches!(self, Self::Capture(_))
    }

    /// Short kind label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Capture(_) => "capture",
            Self::TimepointFinished { .. } => "timepoint_finished",
            Self::AcquisitionFinished => "acquisition_finished",
            Self::AutofocusAdjustment { .. } => "autofocus",
            Self::EngineTaskFinished => "engine_task_finished",
            Self::RequeryQueue => "requery_queue",
        }
    }
}

impl fmt::Display for AcquisitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture(c) => {
                write!(
                    f,
                    "capture t={} p={} c={} z={}",
                    c.coords.time, c.coords.position, c.coords.channel, c.coords.slice
                )?;
                if let Some(channel) = &c.channel {
                    write!(f, " [{}]", channel.display_name())?;
                }
                if let Some(z) = c.z_position {
                    write!(f, " Z={z:.3}")?;
                }
                match &c.role {
                    SequenceRole::Snap => Ok(()),
                    SequenceRole::SequenceStart(volume) => {
                        write!(f, " (sequence start, {} frames)", volume.frame_count())
                    }
                    SequenceRole::Sequenced => write!(f, " (sequenced)"),
                }
            }
            Self::TimepointFinished { time } => write!(f, "timepoint {time} finished"),
            Self::AcquisitionFinished => write!(f, "acquisition finished"),
            Self::AutofocusAdjustment {
                device,
                time,
                target_z,
            } => write!(f, "autofocus {device} -> {target_z:.3} before t={time}"),
            Self::EngineTaskFinished => write!(f, "engine task finished"),
            Self::RequeryQueue => write!(f, "requery queue"),
        }
    }
}
