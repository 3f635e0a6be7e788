//! Sequence plan and device inventory model.
//!
//! A [`SequencePlan`] is fixed for the lifetime of a run. Empty lists have
//! implicit defaults so a plan with only `frames` set is a plain time lapse:
//!
//! - no channels: one implicit channel using the current configuration
//! - no slices: one slice at the current focus
//! - no positions: one position at the current stage location

use crate::error::{AcqError, AcqResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Channel-switching strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    /// Software switching, all slices of one channel before the next channel.
    #[default]
    PerVolume,
    /// Trigger-controller switching once per volume.
    PerVolumeHardware,
    /// Trigger-controller switching at every slice.
    PerSliceHardware,
}

impl ChannelMode {
    /// True for the modes that need a trigger controller.
    #[must_use]
    pub fn is_hardware(self) -> bool {
        !matches!(self, Self::PerVolume)
    }

    /// True when channels vary fastest (slice-major order).
    #[must_use]
    pub fn is_channel_minor(self) -> bool {
        matches!(self, Self::PerSliceHardware)
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::PerVolume => "per_volume",
            Self::PerVolumeHardware => "per_volume_hardware",
            Self::PerSliceHardware => "per_slice_hardware",
        };
        f.write_str(label)
    }
}

fn default_true() -> bool {
    true
}

/// One acquisition channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Configuration group the preset belongs to.
    pub group: String,
    /// Preset applied when switching to this channel.
    pub preset: String,
    /// Display name. Falls back to the preset.
    #[serde(default)]
    pub name: String,
    /// Camera exposure for this channel.
    pub exposure_ms: f64,
    /// Disabled channels are skipped entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Added to every Z target while this channel is active.
    #[serde(default)]
    pub z_offset: f64,
}

impl ChannelSpec {
    /// Enabled channel with no Z offset.
    pub fn new(group: impl Into<String>, preset: impl Into<String>, exposure_ms: f64) -> Self {
        let preset = preset.into();
        Self {
            group: group.into(),
            name: preset.clone(),
            preset,
            exposure_ms,
            enabled: true,
            z_offset: 0.0,
        }
    }

    /// Builder-style Z offset.
    #[must_use]
    pub fn with_z_offset(mut self, z_offset: f64) -> Self {
        self.z_offset = z_offset;
        self
    }

    /// Builder-style enable flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Name shown in tags and logs.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.preset
        } else {
            &self.name
        }
    }
}

/// XY stage coordinates in micrometres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct XyPosition {
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
}

/// A stage position visited once per time point.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StagePosition {
    /// Position label, e.g. `Pos0`.
    #[serde(default)]
    pub label: String,
    /// XY target. `None` leaves the XY stage alone.
    #[serde(default)]
    pub xy: Option<XyPosition>,
    /// Focus reference for relative slices at this position.
    #[serde(default)]
    pub z: Option<f64>,
}

impl StagePosition {
    /// Position with an XY target.
    pub fn xy(label: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            label: label.into(),
            xy: Some(XyPosition { x, y }),
            z: None,
        }
    }
}

/// Periodic autofocus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutofocusSettings {
    /// Focus device that receives the adjustment.
    pub device: String,
    /// Run autofocus before every N-th time point (N >= 1).
    pub every_n_timepoints: usize,
}

/// Immutable description of a multi-dimensional acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencePlan {
    /// Number of time points.
    pub frames: usize,
    /// Minimum spacing between time point starts.
    #[serde(default)]
    pub interval_ms: f64,
    /// Slice offsets (relative) or targets (absolute).
    #[serde(default)]
    pub slices: Vec<f64>,
    /// Whether `slices` are offsets from the focus reference.
    #[serde(default = "default_true")]
    pub relative_z: bool,
    /// Focus reference used when a position carries no Z.
    #[serde(default)]
    pub z_reference: f64,
    /// Stage positions.
    #[serde(default)]
    pub positions: Vec<StagePosition>,
    /// Channels, in acquisition order.
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
    /// Channel-switching mode.
    #[serde(default)]
    pub channel_mode: ChannelMode,
    /// Optional periodic autofocus.
    #[serde(default)]
    pub autofocus: Option<AutofocusSettings>,
}

impl SequencePlan {
    /// Time lapse of `frames` time points with every other axis at its default.
    #[must_use]
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            interval_ms: 0.0,
            slices: Vec::new(),
            relative_z: true,
            z_reference: 0.0,
            positions: Vec::new(),
            channels: Vec::new(),
            channel_mode: ChannelMode::PerVolume,
            autofocus: None,
        }
    }

    /// Builder-style interval.
    #[must_use]
    pub fn with_interval_ms(mut self, interval_ms: f64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Builder-style channel append.
    #[must_use]
    pub fn with_channel(mut self, channel: ChannelSpec) -> Self {
        self.channels.push(channel);
        self
    }

    /// Builder-style relative slices around `z_reference`.
    #[must_use]
    pub fn with_relative_slices(mut self, z_reference: f64, offsets: Vec<f64>) -> Self {
        self.relative_z = true;
        self.z_reference = z_reference;
        self.slices = offsets;
        self
    }

    /// Builder-style absolute slice targets.
    #[must_use]
    pub fn with_absolute_slices(mut self, targets: Vec<f64>) -> Self {
        self.relative_z = false;
        self.slices = targets;
        self
    }

    /// Builder-style position append.
    #[must_use]
    pub fn with_position(mut self, position: StagePosition) -> Self {
        self.positions.push(position);
        self
    }

    /// Builder-style channel mode.
    #[must_use]
    pub fn with_channel_mode(mut self, mode: ChannelMode) -> Self {
        self.channel_mode = mode;
        self
    }

    /// Builder-style autofocus.
    #[must_use]
    pub fn with_autofocus(mut self, device: impl Into<String>, every_n_timepoints: usize) -> Self {
        self.autofocus = Some(AutofocusSettings {
            device: device.into(),
            every_n_timepoints,
        });
        self
    }

    /// Channels that will actually be acquired.
    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.iter().filter(|c| c.enabled)
    }

    /// Channels per volume, counting the implicit channel.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.channels.is_empty() {
            1
        } else {
            self.enabled_channels().count()
        }
    }

    /// Slices per volume, counting the implicit slice.
    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.slices.len().max(1)
    }

    /// Positions per time point, counting the implicit position.
    #[must_use]
    pub fn position_count(&self) -> usize {
        self.positions.len().max(1)
    }

    /// Captures per volume.
    #[must_use]
    pub fn volume_size(&self) -> usize {
        self.channel_count() * self.slice_count()
    }

    /// Total capture events the plan produces.
    #[must_use]
    pub fn expected_capture_count(&self) -> usize {
        self.frames * self.position_count() * self.volume_size()
    }
}

/// Trigger controller firmware version, e.g. `3.09`.
///
/// The minor part is compared numerically, so `3.10` is newer than `3.09`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FirmwareVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
}

impl FirmwareVersion {
    /// Lowest firmware that supports hardware channel sequencing.
    pub const MIN_HARDWARE_SEQUENCING: Self = Self::new(3, 9);

    /// Creates a version.
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Whether this version is at least `minimum`.
    #[must_use]
    pub fn at_least(self, minimum: Self) -> bool {
        self >= minimum
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for FirmwareVersion {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().trim_start_matches(['v', 'V']);
        let (major, minor) = text.split_once('.').unwrap_or((text, "0"));
        let parse = |part: &str| {
            part.trim().parse::<u32>().map_err(|_| {
                AcqError::Configuration(format!("invalid firmware version '{s}'"))
            })
        };
        Ok(Self::new(parse(major)?, parse(minor)?))
    }
}

impl TryFrom<String> for FirmwareVersion {
    type Error = AcqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FirmwareVersion> for String {
    fn from(value: FirmwareVersion) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.major, self.minor)
    }
}

/// Trigger controller known to the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDeviceInfo {
    /// Device label.
    pub name: String,
    /// Reported firmware.
    pub firmware: FirmwareVersion,
}

/// Devices available to the engine.
///
/// Plans are validated against this; any change re-triggers validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInventory {
    /// Camera label.
    #[serde(default)]
    pub camera: Option<String>,
    /// Focus stage label.
    #[serde(default)]
    pub z_stage: Option<String>,
    /// XY stage label.
    #[serde(default)]
    pub xy_stage: Option<String>,
    /// Hardware trigger controller.
    #[serde(default)]
    pub trigger: Option<TriggerDeviceInfo>,
    /// Every other device label, e.g. autofocus drives.
    #[serde(default)]
    pub devices: BTreeSet<String>,
}

impl DeviceInventory {
    /// Whether a device label is known.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.camera.as_deref() == Some(name)
            || self.z_stage.as_deref() == Some(name)
            || self.xy_stage.as_deref() == Some(name)
            || self.trigger.as_ref().is_some_and(|t| t.name == name)
            || self.devices.contains(name)
    }
}
