//! Acquisition event scheduler.
//!
//! Expands a [`SequencePlan`] into the ordered stream of events the engine
//! executes. Events are produced one at a time on request, so the plan is
//! never materialised in full.
//!
//! # Ordering
//!
//! ```text
//! for time:
//!     [AutofocusAdjustment]            when time > 0 and time % every == 0
//!     for position:
//!         PerVolume / PerVolumeHardware:  for channel: for slice: Capture
//!         PerSliceHardware:               for slice: for channel: Capture
//!     TimepointFinished { time }
//! AcquisitionFinished
//! ```

use crate::validation::validate_plan;
use mda_core::error::AcqResult;
use mda_core::event::{AcquisitionEvent, AxisCoords, CaptureEvent, HardwareVolume, SequenceRole};
use mda_core::plan::{ChannelSpec, DeviceInventory, FirmwareVersion, SequencePlan, StagePosition};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    StartTimepoint,
    Capture,
    TimepointFinished,
    AcquisitionFinished,
    Done,
}

/// Pull-based event generator for one plan.
#[derive(Debug, Clone)]
pub struct Scheduler {
    plan: SequencePlan,
    channels: Vec<Option<ChannelSpec>>,
    positions: Vec<Option<StagePosition>>,
    slices: usize,

    // Execution state
    time: usize,
    position: usize,
    index_in_volume: usize,
    step: Step,
}

impl Scheduler {
    /// Scheduler for `plan` without inventory checks.
    #[must_use]
    pub fn new(plan: SequencePlan) -> Self {
        let channels = if plan.channels.is_empty() {
            vec![None]
        } else {
            plan.enabled_channels().cloned().map(Some).collect()
        };
        let positions = if plan.positions.is_empty() {
            vec![None]
        } else {
            plan.positions.iter().cloned().map(Some).collect()
        };
        let slices = plan.slice_count();
        let step = if plan.frames == 0 || channels.is_empty() {
            Step::AcquisitionFinished
        } else {
            Step::StartTimepoint
        };
        Self {
            plan,
            channels,
            positions,
            slices,
            time: 0,
            position: 0,
            index_in_volume: 0,
            step,
        }
    }

    /// Validates `plan` against `inventory` first, failing fast with
    /// `PlanValidation`.
    pub fn validated(
        plan: SequencePlan,
        inventory: &DeviceInventory,
        min_trigger_firmware: FirmwareVersion,
    ) -> AcqResult<Self> {
        validate_plan(&plan, inventory, min_trigger_firmware)?;
        Ok(Self::new(plan))
    }

    /// The plan being scheduled.
    #[must_use]
    pub fn plan(&self) -> &SequencePlan {
        &self.plan
    }

    /// Capture events this scheduler produces in total.
    #[must_use]
    pub fn expected_capture_count(&self) -> usize {
        self.plan.frames * self.positions.len() * self.volume_len()
    }

    /// Restarts from the first event.
    pub fn reset(&mut self) {
        *self = Self::new(self.plan.clone());
    }

    /// Produces the next event, or `None` once `AcquisitionFinished` was returned.
    pub fn next_event(&mut self) -> Option<AcquisitionEvent> {
        loop {
            match self.step {
                Step::StartTimepoint => {
                    self.step = Step::Capture;
                    if let Some(event) = self.autofocus_for(self.time) {
                        return Some(event);
                    }
                }
                Step::Capture => {
                    let event = self.capture_at(self.time, self.position, self.index_in_volume);
                    self.index_in_volume += 1;
                    if self.index_in_volume == self.volume_len() {
                        self.index_in_volume = 0;
                        self.position += 1;
                        if self.position == self.positions.len() {
                            self.position = 0;
                            self.step = Step::TimepointFinished;
                        }
                    }
                    return Some(AcquisitionEvent::Capture(event));
                }
                Step::TimepointFinished => {
                    let time = self.time;
                    self.time += 1;
                    self.step = if self.time >= self.plan.frames {
                        Step::AcquisitionFinished
                    } else {
                        Step::StartTimepoint
                    };
                    return Some(AcquisitionEvent::TimepointFinished { time });
                }
                Step::AcquisitionFinished => {
                    self.step = Step::Done;
                    return Some(AcquisitionEvent::AcquisitionFinished);
                }
                Step::Done => return None,
            }
        }
    }

    fn volume_len(&self) -> usize {
        self.channels.len() * self.slices
    }

    fn autofocus_for(&self, time: usize) -> Option<AcquisitionEvent> {
        let autofocus = self.plan.autofocus.as_ref()?;
        let every = autofocus.every_n_timepoints.max(1);
        if time == 0 || time % every != 0 {
            return None;
        }
        Some(AcquisitionEvent::AutofocusAdjustment {
            device: autofocus.device.clone(),
            time,
            target_z: self.plan.z_reference,
        })
    }

    /// Splits an index within the volume into (channel, slice) by mode.
    fn channel_and_slice(&self, index: usize) -> (usize, usize) {
        if self.plan.channel_mode.is_channel_minor() {
            (index % self.channels.len(), index / self.channels.len())
        } else {
            (index / self.slices, index % self.slices)
        }
    }

    fn slice_z(&self, position: Option<&StagePosition>, slice: usize) -> Option<f64> {
        let base = position.and_then(|p| p.z);
        match self.plan.slices.get(slice) {
            Some(&offset) if self.plan.relative_z => {
                Some(base.unwrap_or(self.plan.z_reference) + offset)
            }
            Some(&target) => Some(target),
            None => base,
        }
    }

    fn capture_at(&self, time: usize, position: usize, index: usize) -> CaptureEvent {
        let (channel, slice) = self.channel_and_slice(index);
        let spec = self.channels[channel].clone();
        let stage_position = self.positions[position].as_ref();
        let z_offset = spec.as_ref().map_or(0.0, |c| c.z_offset);
        let z_position = self.slice_z(stage_position, slice).map(|z| z + z_offset);

        let role = if !self.plan.channel_mode.is_hardware() {
            SequenceRole::Snap
        } else if index == 0 {
            SequenceRole::SequenceStart(HardwareVolume {
                mode: self.plan.channel_mode,
                channels: self.channels.iter().flatten().cloned().collect(),
                slices: self.slices,
                z_positions: (0..self.plan.slices.len())
                    .filter_map(|s| self.slice_z(stage_position, s))
                    .collect(),
            })
        } else {
            SequenceRole::Sequenced
        };

        CaptureEvent {
            coords: AxisCoords {
                time,
                position,
                channel,
                slice,
            },
            channel: spec,
            z_position,
            xy_position: stage_position.and_then(|p| p.xy),
            position_label: stage_position.map(|p| p.label.clone()),
            min_start: start_offset(time, self.plan.interval_ms),
            role,
        }
    }
}

/// Earliest start of time point `time`, saturating at [`Duration::MAX`].
fn start_offset(time: usize, interval_ms: f64) -> Duration {
    let secs = (time as f64 * interval_ms).max(0.0) / 1000.0;
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

impl Iterator for Scheduler {
    type Item = AcquisitionEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event()
    }
}
