//! Plan validation against the device inventory.
//!
//! Runs before any hardware is touched and again whenever the inventory
//! changes. Every failure is a descriptive [`AcqError::PlanValidation`].

use mda_core::error::{AcqError, AcqResult};
use mda_core::plan::{DeviceInventory, FirmwareVersion, SequencePlan};
use std::time::Duration;

/// Longest span between the first and last time point a plan may request.
pub const MAX_TIMELAPSE_SPAN: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn invalid(message: impl Into<String>) -> AcqError {
    AcqError::PlanValidation(message.into())
}

/// Checks that `plan` is well formed and runnable on `inventory`.
///
/// Hardware channel modes need a trigger device whose firmware is at least
/// `min_trigger_firmware`, and all of their channels must come from one
/// configuration group and share one exposure.
pub fn validate_plan(
    plan: &SequencePlan,
    inventory: &DeviceInventory,
    min_trigger_firmware: FirmwareVersion,
) -> AcqResult<()> {
    if plan.frames == 0 {
        return Err(invalid("frame count must be at least 1"));
    }
    if !plan.interval_ms.is_finite() || plan.interval_ms < 0.0 {
        return Err(invalid(format!(
            "interval must be a non-negative number of milliseconds, got {}",
            plan.interval_ms
        )));
    }
    let span_ms = (plan.frames - 1) as f64 * plan.interval_ms;
    if span_ms / 1000.0 > MAX_TIMELAPSE_SPAN.as_secs_f64() {
        return Err(invalid(format!(
            "interval of {} ms over {} time points exceeds the {} day limit",
            plan.interval_ms,
            plan.frames,
            MAX_TIMELAPSE_SPAN.as_secs() / 86_400
        )));
    }
    if !plan.z_reference.is_finite() || plan.slices.iter().any(|z| !z.is_finite()) {
        return Err(invalid("slice positions must be finite"));
    }

    if !plan.channels.is_empty() && plan.enabled_channels().next().is_none() {
        return Err(invalid(format!(
            "all {} channels are disabled",
            plan.channels.len()
        )));
    }
    for channel in plan.enabled_channels() {
        if channel.preset.is_empty() {
            return Err(invalid("channel preset must not be empty"));
        }
        if !(channel.exposure_ms.is_finite() && channel.exposure_ms > 0.0) {
            return Err(invalid(format!(
                "channel '{}' has invalid exposure {} ms",
                channel.display_name(),
                channel.exposure_ms
            )));
        }
    }

    if !plan.slices.is_empty() && inventory.z_stage.is_none() {
        return Err(invalid(format!(
            "plan has {} slices but no focus stage is configured",
            plan.slices.len()
        )));
    }
    if plan.positions.iter().any(|p| p.z.is_some()) && inventory.z_stage.is_none() {
        return Err(invalid("plan has positions with Z but no focus stage is configured"));
    }
    if plan.positions.iter().any(|p| p.xy.is_some()) && inventory.xy_stage.is_none() {
        return Err(invalid("plan has XY positions but no XY stage is configured"));
    }

    if let Some(autofocus) = &plan.autofocus {
        if autofocus.every_n_timepoints == 0 {
            return Err(invalid("autofocus interval must be at least 1 time point"));
        }
        if !inventory.contains(&autofocus.device) {
            return Err(invalid(format!(
                "autofocus device '{}' is not in the device inventory",
                autofocus.device
            )));
        }
    }

    if plan.channel_mode.is_hardware() {
        let Some(trigger) = &inventory.trigger else {
            return Err(invalid(format!(
                "channel mode '{}' requires a hardware trigger device, but none is configured",
                plan.channel_mode
            )));
        };
        if !trigger.firmware.at_least(min_trigger_firmware) {
            return Err(invalid(format!(
                "channel mode '{}' requires trigger firmware {min_trigger_firmware} or newer, \
                 but '{}' reports {}",
                plan.channel_mode, trigger.name, trigger.firmware
            )));
        }
        let mut groups = plan.enabled_channels().map(|c| c.group.as_str());
        if let Some(first) = groups.next() {
            if let Some(other) = groups.find(|g| *g != first) {
                return Err(invalid(format!(
                    "hardware channel switching needs a single config group, found '{first}' and '{other}'"
                )));
            }
        }
        let mut exposures = plan.enabled_channels().map(|c| (c.display_name(), c.exposure_ms));
        if let Some((first, exposure)) = exposures.next() {
            if let Some((other, different)) = exposures.find(|(_, e)| *e != exposure) {
                return Err(invalid(format!(
                    "hardware channel switching runs one camera exposure, but '{first}' uses \
                     {exposure} ms and '{other}' uses {different} ms"
                )));
            }
        }
    }

    Ok(())
}
