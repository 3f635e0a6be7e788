//! Acquisition hooks.
//!
//! Hooks run around the hardware step of every capture:
//!
//! ```text
//! BeforeHardware hooks ─▶ stages, presets, sequence load ─▶ AfterHardware hooks ─▶ image
//! ```
//!
//! A hook may edit the capture or skip it. A skipped snap touches no further
//! hardware and produces no image. A skipped frame of a hardware sequence is
//! still read from the camera, so the sequence stays in step, and then
//! discarded.

use anyhow::Result;
use async_trait::async_trait;
use mda_core::event::CaptureEvent;
use std::fmt;
use std::sync::Arc;

/// Where in the capture a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Before any device is moved for the capture.
    BeforeHardware,
    /// After the devices settled, before the camera exposes.
    AfterHardware,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPoint::BeforeHardware => write!(f, "before_hardware"),
            HookPoint::AfterHardware => write!(f, "after_hardware"),
        }
    }
}

/// What the engine does with a capture after a hook ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Carry on with the (possibly edited) capture.
    Continue,
    /// Drop this capture; later hooks for it do not run.
    Skip,
}

/// User code run by the engine around each capture.
#[async_trait]
pub trait AcquisitionHook: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Inspects or edits `event`. An error fails the run.
    async fn run(&self, event: &mut CaptureEvent) -> Result<HookAction>;

    /// Called once when the run that used this hook ends.
    async fn close(&self) {}
}

/// Hooks registered on an engine, per [`HookPoint`].
#[derive(Clone, Default)]
pub(crate) struct HookSet {
    before: Vec<Arc<dyn AcquisitionHook>>,
    after: Vec<Arc<dyn AcquisitionHook>>,
}

impl HookSet {
    pub(crate) fn add(&mut self, point: HookPoint, hook: Arc<dyn AcquisitionHook>) {
        match point {
            HookPoint::BeforeHardware => self.before.push(hook),
            HookPoint::AfterHardware => self.after.push(hook),
        }
    }

    pub(crate) fn at(&self, point: HookPoint) -> &[Arc<dyn AcquisitionHook>] {
        match point {
            HookPoint::BeforeHardware => &self.before,
            HookPoint::AfterHardware => &self.after,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.before.len() + self.after.len()
    }

    /// Closes every hook once, before-hardware hooks first.
    pub(crate) async fn close_all(&self) {
        for hook in self.before.iter().chain(&self.after) {
            hook.close().await;
        }
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |hooks: &[Arc<dyn AcquisitionHook>]| {
            hooks.iter().map(|h| h.name().to_string()).collect::<Vec<_>>()
        };
        f.debug_struct("HookSet")
            .field("before", &names(&self.before))
            .field("after", &names(&self.after))
            .finish()
    }
}
