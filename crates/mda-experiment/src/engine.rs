//! AcquisitionEngine - executes acquisition events against hardware.
//!
//! The engine pulls events from an [`EventSource`], drives the devices in the
//! [`Hardware`] bundle, and pushes every captured image into a
//! [`CircularBuffer`]. A [`BufferDrain`] task moves images and signals from
//! the buffer into the processing [`Pipeline`], and a sink task delivers the
//! pipeline output to an [`ImageSink`].
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐   run()   ┌─────────┐  pause() between events  ┌────────┐
//! │ Idle │──────────▶│ Running │─────────────────────────▶│ Paused │
//! └──────┘           └────┬────┘◀─────────resume()────────└───┬────┘
//!    ▲                    │ stop()                            │ stop()
//!    │                    ▼                                   │
//!    │               ┌──────────┐◀────────────────────────────┘
//!    │◀──────────────│ Stopping │
//!    │   drained     └──────────┘
//!    │
//!    │  completed / failed
//!    └──────────────────────────
//! ```
//!
//! Registered [`AcquisitionHook`]s run before and after the hardware step of
//! every capture and may skip it.
//!
//! # Dataflow
//!
//! ```text
//! EventSource ─▶ engine loop ─▶ CircularBuffer ─▶ BufferDrain ─▶ Pipeline ─▶ ImageSink
//!                     │                              ▲
//!                     └──── SignalEmitter ───────────┘
//! ```
//!
//! Every run ends with `AcquisitionFinished` followed by the shutdown
//! sentinel, including runs that were stopped or failed.

use crate::hooks::{AcquisitionHook, HookAction, HookPoint, HookSet};
use crate::queue::EventSource;
use crate::scheduler::Scheduler;
use crate::validation::validate_plan;
use chrono::{DateTime, Utc};
use mda_core::capabilities::{Hardware, DEVICE_POLL_INTERVAL};
use mda_core::error::{AcqError, AcqResult};
use mda_core::error_recovery::RetryPolicy;
use mda_core::event::{AcquisitionEvent, CaptureEvent, HardwareVolume, SequenceRole};
use mda_core::image::{tags, AcquisitionSignal, TaggedImage};
use mda_core::pipeline::Pipeline;
use mda_core::plan::{ChannelSpec, DeviceInventory, FirmwareVersion, SequencePlan, XyPosition};
use mda_core::sink::{dispatch_to_sink, ImageSink, SinkReport};
use mda_core::stop::StopSignal;
use mda_storage::{signal_channel, BufferDrain, CircularBuffer, DrainReport, SignalEmitter};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Engine tuning, usually loaded from the `[engine]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Longest wait for a device to report idle, or for a sequenced frame.
    pub device_timeout_ms: u64,
    /// Retry policy for individual hardware commands.
    pub retry: RetryPolicy,
    /// Focus drive label.
    pub z_stage: Option<String>,
    /// XY stage label.
    pub xy_stage: Option<String>,
    /// Further device labels, such as autofocus drives.
    pub devices: Vec<String>,
    /// Memory reserved for the circular buffer.
    pub buffer_memory_mb: usize,
    /// How long the drain waits per pop before re-checking signals.
    pub drain_poll_ms: u64,
    /// Oldest trigger firmware accepted for hardware channel modes.
    pub min_trigger_firmware: FirmwareVersion,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            device_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            z_stage: None,
            xy_stage: None,
            devices: Vec::new(),
            buffer_memory_mb: 256,
            drain_poll_ms: 20,
            min_trigger_firmware: FirmwareVersion::MIN_HARDWARE_SEQUENCING,
        }
    }
}

impl EngineSettings {
    /// Device wait timeout.
    #[must_use]
    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    /// Uses `label` as the focus drive.
    #[must_use]
    pub fn with_z_stage(mut self, label: impl Into<String>) -> Self {
        self.z_stage = Some(label.into());
        self
    }

    /// Uses `label` as the XY stage.
    #[must_use]
    pub fn with_xy_stage(mut self, label: impl Into<String>) -> Self {
        self.xy_stage = Some(label.into());
        self
    }

    /// Registers another device label.
    #[must_use]
    pub fn with_device(mut self, label: impl Into<String>) -> Self {
        self.devices.push(label.into());
        self
    }
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No acquisition running
    Idle,
    /// Executing events
    Running,
    /// Holding between events until resumed
    Paused,
    /// Stop requested; finishing the in-flight event and draining
    Stopping,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
            EngineState::Stopping => write!(f, "stopping"),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every event executed.
    Completed,
    /// A stop request ended the run early.
    Stopped,
    /// A hardware error aborted the run.
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Stopped => write!(f, "stopped"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a run accomplished.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Unique id of the run, also attached to its log span.
    pub run_uid: String,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Time from start until the sink finished.
    pub duration: Duration,
    /// How the run ended.
    pub status: RunStatus,
    /// Events executed, excluding queue wake-ups.
    pub events_executed: u64,
    /// Images pushed into the buffer.
    pub images_captured: u64,
    /// Captures a hook skipped.
    pub captures_skipped: u64,
    /// Images overwritten in the buffer before they were read.
    pub images_dropped: u64,
    /// Images the sink received.
    pub images_delivered: u64,
    /// Stage failures that forwarded the original image.
    pub stage_warnings: u64,
    /// `TimepointFinished` events executed.
    pub timepoints_completed: u64,
    /// Whether the sink saw `AcquisitionFinished`.
    pub finish_delivered: bool,
    /// The error that failed the run.
    pub failure: Option<AcqError>,
}

impl RunSummary {
    /// Turns a failed run back into its error.
    pub fn into_result(mut self) -> AcqResult<Self> {
        if self.status == RunStatus::Failed {
            if let Some(err) = self.failure.take() {
                return Err(err);
            }
        }
        Ok(self)
    }
}

enum LoopExit {
    Finished,
    Exhausted,
    Stopped,
}

/// Per-run bookkeeping for the execution loop.
struct RunContext {
    started: Instant,
    events_executed: u64,
    images_captured: u64,
    captures_skipped: u64,
    timepoints_completed: u64,
    finish_emitted: bool,
    last_config: Option<(String, String)>,
    last_exposure: Option<f64>,
    last_z: Option<f64>,
    last_xy: Option<XyPosition>,
}

impl RunContext {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            events_executed: 0,
            images_captured: 0,
            captures_skipped: 0,
            timepoints_completed: 0,
            finish_emitted: false,
            last_config: None,
            last_exposure: None,
            last_z: None,
            last_xy: None,
        }
    }
}

/// Executes acquisitions on one set of hardware, one run at a time.
pub struct AcquisitionEngine {
    hardware: Hardware,
    settings: EngineSettings,
    inventory: RwLock<DeviceInventory>,
    state: RwLock<EngineState>,
    stop: StopSignal,
    paused: watch::Sender<bool>,
    hooks: RwLock<HookSet>,
    /// Buffer of the current or most recent run.
    buffer: RwLock<Option<Arc<CircularBuffer>>>,
    active_plan: RwLock<Option<SequencePlan>>,
}

impl AcquisitionEngine {
    /// Engine over `hardware`, with the inventory derived from it.
    pub fn new(hardware: Hardware, settings: EngineSettings) -> Self {
        let mut inventory =
            hardware.inventory(settings.z_stage.as_deref(), settings.xy_stage.as_deref());
        inventory.devices.extend(settings.devices.iter().cloned());
        Self {
            hardware,
            settings,
            inventory: RwLock::new(inventory),
            state: RwLock::new(EngineState::Idle),
            stop: StopSignal::new(),
            paused: watch::channel(false).0,
            hooks: RwLock::new(HookSet::default()),
            buffer: RwLock::new(None),
            active_plan: RwLock::new(None),
        }
    }

    /// Engine settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Hardware this engine drives.
    pub fn hardware(&self) -> &Hardware {
        &self.hardware
    }

    /// Get current engine state
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Current device inventory.
    pub fn inventory(&self) -> DeviceInventory {
        self.inventory.read().clone()
    }

    /// Replaces the device inventory.
    ///
    /// A running plan is re-validated against the new inventory; if it no
    /// longer fits, the run is stopped and the validation error returned.
    pub fn set_inventory(&self, inventory: DeviceInventory) -> AcqResult<()> {
        let active = self.active_plan.read().clone();
        *self.inventory.write() = inventory;
        if let Some(plan) = active {
            if let Err(err) = self.validate(&plan) {
                error!(error = %err, "Running plan is no longer valid; stopping");
                self.request_stop();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Checks `plan` against the current inventory.
    pub fn validate(&self, plan: &SequencePlan) -> AcqResult<()> {
        let inventory = self.inventory.read();
        validate_plan(plan, &inventory, self.settings.min_trigger_firmware)
    }

    /// Asks the running acquisition to stop after its in-flight event.
    ///
    /// Device waits and interval waits in progress are abandoned.
    pub fn request_stop(&self) {
        let mut state = self.state.write();
        if matches!(*state, EngineState::Running | EngineState::Paused) {
            info!("Stop requested");
            *state = EngineState::Stopping;
        }
        self.stop.request();
    }

    /// Requests a pause before the next event.
    ///
    /// The in-flight event completes; the engine then reports
    /// [`EngineState::Paused`] until [`resume`](Self::resume) or a stop.
    pub fn pause(&self) -> AcqResult<()> {
        let state = self.state();
        if state != EngineState::Running {
            return Err(AcqError::InvalidState(format!(
                "cannot pause: engine is {state}"
            )));
        }
        info!("Pause requested");
        self.paused.send_replace(true);
        Ok(())
    }

    /// Resumes a paused acquisition, or cancels a pause not yet reached.
    pub fn resume(&self) -> AcqResult<()> {
        if !self.is_paused() {
            return Err(AcqError::InvalidState(format!(
                "cannot resume: engine is {}",
                self.state()
            )));
        }
        info!("Resuming from pause");
        self.paused.send_replace(false);
        Ok(())
    }

    /// Whether a pause is requested or in effect.
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Registers `hook` at `point`. Takes effect from the next run.
    pub fn add_hook(&self, point: HookPoint, hook: Arc<dyn AcquisitionHook>) {
        debug!(hook = hook.name(), %point, "Hook registered");
        self.hooks.write().add(point, hook);
    }

    /// Most recently captured image, without consuming it.
    pub fn latest_image(&self) -> Option<TaggedImage> {
        self.buffer.read().as_ref().and_then(|b| b.peek_latest())
    }

    /// Unread images in the circular buffer.
    pub fn remaining_count(&self) -> usize {
        self.buffer
            .read()
            .as_ref()
            .map_or(0, |b| b.remaining_count())
    }

    /// Validates and runs `plan`, delivering output to `sink`.
    ///
    /// A plan that fails validation returns `Err` before any hardware is
    /// touched. Hardware failures during the run are reported in the summary
    /// with [`RunStatus::Failed`]; see [`RunSummary::into_result`].
    pub async fn run(
        &self,
        plan: SequencePlan,
        pipeline: &mut Pipeline,
        sink: Box<dyn ImageSink>,
    ) -> AcqResult<RunSummary> {
        self.validate(&plan)?;
        info!(
            frames = plan.frames,
            channels = plan.channel_count(),
            slices = plan.slice_count(),
            positions = plan.position_count(),
            mode = %plan.channel_mode,
            expected_images = plan.expected_capture_count(),
            "Starting acquisition plan"
        );
        *self.active_plan.write() = Some(plan.clone());
        let mut scheduler = Scheduler::new(plan);
        let result = self.run_source(&mut scheduler, pipeline, sink).await;
        *self.active_plan.write() = None;
        result
    }

    /// Runs every event `source` yields, delivering output to `sink`.
    pub async fn run_source(
        &self,
        source: &mut dyn EventSource,
        pipeline: &mut Pipeline,
        sink: Box<dyn ImageSink>,
    ) -> AcqResult<RunSummary> {
        {
            let mut state = self.state.write();
            if *state != EngineState::Idle {
                return Err(AcqError::InvalidState(format!(
                    "cannot start an acquisition while the engine is {state}"
                )));
            }
            self.stop.reset();
            self.paused.send_replace(false);
            *state = EngineState::Running;
        }

        let run_uid = Uuid::new_v4().to_string();
        let span = info_span!("acquisition", run_uid = %run_uid);
        let result = self
            .execute_run(run_uid, source, pipeline, sink)
            .instrument(span)
            .await;

        *self.state.write() = EngineState::Idle;
        result
    }

    async fn execute_run(
        &self,
        run_uid: String,
        source: &mut dyn EventSource,
        pipeline: &mut Pipeline,
        mut sink: Box<dyn ImageSink>,
    ) -> AcqResult<RunSummary> {
        let started_at = Utc::now();
        let geometry = self.hardware.camera.geometry();
        let buffer = Arc::new(CircularBuffer::with_memory_mb(
            self.settings.buffer_memory_mb,
            geometry,
        ));
        *self.buffer.write() = Some(buffer.clone());

        let mut running = pipeline.start()?;
        let output = running
            .take_output()
            .ok_or_else(|| AcqError::InvalidState("pipeline output already taken".into()))?;
        let sink_task =
            tokio::spawn(
                async move { dispatch_to_sink(output, sink.as_mut()).await }.in_current_span(),
            );

        let (emitter, signals) = signal_channel(buffer.clone());
        let drain = BufferDrain::new(
            buffer.clone(),
            signals,
            running.input(),
            Duration::from_millis(self.settings.drain_poll_ms),
        );
        let drain_task = tokio::spawn(drain.run().in_current_span());

        let hooks = self.hooks.read().clone();
        info!(
            capacity = buffer.total_capacity(),
            stages = ?pipeline.stage_names(),
            hooks = hooks.len(),
            "Acquisition started"
        );

        let mut ctx = RunContext::new();
        let outcome = self
            .event_loop(source, &buffer, &emitter, &hooks, &mut ctx)
            .await;
        hooks.close_all().await;

        // Wind down in stream order: camera, finish signal, buffer, drain,
        // pipeline, sink.
        if self.hardware.camera.is_sequence_running() {
            if let Err(err) = self.hardware.camera.stop_sequence_capture().await {
                warn!(error = %err, "Failed to stop camera sequence");
            }
        }
        if !ctx.finish_emitted {
            if let Err(err) = emitter.emit(AcquisitionSignal::AcquisitionFinished) {
                warn!(error = %err, "Could not emit acquisition finished");
            }
        }
        buffer.finish();

        let drain_report = match drain_task.await {
            Ok(Ok(report)) => report,
            Ok(Err(err)) => {
                error!(error = %err, "Buffer drain failed");
                DrainReport::default()
            }
            Err(err) => {
                error!(error = %err, "Buffer drain task panicked");
                DrainReport::default()
            }
        };
        let stopped = running.join().await;
        let stage_warnings = stopped.warnings();
        pipeline.restore(stopped);
        let sink_report = sink_task.await.unwrap_or_else(|err| {
            error!(error = %err, "Sink task panicked");
            SinkReport::default()
        });

        let (status, failure) = match outcome {
            Ok(LoopExit::Finished | LoopExit::Exhausted) => (RunStatus::Completed, None),
            Ok(LoopExit::Stopped) | Err(AcqError::Interrupted) => (RunStatus::Stopped, None),
            Err(err) => {
                error!(error = %err, "Acquisition failed");
                (RunStatus::Failed, Some(err))
            }
        };

        let summary = RunSummary {
            run_uid,
            started_at,
            duration: ctx.started.elapsed(),
            status,
            events_executed: ctx.events_executed,
            images_captured: ctx.images_captured,
            captures_skipped: ctx.captures_skipped,
            images_dropped: buffer.overwritten_count(),
            images_delivered: sink_report.images,
            stage_warnings,
            timepoints_completed: ctx.timepoints_completed,
            finish_delivered: sink_report.finished,
            failure,
        };
        info!(
            status = %summary.status,
            captured = summary.images_captured,
            delivered = summary.images_delivered,
            dropped = summary.images_dropped,
            forwarded = drain_report.images_forwarded,
            stage_warnings = summary.stage_warnings,
            elapsed_ms = summary.duration.as_millis() as u64,
            "Acquisition finished"
        );
        Ok(summary)
    }

    async fn event_loop(
        &self,
        source: &mut dyn EventSource,
        buffer: &CircularBuffer,
        emitter: &SignalEmitter,
        hooks: &HookSet,
        ctx: &mut RunContext,
    ) -> AcqResult<LoopExit> {
        loop {
            if self.stop.is_requested() {
                info!(events = ctx.events_executed, "Acquisition loop stopping");
                return Ok(LoopExit::Stopped);
            }
            if self.is_paused() {
                self.wait_while_paused().await?;
                continue;
            }
            let next = tokio::select! {
                biased;
                () = self.stop.wait() => return Ok(LoopExit::Stopped),
                event = source.next_event() => event,
            };
            let Some(event) = next else {
                debug!("Event source exhausted");
                return Ok(LoopExit::Exhausted);
            };
            if matches!(event, AcquisitionEvent::RequeryQueue) {
                continue;
            }
            ctx.events_executed += 1;
            debug!(event = %event, "Executing event");

            match event {
                AcquisitionEvent::Capture(capture) => {
                    self.capture(capture, buffer, hooks, ctx).await?;
                }
                AcquisitionEvent::TimepointFinished { time } => {
                    emitter.emit(AcquisitionSignal::TimepointFinished { time })?;
                    ctx.timepoints_completed += 1;
                }
                AcquisitionEvent::AcquisitionFinished => {
                    emitter.emit(AcquisitionSignal::AcquisitionFinished)?;
                    ctx.finish_emitted = true;
                    return Ok(LoopExit::Finished);
                }
                AcquisitionEvent::AutofocusAdjustment {
                    device,
                    time,
                    target_z,
                } => {
                    info!(device = %device, time, target_z, "Running autofocus adjustment");
                    self.move_stage(&device, target_z).await?;
                }
                AcquisitionEvent::EngineTaskFinished => return Ok(LoopExit::Finished),
                AcquisitionEvent::RequeryQueue => {}
            }
        }
    }

    /// Holds until resumed. A stop while paused ends the run.
    async fn wait_while_paused(&self) -> AcqResult<()> {
        let mut paused = self.paused.subscribe();
        {
            let mut state = self.state.write();
            if *state == EngineState::Running {
                *state = EngineState::Paused;
            }
        }
        info!("Acquisition paused");
        let resumed = self
            .stop
            .guard(async move {
                let outcome = paused.wait_for(|held| !*held).await;
                outcome.is_ok()
            })
            .await;
        {
            let mut state = self.state.write();
            if *state == EngineState::Paused {
                *state = EngineState::Running;
            }
        }
        match resumed {
            Ok(true) => {
                info!("Acquisition resumed");
                Ok(())
            }
            Ok(false) | Err(_) => Err(AcqError::Interrupted),
        }
    }

    /// Runs the hooks at `point` in registration order, stopping at the
    /// first that skips.
    async fn run_hooks(
        &self,
        hooks: &HookSet,
        point: HookPoint,
        event: &mut CaptureEvent,
    ) -> AcqResult<HookAction> {
        for hook in hooks.at(point) {
            let action = hook.run(event).await.map_err(|err| AcqError::Hook {
                hook: hook.name().to_string(),
                point: point.to_string(),
                message: format!("{err:#}"),
            })?;
            if action == HookAction::Skip {
                debug!(hook = hook.name(), %point, coords = ?event.coords, "Hook skipped capture");
                return Ok(HookAction::Skip);
            }
        }
        Ok(HookAction::Continue)
    }

    async fn capture(
        &self,
        mut event: CaptureEvent,
        buffer: &CircularBuffer,
        hooks: &HookSet,
        ctx: &mut RunContext,
    ) -> AcqResult<()> {
        let start_at = ctx.started + event.min_start;
        if Instant::now() < start_at {
            self.stop.guard(sleep_until(start_at)).await?;
        }

        let mut skipped =
            self.run_hooks(hooks, HookPoint::BeforeHardware, &mut event).await? == HookAction::Skip;
        let camera = &self.hardware.camera;
        let role = event.role.clone();
        let mut image = match role {
            SequenceRole::Snap => {
                if skipped {
                    ctx.captures_skipped += 1;
                    return Ok(());
                }
                if let Some(channel) = &event.channel {
                    self.apply_channel(channel, ctx).await?;
                }
                self.apply_xy(&event, ctx).await?;
                self.apply_z(&event, ctx).await?;
                if self.run_hooks(hooks, HookPoint::AfterHardware, &mut event).await?
                    == HookAction::Skip
                {
                    ctx.captures_skipped += 1;
                    return Ok(());
                }
                self.settings
                    .retry
                    .run("snap_single", || camera.snap_single())
                    .await?
            }
            SequenceRole::SequenceStart(volume) => {
                self.apply_xy(&event, ctx).await?;
                self.start_hardware_volume(&volume, ctx).await?;
                if !skipped {
                    skipped = self.run_hooks(hooks, HookPoint::AfterHardware, &mut event).await?
                        == HookAction::Skip;
                }
                self.next_sequenced_frame().await?
            }
            SequenceRole::Sequenced => {
                if !skipped {
                    skipped = self.run_hooks(hooks, HookPoint::AfterHardware, &mut event).await?
                        == HookAction::Skip;
                }
                self.next_sequenced_frame().await?
            }
        };

        if skipped {
            // The camera sequence already produced this frame.
            debug!(coords = ?event.coords, "Discarding skipped sequence frame");
            ctx.captures_skipped += 1;
            return Ok(());
        }

        self.tag_image(&mut image, &event, ctx);
        let sequence = buffer.push(image)?;
        ctx.images_captured += 1;
        debug!(
            sequence,
            time = event.coords.time,
            channel = event.coords.channel,
            slice = event.coords.slice,
            position = event.coords.position,
            "Image captured"
        );
        Ok(())
    }

    async fn start_hardware_volume(
        &self,
        volume: &HardwareVolume,
        ctx: &mut RunContext,
    ) -> AcqResult<()> {
        let camera = &self.hardware.camera;
        if camera.is_sequence_running() {
            self.settings
                .retry
                .run("stop_sequence_capture", || camera.stop_sequence_capture())
                .await?;
        }
        let trigger = self.hardware.trigger.as_ref().ok_or_else(|| AcqError::Hardware {
            operation: "load_sequence".into(),
            message: "no trigger controller available".into(),
        })?;

        // The controller steps Z and switches channels from here on.
        self.settings
            .retry
            .run("load_sequence", || trigger.load_sequence(volume))
            .await?;
        ctx.last_z = None;
        ctx.last_config = None;

        if let Some(exposure) = volume.channels.first().map(|c| c.exposure_ms) {
            if ctx.last_exposure != Some(exposure) {
                self.settings
                    .retry
                    .run("set_exposure", || camera.set_exposure(exposure))
                    .await?;
                ctx.last_exposure = Some(exposure);
            }
        }

        let frames = volume.frame_count();
        self.settings
            .retry
            .run("start_sequence_capture", || {
                camera.start_sequence_capture(frames, 0.0)
            })
            .await?;
        info!(
            trigger = trigger.device_name(),
            frames,
            mode = %volume.mode,
            "Hardware sequence started"
        );
        Ok(())
    }

    async fn next_sequenced_frame(&self) -> AcqResult<TaggedImage> {
        let camera = &self.hardware.camera;
        let timeout = self.settings.device_timeout();
        let deadline = Instant::now() + timeout;
        let frame_ready = async {
            while camera.remaining_image_count() == 0 {
                if Instant::now() >= deadline {
                    return Err(AcqError::HardwareTimeout {
                        device: camera.camera_name().to_string(),
                        timeout,
                    });
                }
                sleep(DEVICE_POLL_INTERVAL).await;
            }
            Ok(())
        };
        self.stop.guard(frame_ready).await??;
        self.settings
            .retry
            .run("pop_next_image", || camera.pop_next_image())
            .await
    }

    async fn apply_channel(&self, channel: &ChannelSpec, ctx: &mut RunContext) -> AcqResult<()> {
        let wanted = (channel.group.clone(), channel.preset.clone());
        if ctx.last_config.as_ref() != Some(&wanted) {
            let devices = &self.hardware.devices;
            self.settings
                .retry
                .run("set_config", || {
                    devices.set_config(&channel.group, &channel.preset)
                })
                .await?;
            debug!(group = %channel.group, preset = %channel.preset, "Channel preset applied");
            ctx.last_config = Some(wanted);
        }
        if ctx.last_exposure != Some(channel.exposure_ms) {
            let camera = &self.hardware.camera;
            self.settings
                .retry
                .run("set_exposure", || camera.set_exposure(channel.exposure_ms))
                .await?;
            ctx.last_exposure = Some(channel.exposure_ms);
        }
        Ok(())
    }

    async fn apply_xy(&self, event: &CaptureEvent, ctx: &mut RunContext) -> AcqResult<()> {
        let Some(target) = event.xy_position else {
            return Ok(());
        };
        if ctx.last_xy == Some(target) {
            return Ok(());
        }
        let stage = self.inventory.read().xy_stage.clone().ok_or_else(|| {
            AcqError::Configuration("capture targets an XY position but no XY stage is set".into())
        })?;
        let devices = &self.hardware.devices;
        self.wait_for_device(&stage).await?;
        self.settings
            .retry
            .run("set_xy_position", || devices.set_xy_position(&stage, target))
            .await?;
        self.wait_for_device(&stage).await?;
        ctx.last_xy = Some(target);
        Ok(())
    }

    async fn apply_z(&self, event: &CaptureEvent, ctx: &mut RunContext) -> AcqResult<()> {
        let Some(target) = event.z_position else {
            return Ok(());
        };
        if ctx.last_z == Some(target) {
            return Ok(());
        }
        let stage = self.inventory.read().z_stage.clone().ok_or_else(|| {
            AcqError::Configuration("capture targets a Z position but no focus stage is set".into())
        })?;
        self.move_stage(&stage, target).await?;
        ctx.last_z = Some(target);
        Ok(())
    }

    /// Waits for `device`, moves it, and waits for it to settle.
    async fn move_stage(&self, device: &str, target: f64) -> AcqResult<()> {
        let devices = &self.hardware.devices;
        self.wait_for_device(device).await?;
        self.settings
            .retry
            .run("set_position", || devices.set_position(device, target))
            .await?;
        self.wait_for_device(device).await?;
        debug!(device, target, "Stage moved");
        Ok(())
    }

    /// Waits for `device` to settle, abandoning the wait on stop.
    async fn wait_for_device(&self, device: &str) -> AcqResult<()> {
        let timeout = self.settings.device_timeout();
        self.stop
            .guard(self.hardware.devices.wait_for_device(device, timeout))
            .await?
    }

    fn tag_image(&self, image: &mut TaggedImage, event: &CaptureEvent, ctx: &RunContext) {
        let coords = event.coords;
        let camera_name = self.hardware.camera.camera_name().to_string();
        let elapsed_ms = ctx.started.elapsed().as_secs_f64() * 1000.0;
        let image_tags = image.tags_mut();
        image_tags.insert(tags::FRAME_INDEX, coords.time);
        image_tags.insert(tags::CHANNEL_INDEX, coords.channel);
        image_tags.insert(tags::SLICE_INDEX, coords.slice);
        image_tags.insert(tags::POSITION_INDEX, coords.position);
        image_tags.insert(tags::ELAPSED_MS, elapsed_ms);
        if image_tags.get(tags::CAMERA).is_none() {
            image_tags.insert(tags::CAMERA, camera_name);
        }
        if let Some(channel) = &event.channel {
            image_tags.insert(tags::CHANNEL, channel.display_name());
            image_tags.insert(tags::EXPOSURE_MS, channel.exposure_ms);
        }
        if let Some(z) = event.z_position {
            image_tags.insert(tags::Z_UM, z);
        }
        if let Some(xy) = event.xy_position {
            image_tags.insert(tags::X_UM, xy.x);
            image_tags.insert(tags::Y_UM, xy.y);
        }
        if let Some(label) = &event.position_label {
            image_tags.insert(tags::POSITION_NAME, label.as_str());
        }
    }
}

impl std::fmt::Debug for AcquisitionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionEngine")
            .field("hardware", &self.hardware)
            .field("state", &self.state())
            .field("settings", &self.settings)
            .field("hooks", &*self.hooks.read())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_and_serde() {
        let settings = EngineSettings::default();
        assert_eq!(settings.device_timeout(), Duration::from_secs(10));
        assert_eq!(settings.retry.max_attempts, 6);
        assert_eq!(settings.min_trigger_firmware, FirmwareVersion::new(3, 9));

        let json = r#"{"device_timeout_ms": 250, "z_stage": "Z", "min_trigger_firmware": "3.10"}"#;
        let parsed: EngineSettings = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.device_timeout_ms, 250);
        assert_eq!(parsed.z_stage.as_deref(), Some("Z"));
        assert_eq!(parsed.min_trigger_firmware, FirmwareVersion::new(3, 10));
        assert_eq!(parsed.drain_poll_ms, settings.drain_poll_ms);
    }

    #[test]
    fn failed_summary_converts_to_error() {
        let summary = RunSummary {
            run_uid: "run".into(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
            status: RunStatus::Failed,
            events_executed: 1,
            images_captured: 0,
            captures_skipped: 0,
            images_dropped: 0,
            images_delivered: 0,
            stage_warnings: 0,
            timepoints_completed: 0,
            finish_delivered: true,
            failure: Some(AcqError::HardwareTimeout {
                device: "Z".into(),
                timeout: Duration::from_millis(5),
            }),
        };
        assert!(matches!(
            summary.clone().into_result(),
            Err(AcqError::HardwareTimeout { .. })
        ));

        let stopped = RunSummary {
            status: RunStatus::Stopped,
            failure: None,
            ..summary
        };
        assert!(stopped.into_result().is_ok());
    }

    #[test]
    fn state_display() {
        assert_eq!(EngineState::Stopping.to_string(), "stopping");
        assert_eq!(EngineState::Paused.to_string(), "paused");
        assert_eq!(RunStatus::Completed.to_string(), "completed");
    }
}
