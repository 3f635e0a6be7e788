//! End-to-end engine runs against the simulated microscope.

use mda_core::error::AcqError;
use mda_core::error_recovery::RetryPolicy;
use mda_core::event::{AcquisitionEvent, AxisCoords, CaptureEvent};
use mda_core::image::tags;
use mda_core::pipeline::stages::ChannelSplitter;
use mda_core::pipeline::Pipeline;
use mda_core::plan::{ChannelMode, ChannelSpec, FirmwareVersion, SequencePlan, StagePosition};
use mda_core::sink::{RecordingSink, SinkRecord};
use mda_driver_mock::{DeviceCall, MockMicroscope};
use mda_experiment::{
    AcquisitionEngine, AcquisitionHook, EngineSettings, EngineState, EventQueue, HookAction,
    HookPoint, RunStatus,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_test::traced_test;

fn settings() -> EngineSettings {
    EngineSettings {
        device_timeout_ms: 500,
        retry: RetryPolicy::new(3, 1),
        buffer_memory_mb: 1,
        drain_poll_ms: 5,
        ..Default::default()
    }
    .with_z_stage("Z")
    .with_xy_stage("XY")
}

fn engine(scope: &MockMicroscope) -> AcquisitionEngine {
    AcquisitionEngine::new(scope.hardware(), settings())
}

fn channel_names(sink: &RecordingSink) -> Vec<String> {
    sink.images()
        .iter()
        .map(|image| {
            image
                .tags()
                .get(tags::CHANNEL)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}

#[tokio::test]
async fn two_channel_z_stack_delivers_images_then_signals() {
    let scope = MockMicroscope::new(8, 8);
    let engine = engine(&scope);
    let plan = SequencePlan::new(1)
        .with_channel(ChannelSpec::new("Channel", "DAPI", 10.0))
        .with_channel(ChannelSpec::new("Channel", "FITC", 15.0))
        .with_relative_slices(0.0, vec![-1.0, 0.0, 1.0]);
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();

    let summary = engine
        .run(plan, &mut pipeline, Box::new(sink.clone()))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.images_captured, 6);
    assert_eq!(summary.images_delivered, 6);
    assert_eq!(summary.images_dropped, 0);
    assert_eq!(summary.timepoints_completed, 1);
    assert!(summary.finish_delivered);

    let records = sink.records();
    assert_eq!(records.len(), 8);
    assert!(records[..6]
        .iter()
        .all(|r| matches!(r, SinkRecord::Image(_))));
    assert_eq!(records[6], SinkRecord::TimepointFinished(0));
    assert_eq!(records[7], SinkRecord::AcquisitionFinished);

    assert_eq!(
        channel_names(&sink),
        ["DAPI", "DAPI", "DAPI", "FITC", "FITC", "FITC"]
    );
    let slices: Vec<_> = sink
        .images()
        .iter()
        .map(|image| image.slice_index())
        .collect();
    assert_eq!(
        slices,
        [Some(0), Some(1), Some(2), Some(0), Some(1), Some(2)]
    );

    let z_moves: Vec<f64> = scope
        .devices
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            DeviceCall::SetPosition { device, value } if device == "Z" => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(z_moves, [-1.0, 0.0, 1.0, -1.0, 0.0, 1.0]);
    assert_eq!(scope.camera.exposure_ms(), 15.0);
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn stuck_stage_fails_the_run_but_still_finishes_the_stream() {
    let scope = MockMicroscope::new(4, 4);
    scope.devices.make_stuck("Z");
    let engine = AcquisitionEngine::new(
        scope.hardware(),
        EngineSettings {
            device_timeout_ms: 30,
            ..settings()
        },
    );
    let plan = SequencePlan::new(2).with_relative_slices(0.0, vec![0.0, 1.0]);
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();

    let summary = engine
        .run(plan, &mut pipeline, Box::new(sink.clone()))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    assert!(matches!(
        summary.failure,
        Some(AcqError::HardwareTimeout { ref device, .. }) if device == "Z"
    ));
    assert_eq!(summary.images_captured, 0);
    assert_eq!(sink.records(), vec![SinkRecord::AcquisitionFinished]);
    assert!(summary.into_result().is_err());
    assert!(!pipeline.is_running());
}

#[tokio::test]
async fn stop_request_ends_a_timelapse_early() {
    let scope = MockMicroscope::new(4, 4);
    let engine = engine(&scope);
    let plan = SequencePlan::new(100).with_interval_ms(20.0);
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();

    let (result, ()) = tokio::join!(
        engine.run(plan, &mut pipeline, Box::new(sink.clone())),
        async {
            tokio::time::sleep(Duration::from_millis(70)).await;
            engine.request_stop();
        }
    );
    let summary = result.unwrap();

    assert_eq!(summary.status, RunStatus::Stopped);
    assert!(summary.images_captured >= 1);
    assert!(summary.images_captured < 100);
    assert_eq!(summary.images_delivered, summary.images_captured);
    assert_eq!(sink.records().last(), Some(&SinkRecord::AcquisitionFinished));
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn per_slice_hardware_mode_runs_a_triggered_sequence() {
    let scope = MockMicroscope::new(4, 4).with_trigger(FirmwareVersion::new(3, 10));
    let engine = engine(&scope);
    let plan = SequencePlan::new(1)
        .with_channel(ChannelSpec::new("Laser", "488", 5.0))
        .with_channel(ChannelSpec::new("Laser", "561", 5.0))
        .with_relative_slices(10.0, vec![0.0, 1.0, 2.0])
        .with_channel_mode(ChannelMode::PerSliceHardware);
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();

    let summary = engine
        .run(plan, &mut pipeline, Box::new(sink.clone()))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.images_delivered, 6);
    assert_eq!(scope.camera.sequences_started(), 1);

    let trigger = scope.trigger.as_ref().unwrap();
    let loaded = trigger.loaded();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].frame_count(), 6);
    assert_eq!(loaded[0].z_positions, [10.0, 11.0, 12.0]);

    let channels: Vec<_> = sink
        .images()
        .iter()
        .map(|image| image.channel_index())
        .collect();
    assert_eq!(
        channels,
        [Some(0), Some(1), Some(0), Some(1), Some(0), Some(1)]
    );
    assert_eq!(channel_names(&sink), ["488", "561", "488", "561", "488", "561"]);

    // The controller switches channels and steps Z; no software commands.
    assert!(scope.devices.calls().is_empty());
}

#[tokio::test]
async fn hardware_mode_without_trigger_is_rejected_before_running() {
    let scope = MockMicroscope::new(4, 4);
    let engine = engine(&scope);
    let plan = SequencePlan::new(1)
        .with_channel(ChannelSpec::new("Laser", "488", 5.0))
        .with_channel_mode(ChannelMode::PerVolumeHardware);
    let mut pipeline = Pipeline::default();

    let err = engine
        .run(plan, &mut pipeline, Box::new(RecordingSink::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, AcqError::PlanValidation(ref m) if m.contains("trigger")));
    assert_eq!(scope.camera.frames_generated(), 0);
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
#[traced_test]
async fn transient_snap_failures_are_retried() {
    let scope = MockMicroscope::new(4, 4);
    scope.camera.fail_next_snaps(2);
    let engine = engine(&scope);
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();

    let summary = engine
        .run(SequencePlan::new(1), &mut pipeline, Box::new(sink.clone()))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(sink.images().len(), 1);
    assert!(logs_contain("Hardware command failed, retrying"));
}

#[tokio::test]
async fn exhausted_snap_retries_fail_the_run() {
    let scope = MockMicroscope::new(4, 4);
    scope.camera.fail_next_snaps(10);
    let engine = engine(&scope);
    let mut pipeline = Pipeline::default();

    let summary = engine
        .run(
            SequencePlan::new(1),
            &mut pipeline,
            Box::new(RecordingSink::new()),
        )
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    assert!(matches!(
        summary.failure,
        Some(AcqError::Hardware { ref operation, .. }) if operation == "snap_single"
    ));
}

#[tokio::test]
async fn splitting_stage_doubles_the_delivered_images() {
    let scope = MockMicroscope::new(8, 4);
    let engine = engine(&scope);
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();
    pipeline
        .add_stage(Box::new(ChannelSplitter::new()))
        .unwrap();

    let summary = engine
        .run(SequencePlan::new(2), &mut pipeline, Box::new(sink.clone()))
        .await
        .unwrap();

    assert_eq!(summary.images_captured, 2);
    assert_eq!(summary.images_delivered, 4);
    let images = sink.images();
    assert!(images.iter().all(|image| image.width() == 4));
    let channels: Vec<_> = images.iter().map(|image| image.channel_index()).collect();
    assert_eq!(channels, [Some(0), Some(1), Some(0), Some(1)]);

    // The pipeline keeps its stages for the next run.
    assert_eq!(pipeline.stage_names(), ["channel-splitter"]);
}

#[tokio::test]
async fn queued_events_run_until_the_task_finishes() {
    let scope = MockMicroscope::new(4, 4);
    let engine = engine(&scope);
    let (handle, mut queue) = EventQueue::new(8);
    let coords = |time| AxisCoords {
        time,
        ..Default::default()
    };
    handle
        .submit_all([
            AcquisitionEvent::Capture(CaptureEvent::snap(coords(0))),
            AcquisitionEvent::RequeryQueue,
            AcquisitionEvent::Capture(CaptureEvent::snap(coords(1))),
            AcquisitionEvent::TimepointFinished { time: 1 },
        ])
        .await
        .unwrap();
    handle.finish().await.unwrap();

    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();
    let summary = engine
        .run_source(&mut queue, &mut pipeline, Box::new(sink.clone()))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.events_executed, 4);
    let records = sink.records();
    assert_eq!(records.len(), 4);
    assert_eq!(records[2], SinkRecord::TimepointFinished(1));
    assert_eq!(records[3], SinkRecord::AcquisitionFinished);
}

#[tokio::test]
async fn unchanged_position_and_preset_are_not_reissued() {
    let scope = MockMicroscope::new(4, 4);
    let engine = engine(&scope);
    let plan = SequencePlan::new(3)
        .with_channel(ChannelSpec::new("Channel", "DAPI", 10.0))
        .with_position(StagePosition::xy("A1", 100.0, 200.0));
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();

    engine
        .run(plan, &mut pipeline, Box::new(sink.clone()))
        .await
        .unwrap();

    let calls = scope.devices.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(calls[0], DeviceCall::SetConfig { ref preset, .. } if preset == "DAPI"));
    assert!(matches!(calls[1], DeviceCall::SetXy { ref device, .. } if device == "XY"));

    let first = &sink.images()[0];
    assert_eq!(
        first.tags().get(tags::POSITION_NAME).and_then(|v| v.as_str()),
        Some("A1")
    );
    assert_eq!(
        first.tags().get(tags::X_UM).and_then(|v| v.as_f64()),
        Some(100.0)
    );
}

#[tokio::test]
async fn autofocus_runs_on_its_time_points() {
    let scope = MockMicroscope::new(4, 4);
    let engine = AcquisitionEngine::new(scope.hardware(), settings().with_device("Autofocus"));
    let plan = SequencePlan::new(5)
        .with_relative_slices(3.0, vec![0.0])
        .with_autofocus("Autofocus", 2);
    let mut pipeline = Pipeline::default();

    let summary = engine
        .run(plan, &mut pipeline, Box::new(RecordingSink::new()))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    let autofocus_moves = scope
        .devices
        .calls()
        .into_iter()
        .filter(|call| {
            matches!(call, DeviceCall::SetPosition { device, value }
                if device == "Autofocus" && *value == 3.0)
        })
        .count();
    // Time points 2 and 4.
    assert_eq!(autofocus_moves, 2);
}

#[tokio::test]
async fn losing_a_required_device_stops_the_run() {
    let scope = MockMicroscope::new(4, 4);
    let engine = engine(&scope);
    let plan = SequencePlan::new(100)
        .with_interval_ms(20.0)
        .with_relative_slices(0.0, vec![0.0]);
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();

    let (result, changed) = tokio::join!(
        engine.run(plan, &mut pipeline, Box::new(sink.clone())),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut inventory = engine.inventory();
            inventory.z_stage = None;
            engine.set_inventory(inventory)
        }
    );

    assert!(matches!(changed, Err(AcqError::PlanValidation(_))));
    let summary = result.unwrap();
    assert_eq!(summary.status, RunStatus::Stopped);
    assert!(summary.images_captured < 100);
    assert_eq!(sink.records().last(), Some(&SinkRecord::AcquisitionFinished));
}

#[tokio::test]
async fn latest_image_is_available_after_the_run() {
    let scope = MockMicroscope::new(4, 4);
    let engine = engine(&scope);
    assert!(engine.latest_image().is_none());
    let mut pipeline = Pipeline::default();

    engine
        .run(
            SequencePlan::new(3),
            &mut pipeline,
            Box::new(RecordingSink::new()),
        )
        .await
        .unwrap();

    let latest = engine.latest_image().unwrap();
    assert_eq!(latest.frame_index(), Some(2));
    assert_eq!(engine.remaining_count(), 0);
}

#[tokio::test]
async fn stop_interrupts_a_wait_on_a_stuck_stage() {
    let scope = MockMicroscope::new(4, 4);
    scope.devices.make_stuck("Z");
    let engine = AcquisitionEngine::new(
        scope.hardware(),
        EngineSettings {
            device_timeout_ms: 2_000,
            ..settings()
        },
    );
    let plan = SequencePlan::new(1).with_relative_slices(0.0, vec![0.0]);
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();
    let started = Instant::now();

    let (result, ()) = tokio::join!(
        engine.run(plan, &mut pipeline, Box::new(sink.clone())),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.request_stop();
        }
    );
    let summary = result.unwrap();

    assert_eq!(summary.status, RunStatus::Stopped);
    assert!(summary.failure.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(sink.records(), vec![SinkRecord::AcquisitionFinished]);
    assert_eq!(engine.state(), EngineState::Idle);
}

async fn wait_for_state(engine: &AcquisitionEngine, wanted: EngineState) {
    for _ in 0..200 {
        if engine.state() == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("engine never reached {wanted}, still {}", engine.state());
}

#[tokio::test]
async fn pause_holds_between_events_until_resumed() {
    let scope = MockMicroscope::new(4, 4);
    let engine = engine(&scope);
    assert!(engine.pause().is_err());
    assert!(engine.resume().is_err());

    let plan = SequencePlan::new(3).with_interval_ms(100.0);
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();

    let (result, ()) = tokio::join!(
        engine.run(plan, &mut pipeline, Box::new(sink.clone())),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            engine.pause().unwrap();
            assert!(engine.is_paused());
            wait_for_state(&engine, EngineState::Paused).await;

            // Time point 2 would start at 200 ms if the engine kept going.
            let frames_at_pause = scope.camera.frames_generated();
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(scope.camera.frames_generated(), frames_at_pause);
            assert_eq!(engine.state(), EngineState::Paused);

            engine.resume().unwrap();
        }
    );
    let summary = result.unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.images_delivered, 3);
    assert!(!engine.is_paused());
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn stop_while_paused_ends_the_run() {
    let scope = MockMicroscope::new(4, 4);
    let engine = engine(&scope);
    let plan = SequencePlan::new(50).with_interval_ms(20.0);
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();

    let (result, ()) = tokio::join!(
        engine.run(plan, &mut pipeline, Box::new(sink.clone())),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            engine.pause().unwrap();
            wait_for_state(&engine, EngineState::Paused).await;
            engine.request_stop();
        }
    );
    let summary = result.unwrap();

    assert_eq!(summary.status, RunStatus::Stopped);
    assert!(summary.images_captured < 50);
    assert_eq!(summary.images_delivered, summary.images_captured);
    assert_eq!(sink.records().last(), Some(&SinkRecord::AcquisitionFinished));
    assert_eq!(engine.state(), EngineState::Idle);
}

/// Skips captures of one channel and relabels the rest.
struct ChannelFilter {
    point: HookPoint,
    skip_channel: usize,
    closed: AtomicU32,
}

impl ChannelFilter {
    fn new(point: HookPoint, skip_channel: usize) -> Arc<Self> {
        Arc::new(Self {
            point,
            skip_channel,
            closed: AtomicU32::new(0),
        })
    }
}

#[async_trait::async_trait]
impl AcquisitionHook for ChannelFilter {
    fn name(&self) -> &str {
        "channel-filter"
    }

    async fn run(&self, event: &mut CaptureEvent) -> anyhow::Result<HookAction> {
        if event.coords.channel == self.skip_channel {
            return Ok(HookAction::Skip);
        }
        event.position_label = Some(format!("kept-{}", self.point));
        Ok(HookAction::Continue)
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn before_hardware_hook_skips_a_channel_without_touching_devices() {
    let scope = MockMicroscope::new(4, 4);
    let engine = engine(&scope);
    let hook = ChannelFilter::new(HookPoint::BeforeHardware, 1);
    engine.add_hook(HookPoint::BeforeHardware, hook.clone());
    let plan = SequencePlan::new(2)
        .with_channel(ChannelSpec::new("Channel", "DAPI", 10.0))
        .with_channel(ChannelSpec::new("Channel", "FITC", 15.0));
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();

    let summary = engine
        .run(plan, &mut pipeline, Box::new(sink.clone()))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.images_captured, 2);
    assert_eq!(summary.captures_skipped, 2);
    assert_eq!(channel_names(&sink), ["DAPI", "DAPI"]);
    assert!(sink.images().iter().all(|image| {
        image.tags().get(tags::POSITION_NAME).and_then(|v| v.as_str())
            == Some("kept-before_hardware")
    }));
    assert!(!scope
        .devices
        .calls()
        .iter()
        .any(|call| matches!(call, DeviceCall::SetConfig { preset, .. } if preset == "FITC")));
    assert_eq!(hook.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn after_hardware_skip_discards_sequenced_frames() {
    let scope = MockMicroscope::new(4, 4).with_trigger(FirmwareVersion::new(3, 10));
    let engine = engine(&scope);
    engine.add_hook(
        HookPoint::AfterHardware,
        ChannelFilter::new(HookPoint::AfterHardware, 1),
    );
    let plan = SequencePlan::new(1)
        .with_channel(ChannelSpec::new("Laser", "488", 5.0))
        .with_channel(ChannelSpec::new("Laser", "561", 5.0))
        .with_relative_slices(10.0, vec![0.0, 1.0, 2.0])
        .with_channel_mode(ChannelMode::PerSliceHardware);
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();

    let summary = engine
        .run(plan, &mut pipeline, Box::new(sink.clone()))
        .await
        .unwrap();

    // Every frame of the sequence is read; the 561 frames are dropped.
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(scope.camera.sequences_started(), 1);
    assert_eq!(summary.images_captured, 3);
    assert_eq!(summary.captures_skipped, 3);
    assert_eq!(channel_names(&sink), ["488", "488", "488"]);
}

struct Failing;

#[async_trait::async_trait]
impl AcquisitionHook for Failing {
    fn name(&self) -> &str {
        "drift-check"
    }

    async fn run(&self, _event: &mut CaptureEvent) -> anyhow::Result<HookAction> {
        anyhow::bail!("reference bead lost")
    }
}

#[tokio::test]
async fn failing_hook_fails_the_run() {
    let scope = MockMicroscope::new(4, 4);
    let engine = engine(&scope);
    engine.add_hook(HookPoint::BeforeHardware, Arc::new(Failing));
    let sink = RecordingSink::new();
    let mut pipeline = Pipeline::default();

    let summary = engine
        .run(SequencePlan::new(2), &mut pipeline, Box::new(sink.clone()))
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    assert!(matches!(
        summary.failure,
        Some(AcqError::Hook { ref hook, ref message, .. })
            if hook == "drift-check" && message.contains("reference bead lost")
    ));
    assert_eq!(summary.images_captured, 0);
    assert_eq!(sink.records(), vec![SinkRecord::AcquisitionFinished]);
}

#[tokio::test]
async fn hardware_mode_with_mixed_exposures_is_rejected() {
    let scope = MockMicroscope::new(4, 4).with_trigger(FirmwareVersion::new(3, 10));
    let engine = engine(&scope);
    let plan = SequencePlan::new(1)
        .with_channel(ChannelSpec::new("Laser", "488", 5.0))
        .with_channel(ChannelSpec::new("Laser", "561", 50.0))
        .with_relative_slices(10.0, vec![0.0, 1.0])
        .with_channel_mode(ChannelMode::PerSliceHardware);
    let mut pipeline = Pipeline::default();

    let err = engine
        .run(plan, &mut pipeline, Box::new(RecordingSink::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, AcqError::PlanValidation(ref m) if m.contains("one camera exposure")));
    assert_eq!(scope.camera.sequences_started(), 0);
}
