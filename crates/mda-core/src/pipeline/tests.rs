use super::stages::{ChannelSplitter, FrameAverager, PassThrough, TagAnnotator};
use super::*;
use crate::image::{tags, AcquisitionSignal, PixelType, TagValue};
use parking_lot::Mutex as SyncMutex;
use std::time::Duration;
use tokio::time::timeout;

fn image(width: u32, pixels: Vec<u8>, channel: usize) -> TaggedImage {
    TaggedImage::new(width, 1, PixelType::Gray8, pixels)
        .unwrap()
        .with_tag(tags::CHANNEL_INDEX, channel)
        .with_tag(tags::CHANNEL, "DAPI")
}

async fn collect_until_shutdown(rx: &mut mpsc::Receiver<Packet>) -> Vec<Packet> {
    let mut packets = Vec::new();
    loop {
        let packet = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("pipeline stalled")
            .expect("output closed before sentinel");
        let done = packet.is_shutdown();
        packets.push(packet);
        if done {
            return packets;
        }
    }
}

struct FailsOnChannel {
    channel: usize,
}

impl ImageProcessor for FailsOnChannel {
    fn name(&self) -> &str {
        "fails-on-channel"
    }

    fn process(&mut self, image: &TaggedImage, out: &mut Produced) -> anyhow::Result<()> {
        // Partial output that must be discarded on failure.
        out.produce(image.clone().with_tag("Touched", true));
        if image.channel_index() == Some(self.channel) {
            anyhow::bail!("cannot handle channel {}", self.channel);
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingObserver {
    errors: SyncMutex<Vec<(String, String)>>,
}

impl StageErrorObserver for RecordingObserver {
    fn on_stage_error(&self, stage: &str, error: &AcqError) {
        self.errors.lock().push((stage.to_string(), error.to_string()));
    }
}

#[derive(Default)]
struct RecordingListener {
    changes: SyncMutex<Vec<Vec<String>>>,
}

impl PipelineListener for RecordingListener {
    fn on_pipeline_changed(&self, stages: &[String]) {
        self.changes.lock().push(stages.to_vec());
    }
}

struct CountsResets {
    resets: Arc<AtomicU64>,
}

impl ImageProcessor for CountsResets {
    fn name(&self) -> &str {
        "counts-resets"
    }

    fn process(&mut self, image: &TaggedImage, out: &mut Produced) -> anyhow::Result<()> {
        out.produce(image.clone());
        Ok(())
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn split_then_pass_through_delivers_both_halves_then_sentinel() {
    let mut pipeline = Pipeline::new(4);
    pipeline.add_stage(Box::new(ChannelSplitter::new())).unwrap();
    pipeline.add_stage(Box::new(PassThrough::new("pass"))).unwrap();
    let mut running = pipeline.start().unwrap();
    let mut output = running.take_output().unwrap();
    let input = running.input();

    input
        .send(Packet::Image(image(4, vec![1, 2, 3, 4], 0)))
        .await
        .unwrap();
    input.shutdown().await.unwrap();

    let packets = collect_until_shutdown(&mut output).await;
    assert_eq!(packets.len(), 3);
    let left = packets[0].as_image().unwrap();
    let right = packets[1].as_image().unwrap();
    assert_eq!(left.pixels().as_ref(), &[1, 2]);
    assert_eq!(right.pixels().as_ref(), &[3, 4]);
    assert_eq!(left.channel_index(), Some(0));
    assert_eq!(right.channel_index(), Some(1));
    assert!(packets[2].is_shutdown());
    assert!(output.recv().await.is_none());

    let stopped = running.join().await;
    assert_eq!(stopped.warnings(), 0);
    pipeline.restore(stopped);
    assert_eq!(pipeline.stage_names(), vec!["channel-splitter", "pass"]);
}

#[tokio::test]
async fn sentinel_pushed_twice_is_forwarded_once() {
    let mut pipeline = Pipeline::new(4);
    pipeline.add_stage(Box::new(PassThrough::new("a"))).unwrap();
    pipeline.add_stage(Box::new(PassThrough::new("b"))).unwrap();
    let mut running = pipeline.start().unwrap();
    let mut output = running.take_output().unwrap();
    let input = running.input();

    input.shutdown().await.unwrap();
    input.shutdown().await.unwrap();
    let rejected = input.send(Packet::Image(image(2, vec![0, 0], 0))).await;
    assert!(matches!(rejected, Err(AcqError::PipelineClosed)));

    let packets = collect_until_shutdown(&mut output).await;
    assert_eq!(packets, vec![Packet::Shutdown]);
    assert!(timeout(Duration::from_secs(5), output.recv())
        .await
        .unwrap()
        .is_none());
    running.join().await;
}

#[tokio::test]
async fn sentinel_is_forwarded_once_per_stage_even_if_queued_twice() {
    let (tx, rx) = mpsc::channel(4);
    let (out_tx, mut out_rx) = mpsc::channel(4);
    let worker = StageWorker {
        processor: Box::new(PassThrough::new("raw")),
        input: rx,
        output: out_tx,
        state: Arc::new(StateCell::new()),
        stats: Arc::new(PipelineStats::default()),
        observers: Vec::new(),
    };
    tx.send(Packet::Shutdown).await.unwrap();
    tx.send(Packet::Shutdown).await.unwrap();
    let handle = tokio::task::spawn_blocking(move || worker.run());
    handle.await.unwrap();

    assert_eq!(out_rx.recv().await, Some(Packet::Shutdown));
    assert_eq!(out_rx.recv().await, None);
}

#[tokio::test]
async fn failing_stage_forwards_bit_identical_original() {
    let observer = Arc::new(RecordingObserver::default());
    let mut pipeline = Pipeline::new(4);
    pipeline.add_error_observer(observer.clone());
    pipeline
        .add_stage(Box::new(FailsOnChannel { channel: 1 }))
        .unwrap();
    let mut running = pipeline.start().unwrap();
    let mut output = running.take_output().unwrap();
    let input = running.input();

    let original = image(3, vec![9, 8, 7], 1);
    let fine = image(3, vec![1, 1, 1], 0);
    input.send(Packet::Image(original.clone())).await.unwrap();
    input.send(Packet::Image(fine)).await.unwrap();
    input.shutdown().await.unwrap();

    let packets = collect_until_shutdown(&mut output).await;
    assert_eq!(packets.len(), 3);
    assert_eq!(packets[0].as_image(), Some(&original));
    assert!(packets[0].as_image().unwrap().tags().get("Touched").is_none());
    assert!(packets[1].as_image().unwrap().tags().get("Touched").is_some());

    assert_eq!(running.stats().warnings(), 1);
    let errors = observer.errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "fails-on-channel");
    assert!(errors[0].1.contains("cannot handle channel 1"));

    let stopped = running.join().await;
    assert_eq!(stopped.warnings(), 1);
}

#[tokio::test]
async fn signals_keep_their_place_between_images() {
    let mut pipeline = Pipeline::new(2);
    pipeline
        .add_stage(Box::new(TagAnnotator::new("Site", "A1")))
        .unwrap();
    let mut running = pipeline.start().unwrap();
    let mut output = running.take_output().unwrap();
    let input = running.input();

    input
        .send(Packet::Image(image(1, vec![1], 0)))
        .await
        .unwrap();
    input
        .send(Packet::Signal(AcquisitionSignal::TimepointFinished { time: 0 }))
        .await
        .unwrap();
    input
        .send(Packet::Image(image(1, vec![2], 0)))
        .await
        .unwrap();
    input
        .send(Packet::Signal(AcquisitionSignal::AcquisitionFinished))
        .await
        .unwrap();
    input.shutdown().await.unwrap();

    let packets = collect_until_shutdown(&mut output).await;
    assert_eq!(packets.len(), 5);
    assert_eq!(
        packets[0].as_image().unwrap().tags().get("Site"),
        Some(&TagValue::from("A1"))
    );
    assert_eq!(
        packets[1],
        Packet::Signal(AcquisitionSignal::TimepointFinished { time: 0 })
    );
    assert_eq!(packets[2].as_image().unwrap().pixels().as_ref(), &[2]);
    assert_eq!(
        packets[3],
        Packet::Signal(AcquisitionSignal::AcquisitionFinished)
    );
    running.join().await;
}

#[tokio::test]
async fn averager_flushes_partial_group_while_draining() {
    let mut pipeline = Pipeline::new(4);
    pipeline.add_stage(Box::new(FrameAverager::new(3))).unwrap();
    let mut running = pipeline.start().unwrap();
    let mut output = running.take_output().unwrap();
    let input = running.input();

    input
        .send(Packet::Image(image(2, vec![10, 20], 0)))
        .await
        .unwrap();
    input
        .send(Packet::Image(image(2, vec![20, 40], 0)))
        .await
        .unwrap();
    input.shutdown().await.unwrap();

    let packets = collect_until_shutdown(&mut output).await;
    assert_eq!(packets.len(), 2);
    let averaged = packets[0].as_image().unwrap();
    assert_eq!(averaged.pixels().as_ref(), &[15, 30]);
    assert_eq!(
        averaged.tags().get("AveragedFrames").and_then(TagValue::as_int),
        Some(2)
    );
    running.join().await;
}

#[tokio::test]
async fn stages_cannot_change_while_running_and_reset_on_restore() {
    let resets = Arc::new(AtomicU64::new(0));
    let listener = Arc::new(RecordingListener::default());
    let mut pipeline = Pipeline::new(4);
    pipeline.add_listener(listener.clone());
    pipeline
        .add_stage(Box::new(CountsResets {
            resets: resets.clone(),
        }))
        .unwrap();
    pipeline
        .insert_stage(0, Box::new(PassThrough::new("first")))
        .unwrap();
    assert_eq!(pipeline.stage_names(), vec!["first", "counts-resets"]);

    let mut running = pipeline.start().unwrap();
    assert!(pipeline.is_running());
    assert!(matches!(
        pipeline.add_stage(Box::new(PassThrough::new("late"))),
        Err(AcqError::PipelineBusy)
    ));
    assert!(matches!(pipeline.remove_stage(0), Err(AcqError::PipelineBusy)));
    assert!(matches!(pipeline.start(), Err(AcqError::PipelineBusy)));

    let mut output = running.take_output().unwrap();
    running.input().shutdown().await.unwrap();
    collect_until_shutdown(&mut output).await;

    timeout(Duration::from_secs(5), async {
        while running
            .stage_states()
            .iter()
            .any(|(_, state)| *state != StageState::Stopped)
        {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    let stopped = running.join().await;
    pipeline.restore(stopped);
    assert!(!pipeline.is_running());
    assert_eq!(resets.load(Ordering::SeqCst), 1);

    let removed = pipeline.remove_stage(0).unwrap();
    assert_eq!(removed.name(), "first");
    let changes = listener.changes.lock().clone();
    assert_eq!(changes.len(), 3);
    assert_eq!(changes[2], vec!["counts-resets".to_string()]);
}

#[tokio::test]
async fn empty_pipeline_passes_packets_straight_through() {
    let mut pipeline = Pipeline::default();
    let mut running = pipeline.start().unwrap();
    let mut output = running.take_output().unwrap();
    let input = running.input();

    input
        .send(Packet::Image(image(1, vec![5], 0)))
        .await
        .unwrap();
    input.shutdown().await.unwrap();

    let packets = collect_until_shutdown(&mut output).await;
    assert_eq!(packets.len(), 2);
    running.join().await;
}

#[test]
fn splitter_rejects_odd_width() {
    let mut splitter = ChannelSplitter::new();
    let mut out = Produced::default();
    assert!(splitter
        .process(&image(3, vec![1, 2, 3], 0), &mut out)
        .is_err());
}
