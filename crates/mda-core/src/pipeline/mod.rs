//! Ordered chain of image processing stages.
//!
//! A [`Pipeline`] is configured while idle, then [`Pipeline::start`] moves its
//! stages onto worker threads connected by bounded queues and returns a
//! [`RunningPipeline`]. Bounded queues give backpressure: a slow stage blocks
//! its upstream instead of growing memory.
//!
//! # Lifecycle
//!
//! ```text
//! Pipeline (idle) ── start() ──▶ RunningPipeline ── join() ──▶ StoppedPipeline
//!        ▲                                                          │
//!        └───────────────────── restore() (resets every stage) ─────┘
//! ```
//!
//! The shutdown sentinel ([`Packet::Shutdown`]) is accepted once by
//! [`PipelineInput`]; every stage flushes, forwards it once and exits.
//!
//! # Failure handling
//!
//! A stage whose `process` fails does not stop the pipeline. Its partial
//! outputs are discarded, the original image is forwarded unchanged, every
//! [`StageErrorObserver`] is notified and the warning counter increments.

mod stage;
pub mod stages;

pub use stage::StageState;

use crate::error::{AcqError, AcqResult};
use crate::image::{Packet, TaggedImage};
use stage::{StageWorker, StateCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Default bounded queue depth between stages.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// A transformation stage.
///
/// Called from a dedicated worker thread, so implementations may block.
pub trait ImageProcessor: Send + 'static {
    /// Stage name used in logs and error reports.
    fn name(&self) -> &str;

    /// Handles one image, producing zero or more outputs.
    ///
    /// The input is borrowed; forwarding it means producing a clone, which is
    /// cheap because pixels are reference counted. On error, anything already
    /// produced is discarded and the input is forwarded as-is.
    fn process(&mut self, image: &TaggedImage, out: &mut Produced) -> anyhow::Result<()>;

    /// Emits internally held images before the sentinel is forwarded.
    fn flush(&mut self, _out: &mut Produced) -> anyhow::Result<()> {
        Ok(())
    }

    /// Clears internal counters and held images before reuse.
    fn reset(&mut self) {}
}

/// Output collector handed to [`ImageProcessor::process`].
#[derive(Debug, Default)]
pub struct Produced {
    images: Vec<TaggedImage>,
}

impl Produced {
    /// Queues an output image.
    pub fn produce(&mut self, image: TaggedImage) {
        self.images.push(image);
    }

    /// Number of queued outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// True when nothing has been produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub(crate) fn take(&mut self) -> Vec<TaggedImage> {
        std::mem::take(&mut self.images)
    }

    pub(crate) fn clear(&mut self) {
        self.images.clear();
    }
}

/// Notified when a stage fails on an image.
pub trait StageErrorObserver: Send + Sync {
    /// Called from the failing stage's worker thread.
    fn on_stage_error(&self, stage: &str, error: &AcqError);
}

/// Notified when the stage list changes.
pub trait PipelineListener: Send + Sync {
    /// Receives the new stage names in order.
    fn on_pipeline_changed(&self, stages: &[String]);
}

/// Counters shared by every worker of a run.
#[derive(Debug, Default)]
pub struct PipelineStats {
    warnings: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn record_warning(&self) -> u64 {
        self.warnings.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stage failures so far.
    #[must_use]
    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::SeqCst)
    }
}

/// Idle, reconfigurable stage chain.
pub struct Pipeline {
    stages: Vec<Box<dyn ImageProcessor>>,
    queue_depth: usize,
    running: bool,
    listeners: Vec<Arc<dyn PipelineListener>>,
    observers: Vec<Arc<dyn StageErrorObserver>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("queue_depth", &self.queue_depth)
            .field("running", &self.running)
            .finish()
    }
}

impl Pipeline {
    /// Empty pipeline with the given queue depth (at least 1).
    #[must_use]
    pub fn new(queue_depth: usize) -> Self {
        Self {
            stages: Vec::new(),
            queue_depth: queue_depth.max(1),
            running: false,
            listeners: Vec::new(),
            observers: Vec::new(),
        }
    }

    /// Registers a stage-list listener.
    pub fn add_listener(&mut self, listener: Arc<dyn PipelineListener>) {
        self.listeners.push(listener);
    }

    /// Registers a stage failure observer.
    pub fn add_error_observer(&mut self, observer: Arc<dyn StageErrorObserver>) {
        self.observers.push(observer);
    }

    /// Appends a stage.
    pub fn add_stage(&mut self, stage: Box<dyn ImageProcessor>) -> AcqResult<()> {
        self.ensure_idle()?;
        self.stages.push(stage);
        self.notify_changed();
        Ok(())
    }

    /// Inserts a stage at `index` (clamped to the end).
    pub fn insert_stage(&mut self, index: usize, stage: Box<dyn ImageProcessor>) -> AcqResult<()> {
        self.ensure_idle()?;
        let index = index.min(self.stages.len());
        self.stages.insert(index, stage);
        self.notify_changed();
        Ok(())
    }

    /// Removes and returns the stage at `index`.
    pub fn remove_stage(&mut self, index: usize) -> AcqResult<Box<dyn ImageProcessor>> {
        self.ensure_idle()?;
        if index >= self.stages.len() {
            return Err(AcqError::Configuration(format!(
                "no stage at index {index} (pipeline has {})",
                self.stages.len()
            )));
        }
        let stage = self.stages.remove(index);
        self.notify_changed();
        Ok(stage)
    }

    /// Stage names in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True when there are no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Whether the stages are currently out on worker threads.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Moves every stage onto a worker thread.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self) -> AcqResult<RunningPipeline> {
        self.ensure_idle()?;
        self.running = true;

        let stats = Arc::new(PipelineStats::default());
        let (input_tx, mut upstream) = mpsc::channel::<Packet>(self.queue_depth);
        let mut workers = Vec::with_capacity(self.stages.len());
        let mut states = Vec::with_capacity(self.stages.len());

        for processor in self.stages.drain(..) {
            let (tx, rx) = mpsc::channel::<Packet>(self.queue_depth);
            let state = Arc::new(StateCell::new());
            let name = processor.name().to_string();
            let worker = StageWorker {
                processor,
                input: upstream,
                output: tx,
                state: state.clone(),
                stats: stats.clone(),
                observers: self.observers.clone(),
            };
            workers.push((name.clone(), tokio::task::spawn_blocking(move || worker.run())));
            states.push((name, state));
            upstream = rx;
        }

        info!(stages = workers.len(), queue_depth = self.queue_depth, "Pipeline started");
        Ok(RunningPipeline {
            input: PipelineInput {
                tx: input_tx,
                closed: Arc::new(Mutex::new(false)),
            },
            output: Some(upstream),
            workers,
            states,
            stats,
        })
    }

    /// Returns stopped stages to the pipeline, resetting each one.
    pub fn restore(&mut self, stopped: StoppedPipeline) {
        for mut stage in stopped.stages {
            stage.reset();
            self.stages.push(stage);
        }
        self.running = false;
        debug!(stages = self.stages.len(), "Pipeline restored");
    }

    fn ensure_idle(&self) -> AcqResult<()> {
        if self.running {
            return Err(AcqError::PipelineBusy);
        }
        Ok(())
    }

    fn notify_changed(&self) {
        let names = self.stage_names();
        for listener in &self.listeners {
            listener.on_pipeline_changed(&names);
        }
    }
}

/// Sending half of a running pipeline.
///
/// Accepts the sentinel once; later sentinels are ignored and later images are
/// rejected with [`AcqError::PipelineClosed`].
#[derive(Debug, Clone)]
pub struct PipelineInput {
    tx: mpsc::Sender<Packet>,
    closed: Arc<Mutex<bool>>,
}

impl PipelineInput {
    /// Enqueues a packet, waiting for room in the first queue.
    pub async fn send(&self, packet: Packet) -> AcqResult<()> {
        let mut closed = self.closed.lock().await;
        let is_shutdown = packet.is_shutdown();
        if *closed {
            if is_shutdown {
                debug!("Sentinel already sent; ignoring duplicate");
                return Ok(());
            }
            return Err(AcqError::PipelineClosed);
        }
        self.tx
            .send(packet)
            .await
            .map_err(|_| AcqError::PipelineClosed)?;
        if is_shutdown {
            *closed = true;
        }
        Ok(())
    }

    /// Sends the shutdown sentinel.
    pub async fn shutdown(&self) -> AcqResult<()> {
        self.send(Packet::Shutdown).await
    }
}

/// A pipeline whose stages are running on worker threads.
pub struct RunningPipeline {
    input: PipelineInput,
    output: Option<mpsc::Receiver<Packet>>,
    workers: Vec<(String, JoinHandle<Box<dyn ImageProcessor>>)>,
    states: Vec<(String, Arc<StateCell>)>,
    stats: Arc<PipelineStats>,
}

impl std::fmt::Debug for RunningPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningPipeline")
            .field("stages", &self.stage_states())
            .field("warnings", &self.stats.warnings())
            .finish()
    }
}

impl RunningPipeline {
    /// Handle for feeding the first stage.
    #[must_use]
    pub fn input(&self) -> PipelineInput {
        self.input.clone()
    }

    /// Receiver for the last stage's output. Available once.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Packet>> {
        self.output.take()
    }

    /// Current state of every stage.
    #[must_use]
    pub fn stage_states(&self) -> Vec<(String, StageState)> {
        self.states
            .iter()
            .map(|(name, state)| (name.clone(), state.get()))
            .collect()
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Waits for every worker to exit.
    ///
    /// Workers exit once the sentinel reaches them, so send it first (or drop
    /// every [`PipelineInput`]). The output receiver must be drained or
    /// dropped, otherwise the last stage can block on a full queue. A worker
    /// that panicked loses its stage; it is listed in
    /// [`StoppedPipeline::lost_stages`].
    pub async fn join(self) -> StoppedPipeline {
        let Self {
            input,
            output,
            workers,
            stats,
            ..
        } = self;
        drop(input);
        drop(output);

        let mut stages = Vec::with_capacity(workers.len());
        let mut lost = Vec::new();
        for (name, handle) in workers {
            match handle.await {
                Ok(stage) => stages.push(stage),
                Err(err) => {
                    error!(stage = %name, error = %err, "Stage worker terminated abnormally");
                    lost.push(name);
                }
            }
        }
        StoppedPipeline {
            stages,
            warnings: stats.warnings(),
            lost,
        }
    }
}

/// Stages returned by a finished run.
pub struct StoppedPipeline {
    stages: Vec<Box<dyn ImageProcessor>>,
    warnings: u64,
    lost: Vec<String>,
}

impl StoppedPipeline {
    /// Stage failures recorded during the run.
    #[must_use]
    pub fn warnings(&self) -> u64 {
        self.warnings
    }

    /// Stages whose worker panicked and could not be recovered.
    #[must_use]
    pub fn lost_stages(&self) -> &[String] {
        &self.lost
    }
}

impl std::fmt::Debug for StoppedPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoppedPipeline")
            .field("stages", &self.stages.len())
            .field("warnings", &self.warnings)
            .field("lost", &self.lost)
            .finish()
    }
}

#[cfg(test)]
mod tests;
