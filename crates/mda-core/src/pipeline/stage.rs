//! Stage worker loop.
//!
//! Each stage runs on its own blocking thread: `poll` the input queue,
//! `process` the image, `produce` zero or more outputs downstream. Signals pass
//! through untouched. The shutdown sentinel triggers a flush, is forwarded
//! exactly once, and ends the worker.

use super::{ImageProcessor, PipelineStats, Produced, StageErrorObserver};
use crate::error::AcqError;
use crate::image::Packet;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lifecycle of one stage worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StageState {
    /// Not started.
    Idle = 0,
    /// Processing images.
    Running = 1,
    /// Sentinel received, flushing held images.
    Draining = 2,
    /// Sentinel forwarded, worker exited.
    Stopped = 3,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "Idle",
            Self::Running => "Running",
            Self::Draining => "Draining",
            Self::Stopped => "Stopped",
        };
        f.write_str(label)
    }
}

/// Shared, lock-free view of a worker's state.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(StageState::Idle as u8))
    }

    pub(crate) fn set(&self, state: StageState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> StageState {
        match self.0.load(Ordering::SeqCst) {
            0 => StageState::Idle,
            1 => StageState::Running,
            2 => StageState::Draining,
            _ => StageState::Stopped,
        }
    }
}

pub(crate) struct StageWorker {
    pub(crate) processor: Box<dyn ImageProcessor>,
    pub(crate) input: mpsc::Receiver<Packet>,
    pub(crate) output: mpsc::Sender<Packet>,
    pub(crate) state: Arc<StateCell>,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) observers: Vec<Arc<dyn StageErrorObserver>>,
}

impl StageWorker {
    /// Runs until the sentinel is forwarded. Returns the processor so the
    /// pipeline can be restored afterwards.
    pub(crate) fn run(mut self) -> Box<dyn ImageProcessor> {
        self.state.set(StageState::Running);
        let name = self.processor.name().to_string();
        let mut produced = Produced::default();
        debug!(stage = %name, "Stage worker started");

        loop {
            let Some(packet) = self.input.blocking_recv() else {
                // Upstream vanished without a sentinel; still terminate downstream.
                debug!(stage = %name, "Input closed without sentinel");
                self.drain_and_forward_sentinel(&name, &mut produced);
                break;
            };
            match packet {
                Packet::Image(image) => {
                    match self.processor.process(&image, &mut produced) {
                        Ok(()) => {
                            if !self.forward_all(&mut produced) {
                                break;
                            }
                        }
                        Err(err) => {
                            produced.clear();
                            self.report(&name, &err);
                            if !self.forward(Packet::Image(image)) {
                                break;
                            }
                        }
                    }
                }
                Packet::Signal(signal) => {
                    if !self.forward(Packet::Signal(signal)) {
                        break;
                    }
                }
                Packet::Shutdown => {
                    self.drain_and_forward_sentinel(&name, &mut produced);
                    break;
                }
            }
        }

        self.state.set(StageState::Stopped);
        debug!(stage = %name, "Stage worker stopped");
        self.processor
    }

    fn drain_and_forward_sentinel(&mut self, name: &str, produced: &mut Produced) {
        self.state.set(StageState::Draining);
        match self.processor.flush(produced) {
            Ok(()) => {
                self.forward_all(produced);
            }
            Err(err) => {
                produced.clear();
                self.report(name, &err);
            }
        }
        self.forward(Packet::Shutdown);
    }

    fn report(&self, name: &str, err: &anyhow::Error) {
        let error = AcqError::StageProcessing {
            stage: name.to_string(),
            message: format!("{err:#}"),
        };
        let warnings = self.stats.record_warning();
        warn!(stage = %name, warnings, error = %error, "Stage failed; forwarding original image");
        for observer in &self.observers {
            observer.on_stage_error(name, &error);
        }
    }

    fn forward_all(&self, produced: &mut Produced) -> bool {
        for image in produced.take() {
            if !self.forward(Packet::Image(image)) {
                return false;
            }
        }
        true
    }

    fn forward(&self, packet: Packet) -> bool {
        if self.output.blocking_send(packet).is_err() {
            debug!("Downstream closed; stage exiting");
            return false;
        }
        true
    }
}
