//! Consumer contract at the end of the pipeline.
//!
//! [`dispatch_to_sink`] reads the last stage's output queue and calls the
//! matching [`ImageSink`] callback for each packet until the sentinel arrives.

use crate::image::{AcquisitionSignal, Packet, TaggedImage};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Storage or display consumer.
#[async_trait]
pub trait ImageSink: Send {
    /// A processed image is ready.
    async fn on_image_ready(&mut self, image: TaggedImage) -> Result<()>;

    /// Every image of `time` has been delivered.
    async fn on_timepoint_finished(&mut self, _time: usize) -> Result<()> {
        Ok(())
    }

    /// The run is over.
    async fn on_acquisition_finished(&mut self) -> Result<()> {
        Ok(())
    }
}

/// What the dispatcher delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    /// Images handed to the sink.
    pub images: u64,
    /// Time point markers handed to the sink.
    pub timepoints: u64,
    /// Whether the acquisition-finished callback ran.
    pub finished: bool,
    /// Callbacks that returned an error.
    pub errors: u64,
}

/// Drives `sink` from the pipeline output until the sentinel or channel close.
///
/// Sink failures are logged and counted; the stream keeps flowing.
pub async fn dispatch_to_sink(
    mut output: mpsc::Receiver<Packet>,
    sink: &mut dyn ImageSink,
) -> SinkReport {
    let mut report = SinkReport::default();
    while let Some(packet) = output.recv().await {
        let result = match packet {
            Packet::Image(image) => {
                report.images += 1;
                sink.on_image_ready(image).await
            }
            Packet::Signal(AcquisitionSignal::TimepointFinished { time }) => {
                report.timepoints += 1;
                sink.on_timepoint_finished(time).await
            }
            Packet::Signal(AcquisitionSignal::AcquisitionFinished) => {
                report.finished = true;
                sink.on_acquisition_finished().await
            }
            Packet::Shutdown => {
                debug!(images = report.images, "Sink received sentinel");
                break;
            }
        };
        if let Err(err) = result {
            report.errors += 1;
            warn!(error = %err, "Image sink callback failed");
        }
    }
    report
}

/// One callback observed by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkRecord {
    /// `on_image_ready`.
    Image(TaggedImage),
    /// `on_timepoint_finished`.
    TimepointFinished(usize),
    /// `on_acquisition_finished`.
    AcquisitionFinished,
}

/// Sink that keeps every callback in memory, shareable across clones.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    records: Arc<Mutex<Vec<SinkRecord>>>,
}

impl RecordingSink {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    #[must_use]
    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().clone()
    }

    /// Recorded images in arrival order.
    #[must_use]
    pub fn images(&self) -> Vec<TaggedImage> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                SinkRecord::Image(image) => Some(image.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ImageSink for RecordingSink {
    async fn on_image_ready(&mut self, image: TaggedImage) -> Result<()> {
        self.records.lock().push(SinkRecord::Image(image));
        Ok(())
    }

    async fn on_timepoint_finished(&mut self, time: usize) -> Result<()> {
        self.records.lock().push(SinkRecord::TimepointFinished(time));
        Ok(())
    }

    async fn on_acquisition_finished(&mut self) -> Result<()> {
        self.records.lock().push(SinkRecord::AcquisitionFinished);
        Ok(())
    }
}
