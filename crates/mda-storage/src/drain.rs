//! Buffer-to-pipeline drain task.
//!
//! The drain pops images from the circular buffer in sequence order and sends
//! them into the pipeline. Phase-boundary signals are emitted by the engine
//! through a [`SignalEmitter`], which stamps each one with the buffer's write
//! cursor at emission time. A signal is forwarded only once every image pushed
//! before it has been forwarded, so signals keep their place in the stream even
//! though they bypass the buffer.
//!
//! When the producer has finished and the buffer is empty, the drain flushes
//! the remaining signals, sends the shutdown sentinel and exits.

use crate::circular_buffer::CircularBuffer;
use mda_core::error::{AcqError, AcqResult};
use mda_core::image::{AcquisitionSignal, Packet};
use mda_core::pipeline::PipelineInput;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct Marker {
    after: u64,
    signal: AcquisitionSignal,
}

/// Engine-side handle for emitting signals in stream order.
#[derive(Debug, Clone)]
pub struct SignalEmitter {
    tx: mpsc::UnboundedSender<Marker>,
    buffer: Arc<CircularBuffer>,
}

impl SignalEmitter {
    /// Queues `signal` behind every image pushed so far.
    pub fn emit(&self, signal: AcquisitionSignal) -> AcqResult<()> {
        let marker = Marker {
            after: self.buffer.write_cursor(),
            signal,
        };
        self.tx.send(marker).map_err(|_| AcqError::PipelineClosed)
    }
}

/// Receiving half of [`signal_channel`].
#[derive(Debug)]
pub struct SignalReceiver {
    rx: mpsc::UnboundedReceiver<Marker>,
}

/// Creates an emitter/receiver pair bound to `buffer`.
#[must_use]
pub fn signal_channel(buffer: Arc<CircularBuffer>) -> (SignalEmitter, SignalReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SignalEmitter { tx, buffer }, SignalReceiver { rx })
}

/// Counters reported when the drain exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Images sent into the pipeline.
    pub images_forwarded: u64,
    /// Signals sent into the pipeline.
    pub signals_forwarded: u64,
    /// Discontinuities seen in sequence numbers.
    pub gaps: u64,
    /// Images missing across all gaps.
    pub images_lost: u64,
}

/// Moves images and signals from the buffer into the pipeline.
#[derive(Debug)]
pub struct BufferDrain {
    buffer: Arc<CircularBuffer>,
    signals: SignalReceiver,
    output: PipelineInput,
    poll: Duration,
    pending: VecDeque<Marker>,
    next_sequence: Option<u64>,
    report: DrainReport,
}

impl BufferDrain {
    /// Drain that waits at most `poll` per pop before re-checking signals.
    #[must_use]
    pub fn new(
        buffer: Arc<CircularBuffer>,
        signals: SignalReceiver,
        output: PipelineInput,
        poll: Duration,
    ) -> Self {
        Self {
            buffer,
            signals,
            output,
            poll: poll.max(Duration::from_millis(1)),
            pending: VecDeque::new(),
            next_sequence: None,
            report: DrainReport::default(),
        }
    }

    /// Runs until the producer finishes and everything has been forwarded.
    pub async fn run(mut self) -> AcqResult<DrainReport> {
        debug!("Buffer drain started");
        loop {
            self.collect_signals();
            self.forward_due_signals().await?;

            match self.buffer.pop_oldest(self.poll).await {
                Ok(image) => {
                    if let Some(sequence) = image.sequence() {
                        self.track_sequence(sequence);
                    }
                    self.output.send(Packet::Image(image)).await?;
                    self.report.images_forwarded += 1;
                }
                Err(AcqError::BufferEmpty) if !self.buffer.is_producing() => {
                    if self.buffer.remaining_count() > 0 {
                        continue;
                    }
                    break;
                }
                Err(AcqError::BufferEmpty) => {}
                Err(err) => return Err(err),
            }
        }

        self.collect_signals();
        while let Some(marker) = self.pending.pop_front() {
            self.send_signal(marker.signal).await?;
        }
        self.output.shutdown().await?;
        info!(
            images = self.report.images_forwarded,
            signals = self.report.signals_forwarded,
            lost = self.report.images_lost,
            "Buffer drain finished"
        );
        Ok(self.report)
    }

    fn collect_signals(&mut self) {
        while let Ok(marker) = self.signals.rx.try_recv() {
            self.pending.push_back(marker);
        }
    }

    async fn forward_due_signals(&mut self) -> AcqResult<()> {
        let read = self.buffer.read_cursor();
        while self.pending.front().is_some_and(|m| m.after <= read) {
            if let Some(marker) = self.pending.pop_front() {
                self.send_signal(marker.signal).await?;
            }
        }
        Ok(())
    }

    async fn send_signal(&mut self, signal: AcquisitionSignal) -> AcqResult<()> {
        self.output.send(Packet::Signal(signal)).await?;
        self.report.signals_forwarded += 1;
        Ok(())
    }

    fn track_sequence(&mut self, sequence: u64) {
        if let Some(expected) = self.next_sequence {
            if sequence > expected {
                let lost = sequence - expected;
                self.report.gaps += 1;
                self.report.images_lost += lost;
                warn!(
                    expected,
                    received = sequence,
                    lost,
                    "Sequence gap: images lost to buffer overflow"
                );
            }
        } else if sequence > 0 {
            self.report.gaps += 1;
            self.report.images_lost += sequence;
            warn!(lost = sequence, "Sequence gap before first drained image");
        }
        self.next_sequence = Some(sequence + 1);
    }
}
