//! `mda-storage`
//!
//! The bounded circular image buffer that decouples camera-paced production
//! from consumer-paced draining, and the drain task that feeds its images
//! (interleaved with phase-boundary signals) into the processing pipeline.

pub mod circular_buffer;
pub mod drain;

pub use circular_buffer::{BufferStats, CircularBuffer};
pub use drain::{signal_channel, BufferDrain, DrainReport, SignalEmitter, SignalReceiver};
