//! `mda-core`
//!
//! Shared building blocks for multi-dimensional microscope acquisition.
//!
//! This crate holds the types every other crate in the workspace agrees on:
//! acquisition events, tagged images and the packets that carry them through
//! the processing pipeline, the sequence plan model, the error type, and the
//! capability traits the engine uses to talk to hardware.
//!
//! ## Key Types
//!
//! - [`event::AcquisitionEvent`]: one case per scheduled instruction or control marker
//! - [`image::TaggedImage`]: pixel buffer plus ordered metadata tags
//! - [`image::Packet`]: image, signal, or the shutdown sentinel
//! - [`plan::SequencePlan`]: the immutable description of a run
//! - [`error::AcqError`]: error kinds shared by the library crates
//! - [`pipeline::Pipeline`]: ordered chain of processing stages
//! - [`sink::ImageSink`]: the consumer contract at the end of the pipeline

pub mod capabilities;
pub mod error;
pub mod error_recovery;
pub mod event;
pub mod image;
pub mod pipeline;
pub mod plan;
pub mod sink;
pub mod stop;

pub use error::{AcqError, AcqResult};
pub use event::{AcquisitionEvent, AxisCoords, CaptureEvent, HardwareVolume, SequenceRole};
pub use image::{AcquisitionSignal, ImageTags, Packet, PixelType, TagValue, TaggedImage};
pub use plan::{
    AutofocusSettings, ChannelMode, ChannelSpec, DeviceInventory, FirmwareVersion, SequencePlan,
    StagePosition, TriggerDeviceInfo, XyPosition,
};
