//! Simulated microscope hardware for mda.
//!
//! This crate provides simulated devices for running and testing acquisitions
//! without physical hardware. All waits use `tokio::time::sleep`, never
//! `std::thread::sleep`.
//!
//! # Available Mock Devices
//!
//! - [`MockCamera`] - test-pattern camera with snap and hardware sequence modes
//! - [`MockDevices`] - focus and XY stages with settling time, plus config presets
//! - [`MockTrigger`] - trigger controller that records loaded sequences
//! - [`MockMicroscope`] - all three wired together as a [`Hardware`] bundle
//!
//! Failure injection (stuck devices, failing commands) is available on each
//! device for exercising the engine's timeout and retry paths.
//!
//! [`Hardware`]: mda_core::capabilities::Hardware

mod microscope;
mod mock_camera;
mod mock_stage;
mod mock_trigger;
mod pattern;
pub mod timing;

pub use microscope::MockMicroscope;
pub use mock_camera::{MockCamera, MockCameraConfig};
pub use mock_stage::{DeviceCall, MockDevices};
pub use mock_trigger::MockTrigger;
pub use pattern::{generate_test_pattern, to_gray8};
pub use timing::TimingConfig;
