//! `mda-experiment`
//!
//! Turns a [`SequencePlan`](mda_core::plan::SequencePlan) into an acquisition:
//!
//! - [`scheduler::Scheduler`] expands a plan into an ordered, pull-based
//!   stream of acquisition events
//! - [`validation`] rejects plans the device inventory cannot run
//! - [`queue::EventQueue`] accepts externally submitted events instead
//! - [`engine::AcquisitionEngine`] executes events against the hardware,
//!   feeding the circular buffer, the pipeline and the sink
//! - [`hooks::AcquisitionHook`] lets callers inspect, edit or skip captures
//!   around the hardware step

pub mod engine;
pub mod hooks;
pub mod queue;
pub mod scheduler;
pub mod validation;

pub use engine::{AcquisitionEngine, EngineSettings, EngineState, RunStatus, RunSummary};
pub use hooks::{AcquisitionHook, HookAction, HookPoint};
pub use queue::{EventQueue, EventQueueHandle, EventSource};
pub use scheduler::Scheduler;
pub use validation::validate_plan;
