//! Error types shared by the acquisition crates.
//!
//! `AcqError` is the single error enum used by the library crates. Capability
//! traits implemented by drivers return `anyhow::Result`, and the engine folds
//! those failures into `AcqError::Hardware` at the boundary.
//!
//! ## Severity
//!
//! - **`PlanValidation`**: raised before a run starts. Nothing is executed.
//! - **`HardwareTimeout`** and **`Hardware`**: fatal for the current run. The
//!   engine stops, drains the pipeline and reports what was completed.
//! - **`StageProcessing`**: recovered inside the pipeline. The stage forwards
//!   the original image and the warning counter increments.
//! - **`Hook`**: a user hook failed. Fatal for the current run.
//! - **`Interrupted`**: a wait was abandoned because a stop was requested.
//!   This starts an orderly shutdown rather than signalling a fault.
//!
//! Buffer overflow is deliberately absent: it is counted and logged, and the
//! consumer sees it as a gap in sequence numbers.

use std::time::Duration;
use thiserror::Error;

/// Errors produced while planning, executing or processing an acquisition.
#[derive(Error, Debug, Clone)]
pub enum AcqError {
    /// The plan cannot run against the current device inventory.
    #[error("Plan validation error: {0}")]
    PlanValidation(String),

    /// A device stayed busy past its wait budget.
    #[error("Device '{device}' still busy after {timeout:?}")]
    HardwareTimeout {
        /// Device that never settled.
        device: String,
        /// The wait budget that expired.
        timeout: Duration,
    },

    /// A hardware command failed after all retries.
    #[error("Hardware command '{operation}' failed: {message}")]
    Hardware {
        /// Short name of the failed command, e.g. `snap_single`.
        operation: String,
        /// Underlying driver message.
        message: String,
    },

    /// No image was available within the allowed wait.
    #[error("Circular buffer is empty")]
    BufferEmpty,

    /// The image does not fit the buffer's slot size.
    #[error("Image of {actual} bytes does not fit a {slot} byte buffer slot")]
    SlotSizeMismatch {
        /// Size of the rejected image.
        actual: usize,
        /// Size of one slot.
        slot: usize,
    },

    /// Pixel data does not match the declared geometry.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// A processing stage rejected an image.
    #[error("Stage '{stage}' failed: {message}")]
    StageProcessing {
        /// Stage name.
        stage: String,
        /// Failure description.
        message: String,
    },

    /// An acquisition hook returned an error.
    #[error("Hook '{hook}' ({point}) failed: {message}")]
    Hook {
        /// Hook name.
        hook: String,
        /// Where the hook ran.
        point: String,
        /// Failure description.
        message: String,
    },

    /// A wait was abandoned because a stop was requested.
    #[error("Interrupted by stop request")]
    Interrupted,

    /// Stages can only be changed while the pipeline is idle.
    #[error("Pipeline is running; stages can only be changed while idle")]
    PipelineBusy,

    /// The pipeline input no longer accepts packets.
    #[error("Pipeline input is closed")]
    PipelineClosed,

    /// The engine is not in a state that allows the requested operation.
    #[error("Invalid engine state: {0}")]
    InvalidState(String),

    /// Semantically invalid configuration.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl AcqError {
    /// Wraps a driver failure for the named command.
    pub fn hardware(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Hardware {
            operation: operation.into(),
            message: format!("{err:#}"),
        }
    }

}

/// Result alias used throughout the library crates.
pub type AcqResult<T> = Result<T, AcqError>;
