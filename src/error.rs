//! Custom error types for the application.
//!
//! This module defines the primary error type, `EchemError`, for the whole crate.
//! Using the `thiserror` crate, it gives a single, consistent way to report the
//! failures that can happen between loading a plan and saving a session.
//!
//! ## Error Hierarchy
//!
//! - **Plan-scoped**: `MalformedPlan` is raised while loading a plan file and names
//!   the offending step (1-based).
//! - **Step-scoped**: `UnknownStepType`, `InvalidSweepTarget`, `InvalidRepeatCount`,
//!   `ConflictingSweepFlags` and `InvalidParameters` come out of sweep expansion.
//!   The channel runner logs them and skips the step; sibling steps still run.
//! - **Hardware-scoped**: `DiscoveryTimeout`, `NoChannels`, `UnknownChannel`,
//!   `Device` and `MeasurementTimeout` originate from the instrument collaborator.
//! - **Run-scoped**: `RunFailed` wraps any error raised while executing one run and
//!   attaches the channel id and run title. It aborts the rest of that channel.
//! - **Infrastructure**: `Io`, `Json`, `Csv` and `Config` wrap the underlying
//!   library errors through `#[from]` so `?` works everywhere.

use crate::experiment::MethodKind;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, EchemError>;

/// Every failure the engine can report.
#[derive(Error, Debug)]
pub enum EchemError {
    /// A plan step has an unknown method, an unknown type or an ill-typed field.
    #[error("Malformed plan at step {step}: {reason}")]
    MalformedPlan {
        /// 1-based step index
        step: usize,
        /// Parser message
        reason: String,
    },

    /// No plan document with this name exists in the store.
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    /// The step's `type` is neither `single` nor `sweep`.
    #[error("Step {step}: unknown step type '{step_type}'")]
    UnknownStepType {
        /// 1-based step index
        step: usize,
        /// The type as written in the plan
        step_type: String,
    },

    /// The sweep names a parameter or level that does not exist.
    #[error("Step {step}: invalid sweep target: {reason}")]
    InvalidSweepTarget {
        /// 1-based step index
        step: usize,
        /// What is missing or out of range
        reason: String,
    },

    /// `repeats` is below one.
    #[error("Step {step}: repeat count must be at least 1, got {repeats}")]
    InvalidRepeatCount {
        /// 1-based step index
        step: usize,
        /// The value found in the plan
        repeats: i64,
    },

    /// An MSA level sweep selects both potential and duration.
    #[error("Step {step}: sweep_potential and sweep_duration cannot both be set")]
    ConflictingSweepFlags {
        /// 1-based step index
        step: usize,
    },

    /// Parameters are missing, unknown or out of range for the method.
    #[error("Invalid {method} parameters: {reason}")]
    InvalidParameters {
        /// Method whose schema was violated
        method: MethodKind,
        /// Decoder or validation message
        reason: String,
    },

    /// The driver did not answer discovery in time.
    #[error("Instrument discovery timed out after {timeout_ms} ms")]
    DiscoveryTimeout {
        /// Configured limit
        timeout_ms: u64,
    },

    /// Discovery succeeded but reported nothing.
    #[error("No instrument channels found")]
    NoChannels,

    /// An assignment refers to a channel that was not discovered.
    #[error("Channel {0} is not among the discovered channels")]
    UnknownChannel(usize),

    /// Failure reported by the instrument driver.
    #[error("Device error on channel {channel}: {message}")]
    Device {
        /// Channel index
        channel: usize,
        /// Driver message
        message: String,
    },

    /// A single measurement exceeded `instrument.measurement_timeout_ms`.
    #[error("Measurement on channel {channel} exceeded {timeout_ms} ms")]
    MeasurementTimeout {
        /// Channel index
        channel: usize,
        /// Configured limit
        timeout_ms: u64,
    },

    /// Any error raised while executing one run, with its context.
    #[error("[CH{channel}] run '{title}' failed: {source}")]
    RunFailed {
        /// Channel index
        channel: usize,
        /// Title of the failing run
        title: String,
        /// Underlying error
        #[source]
        source: Box<EchemError>,
    },

    /// Configuration could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode or decode failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV write failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A channel task panicked or was cancelled.
    #[error("Channel task failed: {0}")]
    Task(String),

    /// One or more channels failed to disconnect.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<EchemError>),
}

impl EchemError {
    /// Attach run context to an error raised while executing one run.
    pub fn in_run(self, channel: usize, title: &str) -> Self {
        EchemError::RunFailed {
            channel,
            title: title.to_string(),
            source: Box::new(self),
        }
    }

    /// True for errors that only invalidate a single plan step.
    pub fn is_step_scoped(&self) -> bool {
        matches!(
            self,
            EchemError::UnknownStepType { .. }
                | EchemError::InvalidSweepTarget { .. }
                | EchemError::InvalidRepeatCount { .. }
                | EchemError::ConflictingSweepFlags { .. }
                | EchemError::InvalidParameters { .. }
        )
    }
}
