//! Failures the workflow detects on its own
//!
//! Everything else (network, device memory, malformed weights) arrives as an
//! `anyhow::Error` from the library that raised it. These variants are wrapped
//! in `anyhow::Error` as well, so callers can `downcast_ref::<WorkflowError>()`.

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("inference step count must be positive, got {0}")]
    InvalidStepCount(usize),

    #[error("invalid training job: {0}")]
    InvalidJob(String),

    #[error("instance data directory {} contains no images", .0.display())]
    EmptyInstanceDir(PathBuf),

    #[error("placeholder {} is still present after removal", .0.display())]
    PlaceholderNotRemoved(PathBuf),

    #[error("trainer exited with {status}")]
    TrainerFailed { status: ExitStatus },

    #[error("no adapter weights found in {}", .0.display())]
    MissingAdapter(PathBuf),

    #[error("invalid adapter {}: {reason}", .path.display())]
    InvalidAdapter { path: PathBuf, reason: String },

    #[error("adapter does not fit the base model at {module}: {reason}")]
    IncompatibleAdapter { module: String, reason: String },

    #[error("pipeline already has adapter {} attached; reload the base pipeline first", .0.display())]
    AdapterAlreadyAttached(PathBuf),

    #[error("model file not found: {0}")]
    MissingModelFile(String),

    #[error("setup step `{step}` failed with {status}")]
    SetupStepFailed { step: String, status: ExitStatus },
}
