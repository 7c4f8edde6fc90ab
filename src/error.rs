//! Error taxonomy for the job.
//!
//! Three classes with three different fates:
//!
//! * [`ExtractionError`] is per-record. The map task logs it, counts the
//!   record as processed and skips it.
//! * [`InfrastructureError`] fails the task attempt. Once a task runs out of
//!   attempts it fails the whole job.
//! * [`UsageError`] is raised before any task is started.

use std::path::PathBuf;
use thiserror::Error;

/// Why a single record could not contribute to the output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("missing field `{field}`: {reason}")]
    MissingField { field: &'static str, reason: String },
    #[error("`category` is empty")]
    EmptyCategory,
}

impl ExtractionError {
    /// Short, stable name of the error kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractionError::MalformedPayload(_) => "malformed_payload",
            ExtractionError::MissingField { .. } => "missing_field",
            ExtractionError::EmptyCategory => "empty_category",
        }
    }
}

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("record source unavailable: {context}")]
    Source {
        context: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("sink unwritable: {context}")]
    Sink {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("reduce failed for key {key:?}")]
    Reduce {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("task {task} failed after {attempts} attempt(s)")]
    TaskFailed {
        task: String,
        attempts: u32,
        #[source]
        source: Box<InfrastructureError>,
    },
    #[error("task {task} panicked: {message}")]
    TaskPanicked { task: String, message: String },
    #[error("job was cancelled")]
    Cancelled,
}

impl InfrastructureError {
    pub fn source_error(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        InfrastructureError::Source {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn sink_error(context: impl Into<String>, source: std::io::Error) -> Self {
        InfrastructureError::Sink {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("invalid output location {path:?}: {reason}")]
    InvalidOutput { path: PathBuf, reason: String },
    #[error("output directory {0:?} already exists")]
    OutputExists(PathBuf),
    #[error("failed to read config file {path:?}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no workload named `{0}`")]
    UnknownWorkload(String),
}

/// Anything that makes a job exit unsuccessfully.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
}

impl JobError {
    /// Process exit status for this failure. Usage errors share clap's code.
    pub fn exit_code(&self) -> i32 {
        match self {
            JobError::Usage(_) => 2,
            JobError::Infrastructure(_) => 1,
        }
    }
}

/// Formats an error and its whole `source()` chain.
pub fn error_chain_fmt(
    f: &mut std::fmt::Formatter<'_>,
    e: &impl std::error::Error,
) -> std::fmt::Result {
    writeln!(f, "{}", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}

/// Display adapter over [`error_chain_fmt`].
pub struct Chain<'a, E>(pub &'a E);

impl<E: std::error::Error> std::fmt::Display for Chain<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(f, self.0)
    }
}
