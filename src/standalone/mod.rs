//! Single-process job execution.

use crate::config::JobConfig;
use crate::error::{InfrastructureError, JobError, UsageError};
use crate::sink::{self, FileSink, Sink};
use crate::source;
use std::sync::Arc;

pub mod engine;
pub mod scheduler;
pub mod shuffle;

pub use scheduler::{CancelHandle, JobReport, JobRunner, JobState};

/// Validate the submission, then run the job into the directory `output`.
///
/// Everything that can be checked without touching the data is checked
/// before the output directory is created.
pub async fn run_job(config: JobConfig, output: &str) -> Result<JobReport, JobError> {
    let runner = prepare_job(config, output)?;
    runner.run().await
}

/// Like [`run_job`], but hands back the runner so the caller can subscribe
/// to state changes or cancel the job before starting it.
pub fn prepare_job(config: JobConfig, output: &str) -> Result<JobRunner, JobError> {
    config.validate()?;
    let output = sink::validate_output(output)?;
    let source = source::open(&config.source)?;

    let sink = FileSink::create(&output).map_err(|e| match e {
        // Lost a race with whoever else created it.
        InfrastructureError::Sink { source: ref io, .. }
            if io.kind() == std::io::ErrorKind::AlreadyExists =>
        {
            JobError::Usage(UsageError::OutputExists(output.clone()))
        }
        other => JobError::Infrastructure(other),
    })?;
    tracing::info!(output = %sink.output().display(), "output directory created");
    let sink: Arc<dyn Sink> = Arc::new(sink);
    Ok(JobRunner::new(config, source, sink))
}
