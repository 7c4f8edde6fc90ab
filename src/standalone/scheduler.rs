//! Runs one job: a map task per partition, a local shuffle, a reduce task per
//! non-empty bucket, then the sink commit.
//!
//! Tasks run on the blocking pool, at most `execution.parallelism` at a time.
//! A task that fails is retried from scratch; the job fails once any task
//! runs out of attempts.

use super::engine::{describe, perform_map, perform_reduce, MapSettings, MapTaskOutput};
use super::shuffle::Shuffle;
use crate::config::JobConfig;
use crate::counters::{CounterSnapshot, Counters, TaskCounters};
use crate::error::{InfrastructureError, JobError, UsageError};
use crate::sink::Sink;
use crate::source::{RecordSource, ScanOptions};
use crate::{workload, KeyValue, Workload};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Mapping,
    Shuffling,
    Reducing,
    Completed,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Submitted => "submitted",
            JobState::Mapping => "mapping",
            JobState::Shuffling => "shuffling",
            JobState::Reducing => "reducing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Summary of a completed job.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub state: JobState,
    pub counters: CounterSnapshot,
    pub map_tasks: usize,
    pub reduce_tasks: usize,
    pub distinct_keys: u64,
    pub elapsed: Duration,
}

/// Stops a running job. Tasks notice between records.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

pub struct JobRunner {
    config: JobConfig,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn Sink>,
    state: watch::Sender<JobState>,
    cancel: Arc<watch::Sender<bool>>,
}

struct PhaseStats {
    map_tasks: usize,
    reduce_tasks: usize,
    distinct_keys: u64,
}

impl JobRunner {
    pub fn new(config: JobConfig, source: Arc<dyn RecordSource>, sink: Arc<dyn Sink>) -> Self {
        let (state, _) = watch::channel(JobState::Submitted);
        let (cancel, _) = watch::channel(false);
        Self {
            config,
            source,
            sink,
            state,
            cancel: Arc::new(cancel),
        }
    }

    /// Follow the job state as it moves through its phases.
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    fn transition(&self, job_id: Uuid, state: JobState) {
        tracing::info!(%job_id, %state, "job state changed");
        self.state.send_replace(state);
    }

    /// Run the job to completion.
    ///
    /// On failure the sink is aborted, so no output is left behind.
    pub async fn run(self) -> Result<JobReport, JobError> {
        let job_id = Uuid::new_v4();
        let started = Instant::now();
        let counters = Counters::new(self.config.counter_group.clone());
        tracing::info!(%job_id, filter = %self.config.filter, "job submitted");

        let outcome = match self.prepare() {
            Ok(engine) => self
                .execute(job_id, engine, &counters)
                .await
                .map_err(JobError::from),
            Err(e) => Err(JobError::from(e)),
        };

        match outcome {
            Ok(stats) => {
                self.transition(job_id, JobState::Completed);
                let report = JobReport {
                    job_id,
                    state: JobState::Completed,
                    counters: counters.snapshot(),
                    map_tasks: stats.map_tasks,
                    reduce_tasks: stats.reduce_tasks,
                    distinct_keys: stats.distinct_keys,
                    elapsed: started.elapsed(),
                };
                tracing::info!(
                    %job_id,
                    rows = report.counters.rows_processed(),
                    keys = report.distinct_keys,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "job completed"
                );
                Ok(report)
            }
            Err(e) => {
                self.cancel.send_replace(true);
                let sink = Arc::clone(&self.sink);
                if let Err(join) = tokio::task::spawn_blocking(move || sink.abort()).await {
                    tracing::warn!(error = %join, "sink abort did not finish");
                }
                self.transition(job_id, JobState::Failed);
                tracing::error!(%job_id, error = %e, "job failed");
                Err(e)
            }
        }
    }

    fn prepare(&self) -> Result<Workload, UsageError> {
        self.config.validate()?;
        workload::try_named(&self.config.workload)
            .ok_or_else(|| UsageError::UnknownWorkload(self.config.workload.clone()))
    }

    async fn execute(
        &self,
        job_id: Uuid,
        engine: Workload,
        counters: &Counters,
    ) -> Result<PhaseStats, InfrastructureError> {
        let execution = &self.config.execution;
        let aux = Bytes::from(self.config.filter.clone());
        let options = ScanOptions::from_config(&self.config.scan, &self.config.filter);
        let settings = MapSettings {
            num_reduce_worker: execution.reducers,
            combine: execution.combine,
        };
        let permits = Arc::new(Semaphore::new(execution.parallelism.max(1)));
        let max_attempts = execution.max_attempts.max(1);

        let source = Arc::clone(&self.source);
        let partitions = tokio::task::spawn_blocking(move || source.partitions())
            .await
            .map_err(|e| panicked("plan partitions", e))??;
        let map_tasks = partitions.len();
        tracing::info!(%job_id, partitions = map_tasks, "planned map tasks");

        // map phase
        self.transition(job_id, JobState::Mapping);
        let shuffle = Shuffle::new();
        let mut maps = JoinSet::new();
        for partition in partitions {
            let source = Arc::clone(&self.source);
            let options = options.clone();
            let aux = aux.clone();
            let cancel = self.cancel.subscribe();
            let task = format!("map {partition}");
            maps.spawn(run_with_retries(
                task,
                max_attempts,
                Arc::clone(&permits),
                self.cancel.subscribe(),
                move || -> Result<MapTaskOutput, InfrastructureError> {
                    let scan = source.open_partition_scan(&partition, &options)?;
                    perform_map(&partition, scan, &engine, &aux, settings, &cancel)
                },
            ));
        }
        drain(&mut maps, &self.cancel, |output: MapTaskOutput| {
            counters.merge(&output.counters);
            shuffle.absorb(output.buckets);
        })
        .await?;

        // shuffle
        self.transition(job_id, JobState::Shuffling);
        if shuffle.is_empty() {
            tracing::warn!(%job_id, "no pairs were emitted, the output will be empty");
        }
        let buckets = shuffle.into_buckets();
        let reduce_tasks = buckets.len();
        tracing::info!(%job_id, buckets = reduce_tasks, "shuffle finished");

        // reduce phase
        self.transition(job_id, JobState::Reducing);
        let mut reduces = JoinSet::new();
        for (reduce_id, bucket) in buckets {
            let bucket: Arc<Vec<KeyValue>> = Arc::new(bucket);
            let sink = Arc::clone(&self.sink);
            let aux = aux.clone();
            let cancel = self.cancel.subscribe();
            let task = format!("reduce {reduce_id}");
            reduces.spawn(run_with_retries(
                task,
                max_attempts,
                Arc::clone(&permits),
                self.cancel.subscribe(),
                move || -> Result<TaskCounters, InfrastructureError> {
                    let mut writer = sink.open_part(reduce_id)?;
                    let task_counters = perform_reduce(
                        reduce_id,
                        &bucket,
                        &engine,
                        &aux,
                        writer.as_mut(),
                        &cancel,
                    )?;
                    writer.commit()?;
                    Ok(task_counters)
                },
            ));
        }
        let mut distinct_keys = 0;
        drain(&mut reduces, &self.cancel, |task_counters: TaskCounters| {
            distinct_keys += task_counters.reduce_output_records;
            counters.merge(&task_counters);
        })
        .await?;

        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || sink.commit())
            .await
            .map_err(|e| panicked("commit output", e))??;

        Ok(PhaseStats {
            map_tasks,
            reduce_tasks,
            distinct_keys,
        })
    }
}

/// Run `attempt` on the blocking pool until it succeeds or `max_attempts`
/// attempts have failed. A panic counts as a failed attempt.
async fn run_with_retries<T, F>(
    task: String,
    max_attempts: u32,
    permits: Arc<Semaphore>,
    cancel: watch::Receiver<bool>,
    attempt: F,
) -> Result<T, InfrastructureError>
where
    T: Send + 'static,
    F: Fn() -> Result<T, InfrastructureError> + Send + Sync + 'static,
{
    let attempt = Arc::new(attempt);
    let mut last_error = None;
    for attempt_no in 1..=max_attempts {
        let cancelled = *cancel.borrow();
        if cancelled {
            return Err(InfrastructureError::Cancelled);
        }
        let _permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .map_err(|_| InfrastructureError::Cancelled)?;

        let run = Arc::clone(&attempt);
        let result = tokio::task::spawn_blocking(move || run())
            .await
            .unwrap_or_else(|e| Err(panicked(&task, e)));
        match result {
            Ok(value) => {
                if attempt_no > 1 {
                    tracing::info!(task = %task, attempt = attempt_no, "task succeeded after retry");
                }
                return Ok(value);
            }
            Err(InfrastructureError::Cancelled) => return Err(InfrastructureError::Cancelled),
            Err(e) => {
                tracing::warn!(
                    task = %task,
                    attempt = attempt_no,
                    max_attempts,
                    error = %describe(&e),
                    "task attempt failed"
                );
                last_error = Some(e);
            }
        }
    }
    Err(InfrastructureError::TaskFailed {
        task,
        attempts: max_attempts,
        source: Box::new(last_error.unwrap_or(InfrastructureError::Cancelled)),
    })
}

/// Wait for every task in `tasks`. The first failure cancels the rest and is
/// returned once they have all stopped.
async fn drain<T: 'static>(
    tasks: &mut JoinSet<Result<T, InfrastructureError>>,
    cancel: &watch::Sender<bool>,
    mut on_done: impl FnMut(T),
) -> Result<(), InfrastructureError> {
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|e| Err(panicked("scheduler", e)));
        match result {
            Ok(value) if first_error.is_none() => on_done(value),
            Ok(_) => {}
            Err(e) => {
                if first_error.is_none() {
                    cancel.send_replace(true);
                    first_error = Some(e);
                }
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn panicked(task: &str, e: JoinError) -> InfrastructureError {
    let message = if e.is_panic() {
        let payload = e.into_panic();
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string())
    } else {
        e.to_string()
    };
    InfrastructureError::TaskPanicked {
        task: task.to_string(),
        message,
    }
}
