//! Output sinks.
//!
//! Reduce task attempts write through a [`PartWriter`]. A part only becomes
//! part of the output when its writer is committed, and the output as a whole
//! only becomes visible when the job commits the sink. A failed or cancelled
//! job aborts the sink, which leaves no result rows behind.

use crate::codec::encode_line;
use crate::error::{InfrastructureError, UsageError};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Marker written into the output directory once every part is in place.
pub const SUCCESS_MARKER: &str = "_SUCCESS";
const TEMPORARY: &str = "_temporary";

/// Final count of one group key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggregateResult {
    pub key: String,
    pub total: u64,
}

pub trait PartWriter: Send {
    fn write(&mut self, result: &AggregateResult) -> Result<(), InfrastructureError>;

    /// Publish this part to the job. Replaces the part of an earlier attempt
    /// of the same reduce task.
    fn commit(self: Box<Self>) -> Result<(), InfrastructureError>;
}

pub trait Sink: Send + Sync {
    fn open_part(&self, reduce_id: u32) -> Result<Box<dyn PartWriter>, InfrastructureError>;

    /// Make all committed parts visible as the job output.
    fn commit(&self) -> Result<(), InfrastructureError>;

    /// Throw away everything written so far.
    fn abort(&self);
}

pub fn part_name(reduce_id: u32) -> String {
    format!("part-r-{:05}", reduce_id)
}

/// Check the output location given on the command line.
pub fn validate_output(raw: &str) -> Result<PathBuf, UsageError> {
    if raw.trim().is_empty() {
        return Err(UsageError::InvalidOutput {
            path: PathBuf::from(raw),
            reason: "must not be blank".to_string(),
        });
    }
    let path = PathBuf::from(raw);
    if path.exists() {
        return Err(UsageError::OutputExists(path));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if parent.exists() && !parent.is_dir() {
            return Err(UsageError::InvalidOutput {
                path,
                reason: "parent is not a directory".to_string(),
            });
        }
    }
    Ok(path)
}

/// Writes `part-r-NNNNN` text files of `<key>\t<total>` lines into a
/// directory that must not exist yet.
#[derive(Debug)]
pub struct FileSink {
    output: PathBuf,
    staging: PathBuf,
}

impl FileSink {
    pub fn create(output: impl AsRef<Path>) -> Result<Self, InfrastructureError> {
        let output = output.as_ref().to_path_buf();
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                InfrastructureError::sink_error(format!("failed to create {}", parent.display()), e)
            })?;
        }
        fs::create_dir(&output).map_err(|e| {
            InfrastructureError::sink_error(format!("failed to create {}", output.display()), e)
        })?;
        let staging = output.join(TEMPORARY);
        fs::create_dir(&staging).map_err(|e| {
            InfrastructureError::sink_error(format!("failed to create {}", staging.display()), e)
        })?;
        Ok(Self { output, staging })
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

impl Sink for FileSink {
    fn open_part(&self, reduce_id: u32) -> Result<Box<dyn PartWriter>, InfrastructureError> {
        let attempt_dir = self.staging.join(format!("attempt-{}", Uuid::new_v4()));
        // Not create_dir_all: once the sink is aborted no attempt may recreate it.
        fs::create_dir(&attempt_dir).map_err(|e| {
            InfrastructureError::sink_error(
                format!("failed to create {}", attempt_dir.display()),
                e,
            )
        })?;
        let name = part_name(reduce_id);
        let attempt_path = attempt_dir.join(&name);
        let file = File::create(&attempt_path).map_err(|e| {
            InfrastructureError::sink_error(format!("failed to create {}", attempt_path.display()), e)
        })?;
        Ok(Box::new(FilePartWriter {
            writer: BufWriter::new(file),
            attempt_dir,
            attempt_path,
            final_path: self.staging.join(name),
        }))
    }

    fn commit(&self) -> Result<(), InfrastructureError> {
        let err = |context: String| move |e| InfrastructureError::sink_error(context, e);
        let entries = fs::read_dir(&self.staging)
            .map_err(err(format!("failed to list {}", self.staging.display())))?;
        for entry in entries {
            let entry = entry.map_err(err(format!("failed to list {}", self.staging.display())))?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with("part-r-") {
                continue;
            }
            let target = self.output.join(&name);
            fs::rename(entry.path(), &target)
                .map_err(err(format!("failed to move part into {}", target.display())))?;
        }
        File::create(self.output.join(SUCCESS_MARKER))
            .map_err(err(format!("failed to write {}", SUCCESS_MARKER)))?;
        fs::remove_dir_all(&self.staging)
            .map_err(err(format!("failed to remove {}", self.staging.display())))?;
        tracing::info!(output = %self.output.display(), "output committed");
        Ok(())
    }

    fn abort(&self) {
        match fs::remove_dir_all(&self.staging) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, "failed to clean up {}", self.staging.display()),
        }
        // A commit that failed halfway may already have moved some parts.
        if let Ok(entries) = fs::read_dir(&self.output) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with("part-r-") || name == SUCCESS_MARKER {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        tracing::warn!(error = %e, "failed to remove {}", entry.path().display());
                    }
                }
            }
        }
        if fs::remove_dir(&self.output).is_err() && self.output.exists() {
            let leftovers: Vec<String> = fs::read_dir(&self.output)
                .map(|entries| {
                    entries
                        .flatten()
                        .map(|entry| entry.file_name().to_string_lossy().into_owned())
                        .collect()
                })
                .unwrap_or_default();
            tracing::warn!(
                output = %self.output.display(),
                ?leftovers,
                "output directory left behind; it holds no complete result"
            );
        }
    }
}

struct FilePartWriter {
    writer: BufWriter<File>,
    attempt_dir: PathBuf,
    attempt_path: PathBuf,
    final_path: PathBuf,
}

impl PartWriter for FilePartWriter {
    fn write(&mut self, result: &AggregateResult) -> Result<(), InfrastructureError> {
        self.writer
            .write_all(&encode_line(&result.key, result.total))
            .map_err(|e| {
                InfrastructureError::sink_error(
                    format!("failed to write {}", self.attempt_path.display()),
                    e,
                )
            })
    }

    fn commit(self: Box<Self>) -> Result<(), InfrastructureError> {
        let FilePartWriter {
            writer,
            attempt_dir,
            attempt_path,
            final_path,
        } = *self;
        let context = format!("failed to commit {}", attempt_path.display());
        let file = writer
            .into_inner()
            .map_err(|e| InfrastructureError::sink_error(context.clone(), e.into_error()))?;
        file.sync_all()
            .map_err(|e| InfrastructureError::sink_error(context.clone(), e))?;
        drop(file);
        if final_path.exists() {
            fs::remove_file(&final_path)
                .map_err(|e| InfrastructureError::sink_error(context.clone(), e))?;
        }
        fs::rename(&attempt_path, &final_path)
            .map_err(|e| InfrastructureError::sink_error(context.clone(), e))?;
        fs::remove_dir(&attempt_dir).map_err(|e| InfrastructureError::sink_error(context, e))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    committed_parts: BTreeMap<u32, Vec<AggregateResult>>,
    output: Option<Vec<AggregateResult>>,
    aborted: bool,
}

/// Keeps results in memory. Cloning shares the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The committed output sorted by key, or `None` until the job committed.
    pub fn results(&self) -> Option<Vec<AggregateResult>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.output.clone().map(|mut results| {
            results.sort();
            results
        })
    }

    pub fn is_aborted(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .aborted
    }
}

impl Sink for MemorySink {
    fn open_part(&self, reduce_id: u32) -> Result<Box<dyn PartWriter>, InfrastructureError> {
        Ok(Box::new(MemoryPartWriter {
            reduce_id,
            rows: Vec::new(),
            state: Arc::clone(&self.state),
        }))
    }

    fn commit(&self) -> Result<(), InfrastructureError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let parts = std::mem::take(&mut state.committed_parts);
        state.output = Some(parts.into_values().flatten().collect());
        Ok(())
    }

    fn abort(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.committed_parts.clear();
        state.output = None;
        state.aborted = true;
    }
}

struct MemoryPartWriter {
    reduce_id: u32,
    rows: Vec<AggregateResult>,
    state: Arc<Mutex<MemoryState>>,
}

impl PartWriter for MemoryPartWriter {
    fn write(&mut self, result: &AggregateResult) -> Result<(), InfrastructureError> {
        self.rows.push(result.clone());
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), InfrastructureError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.committed_parts.insert(self.reduce_id, self.rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_line;

    fn result(key: &str, total: u64) -> AggregateResult {
        AggregateResult {
            key: key.to_string(),
            total,
        }
    }

    fn read_output(dir: &Path) -> Vec<AggregateResult> {
        let mut rows = Vec::new();
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.file_name().unwrap().to_string_lossy().starts_with("part-r-") {
                for line in fs::read_to_string(&path).unwrap().lines() {
                    let (key, total) = decode_line(line).unwrap();
                    rows.push(result(&key, total));
                }
            }
        }
        rows.sort();
        rows
    }

    #[test]
    fn committed_output_has_parts_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let sink = FileSink::create(&out).unwrap();

        let mut part = sink.open_part(3).unwrap();
        part.write(&result("Shirts", 2)).unwrap();
        part.write(&result("Men", 1)).unwrap();
        part.commit().unwrap();
        sink.commit().unwrap();

        assert!(out.join(SUCCESS_MARKER).exists());
        assert!(out.join("part-r-00003").exists());
        assert!(!out.join(TEMPORARY).exists());
        assert_eq!(read_output(&out), vec![result("Men", 1), result("Shirts", 2)]);
    }

    #[test]
    fn retried_part_replaces_the_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let sink = FileSink::create(&out).unwrap();

        let mut first = sink.open_part(0).unwrap();
        first.write(&result("Men", 1)).unwrap();
        first.commit().unwrap();
        let mut abandoned = sink.open_part(0).unwrap();
        abandoned.write(&result("Men", 99)).unwrap();
        drop(abandoned);
        let mut second = sink.open_part(0).unwrap();
        second.write(&result("Men", 1)).unwrap();
        second.commit().unwrap();
        sink.commit().unwrap();

        assert_eq!(read_output(&out), vec![result("Men", 1)]);
    }

    #[test]
    fn abort_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let sink = FileSink::create(&out).unwrap();
        let mut part = sink.open_part(0).unwrap();
        part.write(&result("Men", 1)).unwrap();
        part.commit().unwrap();
        sink.abort();

        assert!(!out.exists());
        assert!(sink.open_part(1).is_err());
    }

    #[test]
    fn abort_after_a_partial_commit_removes_moved_parts() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let sink = FileSink::create(&out).unwrap();
        let mut part = sink.open_part(0).unwrap();
        part.write(&result("Men", 1)).unwrap();
        part.commit().unwrap();
        // as if the commit had moved this part before failing
        fs::rename(out.join(TEMPORARY).join("part-r-00000"), out.join("part-r-00000")).unwrap();
        sink.abort();

        assert!(!out.exists());
    }

    #[test]
    fn abort_keeps_files_it_did_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let sink = FileSink::create(&out).unwrap();
        let mut part = sink.open_part(0).unwrap();
        part.write(&result("Men", 1)).unwrap();
        part.commit().unwrap();
        fs::write(out.join("notes.txt"), "mine").unwrap();
        sink.abort();

        assert!(out.join("notes.txt").exists());
        assert!(!out.join(TEMPORARY).exists());
        assert!(!out.join("part-r-00000").exists());
    }

    #[test]
    fn output_must_be_new_and_non_blank() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            validate_output(&dir.path().display().to_string()),
            Err(UsageError::OutputExists(_))
        ));
        assert!(matches!(
            validate_output("  "),
            Err(UsageError::InvalidOutput { .. })
        ));
        let file = dir.path().join("file");
        File::create(&file).unwrap();
        assert!(matches!(
            validate_output(&file.join("out").display().to_string()),
            Err(UsageError::InvalidOutput { .. })
        ));
        let fresh = dir.path().join("fresh");
        assert_eq!(
            validate_output(&fresh.display().to_string()).unwrap(),
            fresh
        );
        assert!(FileSink::create(&fresh).is_ok());
        assert!(FileSink::create(&fresh).is_err());
    }

    #[test]
    fn memory_sink_only_shows_committed_parts() {
        let sink = MemorySink::new();
        let mut kept = sink.open_part(1).unwrap();
        kept.write(&result("b", 2)).unwrap();
        kept.commit().unwrap();
        let mut lost = sink.open_part(0).unwrap();
        lost.write(&result("a", 1)).unwrap();
        drop(lost);

        assert_eq!(sink.results(), None);
        sink.commit().unwrap();
        assert_eq!(sink.results(), Some(vec![result("b", 2)]));
    }
}
