//! Record sources.
//!
//! A source splits its dataset into disjoint [`Partition`]s and opens a
//! sequential scan over any one of them. Every record of the dataset belongs
//! to exactly one partition, so running one map task per partition sees each
//! record exactly once.

use crate::config::{ScanConfig, SourceConfig, SourceFormat};
use crate::error::{InfrastructureError, UsageError};
use crate::KeyValue;
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

pub mod lines;
pub mod memory;
pub mod table;

pub use lines::{LineFormat, LinesSource};
pub use memory::MemorySource;
pub use table::{write_table, TableSource};

/// A scanned record: the key is the row key, the value is the raw payload.
pub type Record = KeyValue;

/// Sequential scan over one partition.
///
/// An `Err` item means the partition could not be read any further; the
/// map task attempt fails and is retried as a whole.
pub type RecordScan = Box<dyn Iterator<Item = Result<Record, InfrastructureError>> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionRange {
    /// Lines of a text file whose first byte lies in `start..end`.
    Bytes { path: PathBuf, start: u64, end: u64 },
    /// One row group of a Parquet file.
    RowGroup { path: PathBuf, index: usize },
    /// Records `start..end` of an in-memory dataset.
    Slice { start: usize, end: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub id: usize,
    pub range: PartitionRange,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.range {
            PartitionRange::Bytes { path, start, end } => {
                write!(f, "#{} {}[{}..{})", self.id, path.display(), start, end)
            }
            PartitionRange::RowGroup { path, index } => {
                write!(f, "#{} {} row group {}", self.id, path.display(), index)
            }
            PartitionRange::Slice { start, end } => {
                write!(f, "#{} records[{}..{})", self.id, start, end)
            }
        }
    }
}

/// Scan tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    /// Records fetched per read batch.
    pub caching: usize,
    /// Keep decoded blocks in the source's cache for later scans.
    pub cache_blocks: bool,
    /// When set, only records whose raw payload contains these bytes are returned.
    pub prefilter: Option<Bytes>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            caching: 500,
            cache_blocks: false,
            prefilter: None,
        }
    }
}

impl ScanOptions {
    pub fn from_config(scan: &ScanConfig, filter: &str) -> Self {
        Self {
            caching: scan.caching.max(1),
            cache_blocks: scan.cache_blocks,
            prefilter: scan
                .prefilter
                .then(|| Bytes::copy_from_slice(filter.trim().as_bytes())),
        }
    }

    /// Whether a payload passes the source-side filter.
    pub fn admits(&self, payload: &[u8]) -> bool {
        match &self.prefilter {
            None => true,
            Some(needle) if needle.is_empty() => true,
            Some(needle) => payload
                .windows(needle.len())
                .any(|window| window == needle.as_ref()),
        }
    }
}

pub trait RecordSource: Send + Sync {
    /// The disjoint partitions covering the whole dataset.
    fn partitions(&self) -> Result<Vec<Partition>, InfrastructureError>;

    /// Open a scan over one partition returned by [`RecordSource::partitions`].
    fn open_partition_scan(
        &self,
        partition: &Partition,
        options: &ScanOptions,
    ) -> Result<RecordScan, InfrastructureError>;
}

/// Build the source described by `config`.
pub fn open(config: &SourceConfig) -> Result<Arc<dyn RecordSource>, UsageError> {
    let input = config
        .input
        .clone()
        .ok_or_else(|| {
            UsageError::InvalidConfig("no input given (use --input or `source.input`)".to_string())
        })?;
    glob::Pattern::new(&input)
        .map_err(|e| UsageError::InvalidConfig(format!("bad input pattern {input:?}: {e}")))?;

    let source: Arc<dyn RecordSource> = match config.format {
        SourceFormat::Jsonl => Arc::new(LinesSource::new(
            input,
            LineFormat::Json,
            config.split_bytes,
        )),
        SourceFormat::Tsv => Arc::new(LinesSource::new(
            input,
            LineFormat::Keyed,
            config.split_bytes,
        )),
        SourceFormat::Table => Arc::new(TableSource::new(
            input,
            &config.row_key_column,
            &config.payload_column,
        )),
    };
    Ok(source)
}

/// Expand an input glob into the regular files it matches, in path order.
pub(crate) fn expand_input(pattern: &str) -> Result<Vec<PathBuf>, InfrastructureError> {
    let entries = glob::glob(pattern).map_err(|e| {
        InfrastructureError::source_error(format!("bad input pattern {pattern:?}"), e)
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| InfrastructureError::source_error("failed to read input path", e))?;
        if path.is_file() {
            paths.push(path);
        }
    }
    if paths.is_empty() {
        return Err(InfrastructureError::source_error(
            format!("no input files match {pattern:?}"),
            anyhow::anyhow!("input is empty"),
        ));
    }
    paths.sort();
    Ok(paths)
}
