//! Newline-delimited text inputs.
//!
//! Files are cut into byte ranges of roughly `split_bytes`. A line belongs
//! to the range that holds its first byte, so a scan starting mid-file skips
//! the tail of the previous line and a scan reads past its end to finish its
//! last line.

use super::{expand_input, Partition, PartitionRange, Record, RecordScan, RecordSource, ScanOptions};
use crate::error::InfrastructureError;
use crate::KeyValue;
use bytes::Bytes;
use dashmap::DashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const MIN_READ_AHEAD: usize = 8 * 1024;
const MAX_READ_AHEAD: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    /// The whole line is the payload; the row key is `<file name>:<byte offset>`.
    Json,
    /// `<row key>\t<payload>`. A line without a tab is keyed like [`LineFormat::Json`].
    Keyed,
}

pub struct LinesSource {
    pattern: String,
    format: LineFormat,
    split_bytes: u64,
    blocks: DashMap<PathBuf, Bytes>,
}

impl LinesSource {
    pub fn new(pattern: impl Into<String>, format: LineFormat, split_bytes: u64) -> Self {
        Self {
            pattern: pattern.into(),
            format,
            split_bytes: split_bytes.max(1),
            blocks: DashMap::new(),
        }
    }

    fn cached_file(&self, path: &Path) -> Result<Bytes, InfrastructureError> {
        if let Some(block) = self.blocks.get(path) {
            return Ok(block.clone());
        }
        let data = std::fs::read(path).map_err(|e| {
            InfrastructureError::source_error(format!("failed to read {}", path.display()), e)
        })?;
        let data = Bytes::from(data);
        self.blocks.insert(path.to_path_buf(), data.clone());
        Ok(data)
    }
}

impl RecordSource for LinesSource {
    fn partitions(&self) -> Result<Vec<Partition>, InfrastructureError> {
        let mut partitions = Vec::new();
        for path in expand_input(&self.pattern)? {
            let len = std::fs::metadata(&path)
                .map_err(|e| {
                    InfrastructureError::source_error(format!("failed to stat {}", path.display()), e)
                })?
                .len();
            let mut start = 0;
            while start < len {
                let end = len.min(start.saturating_add(self.split_bytes));
                partitions.push(Partition {
                    id: partitions.len(),
                    range: PartitionRange::Bytes {
                        path: path.clone(),
                        start,
                        end,
                    },
                });
                start = end;
            }
        }
        Ok(partitions)
    }

    fn open_partition_scan(
        &self,
        partition: &Partition,
        options: &ScanOptions,
    ) -> Result<RecordScan, InfrastructureError> {
        let PartitionRange::Bytes { path, start, end } = &partition.range else {
            return Err(InfrastructureError::source_error(
                format!("partition {partition} is not a byte range"),
                anyhow::anyhow!("wrong partition kind for a line source"),
            ));
        };
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let open_err = |e: std::io::Error| {
            InfrastructureError::source_error(format!("failed to open {}", path.display()), e)
        };

        if options.cache_blocks {
            let reader = Cursor::new(self.cached_file(path)?);
            let scan = LineScan::new(reader, *start, *end, file_name, self.format, options.clone())
                .map_err(open_err)?;
            Ok(Box::new(scan))
        } else {
            let read_ahead = options
                .caching
                .saturating_mul(1024)
                .clamp(MIN_READ_AHEAD, MAX_READ_AHEAD);
            let file = File::open(path).map_err(open_err)?;
            let reader = BufReader::with_capacity(read_ahead, file);
            let scan = LineScan::new(reader, *start, *end, file_name, self.format, options.clone())
                .map_err(open_err)?;
            Ok(Box::new(scan))
        }
    }
}

struct LineScan<R> {
    reader: R,
    pos: u64,
    end: u64,
    file_name: String,
    format: LineFormat,
    options: ScanOptions,
    buf: Vec<u8>,
    done: bool,
}

impl<R: BufRead + Seek> LineScan<R> {
    fn new(
        mut reader: R,
        start: u64,
        end: u64,
        file_name: String,
        format: LineFormat,
        options: ScanOptions,
    ) -> std::io::Result<Self> {
        let pos = if start == 0 {
            reader.seek(SeekFrom::Start(0))?;
            0
        } else {
            // The line holding byte `start - 1` belongs to the previous range.
            reader.seek(SeekFrom::Start(start - 1))?;
            let mut tail = Vec::new();
            let skipped = reader.read_until(b'\n', &mut tail)?;
            start - 1 + skipped as u64
        };
        Ok(Self {
            reader,
            pos,
            end,
            file_name,
            format,
            options,
            buf: Vec::new(),
            done: false,
        })
    }

    fn record(&self, offset: u64, line: &[u8]) -> Record {
        let offset_key = || Bytes::from(format!("{}:{}", self.file_name, offset));
        match self.format {
            LineFormat::Json => KeyValue::new(offset_key(), Bytes::copy_from_slice(line)),
            LineFormat::Keyed => match line.iter().position(|&b| b == b'\t') {
                Some(tab) => KeyValue::new(
                    Bytes::copy_from_slice(&line[..tab]),
                    Bytes::copy_from_slice(&line[tab + 1..]),
                ),
                None => KeyValue::new(offset_key(), Bytes::copy_from_slice(line)),
            },
        }
    }
}

impl<R: BufRead + Seek> Iterator for LineScan<R> {
    type Item = Result<Record, InfrastructureError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.pos >= self.end {
                return None;
            }
            self.buf.clear();
            let offset = self.pos;
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => {
                    self.pos += n as u64;
                    let mut line = self.buf.as_slice();
                    if let Some(stripped) = line.strip_suffix(b"\n") {
                        line = stripped;
                    }
                    if let Some(stripped) = line.strip_suffix(b"\r") {
                        line = stripped;
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let record = self.record(offset, line);
                    if !self.options.admits(&record.value) {
                        continue;
                    }
                    return Some(Ok(record));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(InfrastructureError::source_error(
                        format!("failed to read {} at byte {}", self.file_name, offset),
                        e,
                    )));
                }
            }
        }
    }
}
