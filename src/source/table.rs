//! Parquet "table" inputs.
//!
//! A table is a set of Parquet files holding a row key column and a payload
//! column, both binary (utf8 is accepted as well). Each row group is one
//! partition.

use super::{expand_input, Partition, PartitionRange, Record, RecordScan, RecordSource, ScanOptions};
use crate::error::InfrastructureError;
use crate::KeyValue;
use anyhow::{anyhow, Context};
use arrow::array::{Array, ArrayRef, BinaryArray, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use dashmap::DashMap;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type BlockKey = (PathBuf, usize);
type Batches = Box<dyn Iterator<Item = Result<RecordBatch, InfrastructureError>> + Send>;

pub struct TableSource {
    pattern: String,
    row_key_column: String,
    payload_column: String,
    blocks: DashMap<BlockKey, Arc<Vec<RecordBatch>>>,
}

impl TableSource {
    pub fn new(pattern: impl Into<String>, row_key_column: &str, payload_column: &str) -> Self {
        Self {
            pattern: pattern.into(),
            row_key_column: row_key_column.to_string(),
            payload_column: payload_column.to_string(),
            blocks: DashMap::new(),
        }
    }

    fn read_row_group(
        &self,
        path: &Path,
        index: usize,
        batch_size: usize,
    ) -> anyhow::Result<parquet::arrow::arrow_reader::ParquetRecordBatchReader> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let schema = builder.schema().clone();
        let key_idx = schema
            .index_of(&self.row_key_column)
            .with_context(|| format!("{} has no column `{}`", path.display(), self.row_key_column))?;
        let payload_idx = schema
            .index_of(&self.payload_column)
            .with_context(|| format!("{} has no column `{}`", path.display(), self.payload_column))?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), [key_idx, payload_idx]);
        let reader = builder
            .with_row_groups(vec![index])
            .with_batch_size(batch_size)
            .with_projection(mask)
            .build()?;
        Ok(reader)
    }

    fn cached_row_group(
        &self,
        path: &Path,
        index: usize,
        batch_size: usize,
    ) -> anyhow::Result<Arc<Vec<RecordBatch>>> {
        let key = (path.to_path_buf(), index);
        if let Some(block) = self.blocks.get(&key) {
            return Ok(block.clone());
        }
        let batches = self
            .read_row_group(path, index, batch_size)?
            .collect::<Result<Vec<_>, _>>()?;
        let block = Arc::new(batches);
        self.blocks.insert(key, block.clone());
        Ok(block)
    }
}

impl RecordSource for TableSource {
    fn partitions(&self) -> Result<Vec<Partition>, InfrastructureError> {
        let mut partitions = Vec::new();
        for path in expand_input(&self.pattern)? {
            let row_groups = File::open(&path)
                .map_err(anyhow::Error::from)
                .and_then(|file| Ok(ParquetRecordBatchReaderBuilder::try_new(file)?))
                .map(|builder| builder.metadata().num_row_groups())
                .map_err(|e| {
                    InfrastructureError::source_error(
                        format!("failed to read table metadata of {}", path.display()),
                        e,
                    )
                })?;
            for index in 0..row_groups {
                partitions.push(Partition {
                    id: partitions.len(),
                    range: PartitionRange::RowGroup {
                        path: path.clone(),
                        index,
                    },
                });
            }
        }
        Ok(partitions)
    }

    fn open_partition_scan(
        &self,
        partition: &Partition,
        options: &ScanOptions,
    ) -> Result<RecordScan, InfrastructureError> {
        let PartitionRange::RowGroup { path, index } = &partition.range else {
            return Err(InfrastructureError::source_error(
                format!("partition {partition} is not a row group"),
                anyhow!("wrong partition kind for a table source"),
            ));
        };
        let open_err = |e: anyhow::Error| {
            InfrastructureError::source_error(format!("failed to scan {partition}"), e)
        };

        let batches: Batches = if options.cache_blocks {
            let block = self
                .cached_row_group(path, *index, options.caching)
                .map_err(open_err)?;
            Box::new((0..block.len()).map(move |i| Ok::<_, InfrastructureError>(block[i].clone())))
        } else {
            let reader = self
                .read_row_group(path, *index, options.caching)
                .map_err(open_err)?;
            let label = partition.to_string();
            Box::new(reader.map(move |batch| {
                batch.map_err(|e| {
                    InfrastructureError::source_error(format!("failed to decode {label}"), e)
                })
            }))
        };

        Ok(Box::new(TableScan {
            batches,
            rows: Vec::new().into_iter(),
            row_key_column: self.row_key_column.clone(),
            payload_column: self.payload_column.clone(),
            options: options.clone(),
        }))
    }
}

struct TableScan {
    batches: Batches,
    rows: std::vec::IntoIter<Record>,
    row_key_column: String,
    payload_column: String,
    options: ScanOptions,
}

impl TableScan {
    fn decode(&self, batch: &RecordBatch) -> anyhow::Result<Vec<Record>> {
        let keys = binary_column(batch, &self.row_key_column)?;
        let payloads = binary_column(batch, &self.payload_column)?;
        Ok(keys
            .into_iter()
            .zip(payloads)
            .map(|(key, payload)| {
                KeyValue::new(key.unwrap_or_default(), payload.unwrap_or_default())
            })
            .filter(|record| self.options.admits(&record.value))
            .collect())
    }
}

impl Iterator for TableScan {
    type Item = Result<Record, InfrastructureError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.rows.next() {
                return Some(Ok(record));
            }
            let batch = match self.batches.next()? {
                Ok(batch) => batch,
                Err(e) => return Some(Err(e)),
            };
            match self.decode(&batch) {
                Ok(rows) => self.rows = rows.into_iter(),
                Err(e) => {
                    return Some(Err(InfrastructureError::source_error(
                        "failed to decode table rows",
                        e,
                    )))
                }
            }
        }
    }
}

/// Read a binary or utf8 column; null cells come back as `None`.
fn binary_column(batch: &RecordBatch, name: &str) -> anyhow::Result<Vec<Option<Bytes>>> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("batch has no column `{}`", name))?;
    if let Some(array) = column.as_any().downcast_ref::<BinaryArray>() {
        return Ok(array
            .iter()
            .map(|cell| cell.map(Bytes::copy_from_slice))
            .collect());
    }
    if let Some(array) = column.as_any().downcast_ref::<StringArray>() {
        return Ok(array
            .iter()
            .map(|cell| cell.map(|s| Bytes::copy_from_slice(s.as_bytes())))
            .collect());
    }
    Err(anyhow!(
        "column `{}` has type {}, expected binary or utf8",
        name,
        column.data_type()
    ))
}

/// Write records as a table file with at most `row_group_size` rows per row group.
pub fn write_table(
    path: impl AsRef<Path>,
    records: &[KeyValue],
    row_key_column: &str,
    payload_column: &str,
    row_group_size: usize,
) -> anyhow::Result<()> {
    let path = path.as_ref();
    let keys: Vec<&[u8]> = records.iter().map(|kv| kv.key.as_ref()).collect();
    let payloads: Vec<&[u8]> = records.iter().map(|kv| kv.value.as_ref()).collect();
    let schema = Arc::new(Schema::new(vec![
        Field::new(row_key_column, DataType::Binary, false),
        Field::new(payload_column, DataType::Binary, true),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(BinaryArray::from(keys)) as ArrayRef,
            Arc::new(BinaryArray::from(payloads)) as ArrayRef,
        ],
    )?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_max_row_group_size(row_group_size.max(1))
        .build();
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}
