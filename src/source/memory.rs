//! In-memory dataset, for tests and small inputs.

use super::{Partition, PartitionRange, RecordScan, RecordSource, ScanOptions};
use crate::error::InfrastructureError;
use crate::KeyValue;
use std::sync::Arc;

pub struct MemorySource {
    records: Arc<Vec<KeyValue>>,
    bounds: Vec<usize>,
}

impl MemorySource {
    /// Split `records` into `partitions` contiguous slices of near-equal size.
    pub fn new(records: Vec<KeyValue>, partitions: usize) -> Self {
        let len = records.len();
        let n = partitions.clamp(1, len.max(1));
        let bounds = (1..n).map(|i| i * len / n).collect();
        Self::with_bounds(records, bounds)
    }

    /// Split `records` at the given indices. Out-of-range and repeated
    /// indices are ignored, so any list gives a valid partitioning.
    pub fn with_bounds(records: Vec<KeyValue>, mut bounds: Vec<usize>) -> Self {
        let len = records.len();
        bounds.retain(|&b| b > 0 && b < len);
        bounds.sort_unstable();
        bounds.dedup();
        Self {
            records: Arc::new(records),
            bounds,
        }
    }
}

impl RecordSource for MemorySource {
    fn partitions(&self) -> Result<Vec<Partition>, InfrastructureError> {
        if self.records.is_empty() {
            return Ok(Vec::new());
        }
        let mut edges = Vec::with_capacity(self.bounds.len() + 2);
        edges.push(0);
        edges.extend_from_slice(&self.bounds);
        edges.push(self.records.len());
        Ok(edges
            .windows(2)
            .enumerate()
            .map(|(id, w)| Partition {
                id,
                range: PartitionRange::Slice {
                    start: w[0],
                    end: w[1],
                },
            })
            .collect())
    }

    fn open_partition_scan(
        &self,
        partition: &Partition,
        options: &ScanOptions,
    ) -> Result<RecordScan, InfrastructureError> {
        let PartitionRange::Slice { start, end } = partition.range else {
            return Err(InfrastructureError::source_error(
                format!("partition {partition} is not a slice"),
                anyhow::anyhow!("wrong partition kind for a memory source"),
            ));
        };
        if start > end || end > self.records.len() {
            return Err(InfrastructureError::source_error(
                format!("partition {partition} is out of range"),
                anyhow::anyhow!("dataset holds {} records", self.records.len()),
            ));
        }
        let records = Arc::clone(&self.records);
        let options = options.clone();
        Ok(Box::new(
            (start..end)
                .map(move |i| records[i].clone())
                .filter(move |record| options.admits(&record.value))
                .map(Ok::<KeyValue, InfrastructureError>),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: usize) -> Vec<KeyValue> {
        (0..n).map(|i| KeyValue::new(format!("r{i}"), "{}")).collect()
    }

    #[test]
    fn even_split_covers_everything() {
        let source = MemorySource::new(records(10), 3);
        let partitions = source.partitions().unwrap();
        assert_eq!(partitions.len(), 3);
        let total: usize = partitions
            .iter()
            .map(|p| {
                source
                    .open_partition_scan(p, &ScanOptions::default())
                    .unwrap()
                    .count()
            })
            .sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn more_partitions_than_records() {
        let source = MemorySource::new(records(2), 8);
        assert_eq!(source.partitions().unwrap().len(), 2);
        assert!(MemorySource::new(Vec::new(), 4)
            .partitions()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn bounds_are_sanitised() {
        let source = MemorySource::with_bounds(records(5), vec![4, 0, 2, 2, 99]);
        let ranges: Vec<PartitionRange> = source
            .partitions()
            .unwrap()
            .into_iter()
            .map(|p| p.range)
            .collect();
        assert_eq!(
            ranges,
            vec![
                PartitionRange::Slice { start: 0, end: 2 },
                PartitionRange::Slice { start: 2, end: 4 },
                PartitionRange::Slice { start: 4, end: 5 },
            ]
        );
    }
}
