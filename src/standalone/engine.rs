use crate::counters::TaskCounters;
use crate::error::{Chain, InfrastructureError};
use crate::sink::{AggregateResult, PartWriter};
use crate::source::{Partition, RecordScan};
use crate::utils::{display_key, string_from_bytes};
use crate::*;
use bytes::Bytes;
use itertools::Itertools;
use std::collections::HashMap;
use tokio::sync::watch;

use super::shuffle::BucketIndex;

/// What one map task attempt hands to the shuffle.
#[derive(Debug, Default)]
pub struct MapTaskOutput {
    pub buckets: HashMap<BucketIndex, Vec<KeyValue>>,
    pub counters: TaskCounters,
}

/// Settings shared by every map task of a job.
#[derive(Clone, Copy, Debug)]
pub struct MapSettings {
    pub num_reduce_worker: u32,
    pub combine: bool,
}

/// Run the map stage over one partition.
///
/// Every record read bumps `rows_processed`, whether or not it yields any
/// pair. A record the workload cannot use is logged and skipped; only a
/// failing scan or a failing combiner fails the attempt.
#[tracing::instrument(name = "map", skip_all, fields(partition = %partition))]
pub fn perform_map(
    partition: &Partition,
    scan: RecordScan,
    engine: &Workload,
    serialized_args: &Bytes,
    settings: MapSettings,
    cancel: &watch::Receiver<bool>,
) -> Result<MapTaskOutput, InfrastructureError> {
    let map_func = engine.map_fn;
    let num_reduce_worker = settings.num_reduce_worker.max(1);
    let mut output = MapTaskOutput::default();

    for item in scan {
        if *cancel.borrow() {
            return Err(InfrastructureError::Cancelled);
        }
        let record = item?;
        output.counters.rows_processed += 1;
        let row_key = record.key();

        match map_func(record, serialized_args.clone()) {
            Ok(pairs) => {
                for KeyValue { key, value } in pairs {
                    let bucket_no = ihash(&key) % num_reduce_worker;
                    output.counters.pairs_emitted += 1;
                    output
                        .buckets
                        .entry(bucket_no)
                        .or_default()
                        .push(KeyValue { key, value });
                }
            }
            Err(err) => {
                output.counters.record_error(&err);
                tracing::error!(
                    row_key = %display_key(&row_key),
                    partition = %partition,
                    kind = err.kind(),
                    error = %err,
                    "Error in map process"
                );
            }
        }
    }

    if settings.combine {
        for bucket in output.buckets.values_mut() {
            *bucket = reduce_bucket(bucket, engine, serialized_args)?;
        }
    }

    tracing::debug!(
        rows = output.counters.rows_processed,
        pairs = output.counters.pairs_emitted,
        errors = output.counters.extraction_errors(),
        "map task finished"
    );
    Ok(output)
}

/// Sort a bucket by key and apply the reduce function to each group.
///
/// Returns one pair per distinct key, in key order. The bucket itself is
/// left untouched, so a retried task can reduce it again.
pub fn reduce_bucket(
    bkt: &[KeyValue],
    engine: &Workload,
    serialized_args: &Bytes,
) -> Result<Vec<KeyValue>, InfrastructureError> {
    let reduce_func = engine.reduce_fn;
    let mut pairs: Vec<&KeyValue> = bkt.iter().collect();
    pairs.sort_unstable_by(|a, b| a.key.cmp(&b.key));
    let mut out = Vec::new();
    for (key, value_group) in &pairs.into_iter().chunk_by(|kv| kv.key()) {
        let iter = value_group.map(KeyValue::value);
        let value = reduce_func(key.clone(), Box::new(iter), serialized_args.clone()).map_err(
            |source| InfrastructureError::Reduce {
                key: display_key(&key).into_owned(),
                source,
            },
        )?;
        out.push(KeyValue { key, value });
    }
    Ok(out)
}

/// Run the reduce stage over one shuffled bucket, writing every result to `writer`.
#[tracing::instrument(name = "reduce", skip_all, fields(reduce_id = reduce_id))]
pub fn perform_reduce(
    reduce_id: BucketIndex,
    bucket: &[KeyValue],
    engine: &Workload,
    serialized_args: &Bytes,
    writer: &mut dyn PartWriter,
    cancel: &watch::Receiver<bool>,
) -> Result<TaskCounters, InfrastructureError> {
    let mut counters = TaskCounters::default();
    for KeyValue { key, value } in reduce_bucket(bucket, engine, serialized_args)? {
        if *cancel.borrow() {
            return Err(InfrastructureError::Cancelled);
        }
        let result = decode_result(key, value)?;
        writer.write(&result)?;
        counters.reduce_output_records += 1;
    }
    tracing::debug!(keys = counters.reduce_output_records, "reduce task finished");
    Ok(counters)
}

fn decode_result(key: Bytes, value: Bytes) -> Result<AggregateResult, InfrastructureError> {
    let label = display_key(&key).into_owned();
    let total = codec::decode_count(value).map_err(|source| InfrastructureError::Reduce {
        key: label.clone(),
        source,
    })?;
    let key = string_from_bytes(key).map_err(|source| InfrastructureError::Reduce {
        key: label,
        source,
    })?;
    Ok(AggregateResult { key, total })
}

/// Log line for a failed attempt, including the whole cause chain.
pub(crate) fn describe(err: &InfrastructureError) -> String {
    Chain(err).to_string().trim_end().replace('\n', " ")
}
