//! A partitioned "scan, extract, filter, group, sum" batch job.
//!
//! Records are scanned from a partitioned source, each payload is decoded
//! and its category path extracted, documents are filtered to one top-level
//! category, and every subcategory occurrence is counted. Map tasks run per
//! partition, pairs are routed to reduce buckets by key hash, and reduce
//! tasks sum the counts before the results are committed to an output
//! directory.

use bytes::Bytes;
use std::hash::Hasher;

pub mod cmd;
pub mod codec;
pub mod config;
pub mod counters;
pub mod error;
pub mod sink;
pub mod source;
pub mod standalone;
pub mod telemetry;
pub mod utils;
pub mod workload;

pub use error::{ExtractionError, InfrastructureError, JobError, UsageError};

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// The output of an application map function.
///
/// An `Err` is a per-record failure: the caller logs it and moves on to the
/// next record. It never fails the task.
pub type MapOutput = Result<Box<dyn Iterator<Item = KeyValue> + Send>, ExtractionError>;

/// A map function takes a record and auxiliary arguments.
///
/// It returns an iterator that yields intermediate key-value pairs.
pub type MapFn = fn(kv: KeyValue, aux: Bytes) -> MapOutput;

/// A reduce function takes in a key, an iterator over values for that key,
/// and an auxiliary argument. It returns an [`anyhow::Result`]
/// containing a single output value.
///
/// The output must be a valid input value for the same function, so that it
/// can also run as a map-side combiner.
pub type ReduceFn = fn(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    aux: Bytes,
) -> anyhow::Result<Bytes>;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
///
/// Used both for scanned records (row key, payload) and for intermediate
/// pairs (group key, encoded count).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,
    /// The value.
    pub value: Bytes,
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Get the key of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn key(&self) -> Bytes {
        self.key.clone()
    }

    /// Get the value of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn value(&self) -> Bytes {
        self.value.clone()
    }

    /// Consumes the key-value pair and returns the key.
    #[inline]
    pub fn into_key(self) -> Bytes {
        self.key
    }

    /// Consumes the key-value pair and returns the value.
    #[inline]
    pub fn into_value(self) -> Bytes {
        self.value
    }
}

/// Hashes an intermediate key. Compute a reduce bucket for a given key
/// by calculating `ihash(key) % n_reduce`.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    // Masked to 31 bits, so the conversion cannot fail.
    (hasher.finish() & 0x7fffffff) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ihash_is_stable_and_non_negative() {
        let a = ihash(b"Shirts");
        assert_eq!(a, ihash(b"Shirts"));
        assert!(a <= 0x7fffffff);
        assert_ne!(ihash(b"Men"), ihash(b"Women"));
    }
}
