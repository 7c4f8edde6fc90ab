//! Local stand-in for the shuffle: routes every intermediate pair to the
//! reduce bucket chosen by its key hash.

use crate::KeyValue;
use dashmap::DashMap;
use std::collections::HashMap;

// types related to this engine
pub type BucketIndex = u32;
pub type Buckets = DashMap<BucketIndex, Vec<KeyValue>>;

/// Collects map outputs as map tasks finish, in any order.
#[derive(Debug, Default)]
pub struct Shuffle {
    buckets: Buckets,
}

impl Shuffle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the buckets of one successful map attempt.
    pub fn absorb(&self, map_output: HashMap<BucketIndex, Vec<KeyValue>>) {
        for (bucket_no, mut pairs) in map_output {
            #[allow(clippy::unwrap_or_default)]
            self.buckets
                .entry(bucket_no)
                .or_insert(Vec::new())
                .append(&mut pairs);
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Hand out the non-empty buckets, ordered by bucket index.
    pub fn into_buckets(self) -> Vec<(BucketIndex, Vec<KeyValue>)> {
        let mut buckets: Vec<_> = self
            .buckets
            .into_iter()
            .filter(|(_, pairs)| !pairs.is_empty())
            .collect();
        buckets.sort_unstable_by_key(|(bucket_no, _)| *bucket_no);
        buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_from_many_tasks_are_merged() {
        let shuffle = Shuffle::new();
        shuffle.absorb(HashMap::from([
            (1, vec![KeyValue::new("a", "1")]),
            (0, vec![KeyValue::new("b", "1")]),
        ]));
        shuffle.absorb(HashMap::from([
            (1, vec![KeyValue::new("a", "2")]),
            (2, Vec::new()),
        ]));
        assert_eq!(shuffle.len(), 3);

        let buckets = shuffle.into_buckets();
        let ids: Vec<BucketIndex> = buckets.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(buckets[1].1.len(), 2);
    }
}
