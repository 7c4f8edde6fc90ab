//! Job counters.
//!
//! Each task attempt fills its own [`TaskCounters`] without sharing
//! anything. The scheduler merges the counters of successful attempts into
//! the job-wide [`Counters`]; counters of failed attempts are dropped, so a
//! retried partition is never counted twice.

use crate::error::ExtractionError;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;

pub const ROWS_PROCESSED: &str = "Rows Processed";
pub const PAIRS_EMITTED: &str = "Pairs Emitted";
pub const MALFORMED_PAYLOADS: &str = "Malformed Payloads";
pub const MISSING_FIELDS: &str = "Missing Fields";
pub const EMPTY_CATEGORIES: &str = "Empty Categories";
pub const REDUCE_OUTPUT_RECORDS: &str = "Reduce Output Records";

/// Counters of a single task attempt.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskCounters {
    pub rows_processed: u64,
    pub pairs_emitted: u64,
    pub malformed_payloads: u64,
    pub missing_fields: u64,
    pub empty_categories: u64,
    pub reduce_output_records: u64,
}

impl TaskCounters {
    pub fn record_error(&mut self, err: &ExtractionError) {
        match err {
            ExtractionError::MalformedPayload(_) => self.malformed_payloads += 1,
            ExtractionError::MissingField { .. } => self.missing_fields += 1,
            ExtractionError::EmptyCategory => self.empty_categories += 1,
        }
    }

    pub fn extraction_errors(&self) -> u64 {
        self.malformed_payloads + self.missing_fields + self.empty_categories
    }

    fn entries(&self) -> [(&'static str, u64); 6] {
        [
            (ROWS_PROCESSED, self.rows_processed),
            (PAIRS_EMITTED, self.pairs_emitted),
            (MALFORMED_PAYLOADS, self.malformed_payloads),
            (MISSING_FIELDS, self.missing_fields),
            (EMPTY_CATEGORIES, self.empty_categories),
            (REDUCE_OUTPUT_RECORDS, self.reduce_output_records),
        ]
    }
}

/// Job-wide counters under one group name.
///
/// Safe to merge into from many tasks at once.
#[derive(Debug)]
pub struct Counters {
    group: String,
    values: DashMap<&'static str, u64>,
}

impl Counters {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            values: DashMap::new(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn merge(&self, task: &TaskCounters) {
        for (name, value) in task.entries() {
            *self.values.entry(name).or_insert(0) += value;
        }
    }

    /// Current value of a counter; counters never touched read as zero.
    pub fn get(&self, name: &str) -> u64 {
        self.values.get(name).map(|v| *v).unwrap_or(0)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            group: self.group.clone(),
            values: self
                .values
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
        }
    }
}

/// A frozen copy of the counters, readable after the job finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub group: String,
    pub values: BTreeMap<String, u64>,
}

impl CounterSnapshot {
    pub fn get(&self, name: &str) -> u64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    pub fn rows_processed(&self) -> u64 {
        self.get(ROWS_PROCESSED)
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.group)?;
        for (name, value) in &self.values {
            writeln!(f, "\t{}={}", name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_counted_by_kind() {
        let mut task = TaskCounters::default();
        task.record_error(&ExtractionError::MalformedPayload("eof".into()));
        task.record_error(&ExtractionError::EmptyCategory);
        task.record_error(&ExtractionError::EmptyCategory);
        assert_eq!(task.malformed_payloads, 1);
        assert_eq!(task.empty_categories, 2);
        assert_eq!(task.extraction_errors(), 3);
    }

    #[test]
    fn merge_adds_up_tasks() {
        let counters = Counters::new("Q2");
        let a = TaskCounters {
            rows_processed: 3,
            pairs_emitted: 4,
            ..Default::default()
        };
        let b = TaskCounters {
            rows_processed: 2,
            ..Default::default()
        };
        counters.merge(&a);
        counters.merge(&b);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.group, "Q2");
        assert_eq!(snapshot.rows_processed(), 5);
        assert_eq!(snapshot.get(PAIRS_EMITTED), 4);
        assert_eq!(snapshot.get("No Such Counter"), 0);
        assert!(snapshot.to_string().contains("\tRows Processed=5"));
    }
}
