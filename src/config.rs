//! Job configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration apart from the input location. Command line flags are
//! applied on top of whatever the file provides (see [`crate::cmd::job`]).

use crate::error::UsageError;
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_FILTER: &str = "Clothing, Shoes & Jewelry";
pub const DEFAULT_COUNTER_GROUP: &str = "CategoryCount";
pub const DEFAULT_WORKLOAD: &str = "subcategory-count";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    /// Top-level category a document must start with to be counted.
    pub filter: String,
    /// Namespace the job counters are reported under.
    pub counter_group: String,
    /// Registered workload name, see [`crate::workload::named`].
    pub workload: String,
    pub source: SourceConfig,
    pub scan: ScanConfig,
    pub execution: ExecutionConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            counter_group: DEFAULT_COUNTER_GROUP.to_string(),
            workload: DEFAULT_WORKLOAD.to_string(),
            source: SourceConfig::default(),
            scan: ScanConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// One JSON document per line, keyed by file name and byte offset.
    Jsonl,
    /// `<row key>\t<payload>` per line.
    Tsv,
    /// Parquet files with a row key column and a payload column.
    Table,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub format: SourceFormat,
    /// Glob spec for the input files.
    pub input: Option<String>,
    /// Target size of a byte-range partition for line based inputs.
    pub split_bytes: u64,
    pub row_key_column: String,
    pub payload_column: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            format: SourceFormat::Jsonl,
            input: None,
            split_bytes: 64 * 1024 * 1024,
            row_key_column: "row_key".to_string(),
            payload_column: "product_data".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// Records fetched per read batch.
    pub caching: usize,
    /// Keep decoded blocks around for later scans. Leave off for one full pass.
    pub cache_blocks: bool,
    /// Drop records at the source when the raw payload does not contain the filter value.
    pub prefilter: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            caching: 500,
            cache_blocks: false,
            prefilter: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Number of reduce buckets.
    pub reducers: u32,
    /// Maximum number of tasks running at once.
    pub parallelism: usize,
    /// Attempts per task before the job fails.
    pub max_attempts: u32,
    /// Pre-sum counts inside each map task before the shuffle.
    pub combine: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            reducers: 11,
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_attempts: 4,
            combine: true,
        }
    }
}

impl JobConfig {
    /// Load a configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, UsageError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| UsageError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| UsageError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reject configurations that cannot run, before any task is started.
    ///
    /// A missing input is not checked here: jobs may be handed a source
    /// directly. [`crate::source::open`] rejects it instead.
    pub fn validate(&self) -> Result<(), UsageError> {
        let invalid = |msg: &str| Err(UsageError::InvalidConfig(msg.to_string()));
        if self.filter.trim().is_empty() {
            return invalid("`filter` must not be blank");
        }
        if self.counter_group.trim().is_empty() {
            return invalid("`counter_group` must not be blank");
        }
        if matches!(self.source.input.as_deref(), Some(input) if input.trim().is_empty()) {
            return invalid("`source.input` must not be blank");
        }
        if self.source.split_bytes == 0 {
            return invalid("`source.split_bytes` must be at least 1");
        }
        if self.scan.caching == 0 {
            return invalid("`scan.caching` must be at least 1");
        }
        if self.execution.reducers == 0 {
            return invalid("`execution.reducers` must be at least 1");
        }
        if self.execution.parallelism == 0 {
            return invalid("`execution.parallelism` must be at least 1");
        }
        if self.execution.max_attempts == 0 {
            return invalid("`execution.max_attempts` must be at least 1");
        }
        if crate::workload::try_named(&self.workload).is_none() {
            return Err(UsageError::UnknownWorkload(self.workload.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config: JobConfig = toml::from_str("").unwrap();
        assert_eq!(config, JobConfig::default());
        assert_eq!(config.filter, "Clothing, Shoes & Jewelry");
        assert_eq!(config.scan.caching, 500);
        assert!(!config.scan.cache_blocks);
        assert_eq!(config.execution.reducers, 11);
    }

    #[test]
    fn nested_tables_override_defaults() {
        let config: JobConfig = toml::from_str(
            r#"
            filter = "Books"
            counter_group = "Q2"

            [source]
            format = "table"
            input = "data/*.parquet"
            payload_column = "doc"

            [scan]
            caching = 64
            cache_blocks = true

            [execution]
            reducers = 3
            combine = false
            "#,
        )
        .unwrap();
        assert_eq!(config.filter, "Books");
        assert_eq!(config.counter_group, "Q2");
        assert_eq!(config.source.format, SourceFormat::Table);
        assert_eq!(config.source.payload_column, "doc");
        assert_eq!(config.source.row_key_column, "row_key");
        assert_eq!(config.scan.caching, 64);
        assert!(config.scan.cache_blocks);
        assert_eq!(config.execution.reducers, 3);
        assert_eq!(config.execution.max_attempts, 4);
        assert!(!config.execution.combine);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<JobConfig>("filtr = \"Books\"").is_err());
    }

    #[test]
    fn validation_catches_unusable_values() {
        let mut config = JobConfig::default();
        config.validate().unwrap();

        config.source.input = Some(" ".into());
        assert!(config.validate().is_err());
        config.source.input = Some("in/*.jsonl".into());
        config.validate().unwrap();

        config.filter = "   ".into();
        assert!(config.validate().is_err());
        config.filter = DEFAULT_FILTER.into();

        config.execution.reducers = 0;
        assert!(config.validate().is_err());
        config.execution.reducers = 2;

        config.workload = "nope".into();
        assert!(matches!(
            config.validate(),
            Err(UsageError::UnknownWorkload(name)) if name == "nope"
        ));
    }

    #[test]
    fn missing_file_is_a_usage_error() {
        let err = JobConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, UsageError::ConfigFile { .. }));
    }
}
