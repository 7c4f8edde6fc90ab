use crate::config::{JobConfig, SourceFormat};
use crate::error::UsageError;
use clap::Parser;
use std::path::PathBuf;

/// Count the subcategories of every product under one top-level category.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Output directory; must not exist yet
    pub output: String,

    /// TOML file with job settings. Flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Glob spec for the input files
    #[arg(short, long)]
    pub input: Option<String>,

    /// Input file format
    #[arg(short, long, value_enum)]
    pub format: Option<SourceFormat>,

    /// Top-level category to count subcategories of
    #[arg(long)]
    pub filter: Option<String>,

    /// Group name the counters are reported under
    #[arg(long)]
    pub counter_group: Option<String>,

    /// Number of reduce tasks
    #[arg(short, long)]
    pub reducers: Option<u32>,

    /// Maximum number of tasks running at once
    #[arg(short, long)]
    pub parallelism: Option<usize>,

    /// Records fetched per read batch
    #[arg(long)]
    pub caching: Option<usize>,

    /// Keep decoded blocks cached between scans
    #[arg(long)]
    pub cache_blocks: bool,

    /// Drop records at the source unless the payload contains the filter text
    #[arg(long)]
    pub prefilter: bool,

    /// Do not pre-sum counts inside map tasks
    #[arg(long)]
    pub no_combine: bool,

    /// Attempts per task before the job fails
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Build the job configuration: the config file if given, defaults
    /// otherwise, with every flag that was set applied on top.
    pub fn into_config(self) -> Result<(JobConfig, String), UsageError> {
        let mut config = match &self.config {
            Some(path) => JobConfig::from_file(path)?,
            None => JobConfig::default(),
        };

        if let Some(input) = self.input {
            config.source.input = Some(input);
        }
        if let Some(format) = self.format {
            config.source.format = format;
        }
        if let Some(filter) = self.filter {
            config.filter = filter;
        }
        if let Some(group) = self.counter_group {
            config.counter_group = group;
        }
        if let Some(reducers) = self.reducers {
            config.execution.reducers = reducers;
        }
        if let Some(parallelism) = self.parallelism {
            config.execution.parallelism = parallelism;
        }
        if let Some(caching) = self.caching {
            config.scan.caching = caching;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.execution.max_attempts = max_attempts;
        }
        config.scan.cache_blocks |= self.cache_blocks;
        config.scan.prefilter |= self.prefilter;
        if self.no_combine {
            config.execution.combine = false;
        }

        Ok((config, self.output))
    }
}
