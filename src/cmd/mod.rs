//! Command line arguments.
pub mod job;
