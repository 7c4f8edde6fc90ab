//! Converts workload names to actual application code.
//!
//! # Example
//!
//! ```
//! # use anyhow::Result;
//! use catcount::workload;
//! # fn main() -> Result<()> {
//! let counter = workload::named("subcategory-count")?;
//! # Ok(())
//! # }
//! ```

use crate::Workload;
use anyhow::{bail, Result};

pub mod category;

/// Gets the [`Workload`] named `name`.
///
/// Returns [`None`] if no application with the given name was found.
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "subcategory-count" => Some(Workload {
            map_fn: category::map,
            reduce_fn: category::reduce,
        }),
        _ => None,
    }
}

/// Gets the [`Workload`] named `name`.
///
/// Returns an [`anyhow::Error`] if no application with the given name was found.
pub fn named(name: &str) -> Result<Workload> {
    match try_named(name) {
        Some(app) => Ok(app),
        None => bail!("No app named `{}` found.", name),
    }
}
