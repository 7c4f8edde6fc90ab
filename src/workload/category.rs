//! Subcategory frequency count.
//!
//! Each payload is a JSON document with a `category` array holding a
//! taxonomy path, top-level category first. Documents whose top-level
//! category matches the filter (the auxiliary argument) emit one pair per
//! remaining path entry; the reducer sums the counts.

use crate::codec::{decode_count, encode_count};
use crate::error::ExtractionError;
use crate::*;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde_json::Value;

const CATEGORY: &str = "category";

/// Extract the group keys of one payload.
///
/// Returns an empty list when the document belongs to another top-level
/// category. Only the top-level entry is trimmed for the comparison; the
/// emitted subcategories keep their original text. Subcategories that are
/// blank after trimming are skipped.
pub fn extract(payload: &[u8], filter: &str) -> Result<Vec<String>, ExtractionError> {
    let document: Value = serde_json::from_slice(payload)
        .map_err(|e| ExtractionError::MalformedPayload(e.to_string()))?;
    let Value::Object(mut document) = document else {
        return Err(ExtractionError::MalformedPayload(
            "payload is not a JSON object".to_string(),
        ));
    };

    let path = match document.remove(CATEGORY) {
        Some(Value::Array(path)) => path,
        Some(other) => {
            return Err(ExtractionError::MissingField {
                field: CATEGORY,
                reason: format!("expected an array, found {}", type_name(&other)),
            })
        }
        None => {
            return Err(ExtractionError::MissingField {
                field: CATEGORY,
                reason: "field is absent".to_string(),
            })
        }
    };

    // Every entry must be readable, whatever the top-level category.
    let mut path = path
        .into_iter()
        .enumerate()
        .map(|(i, entry)| entry_text(i, entry))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .enumerate();
    let Some((_, top)) = path.next() else {
        return Err(ExtractionError::EmptyCategory);
    };
    if top.trim() != filter.trim() {
        return Ok(Vec::new());
    }

    let mut keys = Vec::with_capacity(path.len());
    for (i, key) in path {
        if key.trim().is_empty() {
            tracing::trace!(index = i, "skipping blank subcategory");
            continue;
        }
        keys.push(key);
    }
    Ok(keys)
}

/// Path entries are read leniently: numbers and booleans count as their
/// JSON text, anything else is the wrong type.
fn entry_text(index: usize, entry: Value) -> Result<String, ExtractionError> {
    match entry {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ExtractionError::MissingField {
            field: CATEGORY,
            reason: format!("entry {} is {}, not a string", index, type_name(&other)),
        }),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub fn map(kv: KeyValue, aux: Bytes) -> MapOutput {
    let filter = String::from_utf8_lossy(&aux);
    let keys = extract(&kv.value, &filter)?;

    let one = encode_count(1);
    let iter = keys.into_iter().map(move |key| KeyValue {
        key: Bytes::from(key),
        value: one.clone(),
    });
    Ok(Box::new(iter))
}

/// Sums encoded counts. Values need not be 1, so this also serves as the
/// map-side combiner.
pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
) -> Result<Bytes> {
    let mut total: u64 = 0;
    for value in values {
        total = total.checked_add(decode_count(value)?).ok_or_else(|| {
            anyhow!(
                "count overflow for key {:?}",
                String::from_utf8_lossy(&key)
            )
        })?;
    }
    Ok(encode_count(total))
}
