//! Small helpers for moving between [`Bytes`] and strings.
//!

use anyhow::Result;
use bytes::Bytes;
use std::borrow::Cow;

/// Read an entire [`Bytes`] slice into a [`String`].
///
/// Returns an error if the slice contains invalid UTF-8.
pub fn string_from_bytes(buf: Bytes) -> Result<String> {
    Ok(String::from_utf8(buf.as_ref().into())?)
}

/// Render a row key for logs. Non UTF-8 bytes are replaced.
#[inline]
pub fn display_key(key: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(key)
}
