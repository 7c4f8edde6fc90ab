//! Byte encodings for intermediate counts and for sink output lines.
//!

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Width of an encoded count.
pub const COUNT_WIDTH: usize = 8;

/// Encode a count as a big-endian `u64`.
pub fn encode_count(count: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(COUNT_WIDTH);
    buf.put_u64(count);
    buf.freeze()
}

/// Decode a count produced by [`encode_count`].
///
/// Returns an error if the value is not exactly [`COUNT_WIDTH`] bytes long.
pub fn decode_count(mut value: Bytes) -> Result<u64> {
    if value.len() != COUNT_WIDTH {
        bail!(
            "encoded count must be {} bytes, got {}",
            COUNT_WIDTH,
            value.len()
        );
    }
    Ok(value.get_u64())
}

/// Render one output row as `<key>\t<total>\n`.
///
/// Backslash, tab, newline and carriage return in the key are escaped as
/// `\\`, `\t`, `\n` and `\r`, so every row is exactly one line of two fields.
pub fn encode_line(key: &str, total: u64) -> Bytes {
    let mut writer = BytesMut::with_capacity(key.len() + 22);
    for c in key.chars() {
        match c {
            '\\' => writer.put_slice(b"\\\\"),
            '\t' => writer.put_slice(b"\\t"),
            '\n' => writer.put_slice(b"\\n"),
            '\r' => writer.put_slice(b"\\r"),
            c => writer.put_slice(c.encode_utf8(&mut [0; 4]).as_bytes()),
        }
    }
    writer.put(format!("\t{}\n", total).as_bytes());
    writer.freeze()
}

/// Parse one output row written by [`encode_line`].
///
/// Returns `None` for anything that is not a `<key>\t<total>` row or holds
/// an unknown escape.
pub fn decode_line(line: &str) -> Option<(String, u64)> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let (key, total) = line.split_once('\t')?;
    Some((unescape_key(key)?, total.parse().ok()?))
}

fn unescape_key(escaped: &str) -> Option<String> {
    let mut key = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            key.push(c);
            continue;
        }
        key.push(match chars.next()? {
            '\\' => '\\',
            't' => '\t',
            'n' => '\n',
            'r' => '\r',
            _ => return None,
        });
    }
    Some(key)
}
