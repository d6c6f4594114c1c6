//! Binary key/value metadata attached to exported nodes.
//!
//! Layout (native endian): `int32 n_pairs`, then for each pair
//! `int32 key_len, key bytes, int32 value_len, value bytes`.

use std::collections::HashMap;
use std::ffi::c_char;

use crate::error::{BridgeError, Result};

/// Encode `metadata`, or `None` when there is nothing to encode.
pub fn encode(metadata: &HashMap<String, String>) -> Option<Vec<u8>> {
    if metadata.is_empty() {
        return None;
    }
    let mut pairs: Vec<_> = metadata.iter().collect();
    pairs.sort();

    let size = 4 + pairs.iter().map(|(k, v)| 8 + k.len() + v.len()).sum::<usize>();
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(pairs.len() as i32).to_ne_bytes());
    for (key, value) in pairs {
        out.extend_from_slice(&(key.len() as i32).to_ne_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as i32).to_ne_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    Some(out)
}

/// Decode the metadata block at `ptr`. A null pointer is empty metadata.
///
/// # Safety
///
/// `ptr` must be null or point at a block laid out as described in the
/// module docs.
pub unsafe fn decode(ptr: *const c_char) -> Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    if ptr.is_null() {
        return Ok(metadata);
    }
    let mut cursor = ptr as *const u8;
    let n_pairs = read_len(&mut cursor, "pair count")?;
    for _ in 0..n_pairs {
        let key = read_string(&mut cursor, "key")?;
        let value = read_string(&mut cursor, "value")?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

unsafe fn read_len(cursor: &mut *const u8, what: &str) -> Result<usize> {
    let len = std::ptr::read_unaligned(*cursor as *const i32);
    *cursor = cursor.add(4);
    usize::try_from(len)
        .map_err(|_| BridgeError::invalid(format!("negative metadata {what}: {len}")))
}

unsafe fn read_string(cursor: &mut *const u8, what: &str) -> Result<String> {
    let len = read_len(cursor, what)?;
    let bytes = std::slice::from_raw_parts(*cursor, len);
    *cursor = cursor.add(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| BridgeError::invalid(format!("metadata {what} is not valid UTF-8")))
}
