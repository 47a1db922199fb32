//! Order-preserving byte encodings for shard keys.
//!
//! Encoded keys compare byte-wise in the same order as [`KeyBound`] /
//! [`ShardKey`] compare logically, which lets sled range scans walk chunks and
//! documents in shard key order.

use crate::FieldValue;
use crate::KeyBound;
use crate::ShardKey;

const TAG_MIN: u8 = 0x00;
const TAG_KEY: u8 = 0x01;
const TAG_MAX: u8 = 0x02;

const TAG_INT: u8 = 0x10;
const TAG_STR: u8 = 0x20;

fn encode_value(
    value: &FieldValue,
    out: &mut Vec<u8>,
) {
    match value {
        FieldValue::Int(v) => {
            out.push(TAG_INT);
            // flipping the sign bit maps i64 order onto u64 order
            out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes());
        }
        FieldValue::Str(s) => {
            out.push(TAG_STR);
            out.extend_from_slice(s.as_bytes());
            out.push(0x00);
        }
    }
}

/// Prefix-free for keys of the same pattern.
pub fn encode_shard_key(key: &ShardKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.0.len() * 9);
    for v in &key.0 {
        encode_value(v, &mut out);
    }
    out
}

pub fn encode_bound(bound: &KeyBound) -> Vec<u8> {
    match bound {
        KeyBound::Min => vec![TAG_MIN],
        KeyBound::Key(k) => {
            let mut out = vec![TAG_KEY];
            out.extend(encode_shard_key(k));
            out
        }
        KeyBound::Max => vec![TAG_MAX],
    }
}

/// Storage key of a document: encoded shard key followed by the id, so
/// documents sharing a shard key stay adjacent.
pub fn document_storage_key(
    shard_key: &ShardKey,
    id: &str,
) -> Vec<u8> {
    let mut out = encode_shard_key(shard_key);
    out.extend_from_slice(id.as_bytes());
    out
}

/// Byte interval `[lo, hi)` covering every document key inside the range;
/// `hi` is `None` for an unbounded upper end.
pub fn storage_interval(
    min: &KeyBound,
    max: &KeyBound,
) -> (Vec<u8>, Option<Vec<u8>>) {
    let lo = match min {
        KeyBound::Min => Vec::new(),
        KeyBound::Key(k) => encode_shard_key(k),
        KeyBound::Max => vec![0xFF; 2],
    };
    let hi = match max {
        KeyBound::Min => Some(Vec::new()),
        KeyBound::Key(k) => Some(encode_shard_key(k)),
        KeyBound::Max => None,
    };
    (lo, hi)
}

/// Key of a catalog row scoped to a namespace.
pub fn namespaced_key(
    namespace: &str,
    suffix: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(namespace.len() + 1 + suffix.len());
    out.extend_from_slice(namespace.as_bytes());
    out.push(0x00);
    out.extend_from_slice(suffix);
    out
}
