//! Key/value records exchanged with user programs, plus the partitioner.
//!
//! Keys are arbitrary JSON. Two keys are equal iff their canonical encodings
//! (object members sorted by name at every depth, no whitespace) are
//! byte-identical, so `{"a":1,"b":2}` equals `{"b":2,"a":1}` while `1` and
//! `1.0` stay distinct.

use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KVPair {
    pub key: Value,
    pub value: Value,
}

impl KVPair {
    pub fn new(key: impl Into<Value>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// `{"pairs": [...]}`: map program output and persisted partition format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KVPairArray {
    pub pairs: Vec<KVPair>,
}

/// Key wrapper that lets a reduce program echo back the group position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedKey {
    pub key: Value,
    /// Position of the group in the shuffled sequence.
    pub value: usize,
}

/// `{"key": {"key": k, "value": order}, "value": v}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedKVPair {
    pub key: OrderedKey,
    pub value: Value,
}

/// Canonical encoding of a JSON value.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            out.push('{');
            for (i, name) in names.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(&map[name], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Structural key usable in hash maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn new(key: &Value) -> Self {
        CanonicalKey(canonical_json(key))
    }

    pub fn hash64(&self) -> u64 {
        let mut h = FnvHasher::default();
        h.write(self.0.as_bytes());
        h.finish()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// FNV-1a over the canonical encoding; stable across processes and runs.
pub fn key_hash(key: &Value) -> u64 {
    CanonicalKey::new(key).hash64()
}

/// Reduce partition for `key`: `hash(key) mod n_reducers`.
pub fn partition_for(key: &Value, n_reducers: u32) -> u32 {
    debug_assert!(n_reducers > 0);
    (key_hash(key) % n_reducers as u64) as u32
}
