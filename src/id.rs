//! Instance-ID generator (component A).
//!
//! IDs combine a monotonic nanosecond timestamp with a fixed-width atomic
//! counter, both encoded in a base-62 alphabet that is itself in strict
//! ASCII order (`0-9A-Za-z`), so that byte-lexicographic comparison of two
//! IDs agrees with their creation order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const TIMESTAMP_WIDTH: usize = 11;
const COUNTER_WIDTH: usize = 6;
const COUNTER_MODULUS: u64 = 62u64.pow(COUNTER_WIDTH as u32);

static PROCESS_START: OnceLock<Instant> = OnceLock::new();
static COUNTER: AtomicU64 = AtomicU64::new(0);

fn encode_base62(mut value: u64, width: usize) -> String {
    let mut buf = vec![0u8; width];
    for slot in buf.iter_mut().rev() {
        *slot = ALPHABET[(value % 62) as usize];
        value /= 62;
    }
    // SAFETY: every byte comes from ALPHABET, which is ASCII.
    String::from_utf8(buf).expect("base62 alphabet is ASCII")
}

/// A unique, sortable identifier for one live task execution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a new ID. Safe to call from any number of threads
    /// concurrently; two calls from the same call site are guaranteed to
    /// produce strictly increasing IDs in byte order.
    pub fn new() -> Self {
        let start = *PROCESS_START.get_or_init(Instant::now);
        let nanos = start.elapsed().as_nanos() as u64;
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed) % COUNTER_MODULUS;

        let mut id = encode_base62(nanos, TIMESTAMP_WIDTH);
        id.push_str(&encode_base62(counter, COUNTER_WIDTH));
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn ids_are_strictly_increasing_and_ascii_sortable() {
        let mut ids = Vec::new();
        for _ in 0..1000 {
            ids.push(InstanceId::new());
        }
        for pair in ids.windows(2) {
            assert!(pair[0].as_str() < pair[1].as_str(), "{:?}", pair);
        }
    }

    #[test]
    fn ids_use_only_the_declared_alphabet() {
        let id = InstanceId::new();
        assert!(id
            .as_str()
            .bytes()
            .all(|b| b.is_ascii_alphanumeric()));
        assert_eq!(id.as_str().len(), TIMESTAMP_WIDTH + COUNTER_WIDTH);
    }

    #[test]
    fn ids_are_unique_under_concurrent_generation() {
        let handles: Vec<_> = (0..16)
            .map(|_| {
                thread::spawn(|| {
                    (0..500).map(|_| InstanceId::new()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id.as_str().to_string()), "duplicate id generated");
            }
        }
        assert_eq!(all.len(), 16 * 500);
    }
}
