//! Shard-key extraction and consistent hashing for the sharded strategy
//!
//! Keys are digested with 64-bit FNV-1a (stable across processes and
//! toolchains) and mapped to a bucket with Jump Consistent Hash
//! (Lamping & Veach, 2014). Buckets index the eligible providers sorted by
//! provider id, so routing depends only on the set of ids present.

use std::fmt;
use std::sync::Arc;

use plexus_plugin_api::Metadata;

/// Metadata field the default key function reads
pub const DEFAULT_SHARD_FIELD: &str = "event";

/// Shard key used when the field is absent or has no `.` separator
pub const DEFAULT_SHARD_KEY: &str = "default";

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Extracts a shard key from call metadata
#[derive(Clone)]
pub struct ShardKeyFn(Arc<dyn Fn(&Metadata) -> String + Send + Sync>);

impl ShardKeyFn {
    /// Wrap an arbitrary key function
    pub fn new(f: impl Fn(&Metadata) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// The prefix before the first `.` of the string in `field`
    pub fn prefix_of(field: impl Into<String>) -> Self {
        let field = field.into();
        Self::new(move |metadata| prefix_key(metadata, &field))
    }

    pub fn key(&self, metadata: &Metadata) -> String {
        (self.0)(metadata)
    }
}

impl Default for ShardKeyFn {
    fn default() -> Self {
        Self::prefix_of(DEFAULT_SHARD_FIELD)
    }
}

impl fmt::Debug for ShardKeyFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShardKeyFn(..)")
    }
}

/// `"player.level.complete"` -> `"player"`; no dot, absent, or non-string -> `"default"`
pub fn prefix_key(metadata: &Metadata, field: &str) -> String {
    metadata
        .get(field)
        .and_then(|value| value.as_str())
        .and_then(|name| name.split_once('.'))
        .map(|(prefix, _)| prefix.to_string())
        .unwrap_or_else(|| DEFAULT_SHARD_KEY.to_string())
}

/// 64-bit FNV-1a digest
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Jump consistent hash: bucket in `[0, buckets)`, `None` when `buckets == 0`
pub fn jump_hash(mut key: u64, buckets: u32) -> Option<u32> {
    if buckets == 0 {
        return None;
    }
    let buckets = i64::from(buckets);
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1_i64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    u32::try_from(b).ok()
}

/// Bucket for a shard key among `buckets` providers
pub fn bucket_for(shard_key: &str, buckets: usize) -> Option<usize> {
    let buckets = u32::try_from(buckets).ok()?;
    jump_hash(fnv1a64(shard_key.as_bytes()), buckets).map(|b| b as usize)
}
