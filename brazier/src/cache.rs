// Copyright 2026 brazier Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicIsize, AtomicU64, Ordering},
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use brazier_common::strict_assert_eq;

use crate::{
    error::{Error, Result},
    metrics::Metrics,
    record::{FileKey, Id, Key},
    shard::Shard,
    value::{Handle, ValueBuf},
};

/// Shards smaller than this cannot hold a single frequently scanned file, at
/// which point fewer, larger shards cache better than many that thrash.
const MIN_SHARD_SIZE: usize = 4 << 20;

/// Configuration for a [`Cache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total capacity in bytes, split evenly across the shards.
    pub capacity: usize,
    /// Shard count override. `None` picks 4 shards per logical cpu, falling
    /// back to 4 shards when the even split would make shards too small.
    pub shards: Option<usize>,
}

/// Builder for a [`Cache`].
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    config: CacheConfig,
}

impl CacheBuilder {
    /// Start building a cache with `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            config: CacheConfig {
                capacity,
                shards: None,
            },
        }
    }

    /// Build from a deserialized [`CacheConfig`].
    pub fn with_config(config: CacheConfig) -> Self {
        Self { config }
    }

    /// Override the shard count.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.config.shards = Some(shards);
        self
    }

    /// Build the cache.
    pub fn build(self) -> Result<Cache> {
        let shards = match self.config.shards {
            Some(0) => {
                return Err(Error::Config(
                    "shard count must be greater than zero".to_string(),
                ))
            }
            Some(shards) => shards,
            None => default_shard_count(self.config.capacity),
        };
        Ok(Cache::with_shards(self.config.capacity, shards))
    }
}

/// The probability that two threads contend for the same shard grows
/// superlinearly with the thread count, so shards are overprovisioned at 4
/// per logical cpu unless that would leave them under [`MIN_SHARD_SIZE`].
fn default_shard_count(capacity: usize) -> usize {
    let shards = 4 * std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
    if shards > 4 && capacity / shards < MIN_SHARD_SIZE {
        return 4;
    }
    shards
}

/// A sharded CLOCK-Pro block cache.
///
/// Blocks are keyed by an ([`Id`], file number, offset) triple and routed to
/// one of the independently locked shards, each running the replacement
/// algorithm on its own ring. The cache carries its own reference count so it
/// can be shared between several storage engine instances: every owner calls
/// [`Cache::retain`] once and [`Cache::release`] exactly once, and the last
/// release tears down every shard eagerly, because the cached buffers are
/// reference counted manually and invisible to any automatic reclaimer.
pub struct Cache {
    refs: AtomicIsize,
    max_size: usize,
    id_alloc: AtomicU64,
    shards: Box<[Shard]>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("max_size", &self.max_size)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl Cache {
    /// Create a cache of `max_size` bytes with the default shard count.
    ///
    /// Memory is allocated on demand, not up front. The cache starts with a
    /// reference count of 1, owned by the caller; see [`Cache::release`].
    pub fn new(max_size: usize) -> Self {
        Self::with_shards(max_size, default_shard_count(max_size))
    }

    fn with_shards(max_size: usize, shards: usize) -> Self {
        tracing::debug!("[cache]: create cache with {shards} shards, {max_size} bytes");
        let shards = (0..shards)
            .map(|_| Shard::new(max_size / shards))
            .collect_vec()
            .into_boxed_slice();
        Self {
            refs: AtomicIsize::new(1),
            max_size,
            id_alloc: AtomicU64::new(1),
            shards,
        }
    }

    /// Add an owner to the cache.
    pub fn retain(&self) {
        let refs = self.refs.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(refs > 1, "inconsistent cache reference count: {refs}");
        tracing::trace!("[cache]: retain refs: {refs}");
    }

    /// Drop an owner of the cache.
    ///
    /// The last release evicts every shard's resident entries; buffers kept
    /// alive by outstanding [`Handle`]s are freed when those are released.
    /// The structure itself stays usable (and empty) afterwards.
    ///
    /// # Panics
    ///
    /// Panics when called more often than the cache was retained.
    pub fn release(&self) {
        let refs = self.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        assert!(refs >= 0, "inconsistent cache reference count: {refs}");
        tracing::trace!("[cache]: release refs: {refs}");
        if refs == 0 {
            for shard in self.shards.iter() {
                shard.clear();
            }
        }
    }

    /// Look up the value cached for the key triple.
    ///
    /// A miss returns an invalid [`Handle`] and is not an error.
    pub fn get(&self, id: Id, file: u64, offset: u64) -> Handle {
        let key = Key { id, file, offset };
        self.shard(&key).get(key)
    }

    /// Cache `value` under the key triple, replacing any existing value.
    ///
    /// The value must come fresh from [`crate::Value::alloc`]; the returned
    /// handle owns its initial reference. A value larger than a shard's
    /// target size is declined: the handle is still valid and usable, the
    /// value is simply not cached.
    pub fn set(&self, id: Id, file: u64, offset: u64, value: ValueBuf) -> Handle {
        let key = Key { id, file, offset };
        self.shard(&key).set(key, value)
    }

    /// Drop the cached value for the key triple, if any. A no-op for absent
    /// keys.
    pub fn delete(&self, id: Id, file: u64, offset: u64) {
        let key = Key { id, file, offset };
        self.shard(&key).delete(key);
    }

    /// Evict every cached block of the given file, in every shard.
    pub fn evict_file(&self, id: Id, file: u64) {
        let fkey = FileKey { id, file };
        for shard in self.shards.iter() {
            shard.evict_file(fkey);
        }
    }

    /// Reserve `n` bytes, shrinking the effective capacity without consuming
    /// any memory. Useful to account for memory held elsewhere in the
    /// process. The reservation is restored when the returned guard is
    /// released or dropped.
    #[must_use = "dropping the reservation releases it immediately"]
    pub fn reserve(&self, n: usize) -> Reservation<'_> {
        // Round the per-shard reservation up; reservations are usually large
        // enough that the rounding is noise.
        let per_shard = n.div_ceil(self.shards.len());
        for shard in self.shards.iter() {
            shard.reserve(per_shard as isize);
        }
        Reservation {
            cache: self,
            per_shard: per_shard as isize,
        }
    }

    /// The configured capacity of the cache.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Bytes currently resident in the cache.
    pub fn size(&self) -> usize {
        self.shards.iter().map(|shard| shard.size()).sum()
    }

    /// Aggregate metrics across all shards.
    pub fn metrics(&self) -> Metrics {
        let mut metrics = Metrics::default();
        for shard in self.shards.iter() {
            let (size, count) = shard.snapshot();
            metrics.size += size;
            metrics.count += count;
            metrics.hits += shard.hits();
            metrics.misses += shard.misses();
        }
        metrics
    }

    /// Allocate a namespace id that is unique in the context of this cache.
    pub fn new_id(&self) -> Id {
        Id::new(self.id_alloc.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn shard(&self, key: &Key) -> &Shard {
        let hash = fnv1a(key.id.get(), key.file, key.offset);
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        // Backstop for the manual lifecycle: every owner must have released.
        // Skipped while unwinding so a failing caller does not double panic.
        if !std::thread::panicking() {
            strict_assert_eq!(
                self.refs.load(Ordering::SeqCst),
                0,
                "cache dropped with outstanding references"
            );
        }
    }
}

/// Inlined 64 bit FNV-1a over the little endian bytes of the key triple.
///
/// Shard routing must be deterministic across runs and processes, which rules
/// out the seeded hashers used inside the shard maps.
fn fnv1a(id: u64, file: u64, offset: u64) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let mut hash = OFFSET_BASIS;
    for word in [id, file, offset] {
        for byte in word.to_le_bytes() {
            hash = hash.wrapping_mul(PRIME);
            hash ^= byte as u64;
        }
    }
    hash
}

/// A held capacity reservation returned by [`Cache::reserve`].
///
/// Restores the reserved capacity when released or dropped; the move
/// semantics make releasing twice unrepresentable.
pub struct Reservation<'a> {
    cache: &'a Cache,
    per_shard: isize,
}

impl Reservation<'_> {
    /// Restore the reserved capacity. Dropping the guard does the same; this
    /// spelling exists for call sites that want the release to be visible.
    pub fn release(self) {}
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        for shard in self.cache.shards.iter() {
            shard.reserve(-self.per_shard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    const KIB: usize = 1 << 10;

    fn set(cache: &Cache, id: Id, file: u64, offset: u64, size: usize) {
        let mut buf = Value::alloc(size);
        buf.fill(offset as u8);
        cache.set(id, file, offset, buf).release();
    }

    #[test]
    fn test_builder() {
        let cache = CacheBuilder::new(1 << 20).with_shards(2).build().unwrap();
        assert_eq!(cache.max_size(), 1 << 20);
        assert_eq!(cache.shards.len(), 2);
        cache.release();

        assert!(matches!(
            CacheBuilder::new(1 << 20).with_shards(0).build(),
            Err(Error::Config(_))
        ));

        let config = CacheConfig {
            capacity: 1 << 20,
            shards: Some(8),
        };
        let cache = CacheBuilder::with_config(config).build().unwrap();
        assert_eq!(cache.shards.len(), 8);
        cache.release();
    }

    #[test]
    fn test_default_shard_count_floors_small_caches() {
        // A small cache must not be split into slivers.
        assert_eq!(default_shard_count(8 << 20), 4);
        let shards = default_shard_count(64 << 30);
        assert!(shards >= 4);
        assert!(shards % 4 == 0);
    }

    #[test]
    fn test_round_trip_across_shards() {
        let cache = CacheBuilder::new(64 << 20).with_shards(8).build().unwrap();
        let id = cache.new_id();

        for offset in 0..100 {
            set(&cache, id, 1, offset, 4 * KIB);
        }
        for offset in 0..100 {
            let handle = cache.get(id, 1, offset);
            assert!(handle.valid());
            assert!(handle.raw_buffer().iter().all(|b| *b == offset as u8));
            handle.release();
        }

        let metrics = cache.metrics();
        assert_eq!(metrics.count, 100);
        assert_eq!(metrics.size, 400 * KIB);
        assert_eq!(metrics.hits, 100);
        assert_eq!(metrics.misses, 0);

        cache.release();
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let cache = CacheBuilder::new(64 << 20).with_shards(4).build().unwrap();
        let a = cache.new_id();
        let b = cache.new_id();
        assert_ne!(a, b);

        set(&cache, a, 1, 0, KIB);
        assert!(!cache.get(b, 1, 0).valid());

        cache.delete(b, 1, 0);
        assert!(cache.get(a, 1, 0).valid_then_release());

        cache.evict_file(b, 1);
        assert!(cache.get(a, 1, 0).valid_then_release());

        cache.release();
    }

    #[test]
    fn test_evict_file_spans_shards() {
        let cache = CacheBuilder::new(64 << 20).with_shards(8).build().unwrap();
        let id = cache.new_id();

        for offset in 0..64 {
            set(&cache, id, 1, offset, 4 * KIB);
            set(&cache, id, 2, offset, 4 * KIB);
        }
        cache.evict_file(id, 1);

        for offset in 0..64 {
            assert!(!cache.get(id, 1, offset).valid());
            assert!(cache.get(id, 2, offset).valid_then_release());
        }
        assert_eq!(cache.metrics().count, 64);

        cache.release();
    }

    #[test]
    fn test_reserve_restores_capacity() {
        let cache = CacheBuilder::new(1 << 20).with_shards(4).build().unwrap();
        let id = cache.new_id();

        for offset in 0..128 {
            set(&cache, id, 1, offset, 4 * KIB);
        }
        assert_eq!(cache.size(), 512 * KIB);

        let reservation = cache.reserve(768 * KIB);
        // The resident set never exceeds the capacity minus active
        // reservations.
        assert!(cache.size() <= cache.max_size() - 768 * KIB);

        reservation.release();
        for offset in 0..128 {
            set(&cache, id, 2, offset, 4 * KIB);
        }
        assert!(cache.size() > 256 * KIB);
        assert!(cache.size() <= cache.max_size());

        cache.release();
    }

    #[test]
    fn test_release_tears_down() {
        let cache = CacheBuilder::new(64 << 20).with_shards(4).build().unwrap();
        let id = cache.new_id();
        set(&cache, id, 1, 0, KIB);

        cache.retain();
        cache.release();
        // One owner left, nothing torn down yet.
        assert!(cache.get(id, 1, 0).valid_then_release());

        cache.release();
        assert_eq!(cache.size(), 0);
        assert!(!cache.get(id, 1, 0).valid());
    }

    #[test]
    #[should_panic = "zero namespace id is invalid"]
    fn test_zero_id_panics() {
        let _ = Id::new(0);
    }

    #[test]
    fn test_shard_routing_is_deterministic() {
        let hash = fnv1a(1, 2, 3);
        assert_eq!(hash, fnv1a(1, 2, 3));
        assert_ne!(hash, fnv1a(1, 2, 4));
        assert_ne!(hash, fnv1a(1, 3, 2));
        assert_ne!(hash, fnv1a(2, 1, 3));
    }
}
