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

//! A sharded in-memory block cache for storage engines, implementing the
//! CLOCK-Pro replacement algorithm.
//!
//! CLOCK-Pro is a patent-free alternative to the Adaptive Replacement Cache.
//! It approximates LIRS the way the classic CLOCK algorithm approximates
//! LRU: three "hands" rotate over a single circular ring of entries and
//! classify each as *hot* (frequently re-referenced, evicted last), *cold*
//! (resident without established reuse) or *test* (a ghost record of a
//! recently evicted cold page). A re-insert that hits a ghost is a regretted
//! eviction, and widens the adaptive boundary (`cold_target`) between the
//! hot working set estimate and the cold admission buffer; a ghost that ages
//! out narrows it again.
//!
//! Blocks are keyed by an ([`Id`], file number, offset) triple, where the id
//! namespaces file numbers so one cache can be shared by several storage
//! engine instances. Keys are routed to `4 × cpus` independently locked
//! shards, and each shard additionally rings its records per file so that
//! dropping a file from disk evicts all of its blocks in O(k).
//!
//! The cache never performs I/O and never decides what to load; it only
//! decides what stays resident once given a value.
//!
//! # Memory management
//!
//! Cached buffers are reference counted manually: [`Value::alloc`] hands out
//! a unique [`ValueBuf`] with a count of 1, inserting it transfers that
//! reference into the returned [`Handle`], and the cache slot plus every
//! handle each own one count. The buffer is returned to the allocator
//! exactly when the count reaches 0, which is why the cache also carries its
//! own explicit [`Cache::retain`] / [`Cache::release`] lifecycle: the last
//! release tears the shards down eagerly instead of waiting for a collector
//! that cannot see the buffers. Handles release on drop, so a forgotten
//! `release` is a deferred release, never a leak.
//!
//! ```
//! use brazier::{Cache, Value};
//!
//! let cache = Cache::new(64 << 20);
//! let id = cache.new_id();
//!
//! let mut buf = Value::alloc(4096);
//! buf.copy_from_slice(&[7; 4096]);
//! cache.set(id, 1, 0, buf).release();
//!
//! let handle = cache.get(id, 1, 0);
//! assert!(handle.valid());
//! assert_eq!(handle.raw_buffer()[0], 7);
//! handle.release();
//!
//! cache.release();
//! ```

mod cache;
mod error;
mod metrics;
mod record;
mod shard;
mod value;

pub use cache::{Cache, CacheBuilder, CacheConfig, Reservation};
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use record::Id;
pub use value::{Handle, Value, ValueBuf};
