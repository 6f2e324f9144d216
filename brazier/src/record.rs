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
    fmt::{self, Debug, Display},
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use bitflags::bitflags;

use brazier_common::strict_assert;

use crate::value::Value;

/// A namespace for file numbers.
///
/// An id lets a single [`crate::Cache`] be shared among multiple storage
/// engine instances without key collisions. [`crate::Cache::new_id`] allocates
/// an id that is unique in the context of that cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    /// Wrap a raw namespace id.
    ///
    /// # Panics
    ///
    /// Panics if `id` is zero. Zero is reserved as the "no namespace" marker
    /// and routing a key with it is a programming error.
    pub fn new(id: u64) -> Self {
        assert_ne!(id, 0, "zero namespace id is invalid");
        Self(id)
    }

    /// The raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of one cached block: (namespace, file number, offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Key {
    pub id: Id,
    pub file: u64,
    pub offset: u64,
}

impl Key {
    /// The key used by the per-shard file map, with the offset projected away.
    pub(crate) fn file_key(&self) -> FileKey {
        FileKey {
            id: self.id,
            file: self.file,
        }
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.id, self.file, self.offset)
    }
}

/// Key of one file's list of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FileKey {
    pub id: Id,
    pub file: u64,
}

/// Logical category of a record in the clock ring.
///
/// The category is a per-record tag, not a list membership: hot, cold and
/// test records all share one circular ring and the three hands classify them
/// as they sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageType {
    /// Resident and frequently re-referenced; evicted last.
    Hot,
    /// Resident without established reuse; the admission buffer.
    Cold,
    /// Ghost metadata for a recently evicted cold page; owns no value.
    Test,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flags: u64 {
        const REFERENCED = 0b00000001;
    }
}

/// Links of one intrusive circular ring.
///
/// A ring of exactly one node links to itself; that self reference is the
/// sentinel for "last node".
struct RingLink {
    prev: NonNull<Record>,
    next: NonNull<Record>,
}

impl RingLink {
    fn dangling() -> Self {
        Self {
            prev: NonNull::dangling(),
            next: NonNull::dangling(),
        }
    }
}

/// Metadata node for one cached block.
///
/// A record participates in two independent intrusive rings: the shard-wide
/// clock ring walked by the three hands, and the per-file ring used for bulk
/// eviction. Records are heap nodes addressed by `NonNull<Record>`; all ring
/// and value edits require the owning shard's exclusive lock, only the
/// REFERENCED flag may be set under the shared lock.
pub(crate) struct Record {
    pub key: Key,
    pub size: usize,
    pub ptype: PageType,
    flags: AtomicU64,
    value: Option<NonNull<Value>>,
    ring: RingLink,
    file: RingLink,
}

unsafe impl Send for Record {}
unsafe impl Sync for Record {}

impl Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("ptype", &self.ptype)
            .finish()
    }
}

impl Record {
    /// Allocate a record for `key`, self-linked in both rings.
    pub(crate) fn alloc(key: Key, size: usize) -> NonNull<Record> {
        let record = Box::new(Record {
            key,
            size,
            ptype: PageType::Cold,
            flags: AtomicU64::new(0),
            value: None,
            ring: RingLink::dangling(),
            file: RingLink::dangling(),
        });
        let mut ptr = unsafe { NonNull::new_unchecked(Box::into_raw(record)) };
        unsafe {
            let record = ptr.as_mut();
            record.ring = RingLink { prev: ptr, next: ptr };
            record.file = RingLink { prev: ptr, next: ptr };
        }
        ptr
    }

    /// Free the record node.
    ///
    /// # Safety
    ///
    /// The record must be unlinked from both rings, own no value, and `ptr`
    /// must not be used afterwards.
    pub(crate) unsafe fn free(ptr: NonNull<Record>) {
        strict_assert!(ptr.as_ref().value.is_none());
        strict_assert!(ptr.as_ref().ring.next == ptr);
        strict_assert!(ptr.as_ref().file.next == ptr);
        drop(Box::from_raw(ptr.as_ptr()));
    }

    pub(crate) fn referenced(&self) -> bool {
        self.flags.load(Ordering::Acquire) & Flags::REFERENCED.bits() != 0
    }

    pub(crate) fn set_referenced(&self, val: bool) {
        match val {
            true => self.flags.fetch_or(Flags::REFERENCED.bits(), Ordering::Release),
            false => self.flags.fetch_and(!Flags::REFERENCED.bits(), Ordering::Release),
        };
    }

    /// Store a value reference, acquiring it for the cache slot. Returns the
    /// displaced reference, which the caller must release after unlocking.
    pub(crate) fn set_value(&mut self, value: NonNull<Value>) -> Option<NonNull<Value>> {
        unsafe { Value::acquire(value) };
        self.value.replace(value)
    }

    /// Remove the value reference without releasing it; ownership moves to
    /// the caller.
    pub(crate) fn take_value(&mut self) -> Option<NonNull<Value>> {
        self.value.take()
    }

    pub(crate) fn has_value(&self) -> bool {
        self.value.is_some()
    }

    /// Acquire a new reference to the record's value, if it still owns one.
    /// Test records own none, so a hit on one degrades to a miss.
    pub(crate) fn acquire_value(&self) -> Option<NonNull<Value>> {
        self.value.inspect(|&value| unsafe { Value::acquire(value) })
    }

    pub(crate) fn next(&self) -> NonNull<Record> {
        self.ring.next
    }

    pub(crate) fn prev(&self) -> NonNull<Record> {
        self.ring.prev
    }

    pub(crate) fn next_file(&self) -> NonNull<Record> {
        self.file.next
    }

    /// Link `node` before `this` in the clock ring.
    ///
    /// # Safety
    ///
    /// `this` must be linked in a ring, `node` must be self-linked, and the
    /// caller must hold the shard's exclusive lock.
    pub(crate) unsafe fn link(this: NonNull<Record>, node: NonNull<Record>) {
        let prev = this.as_ref().ring.prev;
        (*node.as_ptr()).ring = RingLink { prev, next: this };
        (*prev.as_ptr()).ring.next = node;
        (*this.as_ptr()).ring.prev = node;
    }

    /// Unlink `this` from the clock ring, leaving it self-linked. Returns the
    /// old successor; a return value equal to `this` means it was the last
    /// node in the ring.
    ///
    /// # Safety
    ///
    /// Same as [`Record::link`].
    pub(crate) unsafe fn unlink(this: NonNull<Record>) -> NonNull<Record> {
        let RingLink { prev, next } = this.as_ref().ring;
        (*prev.as_ptr()).ring.next = next;
        (*next.as_ptr()).ring.prev = prev;
        (*this.as_ptr()).ring = RingLink { prev: this, next: this };
        next
    }

    /// Link `node` before `this` in the file ring.
    ///
    /// # Safety
    ///
    /// Same as [`Record::link`], for the file ring.
    pub(crate) unsafe fn link_file(this: NonNull<Record>, node: NonNull<Record>) {
        let prev = this.as_ref().file.prev;
        (*node.as_ptr()).file = RingLink { prev, next: this };
        (*prev.as_ptr()).file.next = node;
        (*this.as_ptr()).file.prev = node;
    }

    /// Unlink `this` from the file ring; see [`Record::unlink`].
    ///
    /// # Safety
    ///
    /// Same as [`Record::link`], for the file ring.
    pub(crate) unsafe fn unlink_file(this: NonNull<Record>) -> NonNull<Record> {
        let RingLink { prev, next } = this.as_ref().file;
        (*prev.as_ptr()).file.next = next;
        (*next.as_ptr()).file.prev = prev;
        (*this.as_ptr()).file = RingLink { prev: this, next: this };
        next
    }
}
