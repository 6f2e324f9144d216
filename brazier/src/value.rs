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
    fmt::Debug,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::atomic::{fence, AtomicIsize, Ordering},
};

use brazier_common::{strict_assert, strict_assert_eq};

/// A reference counted byte buffer with a manually managed lifetime.
///
/// A value starts with a reference count of 1, held by the [`ValueBuf`]
/// returned from [`Value::alloc`]. The cache slot that stores the value and
/// every [`Handle`] that points at it each own one additional reference. The
/// buffer is returned to the allocator exactly when the count drops to 0.
pub struct Value {
    refs: AtomicIsize,
    buf: Box<[u8]>,
}

impl Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("len", &self.buf.len())
            .field("refs", &self.refs())
            .finish()
    }
}

impl Value {
    /// Allocate a zeroed buffer of `n` bytes with a reference count of 1, not
    /// yet tracked by any cache shard.
    ///
    /// The buffer stays mutable until it is handed to `Cache::set`, which
    /// consumes the unique owner.
    pub fn alloc(n: usize) -> ValueBuf {
        let value = Box::new(Value {
            refs: AtomicIsize::new(1),
            buf: vec![0; n].into_boxed_slice(),
        });
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(value)) };
        tracing::trace!("[value]: alloc {n} bytes");
        ValueBuf { ptr }
    }

    pub(crate) fn refs(&self) -> isize {
        self.refs.load(Ordering::Acquire)
    }

    /// Add one owner to the value.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live value, i.e. the caller already owns a
    /// reference that keeps the count above zero.
    pub(crate) unsafe fn acquire(ptr: NonNull<Value>) {
        let old = ptr.as_ref().refs.fetch_add(1, Ordering::Relaxed);
        strict_assert!(old >= 1);
        tracing::trace!("[value]: acquire refs: {} => {}", old, old + 1);
    }

    /// Drop one owner of the value, freeing the buffer at count 0.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a live value, and the caller gives up its
    /// reference; the value must not be touched through `ptr` afterwards.
    pub(crate) unsafe fn release(ptr: NonNull<Value>) {
        let old = ptr.as_ref().refs.fetch_sub(1, Ordering::Release);
        strict_assert!(old >= 1);
        tracing::trace!("[value]: release refs: {} => {}", old, old - 1);
        if old == 1 {
            fence(Ordering::Acquire);
            drop(Box::from_raw(ptr.as_ptr()));
        }
    }
}

/// Unique owner of a freshly allocated [`Value`].
///
/// Holds the value's initial reference. Either hand it to `Cache::set`, which
/// consumes the wrapper and transfers the reference into the returned
/// [`Handle`], or drop it (see [`ValueBuf::free`]) to release the buffer.
/// Because the wrapper is unique, a value can never be inserted while it is
/// owned elsewhere.
pub struct ValueBuf {
    ptr: NonNull<Value>,
}

unsafe impl Send for ValueBuf {}
unsafe impl Sync for ValueBuf {}

impl Debug for ValueBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueBuf").field("len", &self.len()).finish()
    }
}

impl ValueBuf {
    /// Release the buffer without inserting it into a cache.
    ///
    /// Dropping the wrapper does the same; this spelling exists for call
    /// sites that want the release to be visible.
    pub fn free(self) {}

    /// Transfer the wrapper's reference to the caller.
    pub(crate) fn into_raw(self) -> NonNull<Value> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl Deref for ValueBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { &self.ptr.as_ref().buf }
    }
}

impl DerefMut for ValueBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // The wrapper is the unique owner, so the buffer cannot be shared.
        strict_assert_eq!(unsafe { self.ptr.as_ref() }.refs(), 1);
        unsafe { &mut self.ptr.as_mut().buf }
    }
}

impl Drop for ValueBuf {
    fn drop(&mut self) {
        unsafe { Value::release(self.ptr) }
    }
}

/// A strong reference to a value in the cache.
///
/// The reference does not pin the value in the cache, but it does keep the
/// underlying buffer alive. A handle returned by a missed `get` is invalid
/// and holds nothing.
///
/// The handle releases its reference when dropped; [`Handle::release`] is the
/// explicit spelling.
pub struct Handle {
    value: Option<NonNull<Value>>,
}

unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("valid", &self.valid()).finish()
    }
}

impl Handle {
    /// Wrap a value reference already owned by the caller.
    pub(crate) fn new(value: NonNull<Value>) -> Self {
        Self { value: Some(value) }
    }

    pub(crate) const fn invalid() -> Self {
        Self { value: None }
    }

    /// Return `true` if the handle holds a value.
    pub fn valid(&self) -> bool {
        self.value.is_some()
    }

    /// The cached buffer.
    ///
    /// # Panics
    ///
    /// Panics if the handle is not [`Handle::valid`].
    pub fn raw_buffer(&self) -> &[u8] {
        let ptr = self.value.expect("raw_buffer() on an invalid handle");
        unsafe { &ptr.as_ref().buf }
    }

    /// Release the reference to the cache entry.
    pub fn release(self) {}
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(ptr) = self.value.take() {
            unsafe { Value::release(ptr) }
        }
    }
}

#[cfg(test)]
impl Handle {
    /// Test helper: report validity and release in one move.
    pub(crate) fn valid_then_release(self) -> bool {
        self.valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_buf_unique_owner() {
        let mut buf = Value::alloc(8);
        assert_eq!(buf.len(), 8);
        assert!(buf.iter().all(|b| *b == 0));
        buf.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        buf.free();
    }

    #[test]
    fn test_handle_keeps_value_alive() {
        let buf = Value::alloc(4);
        let ptr = buf.into_raw();
        unsafe { Value::acquire(ptr) };
        let a = Handle::new(ptr);
        let b = Handle::new(ptr);
        assert!(a.valid() && b.valid());
        a.release();
        assert_eq!(b.raw_buffer(), &[0, 0, 0, 0]);
        b.release();
    }

    #[test]
    fn test_invalid_handle() {
        let handle = Handle::invalid();
        assert!(!handle.valid());
    }
}
