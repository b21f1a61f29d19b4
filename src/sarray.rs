//! SArray - shared typed array
//!
//! A reference-counted contiguous buffer of a primitive element type with
//! cheap sub-range views. Key, value and length payloads travel through the
//! service as `SArray`s so that slicing a batch for several servers and
//! packing shards into messages never copies element data.
//!
//! ## Sharing model
//!
//! ```text
//! SArray ── Arc ──► RawStorage (cache-line aligned bytes)
//!    │                   ▲
//!    └── segment(i, j) ──┘   (same storage, different offset/len)
//! ```
//!
//! `segment` returns another handle onto the same storage; the storage is
//! freed when the last handle goes away. Mutating operations (`push`,
//! `extend_from_slice`) write in place only while the handle is the sole
//! owner of its storage and reallocate otherwise.

use std::alloc::{alloc, alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::NonNull;
use std::slice;
use std::sync::{Arc, OnceLock};

use bytemuck::Pod;

use crate::constants::CACHE_LINE_BYTES;
use crate::status::Status;

/// Reference-counted raw byte storage backing one or more `SArray` handles.
///
/// The block is either allocated by this module (cache-line aligned, freed
/// with the matching layout) or adopted from the outside together with a
/// custom deleter.
struct RawStorage {
    ptr: NonNull<u8>,
    /// Capacity in bytes; 0 only for the shared empty storage.
    cap: usize,
    /// `None` means the block was allocated here; otherwise the deleter is
    /// invoked with `(ptr, cap)` when the last handle drops.
    deleter: Option<Box<dyn FnOnce(*mut u8, usize) + Send>>,
}

impl Drop for RawStorage {
    fn drop(&mut self) {
        if let Some(del) = self.deleter.take() {
            del(self.ptr.as_ptr(), self.cap);
        } else if self.cap > 0 {
            unsafe { dealloc(self.ptr.as_ptr(), storage_layout(self.cap)) };
        }
    }
}

// Safety: the storage owns its block; the deleter is only invoked under
// exclusive access in Drop.
unsafe impl Send for RawStorage {}
unsafe impl Sync for RawStorage {}

#[inline]
fn storage_layout(cap: usize) -> Layout {
    // CACHE_LINE_BYTES is a power of two and cap never exceeds isize::MAX
    // for a live allocation.
    Layout::from_size_align(cap, CACHE_LINE_BYTES).unwrap()
}

fn empty_storage() -> Arc<RawStorage> {
    static EMPTY: OnceLock<Arc<RawStorage>> = OnceLock::new();
    EMPTY
        .get_or_init(|| {
            Arc::new(RawStorage {
                ptr: NonNull::dangling(),
                cap: 0,
                deleter: None,
            })
        })
        .clone()
}

fn alloc_storage(cap: usize, zero: bool) -> Arc<RawStorage> {
    if cap == 0 {
        return empty_storage();
    }
    let layout = storage_layout(cap);
    let raw = unsafe {
        if zero {
            alloc_zeroed(layout)
        } else {
            alloc(layout)
        }
    };
    let ptr = match NonNull::new(raw) {
        Some(p) => p,
        None => handle_alloc_error(layout),
    };
    Arc::new(RawStorage {
        ptr,
        cap,
        deleter: None,
    })
}

/// A shared array of a primitive element type.
///
/// Handles are cheap to clone (a refcount bump) and may alias sub-ranges of
/// one storage block. Storage is cache-line aligned, so element-granular
/// segments of any [`Pod`] type remain properly aligned.
pub struct SArray<T: Pod> {
    storage: Arc<RawStorage>,
    /// Byte offset of element 0 within the storage.
    off: usize,
    /// Element count of this view.
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> SArray<T> {
    /// Create an empty array.
    pub fn new() -> Self {
        Self {
            storage: empty_storage(),
            off: 0,
            len: 0,
            _marker: PhantomData,
        }
    }

    /// Create an empty array with room for `cap` elements before the first
    /// reallocation.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            storage: alloc_storage(cap * mem::size_of::<T>(), false),
            off: 0,
            len: 0,
            _marker: PhantomData,
        }
    }

    /// Create an array of `len` zeroed elements.
    pub fn zeroed(len: usize) -> Self {
        Self {
            storage: alloc_storage(len * mem::size_of::<T>(), true),
            off: 0,
            len,
            _marker: PhantomData,
        }
    }

    /// Create an array by copying a slice.
    pub fn from_slice(src: &[T]) -> Self {
        let mut arr = Self::with_capacity(src.len());
        arr.extend_from_slice(src);
        arr
    }

    /// Adopt an externally allocated region without copying.
    ///
    /// The deleter is invoked with the original pointer and the byte size
    /// when the last handle referencing the region drops.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` initialized elements of `T`, aligned for
    /// `T`, valid until the deleter runs, and not be mutated or freed by the
    /// caller while any handle is alive.
    pub unsafe fn from_raw<F>(ptr: *mut T, len: usize, deleter: F) -> Self
    where
        F: FnOnce(*mut u8, usize) + Send + 'static,
    {
        let cap = len * mem::size_of::<T>();
        let nn = NonNull::new(ptr as *mut u8).unwrap_or(NonNull::dangling());
        Self {
            storage: Arc::new(RawStorage {
                ptr: nn,
                cap,
                deleter: Some(Box::new(deleter)),
            }),
            off: 0,
            len,
            _marker: PhantomData,
        }
    }

    /// Number of elements in this view.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether this view is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of this view in bytes.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.len * mem::size_of::<T>()
    }

    /// Pointer to element 0 of this view.
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        unsafe { self.storage.ptr.as_ptr().add(self.off) as *const T }
    }

    /// View the elements as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// Return a handle aliasing elements `[begin, end)` of this view.
    ///
    /// The storage refcount is bumped; the segment keeps the whole storage
    /// alive for as long as it exists.
    ///
    /// # Panics
    ///
    /// Panics if `begin > end` or `end > self.len()`.
    pub fn segment(&self, begin: usize, end: usize) -> Self {
        assert!(begin <= end && end <= self.len, "segment out of range");
        Self {
            storage: self.storage.clone(),
            off: self.off + begin * mem::size_of::<T>(),
            len: end - begin,
            _marker: PhantomData,
        }
    }

    /// Append one element, growing the storage if needed.
    pub fn push(&mut self, value: T) {
        self.extend_from_slice(slice::from_ref(&value));
    }

    /// Append the contents of another array (copies its bytes).
    pub fn append(&mut self, other: &SArray<T>) {
        self.extend_from_slice(other.as_slice());
    }

    /// Append a slice of elements, growing the storage if needed.
    ///
    /// Writes in place when this handle is the only owner of its storage and
    /// the capacity suffices; otherwise the elements move to a fresh block
    /// (amortized doubling).
    pub fn extend_from_slice(&mut self, src: &[T]) {
        if src.is_empty() {
            return;
        }
        let elem = mem::size_of::<T>();
        let need = (self.len + src.len()) * elem;
        let in_place = Arc::strong_count(&self.storage) == 1
            && self.storage.deleter.is_none()
            && self.off == 0
            && need <= self.storage.cap;
        if !in_place {
            let storage = alloc_storage(need.next_power_of_two(), false);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.storage.ptr.as_ptr().add(self.off),
                    storage.ptr.as_ptr(),
                    self.len * elem,
                );
            }
            self.storage = storage;
            self.off = 0;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr() as *const u8,
                self.storage.ptr.as_ptr().add(self.len * elem),
                src.len() * elem,
            );
        }
        self.len += src.len();
    }

    /// Reinterpret this view as raw bytes, sharing the storage.
    pub fn as_bytes(&self) -> SArray<u8> {
        SArray {
            storage: self.storage.clone(),
            off: self.off,
            len: self.size_bytes(),
            _marker: PhantomData,
        }
    }

    /// Reinterpret a byte view as a typed array, sharing the storage.
    ///
    /// Fails with [`Status::Corruption`] if the byte length is not a
    /// multiple of `size_of::<T>()` or the view start is misaligned for `T`.
    pub fn from_bytes(bytes: &SArray<u8>) -> Result<Self, Status> {
        let elem = mem::size_of::<T>();
        if bytes.len % elem != 0 {
            return Err(Status::Corruption);
        }
        if !bytes.is_empty() && (bytes.as_ptr() as usize) % mem::align_of::<T>() != 0 {
            return Err(Status::Corruption);
        }
        Ok(Self {
            storage: bytes.storage.clone(),
            off: bytes.off,
            len: bytes.len / elem,
            _marker: PhantomData,
        })
    }

    /// Copy `src` over the elements starting at `idx`.
    ///
    /// # Safety
    ///
    /// `idx + src.len()` must not exceed `self.len()`, and the caller must
    /// guarantee no other thread reads or writes the overwritten range for
    /// the duration of the call (the zero-copy pull protocol: the buffer is
    /// off-limits to its owner until the request completes).
    pub(crate) unsafe fn write_slice(&self, idx: usize, src: &[T]) {
        debug_assert!(idx + src.len() <= self.len);
        let elem = mem::size_of::<T>();
        std::ptr::copy_nonoverlapping(
            src.as_ptr() as *const u8,
            self.storage.ptr.as_ptr().add(self.off + idx * elem),
            src.len() * elem,
        );
    }
}

impl<T: Pod> Clone for SArray<T> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            off: self.off,
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<T: Pod> Default for SArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Pod> Deref for SArray<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Pod> From<Vec<T>> for SArray<T> {
    fn from(v: Vec<T>) -> Self {
        Self::from_slice(&v)
    }
}

impl<T: Pod> From<&[T]> for SArray<T> {
    fn from(v: &[T]) -> Self {
        Self::from_slice(v)
    }
}

impl<T: Pod + PartialEq> PartialEq for SArray<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T: Pod + fmt::Debug> fmt::Debug for SArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}
