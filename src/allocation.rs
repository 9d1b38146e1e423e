use std::{
    fmt, mem,
    path::{Path, PathBuf},
    ptr::NonNull,
};

use crate::backend::{Backend, Selected};

/// Where a buffer came from. This, and never the element type, decides how
/// it is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// Obtained from the compile-time selected [`Backend`].
    Heap,
    /// A shared mapping of a backing file.
    Mapped,
}

/// Backing file of a mapped allocation.
#[cfg_attr(not(all(unix, feature = "mmap")), allow(dead_code))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BackingFile {
    pub path: PathBuf,
    pub remove_on_release: bool,
}

/// An element buffer handed out by [`crate::acquire`] or
/// [`crate::acquire_chunked`].
///
/// Bundles everything [`crate::release`] needs: the base pointer, the byte
/// length and the [`Provenance`]. Keeping them together means a buffer can't
/// be released with a flag that doesn't match how it was acquired.
///
/// The memory is owned by the allocation but is not initialised (mapped
/// buffers excepted, which start zeroed), so it is only reachable through raw
/// pointers. Dropping an `Allocation` without releasing it leaks the buffer.
///
/// ```text
///  ptr                                   ptr + byte_len()
///  +------+------+------+-- ... --+------+
///  |  T   |  T   |  T   |         |  T   |     len() elements
///  +------+------+------+-- ... --+------+
/// ```
#[must_use = "an allocation must be passed to `release`, otherwise it leaks"]
pub struct Allocation<T> {
    ptr: NonNull<T>,
    n_elem: usize,
    byte_len: usize,
    provenance: Provenance,
    backing: Option<BackingFile>,
}

impl<T> Allocation<T> {
    /// The zero-length representation, also used for zero-sized element
    /// types. Owns nothing and releases trivially.
    pub(crate) fn dangling(n_elem: usize) -> Self {
        Self {
            ptr: NonNull::dangling(),
            n_elem,
            byte_len: 0,
            provenance: Provenance::Heap,
            backing: None,
        }
    }

    pub(crate) fn from_heap(ptr: NonNull<u8>, n_elem: usize, byte_len: usize) -> Self {
        Self {
            ptr: ptr.cast(),
            n_elem,
            byte_len,
            provenance: Provenance::Heap,
            backing: None,
        }
    }

    #[cfg_attr(not(all(unix, feature = "mmap")), allow(dead_code))]
    pub(crate) fn from_mapping(
        ptr: NonNull<u8>,
        n_elem: usize,
        byte_len: usize,
        backing: BackingFile,
    ) -> Self {
        Self {
            ptr: ptr.cast(),
            n_elem,
            byte_len,
            provenance: Provenance::Mapped,
            backing: Some(backing),
        }
    }

    /// Rebuilds an allocation from the parts returned by
    /// [`Allocation::into_raw_parts`].
    ///
    /// # Safety
    ///
    /// `ptr`, `n_elem` and `provenance` must describe a buffer previously
    /// acquired through this crate that has not been released, with
    /// `provenance` matching how it was acquired. The backing file of a mapped
    /// buffer is never removed when it goes through this path.
    pub unsafe fn from_raw_parts(ptr: NonNull<T>, n_elem: usize, provenance: Provenance) -> Self {
        Self {
            ptr,
            n_elem,
            byte_len: n_elem * mem::size_of::<T>(),
            provenance,
            backing: None,
        }
    }

    /// Splits the allocation into its pointer, element count and provenance.
    /// The caller becomes responsible for releasing it, typically through
    /// [`Allocation::from_raw_parts`] or [`crate::release_raw`].
    pub fn into_raw_parts(self) -> (NonNull<T>, usize, Provenance) {
        (self.ptr, self.n_elem, self.provenance)
    }

    /// Number of elements the buffer holds.
    #[inline]
    pub fn len(&self) -> usize {
        self.n_elem
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n_elem == 0
    }

    /// Length of the buffer in bytes. This is the length to unmap with.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_non_null(&self) -> NonNull<T> {
        self.ptr
    }

    #[inline]
    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// `true` if the buffer is a mapped file rather than heap memory.
    #[inline]
    pub fn mmap_happened(&self) -> bool {
        self.provenance == Provenance::Mapped
    }

    /// Path of the file backing a mapped buffer.
    pub fn backing_file(&self) -> Option<&Path> {
        self.backing.as_ref().map(|b| b.path.as_path())
    }

    /// Alignment the buffer start is guaranteed to have. Allocations that
    /// own no memory only carry the alignment of `T`.
    pub fn alignment(&self) -> usize {
        match (self.byte_len == 0, self.provenance) {
            (true, _) => mem::align_of::<T>(),
            (false, Provenance::Heap) => Selected::GUARANTEED_ALIGNMENT.max(mem::align_of::<T>()),
            (false, Provenance::Mapped) => page_alignment(),
        }
    }

    pub(crate) fn take_backing(&mut self) -> Option<BackingFile> {
        self.backing.take()
    }
}

#[cfg(unix)]
fn page_alignment() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

#[cfg(not(unix))]
fn page_alignment() -> usize {
    4096
}

// SAFETY: an allocation owns its buffer exclusively, like a `Box<[T]>`.
unsafe impl<T: Send> Send for Allocation<T> {}

// SAFETY: shared access only hands out `*const T`.
unsafe impl<T: Sync> Sync for Allocation<T> {}

impl<T> fmt::Debug for Allocation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("ptr", &self.ptr)
            .field("len", &self.n_elem)
            .field("byte_len", &self.byte_len)
            .field("provenance", &self.provenance)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allocation() {
        let alloc = Allocation::<f64>::dangling(0);
        assert!(alloc.is_empty());
        assert_eq!(alloc.byte_len(), 0);
        assert!(!alloc.mmap_happened());
        assert_eq!(alloc.as_non_null(), NonNull::dangling());
        assert_eq!(alloc.alignment(), mem::align_of::<f64>());
        assert!(alloc.backing_file().is_none());
    }

    #[test]
    fn raw_parts_roundtrip_keeps_provenance() {
        let ptr = NonNull::<u32>::dangling();
        let alloc = unsafe { Allocation::from_raw_parts(ptr, 4, Provenance::Mapped) };
        assert_eq!(alloc.byte_len(), 16);
        assert!(alloc.mmap_happened());

        let (p, n, provenance) = alloc.into_raw_parts();
        assert_eq!(p, ptr);
        assert_eq!(n, 4);
        assert_eq!(provenance, Provenance::Mapped);
    }

    #[test]
    fn debug_output_names_provenance() {
        let alloc = Allocation::<u8>::dangling(0);
        assert!(format!("{alloc:?}").contains("Heap"));
    }
}
