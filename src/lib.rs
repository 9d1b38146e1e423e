//! Element-buffer allocation for numerical arrays.
//!
//! Every buffer backing a dense or sparse array is obtained with [`acquire`]
//! (or [`acquire_chunked`]) and given back with [`release`]. The heap strategy
//! is fixed at build time (see [`backend`]); with the experimental `mmap`
//! feature, non-empty [`acquire`] requests are served by a shared mapping of a
//! zero-filled temporary file instead.
//!
//! ```text
//!             acquire(n)                         release(alloc)
//!   caller ---------------> Allocation<T> ----------------------> free / munmap
//!                           { ptr, len, provenance }
//! ```
//!
//! The layer keeps no registry of live buffers. Each [`Allocation`] must be
//! released exactly once; the provenance it carries picks the matching
//! release primitive.

pub mod alignment;
pub mod allocation;
pub mod backend;
pub mod config;
pub mod error;
#[cfg(all(unix, feature = "mmap"))]
mod mmap;
pub mod utils;

use std::{mem, ptr::NonNull};

pub use alignment::{is_aligned, mark_as_aligned, mark_as_aligned_const};
pub use allocation::{Allocation, Provenance};
pub use config::{MmapConfig, SPMAT_CHUNKSIZE};
pub use error::{MemoryError, Result};
pub use utils::enlarge_to_mult_of_chunksize;

use backend::{Backend, Selected};

/// Acquires a buffer for `n_elem` values of `T`.
///
/// Uses the process-wide [`MmapConfig`] (see [`config::global`]) when the
/// mapped path is compiled in. Check [`Allocation::mmap_happened`] to learn
/// which path served the request.
///
/// # Errors
///
/// - [`MemoryError::SizeOverflow`] if `n_elem * size_of::<T>()` overflows,
///   before anything is allocated.
/// - [`MemoryError::OutOfMemory`] if the backend or the mapping fails.
/// - [`MemoryError::BackingFile`] if the mapped path can't build its file.
pub fn acquire<T>(n_elem: usize) -> Result<Allocation<T>> {
    acquire_with(n_elem, config::global())
}

/// [`acquire`] with an explicit mapped-file configuration.
pub fn acquire_with<T>(n_elem: usize, mmap_config: &MmapConfig) -> Result<Allocation<T>> {
    let byte_len = utils::byte_size::<T>(n_elem)?;

    if n_elem == 0 || byte_len == 0 {
        return Ok(zero_length(n_elem));
    }

    #[cfg(all(unix, feature = "mmap"))]
    {
        let mapping = mmap::map_zeroed(byte_len, mmap_config)?;
        let backing = allocation::BackingFile {
            path: mapping.path,
            remove_on_release: mmap_config.remove_backing_file,
        };
        Ok(Allocation::from_mapping(mapping.ptr, n_elem, byte_len, backing))
    }

    #[cfg(not(all(unix, feature = "mmap")))]
    {
        let _ = mmap_config;
        acquire_heap(n_elem, byte_len)
    }
}

/// Acquires room for at least `n_elem` values of `T`, rounded up to a
/// multiple of [`SPMAT_CHUNKSIZE`] so repeated growth reuses capacity.
///
/// Always served by the heap backend, even when the mapped path is compiled
/// in. The returned [`Allocation::len`] is the rounded count.
pub fn acquire_chunked<T>(n_elem: usize) -> Result<Allocation<T>> {
    // Rounding itself must not overflow.
    if n_elem > usize::MAX / SPMAT_CHUNKSIZE * SPMAT_CHUNKSIZE {
        return Err(MemoryError::SizeOverflow {
            n_elem,
            elem_size: mem::size_of::<T>(),
        });
    }
    let n_elem_mod = enlarge_to_mult_of_chunksize(n_elem);
    let byte_len = utils::byte_size::<T>(n_elem_mod)?;

    if n_elem_mod == 0 || byte_len == 0 {
        return Ok(zero_length(n_elem_mod));
    }

    acquire_heap(n_elem_mod, byte_len)
}

/// Releases a buffer with the primitive matching its provenance.
///
/// Heap buffers go back to the [`backend::Selected`] backend; mapped buffers
/// are unmapped, and their backing file is deleted if the configuration they
/// were acquired with asked for it.
///
/// # Errors
///
/// [`MemoryError::UnmapFailed`] if `munmap` rejects a mapped buffer.
pub fn release<T>(mut allocation: Allocation<T>) -> Result<()> {
    let byte_len = allocation.byte_len();
    let backing = allocation.take_backing();
    let (ptr, _, provenance) = allocation.into_raw_parts();

    unsafe { release_raw(ptr.as_ptr(), byte_len, provenance == Provenance::Mapped)? };

    #[cfg(all(unix, feature = "mmap"))]
    if let Some(backing) = backing.filter(|b| b.remove_on_release) {
        mmap::remove_backing_file(&backing.path);
    }
    #[cfg(not(all(unix, feature = "mmap")))]
    let _ = backing;

    Ok(())
}

/// Releases a buffer described by its raw parts.
///
/// For heap buffers `length_in_bytes` is ignored; for mapped buffers it is the number of bytes unmapped and
/// must cover the original mapping. Null pointers and the zero-length
/// sentinel are ignored.
///
/// # Safety
///
/// `ptr` must come from [`acquire`] or [`acquire_chunked`] for the same `T`,
/// must not have been released already, and `was_mapped` must match
/// [`Allocation::mmap_happened`] of that acquisition. Passing the wrong flag
/// frees with the wrong primitive, which this layer cannot detect.
///
/// # Errors
///
/// [`MemoryError::UnmapFailed`] if `munmap` rejects the range, or if a mapped
/// release is requested from a build without the mapped path.
pub unsafe fn release_raw<T>(ptr: *mut T, length_in_bytes: usize, was_mapped: bool) -> Result<()> {
    let Some(ptr) = NonNull::new(ptr) else {
        return Ok(());
    };
    if ptr == NonNull::dangling() {
        return Ok(());
    }

    if !was_mapped {
        unsafe { backend::return_memory(ptr.cast(), length_in_bytes, mem::align_of::<T>()) };
        return Ok(());
    }

    #[cfg(all(unix, feature = "mmap"))]
    {
        unsafe { mmap::unmap(ptr.cast(), length_in_bytes) }
    }

    #[cfg(not(all(unix, feature = "mmap")))]
    {
        Err(MemoryError::UnmapFailed {
            len: length_in_bytes,
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "this build has no mapped allocation path",
            ),
        })
    }
}

fn zero_length<T>(n_elem: usize) -> Allocation<T> {
    Allocation::dangling(n_elem)
}

fn acquire_heap<T>(n_elem: usize, byte_len: usize) -> Result<Allocation<T>> {
    let ptr = unsafe { backend::request_memory(byte_len, mem::align_of::<T>()) }
        .ok_or_else(|| MemoryError::out_of_memory(byte_len, Selected::NAME))?;

    Ok(Allocation::from_heap(ptr, n_elem, byte_len))
}
