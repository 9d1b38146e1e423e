use std::{mem, ptr::NonNull};

use crate::config::ALIGNMENT;

/// A heap strategy that supplies raw element buffers.
///
/// Exactly one implementation is compiled in as [`Selected`]; which one is a
/// build-time decision made with cargo features, never a per-call branch. The
/// array layer above has nothing to do with the concrete allocator APIs, it only
/// ever talks to [`Selected`] through [`request_memory`] and [`return_memory`].
///
/// Every implementation must be safe to call from several threads at once.
pub trait Backend {
    /// Human readable name, used in diagnostics and errors.
    const NAME: &'static str;

    /// Alignment every non-empty buffer is guaranteed to have, provided the
    /// element type itself does not ask for more.
    const GUARANTEED_ALIGNMENT: usize;

    /// Request `bytes` bytes aligned to at least `min_align` (the alignment of
    /// the element type). Returns `None` if the allocator fails.
    ///
    /// **SAFETY**: `bytes` must be non-zero and `min_align` a power of two.
    unsafe fn allocate(bytes: usize, min_align: usize) -> Option<NonNull<u8>>;

    /// Hands a buffer obtained from [`Backend::allocate`] back to the allocator.
    ///
    /// **SAFETY**: `ptr` must come from `allocate` of this same backend with
    /// the same `min_align` and must not have been released already. `bytes` is
    /// the size originally requested; every backend ignores it.
    unsafe fn deallocate(ptr: NonNull<u8>, bytes: usize, min_align: usize);
}

#[cfg(any(
    all(feature = "mkl", feature = "mimalloc"),
    all(feature = "mkl", feature = "system-malloc"),
    all(feature = "mimalloc", feature = "system-malloc"),
))]
compile_error!(
    "features `mkl`, `mimalloc` and `system-malloc` select different backends; enable at most one"
);

/// The backend compiled into this build.
#[cfg(feature = "mkl")]
pub type Selected = Vendor;

/// The backend compiled into this build.
#[cfg(all(feature = "mimalloc", not(feature = "mkl")))]
pub type Selected = Scalable;

/// The backend compiled into this build.
#[cfg(all(feature = "system-malloc", not(any(feature = "mkl", feature = "mimalloc"))))]
pub type Selected = SystemMalloc;

/// The backend compiled into this build.
#[cfg(all(
    unix,
    not(any(feature = "mkl", feature = "mimalloc", feature = "system-malloc"))
))]
pub type Selected = PosixMemalign;

/// The backend compiled into this build.
#[cfg(all(
    windows,
    not(any(feature = "mkl", feature = "mimalloc", feature = "system-malloc"))
))]
pub type Selected = AlignedMalloc;

/// The backend compiled into this build.
#[cfg(not(any(
    unix,
    windows,
    feature = "mkl",
    feature = "mimalloc",
    feature = "system-malloc"
)))]
pub type Selected = SystemMalloc;

/// Wrapper to use [`Backend::allocate`] of the [`Selected`] backend.
#[inline]
pub(crate) unsafe fn request_memory(bytes: usize, min_align: usize) -> Option<NonNull<u8>> {
    let ptr = unsafe { Selected::allocate(bytes, min_align) };
    log::debug!("{}: acquired {bytes} bytes at {ptr:?}", Selected::NAME);
    ptr
}

/// Wrapper to use [`Backend::deallocate`] of the [`Selected`] backend.
#[inline]
pub(crate) unsafe fn return_memory(ptr: NonNull<u8>, bytes: usize, min_align: usize) {
    log::debug!("{}: releasing {bytes} bytes at {ptr:?}", Selected::NAME);
    unsafe { Selected::deallocate(ptr, bytes, min_align) }
}

/// `posix_memalign`/`free`. The platform default on unix.
#[cfg(unix)]
pub struct PosixMemalign;

#[cfg(unix)]
impl Backend for PosixMemalign {
    const NAME: &'static str = "posix_memalign";
    const GUARANTEED_ALIGNMENT: usize = if ALIGNMENT >= mem::size_of::<*const u8>() {
        ALIGNMENT
    } else {
        mem::size_of::<*const u8>()
    };

    unsafe fn allocate(bytes: usize, min_align: usize) -> Option<NonNull<u8>> {
        // posix_memalign wants a power of two that is also a multiple of the
        // pointer size.
        let alignment = min_align.max(Self::GUARANTEED_ALIGNMENT);
        let mut out: *mut libc::c_void = std::ptr::null_mut();

        let status = unsafe { libc::posix_memalign(&mut out, alignment, bytes) };

        match status {
            0 => NonNull::new(out.cast()),
            _ => None,
        }
    }

    unsafe fn deallocate(ptr: NonNull<u8>, _bytes: usize, _min_align: usize) {
        unsafe { libc::free(ptr.as_ptr().cast()) }
    }
}

/// `_aligned_malloc`/`_aligned_free` from the C runtime. The platform default
/// on windows.
#[cfg(windows)]
pub struct AlignedMalloc;

#[cfg(windows)]
impl Backend for AlignedMalloc {
    const NAME: &'static str = "_aligned_malloc";
    const GUARANTEED_ALIGNMENT: usize = ALIGNMENT;

    unsafe fn allocate(bytes: usize, min_align: usize) -> Option<NonNull<u8>> {
        let alignment = min_align.max(Self::GUARANTEED_ALIGNMENT);

        unsafe { NonNull::new(libc::aligned_malloc(bytes, alignment).cast()) }
    }

    unsafe fn deallocate(ptr: NonNull<u8>, _bytes: usize, _min_align: usize) {
        unsafe { libc::aligned_free(ptr.as_ptr().cast()) }
    }
}

/// Plain `malloc`/`free`. Makes no promise beyond what the C library gives:
/// element types that need more than that are refused.
pub struct SystemMalloc;

impl Backend for SystemMalloc {
    const NAME: &'static str = "malloc";
    const GUARANTEED_ALIGNMENT: usize = 2 * mem::size_of::<usize>();

    unsafe fn allocate(bytes: usize, min_align: usize) -> Option<NonNull<u8>> {
        if min_align > Self::GUARANTEED_ALIGNMENT {
            return None;
        }

        unsafe { NonNull::new(libc::malloc(bytes).cast()) }
    }

    unsafe fn deallocate(ptr: NonNull<u8>, _bytes: usize, _min_align: usize) {
        unsafe { libc::free(ptr.as_ptr().cast()) }
    }
}

/// The scalable, thread-aware allocator (mimalloc).
#[cfg(feature = "mimalloc")]
pub struct Scalable;

#[cfg(feature = "mimalloc")]
impl Backend for Scalable {
    const NAME: &'static str = "mimalloc";
    const GUARANTEED_ALIGNMENT: usize = ALIGNMENT;

    unsafe fn allocate(bytes: usize, min_align: usize) -> Option<NonNull<u8>> {
        use std::alloc::{GlobalAlloc, Layout};

        let layout = Layout::from_size_align(bytes, min_align.max(ALIGNMENT)).ok()?;
        unsafe { NonNull::new(mimalloc::MiMalloc.alloc(layout)) }
    }

    unsafe fn deallocate(ptr: NonNull<u8>, _bytes: usize, _min_align: usize) {
        // mimalloc finds the size and alignment from the pointer itself.
        unsafe { libmimalloc_sys::mi_free(ptr.as_ptr().cast()) }
    }
}

/// Vendor math-library allocator (Intel MKL), always asked for 128-byte
/// alignment.
#[cfg(feature = "mkl")]
pub struct Vendor;

#[cfg(feature = "mkl")]
mod mkl_ffi {
    use std::ffi::{c_int, c_void};

    #[link(name = "mkl_rt")]
    unsafe extern "C" {
        pub fn mkl_malloc(alloc_size: usize, alignment: c_int) -> *mut c_void;
        pub fn mkl_free(a_ptr: *mut c_void);
    }
}

#[cfg(feature = "mkl")]
impl Backend for Vendor {
    const NAME: &'static str = "mkl_malloc";
    const GUARANTEED_ALIGNMENT: usize = 128;

    unsafe fn allocate(bytes: usize, min_align: usize) -> Option<NonNull<u8>> {
        let alignment = min_align.max(Self::GUARANTEED_ALIGNMENT);
        let alignment = std::ffi::c_int::try_from(alignment).ok()?;

        unsafe { NonNull::new(mkl_ffi::mkl_malloc(bytes, alignment).cast()) }
    }

    unsafe fn deallocate(ptr: NonNull<u8>, _bytes: usize, _min_align: usize) {
        unsafe { mkl_ffi::mkl_free(ptr.as_ptr().cast()) }
    }
}
