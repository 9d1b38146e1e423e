//! Size arithmetic shared by the acquisition paths.
//! These are pure functions that don't belong to any concrete backend.

use std::mem;

use crate::{
    config::SPMAT_CHUNKSIZE,
    error::{MemoryError, Result},
};

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// Used to compute the alignment a request is made with and to size the
/// zero-filling bursts of the mapped path.
pub fn align(to_be_aligned: usize, aligment: usize) -> usize {
    debug_assert!(aligment.is_power_of_two());
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Rounds `n_elem` up to the smallest multiple of [`SPMAT_CHUNKSIZE`] that
/// holds it. Zero stays zero.
///
/// The chunk size is not required to be a power of two, so this relies on
/// integer division rather than [`align`].
#[inline]
pub const fn enlarge_to_mult_of_chunksize(n_elem: usize) -> usize {
    if n_elem > 0 {
        ((n_elem - 1) / SPMAT_CHUNKSIZE + 1) * SPMAT_CHUNKSIZE
    } else {
        0
    }
}

/// Number of bytes occupied by `n_elem` values of `T`.
///
/// Fails with [`MemoryError::SizeOverflow`] if the product does not fit in a
/// `usize`. Every acquisition goes through here before touching a backend.
#[inline]
pub fn byte_size<T>(n_elem: usize) -> Result<usize> {
    let elem_size = mem::size_of::<T>();
    n_elem
        .checked_mul(elem_size)
        .ok_or(MemoryError::SizeOverflow { n_elem, elem_size })
}
