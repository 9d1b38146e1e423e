//! Alignment introspection for vectorised kernels.
//!
//! [`is_aligned`] is a check; [`mark_as_aligned`] is a promise to the
//! optimiser. Neither changes the pointer value.

use crate::config::ALIGNMENT;

/// Returns `true` if `ptr` is a multiple of [`ALIGNMENT`].
///
/// With the `no-alignment-check` feature this conservatively answers `false`
/// for every pointer, aligned or not. It never claims an alignment it has not
/// verified.
#[inline(always)]
pub fn is_aligned<T>(ptr: *const T) -> bool {
    #[cfg(not(feature = "no-alignment-check"))]
    {
        (ptr as usize) & (ALIGNMENT - 1) == 0
    }
    #[cfg(feature = "no-alignment-check")]
    {
        let _ = ptr;
        false
    }
}

/// Tells the compiler that `ptr` is [`ALIGNMENT`]-aligned and hands the same
/// pointer back, so loops over it can use aligned vector loads.
///
/// # Safety
///
/// `ptr` must really be a multiple of [`ALIGNMENT`]. This is a hint, not a
/// check: lying here is undefined behaviour.
#[inline(always)]
pub unsafe fn mark_as_aligned<T>(ptr: *mut T) -> *mut T {
    unsafe { std::hint::assert_unchecked((ptr as usize) & (ALIGNMENT - 1) == 0) };
    ptr
}

/// [`mark_as_aligned`] for shared pointers.
///
/// # Safety
///
/// Same as [`mark_as_aligned`].
#[inline(always)]
pub unsafe fn mark_as_aligned_const<T>(ptr: *const T) -> *const T {
    unsafe { std::hint::assert_unchecked((ptr as usize) & (ALIGNMENT - 1) == 0) };
    ptr
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[repr(C, align(16))]
    struct Aligned([u8; 64]);

    #[cfg(not(feature = "no-alignment-check"))]
    #[test]
    fn detects_aligned_and_unaligned() {
        let buf = Aligned([0; 64]);
        let base = buf.0.as_ptr();
        assert!(is_aligned(base));
        assert!(!is_aligned(base.wrapping_add(1)));
        assert!(!is_aligned(base.wrapping_add(8)));
        assert!(is_aligned(base.wrapping_add(32)));
    }

    #[cfg(feature = "no-alignment-check")]
    #[test]
    fn unsupported_check_is_always_false() {
        let buf = Aligned([0; 64]);
        assert!(!is_aligned(buf.0.as_ptr()));
    }

    #[test]
    fn marking_keeps_the_pointer() {
        let mut buf = Aligned([0; 64]);
        let ptr = buf.0.as_mut_ptr();
        unsafe {
            assert_eq!(mark_as_aligned(ptr), ptr);
            assert_eq!(mark_as_aligned_const(ptr as *const u8), ptr as *const u8);
        }
    }

    proptest! {
        #[test]
        fn never_claims_a_misaligned_address(addr in any::<usize>()) {
            let ptr = addr as *const u8;
            if is_aligned(ptr) {
                prop_assert_eq!(addr % ALIGNMENT, 0);
            }
        }
    }
}
