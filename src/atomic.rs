//! Safe wrappers over the lock-free primitives the allocator is built on.
//!
//! The original C core (`sf_malloc_atomic.h`) hand-rolls these with inline
//! x86 assembly (`lock cmpxchg`, `lock xadd`). `core::sync::atomic` gives us
//! the same instructions portably, so this module only exists to name the
//! operations the rest of the crate actually uses and to pin down the
//! orderings once.

use core::sync::atomic::{AtomicU64, Ordering};

/// 64-bit compare-and-swap. Returns `true` on success.
///
/// Ownership transfer (spec 4.3 "Adoption") and the remote-free list CAS
/// (spec 4.4) both pack two 32-bit fields (owner_id/finish_mark,
/// head/count) into one `AtomicU64` rather than using a bare 32-bit CAS on
/// `owner_id` alone, so that the pair always changes atomically together —
/// see DESIGN.md's Open Question decision on 16-byte atomics.
#[inline]
pub fn cas64(target: &AtomicU64, old: u64, new: u64) -> bool {
    target
        .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas64_succeeds_only_on_match() {
        let a = AtomicU64::new(1);
        assert!(!cas64(&a, 0, 2));
        assert!(cas64(&a, 1, 2));
        assert_eq!(a.load(Ordering::Relaxed), 2);
    }
}
