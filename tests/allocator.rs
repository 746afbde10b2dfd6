//! Black-box tests against the public C ABI and `GlobalAlloc` surface
//! (spec 8, concrete scenarios), exercised the way an external caller
//! would use this allocator rather than by poking at its internals.

use std::alloc::{GlobalAlloc, Layout};
use std::os::raw::c_void;
use std::thread;

use superalloc::Superalloc;

unsafe fn c_malloc(size: usize) -> *mut u8 {
    superalloc::malloc(size) as *mut u8
}

unsafe fn c_free(ptr: *mut u8) {
    superalloc::free(ptr as *mut c_void)
}

#[test]
fn eight_byte_round_trip_reuses_freed_slot() {
    unsafe {
        let p = c_malloc(8);
        assert!(!p.is_null());
        assert_eq!(p as usize % 8, 0);
        c_free(p);
        let q = c_malloc(8);
        assert_eq!(p, q);
        c_free(q);
    }
}

#[test]
fn zero_byte_malloc_is_well_defined() {
    unsafe {
        let p = superalloc::malloc(0);
        // null or freeable; either way, free must not crash.
        superalloc::free(p);
    }
}

#[test]
fn large_allocation_survives_split_then_free_cycle() {
    unsafe {
        let size = 8 * 4096;
        let p = c_malloc(size);
        assert!(!p.is_null());
        std::ptr::write_bytes(p, 0xAB, size);
        for i in 0..size {
            assert_eq!(*p.add(i), 0xAB);
        }
        c_free(p);

        // a second allocation of the same page length should still
        // succeed cleanly after the first was returned/coalesced.
        let q = c_malloc(size);
        assert!(!q.is_null());
        c_free(q);
    }
}

#[test]
fn remote_free_across_threads_then_realloc_on_origin() {
    unsafe {
        let p = c_malloc(128) as usize;
        let handle = thread::spawn(move || {
            c_free(p as *mut u8);
        });
        handle.join().unwrap();

        let q = c_malloc(128);
        assert!(!q.is_null());
        std::ptr::write_bytes(q, 0x5A, 128);
        c_free(q);
    }
}

#[test]
fn huge_allocation_round_trips_exact_size() {
    unsafe {
        let size = 10 * 4096 * 1024;
        let p = superalloc::malloc(size) as *mut u8;
        assert!(!p.is_null());
        std::ptr::write_bytes(p, 0x7, size);
        assert_eq!(*p.add(size - 1), 0x7);
        superalloc::free(p as *mut c_void);
    }
}

#[test]
fn orphaned_block_is_adopted_by_freeing_thread() {
    unsafe {
        let (tx, rx) = std::sync::mpsc::channel();
        let producer = thread::spawn(move || {
            let p = c_malloc(32) as usize;
            tx.send(p).unwrap();
            // thread exits without freeing; tlh_clear runs on drop.
        });
        let ptr = rx.recv().unwrap();
        producer.join().unwrap();

        c_free(ptr as *mut u8);

        // allocator should remain usable afterwards.
        let q = c_malloc(32);
        assert!(!q.is_null());
        c_free(q);
    }
}

#[test]
fn calloc_zeroes_memory() {
    unsafe {
        let ptr = superalloc::calloc(16, 8) as *mut u8;
        assert!(!ptr.is_null());
        for i in 0..128 {
            assert_eq!(*ptr.add(i), 0);
        }
        superalloc::free(ptr as *mut c_void);
    }
}

#[test]
fn realloc_grows_and_preserves_prefix() {
    unsafe {
        let p = c_malloc(16);
        std::ptr::write_bytes(p, 0x11, 16);
        let q = superalloc::realloc(p as *mut c_void, 512) as *mut u8;
        assert!(!q.is_null());
        for i in 0..16 {
            assert_eq!(*q.add(i), 0x11);
        }
        c_free(q);
    }
}

#[test]
fn realloc_to_zero_frees_and_returns_null() {
    unsafe {
        let p = c_malloc(64);
        let q = superalloc::realloc(p as *mut c_void, 0);
        assert!(q.is_null());
    }
}

#[test]
fn posix_memalign_honours_power_of_two_alignment() {
    unsafe {
        let mut out: *mut c_void = std::ptr::null_mut();
        let rc = superalloc::posix_memalign(&mut out, 4096, 100);
        assert_eq!(rc, 0);
        assert!(!out.is_null());
        assert_eq!(out as usize % 4096, 0);
        superalloc::free(out);
    }
}

#[test]
fn posix_memalign_rejects_non_power_of_two() {
    unsafe {
        let mut out: *mut c_void = std::ptr::null_mut();
        let rc = superalloc::posix_memalign(&mut out, 100, 64);
        assert_eq!(rc, libc::EINVAL);
    }
}

#[test]
fn global_alloc_impl_round_trips_through_layout() {
    unsafe {
        let alloc = Superalloc;
        let layout = Layout::from_size_align(64, 8).unwrap();
        let ptr = alloc.alloc(layout);
        assert!(!ptr.is_null());
        alloc.dealloc(ptr, layout);
    }
}

#[test]
fn concurrent_allocation_from_many_threads_is_consistent() {
    let handles: Vec<_> = (0..8)
        .map(|_| {
            thread::spawn(|| unsafe {
                let mut ptrs = Vec::new();
                for _ in 0..200 {
                    let p = c_malloc(64);
                    assert!(!p.is_null());
                    ptrs.push(p);
                }
                for p in ptrs {
                    c_free(p);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
