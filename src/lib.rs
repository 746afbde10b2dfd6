//! A lock-free, multithreaded superpage allocator: a drop-in `malloc`
//! replacement built from thread-local size-class heaps, superpages shared
//! across threads via CAS'd ownership, and a radix-tree PageMap tying
//! arbitrary pointers back to their owning metadata.
//!
//! `Superalloc` implements [`GlobalAlloc`] for embedding as the process
//! allocator; the `extern "C"` functions below additionally expose the
//! traditional libc surface for callers that link against this crate
//! directly.

use core::alloc::{GlobalAlloc, Layout};
use std::os::raw::c_void;

mod atomic;
mod cache;
mod hazard;
mod heap;
mod huge;
mod options;
mod os;
mod pageblock;
mod pagemap;
mod sizemap;
mod stats;
mod superpage;
mod thread;

use heap::Tlh;
use pageblock::{Pbh, NUM_PAGE_CLASSES, SIZECLASS_LARGE};
use sizemap::PAGE_SIZE;

/// Largest request this crate considers a "large" page-block allocation;
/// above this, `huge_malloc` takes over (spec 4.6/4.7).
const MAX_LARGE_PAGES: usize = NUM_PAGE_CLASSES;

fn size_to_pages(size: usize) -> usize {
    (size + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize
}

/// Core allocation routine shared by `GlobalAlloc::alloc` and `malloc`
/// (spec 4.5/4.6/4.7, 5-way size dispatch).
unsafe fn do_malloc(size: usize) -> *mut u8 {
    if size == 0 {
        return std::ptr::null_mut();
    }

    let ptr = if size as u32 <= sizemap::MAX_SIZE {
        let cl = sizemap::get_sizeclass(size as u32);
        thread::with_tlh(|tlh| heap::small_malloc(tlh, cl))
    } else {
        let pages = size_to_pages(size);
        if pages <= MAX_LARGE_PAGES {
            large_malloc(pages)
        } else {
            huge::huge_malloc(size, sizemap::ALIGNMENT as usize)
        }
    };
    if !ptr.is_null() {
        stats::stat_increase(&stats::global().malloc, size as i64);
    }
    ptr
}

/// Large-allocation path: try the page-block cache first, then fall back
/// to `pb_alloc` (spec 4.6).
unsafe fn large_malloc(pages: usize) -> *mut u8 {
    let len = pages as u8;
    if options::get().page_block_cache {
        let cached = thread::with_tlh(|tlh| tlh.pb_cache.take(len));
        if let Some(ptr) = cached {
            return ptr;
        }
    }

    let mut remote_chain: Option<*mut u8> = None;
    let ptr = thread::with_tlh(|tlh| {
        if options::get().page_block_cache {
            if let Some((evicted, evicted_len)) = tlh.pb_cache.evict_for(len) {
                remote_chain = free_local_evicted_chain(tlh, evicted, evicted_len);
            }
        }
        let pbh = pageblock::pb_alloc(tlh, len);
        (*pbh).sizeclass = SIZECLASS_LARGE;
        (*pbh).status = pageblock::PBH_IN_USE;
        (*pbh).base_ptr()
    });

    // entries owned by another thread are handed to `pb_remote_free` only
    // once this thread's own `with_tlh` borrow above is released:
    // `pb_remote_free` may adopt a dead superpage via `with_tlh` itself,
    // which would double-borrow if run while that borrow is still held.
    if let Some(chain) = remote_chain {
        free_remote_evicted_chain(chain);
    }

    ptr
}

/// Frees every locally-owned entry of an evicted page-block-cache chain
/// immediately via `pb_free`; collects the rest (same in-band linkage
/// used by the chain itself) for `free_remote_evicted_chain`.
unsafe fn free_local_evicted_chain(tlh: &mut Tlh, mut chain: *mut u8, length: u8) -> Option<*mut u8> {
    let mut remote_head: *mut u8 = std::ptr::null_mut();
    while !chain.is_null() {
        let next = *(chain as *mut *mut u8);
        let page_id = (chain as usize) >> 12;
        let pbh = pagemap::global().get(page_id) as *mut Pbh;
        debug_assert_eq!((*pbh).length, length);
        let header_base = pageblock::header_base_of(pbh);
        let sph = header_base as *mut superpage::Sph;
        let (owner, _) = superpage::omark_load(sph);
        if owner == tlh.thread_id {
            pageblock::pb_free(tlh, pbh);
        } else {
            *(chain as *mut *mut u8) = remote_head;
            remote_head = chain;
        }
        chain = next;
    }
    if remote_head.is_null() {
        None
    } else {
        Some(remote_head)
    }
}

unsafe fn free_remote_evicted_chain(mut chain: *mut u8) {
    while !chain.is_null() {
        let next = *(chain as *mut *mut u8);
        let page_id = (chain as usize) >> 12;
        let pbh = pagemap::global().get(page_id) as *mut Pbh;
        pageblock::pb_remote_free(pbh);
        chain = next;
    }
}

/// Core free routine, classifying `ptr` via the PageMap (spec 4.5-4.7).
unsafe fn do_free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let page_id = (ptr as usize) >> 12;
    let val = pagemap::global().get_checked(page_id);
    if val == 0 {
        log::warn!("free: {:p} is not a live allocation", ptr);
        return;
    }
    if pagemap::is_huge_tag(val) {
        let size = pagemap::huge_tag_size(val);
        huge::huge_free(ptr, size);
        stats::stat_decrease(&stats::global().malloc, size as i64);
        return;
    }

    let pbh = val as *mut Pbh;
    let size = if (*pbh).sizeclass == SIZECLASS_LARGE {
        (*pbh).byte_len()
    } else {
        sizemap::get_size_for_class((*pbh).sizeclass as usize) as usize
    };
    if (*pbh).sizeclass == SIZECLASS_LARGE {
        free_large(ptr, pbh);
    } else {
        heap::small_free(ptr);
    }
    stats::stat_decrease(&stats::global().malloc, size as i64);
}

unsafe fn free_large(ptr: *mut u8, pbh: *mut Pbh) {
    let header_base = pageblock::header_base_of(pbh);
    let sph = header_base as *mut superpage::Sph;
    let (owner, _) = superpage::omark_load(sph);
    let length = (*pbh).length;

    if owner == thread::thread_id() {
        if options::get().page_block_cache && thread::with_tlh(|tlh| tlh.pb_cache.try_store(length, ptr)) {
            return;
        }
        thread::with_tlh(|tlh| pageblock::pb_free(tlh, pbh));
    } else {
        pageblock::pb_remote_free(pbh);
    }
}

/// Size in bytes a live pointer was allocated with, used by `realloc`
/// (spec 4.8).
unsafe fn allocated_size(ptr: *mut u8) -> usize {
    let page_id = (ptr as usize) >> 12;
    let val = pagemap::global().get(page_id);
    if pagemap::is_huge_tag(val) {
        return pagemap::huge_tag_size(val);
    }
    let pbh = val as *mut Pbh;
    if (*pbh).sizeclass == SIZECLASS_LARGE {
        (*pbh).byte_len()
    } else {
        sizemap::get_size_for_class((*pbh).sizeclass as usize) as usize
    }
}

unsafe fn do_realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return do_malloc(new_size);
    }
    if new_size == 0 {
        do_free(ptr);
        return std::ptr::null_mut();
    }

    let old_size = allocated_size(ptr);
    if new_size <= old_size && new_size >= old_size / 2 {
        return ptr;
    }

    let new_ptr = do_malloc(new_size);
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }
    let copy_len = old_size.min(new_size);
    std::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
    do_free(ptr);
    new_ptr
}

/// Align-aware allocation (spec 4.8 `aligned_alloc`). `alignment` must
/// already be a validated power of two.
unsafe fn do_aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    if size == 0 {
        return std::ptr::null_mut();
    }

    if size as u32 <= sizemap::MAX_SIZE {
        let natural_cl = sizemap::get_sizeclass(size as u32);
        if sizemap::get_alignment(size as u32) as usize >= alignment {
            return thread::with_tlh(|tlh| heap::small_malloc(tlh, natural_cl));
        }
        // round up to the next class whose block size is itself a
        // multiple of the requested alignment.
        for cl in natural_cl..sizemap::NUM_CLASSES {
            let block_size = sizemap::get_size_for_class(cl) as usize;
            if block_size % alignment == 0 {
                return thread::with_tlh(|tlh| heap::small_malloc(tlh, cl));
            }
        }
    }

    if alignment <= PAGE_SIZE as usize {
        let pages = size_to_pages(size);
        if pages <= MAX_LARGE_PAGES {
            return large_malloc(pages);
        }
    }

    // Superpage data pages only guarantee page alignment, and the page-
    // block layer cannot honour an alignment wider than a page; both the
    // within-page-count case above (when it falls through because
    // alignment's too wide) and the > MAX_LARGE_PAGES case land on the
    // huge path, whose `os::map_anonymous_aligned` already over-allocates
    // and trims to `alignment` (spec 4.8).
    huge::huge_malloc(size, alignment)
}

/// Process-wide allocator handle. Install with
/// `#[global_allocator] static ALLOC: superalloc::Superalloc = superalloc::Superalloc;`
pub struct Superalloc;

unsafe impl GlobalAlloc for Superalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size_for_alignment = layout.size().max(1).min(u32::MAX as usize) as u32;
        if layout.align() as u32 <= sizemap::get_alignment(size_for_alignment) {
            do_malloc(layout.size())
        } else {
            do_aligned_alloc(layout.align(), layout.size())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        do_free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        do_realloc(ptr, new_size)
    }
}

// ---- C ABI surface (spec 6, "Symbols") -------------------------------

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    do_malloc(size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    do_free(ptr as *mut u8)
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let total = match nmemb.checked_mul(size) {
        Some(t) => t,
        None => return std::ptr::null_mut(),
    };
    let ptr = do_malloc(total);
    if !ptr.is_null() {
        std::ptr::write_bytes(ptr, 0, total);
    }
    ptr as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    do_realloc(ptr as *mut u8, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut c_void, alignment: usize, size: usize) -> i32 {
    if alignment % std::mem::size_of::<usize>() != 0 || !alignment.is_power_of_two() {
        return libc::EINVAL;
    }
    let ptr = do_aligned_alloc(alignment, size);
    if size != 0 && ptr.is_null() {
        return libc::ENOMEM;
    }
    *memptr = ptr as *mut c_void;
    0
}

#[no_mangle]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    do_aligned_alloc(PAGE_SIZE as usize, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    if !alignment.is_power_of_two() {
        return std::ptr::null_mut();
    }
    do_aligned_alloc(alignment, size) as *mut c_void
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_round_trip_reuses_the_freed_slot() {
        unsafe {
            let p = do_malloc(8);
            assert!(!p.is_null());
            assert_eq!(p as usize % 8, 0);
            do_free(p);
            let q = do_malloc(8);
            assert_eq!(p, q);
            do_free(q);
        }
    }

    #[test]
    fn class_boundary_16_vs_17_distinct_classes() {
        unsafe {
            let a = do_malloc(16);
            let b = do_malloc(17);
            assert_ne!(sizemap::get_sizeclass(16), sizemap::get_sizeclass(17));
            do_free(a);
            do_free(b);
        }
    }

    #[test]
    fn huge_allocation_round_trips_through_global_pagemap() {
        unsafe {
            let size = 10 * 4096 * 1024;
            let p = do_malloc(size);
            assert!(!p.is_null());
            let page_id = (p as usize) >> 12;
            let val = pagemap::global().get(page_id);
            assert!(pagemap::is_huge_tag(val));
            assert_eq!(pagemap::huge_tag_size(val), size);
            do_free(p);
        }
    }

    #[test]
    fn realloc_of_null_behaves_like_malloc() {
        unsafe {
            let p = do_realloc(std::ptr::null_mut(), 64);
            assert!(!p.is_null());
            do_free(p);
        }
    }

    #[test]
    fn realloc_to_zero_frees_and_returns_null() {
        unsafe {
            let p = do_malloc(64);
            let q = do_realloc(p, 0);
            assert!(q.is_null());
        }
    }

    #[test]
    fn remote_free_across_threads_is_observed() {
        unsafe {
            let p = do_malloc(128) as usize;
            let handle = std::thread::spawn(move || {
                do_free(p as *mut u8);
            });
            handle.join().unwrap();
            let q = do_malloc(128);
            assert!(!q.is_null());
            do_free(q);
        }
    }
}
