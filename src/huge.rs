//! Huge allocations: anything too large for the page-block layer
//! (> `NUM_PAGE_CLASSES` pages) bypasses superpages entirely and goes
//! straight to the OS (spec 4.7). The PageMap entry for the allocation's
//! first page is tagged with `HUGE_MALLOC_MARK` so `free`/`realloc` can
//! recognize it without consulting a pbh.

use crate::os;
use crate::pagemap;
use crate::sizemap::PAGE_SIZE;
use crate::stats;

/// Allocate a huge, page-aligned (or `alignment`-aligned, if larger)
/// region and tag its first PageMap page with the real byte size
/// (spec 4.7 "huge_malloc").
pub unsafe fn huge_malloc(size: usize, alignment: usize) -> *mut u8 {
    let mapped = if alignment > os::os_page_size() {
        os::map_anonymous_aligned(size, alignment)
    } else {
        os::map_anonymous(size)
    };
    let ptr = match mapped {
        Some(p) => p,
        None => {
            log::warn!("huge_malloc: failed to map {} bytes", size);
            return std::ptr::null_mut();
        }
    };

    let page_id = (ptr as usize) >> 12;
    let n_pages = os::align_up_to_page(size) / PAGE_SIZE as usize;
    pagemap::global().expand(page_id, n_pages);
    pagemap::global().set(page_id, pagemap::huge_tag(size));

    stats::stat_increase(&stats::global().huge, 1);
    stats::stat_increase(&stats::global().mmap_calls, 1);
    stats::stat_increase(&stats::global().bytes_committed, os::align_up_to_page(size) as i64);
    log::debug!("huge_malloc: {} bytes at {:p}", size, ptr);
    ptr
}

/// Byte size a huge allocation was made with, or `None` if `ptr` is not
/// the base of a huge allocation.
pub fn huge_size(ptr: *mut u8) -> Option<usize> {
    let page_id = (ptr as usize) >> 12;
    let val = pagemap::global().get_checked(page_id);
    if val != 0 && pagemap::is_huge_tag(val) {
        Some(pagemap::huge_tag_size(val))
    } else {
        None
    }
}

/// Unmap a huge allocation and clear its PageMap entries (spec 4.7
/// "huge_free").
pub unsafe fn huge_free(ptr: *mut u8, size: usize) {
    let page_id = (ptr as usize) >> 12;
    let n_pages = os::align_up_to_page(size) / PAGE_SIZE as usize;
    pagemap::global().set_range(page_id, n_pages, 0);
    os::unmap_anonymous(ptr, size);
    stats::stat_decrease(&stats::global().huge, 1);
    stats::stat_increase(&stats::global().munmap_calls, 1);
    log::debug!("huge_free: {} bytes at {:p}", size, ptr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_huge_allocation() {
        let size = 10 * 1024 * 1024;
        unsafe {
            let ptr = huge_malloc(size, 8);
            assert!(!ptr.is_null());
            assert_eq!(huge_size(ptr), Some(size));
            huge_free(ptr, size);
            assert_eq!(huge_size(ptr), None);
        }
    }
}
