//! Anonymous memory primitives: map, unmap, advise (spec 6, "OS primitives
//! required"). Unix path goes through `libc`; the Windows path mirrors it
//! with `VirtualAlloc`/`VirtualFree`. Modeled on the teacher's `os.rs`
//! (over-allocate-and-trim for alignment, `log::warn!` + `errno` on
//! failure) but trimmed to the primitives this allocator's superpage layer
//! actually calls.

use crate::sizemap::PAGE_SIZE;

pub fn os_page_size() -> usize {
    PAGE_SIZE as usize
}

/// Round `size` up to a multiple of the page size.
#[inline]
pub fn align_up_to_page(size: usize) -> usize {
    let page = os_page_size();
    (size + page - 1) & !(page - 1)
}

#[cfg(unix)]
mod imp {
    use super::*;
    use libc::{c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

    pub fn map(size: usize) -> Option<*mut u8> {
        if size == 0 {
            return None;
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            log::warn!("mmap({} bytes) failed: {}", size, errno::errno());
            None
        } else {
            Some(ptr as *mut u8)
        }
    }

    /// Map `size` bytes aligned to `alignment` by over-allocating and
    /// trimming the unaligned head/tail (teacher's `os_mem_alloc_aligned`
    /// strategy).
    pub fn map_aligned(size: usize, alignment: usize) -> Option<*mut u8> {
        debug_assert!(alignment.is_power_of_two());
        if alignment <= os_page_size() {
            return map(size);
        }
        let over = size + alignment;
        let raw = map(over)? as usize;
        let aligned = (raw + alignment - 1) & !(alignment - 1);
        let head = aligned - raw;
        let tail_start = aligned + size;
        let tail = (raw + over) - tail_start;
        if head > 0 {
            unsafe { libc::munmap(raw as *mut c_void, head) };
        }
        if tail > 0 {
            unsafe { libc::munmap(tail_start as *mut c_void, tail) };
        }
        Some(aligned as *mut u8)
    }

    pub fn unmap(ptr: *mut u8, size: usize) -> bool {
        if size == 0 {
            return true;
        }
        let rc = unsafe { libc::munmap(ptr as *mut c_void, size) };
        if rc != 0 {
            log::warn!("munmap({:p}, {}) failed: {}", ptr, size, errno::errno());
            false
        } else {
            true
        }
    }

    pub fn advise_dontneed(ptr: *mut u8, size: usize) -> bool {
        if size == 0 {
            return true;
        }
        let rc = unsafe { libc::madvise(ptr as *mut c_void, size, libc::MADV_DONTNEED) };
        if rc != 0 {
            log::warn!("madvise(DONTNEED) failed: {}", errno::errno());
            false
        } else {
            true
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

    pub fn map(size: usize) -> Option<*mut u8> {
        if size == 0 {
            return None;
        }
        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            log::warn!("VirtualAlloc({} bytes) failed", size);
            None
        } else {
            Some(ptr as *mut u8)
        }
    }

    pub fn map_aligned(size: usize, alignment: usize) -> Option<*mut u8> {
        // VirtualAlloc-returned addresses are allocation-granularity
        // aligned (64 KiB); for the rare larger alignment requests we
        // fall back to the same over-allocate strategy as unix, releasing
        // and retrying rather than trimming (VirtualFree cannot partially
        // free a VirtualAlloc region).
        if alignment <= 1 << 16 {
            return map(size);
        }
        loop {
            let over = map(size + alignment)?;
            unmap(over, size + alignment);
            let aligned = ((over as usize) + alignment - 1) & !(alignment - 1);
            let ptr = unsafe {
                VirtualAlloc(
                    aligned as *mut _,
                    size,
                    MEM_RESERVE | MEM_COMMIT,
                    PAGE_READWRITE,
                )
            };
            if !ptr.is_null() {
                return Some(ptr as *mut u8);
            }
        }
    }

    pub fn unmap(ptr: *mut u8, _size: usize) -> bool {
        let rc = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
        rc != 0
    }

    pub fn advise_dontneed(_ptr: *mut u8, _size: usize) -> bool {
        // No direct MADV_DONTNEED analogue without decommit/recommit
        // churn; treated as a no-op hint on this platform.
        true
    }
}

pub fn map_anonymous(size: usize) -> Option<*mut u8> {
    imp::map(align_up_to_page(size))
}

pub fn map_anonymous_aligned(size: usize, alignment: usize) -> Option<*mut u8> {
    imp::map_aligned(align_up_to_page(size), alignment)
}

pub fn unmap_anonymous(ptr: *mut u8, size: usize) -> bool {
    imp::unmap(ptr, align_up_to_page(size))
}

pub fn advise_dontneed(ptr: *mut u8, size: usize) -> bool {
    imp::advise_dontneed(ptr, align_up_to_page(size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_page_multiple() {
        assert_eq!(align_up_to_page(1), os_page_size());
        assert_eq!(align_up_to_page(os_page_size()), os_page_size());
        assert_eq!(align_up_to_page(os_page_size() + 1), 2 * os_page_size());
    }

    #[test]
    fn map_and_unmap_round_trip() {
        let ptr = map_anonymous(os_page_size()).expect("mmap should succeed");
        assert!(!ptr.is_null());
        assert!(unmap_anonymous(ptr, os_page_size()));
    }

    #[test]
    fn aligned_map_honors_alignment() {
        let alignment = 1 << 16;
        let ptr = map_anonymous_aligned(os_page_size(), alignment).expect("mmap should succeed");
        assert_eq!(ptr as usize % alignment, 0);
        unmap_anonymous(ptr, os_page_size());
    }
}
