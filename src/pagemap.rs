//! Three-level radix tree mapping page id to metadata pointer (spec 4.2).
//!
//! Leaves store a `usize`: zero for unmapped, an odd value for a huge-alloc
//! tag (low bit set, remaining bits the byte size), or an aligned pbh
//! pointer for a page that belongs to a page block. Interior and leaf nodes
//! are allocated lazily via `mmap` and installed with a CAS; the losing
//! thread unmaps its spare (spec 4.2, "expand").

use crate::os;
use std::cell::Cell;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

pub const PMAP_BITS: u32 = 64 - 12;
pub const PMAP_INTERIOR_BIT: u32 = PMAP_BITS / 3;
pub const PMAP_INTERIOR_LEN: usize = 1 << PMAP_INTERIOR_BIT;
pub const PMAP_LEAF_BIT: u32 = PMAP_BITS - 2 * PMAP_INTERIOR_BIT;
pub const PMAP_LEAF_LEN: usize = 1 << PMAP_LEAF_BIT;

pub const HUGE_MALLOC_MARK: usize = 0x1;

struct Leaf {
    val: [AtomicUsize; PMAP_LEAF_LEN],
}

struct Node {
    leaf: [AtomicPtr<Leaf>; PMAP_INTERIOR_LEN],
}

pub struct PageMap {
    node: [AtomicPtr<Node>; PMAP_INTERIOR_LEN],
}

unsafe impl Sync for PageMap {}

fn split(page_id: usize) -> (usize, usize, usize) {
    let leaf_idx = page_id & (PMAP_LEAF_LEN - 1);
    let rest = page_id >> PMAP_LEAF_BIT;
    let interior_idx = rest & (PMAP_INTERIOR_LEN - 1);
    let node_idx = rest >> PMAP_INTERIOR_BIT;
    (node_idx, interior_idx, leaf_idx)
}

fn alloc_zeroed<T>() -> *mut T {
    let size = std::mem::size_of::<T>();
    match os::map_anonymous(size) {
        Some(ptr) => ptr as *mut T,
        None => {
            log::error!("pagemap: failed to map {} bytes for radix node", size);
            std::process::abort();
        }
    }
}

thread_local! {
    /// One-entry leaf cache keyed by the leaf's tag (page_id >> leaf-bit).
    /// Pure optimisation: correctness never depends on it (spec 9).
    static LEAF_CACHE: Cell<(usize, *mut Leaf)> = Cell::new((usize::MAX, std::ptr::null_mut()));
}

impl PageMap {
    pub const fn new() -> Self {
        // AtomicPtr::new(null) is not const-fn-friendly in an array repeat
        // expression pre-1.63 stable init syntax; build via const array of
        // nulls through a helper const.
        const NULL_NODE: AtomicPtr<Node> = AtomicPtr::new(std::ptr::null_mut());
        PageMap {
            node: [NULL_NODE; PMAP_INTERIOR_LEN],
        }
    }

    fn node_at(&self, node_idx: usize, create: bool) -> Option<*mut Node> {
        let slot = &self.node[node_idx];
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return Some(existing);
        }
        if !create {
            return None;
        }
        let fresh: *mut Node = alloc_zeroed();
        match slot.compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Some(fresh),
            Err(winner) => {
                // lost the race: unmap our spare
                os::unmap_anonymous(fresh as *mut u8, std::mem::size_of::<Node>());
                Some(winner)
            }
        }
    }

    fn leaf_at(&self, node_idx: usize, interior_idx: usize, create: bool) -> Option<*mut Leaf> {
        let node = self.node_at(node_idx, create)?;
        let slot = unsafe { &(*node).leaf[interior_idx] };
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return Some(existing);
        }
        if !create {
            return None;
        }
        let fresh: *mut Leaf = alloc_zeroed();
        match slot.compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Some(fresh),
            Err(winner) => {
                os::unmap_anonymous(fresh as *mut u8, std::mem::size_of::<Leaf>());
                Some(winner)
            }
        }
    }

    /// Ensure interior and leaf nodes exist for `[start, start+n)`.
    pub fn expand(&self, start: usize, n: usize) {
        if n == 0 {
            return;
        }
        let mut page = start;
        let end = start + n;
        while page < end {
            let (node_idx, interior_idx, leaf_idx) = split(page);
            self.leaf_at(node_idx, interior_idx, true);
            // advance to the first page id of the next leaf
            let consumed = PMAP_LEAF_LEN - leaf_idx;
            page += consumed.min(end - page);
        }
    }

    /// Fetch the leaf covering `page_id`, using and refreshing the
    /// thread-local one-entry cache.
    fn leaf_for(&self, page_id: usize, create: bool) -> Option<*mut Leaf> {
        let (node_idx, interior_idx, _) = split(page_id);
        let tag = (node_idx << PMAP_INTERIOR_BIT) | interior_idx;
        let cached = LEAF_CACHE.with(|c| c.get());
        if cached.0 == tag && !cached.1.is_null() {
            return Some(cached.1);
        }
        let leaf = self.leaf_at(node_idx, interior_idx, create)?;
        LEAF_CACHE.with(|c| c.set((tag, leaf)));
        Some(leaf)
    }

    /// Assumes the path exists.
    pub fn get(&self, page_id: usize) -> usize {
        let (_, _, leaf_idx) = split(page_id);
        let leaf = self
            .leaf_for(page_id, true)
            .expect("pagemap.get on unexpanded range");
        unsafe { (*leaf).val[leaf_idx].load(Ordering::Acquire) }
    }

    /// Tolerates a missing path; returns 0 (NULL) then.
    pub fn get_checked(&self, page_id: usize) -> usize {
        let (_, _, leaf_idx) = split(page_id);
        match self.leaf_for(page_id, false) {
            Some(leaf) => unsafe { (*leaf).val[leaf_idx].load(Ordering::Acquire) },
            None => 0,
        }
    }

    /// Assumes the path exists.
    pub fn set(&self, page_id: usize, val: usize) {
        let (_, _, leaf_idx) = split(page_id);
        let leaf = self
            .leaf_for(page_id, true)
            .expect("pagemap.set on unexpanded range");
        unsafe { (*leaf).val[leaf_idx].store(val, Ordering::Release) };
    }

    pub fn set_range(&self, start: usize, len: usize, val: usize) {
        for page in start..start + len {
            self.set(page, val);
        }
    }
}

static GLOBAL_PAGEMAP: PageMap = PageMap::new();

/// The process-wide radix tree. There is exactly one; every thread shares
/// it (spec 3, "PageMap nodes ... are process-wide, lock-free").
pub fn global() -> &'static PageMap {
    &GLOBAL_PAGEMAP
}

/// True if a PageMap value is a huge-allocation tag rather than a pbh
/// pointer.
#[inline]
pub fn is_huge_tag(val: usize) -> bool {
    val & HUGE_MALLOC_MARK != 0
}

#[inline]
pub fn huge_tag(byte_size: usize) -> usize {
    (byte_size << 1) | HUGE_MALLOC_MARK
}

#[inline]
pub fn huge_tag_size(val: usize) -> usize {
    val >> 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_page() {
        let map = PageMap::new();
        map.expand(10, 1);
        map.set(10, 0xdead_beef);
        assert_eq!(map.get(10), 0xdead_beef);
    }

    #[test]
    fn get_checked_returns_zero_for_unmapped_range() {
        let map = PageMap::new();
        assert_eq!(map.get_checked(999_999), 0);
    }

    #[test]
    fn set_range_covers_every_page() {
        let map = PageMap::new();
        map.expand(0, 200);
        map.set_range(5, 10, 0x1000);
        for p in 5..15 {
            assert_eq!(map.get(p), 0x1000);
        }
        assert_eq!(map.get(15), 0);
    }

    #[test]
    fn huge_tag_round_trips_size() {
        let v = huge_tag(10 * 4096 * 1024);
        assert!(is_huge_tag(v));
        assert_eq!(huge_tag_size(v), 10 * 4096 * 1024);
    }
}
