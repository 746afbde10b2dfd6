//! Thread-local heap: per-class block lists, bump allocation, and the
//! small-allocation/small-free fast paths (spec 3 "Thread-local heap",
//! spec 4.5).

use crate::atomic::cas64;
use crate::cache::PageBlockCache;
use crate::hazard::HazardPtr;
use crate::pageblock::{self, Pbh};
use crate::pagemap;
use crate::sizemap;
use crate::superpage::{self, Sph, SUPERPAGE_LEN};
use std::ptr;

pub const NUM_PAGE_CLASSES: usize = pageblock::NUM_PAGE_CLASSES;

/// One free list per size class (spec 3, "Block list").
pub struct BlockList {
    pub free_blk_list: usize,
    pub ptr_to_unused: usize,
    pub cnt_unused: u32,
    pub cnt_free: u32,
    pub pbh_list: *mut Pbh,
}

impl Default for BlockList {
    fn default() -> Self {
        BlockList {
            free_blk_list: 0,
            ptr_to_unused: 0,
            cnt_unused: 0,
            cnt_free: 0,
            pbh_list: ptr::null_mut(),
        }
    }
}

/// Thread-local heap. Owned by exactly one live thread (spec 3, "tlh").
pub struct Tlh {
    pub blk_list: Vec<BlockList>,
    pub free_pb_list: [*mut Pbh; SUPERPAGE_LEN],
    pub sp_list: *mut Sph,
    pub hazard_ptr: *mut HazardPtr,
    pub pb_cache: PageBlockCache,
    pub thread_id: u32,
}

impl Tlh {
    pub fn new(thread_id: u32, hazard_ptr: *mut HazardPtr) -> Self {
        let mut blk_list = Vec::with_capacity(sizemap::NUM_CLASSES);
        for _ in 0..sizemap::NUM_CLASSES {
            blk_list.push(BlockList::default());
        }
        Tlh {
            blk_list,
            free_pb_list: [ptr::null_mut(); SUPERPAGE_LEN],
            sp_list: ptr::null_mut(),
            hazard_ptr,
            pb_cache: PageBlockCache::default(),
            thread_id,
        }
    }
}

unsafe fn next_of(blk: usize) -> usize {
    *(blk as *mut usize)
}

unsafe fn set_next(blk: usize, next: usize) {
    *(blk as *mut usize) = next;
}

/// Attach a partially-used pbh recovered during adoption to its class's
/// owned-pbh list (spec 4.3, "small size class, partially used").
pub unsafe fn attach_partial_pbh(tlh: &mut Tlh, cl: usize, pbh: *mut Pbh) {
    pageblock::list_prepend(&mut tlh.blk_list[cl].pbh_list, pbh);
}

/// Bump-allocate from a block list's unused chunk (spec 4.5, "Bump
/// allocation"). For block sizes at most half a cache line, pre-splits an
/// entire cache line's worth of blocks into `free_blk_list`.
unsafe fn bump_alloc(size: u32, b_list: &mut BlockList) -> *mut u8 {
    let ret = b_list.ptr_to_unused;
    debug_assert!(ret != 0);

    const CACHE_LINE: u32 = 64;
    if size * 2 <= CACHE_LINE {
        let per_line = (CACHE_LINE / size) as u32;
        let take = per_line.min(b_list.cnt_unused);
        let mut p = ret + size as usize;
        for _ in 1..take {
            set_next(p, p + size as usize);
            p += size as usize;
        }
        if take > 0 {
            // terminate the freshly split chunk and splice it in front of
            // whatever was already on the free list.
            set_next(ret + (take as usize - 1) * size as usize, b_list.free_blk_list);
            if take > 1 {
                b_list.free_blk_list = ret + size as usize;
                b_list.cnt_free += take - 1;
            }
        }
        b_list.ptr_to_unused = if b_list.cnt_unused > take {
            ret + take as usize * size as usize
        } else {
            0
        };
        b_list.cnt_unused = b_list.cnt_unused.saturating_sub(take);
    } else {
        b_list.ptr_to_unused = if b_list.cnt_unused > 1 { ret + size as usize } else { 0 };
        b_list.cnt_unused = b_list.cnt_unused.saturating_sub(1);
    }
    ret as *mut u8
}

/// Small allocation fast path (spec 4.5).
pub unsafe fn small_malloc(tlh: &mut Tlh, cl: usize) -> *mut u8 {
    let size = sizemap::get_size_for_class(cl);

    loop {
        let b_list = &mut tlh.blk_list[cl];

        // 1. free_blk_list
        if b_list.free_blk_list != 0 {
            let blk = b_list.free_blk_list;
            b_list.free_blk_list = next_of(blk);
            b_list.cnt_free -= 1;
            return blk as *mut u8;
        }

        // 2. bump pointer
        if b_list.ptr_to_unused != 0 {
            return bump_alloc(size, b_list);
        }

        // 3. head of pbh_list: migrate its free_list/unallocated in, if it
        // has any to give.
        let head = b_list.pbh_list;
        if !head.is_null() && ((*head).free_list != 0 || (*head).unallocated != 0) {
            let free_list = (*head).free_list;
            let unallocated = (*head).unallocated;
            let cnt_free = (*head).cnt_free;
            let cnt_unused = (*head).cnt_unused;
            (*head).free_list = 0;
            (*head).unallocated = 0;
            (*head).cnt_free = 0;
            (*head).cnt_unused = 0;

            b_list.free_blk_list = free_list;
            b_list.cnt_free = cnt_free;
            b_list.ptr_to_unused = unallocated;
            b_list.cnt_unused = cnt_unused;

            let (_rhead, rcnt) = (*head).remote_head_cnt();
            if rcnt == 0 {
                pageblock::list_remove(&mut b_list.pbh_list, head);
            }
            continue;
        }

        // 4. drain the head pbh's remote list. Seeds free_blk_list but
        // leaves the pbh on pbh_list (spec 4.5, step 4); only an empty
        // remote list with nothing else left advances past it.
        if !head.is_null() {
            let word = (*head).remote_list.swap(0, std::sync::atomic::Ordering::AcqRel);
            let rhead = word as u32;
            let rcnt = (word >> 32) as u32;
            if rcnt > 0 {
                let base = (*head).base_ptr() as usize;
                let first = base + rhead as usize * size as usize;
                b_list.free_blk_list = first;
                b_list.cnt_free += rcnt;
                continue;
            }
            // nothing to migrate and nothing remote: this pbh is spent.
            pageblock::list_remove(&mut b_list.pbh_list, head);
            continue;
        }

        // 5. allocate a new page block.
        let pages = sizemap::get_pages_for_class(cl);
        let pbh = pageblock::pb_alloc(tlh, pages as u8);
        (*pbh).sizeclass = cl as u8;
        (*pbh).status = if size % 64 != 0 {
            pageblock::PBH_AGAINST_FALSE_SHARING
        } else {
            pageblock::PBH_IN_USE
        };
        let blocks = sizemap::get_blocks_for_class(cl);
        pageblock::list_prepend(&mut tlh.blk_list[cl].pbh_list, pbh);
        tlh.blk_list[cl].ptr_to_unused = (*pbh).base_ptr() as usize;
        tlh.blk_list[cl].cnt_unused = blocks;
        continue;
    }
}

/// Free a small block, classified via the PageMap (spec 4.5, "Free small
/// block"). Ownership is resolved before the calling thread's own heap is
/// touched: a remote free may need to adopt a dead superpage via
/// `with_tlh` (spec 4.3 "Adoption"), which must not run while a `with_tlh`
/// borrow taken for this call is already held.
pub unsafe fn small_free(ptr_val: *mut u8) {
    let page_id = (ptr_val as usize) >> 12;
    let pbh = pagemap::global().get(page_id) as *mut Pbh;
    debug_assert!(!pbh.is_null());

    if (*pbh).status == pageblock::PBH_AGAINST_FALSE_SHARING {
        let header_base = pageblock::header_base_of(pbh);
        let sph = header_base as *mut Sph;
        let (owner, _) = superpage::omark_load(sph);
        if owner != crate::thread::thread_id() {
            remote_free_block(pbh, ptr_val, ptr_val, 1);
            return;
        }
    }

    crate::thread::with_tlh(|tlh| {
        let cl = (*pbh).sizeclass as usize;
        let b_list = &mut tlh.blk_list[cl];
        set_next(ptr_val as usize, b_list.free_blk_list);
        b_list.free_blk_list = ptr_val as usize;
        b_list.cnt_free += 1;

        let blocks = sizemap::get_blocks_for_class(cl);
        if b_list.cnt_free >= blocks {
            tlh_return_list(tlh, cl);
        }
    });
}

/// Remote free of one or more already-linked blocks belonging to `pbh`
/// (spec 4.4 "Remote-free of blocks").
pub unsafe fn remote_free_block(pbh: *mut Pbh, first: *mut u8, last: *mut u8, n: u32) {
    let header_base = pageblock::header_base_of(pbh);
    let sph = header_base as *mut Sph;
    let cl = (*pbh).sizeclass as usize;
    let size = sizemap::get_size_for_class(cl);
    let start_addr = (*pbh).base_ptr() as usize;
    let blk_idx = ((first as usize) - start_addr) / size as usize;

    let hp = crate::hazard::hazard_ptr_alloc();
    (*hp).publish(sph);

    loop {
        let (owner, _) = superpage::omark_load(sph);
        if owner == crate::superpage::DEAD_OWNER {
            if superpage::take_superpage(sph) {
                (*hp).clear();
                crate::hazard::hazard_ptr_free(hp);
                crate::thread::with_tlh(|tlh| {
                    set_next(last as usize, 0);
                    let b_list = &mut tlh.blk_list[cl];
                    set_next(last as usize, b_list.free_blk_list);
                    b_list.free_blk_list = first as usize;
                    b_list.cnt_free += n;
                });
                return;
            }
            continue;
        }

        let word = (*pbh).remote_list.load(std::sync::atomic::Ordering::Acquire);
        let top_head = word as u32;
        let top_cnt = (word >> 32) as u32;
        if top_cnt == 0 {
            set_next(last as usize, 0);
        } else {
            let head_addr = start_addr + size as usize * top_head as usize;
            set_next(last as usize, head_addr);
        }
        let new_word = (blk_idx as u64 & 0xFFFF_FFFF) | ((top_cnt as u64 + n as u64) << 32);
        if cas64(&(*pbh).remote_list, word, new_word) {
            superpage::set_do_not_finish(sph);
            break;
        }
    }

    let (owner_after, _) = superpage::omark_load(sph);
    if owner_after == crate::superpage::DEAD_OWNER {
        superpage::take_superpage(sph);
    }
    (*hp).clear();
    crate::hazard::hazard_ptr_free(hp);
}

/// Walk the free list, group runs by pbh, and return each run with one
/// `pbh_add_blocks`-equivalent call; a run that frees a pbh entirely is
/// promoted back to a free page block (spec 4.5).
pub unsafe fn tlh_return_list(tlh: &mut Tlh, cl: usize) {
    let mut cur = tlh.blk_list[cl].free_blk_list;
    tlh.blk_list[cl].free_blk_list = 0;
    tlh.blk_list[cl].cnt_free = 0;

    while cur != 0 {
        let next = next_of(cur);
        let page_id = cur >> 12;
        let pbh = pagemap::global().get(page_id) as *mut Pbh;
        (*pbh).cnt_free += 1;
        set_next(cur, (*pbh).free_list);
        (*pbh).free_list = cur;

        let blocks = sizemap::get_blocks_for_class(cl);
        let (_rhead, rcnt) = (*pbh).remote_head_cnt();
        if (*pbh).cnt_free + (*pbh).cnt_unused + rcnt >= blocks {
            pageblock::list_remove(&mut tlh.blk_list[cl].pbh_list, pbh);
            (*pbh).status = pageblock::PBH_ON_FREE_LIST;
            (*pbh).free_list = 0;
            (*pbh).cnt_free = 0;
            pageblock::pb_free(tlh, pbh);
        }
        cur = next;
    }
}

/// Return every remaining unused bump-chunk to its pbh (thread exit path).
pub unsafe fn tlh_return_unused(tlh: &mut Tlh, cl: usize) {
    let b_list = &mut tlh.blk_list[cl];
    if b_list.ptr_to_unused == 0 {
        return;
    }
    let page_id = b_list.ptr_to_unused >> 12;
    let pbh = pagemap::global().get(page_id) as *mut Pbh;
    (*pbh).cnt_unused += b_list.cnt_unused;
    (*pbh).unallocated = b_list.ptr_to_unused;
    b_list.ptr_to_unused = 0;
    b_list.cnt_unused = 0;
}

/// Return every owned-but-partially-used pbh still on `pbh_list` (thread
/// exit path): each becomes either fully free (promoted to a free page
/// block) or left for remote frees to finish via adoption.
pub unsafe fn tlh_return_pbhs(tlh: &mut Tlh, cl: usize) {
    while !tlh.blk_list[cl].pbh_list.is_null() {
        let pbh = tlh.blk_list[cl].pbh_list;
        pageblock::list_remove(&mut tlh.blk_list[cl].pbh_list, pbh);
        let blocks = sizemap::get_blocks_for_class(cl);
        let (_rhead, rcnt) = (*pbh).remote_head_cnt();
        if (*pbh).cnt_free + (*pbh).cnt_unused + rcnt >= blocks {
            (*pbh).status = pageblock::PBH_ON_FREE_LIST;
            pageblock::pb_free(tlh, pbh);
        }
        // otherwise leave it in place; the superpage sweep below will
        // either keep it (still in use) or an adopting thread will
        // rebuild bookkeeping for it.
    }
}

/// Flush every per-class list, then sweep owned superpages
/// (spec 5, "Thread lifecycle").
pub unsafe fn tlh_clear(tlh: &mut Tlh) {
    crate::cache::drain(tlh);
    for cl in 0..sizemap::NUM_CLASSES {
        if tlh.blk_list[cl].free_blk_list != 0 {
            tlh_return_list(tlh, cl);
        }
        if tlh.blk_list[cl].ptr_to_unused != 0 {
            tlh_return_unused(tlh, cl);
        }
        if !tlh.blk_list[cl].pbh_list.is_null() {
            tlh_return_pbhs(tlh, cl);
        }
    }
    superpage::finish_superpages(tlh);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tlh_has_empty_lists() {
        let tlh = Tlh::new(1, ptr::null_mut());
        assert_eq!(tlh.blk_list.len(), sizemap::NUM_CLASSES);
        for l in tlh.free_pb_list.iter() {
            assert!(l.is_null());
        }
        assert!(tlh.sp_list.is_null());
    }
}
