//! Page blocks: contiguous runs of data pages inside a superpage, described
//! by an in-band page-block header (pbh) living at a fixed cache-line
//! aligned slot in the superpage's header page (spec 4.4, GLOSSARY "pbh").

use crate::heap::Tlh;
use crate::pagemap;
use crate::sizemap::{self, PAGE_SIZE};
use crate::superpage::{self, Sph, DEAD_OWNER, SUPERPAGE_LEN};
use std::sync::atomic::{AtomicU64, Ordering};

pub const PBH_SLOT_BYTES: usize = 64;
pub const NUM_PAGE_CLASSES: usize = 62;

pub const PBH_ON_FREE_LIST: u8 = 0;
pub const PBH_IN_USE: u8 = 1;
pub const PBH_AGAINST_FALSE_SHARING: u8 = 2;

/// Sentinel sizeclass marking a page block as "large" (spec 6).
pub const SIZECLASS_LARGE: u8 = sizemap::NUM_CLASSES as u8;

#[repr(C, align(64))]
pub struct Pbh {
    pub next: *mut Pbh,
    pub prev: *mut Pbh,
    pub start_page: usize,
    pub length: u8,
    pub index: u8,
    pub sizeclass: u8,
    pub status: u8,
    pub cnt_free: u32,
    pub cnt_unused: u32,
    pub free_list: usize,
    pub unallocated: usize,
    pub remote_list: AtomicU64,
}

unsafe impl Send for Pbh {}
unsafe impl Sync for Pbh {}

fn pack_remote(head: u32, cnt: u32) -> u64 {
    (head as u64) | ((cnt as u64) << 32)
}

fn unpack_remote(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

impl Pbh {
    fn init(&mut self, start_page: usize, length: u8, index: u8) {
        self.next = std::ptr::null_mut();
        self.prev = std::ptr::null_mut();
        self.start_page = start_page;
        self.length = length;
        self.index = index;
        self.sizeclass = SIZECLASS_LARGE;
        self.status = PBH_ON_FREE_LIST;
        self.cnt_free = 0;
        self.cnt_unused = 0;
        self.free_list = 0;
        self.unallocated = 0;
        self.remote_list = AtomicU64::new(0);
    }

    pub fn remote_head_cnt(&self) -> (u32, u32) {
        unpack_remote(self.remote_list.load(Ordering::Acquire))
    }

    /// Data base address of this page block (start of page 0 of the run).
    pub fn base_ptr(&self) -> *mut u8 {
        (self.start_page * PAGE_SIZE as usize) as *mut u8
    }

    pub fn byte_len(&self) -> usize {
        self.length as usize * PAGE_SIZE as usize
    }
}

/// pbh slot `index` (1-based) within the superpage whose header page base
/// is `header_base`.
pub unsafe fn pbh_at(header_base: *mut u8, index: u8) -> *mut Pbh {
    header_base.add(index as usize * PBH_SLOT_BYTES) as *mut Pbh
}

/// Find the header page base given any pbh pointer within it.
pub unsafe fn header_base_of(pbh: *mut Pbh) -> *mut u8 {
    (pbh as *mut u8).sub((*pbh).index as usize * PBH_SLOT_BYTES)
}

/// Set up the single pbh describing a brand new, entirely free superpage
/// (length == SUPERPAGE_LEN, index 1). Called by `superpage::sph_alloc`.
pub unsafe fn init_whole_superpage_as_free(header_base: *mut u8, data_start_page: usize) -> *mut Pbh {
    let pbh = pbh_at(header_base, 1);
    (*pbh).init(data_start_page, SUPERPAGE_LEN as u8, 1);
    pagemap::global().set_range(data_start_page, SUPERPAGE_LEN, pbh as usize);
    pbh
}

// ---- doubly linked list helpers (thread-local lists only) --------------

pub(crate) unsafe fn list_prepend(head: &mut *mut Pbh, node: *mut Pbh) {
    (*node).prev = std::ptr::null_mut();
    (*node).next = *head;
    if !(*head).is_null() {
        (**head).prev = node;
    }
    *head = node;
}

pub(crate) unsafe fn list_remove(head: &mut *mut Pbh, node: *mut Pbh) {
    let prev = (*node).prev;
    let next = (*node).next;
    if !prev.is_null() {
        (*prev).next = next;
    } else {
        *head = next;
    }
    if !next.is_null() {
        (*next).prev = prev;
    }
    (*node).next = std::ptr::null_mut();
    (*node).prev = std::ptr::null_mut();
}

unsafe fn list_pop(head: &mut *mut Pbh) -> Option<*mut Pbh> {
    let node = *head;
    if node.is_null() {
        None
    } else {
        list_remove(head, node);
        Some(node)
    }
}

// ---- free_pb_list (per-thread, per-length) ------------------------------

/// Push a free page block onto `tlh.free_pb_list[length-1]`.
pub unsafe fn push_free(tlh: &mut Tlh, pbh: *mut Pbh) {
    (*pbh).status = PBH_ON_FREE_LIST;
    let len = (*pbh).length as usize;
    list_prepend(&mut tlh.free_pb_list[len - 1], pbh);
}

unsafe fn remove_free(tlh: &mut Tlh, pbh: *mut Pbh) {
    let len = (*pbh).length as usize;
    list_remove(&mut tlh.free_pb_list[len - 1], pbh);
}

/// Allocate a page block of at least `len` pages from this thread's state
/// (spec 4.4 `pb_alloc`). Falls back to draining a remote list, then to a
/// fresh superpage.
pub unsafe fn pb_alloc(tlh: &mut Tlh, len: u8) -> *mut Pbh {
    if let Some(pbh) = find_and_take(tlh, len) {
        return pbh;
    }

    // (2) drain the first owned superpage's remote_pb_list and retry.
    if !tlh.sp_list.is_null() {
        superpage::get_remote_pbs(tlh, tlh.sp_list);
        superpage::rotate_sp_list_to_tail(tlh, tlh.sp_list);
        if let Some(pbh) = find_and_take(tlh, len) {
            return pbh;
        }
    }

    // (3) acquire a new superpage and split it.
    let sph = superpage::sph_alloc(tlh.thread_id, tlh);
    let header_base = sph as *mut u8;
    let whole = pbh_at(header_base, 1);
    split(tlh, whole, len)
}

unsafe fn find_and_take(tlh: &mut Tlh, len: u8) -> Option<*mut Pbh> {
    for l in (len as usize)..=SUPERPAGE_LEN {
        if tlh.free_pb_list[l - 1].is_null() {
            continue;
        }
        let pbh = list_pop(&mut tlh.free_pb_list[l - 1]).unwrap();
        (*pbh).status = PBH_IN_USE;
        if (*pbh).length > len {
            return Some(split(tlh, pbh, len));
        }
        return Some(pbh);
    }
    None
}

/// Shorten `pbh` to `len` pages, create a new free pbh for the remainder,
/// and push the remainder onto the appropriate free list (spec 4.4
/// "Split").
unsafe fn split(tlh: &mut Tlh, pbh: *mut Pbh, len: u8) -> *mut Pbh {
    let total_len = (*pbh).length;
    debug_assert!(total_len >= len);
    (*pbh).status = PBH_IN_USE;
    if total_len == len {
        return pbh;
    }
    let header_base = header_base_of(pbh);
    let rest_start = (*pbh).start_page + len as usize;
    let rest_len = total_len - len;
    let rest_index = (*pbh).index + len;
    (*pbh).length = len;

    let rest = pbh_at(header_base, rest_index);
    (*rest).init(rest_start, rest_len, rest_index);
    pagemap::global().set_range(rest_start, rest_len as usize, rest as usize);
    push_free(tlh, rest);

    pagemap::global().set_range((*pbh).start_page, len as usize, pbh as usize);
    pbh
}

/// Coalesce a just-freed page block with ON_FREE_LIST neighbours, then
/// push the (possibly merged) block onto the owner's free list. If the
/// merged run spans the whole superpage, release it (spec 4.4
/// "Coalesce").
pub unsafe fn pb_free(tlh: &mut Tlh, mut pbh: *mut Pbh) {
    loop {
        let mut merged = false;

        if (*pbh).start_page > 0 {
            let left_val = pagemap::global().get_checked((*pbh).start_page - 1);
            if left_val != 0 && !pagemap::is_huge_tag(left_val) {
                let left = left_val as *mut Pbh;
                if (*left).status == PBH_ON_FREE_LIST && (*left).start_page + (*left).length as usize == (*pbh).start_page {
                    remove_free(tlh, left);
                    let new_len = (*left).length + (*pbh).length;
                    (*left).length = new_len;
                    pagemap::global().set_range((*left).start_page, new_len as usize, left as usize);
                    pbh = left;
                    merged = true;
                }
            }
        }

        let right_page = (*pbh).start_page + (*pbh).length as usize;
        let right_val = pagemap::global().get_checked(right_page);
        if right_val != 0 && !pagemap::is_huge_tag(right_val) {
            let right = right_val as *mut Pbh;
            if (*right).status == PBH_ON_FREE_LIST {
                remove_free(tlh, right);
                let new_len = (*pbh).length + (*right).length;
                (*pbh).length = new_len;
                pagemap::global().set_range((*pbh).start_page, new_len as usize, pbh as usize);
                merged = true;
            }
        }

        if !merged {
            break;
        }
        if (*pbh).length as usize == SUPERPAGE_LEN {
            break;
        }
    }

    if (*pbh).length as usize == SUPERPAGE_LEN {
        let header_base = header_base_of(pbh);
        let sph = header_base as *mut Sph;
        superpage::sph_release(tlh, sph);
        return;
    }
    push_free(tlh, pbh);
}

/// Remote free of a large page block not owned by the calling thread
/// (spec 4.4 `pb_remote_free`).
pub unsafe fn pb_remote_free(pbh: *mut Pbh) {
    let header_base = header_base_of(pbh);
    let sph = header_base as *mut Sph;
    let hp = crate::hazard::hazard_ptr_alloc();
    (*hp).publish(sph);

    loop {
        let (owner, _finish) = superpage::omark_load(sph);
        if owner == DEAD_OWNER {
            if superpage::take_superpage(sph) {
                crate::thread::with_tlh(|tlh| {
                    (*pbh).status = PBH_ON_FREE_LIST;
                    push_free(tlh, pbh);
                });
                break;
            } else {
                continue;
            }
        }

        superpage::push_remote_pb(sph, pbh);
        superpage::set_do_not_finish(sph);

        let (owner_after, _) = superpage::omark_load(sph);
        if owner_after == DEAD_OWNER {
            superpage::take_superpage(sph);
        }
        break;
    }

    (*hp).clear();
    crate::hazard::hazard_ptr_free(hp);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_word_packs_head_and_count() {
        let w = pack_remote(7, 3);
        assert_eq!(unpack_remote(w), (7, 3));
    }

    #[test]
    fn pbh_is_one_cache_line() {
        assert_eq!(std::mem::size_of::<Pbh>(), PBH_SLOT_BYTES);
    }
}
