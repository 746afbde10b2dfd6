//! Superpage headers (sph): ownership, sibling links, and remote-free
//! state for a superpage (spec 3 "Superpage header (sph)", 4.3).

use crate::hazard;
use crate::heap::Tlh;
use crate::os;
use crate::pagemap;
use crate::pageblock::{self, Pbh};
use crate::sizemap::PAGE_SIZE;
use crate::stats;
use crate::atomic::cas64;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

pub const SUPERPAGE_LEN: usize = 63;
pub const SPH_SIZE: usize = PAGE_SIZE as usize;
pub const SUPERPAGE_SIZE: usize = SUPERPAGE_LEN * PAGE_SIZE as usize;
pub const SUPERPAGE_TOTAL_SIZE: usize = SPH_SIZE + SUPERPAGE_SIZE;

pub const DEAD_OWNER: u32 = 0;
pub const FINISH_NONE: u32 = 0;
pub const DO_NOT_FINISH: u32 = 1;

#[repr(C, align(64))]
pub struct Sph {
    pub next: AtomicPtr<Sph>,
    pub prev: *mut Sph,
    pub start_page: usize,
    pub omark: AtomicU64,
    pub remote_pb_list: AtomicUsize,
    pub hazard_mark: AtomicUsize,
}

unsafe impl Send for Sph {}
unsafe impl Sync for Sph {}

fn pack_omark(owner_id: u32, finish_mark: u32) -> u64 {
    (owner_id as u64) | ((finish_mark as u64) << 32)
}

fn unpack_omark(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

pub fn omark_load(sph: *mut Sph) -> (u32, u32) {
    unpack_omark(unsafe { (*sph).omark.load(Ordering::Acquire) })
}

pub fn set_do_not_finish(sph: *mut Sph) {
    unsafe {
        loop {
            let cur = (*sph).omark.load(Ordering::Acquire);
            let (owner, _) = unpack_omark(cur);
            let new = pack_omark(owner, DO_NOT_FINISH);
            if cas64(&(*sph).omark, cur, new) {
                return;
            }
        }
    }
}

// ---- global free-superpage stack (Treiber stack; spec 9 open question 1
// recommends this over the source's splice-on-contention approach) ------

static FREE_HEAD: AtomicPtr<Sph> = AtomicPtr::new(ptr::null_mut());
static FREE_LEN: AtomicUsize = AtomicUsize::new(0);

fn free_sp_threshold() -> usize {
    crate::options::get().free_sp_multiplier * crate::thread::live_thread_count().max(1)
}

fn push_global_free(sph: *mut Sph) {
    unsafe {
        loop {
            let head = FREE_HEAD.load(Ordering::Acquire);
            (*sph).next.store(head, Ordering::Release);
            if FREE_HEAD
                .compare_exchange(head, sph, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                FREE_LEN.fetch_add(1, Ordering::AcqRel);
                return;
            }
        }
    }
}

fn pop_global_free() -> Option<*mut Sph> {
    loop {
        let head = FREE_HEAD.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if FREE_HEAD
            .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            FREE_LEN.fetch_sub(1, Ordering::AcqRel);
            return Some(head);
        }
    }
}

unsafe fn map_fresh_superpage() -> *mut Sph {
    let header_base = match os::map_anonymous(SUPERPAGE_TOTAL_SIZE) {
        Some(p) => p,
        None => {
            log::error!("superpage: mmap failed for {} bytes", SUPERPAGE_TOTAL_SIZE);
            std::process::abort();
        }
    };
    stats::stat_increase(&stats::global().mmap_calls, 1);
    stats::stat_increase(&stats::global().bytes_committed, SUPERPAGE_TOTAL_SIZE as i64);

    let data_start_page = (header_base as usize + SPH_SIZE) >> 12;
    pagemap::global().expand(data_start_page, SUPERPAGE_LEN);

    let sph = header_base as *mut Sph;
    ptr::write(
        sph,
        Sph {
            next: AtomicPtr::new(ptr::null_mut()),
            prev: ptr::null_mut(),
            start_page: data_start_page,
            omark: AtomicU64::new(0),
            remote_pb_list: AtomicUsize::new(0),
            hazard_mark: AtomicUsize::new(0),
        },
    );
    pageblock::init_whole_superpage_as_free(header_base, data_start_page);
    log::debug!("superpage: mapped fresh superpage at page {}", data_start_page);
    sph
}

unsafe fn unmap_superpage(sph: *mut Sph) {
    let header_base = sph as *mut u8;
    os::unmap_anonymous(header_base, SUPERPAGE_TOTAL_SIZE);
    stats::stat_increase(&stats::global().munmap_calls, 1);
    log::debug!("superpage: munmapped superpage at header {:p}", header_base);
}

unsafe fn sp_list_prepend(tlh: &mut Tlh, sph: *mut Sph) {
    (*sph).prev = ptr::null_mut();
    (*sph).next.store(tlh.sp_list, Ordering::Release);
    if !tlh.sp_list.is_null() {
        (*tlh.sp_list).prev = sph;
    }
    tlh.sp_list = sph;
}

unsafe fn sp_list_remove(tlh: &mut Tlh, sph: *mut Sph) {
    let prev = (*sph).prev;
    let next = (*sph).next.load(Ordering::Acquire);
    if !prev.is_null() {
        (*prev).next.store(next, Ordering::Release);
    } else {
        tlh.sp_list = next;
    }
    if !next.is_null() {
        (*next).prev = prev;
    }
    (*sph).prev = ptr::null_mut();
    (*sph).next.store(ptr::null_mut(), Ordering::Release);
}

/// Move `sph` to the tail of the thread's owned-superpage list, so the
/// next `pb_alloc` miss drains a different superpage's remote list
/// (spec 4.4, step 2).
pub unsafe fn rotate_sp_list_to_tail(tlh: &mut Tlh, sph: *mut Sph) {
    if tlh.sp_list.is_null() || (*tlh.sp_list).next.load(Ordering::Acquire).is_null() {
        return;
    }
    sp_list_remove(tlh, sph);
    let mut tail = tlh.sp_list;
    while !(*tail).next.load(Ordering::Acquire).is_null() {
        tail = (*tail).next.load(Ordering::Acquire);
    }
    (*sph).prev = tail;
    (*sph).next.store(ptr::null_mut(), Ordering::Release);
    (*tail).next.store(sph, Ordering::Release);
}

/// Allocate a superpage: pop from the global free list, or mmap a fresh
/// one from the OS. Claims ownership for `tid` and prepends to the
/// thread's `sp_list` (spec 4.3 "Allocation").
pub unsafe fn sph_alloc(tid: u32, tlh: &mut Tlh) -> *mut Sph {
    let sph = match pop_global_free() {
        Some(sph) => {
            stats::stat_decrease(&stats::global().superpages_abandoned, 1);
            sph
        }
        None => map_fresh_superpage(),
    };
    (*sph).omark.store(pack_omark(tid, FINISH_NONE), Ordering::Release);
    (*sph).hazard_mark.store(0, Ordering::Release);
    sp_list_prepend(tlh, sph);
    stats::stat_increase(&stats::global().superpages, 1);
    sph
}

/// Release an emptied superpage back to the free list or the OS
/// (spec 4.3 "Release").
pub unsafe fn sph_release(tlh: &mut Tlh, sph: *mut Sph) {
    sp_list_remove(tlh, sph);
    pagemap::global().set_range((*sph).start_page, SUPERPAGE_LEN, 0);

    let was_marked = (*sph).hazard_mark.load(Ordering::Acquire) != 0;
    let protected = was_marked && hazard::scan_hazard_pointers(sph);

    if protected {
        push_global_free(sph);
        return;
    }
    (*sph).hazard_mark.store(0, Ordering::Release);

    if FREE_LEN.load(Ordering::Acquire) < free_sp_threshold() {
        push_global_free(sph);
    } else {
        unmap_superpage(sph);
    }
    stats::stat_decrease(&stats::global().superpages, 1);
}

/// Push a remotely-freed large page block onto `sph.remote_pb_list`
/// (spec 4.4 `pb_remote_free`). The block's first data word links to the
/// previous head, in-band, same trick as small-block remote free.
pub unsafe fn push_remote_pb(sph: *mut Sph, pbh: *mut Pbh) {
    loop {
        let head = (*sph).remote_pb_list.load(Ordering::Acquire);
        *((*pbh).base_ptr() as *mut usize) = head;
        let new_head = pbh as usize;
        if (*sph)
            .remote_pb_list
            .compare_exchange(head, new_head, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

/// Detach and reclaim `sph`'s remote page-block chain: mark each
/// ON_FREE_LIST and coalesce with neighbours (spec 4.3
/// "Remote-pb reclaim").
pub unsafe fn get_remote_pbs(tlh: &mut Tlh, sph: *mut Sph) {
    let head = (*sph).remote_pb_list.swap(0, Ordering::AcqRel);
    let mut cur = head;
    while cur != 0 {
        let pbh = cur as *mut Pbh;
        let next = *((*pbh).base_ptr() as *mut usize);
        (*pbh).status = pageblock::PBH_ON_FREE_LIST;
        pageblock::pb_free(tlh, pbh);
        cur = next;
    }
}

/// Attempt to CAS-claim a DEAD_OWNER superpage and rebuild the adopting
/// thread's bookkeeping from its in-band headers (spec 4.3 "Adoption").
/// Returns true on successful adoption.
pub unsafe fn take_superpage(sph: *mut Sph) -> bool {
    let cur = (*sph).omark.load(Ordering::Acquire);
    let (owner, _finish) = unpack_omark(cur);
    if owner != DEAD_OWNER {
        return false;
    }
    let tid = crate::thread::thread_id();
    let new = pack_omark(tid, FINISH_NONE);
    if !cas64(&(*sph).omark, cur, new) {
        return false;
    }

    crate::thread::with_tlh(|tlh| {
        get_remote_pbs(tlh, sph);

        let header_base = sph as *mut u8;
        for index in 1..=SUPERPAGE_LEN as u8 {
            let pbh = pageblock::pbh_at(header_base, index);
            if (*pbh).index != index || (*pbh).start_page == 0 {
                // slot not the start of a block (interior of a longer
                // run); skip, it is covered by its owning pbh.
                continue;
            }
            if (*pbh).status == pageblock::PBH_ON_FREE_LIST {
                pageblock::push_free(tlh, pbh);
            } else if (*pbh).sizeclass == pageblock::SIZECLASS_LARGE {
                // leave large, in-use page blocks untouched (caller
                // semantics, spec 4.3).
            } else {
                let cl = (*pbh).sizeclass as usize;
                let blocks = crate::sizemap::get_blocks_for_class(cl);
                let (_rhead, rcnt) = (*pbh).remote_head_cnt();
                let used = blocks - (*pbh).cnt_free - (*pbh).cnt_unused - rcnt;
                if used == 0 {
                    (*pbh).status = pageblock::PBH_ON_FREE_LIST;
                    pageblock::push_free(tlh, pbh);
                } else {
                    crate::heap::attach_partial_pbh(tlh, cl, pbh);
                }
            }
        }

        sp_list_prepend_pub(tlh, sph);
    });
    log::debug!("superpage: adopted by thread {}", tid);
    true
}

unsafe fn sp_list_prepend_pub(tlh: &mut Tlh, sph: *mut Sph) {
    sp_list_prepend(tlh, sph);
}

/// Thread-exit sweep: try to free or abandon every superpage the thread
/// still owns (spec 4.3 "Thread-exit sweep").
pub unsafe fn finish_superpages(tlh: &mut Tlh) {
    loop {
        let sph = tlh.sp_list;
        if sph.is_null() {
            break;
        }
        // try_to_free_superpage removes `sph` from `tlh.sp_list` whichever
        // way it resolves (released to global free list, or abandoned as
        // DEAD_OWNER for adoption), so the list always makes progress.
        sp_list_remove(tlh, sph);
        try_to_free_superpage(tlh, sph);
    }
}

/// Try to empty `sph` and return it to the global free list; if it still
/// holds in-use page blocks, mark it DEAD_OWNER for a later thread to
/// adopt. Assumes `sph` has already been unlinked from `tlh.sp_list`.
unsafe fn try_to_free_superpage(tlh: &mut Tlh, sph: *mut Sph) {
    loop {
        get_remote_pbs(tlh, sph);

        let header_base = sph as *mut u8;
        let mut in_use = 0usize;
        for index in 1..=SUPERPAGE_LEN as u8 {
            let pbh = pageblock::pbh_at(header_base, index);
            if (*pbh).index != index {
                continue;
            }
            if (*pbh).status != pageblock::PBH_ON_FREE_LIST {
                in_use += 1;
            }
        }

        if in_use == 0 {
            (*sph).hazard_mark.store(1, Ordering::Release);
            // sph is already detached from tlh.sp_list; release directly
            // to the global path instead of via sph_release (which
            // re-removes from the owner list).
            pagemap::global().set_range((*sph).start_page, SUPERPAGE_LEN, 0);
            let protected = hazard::scan_hazard_pointers(sph);
            if protected {
                push_global_free(sph);
            } else {
                (*sph).hazard_mark.store(0, Ordering::Release);
                if FREE_LEN.load(Ordering::Acquire) < free_sp_threshold() {
                    push_global_free(sph);
                } else {
                    unmap_superpage(sph);
                }
                stats::stat_decrease(&stats::global().superpages, 1);
            }
            return;
        }

        let cur = (*sph).omark.load(Ordering::Acquire);
        let (_owner, finish) = unpack_omark(cur);
        if finish == DO_NOT_FINISH {
            // a concurrent remote free vetoed retirement; retry the
            // sweep, it will observe the freshly published remote pbs.
            continue;
        }
        let new = pack_omark(DEAD_OWNER, FINISH_NONE);
        if cas64(&(*sph).omark, cur, new) {
            stats::stat_increase(&stats::global().superpages_abandoned, 1);
            return;
        }
        // lost the race (another remote free raced omark); retry.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omark_packs_owner_and_finish() {
        assert_eq!(unpack_omark(pack_omark(7, DO_NOT_FINISH)), (7, DO_NOT_FINISH));
    }

    #[test]
    fn sph_is_one_cache_line_header() {
        assert!(std::mem::size_of::<Sph>() <= pageblock::PBH_SLOT_BYTES);
    }
}
