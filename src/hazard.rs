//! Hazard pointers: the only reclamation hazard in this allocator is a
//! superpage header being unmapped while another thread still holds a raw
//! pointer to it (spec 9, "Hazard pointers vs. epochs"). The global list is
//! append-only; records are reused across threads via an `active` flag
//! rather than being individually freed.

use crate::superpage::Sph;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

pub struct HazardPtr {
    next: AtomicPtr<HazardPtr>,
    node: AtomicPtr<Sph>,
    active: AtomicBool,
}

impl HazardPtr {
    fn new() -> Self {
        HazardPtr {
            next: AtomicPtr::new(ptr::null_mut()),
            node: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(true),
        }
    }

    pub fn publish(&self, sph: *mut Sph) {
        self.node.store(sph, Ordering::Release);
    }

    pub fn clear(&self) {
        self.node.store(ptr::null_mut(), Ordering::Release);
    }
}

static HEAD: AtomicPtr<HazardPtr> = AtomicPtr::new(ptr::null_mut());
static COUNT: AtomicUsize = AtomicUsize::new(0);

/// Acquire a hazard-pointer slot for the calling thread: reuse an inactive
/// record from the append-only list if one exists, otherwise allocate and
/// publish a fresh one (`hazard_ptr_alloc`).
pub fn hazard_ptr_alloc() -> *mut HazardPtr {
    let mut cur = HEAD.load(Ordering::Acquire);
    while !cur.is_null() {
        let rec = unsafe { &*cur };
        if !rec.active.load(Ordering::Acquire)
            && rec
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            rec.clear();
            return cur;
        }
        cur = rec.next.load(Ordering::Acquire);
    }

    let fresh = Box::into_raw(Box::new(HazardPtr::new()));
    loop {
        let head = HEAD.load(Ordering::Acquire);
        unsafe { (*fresh).next.store(head, Ordering::Release) };
        if HEAD
            .compare_exchange(head, fresh, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            COUNT.fetch_add(1, Ordering::Relaxed);
            return fresh;
        }
    }
}

/// Return a slot to the pool (called on thread exit).
pub fn hazard_ptr_free(rec: *mut HazardPtr) {
    if rec.is_null() {
        return;
    }
    unsafe {
        (*rec).clear();
        (*rec).active.store(false, Ordering::Release);
    }
}

/// True if some live hazard record currently protects `sph`.
pub fn scan_hazard_pointers(sph: *mut Sph) -> bool {
    let mut cur = HEAD.load(Ordering::Acquire);
    while !cur.is_null() {
        let rec = unsafe { &*cur };
        if rec.active.load(Ordering::Acquire) && rec.node.load(Ordering::Acquire) == sph {
            return true;
        }
        cur = rec.next.load(Ordering::Acquire);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_round_trip() {
        let rec = hazard_ptr_alloc();
        assert!(!rec.is_null());
        let fake: *mut Sph = 0x1000 as *mut Sph;
        unsafe { (*rec).publish(fake) };
        assert!(scan_hazard_pointers(fake));
        hazard_ptr_free(rec);
        assert!(!scan_hazard_pointers(fake));
    }

    #[test]
    fn freed_slot_is_reused() {
        let a = hazard_ptr_alloc();
        hazard_ptr_free(a);
        let b = hazard_ptr_alloc();
        assert_eq!(a, b);
        hazard_ptr_free(b);
    }
}
