//! Thread lifecycle. Spec section 1 places the thread-creation wrapper
//! (claiming an id, a hazard slot, zeroing the tlh before the user routine
//! runs) out of scope as an external collaborator — the reference
//! implementation gets this via `dlsym`-intercepted `pthread_create`
//! (`sf_malloc_wrapper.c`). Rust has no equivalent hook point worth
//! reaching for: `std::thread_local!` plus a `Drop` guard gives the same
//! guarantee (init on first use, teardown on thread exit) without
//! intercepting libc, so that is what this crate uses instead (see
//! DESIGN.md).

use crate::hazard;
use crate::heap::Tlh;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);
static LIVE_THREADS: AtomicUsize = AtomicUsize::new(0);

pub fn live_thread_count() -> usize {
    LIVE_THREADS.load(Ordering::Relaxed)
}

struct ThreadState {
    tlh: Tlh,
}

struct Finalizer;

impl Drop for Finalizer {
    fn drop(&mut self) {
        STATE.with(|cell| {
            if let Some(mut state) = cell.borrow_mut().take() {
                unsafe { crate::heap::tlh_clear(&mut state.tlh) };
                hazard::hazard_ptr_free(state.tlh.hazard_ptr);
                crate::stats::stat_decrease(&crate::stats::global().threads, 1);
                LIVE_THREADS.fetch_sub(1, Ordering::Relaxed);
                log::debug!("thread done: {}", state.tlh.thread_id);
            }
        });
    }
}

thread_local! {
    static STATE: RefCell<Option<ThreadState>> = RefCell::new(None);
    static FINALIZER: Finalizer = Finalizer;
}

fn ensure_init() {
    STATE.with(|cell| {
        if cell.borrow().is_some() {
            return;
        }
        FINALIZER.with(|_| {}); // force the finalizer to be registered too
        let tid = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let hp = hazard::hazard_ptr_alloc();
        let tlh = Tlh::new(tid, hp);
        *cell.borrow_mut() = Some(ThreadState { tlh });
        LIVE_THREADS.fetch_add(1, Ordering::Relaxed);
        crate::stats::stat_increase(&crate::stats::global().threads, 1);
        log::debug!("thread init: {}", tid);
    });
}

/// This thread's id, claiming one on first use (spec 5, "Thread
/// lifecycle"). Never `DEAD_OWNER` (0) for a live thread.
pub fn thread_id() -> u32 {
    ensure_init();
    STATE.with(|cell| cell.borrow().as_ref().unwrap().tlh.thread_id)
}

/// Run `f` against the calling thread's heap, initializing it on first
/// use.
pub fn with_tlh<R>(f: impl FnOnce(&mut Tlh) -> R) -> R {
    ensure_init();
    STATE.with(|cell| f(&mut cell.borrow_mut().as_mut().unwrap().tlh))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_is_nonzero_and_stable() {
        let a = thread_id();
        let b = thread_id();
        assert_eq!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn distinct_threads_get_distinct_ids() {
        let main_id = thread_id();
        let other_id = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(main_id, other_id);
    }
}
