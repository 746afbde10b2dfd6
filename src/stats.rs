//! Diagnostic counters. Spec section 1 places "runtime statistics and
//! timing counters" out of scope as an external collaborator; per
//! SPEC_FULL.md section 3 we keep basic atomic counts (the ambient stack is
//! carried regardless) but drop the original's wall-clock timers.

use core::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    pub const fn new() -> Self {
        StatCount {
            allocated: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            current: AtomicI64::new(0),
        }
    }
}

pub fn stat_increase(stat: &StatCount, amount: i64) {
    stat_update(stat, amount);
}

pub fn stat_decrease(stat: &StatCount, amount: i64) {
    stat_update(stat, -amount);
}

fn stat_update(stat: &StatCount, amount: i64) {
    if amount == 0 {
        return;
    }
    let current = stat.current.fetch_add(amount, Ordering::Relaxed) + amount;
    stat.peak.fetch_max(current, Ordering::Relaxed);
    if amount > 0 {
        stat.allocated.fetch_add(amount, Ordering::Relaxed);
    } else {
        stat.freed.fetch_add(-amount, Ordering::Relaxed);
    }
}

/// Process-wide counters. One instance, `Stats::global()`.
#[derive(Default)]
pub struct Stats {
    pub superpages: StatCount,
    pub superpages_abandoned: StatCount,
    pub page_blocks: StatCount,
    pub page_blocks_abandoned: StatCount,
    pub bytes_committed: StatCount,
    pub mmap_calls: StatCount,
    pub munmap_calls: StatCount,
    pub threads: StatCount,
    pub huge: StatCount,
    pub malloc: StatCount,
}

static GLOBAL: Stats = Stats {
    superpages: StatCount::new(),
    superpages_abandoned: StatCount::new(),
    page_blocks: StatCount::new(),
    page_blocks_abandoned: StatCount::new(),
    bytes_committed: StatCount::new(),
    mmap_calls: StatCount::new(),
    munmap_calls: StatCount::new(),
    threads: StatCount::new(),
    huge: StatCount::new(),
    malloc: StatCount::new(),
};

pub fn global() -> &'static Stats {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_current_and_peak() {
        let s = StatCount::new();
        stat_increase(&s, 10);
        stat_increase(&s, 5);
        stat_decrease(&s, 3);
        assert_eq!(s.current.load(Ordering::Relaxed), 12);
        assert_eq!(s.peak.load(Ordering::Relaxed), 15);
        assert_eq!(s.allocated.load(Ordering::Relaxed), 15);
        assert_eq!(s.freed.load(Ordering::Relaxed), 3);
    }
}
