use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// The cross-worker mutex gating listener registration. Only ever
/// try-acquired from the event loop; a worker that loses the race clamps
/// its poll timeout and retries next iteration, so no wait queue is
/// needed.
#[derive(Debug, Default)]
pub struct AcceptMutex {
    locked: AtomicBool,
}

impl AcceptMutex {
    pub fn new() -> AcceptMutex {
        AcceptMutex::default()
    }

    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// The only other cross-worker state: plain counters, updated with
/// fetch-and-add, read by nobody on the hot path.
#[derive(Debug, Default)]
pub struct SharedCounters {
    pub accepted: AtomicU64,
    pub handled: AtomicU64,
    pub requests: AtomicU64,
    pub active: AtomicI64,
    pub reading: AtomicI64,
    pub writing: AtomicI64,
    pub waiting: AtomicI64,
}

impl SharedCounters {
    pub fn incr(counter: &AtomicI64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicI64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }
}
