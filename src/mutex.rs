//! A mutex that lives inside a block of memory shared by unrelated
//! processes.
//!
//! The slab pool's header embeds a [`SharedMutex`] directly (it must
//! be `repr(C)`-stable and contain no process-local pointers), and
//! every public slab operation takes this lock for the duration of the
//! call. The lock is a plain atomic word: a short spin phase, then a
//! park on the futex queue keyed by the word's physical address, which
//! is exactly what makes it work across processes (the futex queue is
//! not scoped to one address space, unlike a `std::sync::Mutex` or a
//! `pthread_mutex_t` without `PTHREAD_PROCESS_SHARED`).
//!
//! Non-reentrant: a thread that already holds the lock and calls
//! `lock` again will deadlock against itself, exactly like a raw futex
//! mutex.

use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const LOCKED_WITH_WAITERS: u32 = 2;

const SPIN_ITERATIONS: u32 = 100;

/// A futex-backed mutual-exclusion lock, safe to place in shared
/// memory and lock from multiple processes.
///
/// `repr(transparent)` so that embedding it in a `repr(C)` pool header
/// reproduces exactly the single machine word a lock is expected to
/// occupy there.
#[repr(transparent)]
pub struct SharedMutex {
    state: AtomicU32,
}

impl SharedMutex {
    /// Returns a new, unlocked mutex. Suitable for placing at a fixed
    /// offset inside a freshly-mapped shared segment before any other
    /// process observes it.
    pub const fn new() -> Self {
        SharedMutex {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Acquires the lock, blocking the calling thread if necessary.
    ///
    /// Spins briefly before parking, so short critical sections (the
    /// common case for the slab allocator) avoid a syscall entirely.
    pub fn lock(&self) {
        for _ in 0..SPIN_ITERATIONS {
            if self
                .state
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }

        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        let mut state = self.state.swap(LOCKED_WITH_WAITERS, Ordering::Acquire);

        // `swap` above already claims the lock if it was unlocked; loop
        // only while we observe it held by someone else.
        while state != UNLOCKED {
            futex_wait(&self.state, LOCKED_WITH_WAITERS);
            state = self.state.swap(LOCKED_WITH_WAITERS, Ordering::Acquire);
        }
    }

    /// Releases the lock.
    ///
    /// # Safety contract
    ///
    /// Callers must only call this while holding the lock (i.e., after
    /// a matching `lock()`); this is a logical precondition, not a
    /// memory-safety one, since misuse just corrupts the lock's own
    /// state rather than other memory.
    pub fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == LOCKED_WITH_WAITERS {
            futex_wake_one(&self.state);
        }
    }
}

impl Default for SharedMutex {
    fn default() -> Self {
        SharedMutex::new()
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            std::ptr::null::<libc::timespec>(),
        );
    }
    // A spurious wakeup (EAGAIN, EINTR) just sends us back around the
    // caller's loop, which re-checks the word; nothing to do here.
}

#[cfg(target_os = "linux")]
fn futex_wake_one(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            1,
        );
    }
}

/// Fallback for platforms without a futex: pure spin-with-yield. This
/// is correct (mutual exclusion still holds) but not fair under heavy
/// contention; documented, not silent.
#[cfg(not(target_os = "linux"))]
fn futex_wait(word: &AtomicU32, expected: u32) {
    while word.load(Ordering::Relaxed) == expected {
        std::thread::yield_now();
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wake_one(_word: &AtomicU32) {}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn uncontended_round_trip() {
        let mutex = SharedMutex::new();
        mutex.lock();
        mutex.unlock();
        mutex.lock();
        mutex.unlock();
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        let mutex = Arc::new(SharedMutex::new());
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        mutex.lock();
                        // A non-atomic read-modify-write: if the lock
                        // is broken, increments get lost.
                        let before = counter.load(Ordering::Relaxed);
                        counter.store(before + 1, Ordering::Relaxed);
                        mutex.unlock();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }
}
