//! Mutex and condition variable that live inside a shared segment.
//!
//! Both primitives are a single `AtomicU32` word, so they can be embedded in
//! any `repr(C)` structure placed in shared memory; a zeroed word is the
//! valid initial state for both. Blocking goes through the futex syscall
//! *without* `FUTEX_PRIVATE_FLAG`, so waiters and wakers may live in
//! different processes mapping the same segment.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Cross-process mutex embedded in a shared segment.
///
/// Three-state futex protocol: 0 = unlocked, 1 = locked, 2 = locked with
/// waiters. Not robust: a holder that dies keeps the mutex locked forever,
/// which is why every port-level wait is bounded and backed by the watchdog.
#[repr(C)]
pub struct IpcMutex {
    state: AtomicU32,
}

/// Lock guard for [`IpcMutex`]; unlocks on drop.
pub struct IpcMutexGuard<'a> {
    mutex: &'a IpcMutex,
}

impl IpcMutex {
    /// Acquires the mutex, blocking without bound.
    pub fn lock(&self) -> IpcMutexGuard<'_> {
        self.lock_raw();
        IpcMutexGuard { mutex: self }
    }

    fn lock_raw(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended(None);
        }
    }

    /// Acquires the mutex, giving up after `timeout`.
    ///
    /// Returns `None` on timeout. The caller decides what an unobtainable
    /// mutex means; the watchdog treats it as a dead peer.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<IpcMutexGuard<'_>> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            || self.lock_contended(Some(Instant::now() + timeout))
        {
            Some(IpcMutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Contended slow path. Returns false only when `deadline` elapses.
    fn lock_contended(&self, deadline: Option<Instant>) -> bool {
        loop {
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return true;
            }
            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            futex_wait(&self.state, CONTENDED, timeout);
        }
    }

    fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake(&self.state, 1);
        }
    }
}

impl Drop for IpcMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Cross-process condition variable embedded in a shared segment.
///
/// A sequence word bumped by every notification. Waiters snapshot the word
/// under the mutex, release the mutex, and sleep until the word changes or
/// the timeout elapses; spurious wakeups are absorbed by the predicate loop.
#[repr(C)]
pub struct IpcCondvar {
    seq: AtomicU32,
}

impl IpcCondvar {
    /// Waits until `predicate` is true or `timeout` elapses.
    ///
    /// The predicate is always evaluated with the mutex held. Returns the
    /// reacquired guard and whether the predicate was satisfied on exit.
    pub fn wait_timeout_while<'a>(
        &self,
        mut guard: IpcMutexGuard<'a>,
        timeout: Duration,
        mut predicate: impl FnMut() -> bool,
    ) -> (IpcMutexGuard<'a>, bool) {
        let mutex = guard.mutex;
        let deadline = Instant::now() + timeout;

        loop {
            if predicate() {
                return (guard, true);
            }

            let seq = self.seq.load(Ordering::Acquire);
            let now = Instant::now();
            if now >= deadline {
                return (guard, false);
            }

            // Release the mutex for the duration of the sleep, then
            // reacquire before re-evaluating the predicate.
            std::mem::forget(guard);
            mutex.unlock();
            let woke = futex_wait(&self.seq, seq, Some(deadline - now));
            mutex.lock_raw();
            guard = IpcMutexGuard { mutex };

            if !woke {
                return (guard, predicate());
            }
        }
    }

    /// Wakes one waiter.
    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake(&self.seq, 1);
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake(&self.seq, i32::MAX);
    }
}

/// Sleeps while `*word == expected`. Returns false on timeout, true on wake
/// (including spurious wakes and value mismatches).
#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
    let ts;
    let ts_ptr = match timeout {
        Some(timeout) => {
            ts = libc::timespec {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_nsec: timeout.subsec_nanos() as libc::c_long,
            };
            &ts as *const libc::timespec
        }
        None => std::ptr::null(),
    };

    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if rc == -1 {
        std::io::Error::last_os_error().raw_os_error() != Some(libc::ETIMEDOUT)
    } else {
        true
    }
}

/// Wakes up to `count` waiters sleeping on `word`.
#[cfg(target_os = "linux")]
fn futex_wake(word: &AtomicU32, count: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

// Fallback for non-Linux hosts: poll the word on a short interval. The
// timeout-heartbeat semantics are preserved at degraded efficiency.
#[cfg(not(target_os = "linux"))]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
    let deadline = timeout.map(|t| Instant::now() + t);
    while word.load(Ordering::Acquire) == expected {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return false;
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_word: &AtomicU32, _count: i32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::thread;

    struct Shared {
        mutex: IpcMutex,
        cv: IpcCondvar,
        value: UnsafeCell<u64>,
    }

    unsafe impl Sync for Shared {}

    fn shared() -> Shared {
        Shared {
            mutex: IpcMutex {
                state: AtomicU32::new(0),
            },
            cv: IpcCondvar {
                seq: AtomicU32::new(0),
            },
            value: UnsafeCell::new(0),
        }
    }

    #[test]
    fn test_mutex_excludes_writers() {
        let shared = shared();

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let shared = &shared;
                    for _ in 0..1000 {
                        let _guard = shared.mutex.lock();
                        unsafe { *shared.value.get() += 1 };
                    }
                });
            }
        });

        let _guard = shared.mutex.lock();
        assert_eq!(unsafe { *shared.value.get() }, 4000);
    }

    #[test]
    fn test_try_lock_for_times_out() {
        let shared = shared();

        let guard = shared.mutex.lock();
        let start = Instant::now();
        assert!(shared
            .mutex
            .try_lock_for(Duration::from_millis(50))
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
        drop(guard);

        assert!(shared
            .mutex
            .try_lock_for(Duration::from_millis(50))
            .is_some());
    }

    #[test]
    fn test_condvar_wakes_on_notify() {
        let shared = shared();

        thread::scope(|scope| {
            scope.spawn(|| {
                let shared = &shared;
                let guard = shared.mutex.lock();
                let (guard, satisfied) =
                    shared
                        .cv
                        .wait_timeout_while(guard, Duration::from_secs(5), || unsafe {
                            *shared.value.get() == 7
                        });
                assert!(satisfied);
                drop(guard);
            });

            thread::sleep(Duration::from_millis(20));
            {
                let _guard = shared.mutex.lock();
                unsafe { *shared.value.get() = 7 };
            }
            shared.cv.notify_all();
        });
    }

    #[test]
    fn test_condvar_timeout_reports_predicate() {
        let shared = shared();

        let guard = shared.mutex.lock();
        let start = Instant::now();
        let (guard, satisfied) =
            shared
                .cv
                .wait_timeout_while(guard, Duration::from_millis(50), || false);
        assert!(!satisfied);
        assert!(start.elapsed() >= Duration::from_millis(50));
        drop(guard);
    }

    #[test]
    fn test_condvar_predicate_already_true_returns_immediately() {
        let shared = shared();

        let guard = shared.mutex.lock();
        let start = Instant::now();
        let (guard, satisfied) =
            shared
                .cv
                .wait_timeout_while(guard, Duration::from_secs(10), || true);
        assert!(satisfied);
        assert!(start.elapsed() < Duration::from_secs(1));
        drop(guard);
    }
}
