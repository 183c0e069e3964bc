use std::cell::UnsafeCell;
use std::marker::PhantomData;

use crate::error::fatal_abort;

/// A native `pthread_mutex_t` at a stable heap address.
pub struct OsMutex {
    inner: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

// SAFETY: pthread mutexes are designed to be shared between threads; the
// object never moves because it is boxed.
unsafe impl Send for OsMutex {}
// SAFETY: see above; all access goes through the pthread API.
unsafe impl Sync for OsMutex {}

impl OsMutex {
    /// Initialize a default (non-recursive) mutex. Failure is fatal.
    #[must_use]
    pub fn new() -> Self {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        // SAFETY: `inner` is a valid, exclusively owned, pinned mutex object.
        let rc = unsafe { libc::pthread_mutex_init(inner.get(), std::ptr::null()) };
        if rc != 0 {
            fatal_abort("sync", "mutex_initialize_failed", rc);
        }
        Self { inner }
    }

    /// Block until the mutex is held by the calling thread.
    pub fn lock(&self) -> OsMutexGuard<'_> {
        // SAFETY: the mutex was initialized in `new` and is not destroyed
        // while `self` is alive.
        let rc = unsafe { libc::pthread_mutex_lock(self.raw()) };
        if rc != 0 {
            fatal_abort("sync", "mutex_enter_failed", rc);
        }
        OsMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    /// Acquire the mutex without blocking.
    pub fn try_lock(&self) -> Option<OsMutexGuard<'_>> {
        // SAFETY: as in `lock`.
        let rc = unsafe { libc::pthread_mutex_trylock(self.raw()) };
        (rc == 0).then_some(OsMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    pub(crate) fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get()
    }
}

impl Default for OsMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for OsMutex {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no guard is outstanding.
        let rc = unsafe { libc::pthread_mutex_destroy(self.raw()) };
        if rc != 0 {
            crate::structured_log::report(
                crate::structured_log::LogLevel::Error,
                "sync",
                "mutex_destroy_failed",
                Some(rc),
                None,
            );
        }
    }
}

impl std::fmt::Debug for OsMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsMutex").field("at", &self.raw()).finish()
    }
}

/// Proof that the calling thread holds an [`OsMutex`]. Unlocks on drop.
///
/// Not `Send`: pthread mutexes must be released by the thread that locked them.
pub struct OsMutexGuard<'a> {
    mutex: &'a OsMutex,
    _not_send: PhantomData<*const ()>,
}

impl OsMutexGuard<'_> {
    pub(crate) fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.raw()
    }
}

impl Drop for OsMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while this thread holds the mutex.
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.raw());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = OsMutex::new();
        let guard = mutex.lock();
        let contender = std::thread::scope(|s| s.spawn(|| mutex.try_lock().is_some()).join().unwrap());
        assert!(!contender);
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn serializes_increments() {
        let mutex = Arc::new(OsMutex::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _g = mutex.lock();
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
