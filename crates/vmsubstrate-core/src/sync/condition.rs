use std::cell::UnsafeCell;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

use super::mutex::OsMutexGuard;
use crate::config::TraceChannel;
use crate::error::fatal_abort;
use crate::structured_log::{LogLevel, report, trace};

/// Upper bound on the seconds part of a relative timeout.
pub const MAX_TIMEOUT_SECS: u64 = 50_000_000;

/// Absolute `CLOCK_REALTIME` deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub secs: u64,
    pub nanos: u32,
}

/// Convert a relative timeout into an absolute deadline from wall-clock `now`.
///
/// Only microsecond precision of `now` is used. The seconds part of the timeout
/// is clamped to [`MAX_TIMEOUT_SECS`].
#[must_use]
pub fn compute_deadline(now: Duration, millis: u64) -> Deadline {
    let seconds = (millis / 1000).min(MAX_TIMEOUT_SECS);
    let mut secs = now.as_secs() + seconds;
    let mut usec = u64::from(now.subsec_micros()) + (millis % 1000) * 1000;
    if usec >= 1_000_000 {
        secs += 1;
        usec -= 1_000_000;
    }
    Deadline {
        secs,
        nanos: (usec * 1000) as u32,
    }
}

/// A native condition variable at a stable heap address.
///
/// None of the waits retry: callers re-check their predicate after every return.
pub struct Condition {
    inner: Box<UnsafeCell<libc::pthread_cond_t>>,
}

// SAFETY: pthread condition variables are designed for cross-thread use and
// the boxed object never moves.
unsafe impl Send for Condition {}
// SAFETY: see above.
unsafe impl Sync for Condition {}

impl Condition {
    /// Initialize the condition variable. Failure is fatal.
    #[must_use]
    pub fn new() -> Self {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER));
        trace(TraceChannel::Condition, "condition.initialize", || {
            json!({ "condition": inner.get() as usize })
        });
        // SAFETY: `inner` is exclusively owned and pinned.
        let rc = unsafe { libc::pthread_cond_init(inner.get(), std::ptr::null()) };
        if rc != 0 {
            fatal_abort("condition", "condition_initialize_failed", rc);
        }
        Self { inner }
    }

    fn raw(&self) -> *mut libc::pthread_cond_t {
        self.inner.get()
    }

    /// Wait for a notification. The guard's mutex is released while blocked and
    /// re-acquired before returning.
    ///
    /// Returns `false` when the wait was interrupted or failed.
    pub fn wait(&self, guard: &mut OsMutexGuard<'_>) -> bool {
        trace(TraceChannel::Condition, "condition.wait", || {
            json!({ "condition": self.raw() as usize, "mutex": guard.raw() as usize })
        });
        // SAFETY: both objects are initialized and the guard proves the calling
        // thread holds the mutex.
        let rc = unsafe { libc::pthread_cond_wait(self.raw(), guard.raw()) };
        self.finish_wait("condition.wait", rc, false)
    }

    /// Wait for a notification or until `millis` milliseconds elapse.
    ///
    /// `millis == 0` waits without a timeout. A timeout is reported as `true`,
    /// the same as an ordinary wakeup.
    pub fn timed_wait(&self, guard: &mut OsMutexGuard<'_>, millis: u64) -> bool {
        if millis == 0 {
            return self.wait(guard);
        }
        trace(TraceChannel::Condition, "condition.timed_wait", || {
            json!({
                "condition": self.raw() as usize,
                "mutex": guard.raw() as usize,
                "millis": millis,
            })
        });
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let deadline = compute_deadline(now, millis);
        let abstime = libc::timespec {
            tv_sec: deadline.secs as libc::time_t,
            tv_nsec: deadline.nanos as _,
        };
        // SAFETY: as in `wait`; `abstime` outlives the call.
        let rc = unsafe { libc::pthread_cond_timedwait(self.raw(), guard.raw(), &abstime) };
        self.finish_wait("condition.timed_wait", rc, true)
    }

    fn finish_wait(&self, op: &str, rc: i32, timed: bool) -> bool {
        match rc {
            0 => {
                trace(TraceChannel::Condition, op, || json!({ "outcome": "finished" }));
                true
            }
            libc::ETIMEDOUT if timed => {
                trace(TraceChannel::Condition, op, || json!({ "outcome": "timedout" }));
                true
            }
            libc::EINTR => {
                trace(TraceChannel::Condition, op, || json!({ "outcome": "interrupted" }));
                false
            }
            errno => {
                report(
                    LogLevel::Error,
                    "condition",
                    "condition_wait_unexpected_error",
                    Some(errno),
                    Some(json!({ "op": op, "condition": self.raw() as usize })),
                );
                false
            }
        }
    }

    /// Wake one waiter. Returns `false` if the OS call failed.
    pub fn notify_one(&self) -> bool {
        trace(TraceChannel::Condition, "condition.notify", || {
            json!({ "condition": self.raw() as usize })
        });
        // SAFETY: initialized in `new`.
        let rc = unsafe { libc::pthread_cond_signal(self.raw()) };
        self.finish_notify("condition_notify_failed", rc)
    }

    /// Wake all waiters. Returns `false` if the OS call failed.
    pub fn notify_all(&self) -> bool {
        trace(TraceChannel::Condition, "condition.notify_all", || {
            json!({ "condition": self.raw() as usize })
        });
        // SAFETY: initialized in `new`.
        let rc = unsafe { libc::pthread_cond_broadcast(self.raw()) };
        self.finish_notify("condition_notify_all_failed", rc)
    }

    fn finish_notify(&self, event: &str, rc: i32) -> bool {
        if rc != 0 {
            report(LogLevel::Error, "condition", event, Some(rc), None);
            return false;
        }
        true
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Condition {
    fn drop(&mut self) {
        trace(TraceChannel::Condition, "condition.destroy", || {
            json!({ "condition": self.raw() as usize })
        });
        // SAFETY: `&mut self` proves no thread is waiting through this handle.
        let rc = unsafe { libc::pthread_cond_destroy(self.raw()) };
        if rc != 0 {
            fatal_abort("condition", "condition_destroy_failed", rc);
        }
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition").field("at", &self.raw()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::OsMutex;
    use std::time::Instant;

    #[test]
    fn deadline_adds_whole_and_fractional_parts() {
        let now = Duration::new(100, 250_000_000);
        assert_eq!(
            compute_deadline(now, 1500),
            Deadline { secs: 101, nanos: 750_000_000 }
        );
    }

    #[test]
    fn deadline_carries_microseconds() {
        let now = Duration::new(10, 900_000_000);
        assert_eq!(
            compute_deadline(now, 200),
            Deadline { secs: 11, nanos: 100_000_000 }
        );
    }

    #[test]
    fn deadline_truncates_now_to_microseconds() {
        let now = Duration::new(5, 123_456_789);
        assert_eq!(compute_deadline(now, 1).nanos, 124_456_000);
    }

    #[test]
    fn deadline_clamps_far_future() {
        let now = Duration::new(1_000, 0);
        let d = compute_deadline(now, u64::MAX);
        assert_eq!(d.secs, 1_000 + MAX_TIMEOUT_SECS + (u64::MAX % 1000) / 1000);
        assert_eq!(d.nanos, ((u64::MAX % 1000) * 1_000_000) as u32);
    }

    #[test]
    fn timed_wait_without_notify_returns_true_after_timeout() {
        let mutex = OsMutex::new();
        let cond = Condition::new();
        let mut guard = mutex.lock();
        let start = Instant::now();
        assert!(cond.timed_wait(&mut guard, 50));
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn notify_without_waiters_succeeds() {
        let cond = Condition::new();
        assert!(cond.notify_one());
        assert!(cond.notify_all());
    }
}
