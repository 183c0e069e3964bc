//! OS thread capabilities behind a trait, with the POSIX implementation chosen
//! at build time.

use std::ffi::c_void;
use std::sync::Once;

use serde::Serialize;

use crate::error::last_errno;

/// Opaque OS thread handle (`pthread_t`). Zero is the null handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct NativeThread(pub usize);

impl NativeThread {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Bounds of a thread's stack. The stack occupies `[base, base + size)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StackInfo {
    pub base: usize,
    pub size: usize,
}

impl StackInfo {
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.size
    }

    #[must_use]
    pub const fn contains(&self, sp: usize) -> bool {
        sp >= self.base && sp - self.base < self.size
    }
}

/// How a sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SleepOutcome {
    Elapsed,
    Interrupted,
}

/// Entry point handed to the OS for a new thread.
pub type ThreadEntry = extern "C" fn(*mut c_void) -> *mut c_void;

/// Thread operations the substrate needs from the host OS.
///
/// Errors are raw errno values; the caller decides how to log and surface them.
pub trait ThreadBackend: Send + Sync + 'static {
    /// Start a joinable thread running `entry(arg)` on a stack of `stack_size`
    /// bytes with a one-page guard.
    fn create(
        &self,
        stack_size: usize,
        priority: i32,
        entry: ThreadEntry,
        arg: *mut c_void,
    ) -> Result<NativeThread, i32>;

    fn join(&self, thread: NativeThread) -> Result<(), i32>;

    fn current(&self) -> NativeThread;

    fn yield_now(&self);

    /// Deliver the interrupt signal to `thread`.
    fn interrupt(&self, thread: NativeThread) -> Result<(), i32>;

    fn set_priority(&self, thread: NativeThread, priority: i32) -> Result<(), i32>;

    /// Stack bounds of the calling thread.
    fn stack_info(&self) -> Result<StackInfo, i32>;

    fn sleep(&self, millis: u64) -> Result<SleepOutcome, i32>;
}

/// pthread-based backend for Linux and macOS.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosixThreads;

/// Backend selected for the build target.
pub type HostThreads = PosixThreads;

/// Signal used to knock a thread out of a blocking call.
pub const INTERRUPT_SIGNAL: i32 = libc::SIGUSR1;

#[cfg(target_os = "linux")]
const STACK_MIN: usize = libc::PTHREAD_STACK_MIN;
#[cfg(not(target_os = "linux"))]
const STACK_MIN: usize = 8192;

extern "C" fn on_interrupt(_signal: libc::c_int) {}

/// Install a no-op handler without `SA_RESTART` so delivery makes blocking calls
/// return `EINTR` instead of terminating the process.
fn install_interrupt_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // SAFETY: `action` is fully initialized before use and the handler is
        // async-signal-safe (it does nothing).
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_interrupt as extern "C" fn(libc::c_int) as usize;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(INTERRUPT_SIGNAL, &action, std::ptr::null_mut());
        }
    });
}

impl ThreadBackend for PosixThreads {
    fn create(
        &self,
        stack_size: usize,
        _priority: i32,
        entry: ThreadEntry,
        arg: *mut c_void,
    ) -> Result<NativeThread, i32> {
        let stack_size = stack_size.max(STACK_MIN);
        // SAFETY: the attribute object is initialized before every use and
        // destroyed on all paths after `pthread_attr_init` succeeds.
        unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            let rc = libc::pthread_attr_init(&mut attr);
            if rc != 0 {
                return Err(rc);
            }
            let mut rc = libc::pthread_attr_setstacksize(&mut attr, stack_size);
            if rc == 0 {
                rc = libc::pthread_attr_setguardsize(&mut attr, crate::vm::page_size());
            }
            if rc == 0 {
                rc = libc::pthread_attr_setdetachstate(&mut attr, libc::PTHREAD_CREATE_JOINABLE);
            }
            let mut thread: libc::pthread_t = std::mem::zeroed();
            if rc == 0 {
                rc = libc::pthread_create(&mut thread, &attr, entry, arg);
            }
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 {
                return Err(rc);
            }
            Ok(NativeThread(thread as usize))
        }
    }

    fn join(&self, thread: NativeThread) -> Result<(), i32> {
        // SAFETY: pthread_join validates the handle as far as the OS can; the
        // caller passes a handle obtained from `create`.
        let rc = unsafe { libc::pthread_join(thread.0 as libc::pthread_t, std::ptr::null_mut()) };
        if rc == 0 { Ok(()) } else { Err(rc) }
    }

    fn current(&self) -> NativeThread {
        // SAFETY: pthread_self has no preconditions.
        NativeThread(unsafe { libc::pthread_self() } as usize)
    }

    fn yield_now(&self) {
        // SAFETY: sched_yield has no preconditions.
        unsafe {
            libc::sched_yield();
        }
    }

    fn interrupt(&self, thread: NativeThread) -> Result<(), i32> {
        install_interrupt_handler();
        // SAFETY: a stale handle yields ESRCH rather than undefined behavior on
        // the supported platforms.
        let rc = unsafe { libc::pthread_kill(thread.0 as libc::pthread_t, INTERRUPT_SIGNAL) };
        if rc == 0 { Ok(()) } else { Err(rc) }
    }

    fn set_priority(&self, _thread: NativeThread, _priority: i32) -> Result<(), i32> {
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn stack_info(&self) -> Result<StackInfo, i32> {
        // SAFETY: `attr` is filled by pthread_getattr_np before use and destroyed
        // afterwards; the out-pointers are valid locals.
        unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            let rc = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
            if rc != 0 {
                return Err(rc);
            }
            let mut addr: *mut c_void = std::ptr::null_mut();
            let mut size: usize = 0;
            let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
            libc::pthread_attr_destroy(&mut attr);
            if rc != 0 {
                return Err(rc);
            }
            Ok(StackInfo {
                base: addr as usize,
                size,
            })
        }
    }

    #[cfg(target_os = "macos")]
    fn stack_info(&self) -> Result<StackInfo, i32> {
        // SAFETY: both queries accept the calling thread's own handle.
        let (top, size) = unsafe {
            let me = libc::pthread_self();
            (
                libc::pthread_get_stackaddr_np(me) as usize,
                libc::pthread_get_stacksize_np(me),
            )
        };
        if top == 0 || size == 0 || size > top {
            return Err(libc::EINVAL);
        }
        Ok(StackInfo {
            base: top - size,
            size,
        })
    }

    fn sleep(&self, millis: u64) -> Result<SleepOutcome, i32> {
        let request = libc::timespec {
            tv_sec: (millis / 1000) as libc::time_t,
            tv_nsec: ((millis % 1000) * 1_000_000) as _,
        };
        let mut remaining = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: both timespecs are valid for the duration of the call.
        if unsafe { libc::nanosleep(&request, &mut remaining) } == 0 {
            return Ok(SleepOutcome::Elapsed);
        }
        match last_errno() {
            libc::EINTR => Ok(SleepOutcome::Interrupted),
            errno => Err(errno),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static ENTERED: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn bump(arg: *mut c_void) -> *mut c_void {
        ENTERED.fetch_add(arg as usize, Ordering::SeqCst);
        std::ptr::null_mut()
    }

    #[test]
    fn create_and_join_runs_entry() {
        let backend = PosixThreads;
        let thread = backend
            .create(256 * 1024, 5, bump, 3usize as *mut c_void)
            .unwrap();
        assert!(!thread.is_null());
        backend.join(thread).unwrap();
        assert!(ENTERED.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn stack_info_contains_a_local() {
        let info = PosixThreads.stack_info().unwrap();
        let local = 0u64;
        assert!(info.contains(std::ptr::addr_of!(local) as usize));
        assert_eq!(info.end(), info.base + info.size);
    }

    #[test]
    fn sleep_elapses() {
        let start = std::time::Instant::now();
        assert_eq!(PosixThreads.sleep(20), Ok(SleepOutcome::Elapsed));
        assert!(start.elapsed() >= std::time::Duration::from_millis(19));
    }

    #[test]
    fn current_is_stable_and_non_null() {
        let a = PosixThreads.current();
        assert!(!a.is_null());
        assert_eq!(a, PosixThreads.current());
    }
}
