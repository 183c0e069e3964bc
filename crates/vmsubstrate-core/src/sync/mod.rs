//! OS synchronization primitives: a heap-pinned mutex and the condition
//! variable used with it.
//!
//! Both wrap the native pthread objects directly so the runtime, the thread
//! registry and the collector contend on exactly the lock the OS sees.

mod condition;
mod mutex;

pub use condition::{Condition, Deadline, compute_deadline};
pub use mutex::{OsMutex, OsMutexGuard};
