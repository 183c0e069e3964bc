//! Remote introspection: a debugger's window into the substrate's memory.
//!
//! Everything here runs outside the target's synchronization. A debugger works
//! from raw copies of thread locals areas fetched through a [`ProcessMemory`]
//! and follows the `FORWARD_LINK` words the registry mirrors for it. A list that
//! is being mutated concurrently yields a possibly stale answer, never a hang.

mod find;
mod gather;
mod process;
mod transfer;
mod view;

pub use find::find_thread_locals;
pub use gather::{CollectingSession, DebuggerSession, GatheredThread, ThreadState, gather_thread};
#[cfg(target_os = "linux")]
pub use process::ProcessVm;
pub use process::{LocalProcess, ProcessMemory};
pub use transfer::{BufferDescriptor, ManagedByteArray, read_memory, write_memory};
pub use view::{TargetWord, TeleScratch, ThreadLocalsView};
