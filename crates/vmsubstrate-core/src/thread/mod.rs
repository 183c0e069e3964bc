//! Native thread lifecycle and the registry of thread metadata blocks.
//!
//! Every thread known to the runtime owns a [`ThreadLocalsBlock`]: three thread
//! locals areas (safepoints triggered, enabled, disabled), the
//! [`NativeThreadLocals`] describing its OS thread and stack, and a stack
//! reference map. Blocks are linked into the [`ThreadRegistry`] under the global
//! lock, which the collector also takes to exclude registration while it runs.

mod block;
mod layout;
mod lifecycle;
mod os;
mod registry;

pub use block::ThreadLocalsBlock;
pub use layout::{NATIVE_INFO_WORDS, NativeThreadLocals, ThreadLocalsLayout};
pub use lifecycle::{AttachArgs, Substrate, VmEnv, temporary_id};
pub use os::{
    HostThreads, NativeThread, PosixThreads, SleepOutcome, StackInfo, ThreadBackend, ThreadEntry,
};
pub use registry::{BlockId, RegisteredThread, RegistryGuard, RegistryState, ThreadRegistry};
