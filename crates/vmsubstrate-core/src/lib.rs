//! # vmsubstrate-core
//!
//! Native substrate that lets a managed runtime run on top of the host OS.
//!
//! The crate provides three tightly-coupled pieces:
//!
//! - [`sync`]: an OS mutex and a condition variable that distinguishes ordinary
//!   wakeups from interruption.
//! - [`thread`]: native thread lifecycle (create, run, attach, detach, join) and the
//!   lock-protected registry of thread metadata blocks shared with the collector.
//! - [`tele`]: out-of-process memory copy and the search that locates a thread's
//!   metadata block from a debugger by stack-pointer containment.
//!
//! # Architecture
//!
//! ```text
//! runtime upcalls <- Substrate (thread) -> ThreadRegistry -> OsMutex (sync)
//!                         |                     |
//!                     BootImage  <- head word ---+
//!                         ^
//! debugger -> tele -------+ (raw copies of the same layout, no locking)
//! ```
//!
//! `unsafe` is denied at the crate level; the modules that talk to the OS opt back in.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
#[allow(unsafe_code)]
pub mod image;
pub mod structured_log;
#[allow(unsafe_code)]
pub mod sync;
#[allow(unsafe_code)]
pub mod tele;
#[allow(unsafe_code)]
pub mod thread;
#[allow(unsafe_code)]
pub mod vm;

pub use config::{SubstrateConfig, TraceChannel, config};
pub use error::{SubstrateError, SubstrateResult};
pub use image::{BootImage, ImageHeader, Upcalls};
pub use sync::{Condition, OsMutex, OsMutexGuard};
pub use tele::{
    BufferDescriptor, CollectingSession, DebuggerSession, GatheredThread, LocalProcess,
    ManagedByteArray, ProcessMemory, TeleScratch, ThreadLocalsView, ThreadState,
    find_thread_locals, gather_thread, read_memory, write_memory,
};
pub use thread::{
    AttachArgs, NativeThread, SleepOutcome, StackInfo, Substrate, ThreadLocalsLayout,
    ThreadRegistry, VmEnv,
};
