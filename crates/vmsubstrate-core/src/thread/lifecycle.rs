//! Thread lifecycle: create/run, attach/detach, join and the small OS services
//! the runtime needs from its threads.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::ffi::{CStr, CString, c_void};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::json;

use super::block::ThreadLocalsBlock;
use super::layout::{NativeThreadLocals, ThreadLocalsLayout};
use super::os::{HostThreads, NativeThread, SleepOutcome, StackInfo, ThreadBackend};
use super::registry::{BlockId, ThreadRegistry};
use crate::config::TraceChannel;
use crate::error::{SubstrateError, SubstrateResult, fatal_exit};
use crate::image::{BootImage, JNI_EDETACHED, JNI_OK};
use crate::structured_log::{LogLevel, report, trace};
use crate::vm;

/// Exit status used when a thread cannot determine its own stack.
const STACK_INFO_EXIT_CODE: i32 = 11;

/// Address of a thread's VM environment slot (`JNI_ENV` in its TLA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmEnv(pub usize);

impl VmEnv {
    #[must_use]
    pub const fn address(self) -> usize {
        self.0
    }
}

/// Arguments an attaching thread passes through to the runtime.
#[derive(Debug, Clone, Default)]
pub struct AttachArgs {
    pub name: Option<CString>,
    /// Runtime handle of the thread group, or 0.
    pub group: usize,
}

impl AttachArgs {
    #[must_use]
    pub fn new(name: Option<&CStr>, group: usize) -> Self {
        Self {
            name: name.map(CStr::to_owned),
            group,
        }
    }

    fn name_address(&self) -> usize {
        self.name.as_ref().map_or(0, |n| n.as_ptr() as usize)
    }
}

/// Temporary id for a thread attaching from outside the runtime.
///
/// Derived from the truncated native handle and never positive, so it cannot
/// collide with an id from the runtime's thread map.
#[must_use]
pub fn temporary_id(handle: NativeThread) -> i32 {
    let truncated = handle.0 as i32;
    match truncated {
        0 => -1,
        h if h < 0 => h,
        h => -h,
    }
}

#[derive(Clone, Copy)]
struct CurrentBlock {
    substrate: u64,
    block: BlockId,
    tla: usize,
    env: VmEnv,
}

thread_local! {
    static CURRENT: Cell<Option<CurrentBlock>> = const { Cell::new(None) };
}

static NEXT_SUBSTRATE_ID: AtomicU64 = AtomicU64::new(1);
/// Ids of substrates that have not been dropped yet.
static LIVE_SUBSTRATES: Mutex<BTreeSet<u64>> = Mutex::new(BTreeSet::new());

struct RunStart {
    substrate: Arc<Substrate>,
    id: i32,
}

extern "C" fn thread_run(arg: *mut c_void) -> *mut c_void {
    // SAFETY: `arg` is the `RunStart` leaked by `Substrate::create`, whose
    // ownership passes to this thread exactly once.
    let start = unsafe { Box::from_raw(arg.cast::<RunStart>()) };
    start.substrate.run_thread(start.id);
    std::ptr::null_mut()
}

/// Process-wide thread substrate: boot image, registry and OS backend.
///
/// A thread is attached to at most one substrate at a time.
pub struct Substrate {
    id: u64,
    image: Arc<BootImage>,
    layout: ThreadLocalsLayout,
    registry: ThreadRegistry,
    backend: Box<dyn ThreadBackend>,
    page_size: usize,
    primordial: Mutex<Option<Box<NativeThreadLocals>>>,
}

impl std::fmt::Debug for Substrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Substrate")
            .field("image", &self.image)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl Substrate {
    /// Substrate over `image` using the host's thread backend.
    ///
    /// The substrate owns the image's thread list until it is dropped; a
    /// second substrate over the same image fails with
    /// [`SubstrateError::ImageInUse`].
    pub fn new(image: Arc<BootImage>) -> SubstrateResult<Arc<Self>> {
        Self::with_backend(image, Box::new(HostThreads::default()))
    }

    pub fn with_backend(
        image: Arc<BootImage>,
        backend: Box<dyn ThreadBackend>,
    ) -> SubstrateResult<Arc<Self>> {
        let layout = ThreadLocalsLayout::from_header(image.header())?;
        if layout.word_size != std::mem::size_of::<usize>() {
            return Err(SubstrateError::InvalidImage(format!(
                "word size {} cannot run on this host",
                layout.word_size
            )));
        }
        let registry = ThreadRegistry::new(Arc::clone(&image), &layout)?;
        report(
            LogLevel::Debug,
            "threads",
            "substrate_initialized",
            None,
            Some(json!({
                "global_lock": registry.lock() as *const _ as usize,
                "registry_head": image.registry_head_address(),
                "primordial": image.primordial_address(),
            })),
        );
        let id = NEXT_SUBSTRATE_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_SUBSTRATES.lock().insert(id);
        Ok(Arc::new(Self {
            id,
            image,
            layout,
            registry,
            backend,
            page_size: vm::page_size(),
            primordial: Mutex::new(None),
        }))
    }

    #[must_use]
    pub fn image(&self) -> &Arc<BootImage> {
        &self.image
    }

    #[must_use]
    pub const fn layout(&self) -> &ThreadLocalsLayout {
        &self.layout
    }

    #[must_use]
    pub const fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    fn current_block(&self) -> Option<CurrentBlock> {
        CURRENT.with(Cell::get).filter(|c| c.substrate == self.id)
    }

    /// Start a thread that will run the image's run upcall as `id`.
    ///
    /// `stack_size` must be a multiple of the page size; it is raised to the OS
    /// minimum if smaller.
    pub fn create(
        self: &Arc<Self>,
        id: i32,
        stack_size: usize,
        priority: i32,
    ) -> SubstrateResult<NativeThread> {
        trace(TraceChannel::Threads, "thread.create", || {
            json!({ "id": id, "stack_size": stack_size, "priority": priority })
        });
        if !vm::is_page_aligned(stack_size) {
            report(
                LogLevel::Warn,
                "threads",
                "thread_create_misaligned_stack",
                None,
                Some(json!({ "id": id, "stack_size": stack_size, "page_size": self.page_size })),
            );
            return Err(SubstrateError::StackSizeMisaligned {
                size: stack_size,
                page_size: self.page_size,
            });
        }
        if self.image.upcalls().run.is_none() {
            return Err(SubstrateError::MissingUpcall("run"));
        }
        let start = Box::new(RunStart {
            substrate: Arc::clone(self),
            id,
        });
        let arg = Box::into_raw(start).cast::<c_void>();
        match self.backend.create(stack_size, priority, thread_run, arg) {
            Ok(thread) => Ok(thread),
            Err(errno) => {
                // SAFETY: the OS did not start the thread, so `arg` was never handed over.
                drop(unsafe { Box::from_raw(arg.cast::<RunStart>()) });
                report(
                    LogLevel::Error,
                    "threads",
                    "thread_create_failed",
                    Some(errno),
                    Some(json!({ "id": id, "stack_size": stack_size })),
                );
                Err(SubstrateError::Os {
                    op: "pthread_create",
                    errno,
                })
            }
        }
    }

    fn run_thread(&self, id: i32) {
        let native = self.backend.current();
        trace(TraceChannel::Threads, "thread.run.begin", || {
            json!({ "id": id, "thread": native.0 })
        });
        let stack = self.stack_info();
        let block = match ThreadLocalsBlock::allocate(&self.layout, id, native, stack, self.page_size) {
            Ok(block) => block,
            Err(err) => {
                report(
                    LogLevel::Error,
                    "threads",
                    "thread_run_allocation_failed",
                    None,
                    Some(json!({ "id": id, "error": err.to_string() })),
                );
                return;
            }
        };
        let tla = block.tla();
        let ref_map = block.ref_map_address();
        let native_info = block.native();
        let env = VmEnv(block.tla_slot_address(self.layout.jni_env));
        let block_id = self.registry.enter().link(block);
        CURRENT.with(|c| {
            c.set(Some(CurrentBlock {
                substrate: self.id,
                block: block_id,
                tla,
                env,
            }));
        });

        if let Some(run) = self.image.upcalls().run {
            // SAFETY: the image guarantees `run` has the run upcall signature; all
            // addresses stay valid until the block is unlinked below.
            unsafe {
                run(
                    id,
                    native.0,
                    native_info.stack_base,
                    stack.end(),
                    tla,
                    ref_map,
                    native_info.stack_yellow_zone,
                );
            }
        }

        // The upcall may have detached the thread itself.
        if let Some(current) = self.current_block() {
            CURRENT.with(|c| c.set(None));
            let mut registry = self.registry.enter();
            if registry.get(current.block).is_some_and(|b| b.tla() == current.tla) {
                drop(registry.unlink(current.block));
            }
        }
        trace(TraceChannel::Threads, "thread.run.end", || {
            json!({ "id": id, "thread": native.0 })
        });
    }

    /// Attach the calling OS thread to the runtime.
    ///
    /// Already attached threads get their existing environment back and the
    /// registry is untouched.
    pub fn attach_current(&self, args: &AttachArgs, daemon: bool) -> SubstrateResult<VmEnv> {
        let native = self.backend.current();
        if let Some(current) = self.current_block() {
            trace(TraceChannel::Threads, "thread.attach.already_attached", || {
                json!({ "thread": native.0 })
            });
            return Ok(current.env);
        }
        if let Some(other) = CURRENT.with(Cell::get) {
            if LIVE_SUBSTRATES.lock().contains(&other.substrate) {
                report(
                    LogLevel::Error,
                    "threads",
                    "thread_attached_elsewhere",
                    None,
                    Some(json!({ "thread": native.0, "tla": other.tla })),
                );
                return Err(SubstrateError::AttachedElsewhere);
            }
            // Its substrate was dropped, and the block went with the registry.
            report(
                LogLevel::Warn,
                "threads",
                "thread_stale_attachment_cleared",
                None,
                Some(json!({ "thread": native.0, "tla": other.tla })),
            );
            CURRENT.with(|c| c.set(None));
        }
        let attach = self
            .image
            .upcalls()
            .attach
            .ok_or(SubstrateError::MissingUpcall("attach"))?;

        let id = temporary_id(native);
        let stack = self.stack_info();
        let block = ThreadLocalsBlock::allocate(&self.layout, id, native, stack, self.page_size)?;
        let tla = block.tla();
        let ref_map = block.ref_map_address();
        let yellow_zone = block.native().stack_yellow_zone;
        let env = VmEnv(block.tla_slot_address(self.layout.jni_env));

        // Holding the global lock across the upcall keeps a collection from
        // starting until the runtime has recorded this thread.
        let mut registry = self.registry.enter();
        let forward = registry.head_tla();
        let block_id = registry.link(block);
        trace(TraceChannel::Threads, "thread.attach.linked", || {
            json!({ "id": id, "thread": native.0, "tla": tla, "forward_link": forward })
        });
        // SAFETY: the image guarantees `attach` has the attach upcall signature;
        // the name string and block outlive the call.
        let status = unsafe {
            attach(
                native.0,
                args.name_address(),
                args.group,
                i32::from(daemon),
                stack.base,
                stack.end(),
                tla,
                ref_map,
                yellow_zone,
            )
        };
        if status != JNI_OK {
            drop(registry.unlink(block_id));
            drop(registry);
            if status == JNI_EDETACHED {
                report(
                    LogLevel::Warn,
                    "threads",
                    "Cannot attach thread to a VM whose main thread has exited",
                    None,
                    Some(json!({ "thread": native.0 })),
                );
                return Err(SubstrateError::RuntimeExited);
            }
            report(
                LogLevel::Error,
                "threads",
                "thread_attach_rejected",
                None,
                Some(json!({ "thread": native.0, "status": status })),
            );
            return Err(SubstrateError::AttachRejected(status));
        }
        drop(registry);

        CURRENT.with(|c| {
            c.set(Some(CurrentBlock {
                substrate: self.id,
                block: block_id,
                tla,
                env,
            }));
        });
        trace(TraceChannel::Threads, "thread.attach.end", || {
            json!({ "id": id, "thread": native.0 })
        });
        Ok(env)
    }

    /// Detach the calling thread. A no-op for threads that are not attached.
    pub fn detach_current(&self) -> SubstrateResult<()> {
        let Some(current) = self.current_block() else {
            trace(TraceChannel::Threads, "thread.detach.already_detached", || json!({}));
            return Ok(());
        };
        CURRENT.with(|c| c.set(None));
        let mut registry = self.registry.enter();
        if registry.get(current.block).is_none_or(|b| b.tla() != current.tla) {
            drop(registry);
            report(
                LogLevel::Error,
                "threads",
                "thread_detach_stale_registration",
                None,
                Some(json!({ "tla": current.tla })),
            );
            return Err(SubstrateError::StaleRegistration);
        }
        if let Some(detach) = self.image.upcalls().detach {
            // SAFETY: the image guarantees the detach upcall signature; the TLA
            // is still linked and valid.
            unsafe { detach(current.tla) };
        }
        let block = registry.unlink(current.block);
        drop(registry);
        trace(TraceChannel::Threads, "thread.detach.end", || {
            json!({ "tla": current.tla })
        });
        drop(block);
        Ok(())
    }

    /// The calling thread's environment, if it is attached.
    #[must_use]
    pub fn current_env(&self) -> Option<VmEnv> {
        self.current_block().map(|c| c.env)
    }

    /// TLA of the calling thread, if it is attached or running the run upcall.
    #[must_use]
    pub fn current_tla(&self) -> Option<usize> {
        self.current_block().map(|c| c.tla)
    }

    /// Wait for `thread` to terminate.
    pub fn join(&self, thread: NativeThread) -> SubstrateResult<()> {
        trace(TraceChannel::Threads, "thread.join.begin", || json!({ "thread": thread.0 }));
        if thread.is_null() {
            return Err(SubstrateError::NullHandle);
        }
        let result = self.backend.join(thread).map_err(|errno| {
            report(
                LogLevel::Error,
                "threads",
                "thread_join_failed",
                Some(errno),
                Some(json!({ "thread": thread.0, "joiner": self.backend.current().0 })),
            );
            SubstrateError::Os {
                op: "pthread_join",
                errno,
            }
        });
        trace(TraceChannel::Threads, "thread.join.end", || json!({ "thread": thread.0 }));
        result
    }

    /// Sleep for `millis` milliseconds or until interrupted.
    pub fn sleep(&self, millis: u64) -> SleepOutcome {
        match self.backend.sleep(millis) {
            Ok(outcome) => outcome,
            Err(errno) => {
                report(
                    LogLevel::Error,
                    "threads",
                    "sleep_failed",
                    Some(errno),
                    Some(json!({ "millis": millis })),
                );
                SleepOutcome::Elapsed
            }
        }
    }

    pub fn yield_now(&self) {
        self.backend.yield_now();
    }

    /// Interrupt `thread` out of a blocking wait or sleep.
    pub fn interrupt(&self, thread: NativeThread) -> bool {
        trace(TraceChannel::Threads, "thread.interrupt", || json!({ "thread": thread.0 }));
        match self.backend.interrupt(thread) {
            Ok(()) => true,
            Err(errno) => {
                report(
                    LogLevel::Error,
                    "threads",
                    "thread_interrupt_failed",
                    Some(errno),
                    Some(json!({ "thread": thread.0 })),
                );
                false
            }
        }
    }

    /// Advisory: POSIX hosts ignore thread priorities.
    pub fn set_priority(&self, thread: NativeThread, priority: i32) {
        if let Err(errno) = self.backend.set_priority(thread, priority) {
            report(
                LogLevel::Warn,
                "threads",
                "set_priority_failed",
                Some(errno),
                Some(json!({ "thread": thread.0, "priority": priority })),
            );
            return;
        }
        trace(TraceChannel::Threads, "thread.set_priority.ignored", || {
            json!({ "thread": thread.0, "priority": priority })
        });
    }

    /// Stack bounds of the calling thread. Exits the process if they cannot be
    /// determined.
    pub fn stack_info(&self) -> StackInfo {
        match self.backend.stack_info() {
            Ok(info) => info,
            Err(errno) => fatal_exit(
                STACK_INFO_EXIT_CODE,
                "threads",
                "Cannot get current stack bounds",
                errno,
            ),
        }
    }

    /// Fill the image's primordial thread locals for the calling (main) thread.
    ///
    /// Returns the primordial TLA address.
    pub fn bootstrap_primordial(&self) -> SubstrateResult<usize> {
        let stack = self.stack_info();
        let native = Box::new(NativeThreadLocals {
            handle: self.backend.current().0,
            stack_base: stack.base,
            stack_size: stack.size,
            stack_yellow_zone: stack.base + self.page_size,
            tl_block: 0,
            tl_block_size: 0,
        });
        let tla = self.image.primordial_address();
        let base = self.image.header().primordial_thread_locals_offset as usize;
        let native_address = &*native as *const NativeThreadLocals as usize;
        let layout = &self.layout;
        let words = [
            (layout.safepoint_latch, tla),
            (layout.safepoints_enabled, tla),
            (layout.safepoints_disabled, tla),
            (layout.safepoints_triggered, tla),
            (layout.native_thread_locals, native_address),
            (layout.id, 0),
        ];
        for (index, value) in words {
            self.image.write_word(base + layout.slot_offset(index), value)?;
        }
        *self.primordial.lock() = Some(native);
        trace(TraceChannel::Threads, "thread.primordial", || {
            json!({ "tla": tla, "stack_base": stack.base, "stack_size": stack.size })
        });
        Ok(tla)
    }
}

impl Drop for Substrate {
    fn drop(&mut self) {
        LIVE_SUBSTRATES.lock().remove(&self.id);
    }
}
