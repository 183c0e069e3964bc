//! End-to-end smoke run over a synthetic boot image.
//!
//! Starts threads through the run upcall, attaches the calling thread, then
//! finds it again by reading this process's memory the way a debugger would.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use vmsubstrate_core::image::{AttachUpcall, DetachUpcall, JNI_OK, RunUpcall};
use vmsubstrate_core::structured_log::{LogLevel, report};
use vmsubstrate_core::vm::page_size;
use vmsubstrate_core::{AttachArgs, BootImage, GatheredThread, ImageHeader, Substrate, Upcalls};

use crate::HarnessError;

/// Ids handed to `create`; disjoint across runs in one process.
static NEXT_ID: AtomicI32 = AtomicI32::new(1);
/// `(id, stack contained a local of the run upcall)` for every run observed.
static RUNS: Mutex<Vec<(i32, bool)>> = Mutex::new(Vec::new());
static DETACHED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

extern "C" fn on_run(
    id: i32,
    _native: usize,
    stack_base: usize,
    stack_end: usize,
    _tla: usize,
    _ref_map: usize,
    _yellow_zone: usize,
) {
    let local = 0u8;
    let sp = std::ptr::addr_of!(local) as usize;
    RUNS.lock().push((id, stack_base <= sp && sp < stack_end));
}

extern "C" fn on_attach(
    _native: usize,
    _name: usize,
    _group: usize,
    _daemon: i32,
    _stack_base: usize,
    _stack_end: usize,
    _tla: usize,
    _ref_map: usize,
    _yellow_zone: usize,
) -> i32 {
    JNI_OK
}

extern "C" fn on_detach(tla: usize) {
    DETACHED.lock().push(tla);
}

const RUN: RunUpcall = on_run;
const ATTACH: AttachUpcall = on_attach;
const DETACH: DetachUpcall = on_detach;

/// Parameters of a smoke run.
#[derive(Debug, Clone, Copy)]
pub struct SmokeConfig {
    pub threads: usize,
    /// Stack size of created threads, in pages.
    pub stack_pages: usize,
}

impl Default for SmokeConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            stack_pages: 64,
        }
    }
}

/// Machine-readable outcome of a smoke run.
#[derive(Debug, Clone, Serialize)]
pub struct SmokeReport {
    pub threads_started: usize,
    pub runs_on_own_stack: usize,
    pub registry_empty_after_join: bool,
    pub attached_tla: usize,
    /// How the attached thread was looked up again.
    pub remote_path: &'static str,
    pub found_tla: Option<usize>,
    pub gathered: Option<GatheredThread>,
    pub detach_upcalled: bool,
}

impl SmokeReport {
    /// Every check the run makes, as `(name, passed)`.
    pub fn checks(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("all_runs_observed", self.runs_on_own_stack == self.threads_started),
            ("registry_empty_after_join", self.registry_empty_after_join),
            (
                "attached_thread_found",
                self.remote_path == "skipped" || self.found_tla == Some(self.attached_tla),
            ),
            ("detach_upcalled", self.detach_upcalled),
        ]
    }

    pub fn passed(&self) -> bool {
        self.checks().iter().all(|(_, ok)| *ok)
    }
}

/// Run the smoke scenario once.
pub fn run_smoke(config: SmokeConfig) -> Result<SmokeReport, HarnessError> {
    let upcalls = Upcalls {
        run: Some(RUN),
        attach: Some(ATTACH),
        detach: Some(DETACH),
    };
    let image = BootImage::synthetic(ImageHeader::host_default(), upcalls)?;
    let substrate = Substrate::new(Arc::new(image))?;
    let stack_size = config.stack_pages.max(1) * page_size();

    let first = NEXT_ID.fetch_add(config.threads as i32, Ordering::Relaxed);
    let ids: Vec<i32> = (first..).take(config.threads).collect();
    let mut started = Vec::with_capacity(ids.len());
    for &id in &ids {
        started.push(substrate.create(id, stack_size, 0)?);
    }
    for thread in started {
        substrate.join(thread)?;
    }
    let runs_on_own_stack = RUNS
        .lock()
        .iter()
        .filter(|(id, on_stack)| ids.contains(id) && *on_stack)
        .count();
    let registry_empty_after_join = substrate.registry().is_empty();

    substrate.attach_current(&AttachArgs::default(), false)?;
    let attached_tla = substrate
        .current_tla()
        .ok_or_else(|| HarnessError::Check("attached thread has no locals".into()))?;
    let (remote_path, found_tla, gathered) = find_self(&substrate);
    substrate.detach_current()?;
    let detach_upcalled = DETACHED.lock().contains(&attached_tla);

    let report = SmokeReport {
        threads_started: ids.len(),
        runs_on_own_stack,
        registry_empty_after_join,
        attached_tla,
        remote_path,
        found_tla,
        gathered,
        detach_upcalled,
    };
    report_outcome(&report);
    Ok(report)
}

#[cfg(target_os = "linux")]
fn find_self(substrate: &Substrate) -> (&'static str, Option<usize>, Option<GatheredThread>) {
    use vmsubstrate_core::tele::ProcessVm;
    use vmsubstrate_core::{
        CollectingSession, TeleScratch, ThreadState, find_thread_locals, gather_thread,
    };

    let process = ProcessVm::new(std::process::id() as i32);
    let layout = *substrate.layout();
    let marker = 0u8;
    let sp = std::ptr::addr_of!(marker) as usize;
    let mut scratch = TeleScratch::new();
    let Some(view) = find_thread_locals(
        &process,
        &layout,
        substrate.image().registry_head(),
        0,
        sp,
        &mut scratch,
    ) else {
        return ("process_vm", None, None);
    };
    let mut session = CollectingSession::default();
    let mut threads = Vec::new();
    let gathered = gather_thread(
        &mut session,
        &mut threads,
        &layout,
        i64::from(std::process::id()),
        ThreadState::Running,
        0,
        Some(&view),
    );
    ("process_vm", Some(view.address()), Some(gathered))
}

#[cfg(not(target_os = "linux"))]
fn find_self(_substrate: &Substrate) -> (&'static str, Option<usize>, Option<GatheredThread>) {
    ("skipped", None, None)
}

fn report_outcome(outcome: &SmokeReport) {
    let failed: Vec<_> = outcome
        .checks()
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect();
    let level = if failed.is_empty() {
        LogLevel::Info
    } else {
        LogLevel::Error
    };
    report(
        level,
        "harness",
        "smoke_finished",
        None,
        Some(json!({
            "threads": outcome.threads_started,
            "remote_path": outcome.remote_path,
            "failed": failed,
        })),
    );
}
