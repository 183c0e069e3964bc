//! Look up a thread's locals in a live process.

use serde::Serialize;
use vmsubstrate_core::image::DEFAULT_TLA_SLOTS;
use vmsubstrate_core::{
    CollectingSession, ImageHeader, ProcessMemory, TeleScratch, ThreadLocalsLayout, ThreadState,
    find_thread_locals, gather_thread,
};

use crate::HarnessError;

/// Where to look.
#[derive(Debug, Clone, Copy)]
pub struct ProbeRequest {
    pub pid: i32,
    pub registry_head: usize,
    pub primordial: usize,
    pub sp: usize,
    /// Word size of the target image; 0 means the host's.
    pub word_size: i32,
    pub big_endian: bool,
}

/// What the probe found.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub pid: i32,
    pub sp: usize,
    pub tla: Option<usize>,
    pub thread: Option<vmsubstrate_core::GatheredThread>,
}

/// Layout of the target as described by the request.
pub fn probe_layout(request: &ProbeRequest) -> Result<ThreadLocalsLayout, HarnessError> {
    let mut header = ImageHeader::host_default();
    if request.word_size != 0 {
        header.word_size = request.word_size;
        header.thread_locals_area_size = DEFAULT_TLA_SLOTS * request.word_size;
    }
    header.is_big_endian = i32::from(request.big_endian);
    Ok(ThreadLocalsLayout::from_header(&header)?)
}

/// Run the lookup against `process`.
pub fn probe(process: &dyn ProcessMemory, request: &ProbeRequest) -> Result<ProbeReport, HarnessError> {
    let layout = probe_layout(request)?;
    let mut scratch = TeleScratch::new();
    let view = find_thread_locals(
        process,
        &layout,
        request.registry_head,
        request.primordial,
        request.sp,
        &mut scratch,
    );
    let thread = view.as_ref().map(|view| {
        let mut session = CollectingSession::default();
        let mut threads = Vec::new();
        gather_thread(
            &mut session,
            &mut threads,
            &layout,
            i64::from(request.pid),
            ThreadState::Suspended,
            0,
            Some(view),
        )
    });
    Ok(ProbeReport {
        pid: request.pid,
        sp: request.sp,
        tla: view.as_ref().map(|view| view.address()),
        thread,
    })
}

/// Probe another process through `process_vm_readv`.
#[cfg(target_os = "linux")]
pub fn probe_pid(request: &ProbeRequest) -> Result<ProbeReport, HarnessError> {
    let process = vmsubstrate_core::tele::ProcessVm::new(request.pid);
    probe(&process, request)
}

/// Parse an address given as `0x`-prefixed hex or decimal.
pub fn parse_address(raw: &str) -> Result<usize, String> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(&hex.replace('_', ""), 16),
        None => raw.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid address '{raw}': {e}"))
}
