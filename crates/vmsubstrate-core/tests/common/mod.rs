//! Shared fixtures: synthetic boot images and recording upcalls.

#![allow(dead_code, unsafe_code)]

use std::cell::Cell;
use std::ffi::{CStr, c_char};
use std::sync::Arc;

use parking_lot::Mutex;
use vmsubstrate_core::image::{AttachUpcall, DetachUpcall, RunUpcall};
use vmsubstrate_core::{BootImage, ImageHeader, Substrate, Upcalls};

/// Arguments observed by the run upcall.
#[derive(Debug, Clone, Copy)]
pub struct RunRecord {
    pub id: i32,
    pub native: usize,
    pub stack_base: usize,
    pub stack_end: usize,
    pub tla: usize,
    pub ref_map: usize,
    pub yellow_zone: usize,
    pub local_address: usize,
}

/// Arguments observed by the attach upcall.
#[derive(Debug, Clone)]
pub struct AttachRecord {
    pub native: usize,
    pub name: Option<String>,
    pub group: usize,
    pub daemon: i32,
    pub stack_base: usize,
    pub stack_end: usize,
    pub tla: usize,
}

pub static RUNS: Mutex<Vec<RunRecord>> = Mutex::new(Vec::new());
pub static DETACHES: Mutex<Vec<usize>> = Mutex::new(Vec::new());

thread_local! {
    /// Status the attach upcall returns on this thread.
    pub static ATTACH_STATUS: Cell<i32> = const { Cell::new(0) };
    /// Attach upcalls observed on this thread.
    pub static ATTACHES: std::cell::RefCell<Vec<AttachRecord>> = const { std::cell::RefCell::new(Vec::new()) };
}

pub unsafe extern "C" fn record_run(
    id: i32,
    native: usize,
    stack_base: usize,
    stack_end: usize,
    tla: usize,
    ref_map: usize,
    yellow_zone: usize,
) {
    let local = 0u8;
    RUNS.lock().push(RunRecord {
        id,
        native,
        stack_base,
        stack_end,
        tla,
        ref_map,
        yellow_zone,
        local_address: std::ptr::addr_of!(local) as usize,
    });
}

pub unsafe extern "C" fn record_attach(
    native: usize,
    name: usize,
    group: usize,
    daemon: i32,
    stack_base: usize,
    stack_end: usize,
    tla: usize,
    _ref_map: usize,
    _yellow_zone: usize,
) -> i32 {
    let name = (name != 0).then(|| {
        // SAFETY: the substrate passes a NUL-terminated string or 0.
        unsafe { CStr::from_ptr(name as *const c_char) }
            .to_string_lossy()
            .into_owned()
    });
    ATTACHES.with(|a| {
        a.borrow_mut().push(AttachRecord {
            native,
            name,
            group,
            daemon,
            stack_base,
            stack_end,
            tla,
        });
    });
    ATTACH_STATUS.with(Cell::get)
}

pub unsafe extern "C" fn record_detach(tla: usize) {
    DETACHES.lock().push(tla);
}

pub const RUN: RunUpcall = record_run;
pub const ATTACH: AttachUpcall = record_attach;
pub const DETACH: DetachUpcall = record_detach;

pub fn all_upcalls() -> Upcalls {
    Upcalls {
        run: Some(RUN),
        attach: Some(ATTACH),
        detach: Some(DETACH),
    }
}

pub fn image_with(upcalls: Upcalls) -> Arc<BootImage> {
    Arc::new(BootImage::synthetic(ImageHeader::host_default(), upcalls).unwrap())
}

pub fn substrate() -> Arc<Substrate> {
    Substrate::new(image_with(all_upcalls())).unwrap()
}

pub fn runs_for(id: i32) -> Vec<RunRecord> {
    RUNS.lock().iter().filter(|r| r.id == id).copied().collect()
}

pub fn attaches_on_this_thread() -> Vec<AttachRecord> {
    ATTACHES.with(|a| a.borrow().clone())
}
