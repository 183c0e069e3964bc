//! Reporting gathered threads to a debugger session.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::view::ThreadLocalsView;
use crate::structured_log::{LogLevel, report};
use crate::thread::ThreadLocalsLayout;

/// Execution state of a thread as the debugger observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Suspended,
    Running,
    Terminated,
    Breakpoint,
    Watchpoint,
}

impl ThreadState {
    /// Wire ordinal passed to debugger front ends.
    #[must_use]
    pub const fn ordinal(self) -> i32 {
        self as i32
    }
}

/// One thread as reported to the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatheredThread {
    pub id: i32,
    /// Debugger-side handle (e.g. an LWP id).
    pub local_handle: i64,
    /// OS thread handle from the thread's native info.
    pub handle: usize,
    pub state: ThreadState,
    pub instruction_pointer: usize,
    pub stack_base: usize,
    pub stack_size: usize,
    pub tl_block: usize,
    pub tl_block_size: usize,
    pub tla_size: usize,
}

/// Receiver of gathered threads.
pub trait DebuggerSession {
    /// Collection the session accumulates threads into.
    type ThreadList;

    fn gather_thread(&mut self, list: &mut Self::ThreadList, thread: GatheredThread);
}

/// Session that appends every thread to a `Vec`.
#[derive(Debug, Default)]
pub struct CollectingSession {
    pub gathered: usize,
}

impl DebuggerSession for CollectingSession {
    type ThreadList = Vec<GatheredThread>;

    fn gather_thread(&mut self, list: &mut Vec<GatheredThread>, thread: GatheredThread) {
        self.gathered += 1;
        list.push(thread);
    }
}

/// Build the record for one thread and hand it to `session`.
///
/// Without a thread locals area (a native thread, or one that has not yet
/// registered) the record is empty except for an id derived from
/// `local_handle` and forced negative.
pub fn gather_thread<S: DebuggerSession>(
    session: &mut S,
    list: &mut S::ThreadList,
    layout: &ThreadLocalsLayout,
    local_handle: i64,
    state: ThreadState,
    instruction_pointer: usize,
    tla: Option<&ThreadLocalsView<'_>>,
) -> GatheredThread {
    let (id, native) = match tla {
        Some(view) => (view.id(), view.native().unwrap_or_default()),
        None => {
            let id = local_handle as i32;
            (if id < 0 { id } else { -id }, Default::default())
        }
    };
    let thread = GatheredThread {
        id,
        local_handle,
        handle: native.handle,
        state,
        instruction_pointer,
        stack_base: native.stack_base,
        stack_size: native.stack_size,
        tl_block: native.tl_block,
        tl_block_size: native.tl_block_size,
        tla_size: layout.tla_size,
    };
    report(
        LogLevel::Debug,
        "tele",
        "tele.gathered_thread",
        None,
        Some(json!({
            "id": thread.id,
            "local_handle": thread.local_handle,
            "handle": thread.handle,
            "pc": thread.instruction_pointer,
            "stack_base": thread.stack_base,
            "stack_end": thread.stack_base.wrapping_add(thread.stack_size),
            "stack_size": thread.stack_size,
            "tlb": thread.tl_block,
            "tlb_size": thread.tl_block_size,
            "tla_size": thread.tla_size,
        })),
    );
    session.gather_thread(list, thread);
    thread
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageHeader;
    use crate::thread::NativeThreadLocals;

    fn layout() -> ThreadLocalsLayout {
        ThreadLocalsLayout::from_header(&ImageHeader::host_default()).unwrap()
    }

    #[test]
    fn missing_tla_yields_negative_id_and_zeroes() {
        let layout = layout();
        let mut session = CollectingSession::default();
        let mut list = Vec::new();
        let t = gather_thread(&mut session, &mut list, &layout, 4242, ThreadState::Suspended, 0x40, None);
        assert_eq!(t.id, -4242);
        assert_eq!(t.handle, 0);
        assert_eq!(t.stack_base, 0);
        assert_eq!(t.tl_block, 0);
        assert_eq!(t.tla_size, layout.tla_size);
        assert_eq!(t.instruction_pointer, 0x40);
        assert_eq!(list, vec![t]);
        assert_eq!(session.gathered, 1);

        let t = gather_thread(&mut session, &mut list, &layout, -7, ThreadState::Running, 0, None);
        assert_eq!(t.id, -7);
    }

    #[test]
    fn present_tla_reports_native_info() {
        let layout = layout();
        let word = std::mem::size_of::<usize>();
        let mut area = vec![0u8; layout.tla_size];
        area[layout.slot_offset(layout.id)..][..word].copy_from_slice(&12usize.to_ne_bytes());
        let native = NativeThreadLocals {
            handle: 0x99,
            stack_base: 0x7000,
            stack_size: 0x1000,
            stack_yellow_zone: 0x8000,
            tl_block: 0x5000,
            tl_block_size: 0x300,
        };
        let view = ThreadLocalsView::new(&layout, 0x5080, &area, Some(native));
        let mut session = CollectingSession::default();
        let mut list = Vec::new();
        let t = gather_thread(
            &mut session,
            &mut list,
            &layout,
            3,
            ThreadState::Breakpoint,
            0x1234,
            Some(&view),
        );
        assert_eq!(t.id, 12);
        assert_eq!(t.handle, 0x99);
        assert_eq!(t.stack_size, 0x1000);
        assert_eq!(t.tl_block_size, 0x300);
        assert_eq!(t.state.ordinal(), 3);
    }

    #[test]
    fn gathered_thread_serializes_state_in_snake_case() {
        let json = serde_json::to_value(ThreadState::Watchpoint).unwrap();
        assert_eq!(json, "watchpoint");
    }
}
