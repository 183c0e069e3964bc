use serde_json::json;

use super::process::ProcessMemory;
use super::view::{Loaded, TeleScratch, ThreadLocalsView};
use crate::config::{TraceChannel, config};
use crate::structured_log::{LogLevel, report, trace};
use crate::thread::ThreadLocalsLayout;

/// Locate the thread locals area whose stack contains `sp`.
///
/// Walks the list starting at `registry_head` along `FORWARD_LINK` words, copying
/// each area and then its native info, and falls back to `primordial` when no
/// listed thread matches. Either address may be 0. No lock is taken: an area
/// that cannot be read ends the walk, and the walk visits at most the configured
/// number of areas.
pub fn find_thread_locals<'s>(
    process: &dyn ProcessMemory,
    layout: &'s ThreadLocalsLayout,
    registry_head: usize,
    primordial: usize,
    sp: usize,
    scratch: &'s mut TeleScratch,
) -> Option<ThreadLocalsView<'s>> {
    let max_hops = config().tele_max_hops;
    let mut tla = registry_head;
    let mut hops = 0usize;
    let mut found = None;

    while tla != 0 {
        if hops == max_hops {
            report(
                LogLevel::Warn,
                "tele",
                "tele_walk_bounded",
                None,
                Some(json!({ "head": registry_head, "hops": hops, "next": tla })),
            );
            break;
        }
        hops += 1;
        if scratch.load(process, layout, tla) == Loaded::Unreadable {
            trace(TraceChannel::Tele, "tele.find.unreadable", || {
                json!({ "tla": tla, "hops": hops })
            });
            break;
        }
        trace(TraceChannel::Tele, "tele.find.visit", || json!({ "tla": tla, "sp": sp }));
        if scratch.stack_contains(layout, sp) {
            found = Some(tla);
            break;
        }
        tla = scratch.forward_link(layout);
    }

    if found.is_none()
        && primordial != 0
        && scratch.load(process, layout, primordial) == Loaded::Area
        && scratch.stack_contains(layout, sp)
    {
        found = Some(primordial);
    }

    trace(TraceChannel::Tele, "tele.find.done", || {
        json!({ "sp": sp, "found": found, "hops": hops })
    });
    let scratch: &'s TeleScratch = scratch;
    found.map(|address| scratch.view(layout, address))
}
