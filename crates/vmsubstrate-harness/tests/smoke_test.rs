use vmsubstrate_harness::{SmokeConfig, run_smoke};

/// Whether this process may read its own memory through `process_vm_readv`.
#[cfg(target_os = "linux")]
fn process_vm_available() -> bool {
    use vmsubstrate_core::ProcessMemory;
    use vmsubstrate_core::tele::ProcessVm;

    let source = [7u8; 8];
    let mut out = [0u8; 8];
    ProcessVm::new(std::process::id() as i32)
        .read(source.as_ptr() as usize, &mut out)
        .is_ok_and(|n| n == 8 && out == source)
}

#[cfg(not(target_os = "linux"))]
fn process_vm_available() -> bool {
    false
}

#[test]
fn smoke_run_starts_joins_and_detaches() {
    let report = run_smoke(SmokeConfig {
        threads: 6,
        stack_pages: 32,
    })
    .unwrap();
    assert_eq!(report.threads_started, 6);
    assert_eq!(report.runs_on_own_stack, 6);
    assert!(report.registry_empty_after_join);
    assert!(report.detach_upcalled);
    assert_ne!(report.attached_tla, 0);

    if process_vm_available() {
        assert_eq!(report.found_tla, Some(report.attached_tla));
        let gathered = report.gathered.unwrap();
        assert!(gathered.id < 0);
        assert!(report.passed());
    }
}

#[test]
fn consecutive_runs_use_fresh_ids() {
    let first = run_smoke(SmokeConfig::default()).unwrap();
    let second = run_smoke(SmokeConfig::default()).unwrap();
    assert_eq!(first.runs_on_own_stack, first.threads_started);
    assert_eq!(second.runs_on_own_stack, second.threads_started);
}

#[test]
fn smoke_report_serializes_checks_inputs() {
    let report = run_smoke(SmokeConfig {
        threads: 1,
        stack_pages: 16,
    })
    .unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["threads_started"], 1);
    assert!(json["remote_path"].is_string());
    assert!(json.get("gathered").is_some());
}
