use std::path::PathBuf;

use vmsubstrate_core::structured_log::{LogEmitter, LogEntry, LogLevel};
use vmsubstrate_harness::validate_log_file;

fn scratch_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("vmsubstrate-{}-{name}.jsonl", std::process::id()))
}

#[test]
fn emitter_output_validates_cleanly() {
    let path = scratch_path("clean");
    {
        let mut emitter = LogEmitter::to_file(&path, "harness-test").unwrap();
        emitter.emit(LogLevel::Info, "smoke_started").unwrap();
        emitter
            .emit_entry(
                LogEntry::new(String::new(), LogLevel::Error, "thread_join_failed")
                    .with_subsystem("threads")
                    .with_errno(3)
                    .with_details(serde_json::json!({ "thread": 99 })),
            )
            .unwrap();
        emitter.flush().unwrap();
    }
    let (lines, errors) = validate_log_file(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(lines, 2);
    assert!(errors.is_empty(), "{errors:?}");
}

#[test]
fn corrupt_lines_are_counted_and_located() {
    let path = scratch_path("corrupt");
    std::fs::write(
        &path,
        concat!(
            r#"{"timestamp":"2026-01-01T00:00:00.000Z","trace_id":"r::000001","level":"info","event":"ok"}"#,
            "\n\n",
            "not json\n",
            r#"{"timestamp":"t","trace_id":"nope","level":"info","event":"e"}"#,
            "\n",
        ),
    )
    .unwrap();
    let (lines, errors) = validate_log_file(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(lines, 3);
    let located: Vec<_> = errors.iter().map(|e| (e.line_number, e.field.as_str())).collect();
    assert_eq!(located, vec![(3, "<json>"), (4, "trace_id")]);
}

#[test]
fn missing_file_is_an_io_error() {
    assert!(validate_log_file(&scratch_path("absent")).is_err());
}
