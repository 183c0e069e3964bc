//! Validation of substrate JSONL logs.

use std::path::Path;

use vmsubstrate_core::structured_log::LogEntry;

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "fatal"];

/// Validation error for a log line.
#[derive(Debug)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

fn error(line_number: usize, field: &str, message: impl Into<String>) -> LogValidationError {
    LogValidationError {
        line_number,
        field: field.to_string(),
        message: message.into(),
    }
}

/// Trace ids look like `<run_id>::<seq>` with a six-digit sequence number.
fn trace_id_is_well_formed(trace_id: &str) -> bool {
    match trace_id.rsplit_once("::") {
        Some((run, seq)) => {
            !run.is_empty() && seq.len() >= 6 && seq.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Validate a single JSONL line.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let mut errors = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            errors.push(error(line_number, "<json>", format!("invalid JSON: {e}")));
            return Err(errors);
        }
    };

    let Some(obj) = value.as_object() else {
        errors.push(error(line_number, "<root>", "expected JSON object"));
        return Err(errors);
    };

    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            errors.push(error(line_number, field, "required field missing"));
        }
    }

    if let Some(level) = obj.get("level").and_then(|v| v.as_str())
        && !LEVELS.contains(&level)
    {
        errors.push(error(line_number, "level", format!("invalid level: '{level}'")));
    }

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str())
        && !trace_id_is_well_formed(trace_id)
    {
        errors.push(error(
            line_number,
            "trace_id",
            format!("trace_id should follow <run_id>::<seq> format, got: '{trace_id}'"),
        ));
    }

    // errno and os_error travel together.
    if obj.get("errno").is_some_and(|v| !v.is_i64()) {
        errors.push(error(line_number, "errno", "errno must be an integer"));
    }
    if obj.contains_key("errno") && !obj.get("os_error").is_some_and(|v| v.is_string()) {
        errors.push(error(
            line_number,
            "os_error",
            "entries with errno must include os_error text",
        ));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value::<LogEntry>(value).map_err(|e| {
        vec![error(
            line_number,
            "<deserialization>",
            format!("failed to deserialize: {e}"),
        )]
    })
}

/// Validate an entire JSONL file.
///
/// Returns the total line count and any validation errors found.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    let mut all_errors = Vec::new();
    let mut line_count = 0;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }

    Ok((line_count, all_errors))
}
