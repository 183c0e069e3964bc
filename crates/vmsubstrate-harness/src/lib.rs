//! Verification harness for vmsubstrate.
//!
//! This crate provides:
//! - Smoke runs: boot a synthetic image, start and attach threads, then find
//!   them again through the out-of-process memory path
//! - Probes: locate a thread's locals in a live process by stack pointer
//! - Log validation: check JSONL logs emitted by the substrate

#![forbid(unsafe_code)]

pub mod log_validate;
pub mod probe;
pub mod smoke;

pub use log_validate::{LogValidationError, validate_log_file, validate_log_line};
pub use probe::{ProbeReport, ProbeRequest, parse_address, probe};
pub use smoke::{SmokeConfig, SmokeReport, run_smoke};

/// Failures surfaced by harness commands.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    Substrate(#[from] vmsubstrate_core::SubstrateError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("check failed: {0}")]
    Check(String),
}
