//! CLI entrypoint for the vmsubstrate verification harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use vmsubstrate_core::structured_log::{self, LogEmitter, install_emitter};
use vmsubstrate_harness::{ProbeRequest, SmokeConfig, parse_address, run_smoke, validate_log_file};

/// Verification tooling for vmsubstrate.
#[derive(Debug, Parser)]
#[command(name = "vmsubstrate-harness")]
#[command(about = "Verification harness for the vmsubstrate thread substrate")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start, attach and remotely locate threads on a synthetic image.
    Smoke {
        /// Threads to create through the run upcall.
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Stack size of created threads, in pages.
        #[arg(long, default_value_t = 64)]
        stack_pages: usize,
        /// Write structured JSONL logs here instead of stderr.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Find the thread locals whose stack contains an address in another process.
    Probe {
        /// Target process id.
        #[arg(long)]
        pid: i32,
        /// Address of the first area on the thread list (hex or decimal).
        #[arg(long, value_parser = parse_address)]
        head: usize,
        /// Address of the primordial area, checked when no listed thread matches.
        #[arg(long, value_parser = parse_address, default_value = "0")]
        primordial: usize,
        /// Stack address to look up.
        #[arg(long, value_parser = parse_address)]
        sp: usize,
        /// Target word size in bytes; defaults to the host's.
        #[arg(long, default_value_t = 0)]
        word_size: i32,
        /// Target is big endian.
        #[arg(long)]
        big_endian: bool,
    },
    /// Validate a structured JSONL log.
    ValidateLog {
        /// JSONL log path.
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Smoke {
            threads,
            stack_pages,
            log,
        } => {
            if let Some(path) = &log {
                let run_id = format!("smoke-{}", std::process::id());
                install_emitter(LogEmitter::to_file(path, &run_id)?);
            }
            let report = run_smoke(SmokeConfig {
                threads,
                stack_pages,
            })?;
            structured_log::flush()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.passed() {
                let failed: Vec<_> = report
                    .checks()
                    .into_iter()
                    .filter(|(_, ok)| !ok)
                    .map(|(name, _)| name)
                    .collect();
                return Err(format!("smoke checks failed: {}", failed.join(", ")).into());
            }
        }
        Command::Probe {
            pid,
            head,
            primordial,
            sp,
            word_size,
            big_endian,
        } => {
            let request = ProbeRequest {
                pid,
                registry_head: head,
                primordial,
                sp,
                word_size,
                big_endian,
            };
            #[cfg(target_os = "linux")]
            {
                let report = vmsubstrate_harness::probe::probe_pid(&request)?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                if report.tla.is_none() {
                    eprintln!("No thread of pid {pid} has {sp:#x} on its stack");
                }
            }
            #[cfg(not(target_os = "linux"))]
            {
                return Err(format!("probing pid {} needs process_vm_readv", request.pid).into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for error in &errors {
                eprintln!("{error}");
            }
            println!("{} lines, {} errors", lines, errors.len());
            if !errors.is_empty() {
                return Err(format!("{} invalid log entries in {}", errors.len(), log.display()).into());
            }
        }
    }

    Ok(())
}
