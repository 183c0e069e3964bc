//! Debugger-driven reads and writes of target memory.

use serde_json::json;

use super::process::ProcessMemory;
use crate::config::TraceChannel;
use crate::error::{SubstrateError, SubstrateResult};
use crate::structured_log::{LogLevel, report, trace};

const STAGING_WORD: usize = std::mem::size_of::<usize>();

/// A byte array owned by the debugger's runtime, reachable only through region
/// copies.
pub trait ManagedByteArray {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `out.len()` bytes starting at `offset` into `out`.
    fn get_region(&self, offset: usize, out: &mut [u8]) -> Result<(), String>;

    /// Copy `data` into the array starting at `offset`.
    fn set_region(&mut self, offset: usize, data: &[u8]) -> Result<(), String>;
}

impl ManagedByteArray for Vec<u8> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn get_region(&self, offset: usize, out: &mut [u8]) -> Result<(), String> {
        let end = offset
            .checked_add(out.len())
            .filter(|&end| end <= Vec::len(self))
            .ok_or_else(|| format!("region {offset}+{} outside {} bytes", out.len(), Vec::len(self)))?;
        out.copy_from_slice(&self[offset..end]);
        Ok(())
    }

    fn set_region(&mut self, offset: usize, data: &[u8]) -> Result<(), String> {
        let len = Vec::len(self);
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= len)
            .ok_or_else(|| format!("region {offset}+{} outside {len} bytes", data.len()))?;
        self[offset..end].copy_from_slice(data);
        Ok(())
    }
}

/// Local side of a transfer.
pub enum BufferDescriptor<'a> {
    /// Directly addressable memory; bytes are copied in place.
    Direct { buffer: &'a mut [u8], offset: usize },
    /// A managed array; bytes are staged through a temporary buffer.
    Managed {
        array: &'a mut dyn ManagedByteArray,
        offset: usize,
    },
}

fn out_of_bounds(op: &str, offset: usize, len: usize, capacity: usize) -> SubstrateError {
    report(
        LogLevel::Error,
        "tele",
        "tele_buffer_out_of_bounds",
        None,
        Some(json!({ "op": op, "offset": offset, "len": len, "capacity": capacity })),
    );
    SubstrateError::BufferOutOfBounds {
        offset,
        len,
        capacity,
    }
}

fn check_range(op: &str, offset: usize, len: usize, capacity: usize) -> SubstrateResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(out_of_bounds(op, offset, len, capacity)),
    }
}

/// Word-sized stack buffer, or a heap buffer for anything longer.
enum Staging {
    Word([u8; STAGING_WORD], usize),
    Heap(Vec<u8>),
}

impl Staging {
    fn new(len: usize) -> SubstrateResult<Self> {
        if len <= STAGING_WORD {
            return Ok(Self::Word([0; STAGING_WORD], len));
        }
        let mut heap = Vec::new();
        if heap.try_reserve_exact(len).is_err() {
            report(
                LogLevel::Error,
                "tele",
                "tele_staging_allocation_failed",
                None,
                Some(json!({ "len": len })),
            );
            return Err(SubstrateError::AllocationFailed(len));
        }
        heap.resize(len, 0);
        Ok(Self::Heap(heap))
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Word(word, len) => &mut word[..*len],
            Self::Heap(heap) => heap,
        }
    }
}

/// Copy `len` bytes from target address `src` into `dst`.
///
/// Returns the number of bytes transferred, which may be short.
pub fn read_memory(
    process: &dyn ProcessMemory,
    src: usize,
    dst: BufferDescriptor<'_>,
    len: usize,
) -> SubstrateResult<usize> {
    trace(TraceChannel::Tele, "tele.read", || json!({ "src": src, "len": len }));
    let remote_error = |err: std::io::Error| {
        report(
            LogLevel::Error,
            "tele",
            "tele_read_failed",
            err.raw_os_error(),
            Some(json!({ "src": src, "len": len })),
        );
        SubstrateError::RemoteRead {
            address: src,
            len,
            reason: err.to_string(),
        }
    };
    match dst {
        BufferDescriptor::Direct { buffer, offset } => {
            check_range("read", offset, len, buffer.len())?;
            process
                .read(src, &mut buffer[offset..offset + len])
                .map_err(remote_error)
        }
        BufferDescriptor::Managed { array, offset } => {
            check_range("read", offset, len, array.len())?;
            let mut staging = Staging::new(len)?;
            let staged = staging.bytes_mut();
            let n = process.read(src, staged).map_err(remote_error)?;
            if n > 0 {
                array.set_region(offset, &staged[..n]).map_err(|reason| {
                    report(
                        LogLevel::Error,
                        "tele",
                        "tele_managed_array_failed",
                        None,
                        Some(json!({ "op": "read", "reason": reason })),
                    );
                    SubstrateError::ManagedArray(reason)
                })?;
            }
            Ok(n)
        }
    }
}

/// Copy `len` bytes from `src` to target address `dst`.
///
/// Returns the number of bytes transferred, which may be short.
pub fn write_memory(
    process: &dyn ProcessMemory,
    dst: usize,
    src: BufferDescriptor<'_>,
    len: usize,
) -> SubstrateResult<usize> {
    trace(TraceChannel::Tele, "tele.write", || json!({ "dst": dst, "len": len }));
    let remote_error = |err: std::io::Error| {
        report(
            LogLevel::Error,
            "tele",
            "tele_write_failed",
            err.raw_os_error(),
            Some(json!({ "dst": dst, "len": len })),
        );
        SubstrateError::RemoteWrite {
            address: dst,
            len,
            reason: err.to_string(),
        }
    };
    match src {
        BufferDescriptor::Direct { buffer, offset } => {
            check_range("write", offset, len, buffer.len())?;
            process
                .write(dst, &buffer[offset..offset + len])
                .map_err(remote_error)
        }
        BufferDescriptor::Managed { array, offset } => {
            check_range("write", offset, len, array.len())?;
            let mut staging = Staging::new(len)?;
            let staged = staging.bytes_mut();
            array.get_region(offset, staged).map_err(|reason| {
                report(
                    LogLevel::Error,
                    "tele",
                    "tele_managed_array_failed",
                    None,
                    Some(json!({ "op": "write", "reason": reason })),
                );
                SubstrateError::ManagedArray(reason)
            })?;
            process.write(dst, staged).map_err(remote_error)
        }
    }
}
