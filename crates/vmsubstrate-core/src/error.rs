//! Substrate error type and errno helpers.

use thiserror::Error;

use crate::structured_log::{LogLevel, report};

/// Errors surfaced by substrate operations.
///
/// Fatal conditions never reach this type; they go through [`fatal_abort`] or
/// [`fatal_exit`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubstrateError {
    #[error("thread stack size {size} is not a multiple of the page size {page_size}")]
    StackSizeMisaligned { size: usize, page_size: usize },

    #[error("{op} failed: {}", errno_text(*errno))]
    Os { op: &'static str, errno: i32 },

    #[error("null native thread handle")]
    NullHandle,

    #[error("cannot attach thread to a runtime whose main thread has exited")]
    RuntimeExited,

    #[error("runtime rejected thread attach with status {0}")]
    AttachRejected(i32),

    #[error("thread is already attached to another substrate")]
    AttachedElsewhere,

    #[error("boot image thread list is already owned by another substrate")]
    ImageInUse,

    #[error("thread registration is stale or belongs to another thread")]
    StaleRegistration,

    #[error("boot image provides no {0} upcall")]
    MissingUpcall(&'static str),

    #[error("remote read of {len} bytes at {address:#x} failed: {reason}")]
    RemoteRead {
        address: usize,
        len: usize,
        reason: String,
    },

    #[error("remote write of {len} bytes at {address:#x} failed: {reason}")]
    RemoteWrite {
        address: usize,
        len: usize,
        reason: String,
    },

    #[error("buffer range {offset}+{len} exceeds capacity {capacity}")]
    BufferOutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("failed to allocate a {0}-byte staging buffer")]
    AllocationFailed(usize),

    #[error("managed array access failed: {0}")]
    ManagedArray(String),

    #[error("boot image is inconsistent: {0}")]
    InvalidImage(String),
}

impl SubstrateError {
    /// The OS errno carried by this error, if any.
    #[must_use]
    pub const fn errno(&self) -> Option<i32> {
        match self {
            Self::Os { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

pub type SubstrateResult<T> = Result<T, SubstrateError>;

/// OS error string for `errno` (the `strerror` rendering).
#[must_use]
pub fn errno_text(errno: i32) -> String {
    std::io::Error::from_raw_os_error(errno).to_string()
}

/// The calling thread's current errno.
#[must_use]
pub fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Log a fatal condition and abort the process.
pub fn fatal_abort(subsystem: &str, event: &str, errno: i32) -> ! {
    report(LogLevel::Fatal, subsystem, event, Some(errno), None);
    std::process::abort()
}

/// Log a fatal condition and exit the process with `code`.
pub fn fatal_exit(code: i32, subsystem: &str, event: &str, errno: i32) -> ! {
    report(LogLevel::Fatal, subsystem, event, Some(errno), None);
    std::process::exit(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_display_includes_operation_and_text() {
        let err = SubstrateError::Os {
            op: "pthread_join",
            errno: libc::ESRCH,
        };
        let text = err.to_string();
        assert!(text.starts_with("pthread_join failed: "));
        assert!(text.len() > "pthread_join failed: ".len());
        assert_eq!(err.errno(), Some(libc::ESRCH));
    }

    #[test]
    fn misaligned_display_names_both_sizes() {
        let err = SubstrateError::StackSizeMisaligned {
            size: 4097,
            page_size: 4096,
        };
        assert_eq!(
            err.to_string(),
            "thread stack size 4097 is not a multiple of the page size 4096"
        );
        assert_eq!(err.errno(), None);
    }

    #[test]
    fn errno_text_is_not_empty() {
        assert!(!errno_text(libc::EINTR).is_empty());
        assert_ne!(errno_text(libc::EINTR), errno_text(libc::ETIMEDOUT));
    }
}
