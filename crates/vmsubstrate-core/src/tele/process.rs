use std::io;

/// Byte-level access to another address space.
///
/// Both operations may transfer fewer bytes than requested; the count is
/// returned.
pub trait ProcessMemory {
    fn read(&self, address: usize, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, address: usize, data: &[u8]) -> io::Result<usize>;

    /// Read exactly `buf.len()` bytes.
    fn read_exact(&self, address: usize, buf: &mut [u8]) -> io::Result<()> {
        let n = self.read(address, buf)?;
        if n == buf.len() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read at {address:#x}: {n} of {} bytes", buf.len()),
            ))
        }
    }
}

impl<P: ProcessMemory + ?Sized> ProcessMemory for &P {
    fn read(&self, address: usize, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(address, buf)
    }

    fn write(&self, address: usize, data: &[u8]) -> io::Result<usize> {
        (**self).write(address, data)
    }
}

/// A live process accessed with `process_vm_readv`/`process_vm_writev`.
///
/// The caller needs ptrace permission over the target.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessVm {
    pid: libc::pid_t,
}

#[cfg(target_os = "linux")]
impl ProcessVm {
    #[must_use]
    pub const fn new(pid: i32) -> Self {
        Self { pid }
    }

    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.pid
    }
}

#[cfg(target_os = "linux")]
impl ProcessMemory for ProcessVm {
    fn read(&self, address: usize, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: address as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: `local` describes a writable buffer we own; the kernel
        // validates the remote range.
        let n = unsafe { libc::process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write(&self, address: usize, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let local = libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        };
        let remote = libc::iovec {
            iov_base: address as *mut libc::c_void,
            iov_len: data.len(),
        };
        // SAFETY: the kernel only reads from `local` and validates the remote range.
        let n = unsafe { libc::process_vm_writev(self.pid, &local, 1, &remote, 1, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

/// The current address space, for in-process introspection.
#[derive(Debug)]
pub struct LocalProcess {
    _private: (),
}

impl LocalProcess {
    /// # Safety
    ///
    /// Every address later passed to `read` or `write` must be valid for the
    /// requested length at the time of the call, and writes must not break
    /// invariants of the memory they overwrite.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl ProcessMemory for LocalProcess {
    fn read(&self, address: usize, buf: &mut [u8]) -> io::Result<usize> {
        if address == 0 {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }
        // SAFETY: guaranteed by the contract of `LocalProcess::new`.
        unsafe {
            std::ptr::copy(address as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(buf.len())
    }

    fn write(&self, address: usize, data: &[u8]) -> io::Result<usize> {
        if address == 0 {
            return Err(io::Error::from_raw_os_error(libc::EFAULT));
        }
        // SAFETY: guaranteed by the contract of `LocalProcess::new`.
        unsafe {
            std::ptr::copy(data.as_ptr(), address as *mut u8, data.len());
        }
        Ok(data.len())
    }
}
