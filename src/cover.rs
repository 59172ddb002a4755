//! kcov driver: per-thread coverage collection with a disabled fallback.
//!
//! The kernel writes into a shared mapping whose first word is the entry
//! count; the payload is either raw PCs (`TRACE_PC`) or four-word comparison
//! records (`TRACE_CMP`). When kcov is missing or refuses to enable, the
//! handle degrades to reporting zero coverage instead of failing the run.

use crate::COVER_SIZE;
use nix::{request_code_none, request_code_read};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::{io, mem, ptr, slice};

pub const KCOV_PATH: &str = "/sys/kernel/debug/kcov";

const KCOV_MAGIC: u8 = b'c';
const KCOV_INIT_TRACE: u8 = 1;
const KCOV_ENABLE: u8 = 100;
const KCOV_DISABLE: u8 = 101;

const KCOV_TRACE_PC: u64 = 0;
const KCOV_TRACE_CMP: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Pc,
    Cmp,
}

impl Mode {
    fn trace_arg(self) -> u64 {
        match self {
            Mode::Pc => KCOV_TRACE_PC,
            Mode::Cmp => KCOV_TRACE_CMP,
        }
    }
}

struct Mapped {
    file: File,
    mem: *mut u64,
    enabled: Option<Mode>,
}

impl Drop for Mapped {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mem.cast(), COVER_SIZE * mem::size_of::<u64>());
        }
    }
}

/// One per-thread coverage handle.
pub struct CovHandle {
    inner: Option<Mapped>,
}

// The mapping is only touched from the owning thread.
unsafe impl Send for CovHandle {}

impl CovHandle {
    pub fn open() -> CovHandle {
        match Self::try_open() {
            Ok(mapped) => CovHandle {
                inner: Some(mapped),
            },
            Err(e) => {
                log::debug!("kcov unavailable, coverage disabled: {}", e);
                CovHandle { inner: None }
            }
        }
    }

    fn try_open() -> io::Result<Mapped> {
        let file = OpenOptions::new().read(true).write(true).open(KCOV_PATH)?;
        let fd = file.as_raw_fd();
        unsafe {
            if libc::ioctl(
                fd,
                request_code_read!(KCOV_MAGIC, KCOV_INIT_TRACE, mem::size_of::<usize>()),
                COVER_SIZE,
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }
            let map = libc::mmap(
                ptr::null_mut(),
                COVER_SIZE * mem::size_of::<u64>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            if map == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Mapped {
                file,
                mem: map as *mut u64,
                enabled: None,
            })
        }
    }

    /// Pins collection to the calling thread. Re-enables on a mode change;
    /// an enable failure degrades the handle to the disabled fallback.
    pub fn enable(&mut self, mode: Mode) {
        let ok = match self.inner.as_mut() {
            None => return,
            Some(mapped) => {
                if mapped.enabled == Some(mode) {
                    return;
                }
                let fd = mapped.file.as_raw_fd();
                unsafe {
                    if mapped.enabled.is_some() {
                        libc::ioctl(fd, request_code_none!(KCOV_MAGIC, KCOV_DISABLE), 0);
                        mapped.enabled = None;
                    }
                    if libc::ioctl(fd, request_code_none!(KCOV_MAGIC, KCOV_ENABLE), mode.trace_arg())
                        == 0
                    {
                        mapped.enabled = Some(mode);
                        true
                    } else {
                        log::debug!(
                            "kcov enable failed, coverage disabled: {}",
                            io::Error::last_os_error()
                        );
                        false
                    }
                }
            }
        };
        if !ok {
            self.inner = None;
        }
    }

    /// Zeroes the count word.
    pub fn reset(&self) {
        if let Some(mapped) = &self.inner {
            unsafe { ptr::write_volatile(mapped.mem, 0) }
        }
    }

    /// Count word plus the payload view behind it.
    pub fn read(&self) -> (u64, &[u64]) {
        match &self.inner {
            Some(mapped) => unsafe {
                let n = ptr::read_volatile(mapped.mem);
                let payload = slice::from_raw_parts(mapped.mem.add(1), COVER_SIZE - 1);
                (n, payload)
            },
            None => (0, &[]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // kcov is usually absent on build machines; the fallback must behave.
    #[test]
    fn disabled_fallback_reports_zero() {
        let mut cov = CovHandle::open();
        cov.enable(Mode::Pc);
        cov.reset();
        let (n, payload) = cov.read();
        if cov.inner.is_none() {
            assert_eq!(n, 0);
            assert!(payload.is_empty());
        } else {
            assert_eq!(payload.len(), COVER_SIZE - 1);
        }
    }

    #[test]
    fn mode_switch_does_not_panic() {
        let mut cov = CovHandle::open();
        cov.enable(Mode::Pc);
        cov.enable(Mode::Cmp);
        cov.enable(Mode::Cmp);
        cov.reset();
        let _ = cov.read();
    }
}
