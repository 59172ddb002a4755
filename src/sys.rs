//! Syscall dispatch seam.
//!
//! The parent fuzzer and the executor agree on an operation numbering; the
//! executor only dispatches. The trait keeps the kernel out of unit tests:
//! scenario tests install closure-backed tables that poke memory instead of
//! the real thing.

use crate::MAX_ARGS;
use nix::errno::Errno;

#[derive(Debug, Clone, Copy)]
pub struct RawResult {
    pub res: i64,
    /// Captured unconditionally; whether it is reported depends on `res`.
    pub errno: i32,
}

/// Registry of callable operations indexed by number.
pub trait SyscallTable: Send + Sync {
    fn count(&self) -> u64;
    fn name(&self, num: u64) -> &str;
    fn invoke(&self, num: u64, args: &[u64; MAX_ARGS]) -> RawResult;
}

/// Pass-through table: operation number n is raw Linux syscall n.
pub struct RawTable {
    names: Vec<String>,
}

impl RawTable {
    pub fn new(count: u64) -> Self {
        Self {
            names: (0..count).map(|n| format!("syscall_{}", n)).collect(),
        }
    }
}

impl SyscallTable for RawTable {
    fn count(&self) -> u64 {
        self.names.len() as u64
    }

    fn name(&self, num: u64) -> &str {
        &self.names[num as usize]
    }

    fn invoke(&self, num: u64, args: &[u64; MAX_ARGS]) -> RawResult {
        // Linux consumes at most six arguments; the trailing slots ride
        // along for tables that route them elsewhere.
        Errno::clear();
        let res = unsafe {
            libc::syscall(
                num as libc::c_long,
                args[0],
                args[1],
                args[2],
                args[3],
                args[4],
                args[5],
            )
        };
        RawResult {
            res: res as i64,
            errno: Errno::last() as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_table_reports_count_and_names() {
        let table = RawTable::new(4);
        assert_eq!(table.count(), 4);
        assert_eq!(table.name(2), "syscall_2");
    }

    #[test]
    fn getpid_through_raw_dispatch() {
        let table = RawTable::new(512);
        let args = [0u64; MAX_ARGS];
        let r = table.invoke(libc::SYS_getpid as u64, &args);
        assert_eq!(r.res, std::process::id() as i64);
    }

    #[test]
    fn failing_syscall_captures_errno() {
        let table = RawTable::new(512);
        // closing a wildly invalid fd fails with EBADF
        let mut args = [0u64; MAX_ARGS];
        args[0] = u32::MAX as u64;
        let r = table.invoke(libc::SYS_close as u64, &args);
        assert_eq!(r.res, -1);
        assert_eq!(r.errno, libc::EBADF);
    }
}
