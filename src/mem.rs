//! Fault-swallowing guest memory access.
//!
//! Addresses come straight from the program under execution and may point
//! anywhere. Every access goes through `process_vm_readv`/`process_vm_writev`
//! aimed at our own pid: a wild pointer surfaces as `EFAULT` from the kernel
//! instead of a segfault, so a bad access degrades quietly (reads yield
//! `DEFAULT_VALUE`, writes no-op) and never takes the process down.

use crate::{Error, Result, DEFAULT_VALUE, MAX_INPUT};
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;
use std::io::{IoSlice, IoSliceMut};

fn vm_read(addr: u64, buf: &mut [u8]) -> bool {
    if buf.is_empty() {
        return true;
    }
    let len = buf.len();
    let remote = [RemoteIoVec {
        base: addr as usize,
        len,
    }];
    let mut local = [IoSliceMut::new(buf)];
    matches!(process_vm_readv(Pid::this(), &mut local, &remote), Ok(n) if n == len)
}

fn vm_write(addr: u64, buf: &[u8]) -> bool {
    if buf.is_empty() {
        return true;
    }
    let len = buf.len();
    let remote = [RemoteIoVec {
        base: addr as usize,
        len,
    }];
    let local = [IoSlice::new(buf)];
    matches!(process_vm_writev(Pid::this(), &local, &remote), Ok(n) if n == len)
}

fn check_size(size: u64) -> Result<usize> {
    match size {
        1 | 2 | 4 | 8 => Ok(size as usize),
        _ => Err(Error::Input(format!("bad memory access size {}", size))),
    }
}

/// Writes exactly `size` bytes of `val` at `addr`. With `bf_len > 0` only
/// bits `[bf_off, bf_off + bf_len)` of the destination change; the rest is
/// read back and preserved. Faults swallow the store.
pub fn write_guest(addr: u64, val: u64, size: u64, bf_off: u64, bf_len: u64) -> Result<()> {
    let size = check_size(size)?;
    let word = if bf_len == 0 {
        val
    } else {
        let bits = size as u64 * 8;
        if bf_off >= bits || bf_off.checked_add(bf_len).map_or(true, |end| end > bits) {
            return Err(Error::Input(format!(
                "bad bitfield {}+{} for size {}",
                bf_off, bf_len, size
            )));
        }
        let mut cur = [0u8; 8];
        if !vm_read(addr, &mut cur[..size]) {
            return Ok(());
        }
        let old = u64::from_le_bytes(cur);
        let mask = bitmask(bf_off, bf_len);
        (old & !mask) | ((val << bf_off) & mask)
    };
    let bytes = word.to_le_bytes();
    vm_write(addr, &bytes[..size]);
    Ok(())
}

/// Reads `size` bytes little-endian; `DEFAULT_VALUE` on fault.
pub fn read_guest(addr: u64, size: u64) -> Result<u64> {
    let size = check_size(size)?;
    let mut buf = [0u8; 8];
    if !vm_read(addr, &mut buf[..size]) {
        return Ok(DEFAULT_VALUE);
    }
    Ok(u64::from_le_bytes(buf))
}

/// Bytewise copy into guest memory; faults swallow the whole copy.
pub fn write_bytes_guest(addr: u64, data: &[u8]) {
    vm_write(addr, data);
}

/// Bytewise read from guest memory; `None` on fault or an absurd length.
pub fn read_bytes_guest(addr: u64, len: u64) -> Option<Vec<u8>> {
    if len as usize > MAX_INPUT {
        return None;
    }
    let mut buf = vec![0u8; len as usize];
    if vm_read(addr, &mut buf) {
        Some(buf)
    } else {
        None
    }
}

fn bitmask(off: u64, len: u64) -> u64 {
    let ones = if len >= 64 {
        u64::MAX
    } else {
        (1u64 << len) - 1
    };
    ones << off
}

#[cfg(test)]
mod tests {
    use super::*;

    // low pages are never mapped (mmap_min_addr)
    const WILD_ADDR: u64 = 0x50;

    fn addr_of<T>(v: &T) -> u64 {
        v as *const T as u64
    }

    #[test]
    fn store_then_load_masks_to_size() {
        let cell = Box::new(0u64);
        let addr = addr_of(&*cell);
        let val = 0x1234_5678_9abc_def0u64;
        for &size in &[1u64, 2, 4, 8] {
            write_guest(addr, 0, 8, 0, 0).unwrap();
            write_guest(addr, val, size, 0, 0).unwrap();
            let mask = if size == 8 {
                u64::MAX
            } else {
                (1 << (size * 8)) - 1
            };
            assert_eq!(read_guest(addr, size).unwrap(), val & mask);
        }
    }

    #[test]
    fn bitfield_store_preserves_outside_bits() {
        let cell = Box::new(0xffu8);
        let addr = addr_of(&*cell);
        // bits [2,5) <- 0b101: 0b1111_1111 becomes 0b1111_0111
        write_guest(addr, 0b101, 1, 2, 3).unwrap();
        assert_eq!(*cell, 0b1111_0111);
    }

    #[test]
    fn bitfield_store_into_wider_unit() {
        let cell = Box::new(0u32);
        let addr = addr_of(&*cell);
        write_guest(addr, 0x3, 4, 16, 2).unwrap();
        assert_eq!(*cell, 0x3 << 16);
    }

    #[test]
    fn bad_sizes_and_bitfields_are_input_errors() {
        let cell = Box::new(0u64);
        let addr = addr_of(&*cell);
        assert!(matches!(
            write_guest(addr, 0, 3, 0, 0),
            Err(Error::Input(_))
        ));
        assert!(matches!(read_guest(addr, 0), Err(Error::Input(_))));
        assert!(matches!(
            write_guest(addr, 0, 1, 7, 4),
            Err(Error::Input(_))
        ));
    }

    #[test]
    fn faulted_read_yields_default_value() {
        assert_eq!(read_guest(WILD_ADDR, 8).unwrap(), DEFAULT_VALUE);
        assert!(read_bytes_guest(WILD_ADDR, 16).is_none());
    }

    #[test]
    fn faulted_write_is_swallowed() {
        write_guest(WILD_ADDR, 0xdead, 8, 0, 0).unwrap();
        write_guest(WILD_ADDR, 1, 1, 2, 3).unwrap();
        write_bytes_guest(WILD_ADDR, b"data");
    }

    #[test]
    fn byte_copies_roundtrip() {
        let cell = Box::new([0u8; 16]);
        let addr = addr_of(&*cell);
        write_bytes_guest(addr, b"copyin-payload");
        let back = read_bytes_guest(addr, 14).unwrap();
        assert_eq!(&back, b"copyin-payload");
    }
}
