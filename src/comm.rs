//! Control-channel framing: magic-checked handshake and execute records,
//! env/exec flag parsing, and the fd bindings the parent sets up for us.
//!
//! Both directions of the protocol live here so the executor, drivers, and
//! tests share one set of record definitions. All fields are little-endian.

use crate::{Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use iota::iota;
use nix::unistd::{close, dup, dup2};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};

pub const IN_MAGIC: u64 = 0xbadc_0ffe_ebad_face;
pub const OUT_MAGIC: u32 = 0x0bad_f00d;

/// Control fds after remapping. Inherited stdin/stdout are moved up here so
/// the program under test can clobber the low descriptors freely.
pub const IN_PIPE_FD: RawFd = 250;
pub const OUT_PIPE_FD: RawFd = 251;

/// Per-process environment flags, fixed at handshake and echoed with every
/// execute request.
pub type EnvFlags = u64;

iota! {
    pub const FLAG_DEBUG: EnvFlags = 1 << (iota);      // verbose executor narration
    , FLAG_COVER                                       // kernel coverage is expected to work
    , FLAG_SANDBOX_SETUID                              // impersonate nobody user
    , FLAG_SANDBOX_NAMESPACE                           // use namespaces for sandboxing
    , FLAG_ENABLE_TUN                                  // setup and use /dev/tun
    , FLAG_ENABLE_FAULT_INJECTION                      // fault injection is configured
}

/// Per-execute behavior flags.
pub type ExecFlags = u64;

iota! {
    pub const FLAG_COLLECT_COVER: ExecFlags = 1 << (iota);  // collect raw coverage PCs
    , FLAG_DEDUP_COVER                                      // sort/unique PCs in the executor
    , FLAG_INJECT_FAULT                                     // inject a fault into one call
    , FLAG_COLLECT_COMPS                                    // collect comparison operands
    , FLAG_THREADED                                         // use the worker pool
    , FLAG_COLLIDE                                          // replay to provoke races
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sandbox {
    None,
    Setuid,
    Namespace,
}

/// Parsed environment flags. Sandbox construction itself is the embedder's
/// concern; the executor only carries the choice.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub debug: bool,
    pub cover: bool,
    pub sandbox: Sandbox,
    pub enable_tun: bool,
    pub enable_fault_injection: bool,
    pub pid: u64,
}

impl EnvConfig {
    pub fn parse(flags: EnvFlags, pid: u64) -> Self {
        // setuid wins when both sandbox bits are set
        let sandbox = if flags & FLAG_SANDBOX_SETUID != 0 {
            Sandbox::Setuid
        } else if flags & FLAG_SANDBOX_NAMESPACE != 0 {
            Sandbox::Namespace
        } else {
            Sandbox::None
        };
        Self {
            debug: flags & FLAG_DEBUG != 0,
            cover: flags & FLAG_COVER != 0,
            sandbox,
            enable_tun: flags & FLAG_ENABLE_TUN != 0,
            enable_fault_injection: flags & FLAG_ENABLE_FAULT_INJECTION != 0,
            pid,
        }
    }
}

/// Parsed execute flags plus the fault nomination.
#[derive(Debug, Clone, Default)]
pub struct ExecOpt {
    pub collect_cover: bool,
    pub dedup_cover: bool,
    pub inject_fault: bool,
    pub collect_comps: bool,
    pub threaded: bool,
    pub collide: bool,
    pub fault_call: u64,
    pub fault_nth: u64,
}

impl ExecOpt {
    pub fn parse(flags: ExecFlags, fault_call: u64, fault_nth: u64) -> Self {
        let threaded = flags & FLAG_THREADED != 0;
        Self {
            collect_cover: flags & FLAG_COLLECT_COVER != 0,
            dedup_cover: flags & FLAG_DEDUP_COVER != 0,
            inject_fault: flags & FLAG_INJECT_FAULT != 0,
            collect_comps: flags & FLAG_COLLECT_COMPS != 0,
            threaded,
            // colliding without the pool would just serialize the replay
            collide: threaded && flags & FLAG_COLLIDE != 0,
            fault_call,
            fault_nth,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HandshakeReq {
    pub magic: u64,
    pub flags: EnvFlags,
    pub pid: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct HandshakeReply {
    pub magic: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecuteReq {
    pub magic: u64,
    pub env_flags: EnvFlags,
    pub exec_flags: ExecFlags,
    pub pid: u64,
    pub fault_call: u64,
    pub fault_nth: u64,
    pub prog_size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecuteReply {
    pub magic: u32,
    pub done: u32,
    pub status: u32,
}

impl HandshakeReq {
    pub fn new(flags: EnvFlags, pid: u64) -> Self {
        Self {
            magic: IN_MAGIC,
            flags,
            pid,
        }
    }

    pub fn recv<R: Read>(r: &mut R) -> Result<Self> {
        let magic = read_u64(r, "handshake")?;
        if magic != IN_MAGIC {
            return Err(Error::Protocol(format!("bad handshake magic {:#x}", magic)));
        }
        Ok(Self {
            magic,
            flags: read_u64(r, "handshake")?,
            pid: read_u64(r, "handshake")?,
        })
    }

    pub fn send<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self.magic)?;
        w.write_u64::<LittleEndian>(self.flags)?;
        w.write_u64::<LittleEndian>(self.pid)?;
        Ok(())
    }
}

impl HandshakeReply {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self { magic: OUT_MAGIC }
    }

    pub fn recv<R: Read>(r: &mut R) -> Result<Self> {
        let magic = read_u32(r, "handshake reply")?;
        if magic != OUT_MAGIC {
            return Err(Error::Protocol(format!(
                "bad handshake reply magic {:#x}",
                magic
            )));
        }
        Ok(Self { magic })
    }

    pub fn send<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self.magic)?;
        Ok(())
    }
}

impl ExecuteReq {
    /// Reads one execute request. A clean EOF at the record boundary means
    /// the parent is gone and yields `None`.
    pub fn recv<R: Read>(r: &mut R) -> Result<Option<Self>> {
        let magic = match read_u64_or_eof(r)? {
            Some(v) => v,
            None => return Ok(None),
        };
        if magic != IN_MAGIC {
            return Err(Error::Protocol(format!("bad execute magic {:#x}", magic)));
        }
        Ok(Some(Self {
            magic,
            env_flags: read_u64(r, "execute")?,
            exec_flags: read_u64(r, "execute")?,
            pid: read_u64(r, "execute")?,
            fault_call: read_u64(r, "execute")?,
            fault_nth: read_u64(r, "execute")?,
            prog_size: read_u64(r, "execute")?,
        }))
    }

    pub fn send<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self.magic)?;
        w.write_u64::<LittleEndian>(self.env_flags)?;
        w.write_u64::<LittleEndian>(self.exec_flags)?;
        w.write_u64::<LittleEndian>(self.pid)?;
        w.write_u64::<LittleEndian>(self.fault_call)?;
        w.write_u64::<LittleEndian>(self.fault_nth)?;
        w.write_u64::<LittleEndian>(self.prog_size)?;
        Ok(())
    }
}

impl ExecuteReply {
    pub fn done(status: u32) -> Self {
        Self {
            magic: OUT_MAGIC,
            done: 1,
            status,
        }
    }

    pub fn recv<R: Read>(r: &mut R) -> Result<Self> {
        let magic = read_u32(r, "execute reply")?;
        if magic != OUT_MAGIC {
            return Err(Error::Protocol(format!(
                "bad execute reply magic {:#x}",
                magic
            )));
        }
        Ok(Self {
            magic,
            done: read_u32(r, "execute reply")?,
            status: read_u32(r, "execute reply")?,
        })
    }

    pub fn send<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self.magic)?;
        w.write_u32::<LittleEndian>(self.done)?;
        w.write_u32::<LittleEndian>(self.status)?;
        Ok(())
    }
}

/// Accumulates the program body until `prog_size` bytes arrived or the
/// channel hit EOF early (a protocol error).
pub fn recv_prog<R: Read>(r: &mut R, buf: &mut [u8], prog_size: usize) -> Result<()> {
    debug_assert!(prog_size <= buf.len());
    let mut pos = 0;
    while pos < prog_size {
        match r.read(&mut buf[pos..prog_size]) {
            Ok(0) => break,
            Ok(n) => pos += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    if pos != prog_size {
        return Err(Error::Protocol(format!(
            "bad input size {}, want {}",
            pos, prog_size
        )));
    }
    Ok(())
}

/// Remaps inherited stdin/stdout onto the dedicated control fds and routes
/// stderr onto the old stdout so executor diagnostics reach the parent.
pub fn setup_control_pipes() -> Result<(File, File)> {
    dup2(0, IN_PIPE_FD).map_err(pipe_err)?;
    dup2(1, OUT_PIPE_FD).map_err(pipe_err)?;
    dup2(2, 1).map_err(pipe_err)?;
    close(0).map_err(pipe_err)?;
    Ok(unsafe { (File::from_raw_fd(IN_PIPE_FD), File::from_raw_fd(OUT_PIPE_FD)) })
}

/// Debug binding: speak the protocol on plain stdin/stdout.
pub fn stdio_channel() -> Result<(File, File)> {
    let conn_in = dup(0).map_err(pipe_err)?;
    let conn_out = dup(1).map_err(pipe_err)?;
    Ok(unsafe { (File::from_raw_fd(conn_in), File::from_raw_fd(conn_out)) })
}

fn pipe_err(e: nix::Error) -> Error {
    Error::Io(std::io::Error::from(e))
}

fn read_u64<R: Read>(r: &mut R, what: &str) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(|e| short_frame(e, what))?;
    Ok(u64::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R, what: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(|e| short_frame(e, what))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64_or_eof<R: Read>(r: &mut R) -> Result<Option<u64>> {
    let mut buf = [0u8; 8];
    let mut n = 0;
    while n < 8 {
        match r.read(&mut buf[n..]) {
            Ok(0) if n == 0 => return Ok(None),
            Ok(0) => return Err(Error::Protocol("short execute frame".into())),
            Ok(k) => n += k,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(u64::from_le_bytes(buf)))
}

fn short_frame(e: std::io::Error, what: &str) -> Error {
    if e.kind() == ErrorKind::UnexpectedEof {
        Error::Protocol(format!("short {} frame", what))
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn env_flag_parsing() {
        let env = EnvConfig::parse(FLAG_DEBUG | FLAG_COVER | FLAG_ENABLE_TUN, 3);
        assert!(env.debug && env.cover && env.enable_tun);
        assert!(!env.enable_fault_injection);
        assert_eq!(env.sandbox, Sandbox::None);
        assert_eq!(env.pid, 3);
    }

    #[test]
    fn setuid_wins_over_namespace() {
        let env = EnvConfig::parse(FLAG_SANDBOX_SETUID | FLAG_SANDBOX_NAMESPACE, 0);
        assert_eq!(env.sandbox, Sandbox::Setuid);
        let env = EnvConfig::parse(FLAG_SANDBOX_NAMESPACE, 0);
        assert_eq!(env.sandbox, Sandbox::Namespace);
    }

    #[test]
    fn collide_requires_threaded() {
        let opt = ExecOpt::parse(FLAG_COLLIDE, 0, 0);
        assert!(!opt.collide);
        let opt = ExecOpt::parse(FLAG_COLLIDE | FLAG_THREADED, 0, 0);
        assert!(opt.collide && opt.threaded);
    }

    #[test]
    fn handshake_roundtrip() {
        let mut buf = Vec::new();
        HandshakeReq::new(FLAG_COVER, 11).send(&mut buf).unwrap();
        let req = HandshakeReq::recv(&mut Cursor::new(buf)).unwrap();
        assert_eq!(req.flags, FLAG_COVER);
        assert_eq!(req.pid, 11);
    }

    #[test]
    fn execute_roundtrip_and_eof() {
        let req = ExecuteReq {
            magic: IN_MAGIC,
            env_flags: FLAG_DEBUG,
            exec_flags: FLAG_THREADED,
            pid: 1,
            fault_call: 2,
            fault_nth: 3,
            prog_size: 64,
        };
        let mut buf = Vec::new();
        req.send(&mut buf).unwrap();
        let mut cur = Cursor::new(buf);
        let back = ExecuteReq::recv(&mut cur).unwrap().unwrap();
        assert_eq!(back.exec_flags, FLAG_THREADED);
        assert_eq!(back.prog_size, 64);
        // nothing left: clean EOF
        assert!(ExecuteReq::recv(&mut cur).unwrap().is_none());
    }

    #[test]
    fn wrong_magic_is_protocol_error() {
        let mut buf = Vec::new();
        HandshakeReq {
            magic: 42,
            flags: 0,
            pid: 0,
        }
        .send(&mut buf)
        .unwrap();
        assert!(matches!(
            HandshakeReq::recv(&mut Cursor::new(buf)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn truncated_execute_is_protocol_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&IN_MAGIC.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        // five fields missing
        assert!(matches!(
            ExecuteReq::recv(&mut Cursor::new(buf)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn prog_body_accumulates_and_checks_size() {
        let body = vec![0xabu8; 48];
        let mut buf = vec![0u8; 64];
        recv_prog(&mut Cursor::new(body.clone()), &mut buf, 48).unwrap();
        assert_eq!(&buf[..48], &body[..]);

        let short = vec![0xabu8; 16];
        assert!(matches!(
            recv_prog(&mut Cursor::new(short), &mut buf, 48),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn reply_roundtrips() {
        let mut buf = Vec::new();
        HandshakeReply::new().send(&mut buf).unwrap();
        ExecuteReply::done(0).send(&mut buf).unwrap();
        let mut cur = Cursor::new(buf);
        HandshakeReply::recv(&mut cur).unwrap();
        let reply = ExecuteReply::recv(&mut cur).unwrap();
        assert_eq!(reply.done, 1);
        assert_eq!(reply.status, 0);
    }
}
