//! In-process executor core for a kernel fuzzer.
//!
//! The parent fuzzer spawns this process, performs a magic-framed handshake
//! over a pair of inherited pipes, and then streams execute requests. Each
//! request carries an encoded program: a flat sequence of 64-bit words that
//! copy prepared values into guest memory, invoke operations from a dispatch
//! table through a small worker pool, and read results back for later
//! back-references. Per-call coverage signals, raw PCs, and comparison
//! operands are extracted from the kernel coverage facility and written into
//! an append-only record buffer that is flushed after every request.

#[macro_use]
mod utils;

pub mod comm;
pub mod cover;
pub mod csum;
pub mod event;
pub mod exec;
pub mod fault;
pub mod input;
pub mod mem;
pub mod output;
pub mod signal;
pub mod sys;

use crate::comm::{EnvConfig, ExecOpt, ExecuteReply, ExecuteReq, HandshakeReply, HandshakeReq};
use crate::exec::Executor;
use crate::sys::SyscallTable;
use log::LevelFilter;
use std::io::{Read, Write};
use std::sync::Arc;
use thiserror::Error;

/// Maximum size of an encoded program, in bytes.
pub const MAX_INPUT: usize = 2 << 20;
/// Maximum size of the completion record buffer, in bytes.
pub const MAX_OUTPUT: usize = 16 << 20;
/// Per-thread coverage buffer capacity in 64-bit words, count word included.
pub const COVER_SIZE: usize = 64 << 10;
/// Arguments carried per call; Linux consumes at most six of them.
pub const MAX_ARGS: usize = 9;
/// Worker pool capacity.
pub const MAX_THREADS: usize = 16;
/// Result table capacity; copyout indices must stay below this.
pub const MAX_COMMANDS: u64 = 1000;

/// Copyout index meaning "discard the return value".
pub const NO_COPYOUT: u64 = u64::MAX;
/// Stand-in value for results of failed or faulted operations. -1 is an
/// invalid fd and an invalid address, and deterministic, so good enough.
pub const DEFAULT_VALUE: u64 = u64::MAX;

/// Exit status the parent interprets as an internal executor failure.
pub const FAIL_STATUS: i32 = 67;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad magic, short or oversize frames, execute without a program.
    #[error("protocol: {0}")]
    Protocol(String),
    /// Program decoding failures: stream overrun, bad opcode, bad argument
    /// type or size, out-of-range result index.
    #[error("input: {0}")]
    Input(String),
    /// Worker pool invariant violations.
    #[error("scheduling: {0}")]
    Scheduling(String),
    /// States that cannot be reached through any well-formed input.
    #[error("internal: {0}")]
    Internal(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Serve one executor session: handshake, then execute requests until the
/// parent closes the channel.
pub fn exec_loop<R: Read, W: Write>(
    table: Arc<dyn SyscallTable>,
    mut conn_in: R,
    mut conn_out: W,
) -> Result<()> {
    let hs = HandshakeReq::recv(&mut conn_in)?;
    let env = EnvConfig::parse(hs.flags, hs.pid);
    apply_debug(&env);
    HandshakeReply::new().send(&mut conn_out)?;
    conn_out.flush()?;

    let mut executor = Executor::new(env, table);
    loop {
        let req = match ExecuteReq::recv(&mut conn_in)? {
            Some(req) => req,
            None => return Ok(()), // parent closed the channel
        };
        if req.prog_size as usize > MAX_INPUT {
            return Err(Error::Protocol(format!(
                "bad execute prog size {:#x}",
                req.prog_size
            )));
        }
        let env = EnvConfig::parse(req.env_flags, req.pid);
        apply_debug(&env);
        let opt = ExecOpt::parse(req.exec_flags, req.fault_call, req.fault_nth);
        log::debug!(
            "exec opts: pid={} threaded={} collide={} cover={} comps={} dedup={} fault={}/{}/{} prog={}",
            env.pid,
            opt.threaded,
            opt.collide,
            opt.collect_cover,
            opt.collect_comps,
            opt.dedup_cover,
            opt.inject_fault,
            opt.fault_call,
            opt.fault_nth,
            req.prog_size
        );
        executor.set_env(env);
        if req.prog_size != 0 {
            comm::recv_prog(&mut conn_in, executor.input_mut(), req.prog_size as usize)?;
            executor.mark_prog_received();
        } else if !executor.has_prog() {
            // A zero-size request re-executes the previous program.
            return Err(Error::Protocol("execute request without a program".into()));
        }
        executor.execute(&opt)?;
        ExecuteReply::done(0).send(&mut conn_out)?;
        conn_out.write_all(executor.output_bytes())?;
        conn_out.flush()?;
    }
}

fn apply_debug(env: &EnvConfig) {
    let level = if env.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{ExecuteReply, HandshakeReply, FLAG_THREADED, IN_MAGIC};
    use crate::sys::RawResult;
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::io::Cursor;

    struct NopTable;

    impl SyscallTable for NopTable {
        fn count(&self) -> u64 {
            4
        }
        fn name(&self, _num: u64) -> &str {
            "nop"
        }
        fn invoke(&self, _num: u64, _args: &[u64; MAX_ARGS]) -> RawResult {
            RawResult { res: 0, errno: 0 }
        }
    }

    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.write_u64::<LittleEndian>(v).unwrap();
    }

    fn session_with_prog(prog: &[u64], executes: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        // handshake
        push_u64(&mut buf, IN_MAGIC);
        push_u64(&mut buf, 0); // env flags
        push_u64(&mut buf, 7); // pid
        for i in 0..executes {
            push_u64(&mut buf, IN_MAGIC);
            push_u64(&mut buf, 0); // env flags
            push_u64(&mut buf, 0); // exec flags
            push_u64(&mut buf, 7); // pid
            push_u64(&mut buf, 0); // fault call
            push_u64(&mut buf, 0); // fault nth
            if i == 0 {
                push_u64(&mut buf, (prog.len() * 8) as u64);
                for &w in prog {
                    push_u64(&mut buf, w);
                }
            } else {
                push_u64(&mut buf, 0); // reuse the previous program
            }
        }
        buf
    }

    fn run_session(session: Vec<u8>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        exec_loop(Arc::new(NopTable), Cursor::new(session), &mut out)?;
        Ok(out)
    }

    #[test]
    fn empty_program_replies_done() {
        let out = run_session(session_with_prog(&[u64::MAX], 1)).unwrap();
        let mut r = Cursor::new(out);
        HandshakeReply::recv(&mut r).unwrap();
        let reply = ExecuteReply::recv(&mut r).unwrap();
        assert_eq!(reply.done, 1);
        assert_eq!(reply.status, 0);
        // output buffer: just the zero completed-count header
        let mut rest = Vec::new();
        std::io::Read::read_to_end(&mut r, &mut rest).unwrap();
        assert_eq!(rest, vec![0, 0, 0, 0]);
    }

    #[test]
    fn program_reuse_on_zero_size() {
        let prog = [0, NO_COPYOUT, 0, u64::MAX]; // one call, then eof
        let out = run_session(session_with_prog(&prog, 2)).unwrap();
        let mut r = Cursor::new(out);
        HandshakeReply::recv(&mut r).unwrap();
        for _ in 0..2 {
            let reply = ExecuteReply::recv(&mut r).unwrap();
            assert_eq!(reply.done, 1);
            let mut hdr = [0u8; 4];
            std::io::Read::read_exact(&mut r, &mut hdr).unwrap();
            assert_eq!(u32::from_le_bytes(hdr), 1); // one completed call
            let mut record = [0u8; 7 * 4];
            std::io::Read::read_exact(&mut r, &mut record).unwrap();
        }
    }

    #[test]
    fn execute_without_program_is_protocol_error() {
        let mut buf = Vec::new();
        push_u64(&mut buf, IN_MAGIC);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, IN_MAGIC);
        for _ in 0..6 {
            push_u64(&mut buf, 0); // prog_size = 0 on the very first request
        }
        assert!(matches!(run_session(buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn oversize_program_is_protocol_error() {
        let mut buf = Vec::new();
        push_u64(&mut buf, IN_MAGIC);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, IN_MAGIC);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, FLAG_THREADED);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, (MAX_INPUT + 8) as u64);
        assert!(matches!(run_session(buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn bad_handshake_magic_is_fatal() {
        let mut buf = Vec::new();
        push_u64(&mut buf, 0x1234);
        push_u64(&mut buf, 0);
        push_u64(&mut buf, 0);
        assert!(matches!(run_session(buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn clean_eof_after_reply_is_ok() {
        // session ends right after the first execute; the loop must return Ok
        let out = run_session(session_with_prog(&[u64::MAX], 1));
        assert!(out.is_ok());
    }
}
