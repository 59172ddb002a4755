//! Program interpreter, worker pool, and completion handling.
//!
//! The encoded program is a flat word stream: copyin instructions prepare
//! guest memory, call instructions go to a worker slot, and copyout markers
//! after a call are consumed by the completion handler on its own cursor.
//! Each slot is handed off single-writer at a time: the scheduler fills the
//! request and sets `ready`, the worker fills the response and sets `done`,
//! the main thread drains it and marks it handled.

use crate::comm::{EnvConfig, ExecOpt};
use crate::cover::{CovHandle, Mode};
use crate::csum::CsumInet;
use crate::event::Event;
use crate::input::InputStream;
use crate::output::OutputBuf;
use crate::signal::{hash32, Comparison, DedupTable};
use crate::sys::SyscallTable;
use crate::utils::sleep_ms;
use crate::{
    fault, mem, Error, Result, DEFAULT_VALUE, MAX_ARGS, MAX_COMMANDS, MAX_INPUT, MAX_OUTPUT,
    MAX_THREADS, NO_COPYOUT,
};
use iota::iota;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

iota! {
    pub const INSTR_EOF: u64 = (u64::MAX) ^ (iota);
        , INSTR_COPYIN
        , INSTR_COPYOUT
}

iota! {
    pub const ARG_CONST: u64 = iota;
        , ARG_RESULT
        , ARG_DATA
        , ARG_CSUM
}

iota! {
    pub const ARG_CSUM_INET: u64 = iota;
}

iota! {
    pub const ARG_CSUM_CHUNK_DATA: u64 = iota;
        , ARG_CSUM_CHUNK_CONST
}

#[derive(Debug, Clone, Copy, Default)]
struct ResEntry {
    executed: bool,
    val: u64,
}

/// Per-call scratch shared between the scheduler and one worker. The
/// request half is written before `ready` is set, the response half before
/// `done` is set, so the lock is never contended.
#[derive(Default)]
struct CallState {
    num: u64,
    num_args: u64,
    args: [u64; MAX_ARGS],
    inject_fault: bool,
    fault_nth: u64,
    collect_comps: bool,
    cover_enabled: bool,

    res: i64,
    errno: i32,
    fault_injected: bool,
    cover_count: u64,
    cover: Vec<u64>,
}

struct SlotShared {
    ready: Event,
    done: Event,
    call: Mutex<CallState>,
}

struct Slot {
    id: usize,
    created: bool,
    has_thread: bool,
    handled: bool,
    call_index: u32,
    call_num: u64,
    copyout_index: u64,
    copyout_pos: usize,
    shared: Arc<SlotShared>,
}

impl Slot {
    fn new(id: usize) -> Self {
        Self {
            id,
            created: false,
            has_thread: false,
            handled: true,
            call_index: 0,
            call_num: 0,
            copyout_index: NO_COPYOUT,
            copyout_pos: 0,
            shared: Arc::new(SlotShared {
                ready: Event::new(),
                done: Event::new(),
                call: Mutex::new(CallState::default()),
            }),
        }
    }
}

/// One executor instance: owns the program slab, the result table, the
/// output buffer, the dedup table, and the worker slots for the lifetime of
/// the process.
pub struct Executor {
    env: EnvConfig,
    opt: ExecOpt,
    table: Arc<dyn SyscallTable>,
    input: Box<[u8]>,
    have_prog: bool,
    output: OutputBuf,
    results: Vec<ResEntry>,
    dedup: DedupTable,
    slots: Vec<Slot>,
    main_cov: Option<CovHandle>,
    running: usize,
    collide: bool,
}

impl Executor {
    pub fn new(env: EnvConfig, table: Arc<dyn SyscallTable>) -> Self {
        Self {
            env,
            opt: ExecOpt::default(),
            table,
            input: vec![0u8; MAX_INPUT].into_boxed_slice(),
            have_prog: false,
            output: OutputBuf::new(MAX_OUTPUT),
            results: vec![ResEntry::default(); MAX_COMMANDS as usize],
            dedup: DedupTable::new(),
            slots: (0..MAX_THREADS).map(Slot::new).collect(),
            main_cov: None,
            running: 0,
            collide: false,
        }
    }

    pub fn set_env(&mut self, env: EnvConfig) {
        self.env = env;
    }

    pub fn input_mut(&mut self) -> &mut [u8] {
        &mut self.input
    }

    pub fn mark_prog_received(&mut self) {
        self.have_prog = true;
    }

    pub fn has_prog(&self) -> bool {
        self.have_prog
    }

    pub fn output_bytes(&self) -> &[u8] {
        self.output.as_bytes()
    }

    pub fn completed(&self) -> u32 {
        self.output.completed()
    }

    /// Runs the current program under `opt`; when collide mode asks for it,
    /// runs the whole program once more with output suppressed.
    pub fn execute(&mut self, opt: &ExecOpt) -> Result<()> {
        self.opt = opt.clone();
        self.collide = false;
        self.output.reset();
        for entry in self.results.iter_mut() {
            *entry = ResEntry::default();
        }
        let input = std::mem::take(&mut self.input);
        let mut res = self.execute_one(&input);
        if res.is_ok() && self.opt.collide && !self.opt.inject_fault {
            log::debug!("enabling collider");
            self.collide = true;
            res = self.execute_one(&input);
        }
        self.input = input;
        res
    }

    fn execute_one(&mut self, input: &[u8]) -> Result<()> {
        let mut s = InputStream::new(input, 0);
        let mut call_index: u32 = 0;
        loop {
            let word = s.read()?;
            match word {
                INSTR_EOF => break,
                INSTR_COPYIN => self.copyin(&mut s)?,
                INSTR_COPYOUT => {
                    // (index, addr, size); the read happens when the owning
                    // call completes
                    s.read()?;
                    s.read()?;
                    s.read()?;
                }
                num => {
                    self.call(num, call_index, &mut s, input)?;
                    call_index += 1;
                }
            }
        }
        Ok(())
    }

    fn copyin(&mut self, s: &mut InputStream) -> Result<()> {
        let addr = s.read()?;
        let typ = s.read()?;
        let size = s.read()?;
        log::debug!("copyin to {:#x}", addr);
        match typ {
            ARG_CONST => {
                let val = s.read()?;
                let bf_off = s.read()?;
                let bf_len = s.read()?;
                mem::write_guest(addr, val, size, bf_off, bf_len)
            }
            ARG_RESULT => {
                let val = self.read_result(s)?;
                mem::write_guest(addr, val, size, 0, 0)
            }
            ARG_DATA => {
                let data = s.read_bytes(size)?;
                mem::write_bytes_guest(addr, data);
                Ok(())
            }
            ARG_CSUM => self.copyin_csum(addr, size, s),
            _ => Err(Error::Input(format!("bad argument type {}", typ))),
        }
    }

    fn copyin_csum(&mut self, addr: u64, size: u64, s: &mut InputStream) -> Result<()> {
        let kind = s.read()?;
        match kind {
            ARG_CSUM_INET => {
                if size != 2 {
                    return Err(Error::Input(format!(
                        "inet checksum must be 2 bytes, not {}",
                        size
                    )));
                }
                let mut csum = CsumInet::new();
                let chunks = s.read()?;
                for chunk in 0..chunks {
                    let chunk_kind = s.read()?;
                    let value = s.read()?;
                    let chunk_size = s.read()?;
                    match chunk_kind {
                        ARG_CSUM_CHUNK_DATA => {
                            log::debug!(
                                "#{}: data chunk, addr {:#x}, size {}",
                                chunk,
                                value,
                                chunk_size
                            );
                            if let Some(bytes) = mem::read_bytes_guest(value, chunk_size) {
                                csum.update(&bytes);
                            }
                        }
                        ARG_CSUM_CHUNK_CONST => {
                            if chunk_size != 2 && chunk_size != 4 && chunk_size != 8 {
                                return Err(Error::Input(format!(
                                    "bad checksum const chunk size {}",
                                    chunk_size
                                )));
                            }
                            // const values arrive pre-byteswapped; hash their
                            // in-memory representation
                            csum.update(&value.to_ne_bytes()[..chunk_size as usize]);
                        }
                        _ => {
                            return Err(Error::Input(format!(
                                "bad checksum chunk kind {}",
                                chunk_kind
                            )))
                        }
                    }
                }
                let digest = csum.digest();
                log::debug!("writing inet checksum {:#x} to {:#x}", digest, addr);
                mem::write_guest(addr, u64::from(digest), 2, 0, 0)
            }
            _ => Err(Error::Input(format!("bad checksum kind {}", kind))),
        }
    }

    fn call(&mut self, num: u64, call_index: u32, s: &mut InputStream, input: &[u8]) -> Result<()> {
        if num >= self.table.count() {
            return Err(Error::Input(format!("invalid command number {}", num)));
        }
        let copyout_index = s.read()?;
        let num_args = s.read()?;
        if num_args as usize > MAX_ARGS {
            return Err(Error::Input(format!(
                "command has bad number of arguments {}",
                num_args
            )));
        }
        let mut args = [0u64; MAX_ARGS];
        for arg in args.iter_mut().take(num_args as usize) {
            *arg = self.read_arg(s)?;
        }
        let idx = self.schedule_call(call_index, num, copyout_index, num_args, args, s.pos(), input)?;

        if self.collide && call_index % 2 == 1 {
            // don't wait for every other call; results already exist from
            // the first pass
        } else if self.opt.threaded {
            // the generator knows about this timeout when it emits
            // timespec/timeval values
            let timeout = Duration::from_millis(if self.env.debug { 500 } else { 20 });
            if self.slots[idx].shared.done.timed_wait(timeout) {
                self.handle_completion(idx, input)?;
            }
            // Check whether earlier calls have completed. Give them a little
            // extra room: the current call could have just unblocked them.
            if self.running > 0 {
                let last = s.peek()? == INSTR_EOF;
                sleep_ms(if last { 10 } else { 1 });
                for i in 0..self.slots.len() {
                    if self.slots[i].created
                        && !self.slots[i].handled
                        && self.slots[i].shared.done.is_set()
                    {
                        self.handle_completion(i, input)?;
                    }
                }
            }
        } else {
            if idx != 0 {
                return Err(Error::Scheduling(format!(
                    "call on slot {} in synchronous mode",
                    idx
                )));
            }
            run_call(
                &self.slots[0].shared,
                self.table.as_ref(),
                &mut self.main_cov,
                0,
            );
            self.handle_completion(0, input)?;
        }
        Ok(())
    }

    fn read_arg(&mut self, s: &mut InputStream) -> Result<u64> {
        let typ = s.read()?;
        let _size = s.read()?;
        match typ {
            ARG_CONST => {
                let val = s.read()?;
                // bitfields cannot be arguments of a plain call
                s.read()?; // bit field offset
                s.read()?; // bit field length
                Ok(val)
            }
            ARG_RESULT => self.read_result(s),
            _ => Err(Error::Input(format!("bad argument type {}", typ))),
        }
    }

    fn read_result(&mut self, s: &mut InputStream) -> Result<u64> {
        let idx = s.read()?;
        let op_div = s.read()?;
        let op_add = s.read()?;
        if idx >= MAX_COMMANDS {
            return Err(Error::Input(format!("command refers to bad result {}", idx)));
        }
        let entry = self.results[idx as usize];
        if !entry.executed {
            return Ok(DEFAULT_VALUE);
        }
        let mut val = entry.val;
        if op_div != 0 {
            val /= op_div;
        }
        Ok(val.wrapping_add(op_add))
    }

    #[allow(clippy::too_many_arguments)]
    fn schedule_call(
        &mut self,
        call_index: u32,
        num: u64,
        copyout_index: u64,
        num_args: u64,
        args: [u64; MAX_ARGS],
        pos: usize,
        input: &[u8],
    ) -> Result<usize> {
        let mut chosen = None;
        for i in 0..self.slots.len() {
            if !self.slots[i].created {
                self.create_slot(i)?;
            }
            if self.slots[i].shared.done.is_set() {
                if !self.slots[i].handled {
                    self.handle_completion(i, input)?;
                }
                chosen = Some(i);
                break;
            }
        }
        let idx = chosen.ok_or_else(|| Error::Scheduling("out of threads".into()))?;

        let armed = self.opt.inject_fault && u64::from(call_index) == self.opt.fault_call;
        if armed && self.collide {
            return Err(Error::Scheduling(
                "both collide and fault injection are enabled".into(),
            ));
        }

        log::debug!(
            "scheduling call {} [{}] on worker {}",
            call_index,
            self.table.name(num),
            idx
        );
        let slot = &mut self.slots[idx];
        if slot.shared.ready.is_set() || !slot.shared.done.is_set() || !slot.handled {
            return Err(Error::Scheduling(format!(
                "bad slot state in schedule: ready={} done={} handled={}",
                slot.shared.ready.is_set(),
                slot.shared.done.is_set(),
                slot.handled
            )));
        }
        slot.call_index = call_index;
        slot.call_num = num;
        slot.copyout_index = copyout_index;
        slot.copyout_pos = pos;
        {
            let mut st = slot.shared.call.lock().unwrap();
            st.num = num;
            st.num_args = num_args;
            st.args = args;
            st.inject_fault = armed;
            st.fault_nth = self.opt.fault_nth;
            st.collect_comps = self.opt.collect_comps;
            st.cover_enabled = self.env.cover;
            st.fault_injected = false;
        }
        slot.shared.done.reset();
        slot.handled = false;
        if self.opt.threaded {
            self.ensure_worker(idx)?;
            self.slots[idx].shared.ready.set();
        }
        self.running += 1;
        Ok(idx)
    }

    fn create_slot(&mut self, i: usize) -> Result<()> {
        self.slots[i].created = true;
        self.slots[i].handled = true;
        self.slots[i].shared.done.set();
        if self.opt.threaded {
            self.ensure_worker(i)?;
        }
        Ok(())
    }

    fn ensure_worker(&mut self, i: usize) -> Result<()> {
        if self.slots[i].has_thread {
            return Ok(());
        }
        let shared = Arc::clone(&self.slots[i].shared);
        let table = Arc::clone(&self.table);
        let id = self.slots[i].id;
        thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || worker_loop(shared, table, id))
            .map_err(|e| Error::Internal(format!("failed to spawn worker {}: {}", id, e)))?;
        self.slots[i].has_thread = true;
        Ok(())
    }

    fn handle_completion(&mut self, idx: usize, input: &[u8]) -> Result<()> {
        let slot = &self.slots[idx];
        if slot.shared.ready.is_set() || !slot.shared.done.is_set() || slot.handled {
            return Err(Error::Scheduling(format!(
                "bad slot state in completion: ready={} done={} handled={}",
                slot.shared.ready.is_set(),
                slot.shared.done.is_set(),
                slot.handled
            )));
        }
        log::debug!(
            "completion of call {} [{}] on worker {}",
            slot.call_index,
            self.table.name(slot.call_num),
            slot.id
        );
        let call_index = slot.call_index;
        let call_num = slot.call_num;
        let copyout_index = slot.copyout_index;
        let copyout_pos = slot.copyout_pos;
        let (res, errno, fault_injected, cover_count, cover) = {
            let mut st = slot.shared.call.lock().unwrap();
            (
                st.res,
                st.errno,
                st.fault_injected,
                st.cover_count,
                std::mem::take(&mut st.cover),
            )
        };

        if res != -1 {
            if copyout_index != NO_COPYOUT {
                self.set_result(copyout_index, res as u64)?;
            }
            let mut s = InputStream::new(input, copyout_pos);
            while s.peek()? == INSTR_COPYOUT {
                s.read()?;
                let index = s.read()?;
                let addr = s.read()?;
                let size = s.read()?;
                let val = mem::read_guest(addr, size)?;
                self.set_result(index, val)?;
                log::debug!("copyout {:#x} from {:#x}", val, addr);
            }
        }

        if !self.collide {
            self.write_record(call_index, call_num, res, errno, fault_injected, cover_count, cover)?;
        }

        self.slots[idx].handled = true;
        self.running = self
            .running
            .checked_sub(1)
            .ok_or_else(|| Error::Scheduling("running call count underflow".into()))?;
        Ok(())
    }

    fn set_result(&mut self, idx: u64, val: u64) -> Result<()> {
        if idx >= MAX_COMMANDS {
            return Err(Error::Input(format!(
                "result index {} overflows the table",
                idx
            )));
        }
        self.results[idx as usize] = ResEntry { executed: true, val };
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_record(
        &mut self,
        call_index: u32,
        call_num: u64,
        res: i64,
        errno: i32,
        fault_injected: bool,
        cover_count: u64,
        mut cover: Vec<u64>,
    ) -> Result<()> {
        self.output.push(call_index)?;
        self.output.push(call_num as u32)?;
        let reserrno = if res != -1 { 0 } else { errno as u32 };
        self.output.push(reserrno)?;
        self.output.push(fault_injected as u32)?;
        let nsig_pos = self.output.push(0)?;
        let ncover_pos = self.output.push(0)?;
        let ncomps_pos = self.output.push(0)?;
        let mut nsig: u32 = 0;
        let mut ncover: u32 = 0;
        let mut ncomps: u32 = 0;

        if self.opt.collect_comps {
            let count = cover_count as usize;
            if count.saturating_mul(4) > cover.len() {
                return Err(Error::Internal(format!("too many comparisons {}", count)));
            }
            let mut comps: Vec<Comparison> = cover[..count * 4]
                .chunks_exact(4)
                .map(Comparison::from_words)
                .collect();
            comps.sort_unstable_by_key(|c| c.key());
            comps.dedup_by_key(|c| c.key());
            for comp in &comps {
                if comp.ignore() {
                    continue;
                }
                ncomps += 1;
                comp.write(&mut self.output)?;
            }
        } else {
            // feedback signals: code edges as xor of two subsequent block PCs
            let mut prev: u32 = 0;
            for &word in cover.iter() {
                let pc = word as u32;
                let sig = pc ^ prev;
                prev = hash32(pc);
                if self.dedup.dup(sig) {
                    continue;
                }
                self.output.push(sig)?;
                nsig += 1;
            }
            if self.opt.collect_cover {
                if self.opt.dedup_cover {
                    cover.sort_unstable();
                    cover.dedup();
                }
                // PCs truncated to 32 bits; true for x86_64 and arm64
                // without KASLR
                for &pc in cover.iter() {
                    self.output.push(pc as u32)?;
                }
                ncover = cover.len() as u32;
            }
        }

        self.output.set(nsig_pos, nsig);
        self.output.set(ncover_pos, ncover);
        self.output.set(ncomps_pos, ncomps);
        self.output.bump_completed();
        log::debug!(
            "out #{}: index={} num={} errno={} sig={} cover={} comps={}",
            self.output.completed(),
            call_index,
            call_num,
            reserrno,
            nsig,
            ncover,
            ncomps
        );
        Ok(())
    }
}

fn worker_loop(shared: Arc<SlotShared>, table: Arc<dyn SyscallTable>, id: usize) {
    let mut cov: Option<CovHandle> = None;
    loop {
        shared.ready.wait();
        run_call(&shared, table.as_ref(), &mut cov, id);
    }
}

/// One call on a slot, performed by the owning worker in threaded mode and
/// by the main thread on slot 0 otherwise.
fn run_call(shared: &SlotShared, table: &dyn SyscallTable, cov: &mut Option<CovHandle>, id: usize) {
    shared.ready.reset();
    let mut st = shared.call.lock().unwrap();
    log::debug!(
        "#{}: {}({:x?})",
        id,
        table.name(st.num),
        &st.args[..st.num_args as usize]
    );

    let fault = if st.inject_fault {
        log::debug!("injecting fault into {}-th operation", st.fault_nth);
        match fault::arm(st.fault_nth) {
            Ok(handle) => Some(handle),
            Err(e) => fatal!("failed to arm fault injection: {}", e),
        }
    } else {
        None
    };

    if st.cover_enabled {
        let c = cov.get_or_insert_with(CovHandle::open);
        c.enable(if st.collect_comps { Mode::Cmp } else { Mode::Pc });
        c.reset();
    }

    let r = table.invoke(st.num, &st.args);
    st.res = r.res;
    st.errno = r.errno;

    st.cover_count = 0;
    st.cover.clear();
    if st.cover_enabled {
        if let Some(c) = cov.as_ref() {
            let (n, payload) = c.read();
            let want = if st.collect_comps {
                (n as usize).saturating_mul(4)
            } else {
                n as usize
            };
            st.cover_count = n;
            st.cover.extend_from_slice(&payload[..want.min(payload.len())]);
        }
    }

    st.fault_injected = fault.map(|handle| handle.fired()).unwrap_or(false);

    if st.res == -1 {
        log::debug!("#{}: {} = errno({})", id, table.name(st.num), st.errno);
    } else {
        log::debug!("#{}: {} = {:#x}", id, table.name(st.num), st.res);
    }
    drop(st);
    shared.done.set();
}
