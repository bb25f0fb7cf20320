//! The PT Query Driver.
//!
//! Walks one CPU's PT stream and turns it into a flat, time-ordered event
//! log for that CPU. Grounded on `PTJVMDecoder::decode`/`decoder_process_ip`
//! (`pt_jvm_decoder.cpp`): the outer loop only resolves conditional/
//! indirect branches and classifies the resulting IP; it never steps
//! interpreter instructions one at a time; TNT bits for branches *inside* a
//! codelet or bytecode handler are consumed but discarded; only when an
//! indirect branch lands the IP somewhere new do we care where it landed.
//! Compiled (JIT) code is the one place we *do* step real x86 instructions,
//! via `iced-x86`, because pc-to-bci and inline-frame data lives at
//! instruction granularity there.

use thiserror::Error;

use crate::bytecode::opcodes;
use crate::codelet::Classification;
use crate::event::Event;
use crate::jit::JitSectionRef;
use crate::pt::insn::{self, InsnClass};
use crate::pt::query::{PtEvent, PtQuery, QueryError};
use crate::pt::retstack::RetStack;
use crate::runtime::dump::DumpReader;
use crate::runtime::{Timeline, TimelineError};
use crate::sideband::{SidebandEvent, SidebandReplayer};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("pt query error: {0}")]
    Query(#[from] QueryError),
    #[error("timeline error: {0}")]
    Timeline(#[from] TimelineError),
    #[error("instruction decode error: {0}")]
    Insn(#[from] insn::InsnError),
}

/// One timestamped, thread-attributed observation. `tid` is `None` until
/// the first sideband context-switch record resolves a java thread id.
#[derive(Debug, Clone)]
pub struct TimedEvent {
    pub time: u64,
    pub tid: Option<u32>,
    pub event: Event,
}

pub struct Driver<'a> {
    query: PtQuery<'a>,
    timeline: &'a mut Timeline,
    dump: DumpReader<'a>,
    sideband: SidebandReplayer<'a>,
    retstack: RetStack,
    tid: Option<u32>,
    out: Vec<TimedEvent>,
    jit_run: Option<(JitSectionRef, Vec<usize>)>,
    /// Set by `process_ip` when the last classified IP was a two-way
    /// conditional branch's interpreter dispatch (§4.1's `ifeq` and
    /// friends); the *next* `cond_branch` TNT bit resolves it to
    /// `Event::Taken`/`Event::NotTaken`. Cleared on every other
    /// classification so a stale pending branch never consumes an
    /// unrelated TNT bit.
    pending_branch: bool,
}

impl<'a> Driver<'a> {
    pub fn new(pt_data: &'a [u8], timeline: &'a mut Timeline, dump: DumpReader<'a>, sideband: SidebandReplayer<'a>) -> Driver<'a> {
        Driver {
            query: PtQuery::new(pt_data),
            timeline,
            dump,
            sideband,
            retstack: RetStack::new(),
            tid: None,
            out: Vec::new(),
            jit_run: None,
            pending_branch: false,
        }
    }

    pub fn into_events(self) -> Vec<TimedEvent> {
        self.out
    }

    /// Drains the whole PT stream for this work item, recording one
    /// `decode_error` event and resynchronizing at the next PSB rather than
    /// aborting the whole decode when a single region is unreadable.
    pub fn run(&mut self) {
        loop {
            match self.query.sync_forward() {
                Ok(()) => {}
                Err(QueryError::Eos) => break,
                Err(_) => {
                    self.push(Event::DecodeError);
                    continue;
                }
            }

            loop {
                if let Err(e) = self.drain_pt_events() {
                    if matches!(e, DriverError::Query(QueryError::Eos)) {
                        return;
                    }
                    self.push(Event::DecodeError);
                    break;
                }
                match self.query.cond_branch() {
                    Ok(taken) => {
                        if self.pending_branch {
                            self.pending_branch = false;
                            self.push(if taken { Event::Taken } else { Event::NotTaken });
                        }
                        continue;
                    }
                    Err(QueryError::ExpectedTnt) => {
                        let ip = match self.query.indirect_branch() {
                            Ok(ip) => ip,
                            Err(QueryError::Eos) => return,
                            Err(_) => {
                                self.push(Event::DecodeError);
                                break;
                            }
                        };
                        if let Err(_e) = self.process_ip(ip) {
                            self.push(Event::DecodeError);
                            break;
                        }
                    }
                    Err(QueryError::Eos) => return,
                    Err(_) => {
                        self.push(Event::DecodeError);
                        break;
                    }
                }
            }
        }
    }

    fn push(&mut self, event: Event) {
        self.out.push(TimedEvent { time: self.query.time(), tid: self.tid, event });
    }

    fn advance_time(&mut self) -> Result<(), DriverError> {
        let t = self.query.time();
        self.timeline.advance_to(&mut self.dump, t)?;
        let switches = self.sideband.advance_to(t)?;
        let loss = self.sideband.take_loss();
        if loss {
            self.push(Event::DataLoss);
        }
        for ev in switches {
            let SidebandEvent::ContextSwitch { tid } = ev;
            let java_tid = tid.and_then(|sys| self.timeline.java_tid(sys));
            self.tid = java_tid;
        }
        Ok(())
    }

    fn drain_pt_events(&mut self) -> Result<(), DriverError> {
        loop {
            self.advance_time()?;
            match self.query.poll_event() {
                Ok(Some(PtEvent::Stop)) => {
                    return Ok(());
                }
                Ok(Some(PtEvent::Enabled { .. })) | Ok(Some(PtEvent::Disabled { .. })) | Ok(Some(PtEvent::AsyncBranch { .. })) => {
                    return Ok(());
                }
                Ok(Some(_)) => continue,
                Ok(None) => return Ok(()),
                Err(QueryError::Eos) => return Err(DriverError::Query(QueryError::Eos)),
                Err(QueryError::ExpectedTnt) | Err(QueryError::ExpectedTip) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn process_ip(&mut self, ip: u64) -> Result<(), DriverError> {
        self.advance_time()?;
        // Any classification besides an unresolved two-way branch discards
        // a pending branch from an earlier instruction; only the `Bytecode`
        // arm below re-arms it.
        self.pending_branch = false;
        let classification = self.timeline.classify(ip);
        match classification {
            Classification::Illegal => self.process_jitcode(ip),
            Classification::Bytecode(opcode) => {
                if opcodes::is_two_way_branch(opcode) {
                    // The interpreter codelet's own compare-and-branch is a
                    // TNT-observable fact; the next `cond_branch` result in
                    // `run`'s loop resolves it.
                    self.pending_branch = true;
                } else if opcode == opcodes::TABLESWITCH || opcode == opcodes::LOOKUPSWITCH {
                    // Which case a switch lands on is a computed array
                    // lookup, not a branch PT exposes -- recovering it would
                    // be recovering a data value, which §1 rules out of
                    // scope. Recorded honestly as a decode error rather than
                    // guessing or silently dropping the dispatch.
                    self.push(Event::DecodeError);
                }
                // Every other opcode is mid-block dispatch with no
                // block-boundary-relevant event of its own; the block's
                // whole bytecode run is reconstructed from the CFG once a
                // boundary event (branch/switch/return/call) is seen.
                Ok(())
            }
            Classification::MethodEntry => {
                self.push(Event::CallBegin);
                Ok(())
            }
            Classification::ReturnEntry(_) => {
                self.push(Event::RetCode);
                Ok(())
            }
            Classification::Deopt => {
                self.push(Event::Deoptimization);
                Ok(())
            }
            Classification::DeoptReexecuteReturn => {
                self.push(Event::Deoptimization);
                Ok(())
            }
            Classification::EarlyRet => {
                self.push(Event::EarlyRet);
                Ok(())
            }
            Classification::ThrowException => {
                self.push(Event::Throw);
                Ok(())
            }
            Classification::RethrowException => {
                self.push(Event::Rethrow);
                Ok(())
            }
            Classification::RemoveActivationPreservingArgs => {
                self.push(Event::PopFrame);
                Ok(())
            }
            Classification::RemoveActivation => {
                self.push(Event::CallEnd);
                Ok(())
            }
            Classification::ArithmeticThrow(_) => {
                self.push(Event::Throw);
                Ok(())
            }
            Classification::JitcodeOsrEntry => {
                self.push(Event::Osr);
                self.process_jitcode(ip)
            }
            Classification::JitcodeEntry | Classification::Jitcode => self.process_jitcode(ip),
        }
    }

    /// Steps real instructions through JIT-compiled code, tracking PC runs
    /// within a single section so they can be recorded as one `jit_code`
    /// event. Returns once the IP leaves every mapped section; the caller
    /// re-classifies from there.
    fn process_jitcode(&mut self, start_ip: u64) -> Result<(), DriverError> {
        let mut ip = start_ip;
        let mut first = true;
        self.retstack.clear();
        loop {
            let Some(section) = self.timeline.sections.find(ip) else {
                self.flush_jit_run();
                // §7 "missing map": `ip` was classified as compiled code
                // (or we're here fresh off an indirect branch) but no
                // section actually covers it. Leaving a run mid-section to
                // go back to the interpreter is the common case and isn't
                // an error; only the very first lookup failing means the
                // classification lied.
                if first {
                    self.push(Event::DecodeError);
                }
                return Ok(());
            };
            first = false;
            self.record_jit_pc(&section, ip);

            let (code, truncated) = self.read_insn_window(&section, ip);
            if truncated {
                log::debug!("jit instruction at {ip:#x} read across a section boundary");
            }
            let decoded = insn::decode_one(&code, ip)?;
            let next_ip = ip + decoded.len as u64;

            ip = match decoded.class {
                InsnClass::Other | InsnClass::MovCr3 | InsnClass::Ptwrite => next_ip,
                InsnClass::CallDirect => {
                    self.retstack.push(next_ip);
                    decoded.direct_target.unwrap_or(next_ip)
                }
                InsnClass::JumpDirect => decoded.direct_target.unwrap_or(next_ip),
                InsnClass::CondBranch => {
                    self.advance_time()?;
                    match self.query.cond_branch() {
                        Ok(true) => decoded.direct_target.unwrap_or(next_ip),
                        Ok(false) => next_ip,
                        Err(_) => {
                            self.flush_jit_run();
                            self.push(Event::DecodeError);
                            return Ok(());
                        }
                    }
                }
                InsnClass::Return => {
                    if let Some(target) = self.retstack.pop() {
                        target
                    } else {
                        self.advance_time()?;
                        match self.query.indirect_branch() {
                            Ok(target) => target,
                            Err(_) => {
                                self.flush_jit_run();
                                self.push(Event::DecodeError);
                                return Ok(());
                            }
                        }
                    }
                }
                InsnClass::CallIndirect | InsnClass::JumpIndirect | InsnClass::FarTransfer => {
                    self.advance_time()?;
                    if let Some(target) = self.timeline.inline_cache_target(ip, &section) {
                        target
                    } else {
                        match self.query.indirect_branch() {
                            Ok(target) => target,
                            Err(_) => {
                                self.flush_jit_run();
                                self.push(Event::DecodeError);
                                return Ok(());
                            }
                        }
                    }
                }
            };
        }
    }

    /// §4.7: "instruction-length decode with a retry that expands the read
    /// window across section boundaries and marks the instruction
    /// truncated on success". `section.read` only ever clips to its own
    /// code buffer, so a window landing within `MAX_INSN_LEN` bytes of the
    /// section's end comes back short; stitch in the start of whatever
    /// section is loaded contiguously at `section.end()`, if any, rather
    /// than handing `decode_one` a too-short slice and failing outright.
    fn read_insn_window(&self, section: &JitSectionRef, ip: u64) -> (Vec<u8>, bool) {
        const MAX_INSN_LEN: usize = 16;
        let mut buf = section.read(ip, MAX_INSN_LEN).unwrap_or(&[]).to_vec();
        let truncated = buf.len() < MAX_INSN_LEN;
        if truncated {
            if let Some(next) = self.timeline.sections.find_by_start(section.end()) {
                if let Some(more) = next.read(section.end(), MAX_INSN_LEN - buf.len()) {
                    buf.extend_from_slice(more);
                }
            }
        }
        (buf, truncated)
    }

    fn record_jit_pc(&mut self, section: &JitSectionRef, ip: u64) {
        let Some(descriptor) = section.find_pc(ip) else { return };
        let idx = section.pc_descriptors.iter().position(|d| std::ptr::eq(d, descriptor)).unwrap_or(0);
        match &mut self.jit_run {
            Some((cur_section, indices)) if std::sync::Arc::ptr_eq(cur_section, section) => {
                if indices.last() != Some(&idx) {
                    indices.push(idx);
                }
            }
            _ => {
                self.flush_jit_run();
                self.jit_run = Some((section.clone(), vec![idx]));
            }
        }
    }

    fn flush_jit_run(&mut self) {
        if let Some((section, indices)) = self.jit_run.take() {
            let time = self.query.time();
            let tid = self.tid;
            self.out.push(TimedEvent { time, tid, event: Event::JitCode { section, pc_indices: indices } });
        }
    }
}

#[cfg(test)]
mod tests {
    use rustc_hash::FxHashMap;

    use super::*;
    use crate::jit::{JitSection, PcDescriptor};
    use crate::runtime::method::MethodId;
    use crate::sideband::TimeConversion;

    fn new_driver<'a>(pt_data: &'a [u8], timeline: &'a mut Timeline, dump_data: &'a [u8], sideband_data: &'a [u8]) -> Driver<'a> {
        let conversion = TimeConversion { time_mult: 1, time_shift: 0, time_zero: 0 };
        Driver::new(pt_data, timeline, DumpReader::new(dump_data), SidebandReplayer::new(sideband_data, 0, conversion))
    }

    fn section_with_descriptors(start: u64, code: Vec<u8>, descriptor_pcs: &[u64]) -> JitSection {
        let code_size = code.len() as u64;
        JitSection {
            start,
            code_size,
            code,
            entry_point: start,
            verified_entry_point: start,
            osr_entry_point: start,
            inlined_methods: FxHashMap::default(),
            main_method: MethodId(0),
            pc_descriptors: descriptor_pcs.iter().map(|&pc| PcDescriptor { pc, stack: Vec::new() }).collect(),
        }
    }

    fn psb_bytes() -> Vec<u8> {
        let mut v = Vec::new();
        for _ in 0..8 {
            v.push(0x02);
            v.push(0x82);
        }
        v
    }

    /// Testable property #5: a direct call pushes its return address, a
    /// `ret` while the stack holds that address pops it straight back
    /// (no PT consulted), and only once the stack is genuinely empty does
    /// a further `ret` fall through to `indirect_branch` for a trace-
    /// supplied target. Exercised through `process_jitcode` with real
    /// x86 call/ret bytes, matching the shape the bugs in comments #2/#3
    /// would previously never have reached at all.
    #[test]
    fn process_jitcode_pops_retstack_before_consulting_pt() {
        let mut code = vec![0x90u8; 0x20];
        code[0] = 0xe8; // call rel32
        code[1..5].copy_from_slice(&0x0bu32.to_le_bytes()); // target = 0x2005 + 0xb = 0x2010
        code[6] = 0xc3; // ret, at 0x2006
        code[0x10] = 0xc3; // ret, at 0x2010

        let section = section_with_descriptors(0x2000, code, &[0x2000, 0x2005, 0x2006, 0x2010]);
        let mut timeline = Timeline::new();
        timeline.sections.add(section);

        let mut pt_data = vec![0x8du8]; // TIP, full ip
        pt_data.extend_from_slice(&0x9999u64.to_le_bytes());

        let mut driver = new_driver(&pt_data, &mut timeline, &[], &[]);
        driver.process_jitcode(0x2000).unwrap();

        let events = driver.into_events();
        assert_eq!(events.len(), 1);
        match &events[0].event {
            Event::JitCode { section, pc_indices } => {
                assert_eq!(section.start, 0x2000);
                assert_eq!(pc_indices, &[0, 3, 1, 2]);
            }
            other => panic!("expected a single jit_code event, got {other:?}"),
        }
    }

    /// §7's "missing map": an ip that resolves to no section at all on the
    /// very first lookup of a `process_jitcode` run is a genuine error, not
    /// the ordinary case of a run exiting back to the interpreter.
    #[test]
    fn process_jitcode_reports_decode_error_when_first_lookup_misses() {
        let mut timeline = Timeline::new();
        let mut driver = new_driver(&[], &mut timeline, &[], &[]);
        driver.process_jitcode(0xdead_beef).unwrap();

        let events = driver.into_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].event, Event::DecodeError));
    }

    /// Comment #9: `Classification::JitcodeOsrEntry` has no codelet-table
    /// address data; it's resolved against the JIT Section Index by
    /// `Timeline::classify`, and `process_ip` must push `Event::Osr` before
    /// entering the section (previously dead on the producer side).
    #[test]
    fn process_ip_classifies_osr_entry_and_pushes_osr_then_enters_jitcode() {
        let mut code = vec![0x90u8; 8];
        code[0] = 0xc3; // ret, at the osr entry itself
        let mut section = section_with_descriptors(0x3000, code, &[0x3000]);
        section.entry_point = 0x3100; // distinct from osr_entry_point so classify picks Osr
        section.osr_entry_point = 0x3000;

        let mut timeline = Timeline::new();
        timeline.sections.add(section);

        let mut pt_data = vec![0x8du8];
        pt_data.extend_from_slice(&0x9999u64.to_le_bytes());

        let mut driver = new_driver(&pt_data, &mut timeline, &[], &[]);
        driver.process_ip(0x3000).unwrap();

        let events: Vec<_> = driver.into_events().into_iter().map(|e| e.event).collect();
        assert!(matches!(events[0], Event::Osr), "expected Osr first, got {:?}", events.first());
        assert!(
            events.iter().any(|e| matches!(e, Event::JitCode { .. })),
            "expected a jit_code event after the osr entry, got {events:?}"
        );
    }

    /// Comments #2/#3: ordinary bytecode dispatch produces no event of its
    /// own, a two-way conditional branch's dispatch arms `pending_branch`
    /// so the very next TNT decision resolves to `Taken`/`NotTaken`, and a
    /// switch dispatch is an honest `decode_error` rather than a guess.
    #[test]
    fn run_resolves_a_pending_branch_against_the_next_tnt_bit() {
        let mut data = psb_bytes();
        data.push(0x02);
        data.push(0x23); // PSBEND, leaves the query disabled with no FUP
        data.push(0b0100_0001); // short TNT, one buffered decision: not-taken

        let mut timeline = Timeline::new();
        let mut driver = new_driver(&data, &mut timeline, &[], &[]);
        driver.pending_branch = true;
        driver.run();

        let events: Vec<_> = driver.into_events().into_iter().map(|e| e.event).collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::NotTaken));
    }

    /// §4.7's read-window retry: a window clipped near a section's end is
    /// stitched from whatever section is loaded contiguously at that
    /// boundary, and the stitch is reported as truncated.
    #[test]
    fn read_insn_window_stitches_across_a_section_boundary() {
        let low = section_with_descriptors(0x5000, vec![0xe8, 0x00, 0x00], &[]);
        let high = section_with_descriptors(0x5003, vec![0x00, 0x00, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90], &[]);

        let mut timeline = Timeline::new();
        timeline.sections.add(low);
        timeline.sections.add(high);

        let low_ref = timeline.sections.find(0x5000).unwrap();
        let driver = new_driver(&[], &mut timeline, &[], &[]);
        let (code, truncated) = driver.read_insn_window(&low_ref, 0x5000);

        assert!(truncated);
        assert_eq!(code.len(), 16);
        assert_eq!(&code[..5], &[0xe8, 0x00, 0x00, 0x00, 0x00]);
    }
}
