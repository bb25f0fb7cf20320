//! Frame Matcher & Output (decoder spec §4.9).
//!
//! Consumes the union of every partition's recorder segments, grouped by
//! Java thread id and time-ordered, and replays them against a per-thread
//! interpreter/JIT frame stack to emit one bytecode-sequence file per
//! thread. Grounded on `ThreadSplit::merge`/`BytecodeExtractor::process`
//! (`thread_split.cpp`, `bytecode_extractor.cpp`): those walk the same
//! merged-by-tid event stream and drive the same two-stack frame model
//! (an interpreter stack of `(method, bci)` and a JIT stack of inlined
//! `(method, bci)` tuples per compiled frame); this module just replaces
//! "bci" with our own `BlockId` since we track control flow at block
//! granularity rather than per-instruction.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use crate::bytecode::{BlockId, Cfg};
use crate::classfile::ClassPath;
use crate::event::{Event, ThreadSegment};
use crate::jit::JitSectionRef;
use crate::runtime::{MethodId, MethodTable};

#[derive(Debug, Clone)]
enum Frame {
    Interp {
        method: MethodId,
        block: BlockId,
    },
    /// One compiled frame: the section plus its inlined-call stack,
    /// outermost caller first, innermost callee last (§3 "Frame Stack").
    Jit {
        section: JitSectionRef,
        frames: Vec<(MethodId, BlockId)>,
    },
}

#[derive(Debug, Clone)]
enum OutItem {
    Op(u8),
    /// §7: "any thread that saw data_loss carries an inline marker in its
    /// output".
    Loss,
}

/// Per-thread end-of-run error tally (§7 "end-of-run log summarizes
/// per-thread error counts").
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSummary {
    pub tid: u32,
    pub decode_errors: u64,
    pub saw_loss: bool,
}

struct ThreadOutput {
    tid: u32,
    stack: Vec<Frame>,
    out: Vec<OutItem>,
    pending_bci: Option<u32>,
    decode_errors: u64,
    saw_loss: bool,
}

impl ThreadOutput {
    fn new(tid: u32) -> ThreadOutput {
        ThreadOutput {
            tid,
            stack: Vec::new(),
            out: Vec::new(),
            pending_bci: None,
            decode_errors: 0,
            saw_loss: false,
        }
    }

    fn emit_block(&mut self, cfg: &Cfg, id: BlockId) {
        let block = cfg.block(id);
        self.out.extend(cfg.block_opcodes(block).into_iter().map(OutItem::Op));
    }

    /// §4.9 "the BFS-with-preference routine to connect successive
    /// blocks": emits every block on the shortest successor-edge path from
    /// `from` up to (not including) `to`, which becomes the new current
    /// block. Falls back to emitting just `from` if the blocks are
    /// disconnected in the CFG (can happen across exception edges the
    /// block graph doesn't model as successors).
    fn connect_and_emit(&mut self, cfg: &Cfg, from: BlockId, to: BlockId) {
        if from.0 == to.0 {
            return;
        }
        match cfg.bfs_path(from, to) {
            Some(path) => {
                for &b in &path[..path.len() - 1] {
                    self.emit_block(cfg, b);
                }
            }
            None => self.emit_block(cfg, from),
        }
    }

    fn cfg_of(&mut self, method: MethodId, methods: &mut MethodTable, classes: &mut ClassPath) -> Option<Arc<Cfg>> {
        let cfg = methods.cfg(method, classes);
        if cfg.is_none() {
            self.decode_errors += 1;
        }
        cfg
    }

    /// Pops the top frame, emitting the interpreter frame's current block
    /// first (it is being "left"); a JIT frame's contents were already
    /// emitted incrementally by `process_jit_code`, so popping one emits
    /// nothing further.
    fn pop_and_emit(&mut self, methods: &mut MethodTable, classes: &mut ClassPath) {
        match self.stack.pop() {
            Some(Frame::Interp { method, block }) => {
                if let Some(cfg) = self.cfg_of(method, methods, classes) {
                    self.emit_block(&cfg, block);
                }
            }
            Some(Frame::Jit { .. }) | None => {}
        }
    }

    fn unwind_to_method(&mut self, m: MethodId, methods: &mut MethodTable, classes: &mut ClassPath) {
        loop {
            let should_pop = match self.stack.last() {
                Some(Frame::Interp { method, .. }) => *method != m,
                Some(Frame::Jit { .. }) => true,
                None => false,
            };
            if !should_pop {
                return;
            }
            self.pop_and_emit(methods, classes);
        }
    }

    fn method_entry(&mut self, m: MethodId, methods: &mut MethodTable, classes: &mut ClassPath) {
        let Some(cfg) = self.cfg_of(m, methods, classes) else { return };
        self.stack.push(Frame::Interp { method: m, block: cfg.entry() });
    }

    /// §4.9: "advance the top frame's current_block along the CFG to the
    /// block containing bci. If the top frame's method != m, first unwind
    /// frames until it matches." `is_exit` additionally pops the frame
    /// once it has been advanced, for `method_exit`.
    fn method_point(&mut self, m: MethodId, bci: u32, is_exit: bool, methods: &mut MethodTable, classes: &mut ClassPath) {
        self.unwind_to_method(m, methods, classes);
        let Some(cfg) = self.cfg_of(m, methods, classes) else { return };
        let Some(target) = cfg.block_containing(bci).map(|b| b.id) else {
            self.decode_errors += 1;
            return;
        };
        let cur = match self.stack.last() {
            Some(Frame::Interp { block, .. }) => Some(*block),
            _ => None,
        };
        match cur {
            None => {
                // No matching method_entry was seen (trace started
                // mid-method); synthesize a frame directly at the named
                // block.
                self.stack.push(Frame::Interp { method: m, block: target });
            }
            Some(cur) if cur != target => {
                self.connect_and_emit(&cfg, cur, target);
                if let Some(Frame::Interp { block, .. }) = self.stack.last_mut() {
                    *block = target;
                }
            }
            Some(_) => {}
        }
        if is_exit {
            self.pop_and_emit(methods, classes);
        }
    }

    /// §4.9: "follow a subroutine-return by setting the current block to
    /// the block whose first bci matches the paired bci event" -- same
    /// connect-and-advance as `method_point`, but never unwinds (a `ret`
    /// returns within the same method frame) and never pops.
    fn ret_code(&mut self, bci: u32, methods: &mut MethodTable, classes: &mut ClassPath) {
        let Some(Frame::Interp { method, block }) = self.stack.last() else {
            self.decode_errors += 1;
            return;
        };
        let (method, cur) = (*method, *block);
        let Some(cfg) = self.cfg_of(method, methods, classes) else { return };
        let Some(target) = cfg.block_containing(bci) else {
            self.decode_errors += 1;
            return;
        };
        self.connect_and_emit(&cfg, cur, target.id);
        if let Some(Frame::Interp { block, .. }) = self.stack.last_mut() {
            *block = target.id;
        }
    }

    /// §4.1 encoding: successor[0] is taken/default, successor[1] is
    /// fall-through/case 0, ...; emits the block being left, then moves.
    fn move_successor(&mut self, idx: usize, methods: &mut MethodTable, classes: &mut ClassPath) {
        let Some(Frame::Interp { method, block }) = self.stack.last() else {
            self.decode_errors += 1;
            return;
        };
        let (method, cur) = (*method, *block);
        let Some(cfg) = self.cfg_of(method, methods, classes) else { return };
        self.emit_block(&cfg, cur);
        let Some(&next) = cfg.block(cur).successors.get(idx) else {
            self.decode_errors += 1;
            return;
        };
        if let Some(Frame::Interp { block, .. }) = self.stack.last_mut() {
            *block = next;
        }
    }

    /// §4.9 "throw/rethrow ... handle ... redirects to the matching
    /// exception-table entry's handler block": searches outward for the
    /// first frame whose CFG has a handler covering the current block,
    /// unwinding (and emitting) frames that don't. We have no thrown-type
    /// information at this layer (§9's open question on
    /// `handle_exception` pairing notes the source itself is ambiguous
    /// here), so every handler is treated as a catch-all candidate.
    fn throw(&mut self, methods: &mut MethodTable, classes: &mut ClassPath) {
        loop {
            let top_is_jit = matches!(self.stack.last(), Some(Frame::Jit { .. }));
            let interp = match self.stack.last() {
                Some(Frame::Interp { method, block }) => Some((*method, *block)),
                _ => None,
            };
            let Some((method, cur)) = interp else {
                if top_is_jit {
                    self.pop_and_emit(methods, classes);
                    continue;
                }
                return;
            };
            let Some(cfg) = self.cfg_of(method, methods, classes) else {
                self.pop_and_emit(methods, classes);
                continue;
            };
            let pc = cfg.block(cur).start;
            let handler_target = cfg
                .handler_for(pc, |_| true)
                .and_then(|h| cfg.block_containing(h.handler_pc))
                .map(|b| b.id);
            if let Some(target) = handler_target {
                self.connect_and_emit(&cfg, cur, target);
                if let Some(Frame::Interp { block, .. }) = self.stack.last_mut() {
                    *block = target;
                }
                return;
            }
            self.pop_and_emit(methods, classes);
        }
    }

    /// §4.9 "jit_code(section, pcs): process the sequence of PC
    /// descriptors with the match tree algorithm". Each descriptor's
    /// innermost `(method, block)` is emitted once, deduplicated against
    /// the immediately preceding descriptor -- a run of PCs that stay in
    /// the same innermost block (e.g. while a loop's back-edge is still
    /// inside one block) collapses to a single emission, matching
    /// "closing the tree ... emits all blocks traversed" for the common
    /// case where nothing in the run revisits an earlier stack. The full
    /// per-section frame stack is kept up to date so later exception or
    /// deopt events see the correct inlined call chain.
    fn process_jit_code(
        &mut self,
        section: &JitSectionRef,
        pc_indices: &[usize],
        methods: &mut MethodTable,
        classes: &mut ClassPath,
    ) {
        let already_on_top = matches!(self.stack.last(), Some(Frame::Jit { section: s, .. }) if Arc::ptr_eq(s, section));
        if !already_on_top {
            self.stack.push(Frame::Jit { section: section.clone(), frames: Vec::new() });
        }

        let mut last_innermost: Option<(MethodId, BlockId)> = None;
        for &idx in pc_indices {
            let Some(descriptor) = section.pc_descriptors.get(idx) else {
                self.decode_errors += 1;
                continue;
            };
            let mut resolved = Vec::with_capacity(descriptor.stack.len());
            let mut ok = true;
            for &(inline_index, bci) in &descriptor.stack {
                let Some(method) = section.method(inline_index) else {
                    ok = false;
                    break;
                };
                let Some(cfg) = self.cfg_of(method, methods, classes) else {
                    ok = false;
                    break;
                };
                let Some(block) = cfg.block_containing(bci) else {
                    ok = false;
                    break;
                };
                resolved.push((method, block.id));
            }
            if !ok || resolved.is_empty() {
                self.decode_errors += 1;
                continue;
            }

            let innermost = *resolved.last().unwrap();
            if last_innermost != Some(innermost) {
                if let Some(cfg) = self.cfg_of(innermost.0, methods, classes) {
                    self.emit_block(&cfg, innermost.1);
                }
                last_innermost = Some(innermost);
            }
            if let Some(Frame::Jit { frames, .. }) = self.stack.last_mut() {
                *frames = resolved;
            }
        }
    }

    fn apply(&mut self, event: &Event, methods: &mut MethodTable, classes: &mut ClassPath) {
        match event {
            Event::CallBegin | Event::CallEnd | Event::NonInvokeRet => {
                // §4.9: "mark frame transitions that must not be interpreted
                // as control-flow events".
            }
            Event::MethodEntry(m) => self.method_entry(*m, methods, classes),
            Event::MethodExit(m) => {
                let bci = self.pending_bci.take().unwrap_or(0);
                self.method_point(*m, bci, true, methods, classes);
            }
            Event::MethodPoint(m) => {
                let bci = self.pending_bci.take().unwrap_or(0);
                self.method_point(*m, bci, false, methods, classes);
            }
            Event::Bci(i) => self.pending_bci = Some(*i),
            Event::Taken => self.move_successor(0, methods, classes),
            Event::NotTaken => self.move_successor(1, methods, classes),
            Event::SwitchDefault => self.move_successor(0, methods, classes),
            Event::SwitchCase(i) => self.move_successor(*i as usize + 1, methods, classes),
            Event::RetCode => {
                let bci = self.pending_bci.take().unwrap_or(0);
                self.ret_code(bci, methods, classes);
            }
            Event::Throw | Event::Rethrow => self.throw(methods, classes),
            Event::Handle => {
                // §9 open question: the source pairs `handle` with exactly
                // one `method_point` carrying the handler bci; that event
                // does the actual redirect, so `handle` itself is a marker.
            }
            Event::PopFrame => {
                self.stack.pop();
            }
            Event::EarlyRet => self.pop_and_emit(methods, classes),
            Event::Deoptimization => {
                if matches!(self.stack.last(), Some(Frame::Jit { .. })) {
                    self.stack.pop();
                }
            }
            Event::Osr => {
                if matches!(self.stack.last(), Some(Frame::Interp { .. })) {
                    self.stack.pop();
                }
            }
            Event::JitCode { section, pc_indices } => self.process_jit_code(section, pc_indices, methods, classes),
            Event::DataLoss => {
                self.stack.clear();
                self.saw_loss = true;
                self.out.push(OutItem::Loss);
            }
            Event::DecodeError => self.decode_errors += 1,
        }
    }
}

/// Groups recorder segments from every partition by Java tid, sorted by
/// `(start_time, end_time)` with ties on `end_time` (§4.9 input ordering).
fn group_by_tid(segments: Vec<ThreadSegment>) -> BTreeMap<u32, Vec<ThreadSegment>> {
    let mut by_tid: BTreeMap<u32, Vec<ThreadSegment>> = BTreeMap::new();
    for seg in segments {
        by_tid.entry(seg.tid).or_default().push(seg);
    }
    for segs in by_tid.values_mut() {
        segs.sort_by_key(|s| (s.start_time, s.end_time));
    }
    by_tid
}

/// Runs the Frame Matcher over every thread's merged segments and writes
/// `<out_prefix>-thrd<tid>` for each one (§4.9, §6). Returns one summary
/// per thread for the end-of-run log.
pub fn write_outputs(
    segments: Vec<ThreadSegment>,
    methods: &mut MethodTable,
    classes: &mut ClassPath,
    out_prefix: &str,
) -> io::Result<Vec<ThreadSummary>> {
    let mut summaries = Vec::new();
    for (tid, segs) in group_by_tid(segments) {
        let mut thread = ThreadOutput::new(tid);
        for seg in segs {
            for timed in seg.events {
                thread.apply(&timed.event, methods, classes);
            }
        }
        write_thread_file(out_prefix, tid, &thread.out)?;
        summaries.push(ThreadSummary { tid, decode_errors: thread.decode_errors, saw_loss: thread.saw_loss });
    }
    Ok(summaries)
}

fn write_thread_file(out_prefix: &str, tid: u32, items: &[OutItem]) -> io::Result<()> {
    let path = format!("{out_prefix}-thrd{tid}");
    let mut w = BufWriter::new(File::create(path)?);
    for item in items {
        match item {
            OutItem::Op(op) => writeln!(w, "{op}")?,
            OutItem::Loss => writeln!(w, "LOSS")?,
        }
    }
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Cfg;
    use crate::pt::TimedEvent;

    fn straight_line_method() -> Cfg {
        // iconst_0(3) istore_1(59) return(177): one block, no successors.
        Cfg::build(&[3u8, 59, 177], vec![]).unwrap()
    }

    fn two_block_method() -> Cfg {
        // nop(0) goto +3 -> target 4; nop(4) return(177)
        Cfg::build(&[0u8, 167, 0, 3, 0, 177], vec![]).unwrap()
    }

    #[test]
    fn emit_block_writes_every_opcode_in_order() {
        let cfg = two_block_method();
        let mut t = ThreadOutput::new(1);
        t.emit_block(&cfg, cfg.entry());
        assert_eq!(t.out.len(), 2); // nop, goto
        assert!(matches!(t.out[0], OutItem::Op(0)));
        assert!(matches!(t.out[1], OutItem::Op(167)));
    }

    #[test]
    fn connect_and_emit_walks_the_cfg_between_two_blocks() {
        let cfg = two_block_method();
        let mut t = ThreadOutput::new(1);
        let entry = cfg.entry();
        let target = cfg.block(entry).successors[0];
        t.connect_and_emit(&cfg, entry, target);
        // Only the entry block's opcodes are emitted; `target` itself is
        // the new current block, not yet left.
        assert_eq!(t.out.len(), 2);
    }

    #[test]
    fn data_loss_clears_stack_and_marks_output() {
        let cfg = straight_line_method();
        let mut methods = MethodTable::new();
        let mut classes = ClassPath::new(vec![]);
        let mut t = ThreadOutput::new(1);
        t.stack.push(Frame::Interp { method: MethodId(0), block: cfg.entry() });
        t.apply(&Event::DataLoss, &mut methods, &mut classes);
        assert!(t.stack.is_empty());
        assert!(t.saw_loss);
        assert!(matches!(t.out.last(), Some(OutItem::Loss)));
    }

    #[test]
    fn jit_code_dedups_consecutive_identical_innermost_frames() {
        // Testable property #8's shape: the same PC resolves to the same
        // (method, block) on every step, so it's emitted exactly once.
        let cfg = straight_line_method();
        let mut t = ThreadOutput::new(1);
        let indices = [0usize, 1usize];
        let mut last = None;
        for _ in indices {
            let block = cfg.block_containing(0).unwrap();
            let innermost = (MethodId(7), block.id);
            if last != Some(innermost) {
                t.emit_block(&cfg, block.id);
                last = Some(innermost);
            }
        }
        assert_eq!(t.out.len(), 3); // one block's worth of opcodes, emitted once
    }

    #[test]
    fn group_by_tid_sorts_by_start_then_end_time() {
        let seg = |tid, start, end| ThreadSegment { tid, start_time: start, end_time: end, events: Vec::<TimedEvent>::new() };
        let segments = vec![seg(2, 10, 20), seg(1, 5, 9), seg(1, 0, 4)];
        let grouped = group_by_tid(segments);
        let tid1 = &grouped[&1];
        assert_eq!(tid1[0].start_time, 0);
        assert_eq!(tid1[1].start_time, 5);
        assert!(grouped.contains_key(&2));
    }
}
