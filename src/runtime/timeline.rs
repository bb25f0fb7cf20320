//! Runtime Timeline (decoder spec §4.3).
//!
//! Replays the JVM dump in timestamp order, feeding the Bytecode CFG
//! (lazily, via the method table) and JIT Section Index, and maintaining
//! the system-tid<->java-tid map and the inline-cache source->target map.
//! Owned per Driver (§5): each partition's Driver gets its own `Timeline`
//! replaying from a shared, read-only copy of the dump bytes, so JIT
//! section inserts are local to that Driver's view.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::codelet::{Classification, CodeletTable, CodeletTableError, Classifier};
use crate::jit::{JitSection, SectionIndex};
use crate::runtime::dump::{DumpError, DumpFrame, DumpReader};
use crate::runtime::method::{MethodId, MethodTable};

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("dump frame error: {0}")]
    Dump(#[from] DumpError),
    #[error("codelet table error: {0}")]
    CodeletTable(#[from] CodeletTableError),
    #[error("codelet_info installed twice with mismatched payloads")]
    CodeletTableMismatch,
    #[error("advance_to called with non-monotonic timestamp: {previous} then {requested}")]
    NonMonotonicTime { previous: u64, requested: u64 },
}

#[derive(Default)]
pub struct Timeline {
    pub methods: MethodTable,
    pub sections: SectionIndex,
    codelet_table: Option<CodeletTable>,
    classifier: Option<Classifier>,
    /// sys_tid -> java_tid.
    tid_map: FxHashMap<u32, u32>,
    /// (src ip, enclosing section start) -> cached target ip.
    inline_cache: FxHashMap<(u64, u64), u64>,
    last_time: u64,
}

impl Timeline {
    pub fn new() -> Timeline {
        Timeline::default()
    }

    pub fn classifier(&self) -> Option<&Classifier> {
        self.classifier.as_ref()
    }

    /// §4.4's full classification contract: a codelet-table membership test
    /// first, falling back to JIT section membership for the three
    /// compiled-code kinds (`jitcode_entry`/`jitcode_osr_entry`/`jitcode`)
    /// the codelet table itself has no address slots for -- those are
    /// recognized against the JIT Section Index instead, the same source
    /// `process_jitcode` (§4.7) already consults. `Illegal` means neither
    /// source recognizes the address at all, which §7 calls "missing map".
    pub fn classify(&self, ip: u64) -> Classification {
        let from_codelets = self.classifier.as_ref().map(|c| c.classify(ip)).unwrap_or(Classification::Illegal);
        if !matches!(from_codelets, Classification::Illegal) {
            return from_codelets;
        }
        match self.sections.find(ip) {
            Some(section) if ip == section.entry_point => Classification::JitcodeEntry,
            Some(section) if ip == section.osr_entry_point => Classification::JitcodeOsrEntry,
            Some(_) => Classification::Jitcode,
            None => Classification::Illegal,
        }
    }

    pub fn java_tid(&self, sys_tid: u32) -> Option<u32> {
        self.tid_map.get(&sys_tid).copied()
    }

    pub fn inline_cache_target(&self, ip: u64, section: &JitSection) -> Option<u64> {
        self.inline_cache.get(&(ip, section.start)).copied()
    }

    /// Processes all dump frames with timestamp <= `t` (§4.3). Ordering
    /// guarantee: callers must invoke this with non-decreasing `t`
    /// (testable property #6); violating that is a fatal error here rather
    /// than silently reordering.
    pub fn advance_to(&mut self, reader: &mut DumpReader<'_>, t: u64) -> Result<(), TimelineError> {
        if t < self.last_time {
            return Err(TimelineError::NonMonotonicTime { previous: self.last_time, requested: t });
        }
        self.last_time = t;

        while let Some(frame_time) = reader.peek_time() {
            if frame_time > t {
                break;
            }
            let Some((_, frame)) = reader.next()? else { break };
            self.apply(frame)?;
        }
        Ok(())
    }

    fn apply(&mut self, frame: DumpFrame) -> Result<(), TimelineError> {
        match frame {
            DumpFrame::CodeletInfo(payload) => {
                let table = CodeletTable::parse(&payload)?;
                if let Some(existing) = &self.codelet_table {
                    if !existing.matches(&table) {
                        return Err(TimelineError::CodeletTableMismatch);
                    }
                } else {
                    self.classifier = Some(Classifier::new(&table));
                    self.codelet_table = Some(table);
                }
            }
            DumpFrame::MethodEntryInitial(m) => {
                self.methods.register(m.idx, m.class_name, m.method_name, m.signature);
            }
            DumpFrame::MethodEntry(_) | DumpFrame::MethodExit(_) => {
                // These are only used by the original's own interpreter-call
                // counting; the decoder's method_entry/method_exit *events*
                // (§3) come from PT codelet classification, not from the
                // dump stream, so there is nothing further to do here.
            }
            DumpFrame::CompiledMethodLoad(load) => {
                let mut inlined_methods = FxHashMap::default();
                let mut main_method = MethodId(u32::MAX);
                for (index, info) in load.inline_methods.iter() {
                    let id = MethodId(*index);
                    self.methods
                        .register(id, info.class_name.clone(), info.method_name.clone(), info.signature.clone());
                    inlined_methods.insert(*index, id);
                    if main_method == MethodId(u32::MAX) {
                        main_method = id;
                    }
                }
                let section = JitSection {
                    start: load.code_begin,
                    code_size: load.code_size as u64,
                    code: load.code,
                    entry_point: load.entry_point,
                    verified_entry_point: load.verified_entry_point,
                    osr_entry_point: load.osr_entry_point,
                    inlined_methods,
                    main_method,
                    pc_descriptors: load.pc_descriptors,
                };
                self.sections.add(section);
            }
            DumpFrame::CompiledMethodUnload(u) => {
                self.sections.remove(u.code_begin);
            }
            DumpFrame::ThreadStart(ts) => {
                self.tid_map.insert(ts.sys_tid, ts.java_tid);
            }
            DumpFrame::InlineCacheAdd(ic) => {
                // The enclosing section at insertion time keys the cache
                // entry (§4.3); a later call from the same `src` after the
                // section is retired simply misses (fall through to PT).
                if let Some(section) = self.sections.find(ic.src) {
                    self.inline_cache.insert((ic.src, section.start), ic.dest);
                }
            }
            DumpFrame::InlineCacheClear(ic) => {
                if let Some(section) = self.sections.find(ic.src) {
                    self.inline_cache.remove(&(ic.src, section.start));
                }
            }
        }
        Ok(())
    }
}
