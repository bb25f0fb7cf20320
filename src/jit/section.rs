//! JIT Section data model (decoder spec §3, §4.2).

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::runtime::method::MethodId;

/// One entry on the compile-time call stack at a specific compiled PC,
/// outermost caller first, innermost callee last (§3).
#[derive(Debug, Clone)]
pub struct PcDescriptor {
    pub pc: u64,
    /// (inlined-method index into `JitSection::inlined_methods`, bci), outermost to innermost.
    pub stack: Vec<(u32, u32)>,
}

/// An immutable, shared-ownership record of one loaded compiled-code region
/// (§3 "JIT Section"). Created by the Runtime Timeline (§4.3), referenced by
/// the PT Query Driver (§4.7) and the Frame Matcher (§4.9), never mutated
/// after construction. Retirement (§4.2) keeps a previously returned `Arc`
/// valid for the lifetime of any decoder work item that observed it.
#[derive(Debug)]
pub struct JitSection {
    pub start: u64,
    pub code_size: u64,
    pub code: Vec<u8>,
    pub entry_point: u64,
    pub verified_entry_point: u64,
    pub osr_entry_point: u64,
    /// Small integer index -> method id, the table the spec's PC descriptors index into.
    pub inlined_methods: FxHashMap<u32, MethodId>,
    pub main_method: MethodId,
    /// Sorted ascending by `pc`, so `find` can binary search.
    pub pc_descriptors: Vec<PcDescriptor>,
}

impl JitSection {
    pub fn end(&self) -> u64 {
        self.start + self.code_size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// §3: "the descriptor whose pc is the smallest value ≥ the query address".
    pub fn find_pc(&self, addr: u64) -> Option<&PcDescriptor> {
        let idx = self.pc_descriptors.partition_point(|d| d.pc < addr);
        self.pc_descriptors.get(idx)
    }

    pub fn method(&self, inline_index: u32) -> Option<MethodId> {
        self.inlined_methods.get(&inline_index).copied()
    }

    /// §4.7: read bytes from the section, expanding the caller's window is
    /// the caller's job (instruction-length-decode retry); this just slices.
    pub fn read(&self, addr: u64, max_len: usize) -> Option<&[u8]> {
        if !self.contains(addr) {
            return None;
        }
        let off = (addr - self.start) as usize;
        let end = (off + max_len).min(self.code.len());
        self.code.get(off..end)
    }
}

pub type JitSectionRef = Arc<JitSection>;
