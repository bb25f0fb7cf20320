//! JIT Section Index (decoder spec §4.2).
//!
//! Sections live in an address-sorted `Vec`; `find` binary searches it.
//! Retirement moves a displaced section into a side list so any `Arc`
//! clone already handed out to an in-flight consumer stays valid (§3
//! "Ownership", §5 "shared ownership with retirement lists, released when
//! the last holder drops" — here that's just `Arc`'s refcount).

use super::section::{JitSection, JitSectionRef};

#[derive(Default)]
pub struct SectionIndex {
    /// Sorted ascending by `start`. Invariant: live sections never overlap.
    live: Vec<JitSectionRef>,
    /// Retired sections, kept only so that any clone already returned by
    /// `find` before retirement remains valid; never looked up again.
    retired: Vec<JitSectionRef>,
}

impl SectionIndex {
    pub fn new() -> SectionIndex {
        SectionIndex::default()
    }

    /// Inserts `section`, retiring any live section whose address range
    /// intersects it first (§4.2, §7 "overlapping JIT section: retire the
    /// older section, keep the newer").
    pub fn add(&mut self, section: JitSection) {
        let section: JitSectionRef = JitSectionRef::new(section);
        let start = section.start;
        let end = section.end();

        let mut i = 0;
        while i < self.live.len() {
            let overlaps = self.live[i].start < end && start < self.live[i].end();
            if overlaps {
                let retired = self.live.remove(i);
                self.retired.push(retired);
            } else {
                i += 1;
            }
        }

        let idx = self.live.partition_point(|s| s.start < start);
        self.live.insert(idx, section);
    }

    /// Retires the live section containing `addr`, if any.
    pub fn remove(&mut self, addr: u64) {
        if let Some(i) = self.live.iter().position(|s| s.contains(addr)) {
            let retired = self.live.remove(i);
            self.retired.push(retired);
        }
    }

    /// O(log n) over live sections (§4.2 contract).
    pub fn find(&self, addr: u64) -> Option<JitSectionRef> {
        let idx = self.live.partition_point(|s| s.start <= addr);
        if idx == 0 {
            return None;
        }
        let candidate = &self.live[idx - 1];
        if candidate.contains(addr) {
            Some(candidate.clone())
        } else {
            None
        }
    }

    pub fn find_by_start(&self, start: u64) -> Option<JitSectionRef> {
        let idx = self.live.partition_point(|s| s.start < start);
        self.live.get(idx).filter(|s| s.start == start).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::method::MethodId;
    use rustc_hash::FxHashMap;

    fn section(start: u64, size: u64) -> JitSection {
        JitSection {
            start,
            code_size: size,
            code: vec![0u8; size as usize],
            entry_point: start,
            verified_entry_point: start,
            osr_entry_point: start,
            inlined_methods: FxHashMap::default(),
            main_method: MethodId(0),
            pc_descriptors: Vec::new(),
        }
    }

    #[test]
    fn overlapping_insertion_retires_the_older_section() {
        let mut idx = SectionIndex::new();
        idx.add(section(100, 100)); // [100, 200)
        idx.add(section(150, 100)); // [150, 250), overlaps the first

        assert!(idx.find(160).is_some());
        assert_eq!(idx.find(160).unwrap().start, 150);
        assert!(idx.find(120).is_none(), "the first section must be retired");

        idx.remove(180);
        assert!(idx.find(160).is_none());
    }

    #[test]
    fn find_is_none_outside_any_live_range() {
        let mut idx = SectionIndex::new();
        idx.add(section(0, 10));
        assert!(idx.find(10).is_none());
        assert!(idx.find(9).is_some());
    }
}
