//! Bytecode control-flow graph (decoder spec §4.1).
//!
//! Built from raw method code bytes plus an exception table. Two passes:
//! the first records every block start (branch targets, fall-throughs after
//! a terminator, switch successors, and the offset following
//! invoke/jsr/ret); the second materializes blocks and wires successors in
//! the canonical order the event stream expects.

use rustc_hash::FxHashMap;

use super::opcodes::{self, Terminator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub start: u32,
    pub end: u32,
    pub terminator: Terminator,
    /// Successor block ids in canonical order (§4.1: successor[0] is taken /
    /// default, successor[1] is fall-through / first case, ...).
    pub successors: Vec<BlockId>,
}

#[derive(Debug, Clone, Copy)]
pub struct ExceptionHandler {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
    /// 0 means "catch all" (`finally`).
    pub catch_type: u16,
}

#[derive(Debug)]
pub struct Cfg {
    blocks: Vec<Block>,
    /// Byte offset -> block id, for every offset that begins a block.
    offset_to_block: FxHashMap<u32, BlockId>,
    pub handlers: Vec<ExceptionHandler>,
    code_length: u32,
    /// The method's raw bytecode, kept so the output stage can read back
    /// the opcode at any bci a decoded event names.
    code: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum CfgError {
    #[error("bytecode offset {0} is out of range for a {1}-byte method body")]
    OffsetOutOfRange(u32, u32),
    #[error("unknown opcode {0:#x} at offset {1}")]
    UnknownOpcode(u8, u32),
    #[error("truncated instruction at offset {0}")]
    Truncated(u32),
}

impl Cfg {
    /// Every bci referenced by the decode event stream must resolve to
    /// exactly one block (§3 invariant); callers treat `None` as a decode
    /// error rather than panicking.
    pub fn block_containing(&self, bci: u32) -> Option<&Block> {
        self.offset_to_block
            .get(&bci)
            .map(|&BlockId(i)| &self.blocks[i as usize])
            .or_else(|| self.block_spanning(bci))
    }

    fn block_spanning(&self, bci: u32) -> Option<&Block> {
        // Binary search since blocks are stored in increasing start order.
        let idx = self.blocks.partition_point(|b| b.start <= bci);
        if idx == 0 {
            return None;
        }
        let block = &self.blocks[idx - 1];
        if block.start <= bci && bci < block.end {
            Some(block)
        } else {
            None
        }
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The opcodes making up `block`, in program order, for the output
    /// stage (§4.9, §6 "one bytecode per line"). A block's body never
    /// contains an internal branch target by construction, so a single
    /// forward scan from its start to its end is always exactly one
    /// instruction stream.
    pub fn block_opcodes(&self, block: &Block) -> Vec<u8> {
        let mut out = Vec::new();
        let mut offset = block.start;
        while offset < block.end {
            let opcode = self.code[offset as usize];
            out.push(opcode);
            let (_, len, _) = decode_one(&self.code, offset).expect("block body re-decodes cleanly");
            offset += len;
        }
        out
    }

    pub fn handler_for(&self, pc: u32, thrown_type_matches: impl Fn(u16) -> bool) -> Option<&ExceptionHandler> {
        self.handlers
            .iter()
            .find(|h| h.start_pc <= pc && pc < h.end_pc && (h.catch_type == 0 || thrown_type_matches(h.catch_type)))
    }

    /// Shortest successor-edge path from `from` to `to`, inclusive of both
    /// ends (§4.9 "BFS-with-preference routine to connect successive
    /// blocks"). Ties are broken by block id order, which is insertion
    /// (and so textual/offset) order, matching "preferring the successor
    /// that minimizes the recorded visit order".
    pub fn bfs_path(&self, from: BlockId, to: BlockId) -> Option<Vec<BlockId>> {
        use std::collections::VecDeque;
        if from.0 == to.0 {
            return Some(vec![from]);
        }
        let mut prev: Vec<Option<BlockId>> = vec![None; self.blocks.len()];
        let mut visited = vec![false; self.blocks.len()];
        let mut queue = VecDeque::new();
        visited[from.0 as usize] = true;
        queue.push_back(from);
        while let Some(cur) = queue.pop_front() {
            for &succ in &self.block(cur).successors {
                if visited[succ.0 as usize] {
                    continue;
                }
                visited[succ.0 as usize] = true;
                prev[succ.0 as usize] = Some(cur);
                if succ.0 == to.0 {
                    let mut path = vec![succ];
                    let mut c = succ;
                    while let Some(p) = prev[c.0 as usize] {
                        path.push(p);
                        c = p;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(succ);
            }
        }
        None
    }

    /// Fallback target for `bfs_path` when no path to a specific block
    /// exists: any block this method can reach that terminates the method
    /// (§4.9 "falling back to any path reaching a return block").
    pub fn nearest_return_block(&self, from: BlockId) -> Option<Vec<BlockId>> {
        use std::collections::VecDeque;
        let mut prev: Vec<Option<BlockId>> = vec![None; self.blocks.len()];
        let mut visited = vec![false; self.blocks.len()];
        let mut queue = VecDeque::new();
        visited[from.0 as usize] = true;
        queue.push_back(from);
        if self.is_return_block(from) {
            return Some(vec![from]);
        }
        while let Some(cur) = queue.pop_front() {
            for &succ in &self.block(cur).successors {
                if visited[succ.0 as usize] {
                    continue;
                }
                visited[succ.0 as usize] = true;
                prev[succ.0 as usize] = Some(cur);
                if self.is_return_block(succ) {
                    let mut path = vec![succ];
                    let mut c = succ;
                    while let Some(p) = prev[c.0 as usize] {
                        path.push(p);
                        c = p;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(succ);
            }
        }
        None
    }

    pub fn is_return_block(&self, id: BlockId) -> bool {
        matches!(self.block(id).terminator, Terminator::Return | Terminator::Athrow)
    }

    pub fn build(code: &[u8], handlers: Vec<ExceptionHandler>) -> Result<Cfg, CfgError> {
        let code_length = code.len() as u32;
        let mut starts: Vec<u32> = vec![0];
        let mut offset = 0u32;

        // Pass 1: collect block starts.
        while offset < code_length {
            let (opcode, len, term) = decode_one(code, offset)?;
            match &term {
                Terminator::Goto { target } => starts.push(*target),
                Terminator::Branch { taken, fall_through } => {
                    starts.push(*taken);
                    starts.push(*fall_through);
                }
                Terminator::Switch { default, cases } => {
                    starts.push(*default);
                    for (_, target) in cases {
                        starts.push(*target);
                    }
                }
                Terminator::Jsr { .. } | Terminator::Ret | Terminator::Athrow | Terminator::Return => {}
                Terminator::None => {}
            }
            if matches!(
                term,
                Terminator::Goto { .. }
                    | Terminator::Branch { .. }
                    | Terminator::Switch { .. }
                    | Terminator::Jsr { .. }
                    | Terminator::Ret
                    | Terminator::Athrow
                    | Terminator::Return
            ) && offset + len < code_length
            {
                starts.push(offset + len);
            }
            if opcodes::is_invoke(opcode) || opcode == opcodes::JSR || opcode == opcodes::JSR_W || opcode == opcodes::RET {
                if offset + len < code_length {
                    starts.push(offset + len);
                }
            }
            offset += len;
        }
        for h in &handlers {
            starts.push(h.handler_pc);
        }
        starts.sort_unstable();
        starts.dedup();

        // Pass 2: materialize blocks, compute each one's terminator and
        // successors in canonical order.
        let mut offset_to_block = FxHashMap::default();
        let mut blocks = Vec::with_capacity(starts.len());
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(code_length);
            offset_to_block.insert(start, BlockId(i as u32));
            blocks.push(Block {
                id: BlockId(i as u32),
                start,
                end,
                terminator: Terminator::None,
                successors: Vec::new(),
            });
        }

        for i in 0..blocks.len() {
            let start = blocks[i].start;
            let end = blocks[i].end;
            let term = terminator_of_block(code, start, end)?;
            let successors = successors_of(&term, end, code_length, &offset_to_block);
            blocks[i].terminator = term;
            blocks[i].successors = successors;
        }

        Ok(Cfg {
            blocks,
            offset_to_block,
            handlers,
            code_length,
        })
    }
}

fn successors_of(
    term: &Terminator,
    block_end: u32,
    code_length: u32,
    map: &FxHashMap<u32, BlockId>,
) -> Vec<BlockId> {
    let lookup = |off: u32| -> Option<BlockId> { map.get(&off).copied() };
    match term {
        Terminator::None => {
            if block_end < code_length {
                lookup(block_end).into_iter().collect()
            } else {
                Vec::new()
            }
        }
        Terminator::Goto { target } => lookup(*target).into_iter().collect(),
        Terminator::Branch { taken, fall_through } => {
            [lookup(*taken), lookup(*fall_through)].into_iter().flatten().collect()
        }
        Terminator::Switch { default, cases } => {
            let mut v = Vec::with_capacity(cases.len() + 1);
            v.extend(lookup(*default));
            for (_, target) in cases {
                if let Some(id) = lookup(*target) {
                    v.push(id);
                }
            }
            v
        }
        // jsr/ret terminate the block but do not add a successor at CFG
        // build time; the target is resolved at event-consumption time.
        Terminator::Jsr { .. } | Terminator::Ret | Terminator::Athrow | Terminator::Return => Vec::new(),
    }
}

/// Returns the terminator for the instruction that ends at `block_end`
/// within `[start, block_end)`. A block's terminator is determined by its
/// *last* instruction, found by walking forward from `start` (blocks have
/// no internal branches by construction).
fn terminator_of_block(code: &[u8], start: u32, block_end: u32) -> Result<Terminator, CfgError> {
    let mut offset = start;
    loop {
        let (_, len, term) = decode_one(code, offset)?;
        if offset + len >= block_end {
            return Ok(term);
        }
        offset += len;
    }
}

/// Decodes one instruction at `offset`, returning (opcode, length-including-wide-prefix, terminator).
fn decode_one(code: &[u8], offset: u32) -> Result<(u8, u32, Terminator), CfgError> {
    let code_length = code.len() as u32;
    if offset >= code_length {
        return Err(CfgError::OffsetOutOfRange(offset, code_length));
    }
    let opcode = code[offset as usize];

    if opcode == opcodes::WIDE {
        // `wide` modifies the following instruction's operand width; for
        // control flow purposes only `wide iinc` (6-byte total) matters,
        // everything else widened is a non-branching load/store/iinc.
        let next = *code.get(offset as usize + 1).ok_or(CfgError::Truncated(offset))?;
        let len = if next == 132 { 6 } else { 4 };
        return Ok((opcode, len, Terminator::None));
    }

    if opcode == opcodes::TABLESWITCH || opcode == opcodes::LOOKUPSWITCH {
        return decode_switch(code, offset, opcode);
    }

    let len = opcodes::fixed_length(opcode).ok_or(CfgError::UnknownOpcode(opcode, offset))?;
    if offset + len > code_length {
        return Err(CfgError::Truncated(offset));
    }

    let term = if opcodes::is_two_way_branch(opcode) {
        let disp = read_i16(code, offset + 1)?;
        Terminator::Branch {
            taken: (offset as i64 + disp as i64) as u32,
            fall_through: offset + len,
        }
    } else if opcode == opcodes::GOTO {
        let disp = read_i16(code, offset + 1)?;
        Terminator::Goto { target: (offset as i64 + disp as i64) as u32 }
    } else if opcode == opcodes::GOTO_W {
        let disp = read_i32(code, offset + 1)?;
        Terminator::Goto { target: (offset as i64 + disp as i64) as u32 }
    } else if opcode == opcodes::JSR {
        let disp = read_i16(code, offset + 1)?;
        Terminator::Jsr { target: (offset as i64 + disp as i64) as u32 }
    } else if opcode == opcodes::JSR_W {
        let disp = read_i32(code, offset + 1)?;
        Terminator::Jsr { target: (offset as i64 + disp as i64) as u32 }
    } else if opcode == opcodes::RET {
        Terminator::Ret
    } else if opcode == opcodes::ATHROW {
        Terminator::Athrow
    } else if opcodes::is_return(opcode) {
        Terminator::Return
    } else {
        Terminator::None
    };

    Ok((opcode, len, term))
}

fn decode_switch(code: &[u8], offset: u32, opcode: u8) -> Result<(u8, u32, Terminator), CfgError> {
    let pad = opcodes::switch_padding(offset + 1);
    let mut p = offset + 1 + pad;
    let default_disp = read_i32(code, p)?;
    p += 4;
    if opcode == opcodes::TABLESWITCH {
        let low = read_i32(code, p)?;
        p += 4;
        let high = read_i32(code, p)?;
        p += 4;
        let mut cases = Vec::with_capacity((high - low + 1).max(0) as usize);
        for key in low..=high {
            let disp = read_i32(code, p)?;
            p += 4;
            cases.push((key, (offset as i64 + disp as i64) as u32));
        }
        let term = Terminator::Switch {
            default: (offset as i64 + default_disp as i64) as u32,
            cases,
        };
        Ok((opcode, p - offset, term))
    } else {
        let npairs = read_i32(code, p)?;
        p += 4;
        let mut cases = Vec::with_capacity(npairs.max(0) as usize);
        for _ in 0..npairs {
            let key = read_i32(code, p)?;
            let disp = read_i32(code, p + 4)?;
            p += 8;
            cases.push((key, (offset as i64 + disp as i64) as u32));
        }
        let term = Terminator::Switch {
            default: (offset as i64 + default_disp as i64) as u32,
            cases,
        };
        Ok((opcode, p - offset, term))
    }
}

fn read_i16(code: &[u8], at: u32) -> Result<i16, CfgError> {
    let b = code.get(at as usize..at as usize + 2).ok_or(CfgError::Truncated(at))?;
    Ok(i16::from_be_bytes([b[0], b[1]]))
}

fn read_i32(code: &[u8], at: u32) -> Result<i32, CfgError> {
    let b = code.get(at as usize..at as usize + 4).ok_or(CfgError::Truncated(at))?;
    Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_line_body_is_one_block_with_no_successors() {
        // iconst_0(3) istore_1(59) return(177)
        let code = [3u8, 59, 177];
        let cfg = Cfg::build(&code, vec![]).unwrap();
        assert_eq!(cfg.blocks().len(), 1);
        let b = cfg.block(cfg.entry());
        assert_eq!(b.start, 0);
        assert_eq!(b.end, 3);
        assert!(b.successors.is_empty());
    }

    #[test]
    fn goto_has_single_successor_at_target() {
        // nop(0) goto +3 (167, 0, 3) -> target = offset(1) + 3 = 4; nop(4) return(177)
        let code = [0u8, 167, 0, 3, 0, 177];
        let cfg = Cfg::build(&code, vec![]).unwrap();
        let first = cfg.block(cfg.entry());
        assert_eq!(first.successors.len(), 1);
        let target_block = cfg.block(first.successors[0]);
        assert_eq!(target_block.start, 4);
    }

    #[test]
    fn tableswitch_successors_are_default_then_cases_in_order() {
        // tableswitch at offset 0: opcode(1) + pad(3) + default(4) + low(4) + high(4) + 2 case offsets(8)
        // low=0, high=1, default-> +20, case0 -> +24, case1 -> +28
        let mut code = vec![opcodes::TABLESWITCH, 0, 0, 0];
        code.extend_from_slice(&20i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&24i32.to_be_bytes());
        code.extend_from_slice(&28i32.to_be_bytes());
        // pad code out so offsets 20,24,28 exist
        while code.len() < 32 {
            code.push(177); // return
        }
        let cfg = Cfg::build(&code, vec![]).unwrap();
        let first = cfg.block(cfg.entry());
        assert_eq!(first.successors.len(), 3);
        assert_eq!(cfg.block(first.successors[0]).start, 20); // default
        assert_eq!(cfg.block(first.successors[1]).start, 24); // case 0
        assert_eq!(cfg.block(first.successors[2]).start, 28); // case 1
    }
}
