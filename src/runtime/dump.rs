//! JVM runtime dump stream (decoder spec §6).
//!
//! Frame layout: `{u32 type, u32 size, u64 time}` followed by a
//! type-specific payload, exactly mirroring the original JVM's
//! `JVMRuntime::DumpInfo` + `JVMRuntime::*Info` structs. `size` is the byte
//! length of the payload that follows the 16-byte frame header, so a
//! cursor that cannot parse a known type can still skip to the next frame.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::jit::PcDescriptor;
use crate::runtime::method::MethodId;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("truncated dump frame at offset {0}")]
    Truncated(u64),
    #[error("unknown dump frame type {0} at offset {1}")]
    UnknownType(u32, u64),
    #[error("codelet_info installed twice with differing payloads")]
    CodeletTableMismatch,
}

#[derive(Debug, Clone)]
pub struct MethodEntryInitial {
    pub idx: MethodId,
    pub tid: u32,
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
}

#[derive(Debug, Clone, Copy)]
pub struct MethodEntryOrExit {
    pub idx: MethodId,
    pub tid: u32,
}

#[derive(Debug, Clone)]
pub struct CompiledMethodLoad {
    pub code_begin: u64,
    pub entry_point: u64,
    pub verified_entry_point: u64,
    pub osr_entry_point: u64,
    pub code_size: u32,
    pub code: Vec<u8>,
    pub inline_methods: Vec<(u32, InlineMethodInfo)>,
    pub pc_descriptors: Vec<PcDescriptor>,
}

#[derive(Debug, Clone)]
pub struct InlineMethodInfo {
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CompiledMethodUnload {
    pub code_begin: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ThreadStart {
    pub java_tid: u32,
    pub sys_tid: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct InlineCacheAdd {
    pub src: u64,
    pub dest: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct InlineCacheClear {
    pub src: u64,
}

#[derive(Debug, Clone)]
pub enum DumpFrame {
    CodeletInfo(Vec<u8>),
    MethodEntryInitial(MethodEntryInitial),
    MethodEntry(MethodEntryOrExit),
    MethodExit(MethodEntryOrExit),
    CompiledMethodLoad(CompiledMethodLoad),
    CompiledMethodUnload(CompiledMethodUnload),
    ThreadStart(ThreadStart),
    InlineCacheAdd(InlineCacheAdd),
    InlineCacheClear(InlineCacheClear),
}

const TYPE_METHOD_ENTRY_INITIAL: u32 = 0;
const TYPE_METHOD_ENTRY: u32 = 1;
const TYPE_METHOD_EXIT: u32 = 2;
const TYPE_COMPILED_METHOD_LOAD: u32 = 3;
const TYPE_COMPILED_METHOD_UNLOAD: u32 = 4;
const TYPE_THREAD_START: u32 = 5;
const TYPE_CODELET_INFO: u32 = 6;
const TYPE_INLINE_CACHE_ADD: u32 = 7;
const TYPE_INLINE_CACHE_CLEAR: u32 = 8;

/// Sequential reader over the dump byte stream. Produces `(time, DumpFrame)`
/// pairs in file order; §4.3's `advance_to(t)` consumes from this cursor
/// until the next frame's time would exceed `t`.
pub struct DumpReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DumpReader<'a> {
    pub fn new(data: &'a [u8]) -> DumpReader<'a> {
        DumpReader { data, pos: 0 }
    }

    pub fn peek_time(&self) -> Option<u64> {
        if self.pos + 16 > self.data.len() {
            return None;
        }
        Some(LittleEndian::read_u64(&self.data[self.pos + 8..self.pos + 16]))
    }

    pub fn next(&mut self) -> Result<Option<(u64, DumpFrame)>, DumpError> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        if self.pos + 16 > self.data.len() {
            return Err(DumpError::Truncated(self.pos as u64));
        }
        let frame_start = self.pos as u64;
        let ty = LittleEndian::read_u32(&self.data[self.pos..self.pos + 4]);
        let size = LittleEndian::read_u32(&self.data[self.pos + 4..self.pos + 8]) as usize;
        let time = LittleEndian::read_u64(&self.data[self.pos + 8..self.pos + 16]);
        let payload_start = self.pos + 16;
        let payload_end = payload_start
            .checked_add(size)
            .filter(|&end| end <= self.data.len())
            .ok_or(DumpError::Truncated(frame_start))?;
        let payload = &self.data[payload_start..payload_end];
        self.pos = payload_end;

        let frame = match ty {
            TYPE_CODELET_INFO => DumpFrame::CodeletInfo(payload.to_vec()),
            TYPE_METHOD_ENTRY_INITIAL => DumpFrame::MethodEntryInitial(parse_method_entry_initial(payload, frame_start)?),
            TYPE_METHOD_ENTRY => DumpFrame::MethodEntry(parse_entry_exit(payload, frame_start)?),
            TYPE_METHOD_EXIT => DumpFrame::MethodExit(parse_entry_exit(payload, frame_start)?),
            TYPE_COMPILED_METHOD_LOAD => DumpFrame::CompiledMethodLoad(parse_compiled_method_load(payload, frame_start)?),
            TYPE_COMPILED_METHOD_UNLOAD => DumpFrame::CompiledMethodUnload(CompiledMethodUnload {
                code_begin: read_u64(payload, 0, frame_start)?,
            }),
            TYPE_THREAD_START => DumpFrame::ThreadStart(ThreadStart {
                java_tid: read_u32(payload, 0, frame_start)?,
                sys_tid: read_u32(payload, 4, frame_start)?,
            }),
            TYPE_INLINE_CACHE_ADD => DumpFrame::InlineCacheAdd(InlineCacheAdd {
                src: read_u64(payload, 0, frame_start)?,
                dest: read_u64(payload, 8, frame_start)?,
            }),
            TYPE_INLINE_CACHE_CLEAR => DumpFrame::InlineCacheClear(InlineCacheClear {
                src: read_u64(payload, 0, frame_start)?,
            }),
            other => return Err(DumpError::UnknownType(other, frame_start)),
        };
        Ok(Some((time, frame)))
    }
}

fn read_u32(buf: &[u8], at: usize, frame_start: u64) -> Result<u32, DumpError> {
    buf.get(at..at + 4)
        .map(LittleEndian::read_u32)
        .ok_or(DumpError::Truncated(frame_start))
}

fn read_u64(buf: &[u8], at: usize, frame_start: u64) -> Result<u64, DumpError> {
    buf.get(at..at + 8)
        .map(LittleEndian::read_u64)
        .ok_or(DumpError::Truncated(frame_start))
}

fn read_str(buf: &[u8], at: usize, len: usize, frame_start: u64) -> Result<(String, usize), DumpError> {
    let bytes = buf.get(at..at + len).ok_or(DumpError::Truncated(frame_start))?;
    Ok((String::from_utf8_lossy(bytes).into_owned(), at + len))
}

fn parse_method_entry_initial(buf: &[u8], frame_start: u64) -> Result<MethodEntryInitial, DumpError> {
    let idx = read_u32(buf, 0, frame_start)?;
    let klass_len = read_u32(buf, 4, frame_start)? as usize;
    let method_len = read_u32(buf, 8, frame_start)? as usize;
    let sig_len = read_u32(buf, 12, frame_start)? as usize;
    let tid = read_u32(buf, 16, frame_start)?;
    // buf[20..24] is the original struct's `_pending` padding field.
    let mut at = 24;
    let (class_name, next) = read_str(buf, at, klass_len, frame_start)?;
    at = next;
    let (method_name, next) = read_str(buf, at, method_len, frame_start)?;
    at = next;
    let (signature, _next) = read_str(buf, at, sig_len, frame_start)?;
    Ok(MethodEntryInitial {
        idx: MethodId(idx),
        tid,
        class_name,
        method_name,
        signature,
    })
}

fn parse_entry_exit(buf: &[u8], frame_start: u64) -> Result<MethodEntryOrExit, DumpError> {
    Ok(MethodEntryOrExit {
        idx: MethodId(read_u32(buf, 0, frame_start)?),
        tid: read_u32(buf, 4, frame_start)?,
    })
}

fn parse_compiled_method_load(buf: &[u8], frame_start: u64) -> Result<CompiledMethodLoad, DumpError> {
    let code_begin = read_u64(buf, 0, frame_start)?;
    let entry_point = read_u64(buf, 8, frame_start)?;
    let verified_entry_point = read_u64(buf, 16, frame_start)?;
    let osr_entry_point = read_u64(buf, 24, frame_start)?;
    let inline_method_cnt = read_u32(buf, 32, frame_start)?;
    let code_size = read_u32(buf, 36, frame_start)?;
    let scopes_pc_size = read_u32(buf, 40, frame_start)? as usize;
    let scopes_data_size = read_u32(buf, 44, frame_start)? as usize;

    let mut at = 48usize;
    let mut inline_methods = Vec::with_capacity(inline_method_cnt as usize);
    for _ in 0..inline_method_cnt {
        let klass_len = read_u32(buf, at, frame_start)? as usize;
        let method_len = read_u32(buf, at + 4, frame_start)? as usize;
        let sig_len = read_u32(buf, at + 8, frame_start)? as usize;
        let method_index = read_u32(buf, at + 12, frame_start)?;
        at += 16;
        let (class_name, next) = read_str(buf, at, klass_len, frame_start)?;
        at = next;
        let (method_name, next) = read_str(buf, at, method_len, frame_start)?;
        at = next;
        let (signature, next) = read_str(buf, at, sig_len, frame_start)?;
        at = next;
        inline_methods.push((method_index, InlineMethodInfo { class_name, method_name, signature }));
    }

    let code = buf.get(at..at + code_size as usize).ok_or(DumpError::Truncated(frame_start))?.to_vec();
    at += code_size as usize;

    let scopes_pc = buf.get(at..at + scopes_pc_size).ok_or(DumpError::Truncated(frame_start))?;
    at += scopes_pc_size;
    let scopes_data = buf.get(at..at + scopes_data_size).ok_or(DumpError::Truncated(frame_start))?;

    let pc_descriptors = parse_scopes(scopes_pc, scopes_data, code_begin, frame_start)?;

    Ok(CompiledMethodLoad {
        code_begin,
        entry_point,
        verified_entry_point,
        osr_entry_point,
        code_size,
        code,
        inline_methods,
        pc_descriptors,
    })
}

/// Decodes the scopes-pc / scopes-data tables into an ascending-by-pc list
/// of `PcDescriptor`s. `scopes_pc` is a flat array of `(pc_offset: u64,
/// scopes_data_offset: u32)` records; each offset into `scopes_data` begins
/// a `(numstackframes: u32, [(method_index: u32, bci: u32); numstackframes])`
/// record, outermost caller first.
fn parse_scopes(scopes_pc: &[u8], scopes_data: &[u8], code_begin: u64, frame_start: u64) -> Result<Vec<PcDescriptor>, DumpError> {
    const PC_RECORD_SIZE: usize = 12;
    let n = scopes_pc.len() / PC_RECORD_SIZE;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let rec = &scopes_pc[i * PC_RECORD_SIZE..(i + 1) * PC_RECORD_SIZE];
        let pc_offset = LittleEndian::read_u64(&rec[0..8]);
        let data_offset = LittleEndian::read_u32(&rec[8..12]) as usize;

        let numstackframes = read_u32(scopes_data, data_offset, frame_start)? as usize;
        let mut stack = Vec::with_capacity(numstackframes);
        let mut at = data_offset + 4;
        for _ in 0..numstackframes {
            let method_index = read_u32(scopes_data, at, frame_start)?;
            let bci = read_u32(scopes_data, at + 4, frame_start)?;
            stack.push((method_index, bci));
            at += 8;
        }
        out.push(PcDescriptor { pc: code_begin + pc_offset, stack });
    }
    out.sort_by_key(|d| d.pc);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ty: u32, time: u64, payload: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&ty.to_le_bytes());
        v.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        v.extend_from_slice(&time.to_le_bytes());
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn thread_start_frame_round_trips() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&42u32.to_le_bytes());
        payload.extend_from_slice(&7u32.to_le_bytes());
        let data = frame(TYPE_THREAD_START, 1000, &payload);
        let mut reader = DumpReader::new(&data);
        let (time, frame) = reader.next().unwrap().unwrap();
        assert_eq!(time, 1000);
        match frame {
            DumpFrame::ThreadStart(ts) => {
                assert_eq!(ts.java_tid, 42);
                assert_eq!(ts.sys_tid, 7);
            }
            _ => panic!("wrong frame kind"),
        }
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let data = vec![0u8; 10];
        let mut reader = DumpReader::new(&data);
        assert!(reader.next().is_err());
    }
}
