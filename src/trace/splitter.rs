//! Trace Splitter.
//!
//! Parses the container format that wraps PT, sideband, and JVM runtime
//! dump data in one file, then re-splits each CPU's PT stream at PSB
//! boundaries into work items small enough to parallelize over. Grounded
//! on `TraceDataParser::parse`/`resplit_pt_data` (`trace_data_parser.cpp`):
//! the container uses two custom `perf_event_header` record types,
//! `AUXTRACE` (71) wrapping a PT byte range) and `JVMRUNTIME` (72) wrapping
//! a dump byte range; every other record is ordinary perf sideband, routed
//! by the `cpu` field its `sample_id` trailer carries.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::pt::query::{PtQuery, QueryError};
use crate::sideband::perf_event::{parse_record, PerfEventError};
use crate::trace::header::{HeaderError, TraceHeader};
use crate::trace::workitem::WorkItem;

const PERF_RECORD_AUXTRACE: u32 = 71;
const PERF_RECORD_JVMRUNTIME: u32 = 72;

pub const DEFAULT_SPLIT_NUMBER: usize = 500;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("trace header error: {0}")]
    Header(#[from] HeaderError),
    #[error("sideband record error: {0}")]
    Record(#[from] PerfEventError),
    #[error("pt query error while splitting: {0}")]
    Query(#[from] QueryError),
    #[error("truncated record at offset {0}")]
    Truncated(usize),
}

#[derive(Debug, Clone, Copy)]
struct Extent {
    start: u64,
    end: u64,
}

pub struct TraceFile {
    pub header: TraceHeader,
    pt_offsets: FxHashMap<u32, Vec<Extent>>,
    sideband_offsets: FxHashMap<u32, Vec<Extent>>,
    jvm_runtime_offsets: Vec<Extent>,
}

impl TraceFile {
    pub fn parse(data: &[u8]) -> Result<TraceFile, SplitError> {
        let header = TraceHeader::parse(data)?;
        let mut pt_offsets: FxHashMap<u32, Vec<Extent>> = FxHashMap::default();
        let mut sideband_offsets: FxHashMap<u32, Vec<Extent>> = FxHashMap::default();
        let mut jvm_runtime_offsets = Vec::new();

        let mut pos = header.header_size as usize;
        while pos + 8 <= data.len() {
            let record_type = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
            let size = u16::from_le_bytes(data[pos + 6..pos + 8].try_into().unwrap()) as usize;

            if record_type == PERF_RECORD_AUXTRACE {
                let aux = data.get(pos + 8..pos + 8 + 40).ok_or(SplitError::Truncated(pos))?;
                let aux_size = u64::from_le_bytes(aux[0..8].try_into().unwrap());
                let cpu = u32::from_le_bytes(aux[32..36].try_into().unwrap());
                let pt_begin = (pos + 8 + 40) as u64;
                let pt_end = pt_begin + aux_size;
                if pt_end as usize > data.len() {
                    return Err(SplitError::Truncated(pos));
                }
                pt_offsets.entry(cpu).or_default().push(Extent { start: pt_begin, end: pt_end });
                pos = pt_end as usize;
            } else if record_type == PERF_RECORD_JVMRUNTIME {
                let size_field = data.get(pos + 8..pos + 16).ok_or(SplitError::Truncated(pos))?;
                let jvm_size = u64::from_le_bytes(size_field.try_into().unwrap());
                let jvm_begin = (pos + 16) as u64;
                let jvm_end = jvm_begin + jvm_size;
                if jvm_end as usize > data.len() {
                    return Err(SplitError::Truncated(pos));
                }
                jvm_runtime_offsets.push(Extent { start: jvm_begin, end: jvm_end });
                pos = jvm_end as usize;
            } else {
                let record = data.get(pos..pos + size).ok_or(SplitError::Truncated(pos))?;
                let parsed = parse_record(record, header.sample_type)?;
                let cpu = parsed.sample.cpu.ok_or(SplitError::Truncated(pos))?;
                sideband_offsets
                    .entry(cpu)
                    .or_default()
                    .push(Extent { start: pos as u64, end: (pos + size) as u64 });
                pos += size;
            }
        }

        Ok(TraceFile { header, pt_offsets, sideband_offsets, jvm_runtime_offsets })
    }

    fn gather(data: &[u8], extents: &[Extent]) -> Vec<u8> {
        let mut out = Vec::new();
        for e in extents {
            out.extend_from_slice(&data[e.start as usize..e.end as usize]);
        }
        out
    }

    pub fn cpus(&self) -> Vec<u32> {
        self.pt_offsets.keys().copied().collect()
    }

    pub fn sideband_data(&self, data: &[u8], cpu: u32) -> Vec<u8> {
        self.sideband_offsets.get(&cpu).map(|e| Self::gather(data, e)).unwrap_or_default()
    }

    pub fn jvm_runtime_data(&self, data: &[u8]) -> Vec<u8> {
        Self::gather(data, &self.jvm_runtime_offsets)
    }

    pub fn pt_data(&self, data: &[u8], cpu: u32) -> Vec<u8> {
        self.pt_offsets.get(&cpu).map(|e| Self::gather(data, e)).unwrap_or_default()
    }

    /// Splits every CPU's PT stream into work items of `split_number`
    /// consecutive PSBs each (the last item of each CPU's stream has no
    /// upper time bound).
    pub fn split_pt(&self, data: &[u8], split_number: usize) -> Result<Vec<WorkItem>, SplitError> {
        let mut items = Vec::new();
        for cpu in self.cpus() {
            let buffer = self.pt_data(data, cpu);
            items.extend(split_one_cpu(cpu, &buffer, split_number)?);
        }
        Ok(items)
    }
}

fn split_one_cpu(cpu: u32, buffer: &[u8], split_number: usize) -> Result<Vec<WorkItem>, SplitError> {
    let mut items = Vec::new();
    let mut query = PtQuery::new(buffer);
    let mut count = 0usize;
    let mut begin_time = 0u64;
    let mut begin_offset = 0usize;

    loop {
        match query.sync_forward() {
            Ok(()) => {}
            Err(QueryError::Eos) => break,
            Err(e) => return Err(e.into()),
        }
        count += 1;
        if count >= split_number {
            let end_time = query.time();
            let end_offset = query.position();
            items.push(WorkItem {
                cpu,
                start_time: begin_time,
                end_time,
                pt_data: buffer[begin_offset..end_offset].to_vec(),
            });
            begin_time = end_time;
            begin_offset = end_offset;
            count = 0;
        }
    }

    if begin_offset < buffer.len() || items.is_empty() {
        items.push(WorkItem { cpu, start_time: begin_time, end_time: u64::MAX, pt_data: buffer[begin_offset..].to_vec() });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::header::MINIMUM_HEADER_SIZE;
    use byteorder::{ByteOrder, LittleEndian};

    fn header_bytes() -> Vec<u8> {
        let mut v = vec![0u8; MINIMUM_HEADER_SIZE];
        LittleEndian::write_u64(&mut v[0..8], MINIMUM_HEADER_SIZE as u64);
        LittleEndian::write_u64(&mut v[64..72], 1 << 11); // PERF_SAMPLE_CPU only
        v
    }

    #[test]
    fn parses_an_auxtrace_record_into_a_pt_extent() {
        let mut data = header_bytes();
        let pt_bytes = vec![0xAAu8; 10];
        // perf_event_header: type, misc, size
        data.extend_from_slice(&PERF_RECORD_AUXTRACE.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        // AUXTraceEvent: size, offset, reference, idx, tid, cpu, reserved
        data.extend_from_slice(&(pt_bytes.len() as u64).to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&7u32.to_le_bytes()); // cpu
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&pt_bytes);

        let trace = TraceFile::parse(&data).unwrap();
        assert_eq!(trace.pt_data(&data, 7), pt_bytes);
    }

    fn psb_bytes() -> Vec<u8> {
        let mut v = Vec::new();
        for _ in 0..8 {
            v.push(0x02);
            v.push(0x82);
        }
        v
    }

    /// Concatenating every work item's `pt_data` must reproduce the CPU's
    /// whole PT byte stream exactly, with nothing dropped or duplicated at
    /// a split boundary.
    #[test]
    fn split_one_cpu_preserves_every_byte() {
        let mut buffer = Vec::new();
        for _ in 0..3 {
            buffer.extend_from_slice(&psb_bytes());
            buffer.push(0x02);
            buffer.push(0x23); // PSBEND
        }
        let items = split_one_cpu(0, &buffer, 1).unwrap();
        let mut joined = Vec::new();
        for item in &items {
            joined.extend_from_slice(&item.pt_data);
        }
        assert_eq!(joined, buffer);
    }

    /// With `split_number = 1`, each PSB starts a new work item, so every
    /// item but possibly the last begins exactly at a PSB boundary that
    /// `PtQuery::sync_forward` can resynchronize on independently.
    #[test]
    fn split_one_cpu_splits_at_psb_boundaries() {
        let mut buffer = Vec::new();
        for _ in 0..3 {
            buffer.extend_from_slice(&psb_bytes());
            buffer.push(0x02);
            buffer.push(0x23);
        }
        let items = split_one_cpu(0, &buffer, 1).unwrap();
        assert!(items.len() >= 3);
        for item in &items {
            if item.pt_data.is_empty() {
                continue;
            }
            let mut q = PtQuery::new(&item.pt_data);
            assert!(q.sync_forward().is_ok());
        }
    }
}
