//! Generic `perf_event_header`-prefixed record parsing (decoder spec §6),
//! enough to pull the `cpu`/`tid`/`time` sample-id trailer fields out of an
//! arbitrary sideband record and to recognize `PERF_RECORD_AUX`.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

pub const PERF_RECORD_AUX: u32 = 11;
pub const PERF_AUX_FLAG_TRUNCATED: u64 = 0x01;

/// Bit positions within `sample_type`, in the fixed order the kernel lays
/// out the optional `sample_id` trailer (§6): TID, TIME, ID, STREAM_ID,
/// CPU, IDENTIFIER, each present as 8 bytes (TID is really two packed u32s,
/// still 8 bytes) when its bit is set.
const PERF_SAMPLE_TID: u64 = 1 << 1;
const PERF_SAMPLE_TIME: u64 = 1 << 2;
const PERF_SAMPLE_ID: u64 = 1 << 6;
const PERF_SAMPLE_STREAM_ID: u64 = 1 << 9;
const PERF_SAMPLE_CPU: u64 = 1 << 11;
const PERF_SAMPLE_IDENTIFIER: u64 = 1 << 17;

#[derive(Debug, Error)]
pub enum PerfEventError {
    #[error("truncated perf_event_header at offset {0}")]
    TruncatedHeader(usize),
    #[error("perf_event_header declares size {0} but only {1} bytes remain")]
    TruncatedRecord(u16, usize),
    #[error("sideband record at offset {0} has no cpu field in its sample_id (sample_type {1:#x})")]
    MissingCpuField(usize, u64),
}

#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub record_type: u32,
    pub misc: u16,
    pub size: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SampleId {
    pub tid: Option<u32>,
    pub time: Option<u64>,
    pub cpu: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct ParsedRecord {
    pub header: RecordHeader,
    pub sample: SampleId,
    /// Only meaningful when `header.record_type == PERF_RECORD_AUX`.
    pub aux_truncated: bool,
    pub record_len: usize,
}

/// Reads one `perf_event_header`-prefixed record starting at `buf[0]`.
/// `sample_type` determines which fields are present in the trailing
/// `sample_id` structure every sideband record carries.
pub fn parse_record(buf: &[u8], sample_type: u64) -> Result<ParsedRecord, PerfEventError> {
    if buf.len() < 8 {
        return Err(PerfEventError::TruncatedHeader(0));
    }
    let record_type = LittleEndian::read_u32(&buf[0..4]);
    let misc = LittleEndian::read_u16(&buf[4..6]);
    let size = LittleEndian::read_u16(&buf[6..8]);
    if (size as usize) > buf.len() {
        return Err(PerfEventError::TruncatedRecord(size, buf.len()));
    }
    let record = &buf[..size as usize];

    let aux_truncated = if record_type == PERF_RECORD_AUX {
        // AUXTRACE payload: aux_offset(u64) aux_size(u64) flags(u64) [+ sample_id trailer]
        if record.len() < 8 + 24 {
            return Err(PerfEventError::TruncatedRecord(size, record.len()));
        }
        let flags = LittleEndian::read_u64(&record[8 + 16..8 + 24]);
        flags & PERF_AUX_FLAG_TRUNCATED != 0
    } else {
        false
    };

    let sample = parse_sample_id_trailer(record, sample_type)?;

    Ok(ParsedRecord { header: RecordHeader { record_type, misc, size }, sample, aux_truncated, record_len: size as usize })
}

/// The `sample_id` trailer is the last N*8 bytes of the record, where N is
/// the number of set bits among the six fields the decoder cares about, in
/// their fixed kernel order.
fn parse_sample_id_trailer(record: &[u8], sample_type: u64) -> Result<SampleId, PerfEventError> {
    let fields = [
        (PERF_SAMPLE_TID, true),
        (PERF_SAMPLE_TIME, false),
        (PERF_SAMPLE_ID, false),
        (PERF_SAMPLE_STREAM_ID, false),
        (PERF_SAMPLE_CPU, false),
        (PERF_SAMPLE_IDENTIFIER, false),
    ];
    let present: Vec<bool> = fields.iter().map(|&(bit, _)| sample_type & bit != 0).collect();
    let trailer_len = present.iter().filter(|&&p| p).count() * 8;
    if trailer_len > record.len() {
        return Err(PerfEventError::TruncatedRecord(record.len() as u16, record.len()));
    }
    let trailer = &record[record.len() - trailer_len..];

    let mut offset = 0usize;
    let mut sample = SampleId::default();
    if present[0] {
        // PERF_SAMPLE_TID packs (pid: u32, tid: u32).
        sample.tid = Some(LittleEndian::read_u32(&trailer[offset + 4..offset + 8]));
        offset += 8;
    }
    if present[1] {
        sample.time = Some(LittleEndian::read_u64(&trailer[offset..offset + 8]));
        offset += 8;
    }
    if present[2] {
        offset += 8; // id, unused
    }
    if present[3] {
        offset += 8; // stream_id, unused
    }
    if present[4] {
        // PERF_SAMPLE_CPU packs (cpu: u32, res: u32).
        sample.cpu = Some(LittleEndian::read_u32(&trailer[offset..offset + 4]));
        offset += 8;
    }
    if present[5] {
        offset += 8; // identifier, unused
    }

    if sample_type & PERF_SAMPLE_CPU == 0 {
        // §4.6: "a sideband record without the required cpu field is fatal".
        return Err(PerfEventError::MissingCpuField(0, sample_type));
    }

    Ok(sample)
}
