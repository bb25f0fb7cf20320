//! Trace file header (decoder spec §6).
//!
//! Fields are packed tightly in declaration order (no implicit struct
//! padding) at their natural widths. `header_size` is authoritative for
//! where the record stream begins -- we never hardcode the struct's
//! nominal size, so a header grown with trailing fields in a future trace
//! format version still parses.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("trace file is only {0} bytes, shorter than the minimum header")]
    Truncated(usize),
    #[error("header declares header_size {declared}, but the minimum fixed header needs {minimum}")]
    HeaderSizeTooSmall { declared: u64, minimum: u64 },
}

pub const MINIMUM_HEADER_SIZE: usize = 76;

#[derive(Debug, Clone, Copy)]
pub struct TraceHeader {
    pub header_size: u64,
    pub filter: u32,
    pub vendor: u32,
    pub family: u16,
    pub model: u8,
    pub stepping: u8,
    pub nr_cpus: u32,
    pub mtc_freq: u8,
    pub nom_freq: u8,
    pub time_shift: u16,
    pub cpuid_0x15_eax: u32,
    pub cpuid_0x15_ebx: u32,
    pub time_mult: u32,
    pub addr0_a: u64,
    pub addr0_b: u64,
    pub time_zero: u64,
    pub sample_type: u64,
    pub trace_type: u32,
}

impl TraceHeader {
    pub fn parse(buf: &[u8]) -> Result<TraceHeader, HeaderError> {
        if buf.len() < MINIMUM_HEADER_SIZE {
            return Err(HeaderError::Truncated(buf.len()));
        }
        let header_size = LittleEndian::read_u64(&buf[0..8]);
        if (header_size as usize) < MINIMUM_HEADER_SIZE {
            return Err(HeaderError::HeaderSizeTooSmall { declared: header_size, minimum: MINIMUM_HEADER_SIZE as u64 });
        }
        Ok(TraceHeader {
            header_size,
            filter: LittleEndian::read_u32(&buf[8..12]),
            vendor: LittleEndian::read_u32(&buf[12..16]),
            family: LittleEndian::read_u16(&buf[16..18]),
            model: buf[18],
            stepping: buf[19],
            nr_cpus: LittleEndian::read_u32(&buf[20..24]),
            mtc_freq: buf[24],
            nom_freq: buf[25],
            time_shift: LittleEndian::read_u16(&buf[26..28]),
            cpuid_0x15_eax: LittleEndian::read_u32(&buf[28..32]),
            cpuid_0x15_ebx: LittleEndian::read_u32(&buf[32..36]),
            time_mult: LittleEndian::read_u32(&buf[36..40]),
            addr0_a: LittleEndian::read_u64(&buf[40..48]),
            addr0_b: LittleEndian::read_u64(&buf[48..56]),
            time_zero: LittleEndian::read_u64(&buf[56..64]),
            sample_type: LittleEndian::read_u64(&buf[64..72]),
            trace_type: LittleEndian::read_u32(&buf[72..76]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Vec<u8> {
        let mut v = vec![0u8; MINIMUM_HEADER_SIZE];
        LittleEndian::write_u64(&mut v[0..8], MINIMUM_HEADER_SIZE as u64);
        LittleEndian::write_u64(&mut v[64..72], 1 << 11); // PERF_SAMPLE_CPU
        v
    }

    #[test]
    fn parses_minimum_header() {
        let buf = sample_header();
        let header = TraceHeader::parse(&buf).unwrap();
        assert_eq!(header.header_size, MINIMUM_HEADER_SIZE as u64);
        assert_eq!(header.sample_type, 1 << 11);
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(TraceHeader::parse(&[0u8; 10]).is_err());
    }
}
