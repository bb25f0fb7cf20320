//! Query-style layer over the packet decoder.
//!
//! Mirrors the shape of a libipt query decoder (`pt_qry_sync_forward`,
//! `pt_qry_cond_branch`, `pt_qry_indirect_branch`, event draining) as used
//! by the original decoder's driver loop, but built directly on our own
//! packet decoder instead of binding to libipt. TNT bits and pending
//! events are buffered as packets are scanned; instruction-stepping
//! decisions (`cond_branch`/`indirect_branch`) consume from those buffers,
//! reading further packets only when the buffer runs dry.

use std::collections::VecDeque;

use thiserror::Error;

use super::packet::{IpBytes, Packet, PacketDecoder, PacketError};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("packet decode error: {0}")]
    Packet(#[from] PacketError),
    #[error("end of trace")]
    Eos,
    #[error("expected a TNT packet to resolve a conditional branch")]
    ExpectedTnt,
    #[error("expected a TIP packet to resolve an indirect branch")]
    ExpectedTip,
    #[error("a TIP packet suppressed its ip, but decoding needs one")]
    IpSuppressed,
    #[error("packet sequence is not valid here")]
    BadSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtEvent {
    Enabled { ip: u64 },
    Disabled { ip: Option<u64> },
    AsyncBranch { to: u64 },
    Paging { cr3: u64 },
    Vmcs { base: u64 },
    Overflow { ip: Option<u64> },
    ExecMode { csl: bool, csd: bool },
    Tsx { speculative: bool },
    Stop,
    Ptwrite { payload: u64 },
}

pub struct PtQuery<'a> {
    decoder: PacketDecoder<'a>,
    enabled: bool,
    ip: u64,
    tsc: u64,
    tnt_bits: VecDeque<bool>,
    eos: bool,
}

impl<'a> PtQuery<'a> {
    pub fn new(data: &'a [u8]) -> PtQuery<'a> {
        PtQuery { decoder: PacketDecoder::new(data), enabled: false, ip: 0, tsc: 0, tnt_bits: VecDeque::new(), eos: false }
    }

    pub fn ip(&self) -> u64 {
        self.ip
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn time(&self) -> u64 {
        self.tsc
    }

    pub fn is_eos(&self) -> bool {
        self.eos
    }

    /// Byte offset into this query's buffer, for splitting PT streams at
    /// sync-point boundaries.
    pub fn position(&self) -> usize {
        self.decoder.position()
    }

    /// Scans to the next PSB and replays its PSB+ header packets, landing
    /// on the IP and enabled-state they describe.
    pub fn sync_forward(&mut self) -> Result<(), QueryError> {
        self.tnt_bits.clear();
        let Some(psb_offset) = self.decoder.find_next_psb() else {
            self.eos = true;
            return Err(QueryError::Eos);
        };
        self.decoder.seek(psb_offset);
        match self.decoder.next_packet()? {
            Packet::Psb => {}
            _ => return Err(QueryError::BadSequence),
        }

        self.enabled = false;
        loop {
            match self.decoder.next_packet()? {
                Packet::PsbEnd => break,
                Packet::Fup(ip) => {
                    if let Some(resolved) = ip.resolve(self.ip) {
                        self.ip = resolved;
                        self.enabled = true;
                    }
                }
                Packet::Tsc(v) => self.tsc = v,
                Packet::Pip { .. } | Packet::Vmcs(_) | Packet::ModeExec { .. } | Packet::ModeTsx { .. } | Packet::Mtc(_) | Packet::Cbr(_) => {}
                Packet::Ovf => {}
                Packet::Pad => {}
                _ => return Err(QueryError::BadSequence),
            }
        }
        Ok(())
    }

    /// Resolves a conditional branch decision from the TNT bitstream,
    /// reading a new TNT packet when the buffered bits run out.
    pub fn cond_branch(&mut self) -> Result<bool, QueryError> {
        if let Some(bit) = self.tnt_bits.pop_front() {
            return Ok(bit);
        }
        loop {
            match self.decoder.next_packet()? {
                Packet::TntShort(bits) | Packet::TntLong(bits) => {
                    if bits.is_empty() {
                        continue;
                    }
                    self.tnt_bits.extend(bits);
                    return Ok(self.tnt_bits.pop_front().unwrap());
                }
                Packet::Tsc(v) => self.tsc = v,
                Packet::Mtc(_) | Packet::Cyc(_) | Packet::Cbr(_) | Packet::Pad => continue,
                _ => return Err(QueryError::ExpectedTnt),
            }
        }
    }

    /// Resolves an indirect branch target from the next TIP packet.
    pub fn indirect_branch(&mut self) -> Result<u64, QueryError> {
        loop {
            match self.decoder.next_packet()? {
                Packet::Tip(ip) => {
                    let resolved = ip.resolve(self.ip).ok_or(QueryError::IpSuppressed)?;
                    self.ip = resolved;
                    return Ok(resolved);
                }
                Packet::Tsc(v) => self.tsc = v,
                Packet::Mtc(_) | Packet::Cyc(_) | Packet::Cbr(_) | Packet::Pad => continue,
                _ => return Err(QueryError::ExpectedTip),
            }
        }
    }

    /// Reads and interprets the next non-branch packet as an event, or
    /// `None` if the stream is positioned at a TNT/TIP decision the driver
    /// must resolve via `cond_branch`/`indirect_branch` instead.
    pub fn poll_event(&mut self) -> Result<Option<PtEvent>, QueryError> {
        if self.decoder.is_empty() {
            self.eos = true;
            return Err(QueryError::Eos);
        }
        match self.decoder.next_packet()? {
            Packet::TipPge(ip) => {
                let resolved = ip.resolve(self.ip).ok_or(QueryError::IpSuppressed)?;
                self.ip = resolved;
                self.enabled = true;
                Ok(Some(PtEvent::Enabled { ip: resolved }))
            }
            Packet::TipPgd(ip) => {
                let resolved = ip.resolve(self.ip);
                if let Some(r) = resolved {
                    self.ip = r;
                }
                self.enabled = false;
                Ok(Some(PtEvent::Disabled { ip: resolved }))
            }
            Packet::Fup(ip) => {
                let resolved = ip.resolve(self.ip);
                if let Some(r) = resolved {
                    self.ip = r;
                    return Ok(Some(PtEvent::AsyncBranch { to: r }));
                }
                Ok(None)
            }
            Packet::Pip { cr3, .. } => Ok(Some(PtEvent::Paging { cr3 })),
            Packet::Vmcs(base) => Ok(Some(PtEvent::Vmcs { base })),
            Packet::ModeExec { csl, csd } => Ok(Some(PtEvent::ExecMode { csl, csd })),
            Packet::ModeTsx { intx, abrt } => Ok(Some(PtEvent::Tsx { speculative: intx && !abrt })),
            Packet::Ovf => Ok(Some(PtEvent::Overflow { ip: if self.enabled { Some(self.ip) } else { None } })),
            Packet::TraceStop => {
                self.enabled = false;
                Ok(Some(PtEvent::Stop))
            }
            Packet::Ptw { payload, .. } => Ok(Some(PtEvent::Ptwrite { payload })),
            Packet::Tsc(v) => {
                self.tsc = v;
                Ok(None)
            }
            Packet::Psb => {
                self.decoder.seek(self.decoder.position() - 16);
                self.sync_forward()?;
                Ok(None)
            }
            Packet::Mtc(_) | Packet::Cyc(_) | Packet::Cbr(_) | Packet::Mnt(_) | Packet::Pad => Ok(None),
            Packet::TntShort(bits) | Packet::TntLong(bits) => {
                self.tnt_bits.extend(bits);
                Ok(None)
            }
            Packet::Tip(ip) => {
                if let Some(resolved) = ip.resolve(self.ip) {
                    self.ip = resolved;
                }
                Ok(None)
            }
            Packet::PsbEnd => Err(QueryError::BadSequence),
            Packet::Unknown => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn psb_bytes() -> Vec<u8> {
        let mut v = Vec::new();
        for _ in 0..8 {
            v.push(0x02);
            v.push(0x82);
        }
        v
    }

    #[test]
    fn sync_forward_then_psbend_leaves_disabled_with_no_fup() {
        let mut data = psb_bytes();
        data.push(0x02);
        data.push(0x23); // PSBEND
        let mut q = PtQuery::new(&data);
        q.sync_forward().unwrap();
        assert!(!q.enabled());
    }

    #[test]
    fn sync_forward_with_fup_enables_and_sets_ip() {
        let mut data = psb_bytes();
        data.push(0b1001_1101); // FUP, full ip (ipbits=100, opcode 0b11101)
        data.extend_from_slice(&0x4000u64.to_le_bytes());
        data.push(0x02);
        data.push(0x23);
        let mut q = PtQuery::new(&data);
        q.sync_forward().unwrap();
        assert!(q.enabled());
        assert_eq!(q.ip(), 0x4000);
    }
}
