//! Sideband Replayer (decoder spec §4.5).
//!
//! Decodes one CPU's kernel perf sideband stream into context-switch and
//! AUX-loss events, timestamped on the PT clock via the perf-derived time
//! conversion formula.

pub mod perf_event;

use thiserror::Error;

use perf_event::{parse_record, PerfEventError, PERF_RECORD_AUX};

#[derive(Debug, Error)]
pub enum SidebandError {
    #[error("sideband record error: {0}")]
    Record(#[from] PerfEventError),
    #[error("time conversion overflow for perf time {0}")]
    ConversionOverflow(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct TimeConversion {
    pub time_mult: u32,
    pub time_shift: u16,
    pub time_zero: u64,
}

impl TimeConversion {
    /// §4.5: `tsc = ((time - time_zero) << time_shift) / time_mult + time_zero`.
    /// The spec names a separate `time_zero_adjusted` constant but does not
    /// define how it differs from `time_zero`; we treat them as equal,
    /// which is the degenerate (no wraparound-correction) case and exactly
    /// reproduces the formula when perf's rate adjustment never wrapped.
    pub fn to_tsc(&self, time: u64) -> Result<u64, SidebandError> {
        if self.time_mult == 0 {
            return Err(SidebandError::ConversionOverflow(time));
        }
        let delta = time.checked_sub(self.time_zero).unwrap_or(0);
        let shifted = delta
            .checked_shl(self.time_shift as u32)
            .ok_or(SidebandError::ConversionOverflow(time))?;
        Ok(shifted / self.time_mult as u64 + self.time_zero)
    }
}

/// A context-switch or AUX-loss event timestamped on the PT clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidebandEvent {
    /// The CPU switched to running `tid` (`None` means it went idle / off
    /// a traced thread). Inferred from any record carrying a sample `tid`
    /// field whose value differs from the previously observed one.
    ContextSwitch { tid: Option<u32> },
}

pub struct SidebandReplayer<'a> {
    data: &'a [u8],
    pos: usize,
    sample_type: u64,
    conversion: TimeConversion,
    last_tid: Option<u32>,
    /// Sticky until consumed by the driver at the next switch-in (§4.7).
    loss_pending: bool,
}

impl<'a> SidebandReplayer<'a> {
    pub fn new(data: &'a [u8], sample_type: u64, conversion: TimeConversion) -> SidebandReplayer<'a> {
        SidebandReplayer {
            data,
            pos: 0,
            sample_type,
            conversion,
            last_tid: None,
            loss_pending: false,
        }
    }

    /// Yields every sideband event whose converted timestamp is <= `t`.
    pub fn advance_to(&mut self, t: u64) -> Result<Vec<SidebandEvent>, SidebandError> {
        let mut out = Vec::new();
        loop {
            if self.pos >= self.data.len() {
                break;
            }
            let record = parse_record(&self.data[self.pos..], self.sample_type)?;
            let Some(time) = record.sample.time else {
                // No PERF_SAMPLE_TIME bit: we cannot order this record on
                // the PT clock, so treat it as immediately available.
                self.pos += record.record_len;
                if record.header.record_type == PERF_RECORD_AUX && record.aux_truncated {
                    self.loss_pending = true;
                }
                continue;
            };
            let tsc = self.conversion.to_tsc(time)?;
            if tsc > t {
                break;
            }
            self.pos += record.record_len;

            if record.header.record_type == PERF_RECORD_AUX && record.aux_truncated {
                self.loss_pending = true;
            }
            if let Some(tid) = record.sample.tid {
                if Some(tid) != self.last_tid {
                    self.last_tid = Some(tid);
                    out.push(SidebandEvent::ContextSwitch { tid: Some(tid) });
                }
            }
        }
        Ok(out)
    }

    /// Consumes and clears the sticky AUX-loss flag (§4.5, §4.7: "a sticky
    /// AUX-loss flag emits a data_loss event at switch-in").
    pub fn take_loss(&mut self) -> bool {
        std::mem::replace(&mut self.loss_pending, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_conversion_when_shift_and_mult_are_trivial() {
        let conv = TimeConversion { time_mult: 1, time_shift: 0, time_zero: 1000 };
        assert_eq!(conv.to_tsc(1500).unwrap(), 1500);
    }

    #[test]
    fn zero_mult_is_a_conversion_error() {
        let conv = TimeConversion { time_mult: 0, time_shift: 0, time_zero: 0 };
        assert!(conv.to_tsc(10).is_err());
    }
}
