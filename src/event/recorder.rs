//! Turns one CPU's flat, time-ordered event stream into contiguous
//! per-thread segments.
//!
//! Grounded on `DecodeDataRecord::switch_in`/`switch_out` (`decode_data.cpp`):
//! a thread segment starts the moment a replayed sideband context switch
//! names a new java thread id and ends when it switches away again; a
//! segment that ends up with nothing recorded in it is dropped, matching
//! the original's "previous thread contains no data" pruning in
//! `switch_out`. The driver already tags every `TimedEvent` with the thread
//! id in effect when it was observed, so segmenting is a single grouping
//! pass rather than a second pass over raw bytes.

use crate::pt::TimedEvent;

#[derive(Debug, Clone)]
pub struct ThreadSegment {
    pub tid: u32,
    pub start_time: u64,
    pub end_time: u64,
    pub events: Vec<TimedEvent>,
}

/// Splits one CPU's chronological event stream into contiguous per-thread
/// runs. Events recorded before any thread id was known (`tid: None`,
/// i.e. before the first context switch sideband record) are dropped, the
/// same way the original recorder can't write anything before `switch_in`.
pub fn segment_by_thread(events: Vec<TimedEvent>) -> Vec<ThreadSegment> {
    let mut segments: Vec<ThreadSegment> = Vec::new();
    let mut current: Option<ThreadSegment> = None;

    for ev in events {
        let Some(tid) = ev.tid else { continue };
        match &mut current {
            Some(seg) if seg.tid == tid => {
                seg.end_time = ev.time;
                seg.events.push(ev);
            }
            _ => {
                if let Some(seg) = current.take() {
                    segments.push(seg);
                }
                current = Some(ThreadSegment { tid, start_time: ev.time, end_time: ev.time, events: vec![ev] });
            }
        }
    }
    if let Some(seg) = current {
        segments.push(seg);
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    fn ev(time: u64, tid: Option<u32>, event: Event) -> TimedEvent {
        TimedEvent { time, tid, event }
    }

    #[test]
    fn groups_consecutive_events_with_the_same_tid() {
        let events = vec![
            ev(1, Some(1), Event::CallBegin),
            ev(2, Some(1), Event::Taken),
            ev(3, Some(2), Event::CallBegin),
            ev(4, Some(2), Event::CallEnd),
        ];
        let segs = segment_by_thread(events);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].tid, 1);
        assert_eq!(segs[0].events.len(), 2);
        assert_eq!(segs[1].tid, 2);
        assert_eq!(segs[1].start_time, 3);
        assert_eq!(segs[1].end_time, 4);
    }

    #[test]
    fn events_with_no_known_tid_are_dropped() {
        let events = vec![ev(1, None, Event::CallBegin), ev(2, Some(5), Event::CallEnd)];
        let segs = segment_by_thread(events);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].events.len(), 1);
    }

    #[test]
    fn revisiting_a_tid_after_another_thread_starts_a_new_segment() {
        let events = vec![
            ev(1, Some(1), Event::CallBegin),
            ev(2, Some(2), Event::CallBegin),
            ev(3, Some(1), Event::CallEnd),
        ];
        let segs = segment_by_thread(events);
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[2].tid, 1);
    }
}
