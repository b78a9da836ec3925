use std::{collections::VecDeque, ops::Range};

use bytes::{Buf, BufMut, Bytes};

use crate::range_set::RangeSet;

/// Outgoing stream data kept until the peer acknowledges it
#[derive(Default, Debug)]
pub(super) struct SendBuffer {
    /// Written but unacknowledged data, sent or not
    segments: VecDeque<Bytes>,
    /// Total size of `segments`
    buffered: usize,
    /// Offset past the last byte written by the application
    offset: u64,
    /// First offset never transmitted, within `offset - buffered..=offset`
    unsent: u64,
    /// Acknowledged ranges not yet contiguous with the start of `segments`
    acks: RangeSet,
    /// Transmitted ranges declared lost
    retransmits: RangeSet,
}

impl SendBuffer {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Append application data to the end of the stream
    pub(super) fn write(&mut self, data: Bytes) {
        self.buffered += data.len();
        self.offset += data.len() as u64;
        self.segments.push_back(data);
    }

    /// Drop an acknowledged range, releasing memory once the acknowledged prefix grows
    pub(super) fn ack(&mut self, mut range: Range<u64>) {
        let base = self.base_offset();
        range.start = range.start.max(base);
        range.end = range.end.max(base);
        if range.is_empty() {
            return;
        }
        self.acks.insert(range);
        while self.acks.min() == Some(self.base_offset()) {
            let Some(prefix) = self.acks.pop_min() else {
                break;
            };
            self.discard_front((prefix.end - prefix.start) as usize);
        }
    }

    fn discard_front(&mut self, mut len: usize) {
        self.buffered -= len;
        while len > 0 {
            let Some(front) = self.segments.front_mut() else {
                debug_assert!(false, "acknowledged data beyond buffer");
                return;
            };
            if front.len() <= len {
                len -= front.len();
                self.segments.pop_front();
            } else {
                front.advance(len);
                len = 0;
            }
        }
        if self.segments.len() * 4 < self.segments.capacity() {
            self.segments.shrink_to_fit();
        }
    }

    fn base_offset(&self) -> u64 {
        self.offset - self.buffered as u64
    }

    /// Select up to `max_len` bytes to transmit next, preferring lost data
    pub(super) fn poll_transmit(&mut self, max_len: usize) -> Range<u64> {
        let max_len = max_len as u64;
        if let Some(range) = self.retransmits.pop_min() {
            let end = range.end.min(range.start.saturating_add(max_len));
            if end != range.end {
                self.retransmits.insert(end..range.end);
            }
            return range.start..end;
        }

        let end = self.offset.min(self.unsent.saturating_add(max_len));
        let range = self.unsent..end;
        self.unsent = end;
        range
    }

    /// Copy the data in `range` into `out`
    pub(super) fn copy_to(&self, range: Range<u64>, out: &mut impl BufMut) {
        let mut segment_start = self.base_offset();
        let mut start = range.start;
        for segment in &self.segments {
            let segment_end = segment_start + segment.len() as u64;
            if start < range.end && start >= segment_start && start < segment_end {
                let from = (start - segment_start) as usize;
                let to = (range.end.min(segment_end) - segment_start) as usize;
                out.put_slice(&segment[from..to]);
                start = segment_start + to as u64;
            }
            segment_start = segment_end;
        }
        debug_assert_eq!(start, range.end, "range not buffered");
    }

    /// Queue a range of sent but unacknowledged data to be retransmitted
    pub(super) fn retransmit(&mut self, range: Range<u64>) {
        debug_assert!(range.end <= self.unsent, "unsent data can't be lost");
        let base = self.base_offset();
        let range = range.start.max(base)..range.end;
        if !range.is_empty() {
            self.retransmits.insert(range);
        }
    }

    /// Mark everything unsent again, after the peer rejected 0-RTT
    pub(super) fn retransmit_all_for_0rtt(&mut self) {
        debug_assert_eq!(self.offset, self.buffered as u64);
        self.unsent = 0;
        self.retransmits = RangeSet::new();
    }

    /// Offset the next write begins at
    pub(super) fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether all written data has been acknowledged
    pub(super) fn is_fully_acked(&self) -> bool {
        self.buffered == 0
    }

    /// Whether there's data to send; sent data may still be unacknowledged when this is false
    pub(super) fn has_unsent_data(&self) -> bool {
        self.unsent != self.offset || !self.retransmits.is_empty()
    }

    /// Bytes written but not yet acknowledged
    pub(super) fn unacked(&self) -> u64 {
        self.buffered as u64 - self.acks.iter().map(|x| x.end - x.start).sum::<u64>()
    }
}
