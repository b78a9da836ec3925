use std::{
    collections::{BTreeMap, VecDeque},
    mem,
    ops::{Bound, Index, IndexMut},
    time::{Duration, Instant},
};

use rustc_hash::FxHashSet;

use super::{assembler::Assembler, cid_state::IssuedCid, paths::PathId, streams::StreamsState};
use crate::{Dir, StreamId, VarInt, crypto::Keys, frame, packet::SpaceId, range_set::ArrayRangeSet};

/// State of one packet number space: Initial, Handshake or application data
pub(super) struct PacketSpace {
    pub(super) crypto: Option<Keys>,
    pub(super) dedup: Dedup,
    /// Highest received packet number
    pub(super) rx_packet: u64,

    /// Frames waiting to be sent
    pub(super) pending: Retransmits,
    /// Packet numbers to acknowledge
    pub(super) pending_acks: PendingAcks,

    /// The packet number of the next packet that will be sent
    pub(super) next_packet_number: u64,
    /// The largest packet number the peer acknowledged in an ACK frame
    pub(super) largest_acked_packet: Option<u64>,
    pub(super) largest_acked_packet_sent: Instant,
    /// The highest-numbered ack-eliciting packet we've sent
    pub(super) largest_ack_eliciting_sent: u64,
    /// Number of packets in `sent_packets` numbered above `largest_ack_eliciting_sent`
    non_eliciting_tail: u64,
    /// Transmitted but not acked, ordered by packet number for range queries on ACK and loss
    pub(super) sent_packets: BTreeMap<u64, SentPacket>,

    /// Incoming handshake data
    pub(super) crypto_stream: Assembler,
    /// Current offset of outgoing handshake data
    pub(super) crypto_offset: u64,

    /// When the most recent ack-eliciting packet was sent
    pub(super) time_of_last_ack_eliciting_packet: Option<Instant>,
    /// When the earliest unacknowledged packet below the largest acked one will be declared lost
    pub(super) loss_time: Option<Instant>,
    /// Number of probe packets to send
    pub(super) loss_probes: u32,
    pub(super) ping_pending: bool,
}

impl PacketSpace {
    pub(super) fn new(now: Instant) -> Self {
        Self {
            crypto: None,
            dedup: Dedup::new(),
            rx_packet: 0,

            pending: Retransmits::default(),
            pending_acks: PendingAcks::new(),

            next_packet_number: 0,
            largest_acked_packet: None,
            largest_acked_packet_sent: now,
            largest_ack_eliciting_sent: 0,
            non_eliciting_tail: 0,
            sent_packets: BTreeMap::new(),

            crypto_stream: Assembler::new(),
            crypto_offset: 0,

            time_of_last_ack_eliciting_packet: None,
            loss_time: None,
            loss_probes: 0,
            ping_pending: false,
        }
    }

    /// Queue something for a probe packet sent on PTO
    ///
    /// New data is preferred. Failing that, the frames of the oldest in-flight packet are queued
    /// again, and failing that a PING is sent so the peer has something to acknowledge.
    pub(super) fn maybe_queue_probe(&mut self, streams: &StreamsState) {
        if self.loss_probes == 0 || !self.pending.is_empty(streams) {
            return;
        }

        let oldest = self
            .sent_packets
            .values_mut()
            .find(|packet| !packet.retransmits.is_empty(streams));
        match oldest {
            // Moved rather than copied so a second loss doesn't queue the frames twice
            Some(packet) => self.pending |= mem::take(&mut packet.retransmits),
            None => self.ping_pending = true,
        }
    }

    /// Allocate the next outgoing packet number
    pub(super) fn get_tx_number(&mut self) -> u64 {
        let number = self.next_packet_number;
        debug_assert!(number < 1 << 62);
        self.next_packet_number = number + 1;
        number
    }

    pub(super) fn can_send(&self, streams: &StreamsState) -> SendableFrames {
        SendableFrames {
            acks: self.pending_acks.can_send(),
            other: !self.pending.is_empty(streams) || self.ping_pending,
        }
    }

    /// Stop tracking sent packet `number`, and return what we knew about it
    pub(super) fn take(&mut self, number: u64) -> Option<SentPacket> {
        let packet = self.sent_packets.remove(&number)?;
        let in_tail = !packet.ack_eliciting && number > self.largest_ack_eliciting_sent;
        if in_tail {
            self.non_eliciting_tail = self.non_eliciting_tail.saturating_sub(1);
        }
        Some(packet)
    }

    /// Record a sent packet; may return an old packet that is no longer tracked
    pub(super) fn sent(&mut self, number: u64, packet: SentPacket) -> Option<SentPacket> {
        // Non-ack-eliciting packets may never be acknowledged, so only a bounded tail is kept
        const MAX_NON_ELICITING_TAIL: u64 = 1_000;

        let mut forgotten = None;
        if packet.ack_eliciting {
            self.largest_ack_eliciting_sent = number;
            self.non_eliciting_tail = 0;
        } else if self.non_eliciting_tail <= MAX_NON_ELICITING_TAIL {
            self.non_eliciting_tail += 1;
        } else {
            let tail = (Bound::Excluded(self.largest_ack_eliciting_sent), Bound::Unbounded);
            if let Some((&oldest, _)) = self.sent_packets.range(tail).next() {
                forgotten = self.sent_packets.remove(&oldest);
            }
        }
        self.sent_packets.insert(number, packet);
        forgotten
    }

    /// Whether any congestion-controlled packets in this space await acknowledgement
    pub(super) fn has_in_flight(&self) -> bool {
        self.sent_packets.values().any(|x| x.size != 0)
    }
}

impl Index<SpaceId> for [PacketSpace; 3] {
    type Output = PacketSpace;
    fn index(&self, space: SpaceId) -> &PacketSpace {
        &self.as_ref()[space as usize]
    }
}

impl IndexMut<SpaceId> for [PacketSpace; 3] {
    fn index_mut(&mut self, space: SpaceId) -> &mut PacketSpace {
        &mut self.as_mut()[space as usize]
    }
}

/// Bookkeeping for a packet awaiting acknowledgement
#[derive(Debug, Clone)]
pub(super) struct SentPacket {
    /// Path the packet was sent on
    pub(super) path: PathId,
    /// Generation of that path slot when the packet was sent
    pub(super) path_generation: u64,
    pub(super) time_sent: Instant,
    /// Bytes counted towards congestion control, zero for packets that aren't in flight
    pub(super) size: u16,
    pub(super) ack_eliciting: bool,
    /// The largest packet number acknowledged by this packet
    pub(super) largest_acked: Option<u64>,
    /// Delivery-rate state when the packet left
    pub(super) delivered: (u64, Instant),
    /// Frames to send again if the packet is lost
    pub(super) retransmits: ThinRetransmits,
    /// Metadata of the STREAM frames in the packet; the data stays with the stream
    pub(super) stream_frames: frame::StreamMetaVec,
}

/// Frames queued for transmission that are retransmitted when lost
#[derive(Debug, Default, Clone)]
pub(crate) struct Retransmits {
    pub(super) max_data: bool,
    pub(super) max_stream_id: [bool; 2],
    pub(super) reset_stream: Vec<(StreamId, VarInt)>,
    pub(super) stop_sending: Vec<frame::StopSending>,
    pub(super) max_stream_data: FxHashSet<StreamId>,
    pub(super) crypto: VecDeque<frame::Crypto>,
    pub(super) new_cids: Vec<IssuedCid>,
    pub(super) retire_cids: Vec<u64>,
    pub(super) handshake_done: bool,
}

impl Retransmits {
    pub(super) fn is_empty(&self, streams: &StreamsState) -> bool {
        let flags = self.max_data || self.handshake_done || self.max_stream_id.contains(&true);
        let queues = !self.reset_stream.is_empty()
            || !self.stop_sending.is_empty()
            || !self.crypto.is_empty()
            || !self.new_cids.is_empty()
            || !self.retire_cids.is_empty();
        // MAX_STREAM_DATA only counts for streams that still need a credit update
        let credit = self
            .max_stream_data
            .iter()
            .any(|&id| streams.can_send_flow_control(id));
        !(flags || queues || credit)
    }
}

impl std::ops::BitOrAssign for Retransmits {
    fn bitor_assign(&mut self, rhs: Self) {
        self.max_data |= rhs.max_data;
        self.handshake_done |= rhs.handshake_done;
        for dir in Dir::iter() {
            self.max_stream_id[dir as usize] |= rhs.max_stream_id[dir as usize];
        }
        self.reset_stream.extend(rhs.reset_stream);
        self.stop_sending.extend(rhs.stop_sending);
        self.max_stream_data.extend(rhs.max_stream_data);
        // Lost handshake data goes ahead of new data so the peer can make progress
        let mut crypto = rhs.crypto;
        crypto.append(&mut self.crypto);
        self.crypto = crypto;
        self.new_cids.extend(rhs.new_cids);
        self.retire_cids.extend(rhs.retire_cids);
    }
}

impl std::ops::BitOrAssign<ThinRetransmits> for Retransmits {
    fn bitor_assign(&mut self, rhs: ThinRetransmits) {
        if let Some(retransmits) = rhs.retransmits {
            self.bitor_assign(*retransmits)
        }
    }
}

/// [`Retransmits`] that only allocates once something is stored
///
/// Most packets carry only ACK and STREAM frames, which are tracked elsewhere.
#[derive(Debug, Default, Clone)]
pub(crate) struct ThinRetransmits {
    retransmits: Option<Box<Retransmits>>,
}

impl ThinRetransmits {
    pub(super) fn is_empty(&self, streams: &StreamsState) -> bool {
        self.retransmits
            .as_ref()
            .map_or(true, |retransmits| retransmits.is_empty(streams))
    }

    pub(super) fn get(&self) -> Option<&Retransmits> {
        self.retransmits.as_deref()
    }

    pub(super) fn get_or_create(&mut self) -> &mut Retransmits {
        self.retransmits.get_or_insert_with(Box::default)
    }
}

/// Replay filter over authenticated packet numbers
///
/// Remembers the largest number seen plus a bitmap of the [`WINDOW_SIZE`] - 1 numbers just below
/// it. Anything further back is assumed to have been seen already.
pub(super) struct Dedup {
    largest: Option<u64>,
    /// Bit `i` is set once packet `largest - 1 - i` arrived
    below: u128,
}

/// Reordering deeper than this is indistinguishable from duplication
const WINDOW_SIZE: u64 = 1 + u128::BITS as u64;

impl Dedup {
    pub(super) fn new() -> Self {
        Self {
            largest: None,
            below: 0,
        }
    }

    /// Record a newly authenticated packet number, returning whether it may be a duplicate
    pub(super) fn insert(&mut self, packet: u64) -> bool {
        let Some(largest) = self.largest else {
            self.largest = Some(packet);
            return false;
        };

        if packet > largest {
            // The old largest moves into the bitmap at position `shift - 1`
            let shift = u32::try_from(packet - largest - 1).unwrap_or(u32::MAX);
            self.below = ((self.below << 1) | 1).checked_shl(shift).unwrap_or(0);
            self.largest = Some(packet);
            return false;
        }

        let Some(bit) = (largest - packet).checked_sub(1) else {
            return true;
        };
        if bit >= u64::from(u128::BITS) {
            return true;
        }
        let mask = 1u128 << bit;
        let seen = self.below & mask != 0;
        self.below |= mask;
        seen
    }

    /// Whether a packet numbered strictly between `lower` and `upper` is missing
    ///
    /// `upper` must not exceed the largest packet inserted so far.
    fn missing_in_interval(&self, lower: u64, upper: u64) -> bool {
        let Some(largest) = self.largest else {
            return false;
        };
        debug_assert!(lower <= upper && upper <= largest);
        if upper - lower < 2 {
            return false;
        }
        let first = largest - upper;
        let last = (largest - lower - 2).min(u64::from(u128::BITS) - 1);
        (first..=last).any(|bit| self.below & (1 << bit) == 0)
    }
}

/// Which kinds of frames a space has ready
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) struct SendableFrames {
    pub(super) acks: bool,
    pub(super) other: bool,
}

impl SendableFrames {
    pub(super) fn empty() -> Self {
        Self {
            acks: false,
            other: false,
        }
    }

    pub(super) fn is_empty(&self) -> bool {
        !(self.acks || self.other)
    }
}

impl std::ops::BitOrAssign for SendableFrames {
    fn bitor_assign(&mut self, rhs: Self) {
        self.acks |= rhs.acks;
        self.other |= rhs.other;
    }
}

/// Acknowledgements owed to the peer
#[derive(Debug)]
pub(super) struct PendingAcks {
    /// An ACK must go out now, even in a packet of its own
    ///
    /// Otherwise ACKs ride along with other frames or wait for the max ACK delay timer.
    immediate: bool,
    /// Ack-eliciting packets received since the last ACK was sent
    eliciting_since_ack: u64,
    non_eliciting_since_ack: u64,
    /// Arrival of the first ack-eliciting packet the next ACK will cover
    delay_start: Option<Instant>,
    ranges: ArrayRangeSet,
    /// Largest packet number received and when, for the ACK Delay field
    largest: Option<(u64, Instant)>,
    largest_eliciting: Option<u64>,
}

/// Acknowledge at least every second ack-eliciting packet (RFC 9000 §13.2.2)
const ACK_ELICITING_THRESHOLD: u64 = 1;

/// Non-ack-eliciting packets tolerated before an ACK is piggybacked anyway
const LAZY_ACK_THRESHOLD: u64 = 10;

/// Keeps every ACK frame well within a minimum-MTU packet
const MAX_ACK_BLOCKS: usize = 64;

impl PendingAcks {
    fn new() -> Self {
        Self {
            immediate: false,
            eliciting_since_ack: 0,
            non_eliciting_since_ack: 0,
            delay_start: None,
            ranges: ArrayRangeSet::default(),
            largest: None,
            largest_eliciting: None,
        }
    }

    pub(super) fn set_immediate_ack_required(&mut self) {
        self.immediate = true;
    }

    pub(super) fn on_max_ack_delay_timeout(&mut self) {
        self.immediate = self.eliciting_since_ack != 0;
    }

    pub(super) fn max_ack_delay_timeout(&self, max_ack_delay: Duration) -> Option<Instant> {
        Some(self.delay_start? + max_ack_delay)
    }

    pub(super) fn can_send(&self) -> bool {
        self.immediate && !self.ranges.is_empty()
    }

    /// Time since the largest packet number was received
    pub(super) fn ack_delay(&self, now: Instant) -> Duration {
        match self.largest {
            Some((_, received)) => now.saturating_duration_since(received),
            None => Duration::ZERO,
        }
    }

    /// Handle receipt of a new packet; returns `true` if the max ack delay timer should be armed
    pub(super) fn packet_received(
        &mut self,
        now: Instant,
        packet_number: u64,
        ack_eliciting: bool,
        dedup: &Dedup,
    ) -> bool {
        if !ack_eliciting {
            self.non_eliciting_since_ack += 1;
            return false;
        }

        let prev = self.largest_eliciting.unwrap_or(0);
        self.largest_eliciting = Some(prev.max(packet_number));
        self.eliciting_since_ack += 1;

        // Reordering and gaps are reported without delay (RFC 9000 §13.2.1)
        let reordered = packet_number < prev || dedup.missing_in_interval(prev, packet_number);
        if reordered || self.eliciting_since_ack > ACK_ELICITING_THRESHOLD {
            self.immediate = true;
        }

        if self.delay_start.is_some() || self.can_send() {
            return false;
        }
        self.delay_start = Some(now);
        true
    }

    /// Suppress further ACKs until more ack-eliciting packets arrive
    ///
    /// Ranges that didn't fit in the frame stay in `ranges` and go out with the next ACK.
    pub(super) fn acks_sent(&mut self) {
        self.immediate = false;
        self.eliciting_since_ack = 0;
        self.non_eliciting_since_ack = 0;
        self.delay_start = None;
    }

    pub(super) fn insert_one(&mut self, packet: u64, now: Instant) {
        self.ranges.insert_one(packet);
        match self.largest {
            Some((largest, _)) if largest >= packet => {}
            _ => self.largest = Some((packet, now)),
        }
        if self.ranges.len() > MAX_ACK_BLOCKS {
            self.ranges.pop_min();
        }
    }

    /// Forget packets at or below `max`, whose acknowledgement the peer has seen
    pub(super) fn subtract_below(&mut self, max: u64) {
        self.ranges.remove(0..max + 1);
    }

    pub(super) fn ranges(&self) -> &ArrayRangeSet {
        &self.ranges
    }

    /// Ask for an ACK once many non-ack-eliciting packets went unacknowledged
    ///
    /// Called just before composing a packet that is being sent anyway, so a peer that only
    /// sends ACKs still gets timely loss feedback.
    pub(super) fn maybe_ack_non_eliciting(&mut self) {
        if self.non_eliciting_since_ack > LAZY_ACK_THRESHOLD {
            self.immediate = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Side, config::TransportConfig};

    #[test]
    fn dedup_window() {
        let mut dedup = Dedup::new();
        assert!(!dedup.insert(0));
        assert!(dedup.insert(0));
        assert!(!dedup.insert(1));
        assert!(!dedup.insert(2));
        assert_eq!(dedup.largest, Some(2));
        assert_eq!(dedup.below, 0b11);
        assert!(!dedup.insert(4));
        assert_eq!(dedup.below, 0b1110);
        assert!(!dedup.insert(3));
        assert!(dedup.insert(3));
        assert_eq!(dedup.below, 0b1111);
    }

    #[test]
    fn dedup_far_jump() {
        let mut dedup = Dedup::new();
        dedup.insert(0);
        dedup.insert(2 * WINDOW_SIZE);
        assert_eq!(dedup.below, 0);
        // Behind the window counts as seen
        assert!(dedup.insert(WINDOW_SIZE - 1));
        assert!(!dedup.insert(WINDOW_SIZE + 1));
        assert!(dedup.insert(WINDOW_SIZE + 1));
    }

    #[test]
    fn dedup_gaps() {
        let mut dedup = Dedup::new();
        dedup.insert(0);
        dedup.insert(1);
        assert!(!dedup.missing_in_interval(0, 1));
        dedup.insert(3);
        assert!(dedup.missing_in_interval(1, 3));
        dedup.insert(4);
        assert!(!dedup.missing_in_interval(3, 4));
        assert!(dedup.missing_in_interval(0, 4));
        dedup.insert(2);
        assert!(!dedup.missing_in_interval(0, 4));

        for i in 5..200 {
            dedup.insert(i);
        }
        dedup.insert(210);
        assert!(!dedup.missing_in_interval(0, 199));
        assert!(dedup.missing_in_interval(100, 210));
    }

    #[test]
    fn acks_every_second_packet() {
        let mut acks = PendingAcks::new();
        let mut dedup = Dedup::new();
        let now = Instant::now();

        dedup.insert(0);
        acks.insert_one(0, now);
        assert!(acks.packet_received(now, 0, true, &dedup));
        assert!(!acks.can_send());
        assert_eq!(
            acks.max_ack_delay_timeout(Duration::from_millis(25)),
            Some(now + Duration::from_millis(25))
        );

        dedup.insert(1);
        acks.insert_one(1, now);
        assert!(!acks.packet_received(now, 1, true, &dedup));
        assert!(acks.can_send());

        acks.acks_sent();
        assert!(!acks.can_send());
        assert_eq!(acks.max_ack_delay_timeout(Duration::from_millis(25)), None);
    }

    #[test]
    fn out_of_order_acked_immediately() {
        let mut acks = PendingAcks::new();
        let mut dedup = Dedup::new();
        let now = Instant::now();
        dedup.insert(0);
        acks.insert_one(0, now);
        acks.packet_received(now, 0, true, &dedup);
        acks.acks_sent();

        dedup.insert(2);
        acks.insert_one(2, now);
        acks.packet_received(now, 2, true, &dedup);
        assert!(acks.can_send());
    }

    #[test]
    fn ack_delay_tracks_largest() {
        let mut acks = PendingAcks::new();
        let mut dedup = Dedup::new();
        let t1 = Instant::now();
        let t2 = t1 + Duration::from_millis(2);
        let t3 = t2 + Duration::from_millis(5);
        assert_eq!(acks.ack_delay(t3), Duration::ZERO);

        dedup.insert(3);
        acks.insert_one(3, t1);
        acks.packet_received(t1, 3, true, &dedup);
        assert_eq!(acks.ack_delay(t2), Duration::from_millis(2));

        // A lower packet number doesn't move the reference point
        dedup.insert(2);
        acks.insert_one(2, t2);
        acks.packet_received(t2, 2, true, &dedup);
        assert_eq!(acks.ack_delay(t3), Duration::from_millis(7));

        acks.subtract_below(3);
        assert!(acks.ranges().is_empty());
    }

    #[test]
    fn retransmits_merge() {
        let streams = StreamsState::new(Side::Client, &TransportConfig::default());
        let mut pending = Retransmits::default();
        assert!(pending.is_empty(&streams));

        let mut lost = ThinRetransmits::default();
        assert!(lost.is_empty(&streams));
        lost.get_or_create().crypto.push_back(frame::Crypto {
            offset: 0,
            data: bytes::Bytes::from_static(b"hello"),
        });
        lost.get_or_create().handshake_done = true;

        pending.crypto.push_back(frame::Crypto {
            offset: 5,
            data: bytes::Bytes::from_static(b"world"),
        });
        pending |= lost;
        assert!(pending.handshake_done);
        assert_eq!(pending.crypto.front().map(|c| c.offset), Some(0));
        assert!(!pending.is_empty(&streams));
    }

    #[test]
    fn probe_falls_back_to_ping() {
        let streams = StreamsState::new(Side::Client, &TransportConfig::default());
        let mut space = PacketSpace::new(Instant::now());
        space.maybe_queue_probe(&streams);
        assert!(!space.ping_pending);
        space.loss_probes = 1;
        space.maybe_queue_probe(&streams);
        assert!(space.ping_pending);
        assert_eq!(space.get_tx_number(), 0);
        assert_eq!(space.get_tx_number(), 1);
    }
}
