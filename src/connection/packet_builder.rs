use std::time::Instant;

use bytes::Bytes;
use tracing::{trace, trace_span};

use super::{Connection, paths::PathId, spaces::SentPacket, transmit::SentFrames};
use crate::{
    ConnectionId, Side,
    packet::{InitialHeader, LongType, PacketNumber, PartialEncode, PlainHeader, SpaceId},
};

/// QUIC packet builder
///
/// Writes the header of one packet into the datagram buffer, tracks how much room its frames may
/// take, and on [`PacketBuilder::finish_and_track`] pads, encrypts and records the packet for
/// loss recovery.
pub(super) struct PacketBuilder {
    pub(super) space: SpaceId,
    path: PathId,
    partial_encode: PartialEncode,
    pub(super) ack_eliciting: bool,
    pub(super) exact_number: u64,
    pub(super) short_header: bool,
    /// Smallest position in the datagram buffer this packet's frames must reach
    min_size: usize,
    /// Largest position in the datagram buffer this packet's frames may reach
    pub(super) max_size: usize,
    datagram_start: usize,
    tag_len: usize,
    _span: tracing::span::EnteredSpan,
}

impl PacketBuilder {
    /// Write a new packet header to `buf` and determine the packet's properties
    ///
    /// Returns `None`, leaving `buf` untouched, if there are no keys for `space_id` or the
    /// datagram has no room left for a packet.
    pub(super) fn new(
        space_id: SpaceId,
        path_id: PathId,
        dst_cid: ConnectionId,
        buf: &mut Vec<u8>,
        datagram_start: usize,
        datagram_max: usize,
        ack_eliciting: bool,
        conn: &mut Connection,
    ) -> Option<Self> {
        let (sample_size, tag_len) = conn
            .local_keys(space_id)
            .map(|(header, packet)| (header.sample_size(), packet.tag_len()))?;

        let space = &conn.spaces[space_id];
        let exact_number = space.next_packet_number;
        let number = PacketNumber::new(exact_number, space.largest_acked_packet.unwrap_or(0));
        let header = match space_id {
            SpaceId::Data if space.crypto.is_some() => PlainHeader::Short {
                spin: conn.spin,
                key_phase: conn.key_phase,
                dst_cid,
                number,
            },
            SpaceId::Data => PlainHeader::Long {
                ty: LongType::ZeroRtt,
                src_cid: conn.handshake_cid,
                dst_cid,
                number,
                version: conn.version,
            },
            SpaceId::Handshake => PlainHeader::Long {
                ty: LongType::Handshake,
                src_cid: conn.handshake_cid,
                dst_cid,
                number,
                version: conn.version,
            },
            SpaceId::Initial => PlainHeader::Initial(InitialHeader {
                src_cid: conn.handshake_cid,
                dst_cid,
                token: match conn.side {
                    Side::Client => conn.retry_token.clone(),
                    Side::Server => Bytes::new(),
                },
                number,
                version: conn.version,
            }),
        };

        let start = buf.len();
        let partial_encode = header.encode(buf);

        // pn_len + payload_len + tag_len >= sample_size + 4, and the packet must stay longer than
        // a stateless reset addressed to the same CID would be
        let min_size = Ord::max(
            buf.len() + (sample_size + 4).saturating_sub(number.len() + tag_len),
            start + dst_cid.len() + 6,
        );
        let max_size = datagram_max.saturating_sub(tag_len);
        if max_size < min_size || max_size <= buf.len() {
            trace!(space = ?space_id, "no room for another packet");
            buf.truncate(start);
            return None;
        }

        let exact_number = conn.spaces[space_id].get_tx_number();
        let span = trace_span!("send", space = ?space_id, pn = exact_number, %path_id).entered();
        Some(Self {
            space: space_id,
            path: path_id,
            partial_encode,
            ack_eliciting,
            exact_number,
            short_header: header.is_short(),
            min_size,
            max_size,
            datagram_start,
            tag_len,
            _span: span,
        })
    }

    /// Pad the packet so the enclosing datagram occupies at least `size` bytes once encrypted
    pub(super) fn pad_to(&mut self, size: u16) {
        let target = (self.datagram_start + usize::from(size)).saturating_sub(self.tag_len);
        self.min_size = self.min_size.max(target.min(self.max_size));
    }

    /// Bytes left for frames
    pub(super) fn frame_space_remaining(&self, buf: &[u8]) -> usize {
        self.max_size.saturating_sub(buf.len())
    }

    /// Room for frames in an otherwise empty packet
    pub(super) fn capacity(&self) -> usize {
        self.max_size
            .saturating_sub(self.partial_encode.start + self.partial_encode.header_len)
    }

    /// Where the datagram would end if the packet were finished now
    pub(super) fn predicted_end(&self, buf: &[u8]) -> usize {
        buf.len().max(self.min_size) + self.tag_len
    }

    /// Whether no frames were written after the header
    pub(super) fn is_empty(&self, buf: &[u8]) -> bool {
        buf.len() == self.partial_encode.start + self.partial_encode.header_len
    }

    /// Drop the packet, removing its header from `buf`
    ///
    /// The packet number stays consumed; gaps in the sequence are harmless.
    pub(super) fn abandon(self, buf: &mut Vec<u8>) {
        trace!("abandoning empty packet");
        buf.truncate(self.partial_encode.start);
    }

    /// Encrypt and record the packet for loss recovery, returning its length on the wire
    pub(super) fn finish_and_track(
        self,
        now: Instant,
        conn: &mut Connection,
        buf: &mut Vec<u8>,
        sent: SentFrames,
    ) -> Option<usize> {
        let ack_eliciting = self.ack_eliciting;
        let exact_number = self.exact_number;
        let space_id = self.space;
        let path_id = self.path;
        let short_header = self.short_header;
        let (len, padded) = self.finish(conn, buf)?;
        if short_header {
            // The peer may update its keys again once it sees our new phase
            if let Some(prev) = conn.prev_crypto.as_mut() {
                prev.update_unacked = false;
            }
        }

        let size = match padded || ack_eliciting {
            true => len as u16,
            false => 0,
        };

        let path = &mut conn.paths[path_id.index()];
        let packet = SentPacket {
            path: path_id,
            path_generation: path.generation,
            time_sent: now,
            size,
            ack_eliciting,
            largest_acked: sent.largest_acked,
            delivered: path.delivery_rate.snapshot(),
            retransmits: sent.retransmits,
            stream_frames: sent.stream_frames,
        };
        path.on_sent(len as u64);
        if size != 0 {
            path.in_flight.insert(size, ack_eliciting);
            path.congestion.on_sent(now, u64::from(size), exact_number);
            if let Some(pacer) = path.pacing.as_mut() {
                pacer.on_transmit(size);
            }
        }
        conn.stats.sent += 1;
        conn.stats.sent_bytes += len as u64;

        if let Some(forgotten) = conn.spaces[space_id].sent(exact_number, packet) {
            conn.remove_in_flight(&forgotten);
        }

        if ack_eliciting {
            conn.spaces[space_id].time_of_last_ack_eliciting_packet = Some(now);
            if conn.permit_idle_reset {
                conn.reset_idle_timeout(now);
            }
            conn.permit_idle_reset = false;
            conn.reset_keep_alive(now);
        }
        if size != 0 {
            conn.set_loss_detection_timer(now);
        }
        Some(len)
    }

    /// Encrypt the packet, returning its length and whether padding was added
    pub(super) fn finish(self, conn: &Connection, buf: &mut Vec<u8>) -> Option<(usize, bool)> {
        let start = self.partial_encode.start;
        let Some((header_crypto, packet_crypto)) = conn.local_keys(self.space) else {
            buf.truncate(start);
            return None;
        };
        debug_assert!(buf.len() <= self.max_size, "packet exceeds maximum size");

        let pad = buf.len() < self.min_size;
        if pad {
            trace!(len = self.min_size - buf.len(), "PADDING");
            buf.resize(self.min_size, 0);
        }

        buf.resize(buf.len() + packet_crypto.tag_len(), 0);
        self.partial_encode.finish(
            &mut buf[start..],
            header_crypto,
            Some((self.exact_number, packet_crypto)),
        );

        let len = buf.len() - start;
        trace!(len, short_header = self.short_header, "wrote packet");
        Some((len, pad))
    }
}
