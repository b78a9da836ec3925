//! Assembly of outgoing datagrams

use std::{cmp, mem, time::Instant};

use tracing::{trace, trace_span};

use super::{
    BufferTooShort, Connection, SendInfo,
    packet_builder::PacketBuilder,
    paths::PathId,
    spaces::{SendableFrames, ThinRetransmits},
    state::State,
    timer::{ConnTimer, PathTimer, Timer},
};
use crate::{
    MIN_INITIAL_SIZE, TransportError,
    coding::BufMutExt,
    frame::{self, Close, FrameStruct, FrameType},
    packet::SpaceId,
};

/// Frames written into a packet, kept for loss recovery
#[derive(Debug, Default)]
pub(super) struct SentFrames {
    pub(super) retransmits: ThinRetransmits,
    /// Largest packet number acknowledged by an ACK frame in the packet
    pub(super) largest_acked: Option<u64>,
    pub(super) stream_frames: frame::StreamMetaVec,
    /// Whether the packet contains frames that elicit an acknowledgement
    pub(super) ack_eliciting: bool,
}

/// Smallest room worth starting another coalesced packet for
const MIN_COALESCE_ROOM: usize = 48;

/// Frame type and sequence number
const RETIRE_CONNECTION_ID_SIZE_BOUND: usize = 1 + 8;

impl Connection {
    /// Write the next datagram to send into `out`
    ///
    /// Returns the length of the datagram and where to send it, or `Ok(None)` once there is
    /// nothing left to send; call again after every `recv`,
    /// `on_timeout` and application call until then. `out` must be able to hold at least
    /// 1200 bytes.
    pub fn send(
        &mut self,
        out: &mut [u8],
        now: Instant,
    ) -> Result<Option<(usize, SendInfo)>, BufferTooShort> {
        let _span = trace_span!("poll_transmit", side = ?self.side).entered();
        if matches!(self.state, State::Draining | State::Drained) {
            return Ok(None);
        }
        if out.len() < usize::from(MIN_INITIAL_SIZE) {
            return Err(BufferTooShort);
        }
        if let State::Closed(ref closed) = self.state {
            let reason = closed.reason.clone();
            return Ok(self.send_close(out, now, reason));
        }
        if self.crypto.is_none() {
            // A server hasn't heard from the client yet
            return Ok(None);
        }
        if let Some(sent) = self.send_path_probe(out, now) {
            return Ok(Some(sent));
        }
        Ok(self.send_active(out, now))
    }

    /// Write a CONNECTION_CLOSE in every space we have keys for
    fn send_close(&mut self, out: &mut [u8], now: Instant, reason: Close) -> Option<(usize, SendInfo)> {
        if self.timers.get(Timer::Conn(ConnTimer::Close)).is_none() {
            self.set_close_timer(now);
        }
        if !mem::take(&mut self.close_pending) {
            return None;
        }

        let path_id = self.active_path;
        let max = self.datagram_max(path_id, out.len());
        let spaces = SpaceId::iter()
            .filter(|&space| match space {
                SpaceId::Data => self.spaces[space].crypto.is_some(),
                _ => self.local_keys(space).is_some(),
            })
            .collect::<Vec<_>>();
        let has_initial = spaces.contains(&SpaceId::Initial);

        let mut buf = Vec::with_capacity(max);
        for (i, &space_id) in spaces.iter().enumerate() {
            let dcid = self.path_dcid(path_id);
            let Some(mut builder) =
                PacketBuilder::new(space_id, path_id, dcid, &mut buf, 0, max, false, self)
            else {
                break;
            };
            let max_len = builder.frame_space_remaining(&buf);
            match reason {
                // Application errors stay confidential until 1-RTT keys are in use
                Close::Application(_) if space_id != SpaceId::Data => {
                    Close::from(TransportError::APPLICATION_ERROR("")).encode(&mut buf, max_len)
                }
                _ => reason.encode(&mut buf, max_len),
            }
            if i + 1 == spaces.len() && has_initial && self.side.is_client() {
                builder.pad_to(MIN_INITIAL_SIZE);
            }
            builder.finish_and_track(now, self, &mut buf, SentFrames::default());
        }

        trace!(len = buf.len(), "sending CONNECTION_CLOSE");
        self.emit(out, &buf, path_id, now)
    }

    /// Send a datagram validating a path other than the active one, if one is due
    fn send_path_probe(&mut self, out: &mut [u8], now: Instant) -> Option<(usize, SendInfo)> {
        self.spaces[SpaceId::Data].crypto.as_ref()?;
        let path_id = (0..self.paths.len()).map(PathId::new).find(|&id| {
            let path = &self.paths[id.index()];
            id != self.active_path && path.has_probing_frames()
        })?;

        let max = self.datagram_max(path_id, out.len());
        let dcid = self.path_dcid(path_id);
        let mut buf = Vec::with_capacity(max);
        // Without room for a packet the frames stay queued until the path's budget grows
        let mut builder =
            PacketBuilder::new(SpaceId::Data, path_id, dcid, &mut buf, 0, max, true, self)?;
        self.write_path_frames(now, path_id, &mut builder, &mut buf);
        // Probes are padded so the path is known to carry full-sized datagrams
        builder.pad_to(MIN_INITIAL_SIZE);
        let sent = SentFrames {
            ack_eliciting: true,
            ..SentFrames::default()
        };
        builder.finish_and_track(now, self, &mut buf, sent);
        trace!(%path_id, len = buf.len(), "sending path probe");
        self.emit(out, &buf, path_id, now)
    }

    /// Fill a datagram for the active path, coalescing packets of several spaces
    fn send_active(&mut self, out: &mut [u8], now: Instant) -> Option<(usize, SendInfo)> {
        let path_id = self.active_path;
        let max = self.datagram_max(path_id, out.len());

        for space_id in SpaceId::iter() {
            let space = &mut self.spaces[space_id];
            space.maybe_queue_probe(&self.streams);
            space.pending_acks.maybe_ack_non_eliciting();
        }

        let probing = SpaceId::iter().any(|id| self.spaces[id].loss_probes > 0);
        let blocked = !probing && self.congestion_or_pacing_blocked(path_id, now);

        let mut buf = Vec::with_capacity(max);
        let mut pending: Option<(PacketBuilder, SentFrames)> = None;
        let mut pad_datagram = false;
        let mut discard_initial = false;

        for space_id in SpaceId::iter() {
            if self.local_keys(space_id).is_none() {
                continue;
            }
            let mut can_send = self.space_can_send(space_id, path_id);
            if blocked {
                can_send.other = false;
            }
            if can_send.is_empty() {
                continue;
            }

            if let Some((builder, sent)) = pending.take() {
                if builder.predicted_end(&buf) + MIN_COALESCE_ROOM > max {
                    pending = Some((builder, sent));
                    break;
                }
                builder.finish_and_track(now, self, &mut buf, sent);
            }

            let dcid = self.path_dcid(path_id);
            let Some(mut builder) = PacketBuilder::new(
                space_id,
                path_id,
                dcid,
                &mut buf,
                0,
                max,
                can_send.other,
                self,
            ) else {
                break;
            };
            let sent = self.populate_packet(now, space_id, path_id, &mut builder, &mut buf, can_send);
            if builder.is_empty(&buf) {
                builder.abandon(&mut buf);
                continue;
            }

            builder.ack_eliciting = sent.ack_eliciting;
            if sent.ack_eliciting {
                let space = &mut self.spaces[space_id];
                space.loss_probes = space.loss_probes.saturating_sub(1);
            }
            if space_id == SpaceId::Initial && (self.side.is_client() || sent.ack_eliciting) {
                pad_datagram = true;
            }
            if space_id == SpaceId::Handshake
                && self.side.is_client()
                && self.spaces[SpaceId::Initial].crypto.is_some()
            {
                // A client stops sending Initial packets once it sends a Handshake packet
                discard_initial = true;
            }
            let short_header = builder.short_header;
            pending = Some((builder, sent));
            if short_header {
                // Nothing can follow a short-header packet in a datagram
                break;
            }
        }

        if let Some((mut builder, sent)) = pending {
            if pad_datagram {
                builder.pad_to(MIN_INITIAL_SIZE);
            }
            builder.finish_and_track(now, self, &mut buf, sent);
        }
        if discard_initial {
            self.discard_space(now, SpaceId::Initial);
        }

        if buf.is_empty() && !blocked {
            self.write_mtu_probe(now, path_id, out.len(), &mut buf);
        }

        let path = &mut self.paths[path_id.index()];
        path.app_limited = !blocked && buf.len() < max;
        if buf.is_empty() {
            return None;
        }
        self.emit(out, &buf, path_id, now)
    }

    /// Largest datagram that may be sent on `path_id` right now
    fn datagram_max(&self, path_id: PathId, out_len: usize) -> usize {
        let path = &self.paths[path_id.index()];
        let budget = usize::try_from(path.amplification_budget()).unwrap_or(usize::MAX);
        cmp::min(cmp::min(out_len, usize::from(path.current_mtu())), budget)
    }

    fn congestion_or_pacing_blocked(&mut self, path_id: PathId, now: Instant) -> bool {
        let path = &mut self.paths[path_id.index()];
        if path.congestion_blocked() {
            trace!(
                in_flight = path.in_flight.bytes,
                window = path.congestion.window(),
                "congestion blocked"
            );
            return true;
        }
        let mtu = path.current_mtu();
        let window = path.congestion.window();
        let rate = path.congestion.pacing_rate();
        let smoothed_rtt = path.rtt.get();
        let Some(pacer) = path.pacing.as_mut() else {
            return false;
        };
        match pacer.delay(smoothed_rtt, u64::from(mtu), mtu, window, rate, now) {
            Some(delay) => {
                trace!(?delay, "pacing");
                self.timers
                    .set(Timer::PerPath(path_id, PathTimer::Pacing), delay);
                true
            }
            None => false,
        }
    }

    fn space_can_send(&self, space_id: SpaceId, path_id: PathId) -> SendableFrames {
        let space = &self.spaces[space_id];
        let mut can_send = space.can_send(&self.streams);
        if space_id != SpaceId::Data {
            return can_send;
        }
        if space.crypto.is_none() {
            // 0-RTT packets carry no acknowledgements
            can_send.acks = false;
        }
        let path = &self.paths[path_id.index()];
        can_send.other |= self.streams.can_send_stream_data()
            || self.streams.has_blocked_frames()
            || !self.dgram_send.is_empty()
            || (space.crypto.is_some() && path.has_probing_frames());
        can_send
    }

    /// Write the frames of one packet, in priority order
    fn populate_packet(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        path_id: PathId,
        builder: &mut PacketBuilder,
        buf: &mut Vec<u8>,
        can_send: SendableFrames,
    ) -> SentFrames {
        let mut sent = SentFrames::default();
        let is_0rtt = space_id == SpaceId::Data && self.spaces[SpaceId::Data].crypto.is_none();
        let is_1rtt = space_id == SpaceId::Data && !is_0rtt;

        // ACK
        let space = &mut self.spaces[space_id];
        if !is_0rtt
            && !space.pending_acks.ranges().is_empty()
            && (can_send.acks || can_send.other)
        {
            let ranges = space.pending_acks.ranges();
            let bound = 1 + 8 * 4 + ranges.len() * 16;
            if bound <= builder.frame_space_remaining(buf) {
                let delay = match space_id {
                    SpaceId::Data => {
                        let micros = space.pending_acks.ack_delay(now).as_micros();
                        u64::try_from(micros).unwrap_or(u64::MAX) >> self.config.ack_delay_exponent
                    }
                    _ => 0,
                };
                trace!(?ranges, delay, "ACK");
                frame::Ack::encode(delay, ranges, buf);
                sent.largest_acked = ranges.max();
                space.pending_acks.acks_sent();
                if space_id == SpaceId::Data {
                    self.timers.stop(Timer::Conn(ConnTimer::MaxAckDelay));
                }
            }
        }
        if !can_send.other {
            return sent;
        }
        let eliciting_start = buf.len();

        // HANDSHAKE_DONE
        let space = &mut self.spaces[space_id];
        if is_1rtt && mem::take(&mut space.pending.handshake_done) {
            trace!("HANDSHAKE_DONE");
            buf.write(FrameType::HANDSHAKE_DONE);
            sent.retransmits.get_or_create().handshake_done = true;
        }

        // PING
        if mem::take(&mut space.ping_pending) {
            trace!("PING");
            buf.write(FrameType::PING);
        }

        // PATH_CHALLENGE, PATH_RESPONSE
        if is_1rtt {
            self.write_path_frames(now, path_id, builder, buf);
        }

        // CRYPTO
        while !is_0rtt && builder.frame_space_remaining(buf) > frame::Crypto::SIZE_BOUND {
            let space = &mut self.spaces[space_id];
            let Some(mut frame) = space.pending.crypto.pop_front() else {
                break;
            };
            let room = builder.frame_space_remaining(buf) - frame::Crypto::SIZE_BOUND;
            let len = cmp::min(frame.data.len(), room);
            let data = frame.data.split_to(len);
            let truncated = frame::Crypto {
                offset: frame.offset,
                data,
            };
            trace!(off = truncated.offset, len, "CRYPTO");
            truncated.encode(buf);
            sent.retransmits.get_or_create().crypto.push_back(truncated);
            if !frame.data.is_empty() {
                frame.offset += len as u64;
                space.pending.crypto.push_front(frame);
            }
        }

        if space_id == SpaceId::Data {
            let max_size = builder.max_size;
            // RESET_STREAM, STOP_SENDING, MAX_DATA, MAX_STREAM_DATA, MAX_STREAMS, *_BLOCKED
            self.streams.write_control_frames(
                buf,
                &mut self.spaces[SpaceId::Data].pending,
                &mut sent.retransmits,
                max_size,
            );

            let pending = &mut self.spaces[SpaceId::Data].pending;
            // NEW_CONNECTION_ID
            while is_1rtt && buf.len() + frame::NewConnectionId::SIZE_BOUND < max_size {
                let Some(issued) = pending.new_cids.pop() else {
                    break;
                };
                trace!(sequence = issued.sequence, id = %issued.id, "NEW_CONNECTION_ID");
                issued.frame(0).encode(buf);
                sent.retransmits.get_or_create().new_cids.push(issued);
            }

            // RETIRE_CONNECTION_ID
            while is_1rtt && buf.len() + RETIRE_CONNECTION_ID_SIZE_BOUND < max_size {
                let Some(sequence) = pending.retire_cids.pop() else {
                    break;
                };
                trace!(sequence, "RETIRE_CONNECTION_ID");
                buf.write(FrameType::RETIRE_CONNECTION_ID);
                buf.write_var(sequence);
                sent.retransmits.get_or_create().retire_cids.push(sequence);
            }

            // DATAGRAM
            while let Some(len) = self.dgram_send.peek_len() {
                let size = 1 + crate::VarInt::saturating(len as u64).size() + len;
                if buf.len() + size <= max_size {
                    let Some(data) = self.dgram_send.pop() else {
                        break;
                    };
                    trace!(len, "DATAGRAM");
                    frame::Datagram { data }.encode(true, buf);
                    continue;
                }
                if size > builder.capacity() {
                    // The path MTU shrank below the datagram's size
                    trace!(len, "dropping oversized datagram");
                    self.dgram_send.pop();
                    continue;
                }
                break;
            }

            // STREAM
            sent.stream_frames = self.streams.write_stream_frames(buf, max_size);
        }

        sent.ack_eliciting = buf.len() > eliciting_start;
        sent
    }

    /// Write a pending PATH_CHALLENGE and PATH_RESPONSE for `path_id`
    fn write_path_frames(
        &mut self,
        now: Instant,
        path_id: PathId,
        builder: &PacketBuilder,
        buf: &mut Vec<u8>,
    ) {
        let challenge_lost = now + self.path_pto(path_id);
        let path = &mut self.paths[path_id.index()];
        if path.challenge_pending && builder.frame_space_remaining(buf) > 9 {
            if let Some(&token) = path.challenges.last() {
                trace!(token, %path_id, "PATH_CHALLENGE");
                buf.write(FrameType::PATH_CHALLENGE);
                buf.write(token);
                path.challenge_pending = false;
                self.timers.set(
                    Timer::PerPath(path_id, PathTimer::PathChallengeLost),
                    challenge_lost,
                );
            }
        }
        let path = &mut self.paths[path_id.index()];
        if builder.frame_space_remaining(buf) > 9 {
            if let Some(token) = path.pending_response.take() {
                trace!(token, %path_id, "PATH_RESPONSE");
                buf.write(FrameType::PATH_RESPONSE);
                buf.write(token);
            }
        }
    }

    /// Probe for a larger path MTU with a padded PING
    fn write_mtu_probe(&mut self, now: Instant, path_id: PathId, out_len: usize, buf: &mut Vec<u8>) {
        if !self.state.is_established() || self.spaces[SpaceId::Data].crypto.is_none() {
            return;
        }
        let next_pn = self.spaces[SpaceId::Data].next_packet_number;
        let path = &mut self.paths[path_id.index()];
        if !path.is_validated() {
            return;
        }
        let Some(probe_size) = path.mtud.poll_transmit(now, next_pn) else {
            return;
        };
        let probe_size = usize::from(probe_size);
        if probe_size > out_len || path.in_flight.bytes + probe_size as u64 > path.congestion.window() {
            return;
        }

        let dcid = self.path_dcid(path_id);
        let Some(mut builder) =
            PacketBuilder::new(SpaceId::Data, path_id, dcid, buf, 0, probe_size, true, self)
        else {
            return;
        };
        trace!(probe_size, "sending MTU probe");
        buf.write(FrameType::PING);
        builder.pad_to(probe_size as u16);
        let sent = SentFrames {
            ack_eliciting: true,
            ..SentFrames::default()
        };
        builder.finish_and_track(now, self, buf, sent);
    }

    /// Copy a finished datagram to the caller's buffer
    fn emit(
        &self,
        out: &mut [u8],
        buf: &[u8],
        path_id: PathId,
        now: Instant,
    ) -> Option<(usize, SendInfo)> {
        if buf.is_empty() {
            return None;
        }
        let dst = out.get_mut(..buf.len())?;
        dst.copy_from_slice(buf);
        let path = &self.paths[path_id.index()];
        let info = SendInfo {
            from: path.local,
            to: path.peer,
            at: now,
        };
        Some((buf.len(), info))
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv6Addr, SocketAddr};

    use super::*;
    use crate::{
        connection::paths::PathData,
        tests::util::{DATAGRAM_BUDGET, Pair},
    };

    #[test]
    fn path_frames_wait_for_amplification_budget() {
        let mut pair = Pair::default_pair();
        pair.connect();
        let now = pair.time;
        let server = pair.server();
        let local = server.path().local;
        let peer = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 50_000);
        let mut path = PathData::new(local, peer, 1, &server.config, None, now);
        path.amplification_limited = true;
        path.start_validation(42);
        path.pending_response = Some(7);
        server.paths.push(path);
        let path_id = PathId::new(server.paths.len() - 1);

        // Nothing received on the path yet, so nothing may be sent on it
        let mut out = [0; DATAGRAM_BUDGET];
        assert!(server.send_path_probe(&mut out, now).is_none());
        let path = &server.paths[path_id.index()];
        assert!(path.challenge_pending);
        assert_eq!(path.pending_response, Some(7));

        server.paths[path_id.index()].on_received(1200);
        let (len, info) = server.send_path_probe(&mut out, now).unwrap();
        assert!(len > 0);
        assert_eq!(info.to, peer);
        assert!(!server.paths[path_id.index()].has_probing_frames());
    }
}
