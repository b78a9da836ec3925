//! Acknowledgement processing, loss detection and probe timeouts (RFC 9002)

use std::{
    cmp, mem,
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use super::{
    Connection,
    paths::PathId,
    spaces::SentPacket,
    timer::{ConnTimer, Timer},
};
use crate::{TIMER_GRANULARITY, TransportError, frame, packet::SpaceId};

/// Upper bound on the exponential PTO backoff
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Assumed peer ACK delay while its transport parameters are unknown
const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(25);

impl Connection {
    pub(super) fn on_ack_received(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        ack: frame::Ack,
    ) -> Result<(), TransportError> {
        if ack.largest >= self.spaces[space_id].next_packet_number {
            return Err(TransportError::PROTOCOL_VIOLATION("unsent packet acked"));
        }

        let new_largest = {
            let space = &mut self.spaces[space_id];
            if space.largest_acked_packet.map_or(true, |pn| ack.largest > pn) {
                space.largest_acked_packet = Some(ack.largest);
                if let Some(info) = space.sent_packets.get(&ack.largest) {
                    // A misbehaving peer may acknowledge a packet we forgot; at worst the RTT
                    // sample is skipped
                    space.largest_acked_packet_sent = info.time_sent;
                }
                true
            } else {
                false
            }
        };

        // Only look at packets still awaiting acknowledgement, so huge ranges cost nothing
        let newly_acked = ack
            .iter()
            .flat_map(|range| {
                self.spaces[space_id]
                    .sent_packets
                    .range(range)
                    .map(|(&pn, _)| pn)
            })
            .collect::<Vec<_>>();
        if newly_acked.is_empty() {
            return Ok(());
        }

        let mut ack_eliciting_acked = false;
        let mut largest_path = None;
        let mut acked_paths = Vec::new();
        for &pn in &newly_acked {
            let Some(info) = self.spaces[space_id].take(pn) else {
                continue;
            };
            if let Some(acked) = info.largest_acked {
                // The peer saw our ACK, so it no longer needs these
                self.spaces[space_id].pending_acks.subtract_below(acked);
            }
            ack_eliciting_acked |= info.ack_eliciting;

            let path_id = info.path;
            if pn == ack.largest && path_id.index() < self.paths.len() {
                largest_path = Some(path_id);
            }
            if let Some(path) = self.paths.get_mut(path_id.index()) {
                if path.generation == info.path_generation
                    && path.mtud.on_acked(space_id, pn, info.size)
                {
                    let mtu = path.current_mtu();
                    path.congestion.on_mtu_update(mtu);
                }
            }
            if !acked_paths.contains(&path_id) {
                acked_paths.push(path_id);
            }
            self.on_packet_acked(now, pn, info);
        }

        for path_id in acked_paths {
            let path = &mut self.paths[path_id.index()];
            let largest = (path_id == self.active_path).then_some(ack.largest);
            path.congestion
                .on_end_acks(now, path.in_flight.bytes, path.app_limited, largest);
        }

        if new_largest && ack_eliciting_acked {
            let ack_delay = match space_id {
                SpaceId::Data => cmp::min(
                    self.max_ack_delay(),
                    Duration::from_micros(ack.delay << self.peer_ack_delay_exponent()),
                ),
                _ => Duration::ZERO,
            };
            let rtt = now.saturating_duration_since(self.spaces[space_id].largest_acked_packet_sent);
            if let Some(path_id) = largest_path {
                self.paths[path_id.index()].rtt.update(ack_delay, rtt);
            }
        }

        // Must run before pto_count is reset
        self.detect_lost_packets(now, space_id);

        if self.peer_completed_address_validation() {
            self.pto_count = 0;
        }

        self.set_loss_detection_timer(now);
        Ok(())
    }

    /// Account for the delivery of a single packet
    fn on_packet_acked(&mut self, now: Instant, pn: u64, info: SentPacket) {
        self.remove_in_flight(&info);
        if let Some(path) = self.paths.get_mut(info.path.index()) {
            if path.generation == info.path_generation && info.size != 0 {
                let bytes = u64::from(info.size);
                if info.ack_eliciting {
                    path.congestion
                        .on_ack(now, info.time_sent, bytes, path.app_limited, &path.rtt);
                }
                path.delivery_rate.on_ack(now, bytes, info.delivered);
                path.counters.acked_bytes += bytes;
            }
        }
        trace!(pn, "packet acked");

        let pending = &mut self.spaces[SpaceId::Data].pending;
        if let Some(retransmits) = info.retransmits.get() {
            for (id, _) in retransmits.reset_stream.iter() {
                self.streams.reset_acked(*id, pending);
            }
        }
        for frame in info.stream_frames {
            self.streams.received_ack_of(frame, pending);
        }
    }

    pub(super) fn detect_lost_packets(&mut self, now: Instant, space_id: SpaceId) {
        let Some(largest_acked) = self.spaces[space_id].largest_acked_packet else {
            return;
        };
        let rtt = self.path().rtt.conservative();
        let loss_delay = cmp::max(rtt.mul_f32(self.config.time_threshold), TIMER_GRANULARITY);
        // Packets sent before this time are deemed lost
        let lost_send_time = now.checked_sub(loss_delay);
        let packet_threshold = u64::from(self.config.packet_threshold);

        let mut lost_packets = Vec::<u64>::new();
        let space = &mut self.spaces[space_id];
        space.loss_time = None;
        for (&pn, info) in space.sent_packets.range(0..largest_acked) {
            if lost_send_time.is_some_and(|t| info.time_sent <= t)
                || largest_acked >= pn + packet_threshold
            {
                lost_packets.push(pn);
            } else {
                let next_loss_time = info.time_sent + loss_delay;
                space.loss_time = Some(
                    space
                        .loss_time
                        .map_or(next_loss_time, |x| cmp::min(x, next_loss_time)),
                );
            }
        }

        let Some(&largest_lost) = lost_packets.last() else {
            return;
        };
        let Some((largest_lost_sent, largest_lost_path)) = self.spaces[space_id]
            .sent_packets
            .get(&largest_lost)
            .map(|info| (info.time_sent, info.path))
        else {
            return;
        };
        trace!(?space_id, ?lost_packets, "packets lost");

        let mut lost_bytes = 0;
        let mut lost_paths = Vec::new();
        for pn in lost_packets {
            let Some(info) = self.spaces[space_id].take(pn) else {
                continue;
            };
            self.remove_in_flight(&info);
            lost_bytes += u64::from(info.size);
            self.stats.lost += 1;
            self.stats.lost_bytes += u64::from(info.size);

            if let Some(path) = self.paths.get_mut(info.path.index()) {
                if path.generation == info.path_generation {
                    path.counters.lost += 1;
                    path.counters.lost_bytes += u64::from(info.size);
                    if path.mtud.in_flight_probe() == Some(pn) {
                        path.mtud.on_probe_lost();
                    } else if info.size != 0 {
                        path.mtud.on_non_probe_lost(pn, info.size);
                    }
                    if !lost_paths.contains(&info.path) {
                        lost_paths.push(info.path);
                    }
                }
            }

            let retransmitted =
                !info.stream_frames.is_empty() || !info.retransmits.is_empty(&self.streams);
            if retransmitted {
                self.stats.retrans += 1;
                if let Some(path) = self.paths.get_mut(info.path.index()) {
                    path.counters.retrans += 1;
                }
            }
            for frame in info.stream_frames {
                self.stats.stream_retrans_bytes += frame.offsets.end - frame.offsets.start;
                self.streams.retransmit(frame);
            }
            self.spaces[space_id].pending |= info.retransmits;
        }

        for path_id in lost_paths {
            let path = &mut self.paths[path_id.index()];
            if path.mtud.black_hole_detected(now) {
                let mtu = path.current_mtu();
                path.congestion.on_mtu_update(mtu);
            }
        }

        // Losing only ACKs is no sign of congestion
        if lost_bytes == 0 {
            return;
        }
        let congestion_period =
            self.pto(SpaceId::Data) * self.config.persistent_congestion_threshold;
        let Some(path) = self.paths.get_mut(largest_lost_path.index()) else {
            return;
        };
        // Every packet over a long enough period was lost, judged only once an RTT sample exists
        let in_persistent_congestion = path.rtt.has_sample()
            && largest_lost_sent
                .checked_sub(congestion_period)
                .is_some_and(|t| self.spaces[space_id].largest_acked_packet_sent < t);
        debug!(
            lost_bytes,
            persistent = in_persistent_congestion,
            %largest_lost_path,
            "congestion event"
        );
        path.congestion.on_congestion_event(
            now,
            largest_lost_sent,
            in_persistent_congestion,
            lost_bytes,
        );
    }

    fn loss_time_and_space(&self) -> Option<(Instant, SpaceId)> {
        SpaceId::iter()
            .filter_map(|id| self.spaces[id].loss_time.map(|time| (time, id)))
            .min_by_key(|&(time, _)| time)
    }

    /// Ack-eliciting bytes in flight across all paths
    fn ack_eliciting_in_flight(&self) -> u64 {
        self.paths.iter().map(|path| path.in_flight.ack_eliciting).sum()
    }

    fn pto_time_and_space(&self, now: Instant) -> Option<(Instant, SpaceId)> {
        let backoff = 2u32.pow(cmp::min(self.pto_count, MAX_BACKOFF_EXPONENT));

        if self.ack_eliciting_in_flight() == 0 {
            if self.peer_completed_address_validation() {
                return None;
            }
            // Keep the handshake going when the server is stuck on its amplification budget
            let space = match self.spaces[SpaceId::Handshake].crypto.is_some() {
                true => SpaceId::Handshake,
                false => SpaceId::Initial,
            };
            return Some((now + self.pto(space) * backoff, space));
        }

        SpaceId::iter()
            // Application data isn't probed before the handshake is confirmed
            .filter(|&id| id != SpaceId::Data || self.handshake_confirmed)
            .filter(|&id| self.spaces[id].has_in_flight())
            .filter_map(|id| {
                let sent = self.spaces[id].time_of_last_ack_eliciting_packet?;
                Some((sent + self.pto(id) * backoff, id))
            })
            .min_by_key(|&(time, _)| time)
    }

    /// Whether the peer can no longer be blocked on validating our address
    ///
    /// The server is guaranteed to have validated a client's address once any Handshake or 1-RTT
    /// packet is acknowledged, or once the handshake is confirmed.
    fn peer_completed_address_validation(&self) -> bool {
        if self.side.is_server() || self.state.is_closed() {
            return true;
        }
        self.spaces[SpaceId::Handshake].largest_acked_packet.is_some()
            || self.spaces[SpaceId::Data].largest_acked_packet.is_some()
            || self.handshake_confirmed
    }

    pub(super) fn set_loss_detection_timer(&mut self, now: Instant) {
        if self.state.is_closed() {
            return;
        }
        if let Some((loss_time, _)) = self.loss_time_and_space() {
            self.timers
                .set(Timer::Conn(ConnTimer::LossDetection), loss_time);
            return;
        }

        // A server blocked on its amplification budget can't send a probe anyway
        if self.path().anti_amplification_blocked(1) {
            self.timers.stop(Timer::Conn(ConnTimer::LossDetection));
            return;
        }

        match self.pto_time_and_space(now) {
            Some((timeout, _)) => self
                .timers
                .set(Timer::Conn(ConnTimer::LossDetection), timeout),
            None => self.timers.stop(Timer::Conn(ConnTimer::LossDetection)),
        }
    }

    pub(super) fn on_loss_detection_timeout(&mut self, now: Instant) {
        if let Some((_, space)) = self.loss_time_and_space() {
            // Time threshold loss detection
            self.detect_lost_packets(now, space);
            self.set_loss_detection_timer(now);
            return;
        }

        let (space, probes) = match self.pto_time_and_space(now) {
            // Two probes improve the odds of getting through under loss
            Some((_, space)) if self.ack_eliciting_in_flight() != 0 => (space, 2),
            Some((_, space)) => (space, 1),
            None => {
                self.set_loss_detection_timer(now);
                return;
            }
        };
        trace!(
            in_flight = self.ack_eliciting_in_flight(),
            count = self.pto_count,
            ?space,
            "PTO fired"
        );
        let space = &mut self.spaces[space];
        space.loss_probes = space.loss_probes.saturating_add(probes);
        self.pto_count = self.pto_count.saturating_add(1);
        self.set_loss_detection_timer(now);
    }

    /// Probe timeout for packets in `space` on the active path
    pub(super) fn pto(&self, space: SpaceId) -> Duration {
        let base = self.path().rtt.pto_base();
        match space {
            SpaceId::Data => base + self.max_ack_delay(),
            _ => base,
        }
    }

    /// Probe timeout on `path_id`
    pub(super) fn path_pto(&self, path_id: PathId) -> Duration {
        self.paths
            .get(path_id.index())
            .map_or_else(|| self.pto(SpaceId::Data), |path| path.rtt.pto_base())
            + self.max_ack_delay()
    }

    pub(super) fn max_ack_delay(&self) -> Duration {
        self.peer_params
            .as_ref()
            .map_or(DEFAULT_MAX_ACK_DELAY, |params| {
                Duration::from_millis(params.max_ack_delay.into_inner())
            })
    }

    fn peer_ack_delay_exponent(&self) -> u64 {
        self.peer_params
            .as_ref()
            .map_or(3, |params| params.ack_delay_exponent.into_inner())
    }

    /// Requeue the frames of every packet in flight in `space`, used when keys are abandoned
    pub(super) fn requeue_in_flight(&mut self, space_id: SpaceId) {
        let sent = mem::take(&mut self.spaces[space_id].sent_packets);
        for (_, info) in sent {
            self.remove_in_flight(&info);
            for frame in info.stream_frames {
                self.streams.retransmit(frame);
            }
            self.spaces[space_id].pending |= info.retransmits;
        }
    }
}
