use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::{MAX_UDP_PAYLOAD, packet::SpaceId};

/// How long a completed search stays valid before probing again
const SEARCH_INTERVAL: Duration = Duration::from_secs(600);
/// How long to wait after a black hole before probing again
const BLACK_HOLE_COOLDOWN: Duration = Duration::from_secs(60);
/// Probes of one size sent before that size is considered undeliverable, `MAX_PROBES` in
/// RFC 8899 section 5.1.2
const MAX_PROBE_RETRANSMITS: usize = 3;
/// Suspicious loss bursts tolerated before the MTU falls back to the minimum
const BLACK_HOLE_THRESHOLD: u8 = 3;
/// Searching stops once the next step would change the MTU by less than this
const BINARY_SEARCH_MINIMUM_CHANGE: u16 = 20;

/// Datagram Packetization Layer PMTU Discovery, RFC 8899
///
/// The MTU of a path starts at the 1200 bytes every QUIC path must carry and is only raised when
/// a padded probe of the larger size is acknowledged, so it never exceeds a size known to be
/// deliverable. Sizes are searched by bisection between the current MTU and the smaller of the
/// local limit and the peer's `max_udp_payload_size`.
#[derive(Debug, Clone)]
pub(super) struct MtuDiscovery {
    current_mtu: u16,
    /// Search state, absent when discovery is disabled
    state: Option<Search>,
    black_hole: BlackHoleDetector,
}

impl MtuDiscovery {
    pub(super) fn new(base_mtu: u16, upper_bound: u16, peer_max_udp_payload_size: Option<u16>) -> Self {
        let mut mtud = Self {
            current_mtu: base_mtu,
            state: Some(Search::new(upper_bound)),
            black_hole: BlackHoleDetector::new(base_mtu),
        };
        if let Some(peer_max) = peer_max_udp_payload_size {
            mtud.on_peer_max_udp_payload_size_received(peer_max);
        }
        mtud
    }

    /// The MTU stays fixed at `mtu`
    pub(super) fn disabled(mtu: u16) -> Self {
        Self {
            current_mtu: mtu,
            state: None,
            black_hole: BlackHoleDetector::new(mtu),
        }
    }

    pub(super) fn current_mtu(&self) -> u16 {
        self.current_mtu
    }

    pub(super) fn is_enabled(&self) -> bool {
        self.state.is_some()
    }

    /// Size of the probe to send in the next packet, numbered `next_packet_number`, if any
    pub(super) fn poll_transmit(&mut self, now: Instant, next_packet_number: u64) -> Option<u16> {
        let state = self.state.as_mut()?;
        state.poll_transmit(now, self.current_mtu, next_packet_number)
    }

    pub(super) fn on_peer_max_udp_payload_size_received(&mut self, peer_max: u16) {
        self.current_mtu = self.current_mtu.min(peer_max);
        if let Some(state) = self.state.as_mut() {
            state.peer_max_udp_payload_size = peer_max;
        }
    }

    /// Forget the outcome of earlier searches and probe again from the current MTU
    pub(super) fn restart(&mut self) {
        if let Some(state) = self.state.as_mut() {
            debug!(current_mtu = self.current_mtu, "restarting PMTU discovery");
            state.phase = Phase::Idle;
        }
    }

    /// Returns `true` if the acknowledged packet was the in-flight probe
    pub(super) fn on_acked(&mut self, space: SpaceId, packet_number: u64, packet_bytes: u16) -> bool {
        if space != SpaceId::Data {
            return false;
        }
        match self
            .state
            .as_mut()
            .and_then(|state| state.on_probe_acked(packet_number))
        {
            Some(new_mtu) => {
                self.current_mtu = new_mtu;
                debug!(current_mtu = self.current_mtu, "raised path MTU");
                self.black_hole.on_probe_acked();
                true
            }
            None => {
                self.black_hole
                    .on_non_probe_acked(self.current_mtu, packet_number, packet_bytes);
                false
            }
        }
    }

    pub(super) fn in_flight_probe(&self) -> Option<u64> {
        match self.state {
            Some(Search {
                phase: Phase::Searching(ref bisect),
                ..
            }) => bisect.in_flight_probe,
            _ => None,
        }
    }

    pub(super) fn on_probe_lost(&mut self) {
        if let Some(state) = self.state.as_mut() {
            if let Phase::Searching(ref mut bisect) = state.phase {
                bisect.in_flight_probe = None;
                bisect.lost_probe_count += 1;
            }
        }
    }

    /// Feed a lost non-probe packet to the black hole detector
    ///
    /// A batch of losses must be followed by [`Self::black_hole_detected`] to close the burst.
    pub(super) fn on_non_probe_lost(&mut self, packet_number: u64, packet_bytes: u16) {
        self.black_hole.on_non_probe_lost(packet_number, packet_bytes);
    }

    /// Returns `true`, and falls back to the base MTU, if the last losses revealed a black hole
    pub(super) fn black_hole_detected(&mut self, now: Instant) -> bool {
        if !self.black_hole.black_hole_detected() {
            return false;
        }
        debug!(
            from = self.current_mtu,
            to = self.black_hole.base_mtu,
            "black hole detected, resetting path MTU"
        );
        self.current_mtu = self.black_hole.base_mtu;
        if let Some(state) = self.state.as_mut() {
            state.phase = Phase::Complete(now + BLACK_HOLE_COOLDOWN);
        }
        true
    }
}

#[derive(Debug, Clone)]
struct Search {
    phase: Phase,
    /// Largest size the local endpoint is willing to send
    upper_bound: u16,
    peer_max_udp_payload_size: u16,
}

impl Search {
    fn new(upper_bound: u16) -> Self {
        Self {
            phase: Phase::Idle,
            upper_bound,
            peer_max_udp_payload_size: MAX_UDP_PAYLOAD,
        }
    }

    fn poll_transmit(
        &mut self,
        now: Instant,
        current_mtu: u16,
        next_packet_number: u64,
    ) -> Option<u16> {
        match self.phase {
            Phase::Complete(next_search) if now < next_search => return None,
            Phase::Idle | Phase::Complete(_) => {
                self.phase = Phase::Searching(Bisection::new(
                    current_mtu,
                    self.upper_bound.min(self.peer_max_udp_payload_size),
                ));
            }
            Phase::Searching(_) => {}
        }

        let Phase::Searching(ref mut bisect) = self.phase else {
            return None;
        };
        if bisect.in_flight_probe.is_some() {
            return None;
        }

        // Retry a lost probe of the same size a few times before giving up on it
        if 0 < bisect.lost_probe_count && bisect.lost_probe_count < MAX_PROBE_RETRANSMITS {
            bisect.in_flight_probe = Some(next_packet_number);
            return Some(bisect.last_probed_mtu);
        }

        let last_probe_succeeded = bisect.lost_probe_count == 0;
        bisect.lost_probe_count = 0;
        match bisect.next_mtu_to_probe(last_probe_succeeded) {
            Some(size) => {
                trace!(size, "probing path MTU");
                bisect.in_flight_probe = Some(next_packet_number);
                bisect.last_probed_mtu = size;
                Some(size)
            }
            None => {
                self.phase = Phase::Complete(now + SEARCH_INTERVAL);
                None
            }
        }
    }

    /// Returns the probed size if `packet_number` was the in-flight probe
    fn on_probe_acked(&mut self, packet_number: u64) -> Option<u16> {
        match self.phase {
            Phase::Searching(ref mut bisect) if bisect.in_flight_probe == Some(packet_number) => {
                bisect.in_flight_probe = None;
                bisect.lost_probe_count = 0;
                Some(bisect.last_probed_mtu)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// No search has started, or a restart was requested
    Idle,
    Searching(Bisection),
    /// Searching finished; a new search starts at the given time
    Complete(Instant),
}

#[derive(Debug, Clone, Copy)]
struct Bisection {
    lower_bound: u16,
    upper_bound: u16,
    last_probed_mtu: u16,
    in_flight_probe: Option<u64>,
    /// Lost probes of `last_probed_mtu`
    lost_probe_count: usize,
}

impl Bisection {
    fn new(current_mtu: u16, upper_bound: u16) -> Self {
        let lower_bound = current_mtu.min(upper_bound);
        Self {
            lower_bound,
            upper_bound: upper_bound.max(lower_bound),
            // The current MTU counts as already probed
            last_probed_mtu: lower_bound,
            in_flight_probe: None,
            lost_probe_count: 0,
        }
    }

    fn next_mtu_to_probe(&mut self, last_probe_succeeded: bool) -> Option<u16> {
        if last_probe_succeeded {
            self.lower_bound = self.last_probed_mtu;
        } else {
            self.upper_bound = self.last_probed_mtu - 1;
        }

        let next = ((u32::from(self.lower_bound) + u32::from(self.upper_bound)) / 2) as u16;
        if next.abs_diff(self.last_probed_mtu) >= BINARY_SEARCH_MINIMUM_CHANGE {
            return Some(next);
        }
        // Bisection alone never reaches a distant upper bound; try it directly once
        if self.upper_bound.saturating_sub(self.last_probed_mtu) >= BINARY_SEARCH_MINIMUM_CHANGE {
            return Some(self.upper_bound);
        }
        None
    }
}

/// Detects a drop in the path MTU from bursts of lost packets larger than the base MTU
///
/// A burst is a run of consecutively numbered packets declared lost together. It is suspicious
/// when every packet in it exceeds the base MTU and no MTU-sized packet sent after them has been
/// acknowledged.
#[derive(Debug, Clone)]
struct BlackHoleDetector {
    suspicious_loss_bursts: u8,
    burst_has_small_packets: bool,
    largest_suspicious_lost: Option<u64>,
    largest_non_probe_lost: Option<u64>,
    largest_acked_mtu_sized: Option<u64>,
    /// Size the path is guaranteed to carry
    base_mtu: u16,
}

impl BlackHoleDetector {
    fn new(base_mtu: u16) -> Self {
        Self {
            suspicious_loss_bursts: 0,
            burst_has_small_packets: false,
            largest_suspicious_lost: None,
            largest_non_probe_lost: None,
            largest_acked_mtu_sized: None,
            base_mtu,
        }
    }

    fn on_probe_acked(&mut self) {
        self.suspicious_loss_bursts = 0;
    }

    fn on_non_probe_acked(&mut self, current_mtu: u16, packet_number: u64, packet_bytes: u16) {
        if packet_bytes >= current_mtu
            && self
                .largest_acked_mtu_sized
                .map_or(true, |pn| packet_number > pn)
        {
            self.suspicious_loss_bursts = 0;
            self.largest_acked_mtu_sized = Some(packet_number);
        }
    }

    fn on_non_probe_lost(&mut self, packet_number: u64, packet_bytes: u16) {
        if self
            .largest_non_probe_lost
            .map_or(true, |prev| packet_number != prev + 1)
        {
            self.finish_loss_burst();
        }
        if packet_bytes <= self.base_mtu {
            self.burst_has_small_packets = true;
        } else {
            self.largest_suspicious_lost = Some(packet_number);
        }
        self.largest_non_probe_lost = Some(packet_number);
    }

    fn black_hole_detected(&mut self) -> bool {
        self.finish_loss_burst();
        if self.suspicious_loss_bursts <= BLACK_HOLE_THRESHOLD {
            return false;
        }
        self.suspicious_loss_bursts = 0;
        self.largest_acked_mtu_sized = None;
        true
    }

    fn finish_loss_burst(&mut self) {
        let acked = self.largest_acked_mtu_sized.unwrap_or(0);
        let suspicious = !self.burst_has_small_packets
            && self
                .largest_suspicious_lost
                .is_some_and(|lost| lost >= acked);
        if suspicious {
            self.suspicious_loss_bursts = self.suspicious_loss_bursts.saturating_add(1);
        }
        self.burst_has_small_packets = false;
        self.largest_suspicious_lost = None;
        self.largest_non_probe_lost = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a search to completion over a link carrying at most `link_limit` bytes
    fn drive_to_completion(mtud: &mut MtuDiscovery, now: Instant, link_limit: u16) -> Vec<u16> {
        let mut probed = Vec::new();
        for pn in 1..100 {
            let Some(size) = mtud.poll_transmit(now, pn) else {
                break;
            };
            probed.push(size);
            if size <= link_limit {
                assert!(mtud.on_acked(SpaceId::Data, pn, size));
            } else {
                mtud.on_probe_lost();
            }
        }
        probed
    }

    #[test]
    fn search_converges_below_link_limit() {
        let mut mtud = MtuDiscovery::new(1200, 1452, None);
        let probed = drive_to_completion(&mut mtud, Instant::now(), 1400);
        assert_eq!(probed[0], 1326);
        let mtu = mtud.current_mtu();
        assert!(mtu <= 1400 && mtu > 1400 - BINARY_SEARCH_MINIMUM_CHANGE, "{mtu}");
        // Never larger than an acknowledged probe
        assert!(probed.iter().any(|&size| size == mtu));
    }

    #[test]
    fn reaches_upper_bound_when_link_allows() {
        let mut mtud = MtuDiscovery::new(1200, 1452, None);
        drive_to_completion(&mut mtud, Instant::now(), 1500);
        assert_eq!(mtud.current_mtu(), 1452);
    }

    #[test]
    fn peer_limit_caps_search() {
        let mut mtud = MtuDiscovery::new(1200, 1452, Some(1300));
        let probed = drive_to_completion(&mut mtud, Instant::now(), 1500);
        assert!(probed.iter().all(|&size| size <= 1300));
        assert_eq!(mtud.current_mtu(), 1300);
    }

    #[test]
    fn disabled_never_probes() {
        let mut mtud = MtuDiscovery::disabled(1200);
        assert_eq!(mtud.poll_transmit(Instant::now(), 0), None);
        assert!(!mtud.is_enabled());
    }

    #[test]
    fn lost_probe_is_retried_before_shrinking() {
        let now = Instant::now();
        let mut mtud = MtuDiscovery::new(1200, 1452, None);
        let first = mtud.poll_transmit(now, 1).unwrap();
        assert_eq!(mtud.in_flight_probe(), Some(1));
        assert_eq!(mtud.poll_transmit(now, 2), None);
        mtud.on_probe_lost();
        assert_eq!(mtud.poll_transmit(now, 3), Some(first));
        mtud.on_probe_lost();
        assert_eq!(mtud.poll_transmit(now, 4), Some(first));
        mtud.on_probe_lost();
        let next = mtud.poll_transmit(now, 5).unwrap();
        assert!(next < first);
        assert_eq!(mtud.current_mtu(), 1200);
    }

    #[test]
    fn restart_probes_again() {
        let now = Instant::now();
        let mut mtud = MtuDiscovery::new(1200, 1452, None);
        drive_to_completion(&mut mtud, now, 1500);
        assert_eq!(mtud.poll_transmit(now, 50), None);
        mtud.restart();
        mtud.black_hole_detected(now);
        // The search resumes from the current MTU, which is already at the upper bound
        assert_eq!(mtud.poll_transmit(now, 51), None);

        let mut mtud = MtuDiscovery::new(1200, 1452, None);
        drive_to_completion(&mut mtud, now, 1300);
        let mtu = mtud.current_mtu();
        mtud.restart();
        assert!(mtud.poll_transmit(now, 60).is_some_and(|size| size > mtu));
    }

    #[test]
    fn black_hole_resets_mtu() {
        let now = Instant::now();
        let mut mtud = MtuDiscovery::new(1200, 1452, None);
        drive_to_completion(&mut mtud, now, 1500);
        assert_eq!(mtud.current_mtu(), 1452);

        // Four separate bursts of large packets
        for pn in [10, 20, 30, 40] {
            mtud.on_non_probe_lost(pn, 1452);
            mtud.on_non_probe_lost(pn + 1, 1452);
        }
        assert!(mtud.black_hole_detected(now));
        assert_eq!(mtud.current_mtu(), 1200);
        // Cooling down
        assert_eq!(mtud.poll_transmit(now, 100), None);
        assert!(mtud.poll_transmit(now + BLACK_HOLE_COOLDOWN, 101).is_some());
    }

    #[test]
    fn small_packet_losses_are_congestion() {
        let now = Instant::now();
        let mut mtud = MtuDiscovery::new(1200, 1452, None);
        drive_to_completion(&mut mtud, now, 1500);
        for pn in [10, 20, 30, 40, 50] {
            mtud.on_non_probe_lost(pn, 1452);
            mtud.on_non_probe_lost(pn + 1, 200);
        }
        assert!(!mtud.black_hole_detected(now));
        assert_eq!(mtud.current_mtu(), 1452);
    }
}
