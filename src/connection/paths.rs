use std::{
    cmp, fmt,
    net::SocketAddr,
    time::{Duration, Instant},
};

use super::{mtud::MtuDiscovery, pacing::Pacer};
use crate::{TIMER_GRANULARITY, config::TransportConfig, congestion};

/// Index of a path within a connection
///
/// Slots of failed paths may be reused; [`PathData::generation`] tells incarnations apart.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct PathId(u8);

impl PathId {
    pub(crate) fn new(index: usize) -> Self {
        debug_assert!(index <= usize::from(u8::MAX));
        Self(index as u8)
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path {}", self.0)
    }
}

/// Validation state of a network path
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PathState {
    /// No validation has been attempted
    Unvalidated,
    /// A PATH_CHALLENGE is outstanding
    Validating,
    /// The peer proved it is reachable over this path
    Validated,
    /// Validation timed out
    Failed,
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Unvalidated => "unvalidated",
            Self::Validating => "validating",
            Self::Validated => "validated",
            Self::Failed => "failed",
        })
    }
}

/// Outstanding PATH_CHALLENGE tokens kept per path
const MAX_CHALLENGES: usize = 4;

/// Description of a particular network path
pub(super) struct PathData {
    pub(super) local: SocketAddr,
    pub(super) peer: SocketAddr,
    /// Distinguishes successive paths occupying the same slot
    pub(super) generation: u64,
    pub(super) state: PathState,
    pub(super) active: bool,
    /// Whether the peer's address on this path is unproven, limiting egress to 3x ingress
    pub(super) amplification_limited: bool,
    pub(super) rtt: RttEstimator,
    pub(super) congestion: Box<dyn congestion::Controller>,
    /// Pacing state, absent when pacing is disabled
    pub(super) pacing: Option<Pacer>,
    pub(super) mtud: MtuDiscovery,
    pub(super) in_flight: InFlight,
    pub(super) delivery_rate: DeliveryRate,
    /// Sequence number of the peer-issued CID used on this path
    pub(super) dcid_seq: Option<u64>,
    /// Tokens of PATH_CHALLENGE frames we sent and are awaiting responses for
    pub(super) challenges: Vec<u64>,
    /// Whether a PATH_CHALLENGE should be sent
    pub(super) challenge_pending: bool,
    /// Token of a PATH_CHALLENGE received on this path that still needs a response
    pub(super) pending_response: Option<u64>,
    /// Path to return to if validation of this one fails
    pub(super) fallback: Option<PathId>,
    /// Whether the last transmission found nothing to send with congestion window to spare
    pub(super) app_limited: bool,
    /// UDP payload bytes received on this path
    pub(super) total_recvd: u64,
    /// UDP payload bytes sent on this path
    pub(super) total_sent: u64,
    pub(super) counters: PathCounters,
}

impl PathData {
    pub(super) fn new(
        local: SocketAddr,
        peer: SocketAddr,
        generation: u64,
        config: &TransportConfig,
        peer_max_udp_payload_size: Option<u16>,
        now: Instant,
    ) -> Self {
        let base_mtu = crate::INITIAL_MTU;
        let congestion = config.congestion_controller(now, base_mtu);
        let mtud = if config.discover_pmtu {
            MtuDiscovery::new(
                base_mtu,
                config.max_send_udp_payload_size,
                peer_max_udp_payload_size,
            )
        } else {
            MtuDiscovery::disabled(base_mtu)
        };
        let pacing = config.pacing.then(|| {
            Pacer::new(
                config.max_pacing_rate,
                Duration::ZERO,
                congestion.initial_window(),
                base_mtu,
                now,
            )
        });
        Self {
            local,
            peer,
            generation,
            state: PathState::Unvalidated,
            active: false,
            amplification_limited: false,
            rtt: RttEstimator::new(config.initial_rtt),
            congestion,
            pacing,
            mtud,
            in_flight: InFlight::new(),
            delivery_rate: DeliveryRate::new(now),
            dcid_seq: None,
            challenges: Vec::new(),
            challenge_pending: false,
            pending_response: None,
            fallback: None,
            app_limited: false,
            total_recvd: 0,
            total_sent: 0,
            counters: PathCounters::default(),
        }
    }

    /// A path to a new address that inherits the estimates of `prev`
    ///
    /// Used when the peer's address only changed port, which most likely is a NAT rebinding
    /// rather than a new network path.
    pub(super) fn from_rebinding(
        local: SocketAddr,
        peer: SocketAddr,
        generation: u64,
        prev: &Self,
        now: Instant,
    ) -> Self {
        Self {
            local,
            peer,
            generation,
            state: PathState::Unvalidated,
            active: false,
            amplification_limited: false,
            rtt: prev.rtt,
            congestion: prev.congestion.clone_box(),
            pacing: prev.pacing.clone(),
            mtud: prev.mtud.clone(),
            in_flight: InFlight::new(),
            delivery_rate: DeliveryRate::new(now),
            dcid_seq: None,
            challenges: Vec::new(),
            challenge_pending: false,
            pending_response: None,
            fallback: None,
            app_limited: false,
            total_recvd: 0,
            total_sent: 0,
            counters: PathCounters::default(),
        }
    }

    pub(super) fn matches(&self, local: SocketAddr, peer: SocketAddr) -> bool {
        self.local == local && self.peer == peer
    }

    pub(super) fn current_mtu(&self) -> u16 {
        self.mtud.current_mtu()
    }

    /// Whether sending `bytes_to_send` more would exceed the anti-amplification budget
    pub(super) fn anti_amplification_blocked(&self, bytes_to_send: u64) -> bool {
        self.amplification_limited
            && self.total_recvd.saturating_mul(3) < self.total_sent + bytes_to_send
    }

    /// Bytes that may still be sent before hitting the anti-amplification budget
    pub(super) fn amplification_budget(&self) -> u64 {
        match self.amplification_limited {
            true => self
                .total_recvd
                .saturating_mul(3)
                .saturating_sub(self.total_sent),
            false => u64::MAX,
        }
    }

    /// Whether the congestion window leaves room for another full-sized packet
    pub(super) fn congestion_blocked(&self) -> bool {
        self.in_flight.bytes + u64::from(self.current_mtu()) > self.congestion.window()
    }

    pub(super) fn is_validated(&self) -> bool {
        self.state == PathState::Validated
    }

    /// Begin validating the path with a fresh challenge token
    pub(super) fn start_validation(&mut self, token: u64) {
        if self.challenges.len() == MAX_CHALLENGES {
            self.challenges.remove(0);
        }
        self.challenges.push(token);
        self.challenge_pending = true;
        if self.state != PathState::Validated {
            self.state = PathState::Validating;
        }
    }

    /// Returns `true` if `token` answers one of our challenges
    pub(super) fn on_path_response(&mut self, token: u64) -> bool {
        if !self.challenges.contains(&token) {
            return false;
        }
        self.challenges.clear();
        self.challenge_pending = false;
        self.state = PathState::Validated;
        self.amplification_limited = false;
        self.fallback = None;
        true
    }

    pub(super) fn on_validation_failed(&mut self) {
        self.challenges.clear();
        self.challenge_pending = false;
        self.state = PathState::Failed;
    }

    /// Whether this path has something to send that doesn't depend on the active path's queues
    pub(super) fn has_probing_frames(&self) -> bool {
        self.challenge_pending || self.pending_response.is_some()
    }

    pub(super) fn on_sent(&mut self, bytes: u64) {
        self.total_sent = self.total_sent.saturating_add(bytes);
        self.counters.sent += 1;
        self.counters.sent_bytes += bytes;
    }

    pub(super) fn on_received(&mut self, bytes: u64) {
        self.total_recvd = self.total_recvd.saturating_add(bytes);
        self.counters.recv += 1;
        self.counters.recv_bytes += bytes;
    }
}

/// Per-path packet and byte counters
#[derive(Debug, Default, Copy, Clone)]
pub(super) struct PathCounters {
    pub(super) sent: u64,
    pub(super) recv: u64,
    pub(super) lost: u64,
    pub(super) retrans: u64,
    pub(super) sent_bytes: u64,
    pub(super) recv_bytes: u64,
    pub(super) lost_bytes: u64,
    pub(super) acked_bytes: u64,
}

/// RTT estimation for a particular network path
#[derive(Copy, Clone, Debug)]
pub struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a previously unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection, computed as described in RFC6298
    smoothed: Option<Duration>,
    /// The RTT variance, computed as described in RFC6298
    var: Duration,
    /// The minimum RTT seen in the connection, ignoring ack delay.
    min: Duration,
}

impl RttEstimator {
    /// Start from `initial_rtt` until the first sample arrives
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: None,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    /// The current best RTT estimation.
    pub fn get(&self) -> Duration {
        self.smoothed.unwrap_or(self.latest)
    }

    /// The most recent RTT sample
    pub fn latest(&self) -> Duration {
        self.latest
    }

    /// Conservative estimate of RTT
    ///
    /// Takes the maximum of smoothed and latest RTT, as recommended in RFC 9002 section 6.1.2.
    pub fn conservative(&self) -> Duration {
        self.get().max(self.latest)
    }

    /// Minimum RTT registered so far for this estimator.
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Mean deviation of the RTT samples
    pub fn var(&self) -> Duration {
        self.var
    }

    /// Whether a sample has been taken yet
    pub(crate) fn has_sample(&self) -> bool {
        self.smoothed.is_some()
    }

    // PTO computed as described in RFC9002#6.2.1
    pub(crate) fn pto_base(&self) -> Duration {
        self.get() + cmp::max(4 * self.var, TIMER_GRANULARITY)
    }

    pub(crate) fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // The minimum ignores ack delay
        self.min = cmp::min(self.min, self.latest);
        let Some(smoothed) = self.smoothed else {
            self.smoothed = Some(self.latest);
            self.var = self.latest / 2;
            self.min = self.latest;
            return;
        };
        // Only subtract the peer's reported delay if the sample stays above the minimum
        let adjusted = if self.min + ack_delay <= self.latest {
            self.latest - ack_delay
        } else {
            self.latest
        };
        let var_sample = smoothed.abs_diff(adjusted);
        self.var = (3 * self.var + var_sample) / 4;
        self.smoothed = Some((7 * smoothed + adjusted) / 8);
    }
}

/// Summary statistics of packets that have been sent on a particular path, but which have not yet
/// been acked or deemed lost
pub(super) struct InFlight {
    /// Sum of the sizes of all sent packets considered "in flight" by congestion control
    ///
    /// The size does not include IP or UDP overhead. Packets only containing ACK frames do not
    /// count towards this to ensure congestion control does not impede congestion feedback.
    pub(super) bytes: u64,
    /// Number of packets in flight containing frames other than ACK and PADDING
    ///
    /// This can be 0 even when bytes is not 0 because PADDING frames cause a packet to be
    /// considered "in flight" by congestion control. However, if this is nonzero, bytes will always
    /// also be nonzero.
    pub(super) ack_eliciting: u64,
}

impl InFlight {
    fn new() -> Self {
        Self {
            bytes: 0,
            ack_eliciting: 0,
        }
    }

    pub(super) fn insert(&mut self, size: u16, ack_eliciting: bool) {
        self.bytes += u64::from(size);
        self.ack_eliciting += u64::from(ack_eliciting);
    }

    /// Update counters to account for a packet becoming acknowledged, lost, or abandoned
    pub(super) fn remove(&mut self, size: u16, ack_eliciting: bool) {
        self.bytes = self.bytes.saturating_sub(u64::from(size));
        self.ack_eliciting = self.ack_eliciting.saturating_sub(u64::from(ack_eliciting));
    }
}

/// Delivery rate estimation in the style of draft-cheng-iccrg-delivery-rate-estimation
///
/// Each sent packet records how much had been delivered when it left; its acknowledgement then
/// yields a sample of the data delivered over the interval in between.
#[derive(Debug, Copy, Clone)]
pub(super) struct DeliveryRate {
    /// Bytes acknowledged on this path so far
    delivered: u64,
    /// When `delivered` last changed
    delivered_time: Instant,
    /// Latest rate sample in bytes per second
    rate: u64,
}

impl DeliveryRate {
    fn new(now: Instant) -> Self {
        Self {
            delivered: 0,
            delivered_time: now,
            rate: 0,
        }
    }

    /// State to attach to a packet being sent
    pub(super) fn snapshot(&self) -> (u64, Instant) {
        (self.delivered, self.delivered_time)
    }

    /// Account for an acknowledged packet sent with snapshot `(delivered, delivered_time)`
    pub(super) fn on_ack(
        &mut self,
        now: Instant,
        bytes: u64,
        (delivered, delivered_time): (u64, Instant),
    ) {
        self.delivered += bytes;
        self.delivered_time = now;
        let interval = now.saturating_duration_since(delivered_time);
        if interval.is_zero() {
            return;
        }
        let sample = (self.delivered - delivered) as u128 * 1_000_000 / interval.as_micros().max(1);
        self.rate = sample.min(u128::from(u64::MAX)) as u64;
    }

    pub(super) fn rate(&self) -> u64 {
        self.rate
    }
}
