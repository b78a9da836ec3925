//! BBR version 1

use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, trace};

use self::bw_estimation::BandwidthEstimation;
use self::min_max::MinMax;
use super::{BASE_DATAGRAM_SIZE, Controller, StartupExit, StartupExitReason};
use crate::connection::RttEstimator;

mod bw_estimation;
mod min_max;

/// Model-based congestion control tracking bottleneck bandwidth and round-trip propagation time
///
/// Aims for reduced buffer bloat and improved performance over high bandwidth-delay product
/// networks. Follows the BBRv1 draft
/// <https://datatracker.ietf.org/doc/html/draft-cardwell-iccrg-bbr-congestion-control>.
#[derive(Debug, Clone)]
pub struct Bbr {
    config: Arc<BbrConfig>,
    mtu: u64,
    bandwidth: BandwidthEstimation,
    mode: Mode,
    pacing_gain: f32,
    cwnd_gain: f32,
    rounds: Rounds,
    full_bw: FullBandwidth,
    recovery: Recovery,
    ack_aggregation: AckAggregation,
    min_rtt: Duration,
    /// When `min_rtt` was last refreshed
    min_rtt_stamp: Option<Instant>,
    /// Whether an ack in the current batch found `min_rtt` stale
    probe_rtt_due: bool,
    cwnd: u64,
    init_cwnd: u64,
    min_cwnd: u64,
    pacing_rate: u64,
    acked_total: u64,
    /// Bytes declared lost since the last batch of acks
    pending_loss: u64,
    in_flight_at_last_ack: u64,
    rng: StdRng,
    startup_exit: Option<StartupExit>,
}

impl Bbr {
    /// Construct a state using the given `config` and the path's current MTU
    pub fn new(config: Arc<BbrConfig>, current_mtu: u16) -> Self {
        let mtu = u64::from(current_mtu);
        let init_cwnd = config.initial_window;
        Self {
            config,
            mtu,
            bandwidth: BandwidthEstimation::default(),
            mode: Mode::Startup,
            pacing_gain: HIGH_GAIN,
            cwnd_gain: HIGH_GAIN,
            rounds: Rounds::default(),
            full_bw: FullBandwidth::default(),
            recovery: Recovery::default(),
            ack_aggregation: AckAggregation::default(),
            min_rtt: Duration::ZERO,
            min_rtt_stamp: None,
            probe_rtt_due: false,
            cwnd: init_cwnd,
            init_cwnd,
            min_cwnd: min_window(mtu),
            pacing_rate: 0,
            acked_total: 0,
            pending_loss: 0,
            in_flight_at_last_ack: 0,
            rng: StdRng::from_os_rng(),
            startup_exit: None,
        }
    }

    fn enter_startup(&mut self) {
        trace!("BBR startup");
        self.mode = Mode::Startup;
        self.pacing_gain = HIGH_GAIN;
        self.cwnd_gain = HIGH_GAIN;
    }

    fn enter_probe_bw(&mut self, now: Instant) {
        // Start anywhere but on the draining phase, which only makes sense right after probing
        let mut cycle = self.rng.random_range(0..PACING_GAINS.len() - 1);
        if cycle >= 1 {
            cycle += 1;
        }
        trace!(cycle, "BBR probing bandwidth");
        self.mode = Mode::ProbeBw {
            cycle,
            cycle_start: now,
        };
        self.pacing_gain = PACING_GAINS[cycle];
        self.cwnd_gain = PROBE_BW_CWND_GAIN;
    }

    /// Window needed to keep `gain` times the estimated bandwidth-delay product in flight
    fn target_window(&self, gain: f32) -> u64 {
        let bdp = self.bandwidth.get_estimate() as f64 * self.min_rtt.as_secs_f64();
        match (bdp * f64::from(gain)) as u64 {
            // No bandwidth sample yet
            0 => self.init_cwnd,
            window => window.max(self.min_cwnd),
        }
    }

    fn probe_rtt_window(&self) -> u64 {
        self.target_window(PROBE_RTT_GAIN)
    }

    fn update_recovery(&mut self, round_start: bool, has_losses: bool) {
        if has_losses {
            self.recovery.end_pn = self.rounds.largest_sent;
        }
        match self.recovery.phase {
            RecoveryPhase::Off if has_losses => {
                self.recovery.phase = RecoveryPhase::Conservation;
                self.recovery.window = 0;
                // Conservation lasts a full round from now
                self.rounds.end_pn = self.rounds.largest_sent;
            }
            RecoveryPhase::Off => {}
            RecoveryPhase::Conservation | RecoveryPhase::Growth => {
                if round_start {
                    self.recovery.phase = RecoveryPhase::Growth;
                }
                if !has_losses && self.rounds.largest_acked > self.recovery.end_pn {
                    self.recovery.phase = RecoveryPhase::Off;
                }
            }
        }
    }

    fn advance_gain_cycle(&mut self, now: Instant, in_flight: u64, has_losses: bool) {
        let Mode::ProbeBw { cycle, cycle_start } = self.mode else {
            return;
        };
        let mut advance = now.saturating_duration_since(cycle_start) > self.min_rtt;
        // Probing must actually put pacing_gain * BDP in flight unless the path is dropping
        if self.pacing_gain > 1.0
            && !has_losses
            && self.in_flight_at_last_ack < self.target_window(self.pacing_gain)
        {
            advance = false;
        }
        // Draining is done early once the queue built while probing is gone
        if self.pacing_gain < 1.0 && in_flight <= self.target_window(1.0) {
            advance = true;
        }
        if !advance {
            return;
        }

        let next = (cycle + 1) % PACING_GAINS.len();
        self.mode = Mode::ProbeBw {
            cycle: next,
            cycle_start: now,
        };
        // Keep draining until the estimated BDP is reached
        let next_is_cruise = (PACING_GAINS[next] - 1.0).abs() < f32::EPSILON;
        if self.pacing_gain < 1.0 && next_is_cruise && in_flight > self.target_window(1.0) {
            return;
        }
        self.pacing_gain = PACING_GAINS[next];
    }

    /// <https://datatracker.ietf.org/doc/html/draft-cardwell-iccrg-bbr-congestion-control#section-4.3.2.2>
    fn check_full_bandwidth(&mut self, app_limited: bool) {
        if app_limited {
            return;
        }
        let bw = self.bandwidth.get_estimate();
        if self.full_bw.on_round(bw) {
            self.ack_aggregation.max_excess.reset();
            return;
        }
        let plateau = self.full_bw.rounds_without_growth >= STARTUP_ROUNDS_WITHOUT_GROWTH;
        if !plateau && !self.recovery.active() {
            return;
        }
        self.full_bw.reached = true;
        if self.startup_exit.is_none() {
            let exit = StartupExit {
                reason: match plateau {
                    true => StartupExitReason::BandwidthPlateau,
                    false => StartupExitReason::Loss,
                },
                cwnd: self.cwnd,
                bandwidth: Some(bw),
            };
            debug!(?exit, "leaving startup");
            self.startup_exit = Some(exit);
        }
    }

    fn leave_startup_or_drain(&mut self, now: Instant, in_flight: u64) {
        if self.mode == Mode::Startup && self.full_bw.reached {
            trace!("BBR draining");
            self.mode = Mode::Drain;
            self.pacing_gain = 1.0 / HIGH_GAIN;
            self.cwnd_gain = HIGH_GAIN;
        }
        if self.mode == Mode::Drain && in_flight <= self.target_window(1.0) {
            self.enter_probe_bw(now);
        }
    }

    fn update_probe_rtt(&mut self, now: Instant, round_start: bool, in_flight: u64) {
        let due = mem::take(&mut self.probe_rtt_due);
        if due && !matches!(self.mode, Mode::ProbeRtt { .. }) {
            trace!("BBR probing RTT");
            self.mode = Mode::ProbeRtt { exit_at: None };
            self.pacing_gain = 1.0;
        }

        let Mode::ProbeRtt { exit_at } = self.mode else {
            return;
        };
        match exit_at {
            // One packet over the window is allowed, as the window is checked before sending
            None if in_flight < self.probe_rtt_window() + self.mtu => {
                self.mode = Mode::ProbeRtt {
                    exit_at: Some(now + PROBE_RTT_DURATION),
                };
            }
            Some(exit_at) if round_start && now >= exit_at => {
                self.min_rtt_stamp = Some(now);
                match self.full_bw.reached {
                    true => self.enter_probe_bw(now),
                    false => self.enter_startup(),
                }
            }
            _ => {}
        }
    }

    fn update_pacing_rate(&mut self) {
        let bw = self.bandwidth.get_estimate();
        if bw == 0 {
            return;
        }
        let target = (bw as f64 * f64::from(self.pacing_gain)) as u64;
        if self.full_bw.reached {
            self.pacing_rate = target;
            return;
        }
        // Until the model has a bandwidth worth pacing at, spread the initial window over an RTT
        if self.pacing_rate == 0 {
            if let Some(rate) = BandwidthEstimation::bw_from_delta(self.init_cwnd, self.min_rtt) {
                self.pacing_rate = rate;
                return;
            }
        }
        // The rate never drops during startup
        self.pacing_rate = self.pacing_rate.max(target);
    }

    fn update_window(&mut self, acked: u64, excess_acked: u64) {
        if matches!(self.mode, Mode::ProbeRtt { .. }) {
            return;
        }
        let mut target = self.target_window(self.cwnd_gain);
        // Leave room for ack aggregation
        target += match self.full_bw.reached {
            true => self.ack_aggregation.max_excess.get(),
            false => excess_acked,
        };
        // Grow towards the target by at most the newly acked bytes
        if self.full_bw.reached {
            self.cwnd = target.min(self.cwnd + acked);
        } else if self.cwnd < target || self.acked_total < self.init_cwnd {
            self.cwnd += acked;
        }
        self.cwnd = self.cwnd.max(self.min_cwnd);
    }

    fn update_recovery_window(&mut self, acked: u64, lost: u64, in_flight: u64) {
        if !self.recovery.active() {
            return;
        }
        if self.recovery.window == 0 {
            self.recovery.window = self.min_cwnd.max(in_flight + acked);
            return;
        }
        self.recovery.window = match self.recovery.window.checked_sub(lost) {
            Some(window) => window,
            None => self.mtu,
        };
        // Growth releases the acked bytes on top, like slow start
        if self.recovery.phase == RecoveryPhase::Growth {
            self.recovery.window += acked;
        }
        self.recovery.window = self
            .recovery
            .window
            .max(in_flight + acked)
            .max(self.min_cwnd);
    }
}

impl Controller for Bbr {
    fn on_sent(&mut self, now: Instant, bytes: u64, last_packet_number: u64) {
        self.rounds.largest_sent = last_packet_number;
        self.bandwidth.on_sent(now, bytes);
    }

    fn on_ack(
        &mut self,
        now: Instant,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &RttEstimator,
    ) {
        self.bandwidth
            .on_ack(now, sent, bytes, self.rounds.count, app_limited);
        self.acked_total += bytes;

        let expired = !app_limited
            && self
                .min_rtt_stamp
                .is_some_and(|stamp| now.saturating_duration_since(stamp) > MIN_RTT_WINDOW);
        self.probe_rtt_due |= expired;
        if self.min_rtt.is_zero() || expired || rtt.min() < self.min_rtt {
            self.min_rtt = rtt.min();
            self.min_rtt_stamp = Some(now);
        }
    }

    fn on_end_acks(
        &mut self,
        now: Instant,
        in_flight: u64,
        app_limited: bool,
        largest_packet_num_acked: Option<u64>,
    ) {
        let acked = self.bandwidth.bytes_acked_this_window();
        let excess_acked = self.ack_aggregation.on_acks(
            acked,
            now,
            self.rounds.count,
            self.bandwidth.get_estimate(),
        );
        self.bandwidth.end_acks(self.rounds.count, app_limited);
        if let Some(largest) = largest_packet_num_acked {
            self.rounds.largest_acked = largest;
        }

        let round_start = acked > 0 && self.rounds.on_acks();
        let lost = mem::take(&mut self.pending_loss);
        self.update_recovery(round_start, lost > 0);
        self.advance_gain_cycle(now, in_flight, lost > 0);
        if round_start && !self.full_bw.reached {
            self.check_full_bandwidth(app_limited);
        }
        self.leave_startup_or_drain(now, in_flight);
        self.update_probe_rtt(now, round_start, in_flight);

        self.update_pacing_rate();
        self.update_window(acked, excess_acked);
        self.update_recovery_window(acked, lost, in_flight);
        self.in_flight_at_last_ack = in_flight;
    }

    fn on_congestion_event(
        &mut self,
        _now: Instant,
        _sent: Instant,
        _is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
        self.pending_loss += lost_bytes;
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.mtu = u64::from(new_mtu);
        self.min_cwnd = min_window(self.mtu);
        self.init_cwnd = self.config.initial_window.max(self.min_cwnd);
        self.cwnd = self.cwnd.max(self.min_cwnd);
    }

    fn window(&self) -> u64 {
        match self.mode {
            Mode::ProbeRtt { .. } => self.probe_rtt_window(),
            Mode::Startup => self.cwnd,
            _ if self.recovery.active() => self.cwnd.min(self.recovery.window),
            _ => self.cwnd,
        }
    }

    fn pacing_rate(&self) -> Option<u64> {
        (self.pacing_rate != 0).then_some(self.pacing_rate)
    }

    fn startup_exit(&self) -> Option<StartupExit> {
        self.startup_exit
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }

    fn initial_window(&self) -> u64 {
        self.config.initial_window
    }
}

/// Configuration for the [`Bbr`] congestion controller
#[derive(Debug, Clone)]
pub struct BbrConfig {
    initial_window: u64,
}

impl BbrConfig {
    /// Default limit on the amount of outstanding data in bytes
    pub fn initial_window(&mut self, value: u64) -> &mut Self {
        self.initial_window = value;
        self
    }
}

impl Default for BbrConfig {
    fn default() -> Self {
        Self {
            initial_window: MAX_INITIAL_WINDOW_PACKETS * BASE_DATAGRAM_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Mode {
    /// Doubling the sending rate each round until bandwidth stops growing
    Startup,
    /// Emptying the queue built during startup
    Drain,
    /// Cycling the pacing gain around the estimated bandwidth
    ProbeBw { cycle: usize, cycle_start: Instant },
    /// Shrinking the window to measure the propagation delay
    ProbeRtt { exit_at: Option<Instant> },
}

/// Round trips, delimited by packet numbers
#[derive(Debug, Clone, Copy, Default)]
struct Rounds {
    count: u64,
    /// An ack for a packet above this starts a new round
    end_pn: u64,
    largest_sent: u64,
    largest_acked: u64,
}

impl Rounds {
    fn on_acks(&mut self) -> bool {
        if self.largest_acked <= self.end_pn {
            return false;
        }
        self.end_pn = self.largest_sent;
        self.count += 1;
        true
    }
}

/// Detection of the bandwidth plateau that ends startup
#[derive(Debug, Clone, Copy, Default)]
struct FullBandwidth {
    reached: bool,
    bw_at_last_growth: u64,
    rounds_without_growth: u8,
}

impl FullBandwidth {
    /// Record the estimate at the start of a round, returning whether it still grows
    fn on_round(&mut self, bw: u64) -> bool {
        let target = (self.bw_at_last_growth as f64 * f64::from(STARTUP_GROWTH_TARGET)) as u64;
        if bw >= target {
            self.bw_at_last_growth = bw;
            self.rounds_without_growth = 0;
            return true;
        }
        self.rounds_without_growth = self.rounds_without_growth.saturating_add(1);
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Recovery {
    phase: RecoveryPhase,
    /// Cap on bytes in flight while recovering, 0 until set up
    window: u64,
    /// Recovery ends once a packet above this is acked without new losses
    end_pn: u64,
}

impl Recovery {
    fn active(&self) -> bool {
        self.phase != RecoveryPhase::Off
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
enum RecoveryPhase {
    #[default]
    Off,
    /// One byte may be sent per byte acked
    Conservation,
    /// Two bytes may be sent per byte acked
    Growth,
}

/// Tracks how far ack arrivals run ahead of the bandwidth estimate
#[derive(Debug, Default, Copy, Clone)]
struct AckAggregation {
    max_excess: MinMax,
    epoch_start: Option<Instant>,
    epoch_bytes: u64,
}

impl AckAggregation {
    /// Returns the bytes acked beyond what `max_bandwidth` explains for the current epoch
    fn on_acks(&mut self, acked: u64, now: Instant, round: u64, max_bandwidth: u64) -> u64 {
        let elapsed = now.saturating_duration_since(self.epoch_start.unwrap_or(now));
        let expected = (max_bandwidth as f64 * elapsed.as_secs_f64()) as u64;
        if self.epoch_bytes <= expected {
            // Acks arrive no faster than the bandwidth estimate: start a new epoch
            self.epoch_bytes = acked;
            self.epoch_start = Some(now);
            return 0;
        }
        self.epoch_bytes += acked;
        let excess = self.epoch_bytes - expected;
        self.max_excess.update_max(round, excess);
        excess
    }
}

fn min_window(mtu: u64) -> u64 {
    4 * mtu
}

/// Startup gain, 2/ln(2)
const HIGH_GAIN: f32 = 2.885;
const PROBE_BW_CWND_GAIN: f32 = 2.0;
const PROBE_RTT_GAIN: f32 = 0.75;
const PACING_GAINS: [f32; 8] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
const STARTUP_GROWTH_TARGET: f32 = 1.25;
const STARTUP_ROUNDS_WITHOUT_GROWTH: u8 = 3;
const MAX_INITIAL_WINDOW_PACKETS: u64 = 200;
const MIN_RTT_WINDOW: Duration = Duration::from_secs(10);
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);

#[cfg(test)]
mod tests {
    use super::*;

    fn ack_round(
        bbr: &mut Bbr,
        rtt: &mut RttEstimator,
        now: &mut Instant,
        pn: &mut u64,
        packets: u64,
    ) {
        let sent = *now;
        for _ in 0..packets {
            bbr.on_sent(sent, 1200, *pn);
            *pn += 1;
        }
        *now += Duration::from_millis(50);
        rtt.update(Duration::ZERO, Duration::from_millis(50));
        for _ in 0..packets {
            bbr.on_ack(*now, sent, 1200, false, rtt);
        }
        bbr.on_end_acks(*now, 0, false, Some(*pn - 1));
    }

    #[test]
    fn starts_at_initial_window() {
        let bbr = Bbr::new(Arc::new(BbrConfig::default()), 1200);
        assert_eq!(bbr.window(), 200 * 1200);
        assert_eq!(bbr.pacing_rate(), None);
        assert_eq!(bbr.startup_exit(), None);
    }

    #[test]
    fn plateau_ends_startup() {
        let mut bbr = Bbr::new(Arc::new(BbrConfig::default()), 1200);
        let mut rtt = RttEstimator::new(Duration::from_millis(50));
        let mut now = Instant::now();
        let mut pn = 0;
        // A constant sending rate never shows the growth startup looks for
        for _ in 0..10 {
            ack_round(&mut bbr, &mut rtt, &mut now, &mut pn, 10);
        }
        let exit = bbr.startup_exit().expect("startup exit");
        assert_eq!(exit.reason, StartupExitReason::BandwidthPlateau);
        assert!(bbr.pacing_rate().is_some());
        assert_ne!(bbr.mode, Mode::Startup);
    }

    #[test]
    fn losses_are_accumulated_per_batch() {
        let mut bbr = Bbr::new(Arc::new(BbrConfig::default()), 1200);
        let now = Instant::now();
        bbr.on_congestion_event(now, now, false, 1200);
        bbr.on_congestion_event(now, now, false, 1200);
        assert_eq!(bbr.pending_loss, 2400);
        bbr.on_end_acks(now, 0, false, None);
        assert_eq!(bbr.pending_loss, 0);
        assert!(bbr.recovery.active());
    }

    #[test]
    fn stale_min_rtt_triggers_probe_rtt() {
        let mut bbr = Bbr::new(Arc::new(BbrConfig::default()), 1200);
        let mut rtt = RttEstimator::new(Duration::from_millis(50));
        let mut now = Instant::now();
        let mut pn = 0;
        ack_round(&mut bbr, &mut rtt, &mut now, &mut pn, 2);
        assert!(!matches!(bbr.mode, Mode::ProbeRtt { .. }));

        now += MIN_RTT_WINDOW;
        ack_round(&mut bbr, &mut rtt, &mut now, &mut pn, 2);
        assert!(matches!(bbr.mode, Mode::ProbeRtt { .. }));
    }
}
