//! CUBIC, RFC 8312
//!
//! Window arithmetic is carried out in segments of the current MTU and converted back to bytes
//! at the edges.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::hystart::{CSS_GROWTH_DIVISOR, HyStart, Transition};
use super::{BASE_DATAGRAM_SIZE, Controller, StartupExit, StartupExitReason};
use crate::connection::RttEstimator;

/// Multiplicative decrease factor
const BETA: f64 = 0.7;
/// Scaling constant of the cubic curve
const C: f64 = 0.4;

/// Time in seconds the curve needs to climb back to `w_max` segments (eq. 2)
fn time_to_w_max(w_max: f64) -> f64 {
    (w_max * (1.0 - BETA) / C).cbrt()
}

/// Window in segments `t` seconds into the epoch (eq. 1)
fn w_cubic(t: f64, k: f64, w_max: f64) -> f64 {
    C * (t - k).powi(3) + w_max
}

/// Window in segments a Reno sender would have reached after `t` seconds (eq. 4)
fn w_est(t: f64, rtt: f64, w_max: f64) -> f64 {
    w_max * BETA + 3.0 * (1.0 - BETA) / (1.0 + BETA) * t / rtt
}

/// The RFC8312 congestion controller, as widely used for TCP
#[derive(Debug, Clone)]
pub struct Cubic {
    config: Arc<CubicConfig>,
    mtu: u64,
    /// Bytes that may be in flight
    window: u64,
    /// Slow start continues while the window is below this
    ssthresh: u64,
    /// Start of the current recovery period, which also anchors the cubic epoch
    ///
    /// Packets sent before it don't affect the window.
    recovery_start: Option<Instant>,
    /// Window in bytes before the last reduction
    w_max: f64,
    /// Seconds from the start of the epoch until the window is back at `w_max`
    k: f64,
    /// Growth earned in congestion avoidance and not yet applied
    pending_growth: u64,
    hystart: HyStart,
    last_srtt: Duration,
    startup_exit: Option<StartupExit>,
}

impl Cubic {
    /// Construct a state using the given `config` and current time `now`
    pub fn new(config: Arc<CubicConfig>, _now: Instant, current_mtu: u16) -> Self {
        Self {
            mtu: u64::from(current_mtu),
            window: config.initial_window,
            ssthresh: u64::MAX,
            recovery_start: None,
            w_max: 0.0,
            k: 0.0,
            pending_growth: 0,
            hystart: HyStart::new(config.hystart),
            last_srtt: Duration::ZERO,
            startup_exit: None,
            config,
        }
    }

    fn minimum_window(&self) -> u64 {
        super::minimum_window(self.mtu)
    }

    fn in_slow_start(&self) -> bool {
        self.window < self.ssthresh
    }

    fn in_recovery(&self, sent: Instant) -> bool {
        self.recovery_start.is_some_and(|start| sent <= start)
    }

    fn exit_startup(&mut self, reason: StartupExitReason) {
        if self.startup_exit.is_some() {
            return;
        }
        let exit = StartupExit {
            reason,
            cwnd: self.window,
            bandwidth: super::window_bandwidth(self.window, self.last_srtt),
        };
        debug!(?exit, "leaving slow start");
        self.startup_exit = Some(exit);
    }

    /// Grow the window in congestion avoidance
    fn avoid_congestion(&mut self, now: Instant, rtt: &RttEstimator) {
        let epoch_start = match self.recovery_start {
            Some(start) => start,
            None => {
                // No loss seen yet: start an epoch at the current window
                self.recovery_start = Some(now);
                self.w_max = self.window as f64;
                self.k = 0.0;
                now
            }
        };

        let mss = self.mtu as f64;
        let w_max = self.w_max / mss;
        let t = now.saturating_duration_since(epoch_start).as_secs_f64();
        let srtt = rtt.get().as_secs_f64();
        let cubic = w_cubic(t + srtt, self.k, w_max) * mss;
        let reno = w_est(t, srtt, w_max) * mss;

        let window = self.window as f64;
        let growth = if cubic < reno {
            (reno as u64).saturating_sub(self.window)
        } else if (cubic as u64) > self.window {
            ((cubic - window) / window * mss) as u64
        } else {
            0
        };

        // At most one datagram per window acknowledged (RFC 9002 §7.3.3)
        self.pending_growth += growth;
        if self.pending_growth >= self.mtu {
            self.window += self.mtu;
            self.pending_growth = 0;
        }
    }
}

impl Controller for Cubic {
    fn on_sent(&mut self, _now: Instant, _bytes: u64, last_packet_number: u64) {
        self.hystart.on_sent(last_packet_number);
    }

    fn on_ack(
        &mut self,
        now: Instant,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &RttEstimator,
    ) {
        self.last_srtt = rtt.get();
        if self.in_slow_start() {
            self.hystart.on_rtt_sample(rtt.latest());
        }
        if app_limited || self.in_recovery(sent) {
            return;
        }

        if !self.in_slow_start() {
            self.avoid_congestion(now, rtt);
        } else if self.hystart.in_css() {
            self.window += bytes / CSS_GROWTH_DIVISOR;
        } else {
            self.window += bytes;
        }
    }

    fn on_end_acks(
        &mut self,
        _now: Instant,
        _in_flight: u64,
        _app_limited: bool,
        largest_packet_num_acked: Option<u64>,
    ) {
        if !self.in_slow_start() {
            return;
        }
        if let Some(Transition::ExitSlowStart) = self.hystart.on_end_acks(largest_packet_num_acked)
        {
            self.exit_startup(StartupExitReason::PersistentQueue);
            self.ssthresh = self.window;
            self.hystart.reset();
        }
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        sent: Instant,
        is_persistent_congestion: bool,
        _lost_bytes: u64,
    ) {
        if self.in_recovery(sent) {
            return;
        }
        if self.in_slow_start() {
            self.exit_startup(StartupExitReason::Loss);
            self.hystart.reset();
        }
        self.recovery_start = Some(now);

        let window = self.window as f64;
        // Fast convergence: give up more room when losses come before reaching the old peak
        self.w_max = if window < self.w_max {
            window * (1.0 + BETA) / 2.0
        } else {
            window
        };
        self.ssthresh = ((self.w_max * BETA) as u64).max(self.minimum_window());
        self.window = self.ssthresh;
        self.k = time_to_w_max(self.w_max / self.mtu as f64);
        self.pending_growth = (self.pending_growth as f64 * BETA) as u64;

        if is_persistent_congestion {
            // RFC 8312 §4.7
            self.recovery_start = None;
            self.w_max = self.window as f64;
            self.ssthresh = ((self.window as f64 * BETA) as u64).max(self.minimum_window());
            self.pending_growth = 0;
            self.window = self.minimum_window();
        }
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.mtu = u64::from(new_mtu);
        self.window = self.window.max(self.minimum_window());
    }

    fn window(&self) -> u64 {
        self.window
    }

    fn ssthresh(&self) -> Option<u64> {
        Some(self.ssthresh)
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

/// Configuration for the `Cubic` congestion controller
#[derive(Debug, Clone)]
pub struct CubicConfig {
    initial_window: u64,
    hystart: bool,
}

impl CubicConfig {
    /// Default limit on the amount of outstanding data in bytes.
    ///
    /// Recommended value: `min(10 * max_datagram_size, max(2 * max_datagram_size, 14720))`
    pub fn initial_window(&mut self, value: u64) -> &mut Self {
        self.initial_window = value;
        self
    }

    /// Whether HyStart++ may end slow start before the first loss
    pub fn hystart(&mut self, enabled: bool) -> &mut Self {
        self.hystart = enabled;
        self
    }
}

impl Default for CubicConfig {
    fn default() -> Self {
        Self {
            initial_window: super::initial_window(BASE_DATAGRAM_SIZE),
            hystart: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(now: Instant) -> Cubic {
        Cubic::new(Arc::new(CubicConfig::default()), now, 1200)
    }

    #[test]
    fn loss_reduces_by_beta() {
        let start = Instant::now();
        let mut cc = controller(start);
        let rtt = RttEstimator::new(Duration::from_millis(50));
        let now = start + Duration::from_millis(50);
        cc.on_ack(now, start, 8000, false, &rtt);
        assert_eq!(cc.window(), 20000);

        cc.on_congestion_event(now, start, false, 1200);
        assert_eq!(cc.window(), 14000);
        assert_eq!(cc.ssthresh(), Some(14000));
        assert_eq!(cc.startup_exit().unwrap().reason, StartupExitReason::Loss);
    }

    #[test]
    fn window_grows_in_congestion_avoidance() {
        let start = Instant::now();
        let mut cc = controller(start);
        let rtt = RttEstimator::new(Duration::from_millis(50));
        cc.on_congestion_event(start, start, false, 1200);
        let window = cc.window();

        let mut now = start;
        for _ in 0..200 {
            now += Duration::from_millis(5);
            cc.on_ack(now, now - Duration::from_millis(50), 1200, false, &rtt);
        }
        assert!(cc.window() > window);
    }

    #[test]
    fn persistent_congestion_collapses_window() {
        let start = Instant::now();
        let mut cc = controller(start);
        cc.on_congestion_event(start, start, true, 12000);
        assert_eq!(cc.window(), 2400);
    }

    #[test]
    fn mtu_update_raises_minimum() {
        let start = Instant::now();
        let mut cc = controller(start);
        cc.on_congestion_event(start, start, true, 12000);
        cc.on_mtu_update(1500);
        assert_eq!(cc.window(), 3000);
    }
}
