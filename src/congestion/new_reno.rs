//! NewReno, RFC 9002 section 7

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::hystart::{CSS_GROWTH_DIVISOR, HyStart, Transition};
use super::{BASE_DATAGRAM_SIZE, Controller, StartupExit, StartupExitReason};
use crate::connection::RttEstimator;

/// A simple, standard congestion controller
#[derive(Debug, Clone)]
pub struct NewReno {
    config: Arc<NewRenoConfig>,
    current_mtu: u64,
    /// Maximum number of bytes in flight that may be sent.
    window: u64,
    /// Slow start threshold in bytes. When the congestion window is below ssthresh, the mode is
    /// slow start and the window grows by the number of bytes acknowledged.
    ssthresh: u64,
    /// The time when QUIC first detects a loss, causing it to enter recovery. When a packet sent
    /// after this time is acknowledged, QUIC exits recovery.
    recovery_start_time: Instant,
    /// Bytes which had been acked by the peer since leaving slow start
    bytes_acked: u64,
    hystart: HyStart,
    smoothed_rtt: Duration,
    startup_exit: Option<StartupExit>,
}

impl NewReno {
    /// Construct a state using the given `config` and current time `now`
    pub fn new(config: Arc<NewRenoConfig>, now: Instant, current_mtu: u16) -> Self {
        Self {
            window: config.initial_window,
            ssthresh: u64::MAX,
            recovery_start_time: now,
            current_mtu: current_mtu as u64,
            bytes_acked: 0,
            hystart: HyStart::new(config.hystart),
            smoothed_rtt: Duration::ZERO,
            startup_exit: None,
            config,
        }
    }

    fn minimum_window(&self) -> u64 {
        super::minimum_window(self.current_mtu)
    }

    fn in_slow_start(&self) -> bool {
        self.window < self.ssthresh
    }

    fn exit_startup(&mut self, reason: StartupExitReason) {
        if self.startup_exit.is_some() {
            return;
        }
        let exit = StartupExit {
            reason,
            cwnd: self.window,
            bandwidth: super::window_bandwidth(self.window, self.smoothed_rtt),
        };
        debug!(?exit, "leaving slow start");
        self.startup_exit = Some(exit);
    }
}

impl Controller for NewReno {
    fn on_sent(&mut self, _now: Instant, _bytes: u64, last_packet_number: u64) {
        self.hystart.on_sent(last_packet_number);
    }

    fn on_ack(
        &mut self,
        _now: Instant,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &RttEstimator,
    ) {
        self.smoothed_rtt = rtt.get();
        if self.in_slow_start() {
            self.hystart.on_rtt_sample(rtt.latest());
        }

        if app_limited || sent <= self.recovery_start_time {
            return;
        }

        if self.in_slow_start() {
            // Slow start
            let growth = match self.hystart.in_css() {
                true => bytes / CSS_GROWTH_DIVISOR,
                false => bytes,
            };
            self.window += growth;

            if self.window >= self.ssthresh {
                self.bytes_acked = self.window - self.ssthresh;
            }
        } else {
            // Congestion avoidance
            // This implementation uses the method which does not require
            // slow start threshold, as per the recommended approach in RFC 9002 section 7.3.3.
            self.bytes_acked += bytes;

            if self.bytes_acked >= self.window {
                self.bytes_acked -= self.window;
                self.window += self.current_mtu;
            }
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
            self.bytes_acked = 0;
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
        if sent <= self.recovery_start_time {
            return;
        }

        if self.in_slow_start() {
            self.exit_startup(StartupExitReason::Loss);
            self.hystart.reset();
        }

        self.recovery_start_time = now;
        self.window = (self.window as f32 * self.config.loss_reduction_factor) as u64;
        self.window = self.window.max(self.minimum_window());
        self.ssthresh = self.window;

        if is_persistent_congestion {
            self.window = self.minimum_window();
        }
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.current_mtu = new_mtu as u64;
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

/// Configuration for the `NewReno` congestion controller
#[derive(Debug, Clone)]
pub struct NewRenoConfig {
    initial_window: u64,
    loss_reduction_factor: f32,
    hystart: bool,
}

impl NewRenoConfig {
    /// Default limit on the amount of outstanding data in bytes.
    ///
    /// Recommended value: `min(10 * max_datagram_size, max(2 * max_datagram_size, 14720))`
    pub fn initial_window(&mut self, value: u64) -> &mut Self {
        self.initial_window = value;
        self
    }

    /// Reduction in congestion window when a new loss event is detected.
    pub fn loss_reduction_factor(&mut self, value: f32) -> &mut Self {
        self.loss_reduction_factor = value;
        self
    }

    /// Whether HyStart++ may end slow start before the first loss
    pub fn hystart(&mut self, enabled: bool) -> &mut Self {
        self.hystart = enabled;
        self
    }
}

impl Default for NewRenoConfig {
    fn default() -> Self {
        Self {
            initial_window: super::initial_window(BASE_DATAGRAM_SIZE),
            loss_reduction_factor: 0.5,
            hystart: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(now: Instant) -> NewReno {
        NewReno::new(Arc::new(NewRenoConfig::default()), now, 1200)
    }

    #[test]
    fn slow_start_then_halving_on_loss() {
        let start = Instant::now();
        let mut cc = controller(start);
        let rtt = RttEstimator::new(Duration::from_millis(100));
        let initial = cc.window();
        assert_eq!(initial, 12000);

        let sent = start + Duration::from_millis(1);
        let now = start + Duration::from_millis(101);
        cc.on_ack(now, sent, 6000, false, &rtt);
        assert_eq!(cc.window(), initial + 6000);
        assert_eq!(cc.startup_exit(), None);

        cc.on_congestion_event(now, sent, false, 1200);
        assert_eq!(cc.window(), 9000);
        assert_eq!(cc.ssthresh(), Some(9000));
        let exit = cc.startup_exit().unwrap();
        assert_eq!(exit.reason, StartupExitReason::Loss);
        assert_eq!(exit.cwnd, 18000);

        // Packets sent before recovery started don't trigger another reduction
        cc.on_congestion_event(now, sent, false, 1200);
        assert_eq!(cc.window(), 9000);
    }

    #[test]
    fn congestion_avoidance_grows_one_mtu_per_window() {
        let start = Instant::now();
        let mut cc = controller(start);
        let rtt = RttEstimator::new(Duration::from_millis(100));
        let lost_at = start + Duration::from_millis(10);
        cc.on_congestion_event(lost_at, start + Duration::from_millis(1), false, 1200);
        let window = cc.window();

        let sent = lost_at + Duration::from_millis(1);
        let now = sent + Duration::from_millis(100);
        cc.on_ack(now, sent, window - 1, false, &rtt);
        assert_eq!(cc.window(), window);
        cc.on_ack(now, sent, 1, false, &rtt);
        assert_eq!(cc.window(), window + 1200);
    }

    #[test]
    fn persistent_congestion_collapses_window() {
        let start = Instant::now();
        let mut cc = controller(start);
        cc.on_congestion_event(
            start + Duration::from_millis(10),
            start + Duration::from_millis(1),
            true,
            12000,
        );
        assert_eq!(cc.window(), 2400);
    }

    #[test]
    fn app_limited_acks_do_not_grow_window() {
        let start = Instant::now();
        let mut cc = controller(start);
        let rtt = RttEstimator::new(Duration::from_millis(100));
        let sent = start + Duration::from_millis(1);
        cc.on_ack(sent + Duration::from_millis(100), sent, 6000, true, &rtt);
        assert_eq!(cc.window(), cc.initial_window());
    }
}
