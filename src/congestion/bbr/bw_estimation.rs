//! Delivery-rate sampling
//!
//! Each acknowledgement yields one sample: the smaller of the rate at which the covered bytes
//! were sent and the rate at which they were acknowledged. The estimate is the windowed maximum
//! of those samples, keyed by round trip.

use std::fmt;
use std::time::{Duration, Instant};

use super::min_max::MinMax;

/// Running byte count with the two most recent events
#[derive(Clone, Copy, Debug, Default)]
struct Tally {
    total: u64,
    /// Bytes added by the most recent event
    last: u64,
    at: Option<Instant>,
    prev_at: Option<Instant>,
}

impl Tally {
    fn record(&mut self, now: Instant, bytes: u64) {
        self.total += bytes;
        self.last = bytes;
        self.prev_at = self.at.replace(now);
    }

    /// Time between the two most recent events
    fn interval(&self) -> Option<Duration> {
        Some(self.at?.saturating_duration_since(self.prev_at?))
    }
}

#[derive(Clone, Debug, Default)]
pub(super) struct BandwidthEstimation {
    sent: Tally,
    acked: Tally,
    max_filter: MinMax,
    acked_at_window_start: u64,
}

impl BandwidthEstimation {
    pub(super) fn on_sent(&mut self, now: Instant, bytes: u64) {
        self.sent.record(now, bytes);
    }

    pub(super) fn on_ack(
        &mut self,
        now: Instant,
        _sent: Instant,
        bytes: u64,
        round: u64,
        app_limited: bool,
    ) {
        self.acked.record(now, bytes);

        let Some(send_interval) = self.sent.interval() else {
            return;
        };
        // Sends in the same instant say nothing about the sending rate
        let send_rate = match send_interval.is_zero() {
            true => u64::MAX,
            false => Self::bw_from_delta(self.sent.last, send_interval).unwrap_or(0),
        };
        let ack_rate = self
            .acked
            .interval()
            .and_then(|interval| Self::bw_from_delta(self.acked.last, interval))
            .unwrap_or(0);

        let sample = send_rate.min(ack_rate);
        if !app_limited && sample > self.max_filter.get() {
            self.max_filter.update_max(round, sample);
        }
    }

    pub(super) fn bytes_acked_this_window(&self) -> u64 {
        self.acked.total - self.acked_at_window_start
    }

    pub(super) fn end_acks(&mut self, _current_round: u64, _app_limited: bool) {
        self.acked_at_window_start = self.acked.total;
    }

    pub(super) fn get_estimate(&self) -> u64 {
        self.max_filter.get()
    }

    /// Bytes per second for `bytes` delivered over `delta`
    pub(super) const fn bw_from_delta(bytes: u64, delta: Duration) -> Option<u64> {
        let nanos = delta.as_nanos();
        if nanos == 0 {
            return None;
        }
        Some((bytes as u128 * 1_000_000_000 / nanos) as u64)
    }
}

impl fmt::Display for BandwidthEstimation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mib = self.get_estimate() as f64 / (1024.0 * 1024.0);
        write!(f, "{mib:.3} MB/s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_from_delta() {
        assert_eq!(
            BandwidthEstimation::bw_from_delta(1200, Duration::from_millis(1)),
            Some(1_200_000)
        );
        assert_eq!(BandwidthEstimation::bw_from_delta(1200, Duration::ZERO), None);
    }

    #[test]
    fn estimate_tracks_min_of_send_and_ack_rates() {
        let mut bw = BandwidthEstimation::default();
        let start = Instant::now();
        bw.on_sent(start, 1000);
        bw.on_sent(start + Duration::from_millis(10), 1000);
        bw.on_ack(start + Duration::from_millis(50), start, 1000, 1, false);
        bw.on_ack(start + Duration::from_millis(60), start, 1000, 1, false);
        // 1000 bytes per 10ms in both directions
        assert_eq!(bw.get_estimate(), 100_000);
        assert_eq!(bw.bytes_acked_this_window(), 2000);
        bw.end_acks(1, false);
        assert_eq!(bw.bytes_acked_this_window(), 0);
        assert_eq!(bw.to_string(), "0.095 MB/s");
    }
}
