//! Pacing of packet transmissions

use std::time::{Duration, Instant};

use tracing::warn;

/// Interval in which a burst of packets is released
const BURST_INTERVAL: Duration = Duration::from_millis(2);
/// Bounds on a burst, in packets
const MIN_BURST_SIZE: u64 = 10;
const MAX_BURST_SIZE: u64 = 256;

/// A token-bucket pacer for smoothing packet transmissions over time
///
/// Tokens accumulate at the pacing rate, up to the bucket's capacity. When enough tokens are
/// available a packet can be sent immediately; otherwise transmission is delayed until the
/// bucket refills.
///
/// The rate comes from the congestion controller when it models one (BBR). Otherwise it is
/// derived from the window as `cwnd * 1.25 / smoothed_rtt`, so that a window's worth of data is
/// spread over 4/5 of the RTT. Either way it is capped by the configured maximum.
#[derive(Debug, Clone)]
pub(super) struct Pacer {
    /// Upper bound on the rate in bytes/second, if configured
    max_rate: Option<u64>,
    /// Token refill rate in bytes/second, `None` while no rate can be derived
    rate: Option<u64>,
    /// Maximum burst size in bytes
    capacity: u64,
    last_window: u64,
    last_mtu: u16,
    last_controller_rate: Option<u64>,
    /// Available send budget in bytes
    tokens: u64,
    /// Timestamp of the last token refill
    prev: Instant,
}

impl Pacer {
    pub(super) fn new(
        max_rate: Option<u64>,
        smoothed_rtt: Duration,
        window: u64,
        mtu: u16,
        now: Instant,
    ) -> Self {
        let (rate, capacity) = pacing_params(max_rate, None, smoothed_rtt, window, mtu);
        Self {
            max_rate,
            rate,
            capacity,
            last_window: window,
            last_mtu: mtu,
            last_controller_rate: None,
            tokens: capacity,
            prev: now,
        }
    }

    /// Record that a packet has been transmitted
    pub(super) fn on_transmit(&mut self, packet_length: u16) {
        self.tokens = self.tokens.saturating_sub(packet_length.into())
    }

    /// Current pacing rate in bytes per second
    pub(super) fn rate(&self) -> Option<u64> {
        self.rate
    }

    /// Return when `bytes_to_send` may be sent, or `None` if it can be sent right away
    pub(super) fn delay(
        &mut self,
        smoothed_rtt: Duration,
        bytes_to_send: u64,
        mtu: u16,
        window: u64,
        controller_rate: Option<u64>,
        now: Instant,
    ) -> Option<Instant> {
        debug_assert_ne!(window, 0, "zero-sized congestion window");

        if window != self.last_window
            || mtu != self.last_mtu
            || controller_rate != self.last_controller_rate
        {
            let (rate, capacity) =
                pacing_params(self.max_rate, controller_rate, smoothed_rtt, window, mtu);
            self.rate = rate;
            self.capacity = capacity;
            self.tokens = self.capacity.min(self.tokens);
            self.last_window = window;
            self.last_mtu = mtu;
            self.last_controller_rate = controller_rate;
        } else if self.rate.is_none() && controller_rate.is_none() && !smoothed_rtt.is_zero() {
            // The RTT only became known after construction
            let (rate, capacity) = pacing_params(self.max_rate, None, smoothed_rtt, window, mtu);
            self.rate = rate;
            self.capacity = capacity;
            self.tokens = self.capacity.min(self.tokens);
        }

        let rate = self.rate?;

        // A full bucket is always sufficient, so an oversized packet can't stall forever
        let send_threshold = bytes_to_send.min(self.capacity);
        if self.tokens >= send_threshold {
            return None;
        }

        let elapsed = now.checked_duration_since(self.prev).unwrap_or_else(|| {
            warn!("received a timestamp earlier than a previous recorded time, ignoring");
            Duration::ZERO
        });
        let new_tokens = (rate as f64 * elapsed.as_secs_f64()).round() as u64;
        self.tokens = self.tokens.saturating_add(new_tokens).min(self.capacity);
        // Polled faster than tokens are generated; let time accumulate
        if new_tokens > 0 {
            self.prev = now;
        }

        if self.tokens >= send_threshold {
            return None;
        }

        let unscaled_delay = send_threshold - self.tokens;
        Some(now + Duration::from_secs_f64(unscaled_delay as f64 / rate as f64))
    }
}

/// Returns `(rate, capacity)`; `rate` is `None` if pacing can't be applied yet
fn pacing_params(
    max_rate: Option<u64>,
    controller_rate: Option<u64>,
    smoothed_rtt: Duration,
    window: u64,
    mtu: u16,
) -> (Option<u64>, u64) {
    let mtu = u64::from(mtu);
    let rate = controller_rate
        .filter(|&rate| rate != 0)
        .or_else(|| {
            if smoothed_rtt.is_zero() {
                return None;
            }
            let rate = (window as f64 * 1.25 / smoothed_rtt.as_secs_f64()).round() as u64;
            (rate != 0).then_some(rate)
        })
        .map(|rate| match max_rate {
            Some(max) if max != 0 => rate.min(max),
            _ => rate,
        });

    let capacity = match rate {
        Some(rate) => (rate as u128 * BURST_INTERVAL.as_nanos() / 1_000_000_000) as u64,
        None => MAX_BURST_SIZE * mtu,
    };
    let capacity = capacity.clamp(MIN_BURST_SIZE * mtu, MAX_BURST_SIZE * mtu);
    (rate, capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_panic_on_bad_instant() {
        let old_instant = Instant::now();
        let new_instant = old_instant + Duration::from_micros(15);
        let rtt = Duration::from_micros(400);

        assert!(
            Pacer::new(None, rtt, 30000, 1500, new_instant)
                .delay(Duration::from_micros(0), 0, 1500, 1, None, old_instant)
                .is_none()
        );
        assert!(
            Pacer::new(None, rtt, 30000, 1500, new_instant)
                .delay(rtt, 1500, 1500, 3000, None, old_instant)
                .is_none()
        );
    }

    #[test]
    fn rate_derived_from_window() {
        let now = Instant::now();
        let rtt = Duration::from_millis(50);
        let pacer = Pacer::new(None, rtt, 2_000_000, 1500, now);
        assert_eq!(pacer.rate(), Some(50_000_000));
        // 50 MB/s over 2ms is 100 KB, within the burst bounds
        assert_eq!(pacer.capacity, 100_000);
        assert_eq!(pacer.tokens, pacer.capacity);
    }

    #[test]
    fn zero_rtt_disables_pacing() {
        let now = Instant::now();
        let mut pacer = Pacer::new(None, Duration::ZERO, 12000, 1200, now);
        assert_eq!(pacer.rate(), None);
        for _ in 0..1000 {
            assert!(
                pacer
                    .delay(Duration::ZERO, 1200, 1200, 12000, None, now)
                    .is_none()
            );
            pacer.on_transmit(1200);
        }
    }

    #[test]
    fn max_rate_caps_pacing() {
        let now = Instant::now();
        let pacer = Pacer::new(Some(1_000_000), Duration::from_millis(10), 2_000_000, 1200, now);
        assert_eq!(pacer.rate(), Some(1_000_000));
        assert_eq!(pacer.capacity, MIN_BURST_SIZE * 1200);
    }

    #[test]
    fn controller_rate_takes_precedence() {
        let now = Instant::now();
        let rtt = Duration::from_millis(50);
        let mut pacer = Pacer::new(None, rtt, 2_000_000, 1500, now);
        pacer.delay(rtt, 1500, 1500, 2_000_000, Some(3_000_000), now);
        assert_eq!(pacer.rate(), Some(3_000_000));
    }

    #[test]
    fn computes_pause_correctly() {
        let window = 2_000_000u64;
        let mtu = 1000;
        let rtt = Duration::from_millis(50);
        let old_instant = Instant::now();

        let mut pacer = Pacer::new(None, rtt, window, mtu, old_instant);
        let packet_capacity = pacer.capacity / mtu as u64;

        for _ in 0..packet_capacity {
            assert_eq!(
                pacer.delay(rtt, mtu as u64, mtu, window, None, old_instant),
                None,
                "When capacity is available packets should be sent immediately"
            );
            pacer.on_transmit(mtu);
        }

        let pace_duration = Duration::from_nanos((rtt.as_nanos() * 4 / 5) as u64 / 2000);
        let actual_delay = pacer
            .delay(rtt, mtu as u64, mtu, window, None, old_instant)
            .expect("Send must be delayed")
            .duration_since(old_instant);

        let diff = actual_delay.abs_diff(pace_duration);
        assert!(
            diff < Duration::from_nanos(2),
            "expected a delay of {pace_duration:?} but got {actual_delay:?}"
        );

        // Refills after one burst interval
        assert_eq!(
            pacer.delay(
                rtt,
                mtu as u64,
                mtu,
                window,
                None,
                old_instant + BURST_INTERVAL
            ),
            None
        );
    }
}
