//! Logic for controlling the rate at which data is sent

use std::time::Instant;

use crate::connection::RttEstimator;

pub mod bbr;
pub mod cubic;
mod hystart;
pub mod new_reno;

pub use bbr::{Bbr, BbrConfig};
pub use cubic::{Cubic, CubicConfig};
pub use new_reno::{NewReno, NewRenoConfig};

/// Common interface for different congestion controllers
pub trait Controller: Send + Sync {
    /// One or more packets were just sent
    #[allow(unused_variables)]
    fn on_sent(&mut self, now: Instant, bytes: u64, last_packet_number: u64) {}

    /// Packet deliveries were confirmed
    ///
    /// `app_limited` indicates whether the connection was blocked on outgoing
    /// application data prior to receiving these acknowledgements.
    #[allow(unused_variables)]
    fn on_ack(
        &mut self,
        now: Instant,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &RttEstimator,
    ) {
    }

    /// Packets are acked in batches, all with the same `now` argument. This indicates one of
    /// those batches has completed.
    #[allow(unused_variables)]
    fn on_end_acks(
        &mut self,
        now: Instant,
        in_flight: u64,
        app_limited: bool,
        largest_packet_num_acked: Option<u64>,
    ) {
    }

    /// Packets were deemed lost
    ///
    /// `is_persistent_congestion` indicates whether all packets sent within the persistent
    /// congestion threshold period ending when the most recent packet in this batch was sent
    /// were lost.
    fn on_congestion_event(
        &mut self,
        now: Instant,
        sent: Instant,
        is_persistent_congestion: bool,
        lost_bytes: u64,
    );

    /// The known MTU for the current network path has been updated
    fn on_mtu_update(&mut self, new_mtu: u16);

    /// Number of ack-eliciting bytes that may be in flight
    fn window(&self) -> u64;

    /// Slow start threshold in bytes, for algorithms that have one
    fn ssthresh(&self) -> Option<u64> {
        None
    }

    /// Rate in bytes per second the controller wants packets paced at
    ///
    /// `None` lets the pacer derive a rate from the window and the smoothed RTT.
    fn pacing_rate(&self) -> Option<u64> {
        None
    }

    /// How and when the controller left its startup phase, if it has
    fn startup_exit(&self) -> Option<StartupExit> {
        None
    }

    /// Duplicate the controller's state
    fn clone_box(&self) -> Box<dyn Controller>;

    /// Initial congestion window
    fn initial_window(&self) -> u64;
}

/// Record of a congestion controller leaving slow start
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StartupExit {
    /// What made the controller leave startup
    pub reason: StartupExitReason,
    /// Congestion window at the time of exit, in bytes
    pub cwnd: u64,
    /// Estimated delivery rate at the time of exit, in bytes per second
    pub bandwidth: Option<u64>,
}

/// Reason a congestion controller left its startup phase
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StartupExitReason {
    /// A packet was declared lost
    Loss,
    /// The delivery rate stopped growing
    BandwidthPlateau,
    /// Round-trip times rose, showing a queue building up at the bottleneck
    PersistentQueue,
}

/// Bytes per second delivered by a window's worth of data over `rtt`
fn window_bandwidth(window: u64, rtt: std::time::Duration) -> Option<u64> {
    let micros = rtt.as_micros() as u64;
    if micros == 0 {
        return None;
    }
    Some(window.saturating_mul(1_000_000) / micros)
}

const BASE_DATAGRAM_SIZE: u64 = 1200;

/// Recommended initial window: `min(10 * max_datagram_size, max(2 * max_datagram_size, 14720))`
fn initial_window(max_datagram_size: u64) -> u64 {
    14720.max(2 * max_datagram_size).min(10 * max_datagram_size)
}

/// Recommended minimum window: `2 * max_datagram_size`
fn minimum_window(max_datagram_size: u64) -> u64 {
    2 * max_datagram_size
}
