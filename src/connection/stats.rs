use std::{net::SocketAddr, time::Duration};

use super::PathState;
use crate::congestion::StartupExit;

/// Connection statistics
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct Stats {
    /// QUIC packets sent
    pub sent: u64,
    /// QUIC packets received
    pub recv: u64,
    /// Sent packets declared lost
    pub lost: u64,
    /// Sent packets whose frames had to be retransmitted
    pub retrans: u64,
    /// UDP payload bytes sent
    pub sent_bytes: u64,
    /// UDP payload bytes received
    pub recv_bytes: u64,
    /// Bytes of packets declared lost
    pub lost_bytes: u64,
    /// Stream bytes retransmitted
    pub stream_retrans_bytes: u64,
    /// Number of paths the connection knows about
    pub paths_count: usize,
    /// Received packets dropped as undecodable, duplicate or undecryptable
    pub dropped: u64,
}

/// Statistics about one network path
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PathStats {
    /// Local address of the path
    pub local_addr: SocketAddr,
    /// Peer address of the path
    pub peer_addr: SocketAddr,
    /// Validation state
    pub validation_state: PathState,
    /// Whether the connection currently sends on this path
    pub active: bool,
    /// UDP datagrams received on this path
    pub recv: u64,
    /// QUIC packets sent on this path
    pub sent: u64,
    /// Packets sent on this path and declared lost
    pub lost: u64,
    /// Packets sent on this path whose frames had to be retransmitted
    pub retrans: u64,
    /// Smoothed round-trip time
    pub rtt: Duration,
    /// Minimum round-trip time observed
    pub min_rtt: Duration,
    /// Round-trip time variation
    pub rttvar: Duration,
    /// Congestion window in bytes
    pub cwnd: u64,
    /// Bytes sent on this path
    pub sent_bytes: u64,
    /// Bytes received on this path
    pub recv_bytes: u64,
    /// Bytes of packets lost on this path
    pub lost_bytes: u64,
    /// Bytes acknowledged on this path
    pub acked_bytes: u64,
    /// Current path MTU
    pub pmtu: usize,
    /// Latest delivery rate estimate in bytes per second
    pub delivery_rate: u64,
    /// How the congestion controller left slow start, if it has
    pub startup_exit: Option<StartupExit>,
}
