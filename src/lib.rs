//! Sans-IO QUIC transport connection engine
//!
//! `quic-engine` implements the per-connection protocol logic of QUIC version 1: the handshake,
//! reliable streams, unreliable datagrams, loss recovery with pluggable congestion control, path
//! MTU discovery and connection migration. It performs no I/O and never reads a clock. The caller
//! owns the UDP socket and the timer loop: ingress datagrams are fed to [`Connection::recv`],
//! egress datagrams are pulled from [`Connection::send`] until it reports nothing left to send,
//! and [`Connection::on_timeout`] is invoked once the deadline reported by
//! [`Connection::timeout`] passes.
//!
//! Drivers serving many connections keep their own table of [`Connection`]s keyed by connection
//! ID and use [`parse_header`] to route ingress datagrams before handing them over.

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![allow(clippy::too_many_arguments)]

use std::{fmt, ops, time::Duration};

mod coding;
mod constant_time;
mod range_set;
#[cfg(test)]
mod tests;
mod varint;

pub use varint::{VarInt, VarIntBoundsExceeded};

mod config;
pub use config::{CongestionControlAlgorithm, Config, ConfigError, DatagramFullPolicy};

pub mod congestion;
pub use congestion::{StartupExit, StartupExitReason};

mod connection;
pub use connection::{
    BufferTooShort, ConnectError, Connection, ConnectionError, Direction, PathError, PathState,
    PathStats, ReadError, RecvInfo, RttEstimator, SendDatagramError, SendInfo, Stats, StreamError,
    WriteError,
};

mod crypto;

mod frame;
pub use frame::{ApplicationClose, Close, ConnectionClose, FrameType};

mod packet;
pub use packet::{
    Header, PacketDecodeError, PacketType, encode_alpn, generate_cid, is_version_negotiation,
    negotiate_version, parse_header, retry,
};

mod shared;
pub use shared::{ConnectionId, InvalidCidLength, ResetToken};

mod transport_error;
pub use transport_error::{Code as TransportErrorCode, Error as TransportError};

mod transport_parameters;
pub use transport_parameters::PeerTransportParams;

/// The QUIC protocol version implemented
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Maximum length of a connection ID
pub const MAX_CONN_ID_LEN: usize = MAX_CID_SIZE;

/// Smallest UDP payload a client may use to carry its Initial packets
pub const MIN_CLIENT_INITIAL_LEN: usize = MIN_INITIAL_SIZE as usize;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl Dir {
    fn iter() -> impl Iterator<Item = Self> {
        [Self::Bi, Self::Uni].iter().cloned()
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Dir::*;
        f.pad(match *self {
            Bi => "bidirectional",
            Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
///
/// The two low bits encode the initiator and the directionality; the rest is a per-kind index.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(#[doc(hidden)] pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let dir = match self.dir() {
            Dir::Uni => "uni",
            Dir::Bi => "bi",
        };
        write!(
            f,
            "{} {}directional stream {}",
            initiator,
            dir,
            self.index()
        )
    }
}

impl StreamId {
    /// Create a new StreamId
    pub fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self((index << 2) | ((dir as u64) << 1) | initiator as u64)
    }
    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }
    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }
    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl From<u64> for StreamId {
    fn from(x: u64) -> Self {
        Self(x)
    }
}

impl From<StreamId> for u64 {
    fn from(x: StreamId) -> Self {
        x.0
    }
}

impl coding::Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<Self> {
        VarInt::decode(buf).map(|x| Self(x.into_inner()))
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        VarInt::saturating(self.0).encode(buf);
    }
}

pub(crate) use constant_time::eq as constant_time_eq;

/// Entry points for the fuzz targets
#[cfg(fuzzing)]
pub mod fuzzing {
    use bytes::{Bytes, BytesMut};

    use crate::{frame, packet::PartialDecode};

    /// Split a datagram into its coalesced packets, returning the length of each
    ///
    /// Stops at the first packet whose header can't be decoded.
    pub fn split_datagram(datagram: &[u8], local_cid_len: usize) -> Vec<usize> {
        let mut lens = Vec::new();
        let mut remaining = Some(BytesMut::from(datagram));
        while let Some(data) = remaining {
            let Ok((packet, rest)) = PartialDecode::new(data, local_cid_len) else {
                break;
            };
            lens.push(packet.data().len());
            remaining = rest;
        }
        lens
    }

    /// Decode the frames of a decrypted packet payload, returning how many were valid
    pub fn decode_frames(payload: &[u8]) -> usize {
        let Ok(iter) = frame::Iter::new(Bytes::copy_from_slice(payload)) else {
            return 0;
        };
        iter.map_while(Result::ok).count()
    }
}

//
// Useful internal constants
//

const RESET_TOKEN_SIZE: usize = 16;
const MAX_CID_SIZE: usize = 20;
const MIN_INITIAL_SIZE: u16 = 1200;
/// <https://www.rfc-editor.org/rfc/rfc9000.html#name-datagram-size>
const INITIAL_MTU: u16 = 1200;
const MAX_UDP_PAYLOAD: u16 = 65527;
const TIMER_GRANULARITY: Duration = Duration::from_millis(1);
/// Maximum number of streams that can be uniquely identified by a stream ID
const MAX_STREAM_COUNT: u64 = 1 << 60;
/// Number of connection IDs we keep issued to the peer, bounded by its advertised limit
const LOC_CID_COUNT: u64 = 8;

#[cfg(test)]
mod stream_id_tests {
    use super::*;

    #[test]
    fn stream_id_bits() {
        let id = StreamId::new(Side::Server, Dir::Uni, 5);
        assert_eq!(id.0, 23);
        assert_eq!(id.initiator(), Side::Server);
        assert_eq!(id.dir(), Dir::Uni);
        assert_eq!(id.index(), 5);
        assert_eq!(id.to_string(), "server unidirectional stream 5");
        assert_eq!(StreamId::from(0).initiator(), Side::Client);
    }
}
