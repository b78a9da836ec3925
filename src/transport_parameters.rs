//! QUIC transport parameters
//!
//! Each endpoint advertises its connection-level limits and preferences in a TLS extension. The
//! local set is derived from [`Config`](crate::Config); the peer's set is decoded from the
//! handshake and checked for consistency with the connection IDs seen on the wire.

use std::{
    mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6},
    time::Duration,
};

use bytes::{Buf, BufMut};
use rand::{Rng as _, RngCore, seq::SliceRandom as _};
use thiserror::Error;

use crate::{
    LOC_CID_COUNT, MAX_CID_SIZE, MAX_STREAM_COUNT, RESET_TOKEN_SIZE, ResetToken, Side,
    TransportError, VarInt,
    coding::{BufExt, BufMutExt, UnexpectedEnd},
    config::TransportConfig,
    shared::ConnectionId,
};

/// Largest DATAGRAM frame we accept when datagrams are enabled
const MAX_DATAGRAM_FRAME_SIZE: u32 = 65535;

// Every integer-valued parameter with its identifier and RFC default. Encoding, decoding and the
// default constructor are all generated from this one list.
macro_rules! apply_params {
    ($macro:ident) => {
        $macro! {
            // #[doc] name (id) = default,
            /// Milliseconds, disabled if zero
            max_idle_timeout(MaxIdleTimeout) = 0,
            /// Limits the size of UDP payloads that the endpoint is willing to receive
            max_udp_payload_size(MaxUdpPayloadSize) = 65527,

            /// Initial value for the maximum amount of data that can be sent on the connection
            initial_max_data(InitialMaxData) = 0,
            /// Initial flow control limit for locally-initiated bidirectional streams
            initial_max_stream_data_bidi_local(InitialMaxStreamDataBidiLocal) = 0,
            /// Initial flow control limit for peer-initiated bidirectional streams
            initial_max_stream_data_bidi_remote(InitialMaxStreamDataBidiRemote) = 0,
            /// Initial flow control limit for unidirectional streams
            initial_max_stream_data_uni(InitialMaxStreamDataUni) = 0,

            /// Initial maximum number of bidirectional streams the peer may initiate
            initial_max_streams_bidi(InitialMaxStreamsBidi) = 0,
            /// Initial maximum number of unidirectional streams the peer may initiate
            initial_max_streams_uni(InitialMaxStreamsUni) = 0,

            /// Exponent used to decode the ACK Delay field in the ACK frame
            ack_delay_exponent(AckDelayExponent) = 3,
            /// Maximum amount of time in milliseconds by which the endpoint will delay sending
            /// acknowledgments
            max_ack_delay(MaxAckDelay) = 25,
            /// Maximum number of connection IDs from the peer that an endpoint is willing to store
            active_connection_id_limit(ActiveConnectionIdLimit) = 2,
        }
    };
}

macro_rules! make_struct {
    {$($(#[$doc:meta])* $name:ident ($id:ident) = $default:expr,)*} => {
        /// Transport parameters used to negotiate connection-level preferences between peers
        #[derive(Debug, Copy, Clone, Eq, PartialEq)]
        pub(crate) struct TransportParameters {
            $($(#[$doc])* pub(crate) $name : VarInt,)*

            /// The endpoint does not support active connection migration
            pub(crate) disable_active_migration: bool,
            /// Maximum size for datagram frames, absent if datagrams are unsupported
            pub(crate) max_datagram_frame_size: Option<VarInt>,
            /// Source CID of the first Initial packet sent by the endpoint
            pub(crate) initial_src_cid: Option<ConnectionId>,

            // Server-only
            /// Destination CID of the first Initial packet sent by the client
            pub(crate) original_dst_cid: Option<ConnectionId>,
            /// Source CID of the server's Retry packet
            pub(crate) retry_src_cid: Option<ConnectionId>,
            /// Token used by the client to verify a stateless reset from the server
            pub(crate) stateless_reset_token: Option<ResetToken>,
            /// The server's preferred address; decoded for validity, never acted upon
            pub(crate) preferred_address: Option<PreferredAddress>,

            /// Reserved parameter written to exercise the peer's handling of unknown IDs
            pub(crate) grease_transport_parameter: Option<ReservedTransportParameter>,
            /// Order in which parameters are serialized, only set for outgoing parameters
            pub(crate) write_order: Option<[u8; TransportParameterId::SUPPORTED.len()]>,
        }

        impl TransportParameters {
            /// Protocol defaults, used for any parameter the peer does not supply
            pub(crate) fn default() -> Self {
                Self {
                    $($name: VarInt::from_u32($default),)*

                    disable_active_migration: false,
                    max_datagram_frame_size: None,
                    initial_src_cid: None,

                    original_dst_cid: None,
                    retry_src_cid: None,
                    stateless_reset_token: None,
                    preferred_address: None,

                    grease_transport_parameter: None,
                    write_order: None,
                }
            }
        }
    }
}

apply_params!(make_struct);

impl TransportParameters {
    /// Parameters advertised by a local endpoint configured by `config`
    ///
    /// Server-only parameters that depend on the client's first packet are filled in by the
    /// connection once that packet has been seen.
    pub(crate) fn new(
        config: &TransportConfig,
        side: Side,
        initial_src_cid: ConnectionId,
        rng: &mut impl RngCore,
    ) -> Self {
        Self {
            initial_src_cid: Some(initial_src_cid),
            max_idle_timeout: VarInt::saturating(config.max_idle_timeout.as_millis() as u64),
            max_udp_payload_size: VarInt::from(config.max_recv_udp_payload_size),
            initial_max_data: config.initial_max_data,
            initial_max_stream_data_bidi_local: config.initial_max_stream_data_bidi_local,
            initial_max_stream_data_bidi_remote: config.initial_max_stream_data_bidi_remote,
            initial_max_stream_data_uni: config.initial_max_stream_data_uni,
            initial_max_streams_bidi: config.initial_max_streams_bidi,
            initial_max_streams_uni: config.initial_max_streams_uni,
            ack_delay_exponent: VarInt::from(config.ack_delay_exponent),
            max_ack_delay: VarInt::saturating(config.max_ack_delay.as_millis() as u64),
            active_connection_id_limit: if initial_src_cid.is_empty() {
                // Zero-length CIDs can't be replaced, so the default is left unsent
                VarInt::from_u32(2)
            } else {
                VarInt::saturating(config.active_connection_id_limit)
            },
            disable_active_migration: side.is_server() && config.disable_active_migration,
            max_datagram_frame_size: config
                .dgram_enabled
                .then(|| VarInt::from_u32(MAX_DATAGRAM_FRAME_SIZE)),
            grease_transport_parameter: config
                .grease
                .then(|| ReservedTransportParameter::random(rng)),
            write_order: Some({
                let mut order = std::array::from_fn(|i| i as u8);
                if config.grease {
                    order.shuffle(rng);
                }
                order
            }),
            ..Self::default()
        }
    }

    /// Check that parameters accepted alongside 0-RTT are no stricter than the remembered ones
    pub(crate) fn validate_resumption_from(&self, cached: &Self) -> Result<(), TransportError> {
        if cached.active_connection_id_limit > self.active_connection_id_limit
            || cached.initial_max_data > self.initial_max_data
            || cached.initial_max_stream_data_bidi_local > self.initial_max_stream_data_bidi_local
            || cached.initial_max_stream_data_bidi_remote > self.initial_max_stream_data_bidi_remote
            || cached.initial_max_stream_data_uni > self.initial_max_stream_data_uni
            || cached.initial_max_streams_bidi > self.initial_max_streams_bidi
            || cached.initial_max_streams_uni > self.initial_max_streams_uni
            || cached.max_datagram_frame_size > self.max_datagram_frame_size
        {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "0-RTT accepted with incompatible transport parameters",
            ));
        }
        Ok(())
    }

    /// Maximum number of CIDs to issue to this peer
    pub(crate) fn issue_cids_limit(&self) -> u64 {
        self.active_connection_id_limit.0.min(LOC_CID_COUNT)
    }

    /// The peer's idle timeout, if it enabled one
    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        match self.max_idle_timeout.0 {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// A server's preferred address
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct PreferredAddress {
    pub(crate) address_v4: Option<SocketAddrV4>,
    pub(crate) address_v6: Option<SocketAddrV6>,
    pub(crate) connection_id: ConnectionId,
    pub(crate) stateless_reset_token: ResetToken,
}

impl PreferredAddress {
    fn wire_size(&self) -> usize {
        // address and port for each family, then the length-prefixed CID and the reset token
        (4 + 2) + (16 + 2) + 1 + self.connection_id.len() + RESET_TOKEN_SIZE
    }

    fn write<W: BufMut>(&self, w: &mut W) {
        let (ip4, port4) = self
            .address_v4
            .map_or((Ipv4Addr::UNSPECIFIED, 0), |a| (*a.ip(), a.port()));
        let (ip6, port6) = self
            .address_v6
            .map_or((Ipv6Addr::UNSPECIFIED, 0), |a| (*a.ip(), a.port()));
        w.write(ip4);
        w.write::<u16>(port4);
        w.write(ip6);
        w.write::<u16>(port6);
        w.write(self.connection_id.len() as u8);
        w.put_slice(&self.connection_id);
        w.put_slice(&self.stateless_reset_token);
    }

    fn read<R: Buf>(r: &mut R) -> Result<Self, Error> {
        let ip4 = r.get::<Ipv4Addr>()?;
        let port4 = r.get::<u16>()?;
        let ip6 = r.get::<Ipv6Addr>()?;
        let port6 = r.get::<u16>()?;
        // An all-zero address and port means the family is absent
        let address_v4 =
            (!ip4.is_unspecified() || port4 != 0).then(|| SocketAddrV4::new(ip4, port4));
        let address_v6 =
            (!ip6.is_unspecified() || port6 != 0).then(|| SocketAddrV6::new(ip6, port6, 0, 0));

        let cid_len = usize::from(r.get::<u8>()?);
        if cid_len > MAX_CID_SIZE || r.remaining() < cid_len + RESET_TOKEN_SIZE {
            return Err(Error::Malformed);
        }
        let connection_id = ConnectionId::from_buf(r, cid_len);
        let mut token = [0; RESET_TOKEN_SIZE];
        r.copy_to_slice(&mut token);

        if address_v4.is_none() && address_v6.is_none() {
            return Err(Error::IllegalValue);
        }
        Ok(Self {
            address_v4,
            address_v6,
            connection_id,
            stateless_reset_token: token.into(),
        })
    }
}

/// Errors encountered while decoding transport parameters
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub(crate) enum Error {
    /// Parameters that are semantically invalid
    #[error("parameter had illegal value")]
    IllegalValue,
    /// Catch-all error for problems while decoding transport parameters
    #[error("parameters were malformed")]
    Malformed,
}

impl From<Error> for TransportError {
    fn from(e: Error) -> Self {
        let reason = match e {
            Error::IllegalValue => "illegal value",
            Error::Malformed => "malformed",
        };
        Self::TRANSPORT_PARAMETER_ERROR(reason)
    }
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Self::Malformed
    }
}

macro_rules! make_integer_access {
    {$($(#[$doc:meta])* $name:ident ($id:ident) = $default:expr,)*} => {
        impl TransportParameters {
            /// Value of the integer parameter `id` along with its protocol default
            fn integer(&self, id: TransportParameterId) -> Option<(VarInt, u32)> {
                match id {
                    $(TransportParameterId::$id => Some((self.$name, $default)),)*
                    _ => None,
                }
            }

            fn integer_mut(&mut self, id: TransportParameterId) -> Option<&mut VarInt> {
                match id {
                    $(TransportParameterId::$id => Some(&mut self.$name),)*
                    _ => None,
                }
            }
        }
    }
}

apply_params!(make_integer_access);

impl TransportParameters {
    /// Encode into `w`
    pub(crate) fn write<W: BufMut>(&self, w: &mut W) {
        let order = self
            .write_order
            .unwrap_or_else(|| std::array::from_fn(|i| i as u8));
        for idx in order {
            self.write_param(TransportParameterId::SUPPORTED[usize::from(idx)], w);
        }
    }

    fn write_param<W: BufMut>(&self, id: TransportParameterId, w: &mut W) {
        use TransportParameterId as Id;

        if let Some((value, default)) = self.integer(id) {
            // Parameters at their default are left for the peer to assume
            if value.0 != u64::from(default) {
                put_param(w, id, value.size(), |w| w.write(value));
            }
            return;
        }

        let cid = match id {
            Id::OriginalDestinationConnectionId => self.original_dst_cid,
            Id::InitialSourceConnectionId => self.initial_src_cid,
            Id::RetrySourceConnectionId => self.retry_src_cid,
            Id::ReservedTransportParameter => {
                if let Some(param) = &self.grease_transport_parameter {
                    param.write(w);
                }
                return;
            }
            Id::StatelessResetToken => {
                if let Some(token) = &self.stateless_reset_token {
                    put_param(w, id, RESET_TOKEN_SIZE, |w| w.put_slice(token));
                }
                return;
            }
            Id::DisableActiveMigration => {
                if self.disable_active_migration {
                    put_param(w, id, 0, |_| {});
                }
                return;
            }
            Id::MaxDatagramFrameSize => {
                if let Some(max) = self.max_datagram_frame_size {
                    put_param(w, id, max.size(), |w| w.write(max));
                }
                return;
            }
            Id::PreferredAddress => {
                if let Some(addr) = &self.preferred_address {
                    put_param(w, id, addr.wire_size(), |w| addr.write(w));
                }
                return;
            }
            _ => return,
        };
        if let Some(cid) = cid {
            put_param(w, id, cid.len(), |w| w.put_slice(&cid));
        }
    }

    /// Decode parameters sent by the peer of an endpoint on `side`
    pub(crate) fn read<R: Buf>(side: Side, r: &mut R) -> Result<Self, Error> {
        let mut params = Self::default();
        let mut seen = [false; TransportParameterId::SUPPORTED.len()];

        while r.has_remaining() {
            let id = r.get_var()?;
            let len = r.get_var()?;
            if (r.remaining() as u64) < len {
                return Err(Error::Malformed);
            }
            let mut body = r.take(len as usize);

            let known = TransportParameterId::SUPPORTED
                .iter()
                .position(|&x| x as u64 == id)
                .filter(|&idx| {
                    TransportParameterId::SUPPORTED[idx]
                        != TransportParameterId::ReservedTransportParameter
                });
            let Some(idx) = known else {
                // Unknown and reserved parameters are skipped
                body.advance(body.remaining());
                continue;
            };
            if mem::replace(&mut seen[idx], true) {
                return Err(Error::Malformed);
            }
            params.read_param(TransportParameterId::SUPPORTED[idx], &mut body)?;
            if body.has_remaining() {
                return Err(Error::Malformed);
            }
        }

        params.validate(side)?;
        Ok(params)
    }

    /// Decode the value of `id`, which must consume all of `body`
    fn read_param(&mut self, id: TransportParameterId, body: &mut impl Buf) -> Result<(), Error> {
        use TransportParameterId as Id;

        if let Some(slot) = self.integer_mut(id) {
            *slot = body.get::<VarInt>()?;
            return Ok(());
        }

        match id {
            Id::OriginalDestinationConnectionId => self.original_dst_cid = Some(read_cid(body)?),
            Id::InitialSourceConnectionId => self.initial_src_cid = Some(read_cid(body)?),
            Id::RetrySourceConnectionId => self.retry_src_cid = Some(read_cid(body)?),
            Id::StatelessResetToken => {
                if body.remaining() != RESET_TOKEN_SIZE {
                    return Err(Error::Malformed);
                }
                let mut token = [0; RESET_TOKEN_SIZE];
                body.copy_to_slice(&mut token);
                self.stateless_reset_token = Some(token.into());
            }
            Id::DisableActiveMigration => self.disable_active_migration = true,
            Id::MaxDatagramFrameSize => {
                self.max_datagram_frame_size = Some(body.get::<VarInt>()?);
            }
            Id::PreferredAddress => self.preferred_address = Some(PreferredAddress::read(body)?),
            _ => {}
        }
        Ok(())
    }

    /// Reject values that RFC 9000 §18.2 forbids
    fn validate(&self, side: Side) -> Result<(), Error> {
        let out_of_range = self.ack_delay_exponent.0 > 20
            || self.max_ack_delay.0 >= 1 << 14
            || self.active_connection_id_limit.0 < 2
            || self.max_udp_payload_size.0 < 1200
            || self.initial_max_streams_bidi.0.max(self.initial_max_streams_uni.0)
                > MAX_STREAM_COUNT;
        // Only a server may send these
        let server_only = self.original_dst_cid.is_some()
            || self.retry_src_cid.is_some()
            || self.stateless_reset_token.is_some()
            || self.preferred_address.is_some();
        let empty_preferred_cid = self
            .preferred_address
            .is_some_and(|x| x.connection_id.is_empty());

        if out_of_range || (side.is_server() && server_only) || empty_preferred_cid {
            return Err(Error::IllegalValue);
        }
        Ok(())
    }
}

fn put_param<W: BufMut>(
    w: &mut W,
    id: TransportParameterId,
    len: usize,
    body: impl FnOnce(&mut W),
) {
    w.write_var(id as u64);
    w.write_var(len as u64);
    body(w);
}

fn read_cid(body: &mut impl Buf) -> Result<ConnectionId, Error> {
    let len = body.remaining();
    if len > MAX_CID_SIZE {
        return Err(Error::Malformed);
    }
    Ok(ConnectionId::from_buf(body, len))
}

/// A transport parameter with an ID of the form `31 * N + 27` and arbitrary contents
///
/// Receivers must ignore it; sending one keeps that requirement exercised.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct ReservedTransportParameter {
    id: VarInt,
    payload: [u8; Self::MAX_PAYLOAD_LEN],
    payload_len: usize,
}

impl ReservedTransportParameter {
    const MAX_PAYLOAD_LEN: usize = 16;

    fn random(rng: &mut impl RngCore) -> Self {
        let id = Self::generate_reserved_id(rng);
        let payload_len = rng.random_range(0..Self::MAX_PAYLOAD_LEN);
        let mut payload = [0u8; Self::MAX_PAYLOAD_LEN];
        rng.fill_bytes(&mut payload[..payload_len]);
        Self {
            id,
            payload,
            payload_len,
        }
    }

    fn write(&self, w: &mut impl BufMut) {
        w.write_var(self.id.0);
        w.write_var(self.payload_len as u64);
        w.put_slice(&self.payload[..self.payload_len]);
    }

    fn generate_reserved_id(rng: &mut impl RngCore) -> VarInt {
        let n = rng.random_range(0u64..((1 << 62) - 27) / 31);
        VarInt(31 * n + 27)
    }
}

#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportParameterId {
    // https://www.rfc-editor.org/rfc/rfc9000.html#iana-tp-table
    OriginalDestinationConnectionId = 0x00,
    MaxIdleTimeout = 0x01,
    StatelessResetToken = 0x02,
    MaxUdpPayloadSize = 0x03,
    InitialMaxData = 0x04,
    InitialMaxStreamDataBidiLocal = 0x05,
    InitialMaxStreamDataBidiRemote = 0x06,
    InitialMaxStreamDataUni = 0x07,
    InitialMaxStreamsBidi = 0x08,
    InitialMaxStreamsUni = 0x09,
    AckDelayExponent = 0x0A,
    MaxAckDelay = 0x0B,
    DisableActiveMigration = 0x0C,
    PreferredAddress = 0x0D,
    ActiveConnectionIdLimit = 0x0E,
    InitialSourceConnectionId = 0x0F,
    RetrySourceConnectionId = 0x10,

    // Smallest reserved ID, https://www.rfc-editor.org/rfc/rfc9000.html#section-22.3
    ReservedTransportParameter = 0x1B,

    // https://www.rfc-editor.org/rfc/rfc9221.html#section-3
    MaxDatagramFrameSize = 0x20,
}

impl TransportParameterId {
    const SUPPORTED: [Self; 19] = [
        Self::MaxIdleTimeout,
        Self::MaxUdpPayloadSize,
        Self::InitialMaxData,
        Self::InitialMaxStreamDataBidiLocal,
        Self::InitialMaxStreamDataBidiRemote,
        Self::InitialMaxStreamDataUni,
        Self::InitialMaxStreamsBidi,
        Self::InitialMaxStreamsUni,
        Self::AckDelayExponent,
        Self::MaxAckDelay,
        Self::ActiveConnectionIdLimit,
        Self::ReservedTransportParameter,
        Self::StatelessResetToken,
        Self::DisableActiveMigration,
        Self::MaxDatagramFrameSize,
        Self::PreferredAddress,
        Self::OriginalDestinationConnectionId,
        Self::InitialSourceConnectionId,
        Self::RetrySourceConnectionId,
    ];
}

impl TryFrom<u64> for TransportParameterId {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::SUPPORTED
            .iter()
            .copied()
            .find(|&id| id as u64 == value)
            .ok_or(())
    }
}

/// Transport parameters advertised by the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerTransportParams {
    /// Idle timeout, `None` if the peer disabled it
    pub max_idle_timeout: Option<Duration>,
    /// Largest UDP payload the peer is willing to receive
    pub max_udp_payload_size: u64,
    /// Connection-level flow control limit
    pub initial_max_data: u64,
    /// Flow control limit for bidirectional streams we open
    pub initial_max_stream_data_bidi_local: u64,
    /// Flow control limit for bidirectional streams the peer opens
    pub initial_max_stream_data_bidi_remote: u64,
    /// Flow control limit for unidirectional streams
    pub initial_max_stream_data_uni: u64,
    /// Number of bidirectional streams we may open
    pub initial_max_streams_bidi: u64,
    /// Number of unidirectional streams we may open
    pub initial_max_streams_uni: u64,
    /// Exponent applied to the ACK delay field of the peer's ACK frames
    pub ack_delay_exponent: u64,
    /// Upper bound on the peer's acknowledgement delay
    pub max_ack_delay: Duration,
    /// Number of connection IDs the peer is willing to store
    pub active_connection_id_limit: u64,
    /// Largest DATAGRAM frame the peer accepts, `None` if it doesn't support datagrams
    pub max_datagram_frame_size: Option<u64>,
    /// Whether the peer forbids migrating to a new address
    pub disable_active_migration: bool,
}

impl From<&TransportParameters> for PeerTransportParams {
    fn from(params: &TransportParameters) -> Self {
        Self {
            max_idle_timeout: params.idle_timeout(),
            max_udp_payload_size: params.max_udp_payload_size.0,
            initial_max_data: params.initial_max_data.0,
            initial_max_stream_data_bidi_local: params.initial_max_stream_data_bidi_local.0,
            initial_max_stream_data_bidi_remote: params.initial_max_stream_data_bidi_remote.0,
            initial_max_stream_data_uni: params.initial_max_stream_data_uni.0,
            initial_max_streams_bidi: params.initial_max_streams_bidi.0,
            initial_max_streams_uni: params.initial_max_streams_uni.0,
            ack_delay_exponent: params.ack_delay_exponent.0,
            max_ack_delay: Duration::from_millis(params.max_ack_delay.0),
            active_connection_id_limit: params.active_connection_id_limit.0,
            max_datagram_frame_size: params.max_datagram_frame_size.map(VarInt::into_inner),
            disable_active_migration: params.disable_active_migration,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;

    #[test]
    fn coding() {
        let mut buf = Vec::new();
        let params = TransportParameters {
            initial_src_cid: Some(ConnectionId::new(&[])),
            original_dst_cid: Some(ConnectionId::new(&[])),
            initial_max_streams_bidi: 16u32.into(),
            initial_max_streams_uni: 16u32.into(),
            ack_delay_exponent: 2u32.into(),
            max_udp_payload_size: 1200u32.into(),
            max_datagram_frame_size: Some(1350u32.into()),
            disable_active_migration: true,
            stateless_reset_token: Some([0x11; RESET_TOKEN_SIZE].into()),
            preferred_address: Some(PreferredAddress {
                address_v4: Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 42)),
                address_v6: Some(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 24, 0, 0)),
                connection_id: ConnectionId::new(&[0x42]),
                stateless_reset_token: [0xab; RESET_TOKEN_SIZE].into(),
            }),
            ..TransportParameters::default()
        };
        params.write(&mut buf);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut buf.as_slice()).unwrap(),
            params
        );
    }

    #[test]
    fn local_params_from_config() {
        let mut config = Config::new(crate::PROTOCOL_VERSION).unwrap();
        config.set_initial_max_data(10_000_000);
        config.set_initial_max_streams_bidi(100);
        config.enable_dgram(true, 10, 10);
        let cid = ConnectionId::new(&[1, 2, 3, 4]);
        let params =
            TransportParameters::new(&config.transport, Side::Client, cid, &mut rand::rng());
        assert_eq!(params.initial_max_data, VarInt(10_000_000));
        assert_eq!(params.initial_max_streams_bidi, VarInt(100));
        assert_eq!(params.initial_src_cid, Some(cid));
        assert!(params.max_datagram_frame_size.is_some());
        assert!(!params.disable_active_migration);

        let mut buf = Vec::new();
        params.write(&mut buf);
        let decoded = TransportParameters::read(Side::Server, &mut buf.as_slice()).unwrap();
        assert_eq!(decoded.initial_max_data, params.initial_max_data);
        assert_eq!(decoded.grease_transport_parameter, None);
        assert_eq!(decoded.write_order, None);
    }

    #[test]
    fn reserved_ids() {
        let mut rng = rand::rng();
        for _ in 0..64 {
            let param = ReservedTransportParameter::random(&mut rng);
            assert_eq!(param.id.0 % 31, 27);
            assert!(param.payload_len < ReservedTransportParameter::MAX_PAYLOAD_LEN);
        }
    }

    #[test]
    fn reserved_transport_parameter_ignored_when_read() {
        let mut buf = Vec::new();
        let reserved_parameter = ReservedTransportParameter::random(&mut rand::rng());
        reserved_parameter.write(&mut buf);
        assert!(!buf.is_empty());
        let read_params = TransportParameters::read(Side::Server, &mut buf.as_slice()).unwrap();
        assert_eq!(read_params, TransportParameters::default());
    }

    #[test]
    fn server_only_params_rejected_from_client() {
        let params = TransportParameters {
            stateless_reset_token: Some([0xab; RESET_TOKEN_SIZE].into()),
            ..TransportParameters::default()
        };
        let mut buf = Vec::new();
        params.write(&mut buf);
        assert_eq!(
            TransportParameters::read(Side::Server, &mut buf.as_slice()),
            Err(Error::IllegalValue)
        );
    }

    #[test]
    fn duplicate_parameter_rejected() {
        let mut buf = Vec::new();
        for _ in 0..2 {
            buf.write_var(TransportParameterId::InitialMaxData as u64);
            buf.write_var(1);
            buf.write_var(5);
        }
        assert_eq!(
            TransportParameters::read(Side::Client, &mut buf.as_slice()),
            Err(Error::Malformed)
        );
    }

    #[test]
    fn semantic_validation() {
        let params = TransportParameters {
            active_connection_id_limit: VarInt(1),
            ..TransportParameters::default()
        };
        let mut buf = Vec::new();
        params.write(&mut buf);
        assert_eq!(
            TransportParameters::read(Side::Client, &mut buf.as_slice()),
            Err(Error::IllegalValue)
        );
    }

    #[test]
    fn resumption_params_validation() {
        let high_limit = TransportParameters {
            initial_max_streams_uni: 32u32.into(),
            ..TransportParameters::default()
        };
        let low_limit = TransportParameters {
            initial_max_streams_uni: 16u32.into(),
            ..TransportParameters::default()
        };
        high_limit.validate_resumption_from(&low_limit).unwrap();
        low_limit.validate_resumption_from(&high_limit).unwrap_err();
    }
}
