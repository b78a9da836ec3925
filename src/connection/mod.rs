use std::{
    cmp, fmt, mem,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use rand::{SeedableRng, rngs::StdRng};
use thiserror::Error;
use tracing::{debug, trace, trace_span, warn};

use crate::{
    Config, ConnectionId, DatagramFullPolicy, InvalidCidLength, MAX_STREAM_COUNT, ResetToken,
    Side, StreamId, TransportError, VarInt,
    config::TransportConfig,
    crypto::{self, HeaderKey, KeyPair, Keys, PacketKey, rustls::TlsSession},
    frame::{self, ApplicationClose, Close, ConnectionClose, FrameStruct},
    packet::SpaceId,
    transport_parameters::{PeerTransportParams, TransportParameters},
};

mod assembler;

mod cid_state;
use cid_state::{LocalCids, PeerCids};

mod datagrams;
use datagrams::DatagramQueue;
pub use datagrams::SendDatagramError;

mod migration;

mod mtud;

mod pacing;

mod packet_builder;

mod paths;
use paths::{PathData, PathId};
pub use paths::{PathState, RttEstimator};

mod receive;

mod recovery;

mod send_buffer;

mod spaces;
use spaces::{PacketSpace, SentPacket};

mod state;
use state::State;

mod stats;
pub use stats::{PathStats, Stats};

mod streams;
use streams::StreamsState;
pub use streams::{Direction, ReadError, StreamError, WriteError};

mod timer;
use timer::{ConnTimer, PathTimer, Timer, TimerTable};

mod transmit;

/// Length of the random destination CID a client addresses its first Initial packets to
const CLIENT_INITIAL_DCID_LEN: usize = 16;

/// Protocol state and logic for a single QUIC connection
///
/// Objects of this type receive UDP payloads through [`recv`](Self::recv), produce UDP payloads to
/// transmit through [`send`](Self::send), and never perform I/O or read the clock themselves. The
/// caller must call [`send`](Self::send) until it returns `Ok(None)` after every `recv`,
/// `on_timeout` and application call, and arrange for [`on_timeout`](Self::on_timeout) to be
/// called at the instant reported by [`timeout_instant`](Self::timeout_instant).
///
/// A connection is single-threaded: calls must be serialized by the owner. Separate connections
/// share no state.
pub struct Connection {
    side: Side,
    version: u32,
    config: TransportConfig,
    state: State,
    rng: StdRng,
    /// TLS session, created by a server once the client's first Initial reveals the DCID its
    /// keys are derived from
    crypto: Option<Box<dyn crypto::Session>>,
    /// TLS configuration a server builds its session from
    server_tls: Option<Arc<rustls::ServerConfig>>,
    local_params: TransportParameters,
    peer_params: Option<TransportParameters>,

    local_cids: LocalCids,
    peer_cids: PeerCids,
    /// The source CID of our long-header packets
    handshake_cid: ConnectionId,
    /// The source CID the peer uses in its long-header packets
    rem_handshake_cid: ConnectionId,
    /// The destination CID of the client's first Initial packet
    initial_dst_cid: ConnectionId,
    /// On a server that sent a Retry, the destination CID of the client's very first Initial
    orig_dst_cid: Option<ConnectionId>,
    /// The source CID of the Retry packet, on both sides
    retry_src_cid: Option<ConnectionId>,
    /// Token a client echoes in its Initial packets after a Retry
    retry_token: Bytes,

    spaces: [PacketSpace; 3],
    /// Highest packet number space we have keys for
    highest_space: SpaceId,
    zero_rtt_crypto: Option<ZeroRttCrypto>,
    /// Whether 0-RTT keys were ever available
    zero_rtt_enabled: bool,
    accepted_0rtt: bool,
    /// Current 1-RTT key phase
    key_phase: bool,
    /// 1-RTT keys of the previous key phase, kept briefly to read reordered packets
    prev_crypto: Option<PrevCrypto>,
    /// 1-RTT keys of the next key phase
    next_crypto: Option<KeyPair<Box<dyn PacketKey>>>,
    handshake_confirmed: bool,
    /// Packets that failed authentication under the current 1-RTT keys
    authentication_failures: u64,

    paths: Vec<PathData>,
    active_path: PathId,
    /// Incremented whenever a path slot is (re)used
    path_generation: u64,

    streams: StreamsState,
    dgram_send: DatagramQueue,
    dgram_recv: DatagramQueue,

    timers: TimerTable,
    /// Negotiated idle timeout, `None` if neither side enabled one
    idle_timeout: Option<Duration>,
    /// Whether the idle timer should be reset the next time an ack-eliciting packet is sent
    permit_idle_reset: bool,
    /// Number of consecutive PTOs without an acknowledgement
    pto_count: u32,

    local_error: Option<Close>,
    peer_error: Option<Close>,
    /// Why the connection was abandoned without a closing handshake
    terminal: Option<ConnectionError>,
    /// Whether a CONNECTION_CLOSE is due
    close_pending: bool,
    /// Latency spin bit to send
    spin: bool,
    stats: Stats,
}

struct ZeroRttCrypto {
    header: Box<dyn HeaderKey>,
    packet: Box<dyn PacketKey>,
}

struct PrevCrypto {
    /// The keys used for the previous key phase, temporarily retained to decrypt packets sent by
    /// the peer prior to its own key update
    crypto: KeyPair<Box<dyn PacketKey>>,
    /// The incoming packet that ends the interval for which these keys are applicable, and the
    /// time of its receipt
    end_packet: Option<(u64, Instant)>,
    /// Whether we have yet to send a packet under the keys that replaced these
    ///
    /// A peer may not update its keys again until it has received such a packet.
    update_unacked: bool,
}

impl Connection {
    /// Create a client connection to `peer`
    ///
    /// `server_name` is checked against the server's certificate; without it the peer's IP address
    /// is used. `scid` becomes the source connection ID of the connection's long-header packets.
    pub fn connect(
        server_name: Option<&str>,
        scid: &[u8],
        local: SocketAddr,
        peer: SocketAddr,
        config: &Config,
        now: Instant,
    ) -> Result<Self, ConnectError> {
        let scid = ConnectionId::try_from(scid)?;
        let tls = config.client_tls()?;
        let mut rng = StdRng::from_os_rng();
        let dcid = ConnectionId::random(&mut rng, CLIENT_INITIAL_DCID_LEN);
        let mut conn = Self::new(Side::Client, scid, dcid, local, peer, config, rng, now);

        let server_name = server_name.map_or_else(|| peer.ip().to_string(), str::to_owned);
        let session = TlsSession::new_client(tls, &server_name, &conn.local_params)?;
        conn.spaces[SpaceId::Initial].crypto = Some(crypto::Session::initial_keys(
            &session,
            &dcid,
            Side::Client,
        ));
        conn.crypto = Some(Box::new(session));
        conn.write_crypto();
        conn.init_0rtt();
        debug!(%scid, %dcid, %peer, "connecting");
        Ok(conn)
    }

    /// Create a server connection for a client that contacted `local` from `peer`
    ///
    /// `odcid` must be the destination CID of the client's first Initial when that Initial was
    /// answered with a Retry, in which case `scid` must be the source CID of the Retry.
    pub fn accept(
        scid: &[u8],
        odcid: Option<&ConnectionId>,
        local: SocketAddr,
        peer: SocketAddr,
        config: &Config,
        now: Instant,
    ) -> Result<Self, ConnectError> {
        let scid = ConnectionId::try_from(scid)?;
        let tls = config.server_tls()?;
        let rng = StdRng::from_os_rng();
        // The client's CIDs are learned from its first Initial
        let mut conn = Self::new(
            Side::Server,
            scid,
            ConnectionId::new(&[]),
            local,
            peer,
            config,
            rng,
            now,
        );
        conn.server_tls = Some(tls);
        if let Some(odcid) = odcid {
            conn.orig_dst_cid = Some(*odcid);
            conn.retry_src_cid = Some(scid);
            // The Retry token proved the client owns its address
            let path = &mut conn.paths[0];
            path.amplification_limited = false;
            path.state = PathState::Validated;
        }
        debug!(%scid, %peer, retry = odcid.is_some(), "accepting");
        Ok(conn)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        side: Side,
        scid: ConnectionId,
        dcid: ConnectionId,
        local: SocketAddr,
        peer: SocketAddr,
        config: &Config,
        mut rng: StdRng,
        now: Instant,
    ) -> Self {
        let transport = config.transport.clone();
        let reset_token = ResetToken::random(&mut rng);
        let local_params = TransportParameters::new(&transport, side, scid, &mut rng);

        let mut path = PathData::new(local, peer, 0, &transport, None, now);
        path.active = true;
        path.dcid_seq = Some(0);
        path.amplification_limited = side.is_server();
        if side.is_client() {
            // The handshake proves the server owns its address
            path.state = PathState::Validated;
        }

        let mut conn = Self {
            side,
            version: config.version,
            state: State::Handshake(state::Handshake::new()),
            crypto: None,
            server_tls: None,
            local_params,
            peer_params: None,

            local_cids: LocalCids::new(scid, reset_token),
            peer_cids: PeerCids::new(dcid, transport.active_connection_id_limit),
            handshake_cid: scid,
            rem_handshake_cid: dcid,
            initial_dst_cid: dcid,
            orig_dst_cid: None,
            retry_src_cid: None,
            retry_token: Bytes::new(),

            spaces: [
                PacketSpace::new(now),
                PacketSpace::new(now),
                PacketSpace::new(now),
            ],
            highest_space: SpaceId::Initial,
            zero_rtt_crypto: None,
            zero_rtt_enabled: false,
            accepted_0rtt: false,
            key_phase: false,
            prev_crypto: None,
            next_crypto: None,
            handshake_confirmed: false,
            authentication_failures: 0,

            paths: vec![path],
            active_path: PathId::new(0),
            path_generation: 0,

            streams: StreamsState::new(side, &transport),
            dgram_send: DatagramQueue::new(
                transport.dgram_send_queue_len,
                transport.dgram_full_policy,
            ),
            dgram_recv: DatagramQueue::new(
                transport.dgram_recv_queue_len,
                DatagramFullPolicy::DropOldest,
            ),

            timers: TimerTable::default(),
            idle_timeout: (!transport.max_idle_timeout.is_zero())
                .then_some(transport.max_idle_timeout),
            permit_idle_reset: true,
            pto_count: 0,

            local_error: None,
            peer_error: None,
            terminal: None,
            close_pending: false,
            spin: false,
            stats: Stats::default(),

            config: transport,
            rng,
        };
        conn.reset_idle_timeout(now);
        conn
    }

    /// The earliest instant at which [`on_timeout`](Self::on_timeout) must be called
    pub fn timeout_instant(&self) -> Option<Instant> {
        if self.state.is_drained() {
            return None;
        }
        self.timers.peek()
    }

    /// Time left until [`on_timeout`](Self::on_timeout) must be called, `None` if no timer is armed
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        self.timeout_instant()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Process timer expirations
    ///
    /// Does nothing for timers that haven't expired at `now`, so spurious calls are harmless.
    pub fn on_timeout(&mut self, now: Instant) {
        let _span = trace_span!("timeout", side = ?self.side).entered();
        while let Some((timer, _)) = self.timers.expire_before(now) {
            trace!(?timer, "timeout");
            match timer {
                Timer::Conn(timer) => match timer {
                    ConnTimer::Close => {
                        debug!("drained");
                        self.state = State::Drained;
                        self.timers.reset();
                    }
                    ConnTimer::Idle => {
                        debug!("idle timeout");
                        self.kill(ConnectionError::TimedOut);
                    }
                    ConnTimer::KeepAlive => {
                        trace!("sending keep-alive");
                        self.ping();
                    }
                    ConnTimer::LossDetection => self.on_loss_detection_timeout(now),
                    ConnTimer::KeyDiscard => {
                        self.zero_rtt_crypto = None;
                        self.prev_crypto = None;
                    }
                    ConnTimer::MaxAckDelay => {
                        trace!("max ack delay reached");
                        self.spaces[SpaceId::Data]
                            .pending_acks
                            .on_max_ack_delay_timeout();
                    }
                },
                Timer::PerPath(path_id, timer) => match timer {
                    PathTimer::PathValidation => self.on_path_validation_timeout(now, path_id),
                    PathTimer::PathChallengeLost => self.on_path_challenge_lost(now, path_id),
                    // Only wakes the caller; `send` consults the pacer again
                    PathTimer::Pacing => trace!(%path_id, "pacing timer expired"),
                },
            }
            if self.state.is_drained() {
                break;
            }
        }
    }

    /// Close the connection, queueing a CONNECTION_CLOSE for the next [`send`](Self::send)
    ///
    /// `app` selects an application-level close; otherwise `err` is a transport error code. Fails
    /// with the terminal reason if the connection is already closing.
    pub fn close(&mut self, app: bool, err: u64, reason: &[u8]) -> Result<(), ConnectionError> {
        if self.state.is_closed() {
            return Err(self.terminal_error());
        }

        let error_code = VarInt::saturating(err);
        let reason = Bytes::copy_from_slice(reason);
        let close = match app {
            true => Close::Application(ApplicationClose { error_code, reason }),
            false => Close::Connection(ConnectionClose {
                error_code: error_code.into(),
                frame_type: None,
                reason,
            }),
        };
        debug!(%close, "closing");
        self.local_error = Some(close.clone());

        if self.crypto.is_none() {
            // Nothing was exchanged yet, so there is nobody to notify
            self.kill(ConnectionError::LocallyClosed);
            return Ok(());
        }

        self.close_common();
        self.state = State::Closed(state::Closed { reason: close });
        self.close_pending = true;
        Ok(())
    }

    /// Whether the handshake completed and the connection hasn't started closing
    pub fn is_established(&self) -> bool {
        self.state.is_established()
    }

    /// Whether the connection is gone for good; no more packets will be sent or processed
    pub fn is_closed(&self) -> bool {
        self.state.is_drained()
    }

    /// Whether the connection is closing but still lingering to absorb the peer's packets
    pub fn is_draining(&self) -> bool {
        matches!(self.state, State::Closed(_) | State::Draining)
    }

    /// Whether the connection ended because the idle timeout expired
    pub fn is_timed_out(&self) -> bool {
        self.terminal == Some(ConnectionError::TimedOut)
    }

    /// Whether 0-RTT keys are in use while the handshake is in progress
    pub fn is_in_early_data(&self) -> bool {
        self.state.is_handshake() && self.zero_rtt_crypto.is_some()
    }

    /// Whether the TLS session was resumed from an earlier connection
    pub fn is_resumed(&self) -> bool {
        self.crypto.as_ref().is_some_and(|crypto| crypto.is_resumed())
    }

    /// Whether 0-RTT data was accepted by the server
    ///
    /// Only meaningful on a client once the handshake completed.
    pub fn accepted_0rtt(&self) -> bool {
        self.accepted_0rtt
    }

    /// Whether this is the server side of the connection
    pub fn is_server(&self) -> bool {
        self.side.is_server()
    }

    /// The CONNECTION_CLOSE the peer sent, if any
    pub fn peer_error(&self) -> Option<&Close> {
        self.peer_error.as_ref()
    }

    /// The reason we closed the connection with, if we did
    pub fn local_error(&self) -> Option<&Close> {
        self.local_error.as_ref()
    }

    /// The connection ID the peer addresses us with during the handshake
    pub fn source_id(&self) -> ConnectionId {
        self.handshake_cid
    }

    /// The connection ID we address the peer with on the active path
    pub fn destination_id(&self) -> ConnectionId {
        self.path_dcid(self.active_path)
    }

    /// The negotiated application protocol, empty until known
    pub fn application_proto(&self) -> &[u8] {
        self.crypto
            .as_ref()
            .and_then(|crypto| crypto.alpn_protocol())
            .unwrap_or(&[])
    }

    /// The peer's transport parameters, once received
    ///
    /// On a client attempting 0-RTT these are the parameters remembered from the previous
    /// connection until the handshake completes.
    pub fn peer_transport_params(&self) -> Option<PeerTransportParams> {
        self.peer_params.as_ref().map(PeerTransportParams::from)
    }

    /// Connection-level statistics
    pub fn stats(&self) -> Stats {
        let mut stats = self.stats;
        stats.paths_count = self.paths.len();
        stats
    }

    /// Statistics of every path the connection knows about
    pub fn path_stats(&self) -> Vec<PathStats> {
        self.paths
            .iter()
            .map(|path| PathStats {
                local_addr: path.local,
                peer_addr: path.peer,
                validation_state: path.state,
                active: path.active,
                recv: path.counters.recv,
                sent: path.counters.sent,
                lost: path.counters.lost,
                retrans: path.counters.retrans,
                rtt: path.rtt.get(),
                min_rtt: path.rtt.min(),
                rttvar: path.rtt.var(),
                cwnd: path.congestion.window(),
                sent_bytes: path.counters.sent_bytes,
                recv_bytes: path.counters.recv_bytes,
                lost_bytes: path.counters.lost_bytes,
                acked_bytes: path.counters.acked_bytes,
                pmtu: usize::from(path.current_mtu()),
                delivery_rate: path.delivery_rate.rate(),
                startup_exit: path.congestion.startup_exit(),
            })
            .collect()
    }

    /// Largest UDP payload that may currently be sent on the active path
    pub fn pmtu(&self) -> usize {
        usize::from(self.path().current_mtu())
    }

    /// Write stream data, returning how much of `data` was accepted
    ///
    /// Referencing a locally-initiated stream that isn't open yet opens it. Data beyond the
    /// available flow control credit is not accepted; if nothing could be accepted the call fails
    /// with [`WriteError::Blocked`] and the stream later shows up in
    /// [`stream_writable_next`](Self::stream_writable_next).
    pub fn stream_send(
        &mut self,
        id: StreamId,
        data: &[u8],
        fin: bool,
    ) -> Result<usize, WriteError> {
        if self.state.is_closed() {
            return Err(WriteError::ClosedStream);
        }
        self.streams.write(id, data, fin)
    }

    /// Read ordered stream data into `buf`, returning the length and whether the stream finished
    pub fn stream_recv(&mut self, id: StreamId, buf: &mut [u8]) -> Result<(usize, bool), ReadError> {
        self.streams
            .read(id, buf, &mut self.spaces[SpaceId::Data].pending)
    }

    /// Next stream with data or a reset to read, each stream reported once per readiness
    pub fn stream_readable_next(&mut self) -> Option<StreamId> {
        self.streams.readable_next()
    }

    /// Next stream that gained send capacity after being blocked
    pub fn stream_writable_next(&mut self) -> Option<StreamId> {
        self.streams.writable_next()
    }

    /// Whether [`stream_recv`](Self::stream_recv) would make progress on `id`
    pub fn stream_readable(&self, id: StreamId) -> bool {
        self.streams.is_readable(id)
    }

    /// Whether all of the stream's data was read, or the stream was reset
    pub fn stream_finished(&self, id: StreamId) -> bool {
        self.streams.is_finished(id)
    }

    /// Bytes that [`stream_send`](Self::stream_send) would currently accept on `id`
    pub fn stream_capacity(&self, id: StreamId) -> Result<usize, StreamError> {
        self.streams.capacity(id)
    }

    /// Set the urgency (lower is sent first) and incrementality of a stream's outgoing data
    pub fn stream_priority(
        &mut self,
        id: StreamId,
        urgency: u8,
        incremental: bool,
    ) -> Result<(), StreamError> {
        self.streams.set_priority(id, urgency, incremental)
    }

    /// Abandon one direction of a stream, sending STOP_SENDING or RESET_STREAM with `err`
    pub fn stream_shutdown(
        &mut self,
        id: StreamId,
        direction: Direction,
        err: u64,
    ) -> Result<(), StreamError> {
        self.streams.shutdown(
            id,
            direction,
            VarInt::saturating(err),
            &mut self.spaces[SpaceId::Data].pending,
        )
    }

    /// Queue an unreliable datagram
    pub fn dgram_send(&mut self, data: &[u8]) -> Result<(), SendDatagramError> {
        if !self.config.dgram_enabled {
            return Err(SendDatagramError::NotNegotiated);
        }
        let max = match self.peer_params {
            Some(ref params) if params.max_datagram_frame_size.is_none() => {
                return Err(SendDatagramError::NotNegotiated);
            }
            Some(_) => self.dgram_max_writable_len().unwrap_or(0),
            None => self.dgram_max_payload(),
        };
        if data.len() > max {
            return Err(SendDatagramError::TooLarge);
        }
        self.dgram_send.push(Bytes::copy_from_slice(data))
    }

    /// Take the oldest received datagram, `Ok(None)` if there is none
    ///
    /// A datagram longer than `buf` stays queued and the call fails with [`BufferTooShort`].
    pub fn dgram_recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, BufferTooShort> {
        let Some(len) = self.dgram_recv.peek_len() else {
            return Ok(None);
        };
        let dst = buf.get_mut(..len).ok_or(BufferTooShort)?;
        let Some(data) = self.dgram_recv.pop() else {
            return Ok(None);
        };
        dst.copy_from_slice(&data);
        Ok(Some(len))
    }

    /// Largest datagram [`dgram_send`](Self::dgram_send) accepts, `None` unless both sides
    /// enabled datagrams
    pub fn dgram_max_writable_len(&self) -> Option<usize> {
        if !self.config.dgram_enabled {
            return None;
        }
        let peer_max = self.peer_params.as_ref()?.max_datagram_frame_size?;
        let frame_limit = peer_max
            .into_inner()
            .saturating_sub(frame::Datagram::SIZE_BOUND as u64);
        let frame_limit = usize::try_from(frame_limit).unwrap_or(usize::MAX);
        Some(self.dgram_max_payload().min(frame_limit))
    }

    /// Datagram payload that fits in a short-header packet on the active path
    fn dgram_max_payload(&self) -> usize {
        let tag_len = self.spaces[SpaceId::Data]
            .crypto
            .as_ref()
            .map_or(16, |keys| keys.packet.local.tag_len());
        // Flags, destination CID, the longest packet number and the AEAD tag
        let overhead = 1 + self.destination_id().len() + 4 + tag_len;
        usize::from(self.path().current_mtu())
            .saturating_sub(overhead + frame::Datagram::SIZE_BOUND)
    }

    /// Number of datagrams waiting to be sent
    pub fn dgram_send_queue_len(&self) -> usize {
        self.dgram_send.len()
    }

    /// Total payload bytes of datagrams waiting to be sent
    pub fn dgram_send_queue_byte_size(&self) -> usize {
        self.dgram_send.byte_size()
    }

    /// Number of received datagrams waiting to be read
    pub fn dgram_recv_queue_len(&self) -> usize {
        self.dgram_recv.len()
    }

    /// Total payload bytes of received datagrams waiting to be read
    pub fn dgram_recv_queue_byte_size(&self) -> usize {
        self.dgram_recv.byte_size()
    }

    /// Drop every queued outgoing datagram for which `f` returns `true`
    pub fn dgram_purge_outgoing<F: Fn(&[u8]) -> bool>(&mut self, f: F) {
        self.dgram_send.purge(f);
    }

    fn path(&self) -> &PathData {
        &self.paths[self.active_path.index()]
    }

    fn path_mut(&mut self) -> &mut PathData {
        &mut self.paths[self.active_path.index()]
    }

    fn find_path(&self, local: SocketAddr, peer: SocketAddr) -> Option<PathId> {
        self.paths
            .iter()
            .position(|path| path.matches(local, peer))
            .map(PathId::new)
    }

    /// The CID packets on `path_id` are addressed to
    fn path_dcid(&self, path_id: PathId) -> ConnectionId {
        self.paths[path_id.index()]
            .dcid_seq
            .and_then(|seq| self.peer_cids.get(seq))
            .or_else(|| self.peer_cids.first().map(|(_, cid)| cid))
            .unwrap_or(self.rem_handshake_cid)
    }

    /// Keys for packets we send in `space`
    pub(super) fn local_keys(&self, space: SpaceId) -> Option<(&dyn HeaderKey, &dyn PacketKey)> {
        if let Some(keys) = self.spaces[space].crypto.as_ref() {
            return Some((&*keys.header.local, &*keys.packet.local));
        }
        match (space, self.side) {
            (SpaceId::Data, Side::Client) => self
                .zero_rtt_crypto
                .as_ref()
                .map(|crypto| (&*crypto.header, &*crypto.packet)),
            _ => None,
        }
    }

    /// Queue a PING so the peer has something to acknowledge
    fn ping(&mut self) {
        let space = match self.state.is_established() {
            true => SpaceId::Data,
            false => self.highest_space,
        };
        self.spaces[space].ping_pending = true;
    }

    pub(super) fn reset_idle_timeout(&mut self, now: Instant) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        if self.state.is_closed() {
            self.timers.stop(Timer::Conn(ConnTimer::Idle));
            return;
        }
        // A run of PTOs must not trip the idle timer
        let dt = cmp::max(timeout, 3 * self.pto(self.highest_space));
        self.timers.set(Timer::Conn(ConnTimer::Idle), now + dt);
    }

    pub(super) fn reset_keep_alive(&mut self, now: Instant) {
        let Some(interval) = self.config.keep_alive_interval else {
            return;
        };
        if !self.state.is_established() {
            return;
        }
        self.timers
            .set(Timer::Conn(ConnTimer::KeepAlive), now + interval);
    }

    fn set_key_discard_timer(&mut self, now: Instant) {
        let start = match self.prev_crypto {
            Some(PrevCrypto {
                end_packet: Some((_, time)),
                ..
            }) => time,
            _ => now,
        };
        self.timers.set(
            Timer::Conn(ConnTimer::KeyDiscard),
            start + 3 * self.pto(SpaceId::Data),
        );
    }

    /// Stop all activity in preparation for closing
    fn close_common(&mut self) {
        trace!("connection closed");
        self.timers.reset();
    }

    fn set_close_timer(&mut self, now: Instant) {
        self.timers.set(
            Timer::Conn(ConnTimer::Close),
            now + 3 * self.pto(self.highest_space),
        );
    }

    /// Abandon the connection immediately, without notifying the peer
    fn kill(&mut self, reason: ConnectionError) {
        self.close_common();
        self.terminal.get_or_insert(reason);
        self.state = State::Drained;
    }

    /// Why the connection is no longer usable
    fn terminal_error(&self) -> ConnectionError {
        if let Some(ref reason) = self.terminal {
            if *reason != ConnectionError::LocallyClosed {
                return reason.clone();
            }
        }
        match (&self.local_error, &self.peer_error) {
            (Some(_), _) | (None, None) => ConnectionError::LocallyClosed,
            (None, Some(Close::Connection(close))) => {
                ConnectionError::ConnectionClosed(close.clone())
            }
            (None, Some(Close::Application(close))) => {
                ConnectionError::ApplicationClosed(close.clone())
            }
        }
    }

    /// Record a fatal protocol error detected locally and start closing
    fn on_local_error(&mut self, error: TransportError) {
        warn!(%error, "closing connection due to error");
        let close = Close::from(error);
        self.local_error = Some(close.clone());
        self.state = State::Closed(state::Closed { reason: close });
        self.close_pending = true;
    }

    /// The peer closed the connection: stay silent until the draining period ends
    fn on_peer_close(&mut self, reason: Close) {
        debug!(%reason, "peer closed connection");
        self.peer_error = Some(reason);
        self.state = State::Draining;
    }

    fn write_crypto(&mut self) {
        loop {
            let space = self.highest_space;
            let mut outgoing = Vec::new();
            let Some(crypto) = self.crypto.as_mut() else {
                return;
            };
            if let Some(keys) = crypto.write_handshake(&mut outgoing) {
                match space {
                    SpaceId::Initial => self.upgrade_crypto(SpaceId::Handshake, keys),
                    SpaceId::Handshake => self.upgrade_crypto(SpaceId::Data, keys),
                    SpaceId::Data => warn!("TLS produced keys after the handshake"),
                }
            }
            if outgoing.is_empty() {
                if space == self.highest_space {
                    break;
                }
                // Keys changed; see if there is data for the new space
                continue;
            }

            let offset = self.spaces[space].crypto_offset;
            let outgoing = Bytes::from(outgoing);
            if let State::Handshake(ref mut state) = self.state {
                if space == SpaceId::Initial && offset == 0 && self.side.is_client() {
                    state.client_hello = Some(outgoing.clone());
                }
            }
            self.spaces[space].crypto_offset += outgoing.len() as u64;
            trace!(len = outgoing.len(), ?space, "wrote CRYPTO data");
            self.spaces[space].pending.crypto.push_back(frame::Crypto {
                offset,
                data: outgoing,
            });
        }
    }

    /// Switch to stronger cryptography during the handshake
    fn upgrade_crypto(&mut self, space: SpaceId, keys: Keys) {
        debug_assert!(
            self.spaces[space].crypto.is_none(),
            "already reached packet space {space:?}"
        );
        trace!(?space, "keys ready");
        if space == SpaceId::Data {
            self.next_crypto = self.crypto.as_mut().and_then(|crypto| crypto.next_1rtt_keys());
        }
        self.spaces[space].crypto = Some(keys);
        debug_assert!(space > self.highest_space);
        self.highest_space = space;
        if space == SpaceId::Data && self.side.is_client() {
            // 1-RTT keys supersede 0-RTT keys
            self.zero_rtt_crypto = None;
        }
    }

    fn read_crypto(&mut self, space: SpaceId, crypto: &frame::Crypto) -> Result<(), TransportError> {
        let expected = if !self.state.is_handshake() {
            SpaceId::Data
        } else if self.highest_space == SpaceId::Initial {
            SpaceId::Initial
        } else {
            SpaceId::Handshake
        };

        let end = crypto.offset + crypto.data.len() as u64;
        if space < expected && end > self.spaces[space].crypto_stream.bytes_read() {
            warn!(?space, ?expected, "received new CRYPTO data at unexpected level");
            return Err(TransportError::PROTOCOL_VIOLATION(
                "new data at unexpected encryption level",
            ));
        }

        let space = &mut self.spaces[space];
        let max = end.saturating_sub(space.crypto_stream.bytes_read());
        if max > self.config.crypto_buffer_size as u64 {
            return Err(TransportError::CRYPTO_BUFFER_EXCEEDED(""));
        }

        space
            .crypto_stream
            .insert(crypto.offset, crypto.data.clone());
        let Some(session) = self.crypto.as_mut() else {
            return Ok(());
        };
        while let Some(chunk) = space.crypto_stream.read_chunk(usize::MAX) {
            trace!(len = chunk.len(), "read CRYPTO data");
            if session.read_handshake(&chunk)? {
                trace!("application protocol known");
            }
        }
        Ok(())
    }

    /// Install 0-RTT keys if the TLS session provides them
    fn init_0rtt(&mut self) {
        let Some(crypto) = self.crypto.as_ref() else {
            return;
        };
        let Some((header, packet)) = crypto.early_crypto() else {
            return;
        };
        if self.side.is_client() {
            let params = match crypto.transport_parameters() {
                Ok(Some(params)) => params,
                Ok(None) => return,
                Err(error) => {
                    warn!(%error, "session ticket carried invalid transport parameters");
                    return;
                }
            };
            // These apply to a single connection and must not be reused
            let defaults = TransportParameters::default();
            let params = TransportParameters {
                initial_src_cid: None,
                original_dst_cid: None,
                preferred_address: None,
                retry_src_cid: None,
                stateless_reset_token: None,
                ack_delay_exponent: defaults.ack_delay_exponent,
                max_ack_delay: defaults.max_ack_delay,
                ..params
            };
            self.set_peer_params(params);
        }
        trace!("0-RTT enabled");
        self.zero_rtt_enabled = true;
        self.zero_rtt_crypto = Some(ZeroRttCrypto { header, packet });
    }

    /// The server refused our 0-RTT data: send it again in 1-RTT packets
    fn reject_0rtt(&mut self) {
        debug!("0-RTT rejected");
        self.accepted_0rtt = false;
        let sent_packets = mem::take(&mut self.spaces[SpaceId::Data].sent_packets);
        for (_, packet) in sent_packets {
            self.remove_in_flight(&packet);
        }
        self.spaces[SpaceId::Data].next_packet_number = 0;
        self.streams.retransmit_all_for_0rtt();
    }

    fn validate_peer_params(&self, params: &TransportParameters) -> Result<(), TransportError> {
        if Some(self.rem_handshake_cid) != params.initial_src_cid
            || (self.side.is_client()
                && (Some(self.initial_dst_cid) != params.original_dst_cid
                    || self.retry_src_cid != params.retry_src_cid))
        {
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "CID authentication failure",
            ));
        }
        if params.initial_max_streams_bidi.into_inner() > MAX_STREAM_COUNT
            || params.initial_max_streams_uni.into_inner() > MAX_STREAM_COUNT
        {
            return Err(TransportError::STREAM_LIMIT_ERROR(
                "unrepresentable initial stream limit",
            ));
        }
        Ok(())
    }

    fn set_peer_params(&mut self, params: TransportParameters) {
        self.streams.set_params(&params);
        let local = (!self.config.max_idle_timeout.is_zero()).then_some(self.config.max_idle_timeout);
        self.idle_timeout = match (local, params.idle_timeout()) {
            (None, x) | (x, None) => x,
            (Some(x), Some(y)) => Some(cmp::min(x, y)),
        };
        self.local_cids.set_limit(params.issue_cids_limit());
        let peer_max_udp_payload_size =
            u16::try_from(params.max_udp_payload_size.into_inner()).unwrap_or(u16::MAX);
        for path in &mut self.paths {
            path.mtud
                .on_peer_max_udp_payload_size_received(peer_max_udp_payload_size);
        }
        self.peer_params = Some(params);
    }

    /// Hand the peer as many CIDs as it is willing to store
    fn issue_cids(&mut self) {
        let issued = self.local_cids.issue(&mut self.rng);
        self.spaces[SpaceId::Data].pending.new_cids.extend(issued);
    }

    /// Drop the keys and in-flight packets of a handshake packet number space
    fn discard_space(&mut self, now: Instant, space_id: SpaceId) {
        debug_assert!(space_id != SpaceId::Data);
        trace!(space = ?space_id, "discarding keys");
        if space_id == SpaceId::Initial {
            if let State::Handshake(ref mut state) = self.state {
                state.client_hello = None;
            }
        }
        let space = &mut self.spaces[space_id];
        space.crypto = None;
        space.time_of_last_ack_eliciting_packet = None;
        space.loss_time = None;
        space.loss_probes = 0;
        space.ping_pending = false;
        space.pending = spaces::Retransmits::default();
        let sent_packets = mem::take(&mut space.sent_packets);
        for (_, packet) in sent_packets {
            self.remove_in_flight(&packet);
        }
        self.set_loss_detection_timer(now);
    }

    /// Stop counting a packet towards the in-flight totals of the path it was sent on
    pub(super) fn remove_in_flight(&mut self, packet: &SentPacket) {
        let Some(path) = self.paths.get_mut(packet.path.index()) else {
            return;
        };
        if path.generation != packet.path_generation {
            return;
        }
        path.in_flight.remove(packet.size, packet.ack_eliciting);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("handshake_cid", &self.handshake_cid)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Addresses an ingress datagram travelled between
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RecvInfo {
    /// The peer's address
    pub from: SocketAddr,
    /// Our address the datagram arrived at
    pub to: SocketAddr,
}

/// Where and when to send an egress datagram
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SendInfo {
    /// Our address to send from
    pub from: SocketAddr,
    /// The peer's address to send to
    pub to: SocketAddr,
    /// When to send the datagram
    pub at: Instant,
}

/// The output buffer is too small
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("buffer too short")]
pub struct BufferTooShort;

/// Errors in the parameters used to create a connection
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectError {
    /// The server name could not be used for certificate verification
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    /// The configuration lacks TLS material required for this side
    #[error("missing TLS configuration: {0}")]
    MissingTlsConfig(&'static str),
    /// rustls rejected the TLS configuration
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    /// The source connection ID is too long
    #[error(transparent)]
    InvalidCidLength(#[from] InvalidCidLength),
}

/// Reasons why a connection might be lost
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer doesn't implement any supported version
    #[error("peer doesn't implement any supported version")]
    VersionMismatch,
    /// The peer violated the QUIC specification as understood by this implementation
    #[error(transparent)]
    TransportError(#[from] TransportError),
    /// The peer's QUIC stack aborted the connection automatically
    #[error("aborted by peer: {0}")]
    ConnectionClosed(ConnectionClose),
    /// The peer closed the connection
    #[error("closed by peer: {0}")]
    ApplicationClosed(ApplicationClose),
    /// The peer is unable to continue processing this connection, usually due to having restarted
    #[error("reset by peer")]
    Reset,
    /// Communication with the peer has lapsed for longer than the negotiated idle timeout
    #[error("timed out")]
    TimedOut,
    /// The local application closed the connection
    #[error("closed")]
    LocallyClosed,
}

/// Errors of the path management operations
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum PathError {
    /// The peer hasn't issued a spare connection ID to use on another path
    #[error("no spare destination connection ID")]
    NoAvailableDcid,
    /// The peer forbade migrating to a new address
    #[error("active migration disabled by peer")]
    ActiveMigrationDisabled,
    /// No path with the given addresses exists
    #[error("unknown path")]
    UnknownPath,
    /// The operation isn't possible in the connection's current state or role
    #[error("invalid state")]
    InvalidState,
    /// The peer never issued a connection ID with the given sequence number
    #[error("unknown connection ID")]
    UnknownCid,
    /// The peer uses zero-length connection IDs, which can't be retired
    #[error("zero-length connection IDs in use")]
    ZeroLengthCid,
}
