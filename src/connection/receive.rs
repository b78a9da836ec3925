use std::{mem, time::Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, trace_span, warn};

use super::{
    Connection, ConnectionError, PrevCrypto, RecvInfo,
    paths::{PathId, PathState},
    spaces::PacketSpace,
    state::State,
    timer::{ConnTimer, Timer},
};
use crate::{
    ConnectionId, MIN_INITIAL_SIZE, Side, TransportError, TransportErrorCode,
    crypto::{self, PacketKey, rustls::TlsSession},
    frame::{self, Frame},
    packet::{InitialHeader, LongType, Packet, PartialDecode, PlainHeader, RETRY_TAG_LEN, SpaceId},
    transport_parameters::TransportParameters,
};

/// Shortest destination CID a client may pick for its first Initial
const MIN_CLIENT_INITIAL_DCID_LEN: usize = 8;

impl Connection {
    /// Process an incoming UDP payload, which may hold several coalesced QUIC packets
    ///
    /// Packets that can't be decoded or authenticated are dropped. Fails only when a packet ends
    /// the connection, in which case the connection is closing or gone by the time this returns.
    /// Returns the number of bytes consumed, which is always the whole datagram.
    pub fn recv(
        &mut self,
        buf: &mut [u8],
        info: RecvInfo,
        now: Instant,
    ) -> Result<usize, ConnectionError> {
        let len = buf.len();
        let _span = trace_span!("recv", side = ?self.side, len, from = %info.from).entered();
        if self.state.is_drained() {
            return Err(self.terminal_error());
        }
        if self.crypto.is_none() && !self.init_server_crypto(buf)? {
            return Ok(len);
        }

        let mut path_id = self.find_path(info.to, info.from);
        let mut remaining = Some(BytesMut::from(&buf[..]));
        let mut result = Ok(());
        while let Some(data) = remaining {
            match PartialDecode::new(data, self.local_cids.cid_len()) {
                Ok((partial_decode, rest)) => {
                    remaining = rest;
                    result = self.handle_decode(now, info, partial_decode, &mut path_id);
                }
                Err(error) => {
                    trace!(%error, "malformed header");
                    break;
                }
            }
            if result.is_err() || self.state.is_drained() {
                break;
            }
        }

        if let Some(path_id) = path_id {
            self.paths[path_id.index()].on_received(len as u64);
        }
        self.stats.recv_bytes += len as u64;
        result.map(|()| len)
    }

    /// Create the server's TLS session from the client's first Initial packet
    ///
    /// Returns `false` if the datagram must be dropped instead.
    fn init_server_crypto(&mut self, buf: &[u8]) -> Result<bool, ConnectionError> {
        let Some(tls) = self.server_tls.clone() else {
            return Ok(false);
        };
        let dcid = match PartialDecode::new(BytesMut::from(buf), self.local_cids.cid_len()) {
            Ok((partial_decode, _)) => match partial_decode.initial_header() {
                Some(header) => header.dst_cid,
                None => {
                    debug!("dropping non-Initial packet before the handshake");
                    return Ok(false);
                }
            },
            Err(error) => {
                trace!(%error, "malformed header");
                return Ok(false);
            }
        };
        if buf.len() < usize::from(MIN_INITIAL_SIZE) {
            debug!(len = buf.len(), "dropping undersized Initial");
            return Ok(false);
        }
        if dcid.len() < MIN_CLIENT_INITIAL_DCID_LEN {
            debug!(%dcid, "dropping Initial with short destination CID");
            return Ok(false);
        }

        self.local_params.original_dst_cid = Some(self.orig_dst_cid.unwrap_or(dcid));
        self.local_params.retry_src_cid = self.retry_src_cid;
        if !self.handshake_cid.is_empty() {
            self.local_params.stateless_reset_token =
                self.local_cids.get(0).map(|cid| cid.reset_token);
        }
        let session = match TlsSession::new_server(tls, &self.local_params) {
            Ok(session) => session,
            Err(error) => {
                warn!(%error, "failed to start TLS session");
                let error = ConnectionError::from(TransportError::INTERNAL_ERROR(
                    "TLS session setup failed",
                ));
                self.kill(error.clone());
                return Err(error);
            }
        };
        self.spaces[SpaceId::Initial].crypto =
            Some(crypto::Session::initial_keys(&session, &dcid, Side::Server));
        self.initial_dst_cid = dcid;
        self.crypto = Some(Box::new(session));
        trace!(%dcid, "initial keys ready");
        Ok(true)
    }

    fn handle_decode(
        &mut self,
        now: Instant,
        info: RecvInfo,
        partial_decode: PartialDecode,
        path_id: &mut Option<PathId>,
    ) -> Result<(), ConnectionError> {
        // A stateless reset looks like a short-header packet and fills the rest of the datagram
        let stateless_reset = !partial_decode.has_long_header()
            && self.peer_cids.is_stateless_reset(partial_decode.data());

        let header_crypto = if partial_decode.is_0rtt() {
            match self.zero_rtt_crypto.as_ref() {
                Some(crypto) if self.side.is_server() => Some(&*crypto.header),
                _ => {
                    debug!("dropping unexpected 0-RTT packet");
                    return Ok(());
                }
            }
        } else if let Some(space) = partial_decode.space() {
            match self.spaces[space].crypto.as_ref() {
                Some(keys) => Some(&*keys.header.remote),
                None if stateless_reset => return self.on_stateless_reset(),
                None => {
                    debug!(?space, len = partial_decode.len(), "discarding packet without keys");
                    return Ok(());
                }
            }
        } else {
            // Retry and Version Negotiation packets have no header protection
            None
        };

        match partial_decode.finish(header_crypto) {
            Ok(packet) => self.handle_packet(now, info, packet, stateless_reset, path_id),
            Err(_) if stateless_reset => self.on_stateless_reset(),
            Err(error) => {
                trace!(%error, "unable to complete packet decoding");
                Ok(())
            }
        }
    }

    fn handle_packet(
        &mut self,
        now: Instant,
        info: RecvInfo,
        mut packet: Packet,
        stateless_reset: bool,
        path_id: &mut Option<PathId>,
    ) -> Result<(), ConnectionError> {
        let space_id = packet.header.space();
        trace!(
            space = ?space_id,
            len = packet.payload.len() + packet.header_data.len(),
            dcid = %packet.header.dst_cid(),
            "got packet",
        );

        if path_id.is_none() && !self.state.is_established() {
            debug!(from = %info.from, "discarding packet from unknown address");
            return Ok(());
        }
        if packet.header.is_short() && !self.local_cids.contains(packet.header.dst_cid()) {
            debug!(dcid = %packet.header.dst_cid(), "discarding packet with unknown destination CID");
            return Ok(());
        }

        let was_closed = self.state.is_closed();
        let dst_cid = *packet.header.dst_cid();
        let result = match self.decrypt_packet(now, &mut packet) {
            Err(Some(error)) => {
                warn!(%error, "illegal packet");
                Err(error.into())
            }
            Err(None) if stateless_reset => return self.on_stateless_reset(),
            Err(None) => {
                debug!("failed to authenticate packet");
                self.stats.dropped += 1;
                return Ok(());
            }
            Ok(number) => {
                let span = match number {
                    Some(pn) => trace_span!("packet", space = ?space_id, pn),
                    None => trace_span!("packet", space = ?space_id),
                };
                let _guard = span.enter();

                if number.is_some_and(|pn| self.spaces[space_id].dedup.insert(pn)) {
                    if stateless_reset {
                        return self.on_stateless_reset();
                    }
                    debug!("discarding possible duplicate packet");
                    self.stats.dropped += 1;
                    return Ok(());
                }
                if self.state.is_handshake() && packet.header.is_short() {
                    trace!("dropping short packet during handshake");
                    return Ok(());
                }

                let path = match *path_id {
                    Some(path) => path,
                    None => match self.on_new_peer_address(now, info) {
                        Some(path) => {
                            *path_id = Some(path);
                            path
                        }
                        None => return Ok(()),
                    },
                };

                self.stats.recv += 1;
                if !self.state.is_closed() {
                    let spin = match packet.header {
                        PlainHeader::Short { spin, .. } => spin,
                        _ => false,
                    };
                    self.on_packet_authenticated(
                        now,
                        space_id,
                        number,
                        spin,
                        packet.header.is_1rtt(),
                    );
                }
                self.process_decrypted_packet(now, path, dst_cid, number, packet)
            }
        };

        if let Err(ref error) = result {
            match error {
                ConnectionError::TransportError(error) => self.on_local_error(error.clone()),
                other => self.kill(other.clone()),
            }
        }

        if !was_closed && self.state.is_closed() {
            self.close_common();
            if !self.state.is_drained() {
                self.set_close_timer(now);
            }
        }

        // Answer anything the peer still sends on the active path with our CONNECTION_CLOSE
        if matches!(self.state, State::Closed(_)) && *path_id == Some(self.active_path) {
            self.close_pending = true;
        }
        result
    }

    fn on_stateless_reset(&mut self) -> Result<(), ConnectionError> {
        debug!("got stateless reset");
        self.kill(ConnectionError::Reset);
        Err(ConnectionError::Reset)
    }

    fn on_packet_authenticated(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        number: Option<u64>,
        spin: bool,
        is_1rtt: bool,
    ) {
        self.reset_keep_alive(now);
        self.reset_idle_timeout(now);
        self.permit_idle_reset = true;

        let Some(number) = number else {
            return;
        };
        trace!("authenticated");
        if self.side.is_server() {
            if space_id == SpaceId::Handshake && self.spaces[SpaceId::Initial].crypto.is_some() {
                // A server stops sending and processing Initial packets when it receives its
                // first Handshake packet
                self.discard_space(now, SpaceId::Initial);
            }
            if is_1rtt
                && self.zero_rtt_crypto.is_some()
                && self.timers.get(Timer::Conn(ConnTimer::KeyDiscard)).is_none()
            {
                // 0-RTT packets may still be in flight for a while
                self.set_key_discard_timer(now);
            }
        }

        let space = &mut self.spaces[space_id];
        space.pending_acks.insert_one(number, now);
        if number >= space.rx_packet {
            space.rx_packet = number;
            if is_1rtt {
                self.spin = self.side.is_client() ^ spin;
            }
        }
    }

    /// Update ACK bookkeeping once a packet's frames were processed successfully
    fn on_packet_processed(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        number: u64,
        ack_eliciting: bool,
    ) {
        let space = &mut self.spaces[space_id];
        let arm_timer =
            space
                .pending_acks
                .packet_received(now, number, ack_eliciting, &space.dedup);
        if space_id != SpaceId::Data {
            // Handshake packets are acknowledged without delay
            if ack_eliciting {
                space.pending_acks.set_immediate_ack_required();
            }
            return;
        }
        if !arm_timer {
            return;
        }
        if let Some(timeout) = space
            .pending_acks
            .max_ack_delay_timeout(self.config.max_ack_delay)
        {
            self.timers.set(Timer::Conn(ConnTimer::MaxAckDelay), timeout);
        }
    }

    fn process_decrypted_packet(
        &mut self,
        now: Instant,
        path_id: PathId,
        dst_cid: ConnectionId,
        number: Option<u64>,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        match self.state {
            State::Handshake(_) => self.process_handshake_packet(now, path_id, number, packet),
            State::Established => {
                let Some(number) = number else {
                    return Ok(());
                };
                match packet.header.space() {
                    SpaceId::Data => {
                        let early = packet.header.is_0rtt();
                        let payload = packet.payload.freeze();
                        self.process_payload(now, path_id, dst_cid, number, early, payload)?
                    }
                    space => self.process_early_payload(now, space, number, packet)?,
                }
                Ok(())
            }
            State::Closed(_) => {
                if !packet.header.has_frames() {
                    return Ok(());
                }
                let Ok(frames) = frame::Iter::new(packet.payload.freeze()) else {
                    return Ok(());
                };
                for frame in frames.map_while(Result::ok) {
                    if let Frame::Close(reason) = frame {
                        trace!("draining");
                        self.on_peer_close(reason);
                        break;
                    }
                }
                Ok(())
            }
            State::Draining | State::Drained => Ok(()),
        }
    }

    fn process_handshake_packet(
        &mut self,
        now: Instant,
        path_id: PathId,
        number: Option<u64>,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        match packet.header {
            PlainHeader::Retry { src_cid, .. } => {
                self.process_retry(now, src_cid, packet)?;
                Ok(())
            }
            PlainHeader::VersionNegotiate { dst_cid, .. } => {
                self.process_version_negotiation(dst_cid, &packet.payload)
            }
            PlainHeader::Long {
                ty: LongType::Handshake,
                src_cid,
                ..
            } => {
                if src_cid != self.rem_handshake_cid {
                    debug!(expected = %self.rem_handshake_cid, got = %src_cid, "discarding packet with mismatched source CID");
                    return Ok(());
                }
                let Some(number) = number else {
                    return Ok(());
                };
                if self.side.is_server() {
                    // Only the owner of the address could have decrypted our Initial
                    let path = &mut self.paths[path_id.index()];
                    path.amplification_limited = false;
                    path.state = PathState::Validated;
                }

                self.process_early_payload(now, SpaceId::Handshake, number, packet)?;
                if self.state.is_closed() {
                    return Ok(());
                }
                if self
                    .crypto
                    .as_ref()
                    .is_some_and(|crypto| crypto.is_handshaking())
                {
                    trace!("handshake ongoing");
                    return Ok(());
                }
                self.complete_handshake(now)
            }
            PlainHeader::Initial(InitialHeader { src_cid, .. }) => {
                let rem_cid_set = self
                    .state
                    .as_handshake_mut()
                    .is_some_and(|state| state.rem_cid_set);
                if !rem_cid_set {
                    trace!(%src_cid, "switching remote CID");
                    self.rem_handshake_cid = src_cid;
                    self.peer_cids.update_initial(src_cid);
                    if let Some(state) = self.state.as_handshake_mut() {
                        state.rem_cid_set = true;
                    }
                } else if src_cid != self.rem_handshake_cid {
                    debug!(expected = %self.rem_handshake_cid, got = %src_cid, "discarding packet with mismatched source CID");
                    return Ok(());
                }
                let Some(number) = number else {
                    return Ok(());
                };

                let starting_space = self.highest_space;
                self.process_early_payload(now, SpaceId::Initial, number, packet)?;
                if self.side.is_server()
                    && starting_space == SpaceId::Initial
                    && self.highest_space != SpaceId::Initial
                {
                    let params = self.tls_transport_parameters()?;
                    self.validate_peer_params(&params)?;
                    self.set_peer_params(params);
                    self.issue_cids();
                    self.init_0rtt();
                }
                Ok(())
            }
            PlainHeader::Long {
                ty: LongType::ZeroRtt,
                dst_cid,
                ..
            } => {
                let Some(number) = number else {
                    return Ok(());
                };
                let payload = packet.payload.freeze();
                self.process_payload(now, path_id, dst_cid, number, true, payload)?;
                Ok(())
            }
            // Dropped before decryption completes
            PlainHeader::Short { .. } => Ok(()),
        }
    }

    /// The TLS handshake finished: check the peer's parameters and start using 1-RTT
    fn complete_handshake(&mut self, now: Instant) -> Result<(), ConnectionError> {
        if self.side.is_client() {
            let params = self.tls_transport_parameters()?;
            if self.zero_rtt_enabled {
                let accepted = self
                    .crypto
                    .as_ref()
                    .and_then(|crypto| crypto.early_data_accepted())
                    .unwrap_or(false);
                match (accepted, self.peer_params.as_ref()) {
                    (true, Some(cached)) => {
                        params.validate_resumption_from(cached)?;
                        self.accepted_0rtt = true;
                    }
                    _ => self.reject_0rtt(),
                }
            }
            if let Some(token) = params.stateless_reset_token {
                self.peer_cids.set_initial_reset_token(token);
            }
            self.validate_peer_params(&params)?;
            self.set_peer_params(params);
            self.issue_cids();
        } else {
            // The server learns that the client has its keys when the client's Finished arrives
            self.spaces[SpaceId::Data].pending.handshake_done = true;
            self.handshake_confirmed = true;
            self.discard_space(now, SpaceId::Handshake);
        }

        debug!(alpn = ?String::from_utf8_lossy(self.application_proto()), "established");
        self.state = State::Established;
        self.reset_keep_alive(now);
        Ok(())
    }

    fn tls_transport_parameters(&self) -> Result<TransportParameters, TransportError> {
        let params = match self.crypto.as_ref() {
            Some(crypto) => crypto.transport_parameters()?,
            None => None,
        };
        params.ok_or_else(|| TransportError {
            code: TransportErrorCode::crypto(0x6d),
            frame: None,
            reason: "transport parameters missing".into(),
        })
    }

    fn process_retry(
        &mut self,
        now: Instant,
        rem_cid: ConnectionId,
        packet: Packet,
    ) -> Result<(), TransportError> {
        if self.side.is_server() {
            return Err(TransportError::PROTOCOL_VIOLATION("client sent Retry"));
        }
        let rem_cid_set = self
            .state
            .as_handshake_mut()
            .is_some_and(|state| state.rem_cid_set);
        // Only the first Retry counts, and only before any other packet from the server; the
        // token must not be empty and the integrity tag must check out
        let valid = self.retry_src_cid.is_none()
            && !rem_cid_set
            && packet.payload.len() > RETRY_TAG_LEN
            && self.crypto.as_ref().is_some_and(|crypto| {
                crypto.is_valid_retry(&self.initial_dst_cid, &packet.header_data, &packet.payload)
            });
        if !valid {
            trace!("discarding invalid Retry");
            return Ok(());
        }
        let Some(client_hello) = self
            .state
            .as_handshake_mut()
            .and_then(|state| state.client_hello.take())
        else {
            return Ok(());
        };
        let Some(keys) = self
            .crypto
            .as_ref()
            .map(|crypto| crypto.initial_keys(&rem_cid, Side::Client))
        else {
            return Ok(());
        };

        debug!(%rem_cid, "retrying");
        self.retry_src_cid = Some(rem_cid);
        self.rem_handshake_cid = rem_cid;
        self.peer_cids.update_initial(rem_cid);

        let next_packet_number = self.spaces[SpaceId::Initial].next_packet_number;
        self.discard_space(now, SpaceId::Initial);
        let space = &mut self.spaces[SpaceId::Initial];
        *space = PacketSpace::new(now);
        space.crypto = Some(keys);
        space.next_packet_number = next_packet_number;
        space.crypto_offset = client_hello.len() as u64;
        space.pending.crypto.push_back(frame::Crypto {
            offset: 0,
            data: client_hello,
        });

        // The server dropped any 0-RTT packets along with our first Initial
        self.requeue_in_flight(SpaceId::Data);

        let token_len = packet.payload.len() - RETRY_TAG_LEN;
        self.retry_token = packet.payload.freeze().split_to(token_len);
        Ok(())
    }

    fn process_version_negotiation(
        &mut self,
        dst_cid: ConnectionId,
        payload: &[u8],
    ) -> Result<(), ConnectionError> {
        let rem_cid_set = self
            .state
            .as_handshake_mut()
            .is_some_and(|state| state.rem_cid_set);
        if self.side.is_server() || rem_cid_set || dst_cid != self.handshake_cid {
            trace!("ignoring Version Negotiation packet");
            return Ok(());
        }
        let mut versions = payload
            .chunks_exact(4)
            .filter_map(|chunk| <[u8; 4]>::try_from(chunk).ok())
            .map(u32::from_be_bytes);
        if versions.any(|version| version == self.version) {
            // A genuine server never lists the version we offered
            debug!("ignoring Version Negotiation packet listing our version");
            return Ok(());
        }
        debug!("peer doesn't support our version");
        Err(ConnectionError::VersionMismatch)
    }

    /// Process an Initial or Handshake packet payload
    fn process_early_payload(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        number: u64,
        packet: Packet,
    ) -> Result<(), TransportError> {
        debug_assert_ne!(space_id, SpaceId::Data);
        let mut ack_eliciting = false;
        for result in frame::Iter::new(packet.payload.freeze())? {
            let frame = result?;
            let span = match frame {
                Frame::Padding => None,
                _ => Some(trace_span!("frame", ty = %frame.ty())),
            };
            let _guard = span.as_ref().map(|span| span.enter());

            if !frame.is_allowed_in_handshake() {
                let mut error =
                    TransportError::PROTOCOL_VIOLATION("illegal frame type in handshake");
                error.frame = Some(frame.ty());
                return Err(error);
            }
            ack_eliciting |= frame.is_ack_eliciting();
            match frame {
                Frame::Crypto(frame) => self.read_crypto(space_id, &frame)?,
                Frame::Ack(ack) => self.on_ack_received(now, space_id, ack)?,
                Frame::Close(reason) => {
                    self.on_peer_close(reason);
                    return Ok(());
                }
                _ => {}
            }
        }

        self.on_packet_processed(now, space_id, number, ack_eliciting);
        self.write_crypto();
        Ok(())
    }

    /// Process the payload of a 0-RTT or 1-RTT packet
    ///
    /// `is_0rtt` comes from the packet type; a server may hold 1-RTT keys while 0-RTT packets
    /// are still arriving.
    #[allow(clippy::too_many_arguments)]
    fn process_payload(
        &mut self,
        now: Instant,
        path_id: PathId,
        dst_cid: ConnectionId,
        number: u64,
        is_0rtt: bool,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let mut ack_eliciting = false;
        let mut is_probing_packet = true;
        let mut close = None;
        for result in frame::Iter::new(payload)? {
            let frame = result?;
            let span = match frame {
                Frame::Padding => None,
                _ => Some(trace_span!("frame", ty = %frame.ty())),
            };
            let _guard = span.as_ref().map(|span| span.enter());

            if is_0rtt && !frame.is_allowed_in_0rtt() {
                let mut error = TransportError::PROTOCOL_VIOLATION("illegal frame type in 0-RTT");
                error.frame = Some(frame.ty());
                return Err(error);
            }
            ack_eliciting |= frame.is_ack_eliciting();
            is_probing_packet &= frame.is_probing();

            let pending = &mut self.spaces[SpaceId::Data].pending;
            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Crypto(frame) => self.read_crypto(SpaceId::Data, &frame)?,
                Frame::Ack(ack) => self.on_ack_received(now, SpaceId::Data, ack)?,
                Frame::Close(reason) => close = Some(reason),
                Frame::Stream(frame) => self.streams.received(frame, pending)?,
                Frame::ResetStream(frame) => self.streams.received_reset(frame, pending)?,
                Frame::StopSending(frame::StopSending { id, error_code }) => {
                    self.streams.received_stop_sending(id, error_code, pending)?;
                }
                Frame::MaxData(bytes) => self.streams.received_max_data(bytes),
                Frame::MaxStreamData { id, offset } => {
                    self.streams.received_max_stream_data(id, offset)?;
                }
                Frame::MaxStreams { dir, count } => {
                    self.streams.received_max_streams(dir, count)?;
                }
                Frame::DataBlocked { offset } => {
                    debug!(offset, "peer claims to be blocked at connection level");
                }
                Frame::StreamDataBlocked { id, offset } => {
                    self.streams.validate_receive_id(id)?;
                    debug!(stream = %id, offset, "peer claims to be blocked at stream level");
                }
                Frame::StreamsBlocked { dir, limit } => {
                    debug!(%dir, limit, "peer claims to be blocked opening more streams");
                }
                Frame::NewToken(_) => {
                    if self.side.is_server() {
                        return Err(TransportError::PROTOCOL_VIOLATION("client sent NEW_TOKEN"));
                    }
                    trace!("ignoring NEW_TOKEN");
                }
                Frame::PathChallenge(token) => {
                    trace!(%path_id, token, "path challenge");
                    self.paths[path_id.index()].pending_response = Some(token);
                }
                Frame::PathResponse(token) => self.on_path_response(now, path_id, token),
                Frame::NewConnectionId(frame) => self.on_new_connection_id(frame)?,
                Frame::RetireConnectionId { sequence } => {
                    if self.local_cids.on_retired(sequence, &dst_cid)? {
                        self.issue_cids();
                    }
                }
                Frame::Datagram(datagram) => {
                    if !self.config.dgram_enabled {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "unexpected DATAGRAM frame",
                        ));
                    }
                    let len = datagram.data.len();
                    if self.dgram_recv.push(datagram.data).is_err() {
                        trace!(len, "dropping datagram, receive queue disabled");
                    }
                }
                Frame::HandshakeDone => {
                    if self.side.is_server() {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "client sent HANDSHAKE_DONE",
                        ));
                    }
                    if !self.handshake_confirmed {
                        debug!("handshake confirmed");
                        self.handshake_confirmed = true;
                    }
                    if self.spaces[SpaceId::Handshake].crypto.is_some() {
                        self.discard_space(now, SpaceId::Handshake);
                    }
                }
            }
        }

        if let Some(reason) = close {
            self.on_peer_close(reason);
            return Ok(());
        }
        self.on_packet_processed(now, SpaceId::Data, number, ack_eliciting);

        // RFC 9000 section 9.3: follow the peer to the address of its newest non-probing packet
        if self.side.is_server()
            && self.state.is_established()
            && !is_probing_packet
            && path_id != self.active_path
            && number == self.spaces[SpaceId::Data].rx_packet
        {
            self.on_peer_migrated(now, path_id);
        }
        Ok(())
    }

    /// Decrypt a packet, returning its packet number
    ///
    /// `Err(None)` means the packet didn't authenticate and must be dropped silently.
    fn decrypt_packet(
        &mut self,
        now: Instant,
        packet: &mut Packet,
    ) -> Result<Option<u64>, Option<TransportError>> {
        if !packet.header.is_protected() {
            return Ok(None);
        }
        let space = packet.header.space();
        let rx_packet = self.spaces[space].rx_packet;
        let number = packet.header.number().ok_or(None)?.expand(rx_packet + 1);
        let key_phase = packet.header.key_phase();

        let mut crypto_update = false;
        let (result, integrity_limit) = {
            let crypto: &dyn PacketKey = if packet.header.is_0rtt() {
                match self.zero_rtt_crypto.as_ref() {
                    Some(crypto) => &*crypto.packet,
                    None => return Err(None),
                }
            } else if key_phase == self.key_phase || space != SpaceId::Data {
                match self.spaces[space].crypto.as_ref() {
                    Some(keys) => &*keys.packet.remote,
                    None => return Err(None),
                }
            } else if let Some(prev) = self.prev_crypto.as_ref().filter(|prev| {
                // Packets sent before the peer saw our key update still use the old keys
                prev.end_packet.map_or(true, |(pn, _)| number < pn)
            }) {
                &*prev.crypto.remote
            } else {
                // A key phase mismatch that the previous keys don't explain is a key update
                // initiated by the peer
                crypto_update = true;
                match self.next_crypto.as_ref() {
                    Some(keys) => &*keys.remote,
                    None => return Err(None),
                }
            };
            (
                crypto.decrypt(number, &packet.header_data, &mut packet.payload),
                crypto.integrity_limit(),
            )
        };

        if result.is_err() {
            trace!(number, "decryption failed");
            if packet.header.is_short() {
                self.authentication_failures += 1;
                if self.authentication_failures > integrity_limit {
                    return Err(Some(TransportError::AEAD_LIMIT_REACHED(
                        "integrity limit violated",
                    )));
                }
            }
            return Err(None);
        }

        if space == SpaceId::Data {
            if let Some(prev) = self.prev_crypto.as_mut() {
                if prev.end_packet.is_none() && key_phase == self.key_phase {
                    // The peer acknowledged our key update by sending in the new phase
                    prev.end_packet = Some((number, now));
                    self.set_key_discard_timer(now);
                }
            }
        }

        if !packet.reserved_bits_valid() {
            return Err(Some(TransportError::PROTOCOL_VIOLATION(
                "reserved bits set",
            )));
        }

        if crypto_update {
            if number <= rx_packet
                || self
                    .prev_crypto
                    .as_ref()
                    .is_some_and(|prev| prev.update_unacked)
            {
                return Err(Some(TransportError::KEY_UPDATE_ERROR("")));
            }
            trace!("key update authenticated");
            self.update_keys(Some((number, now)), true);
            self.set_key_discard_timer(now);
        }

        Ok(Some(number))
    }

    /// Make the next 1-RTT keys current, keeping the old ones around to read reordered packets
    fn update_keys(&mut self, end_packet: Option<(u64, Instant)>, remote: bool) {
        let Some(keys) = self.spaces[SpaceId::Data].crypto.as_mut() else {
            return;
        };
        let Some(next) = self.next_crypto.take() else {
            return;
        };
        let old = mem::replace(&mut keys.packet, next);
        self.next_crypto = self
            .crypto
            .as_mut()
            .and_then(|crypto| crypto.next_1rtt_keys());
        self.prev_crypto = Some(PrevCrypto {
            crypto: old,
            end_packet,
            update_unacked: remote,
        });
        self.key_phase = !self.key_phase;
        self.authentication_failures = 0;
    }

    fn on_new_connection_id(&mut self, frame: frame::NewConnectionId) -> Result<(), TransportError> {
        trace!(sequence = frame.sequence, id = %frame.id, "new connection ID");
        if frame.retire_prior_to > frame.sequence {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "NEW_CONNECTION_ID retiring unissued CIDs",
            ));
        }
        let retired = self.peer_cids.insert(frame)?;
        for (sequence, in_use) in retired {
            self.spaces[SpaceId::Data].pending.retire_cids.push(sequence);
            if !in_use {
                continue;
            }
            // Paths addressing the peer with a retired CID move on to a fresh one
            for index in 0..self.paths.len() {
                if self.paths[index].dcid_seq == Some(sequence) {
                    self.paths[index].dcid_seq =
                        self.peer_cids.take_unused().map(|(sequence, _)| sequence);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv6Addr, SocketAddr};

    use super::*;
    use crate::{
        StreamId,
        frame::FrameType,
        tests::util::{Pair, read_all, server_config},
    };

    #[test]
    fn frame_rules_follow_packet_type() {
        let local = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 4433);
        let peer = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 44433);
        let now = Instant::now();
        let scid = [7; 8];
        let config = server_config();
        let mut server = Connection::accept(&scid, None, local, peer, &config, now).unwrap();
        let dst_cid = ConnectionId::new(&scid);
        let handshake_done = Bytes::from_static(&[0x1e]);

        // Rejected by the 0-RTT frame rules whatever keys the server already has
        let error = server
            .process_payload(now, PathId::new(0), dst_cid, 0, true, handshake_done.clone())
            .unwrap_err();
        assert_eq!(error.reason, "illegal frame type in 0-RTT");
        assert_eq!(error.frame, Some(FrameType::HANDSHAKE_DONE));

        let error = server
            .process_payload(now, PathId::new(0), dst_cid, 1, false, handshake_done)
            .unwrap_err();
        assert_eq!(error.reason, "client sent HANDSHAKE_DONE");
    }

    #[test]
    fn follows_peer_key_update() {
        let mut pair = Pair::default_pair();
        pair.connect();
        pair.drive();
        let stream = StreamId(0);

        // The client rolls its keys, the server must notice from the key phase bit alone
        pair.client.update_keys(None, false);
        assert!(pair.client.key_phase);
        pair.client_send_all(stream, b"first");
        assert!(pair.server().key_phase);
        assert_eq!(read_all(pair.server(), stream), (b"first".to_vec(), true));

        // Once the server has sent in the new phase the client may update again
        pair.client.update_keys(None, false);
        let stream = StreamId(4);
        pair.client_send_all(stream, b"second");
        assert!(!pair.client.key_phase);
        assert!(!pair.server().key_phase);
        assert_eq!(read_all(pair.server(), stream), (b"second".to_vec(), true));
        assert!(pair.client.is_established());
        assert!(pair.server().is_established());
    }
}
