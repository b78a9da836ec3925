use std::collections::{BTreeMap, BTreeSet, VecDeque, hash_map};

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::{debug, trace};

use super::spaces::{Retransmits, ThinRetransmits};
use crate::{
    Dir, MAX_STREAM_COUNT, Side, StreamId, TransportError, VarInt,
    coding::BufMutExt,
    config::TransportConfig,
    frame::{self, FrameStruct, FrameType, StreamMetaVec},
    transport_parameters::TransportParameters,
};

mod recv;
use recv::Recv;

mod send;
use send::{Send, SendState};

/// Urgency of streams whose priority was never set
pub(super) const DEFAULT_URGENCY: u8 = 127;

/// Per-connection stream multiplexer
///
/// Owns both halves of every live stream along with connection-level flow control. Stream IDs are
/// opened implicitly: referencing a locally-initiated stream opens it and every lower-numbered one
/// of the same kind, as does receiving a frame for a peer-initiated one.
pub(super) struct StreamsState {
    side: Side,
    send: FxHashMap<StreamId, Send>,
    recv: FxHashMap<StreamId, Recv>,

    /// Index of the next locally-initiated stream of each direction
    next: [u64; 2],
    /// Maximum number of locally-initiated streams that may be opened, set by the peer
    max: [u64; 2],
    /// Index of the next peer-initiated stream of each direction
    next_remote: [u64; 2],
    /// Maximum number of peer-initiated streams we allow
    max_remote: [u64; 2],

    /// Receive windows we advertised, per stream kind
    local_window_bidi_local: u64,
    local_window_bidi_remote: u64,
    local_window_uni: u64,
    /// Stream send limits advertised by the peer
    peer_max_stream_data_bidi_local: u64,
    peer_max_stream_data_bidi_remote: u64,
    peer_max_stream_data_uni: u64,

    /// Connection-level limit on data we may send, set by the peer
    max_data: u64,
    /// Bytes accepted from the application across all streams
    data_sent: u64,
    /// Bytes accepted from the application but not yet acknowledged
    unacked_data: u64,
    /// Cap on `unacked_data`
    send_window: u64,

    /// Connection-level limit on data the peer may send
    local_max_data: u64,
    receive_window: u64,
    /// Sum of the highest offsets received on each stream
    data_recvd: u64,
    /// Bytes no longer occupying the receive window
    data_read: u64,

    /// Streams with data or FIN to transmit
    pending: PendingStreams,
    readable: BTreeSet<StreamId>,
    writable: BTreeSet<StreamId>,
    /// Streams whose last write was refused for lack of credit
    blocked: FxHashSet<StreamId>,

    /// Unreliable BLOCKED-family frames waiting to be sent
    data_blocked: Option<u64>,
    stream_data_blocked: Vec<(StreamId, u64)>,
    streams_blocked: [Option<u64>; 2],
    /// Offset at which DATA_BLOCKED was last queued
    data_blocked_at: Option<u64>,
}

impl StreamsState {
    pub(super) fn new(side: Side, config: &TransportConfig) -> Self {
        Self {
            side,
            send: FxHashMap::default(),
            recv: FxHashMap::default(),
            next: [0, 0],
            max: [0, 0],
            next_remote: [0, 0],
            max_remote: [
                config.initial_max_streams_bidi.into_inner(),
                config.initial_max_streams_uni.into_inner(),
            ],
            local_window_bidi_local: config.initial_max_stream_data_bidi_local.into_inner(),
            local_window_bidi_remote: config.initial_max_stream_data_bidi_remote.into_inner(),
            local_window_uni: config.initial_max_stream_data_uni.into_inner(),
            peer_max_stream_data_bidi_local: 0,
            peer_max_stream_data_bidi_remote: 0,
            peer_max_stream_data_uni: 0,
            max_data: 0,
            data_sent: 0,
            unacked_data: 0,
            send_window: config.send_window,
            local_max_data: config.initial_max_data.into_inner(),
            receive_window: config.initial_max_data.into_inner(),
            data_recvd: 0,
            data_read: 0,
            pending: PendingStreams::default(),
            readable: BTreeSet::new(),
            writable: BTreeSet::new(),
            blocked: FxHashSet::default(),
            data_blocked: None,
            stream_data_blocked: Vec::new(),
            streams_blocked: [None, None],
            data_blocked_at: None,
        }
    }

    /// Apply the limits the peer advertised in its transport parameters
    pub(super) fn set_params(&mut self, params: &TransportParameters) {
        self.max = [
            params.initial_max_streams_bidi.into_inner(),
            params.initial_max_streams_uni.into_inner(),
        ];
        self.max_data = params.initial_max_data.into_inner();
        self.peer_max_stream_data_bidi_local = params.initial_max_stream_data_bidi_local.into_inner();
        self.peer_max_stream_data_bidi_remote =
            params.initial_max_stream_data_bidi_remote.into_inner();
        self.peer_max_stream_data_uni = params.initial_max_stream_data_uni.into_inner();
        let ids = self.send.keys().copied().collect::<Vec<_>>();
        for id in ids {
            let max_data = self.max_send_data(id);
            if let Some(stream) = self.send.get_mut(&id) {
                stream.max_data = max_data;
            }
        }
        self.unblock();
    }

    /// Write application data, opening the stream if needed
    pub(super) fn write(&mut self, id: StreamId, data: &[u8], fin: bool) -> Result<usize, WriteError> {
        if id.initiator() != self.side {
            if id.dir() == Dir::Uni || id.index() >= self.next_remote[id.dir() as usize] {
                return Err(WriteError::InvalidStream);
            }
        } else if id.index() >= self.next[id.dir() as usize] {
            if id.index() >= self.max[id.dir() as usize] {
                self.streams_blocked[id.dir() as usize] = Some(self.max[id.dir() as usize]);
                return Err(WriteError::StreamLimit);
            }
            self.open_local(id);
        }

        let limit = self.connection_credit();
        let Some(stream) = self.send.get_mut(&id) else {
            return Err(WriteError::ClosedStream);
        };
        let was_pending = stream.is_pending();
        let written = match stream.write(data, fin, limit) {
            Ok(written) => written,
            Err(WriteError::Blocked) => {
                self.on_write_blocked(id);
                return Err(WriteError::Blocked);
            }
            Err(e) => return Err(e),
        };
        if !was_pending && stream.is_pending() {
            self.pending.push_back(id, stream.urgency);
        }
        self.data_sent += written as u64;
        self.unacked_data += written as u64;
        if written < data.len() {
            self.on_write_blocked(id);
        }
        trace!(stream = %id, written, fin, "wrote stream data");
        Ok(written)
    }

    fn connection_credit(&self) -> u64 {
        let flow = self.max_data.saturating_sub(self.data_sent);
        let window = self.send_window.saturating_sub(self.unacked_data);
        flow.min(window)
    }

    fn on_write_blocked(&mut self, id: StreamId) {
        self.writable.remove(&id);
        self.blocked.insert(id);
        let Some(stream) = self.send.get_mut(&id) else {
            return;
        };
        if stream.is_stream_blocked() {
            let offset = stream.pending.offset();
            if stream.blocked_at != Some(offset) {
                stream.blocked_at = Some(offset);
                self.stream_data_blocked.push((id, offset));
            }
        } else if self.data_sent >= self.max_data && self.data_blocked_at != Some(self.max_data) {
            self.data_blocked_at = Some(self.max_data);
            self.data_blocked = Some(self.max_data);
        }
    }

    /// Move blocked streams that regained credit to the writable set
    fn unblock(&mut self) {
        let connection_credit = self.connection_credit();
        if connection_credit == 0 {
            return;
        }
        let send = &self.send;
        let writable = &mut self.writable;
        self.blocked.retain(|id| match send.get(id) {
            Some(stream) if stream.credit() > 0 => {
                writable.insert(*id);
                false
            }
            Some(_) => true,
            None => false,
        });
    }

    /// Read ordered data from a stream
    pub(super) fn read(
        &mut self,
        id: StreamId,
        buf: &mut [u8],
        pending: &mut Retransmits,
    ) -> Result<(usize, bool), ReadError> {
        if id.initiator() == self.side && id.dir() == Dir::Uni {
            return Err(ReadError::InvalidStream);
        }
        if !self.is_opened(id) {
            return Err(ReadError::InvalidStream);
        }
        let Some(stream) = self.recv.get_mut(&id) else {
            return Err(ReadError::ClosedStream);
        };

        let result = stream.read(buf);
        let window = self.recv_window(id);
        let Some(stream) = self.recv.get_mut(&id) else {
            return result;
        };
        match result {
            Ok((read, fin)) => {
                if stream.max_stream_data(window).is_some() {
                    pending.max_stream_data.insert(id);
                }
                if stream.is_readable() {
                    self.readable.insert(id);
                } else {
                    self.readable.remove(&id);
                }
                self.add_read_credits(read as u64, pending);
                if fin {
                    self.recv.remove(&id);
                    self.stream_freed(id, pending);
                }
            }
            Err(ReadError::Reset(_)) => {
                self.readable.remove(&id);
                self.recv.remove(&id);
                self.stream_freed(id, pending);
            }
            Err(_) => {
                self.readable.remove(&id);
            }
        }
        result
    }

    /// Process an incoming STREAM frame
    pub(super) fn received(
        &mut self,
        frame: frame::Stream,
        pending: &mut Retransmits,
    ) -> Result<(), TransportError> {
        let id = frame.id;
        self.validate_receive_id(id).inspect_err(|_| {
            debug!("received illegal STREAM frame");
        })?;
        self.ensure_remote(id);

        let Some(stream) = self.recv.get_mut(&id) else {
            trace!("dropping frame for closed stream");
            return Ok(());
        };
        let new_bytes = stream.ingest(frame, self.data_recvd, self.local_max_data)?;
        self.data_recvd = self.data_recvd.saturating_add(new_bytes);

        if !stream.stopped {
            if stream.is_readable() {
                self.readable.insert(id);
            }
            return Ok(());
        }

        // Stopped streams don't buffer data, so credit is issued right away
        if stream.is_closed() {
            self.recv.remove(&id);
            self.stream_freed(id, pending);
        }
        self.add_read_credits(new_bytes, pending);
        Ok(())
    }

    /// Process an incoming RESET_STREAM frame
    pub(super) fn received_reset(
        &mut self,
        frame: frame::ResetStream,
        pending: &mut Retransmits,
    ) -> Result<(), TransportError> {
        let frame::ResetStream {
            id,
            error_code,
            final_offset,
        } = frame;
        self.validate_receive_id(id).inspect_err(|_| {
            debug!("received illegal RESET_STREAM frame");
        })?;
        self.ensure_remote(id);

        let Some(stream) = self.recv.get_mut(&id) else {
            trace!("received RESET_STREAM on closed stream");
            return Ok(());
        };
        let bytes_read = stream.assembler.bytes_read();
        let end = stream.end;
        let stopped = stream.stopped;
        if !stream.reset(error_code, final_offset, self.data_recvd, self.local_max_data)? {
            return Ok(());
        }
        let final_offset = final_offset.into_inner();
        self.data_recvd = self.data_recvd.saturating_add(final_offset - end);
        // Data that will never be read no longer occupies the window
        let credit = match stopped {
            true => final_offset - end,
            false => final_offset - bytes_read,
        };
        if stopped {
            self.recv.remove(&id);
            self.stream_freed(id, pending);
        } else {
            self.readable.insert(id);
        }
        self.add_read_credits(credit, pending);
        Ok(())
    }

    /// Process an incoming STOP_SENDING frame, resetting the stream in response
    pub(super) fn received_stop_sending(
        &mut self,
        id: StreamId,
        error_code: VarInt,
        pending: &mut Retransmits,
    ) -> Result<(), TransportError> {
        self.validate_send_id(id).inspect_err(|_| {
            debug!("received illegal STOP_SENDING frame");
        })?;
        self.ensure_remote(id);
        let Some(stream) = self.send.get_mut(&id) else {
            return Ok(());
        };
        if !stream.try_stop(error_code) {
            return Ok(());
        }
        debug!(stream = %id, %error_code, "peer stopped stream");
        let unacked = stream.pending.unacked();
        if stream.reset().is_some() {
            self.unacked_data -= unacked;
            pending.reset_stream.push((id, error_code));
        }
        self.blocked.remove(&id);
        // Surface the stop to the application on its next write
        self.writable.insert(id);
        Ok(())
    }

    pub(super) fn received_max_data(&mut self, n: VarInt) {
        if n.into_inner() > self.max_data {
            self.max_data = n.into_inner();
            self.unblock();
        }
    }

    pub(super) fn received_max_stream_data(
        &mut self,
        id: StreamId,
        offset: u64,
    ) -> Result<(), TransportError> {
        self.validate_send_id(id).inspect_err(|_| {
            debug!("received illegal MAX_STREAM_DATA frame");
        })?;
        self.ensure_remote(id);
        if let Some(stream) = self.send.get_mut(&id) {
            if stream.increase_max_data(offset) && self.blocked.contains(&id) {
                self.unblock();
            }
        }
        Ok(())
    }

    pub(super) fn received_max_streams(&mut self, dir: Dir, count: u64) -> Result<(), TransportError> {
        if count > MAX_STREAM_COUNT {
            return Err(TransportError::FRAME_ENCODING_ERROR(
                "unrepresentable stream limit",
            ));
        }
        let current = &mut self.max[dir as usize];
        if count > *current {
            *current = count;
            self.streams_blocked[dir as usize] = None;
        }
        Ok(())
    }

    /// Check a frame that may only reference streams we can receive on
    pub(super) fn validate_receive_id(&self, id: StreamId) -> Result<(), TransportError> {
        if id.initiator() == self.side {
            match id.dir() {
                Dir::Uni => Err(TransportError::STREAM_STATE_ERROR(
                    "illegal operation on send-only stream",
                )),
                Dir::Bi if id.index() >= self.next[Dir::Bi as usize] => Err(
                    TransportError::STREAM_STATE_ERROR("operation on unopened stream"),
                ),
                Dir::Bi => Ok(()),
            }
        } else if id.index() >= self.max_remote[id.dir() as usize] {
            Err(TransportError::STREAM_LIMIT_ERROR(""))
        } else {
            Ok(())
        }
    }

    /// Check a frame that may only reference streams we can send on
    fn validate_send_id(&self, id: StreamId) -> Result<(), TransportError> {
        if id.initiator() == self.side {
            if id.index() >= self.next[id.dir() as usize] {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "operation on unopened stream",
                ));
            }
            Ok(())
        } else if id.dir() == Dir::Uni {
            Err(TransportError::STREAM_STATE_ERROR(
                "illegal operation on receive-only stream",
            ))
        } else if id.index() >= self.max_remote[id.dir() as usize] {
            Err(TransportError::STREAM_LIMIT_ERROR(""))
        } else {
            Ok(())
        }
    }

    fn is_opened(&self, id: StreamId) -> bool {
        let dir = id.dir() as usize;
        match id.initiator() == self.side {
            true => id.index() < self.next[dir],
            false => id.index() < self.next_remote[dir],
        }
    }

    fn open_local(&mut self, id: StreamId) {
        let dir = id.dir();
        for index in self.next[dir as usize]..=id.index() {
            let id = StreamId::new(self.side, dir, index);
            self.insert(id);
        }
        self.next[dir as usize] = id.index() + 1;
    }

    /// Open all peer-initiated streams up to and including `id`
    fn ensure_remote(&mut self, id: StreamId) {
        if id.initiator() == self.side {
            return;
        }
        let dir = id.dir();
        let next = &mut self.next_remote[dir as usize];
        if id.index() < *next {
            return;
        }
        let start = *next;
        *next = id.index() + 1;
        for index in start..=id.index() {
            let id = StreamId::new(!self.side, dir, index);
            trace!(stream = %id, "peer opened stream");
            self.insert(id);
        }
    }

    fn insert(&mut self, id: StreamId) {
        let local = id.initiator() == self.side;
        if local || id.dir() == Dir::Bi {
            let max_data = self.max_send_data(id);
            self.send.insert(id, Send::new(max_data));
        }
        if !local || id.dir() == Dir::Bi {
            self.recv.insert(id, Recv::new(self.recv_window(id)));
        }
    }

    /// Initial send limit of stream `id`, from the peer's point of view
    fn max_send_data(&self, id: StreamId) -> u64 {
        match (id.initiator() == self.side, id.dir()) {
            (true, Dir::Bi) => self.peer_max_stream_data_bidi_remote,
            (false, Dir::Bi) => self.peer_max_stream_data_bidi_local,
            (_, Dir::Uni) => self.peer_max_stream_data_uni,
        }
    }

    fn recv_window(&self, id: StreamId) -> u64 {
        match (id.initiator() == self.side, id.dir()) {
            (true, Dir::Bi) => self.local_window_bidi_local,
            (false, Dir::Bi) => self.local_window_bidi_remote,
            (_, Dir::Uni) => self.local_window_uni,
        }
    }

    /// Return flow control credit for data the application consumed
    fn add_read_credits(&mut self, credits: u64, pending: &mut Retransmits) {
        self.data_read = self.data_read.saturating_add(credits);
        let max_data = self.data_read + self.receive_window;
        if max_data - self.local_max_data.min(max_data) >= self.receive_window / 2
            && self.receive_window > 0
        {
            self.local_max_data = max_data;
            pending.max_data = true;
        }
    }

    /// Once both halves of a stream are gone, release its slot
    fn stream_freed(&mut self, id: StreamId, pending: &mut Retransmits) {
        if self.send.contains_key(&id) || self.recv.contains_key(&id) {
            return;
        }
        self.readable.remove(&id);
        self.writable.remove(&id);
        self.blocked.remove(&id);
        trace!(stream = %id, "stream closed");
        if id.initiator() != self.side {
            self.max_remote[id.dir() as usize] += 1;
            pending.max_stream_id[id.dir() as usize] = true;
        }
    }

    /// Set the scheduling priority of a stream's outgoing data
    pub(super) fn set_priority(
        &mut self,
        id: StreamId,
        urgency: u8,
        incremental: bool,
    ) -> Result<(), StreamError> {
        if id.initiator() == self.side
            && id.index() >= self.next[id.dir() as usize]
            && id.index() < self.max[id.dir() as usize]
        {
            self.open_local(id);
        }
        if !self.is_opened(id) {
            return Err(StreamError::InvalidStream);
        }
        let Some(stream) = self.send.get_mut(&id) else {
            return match self.recv.contains_key(&id) {
                true => Ok(()),
                false => Err(StreamError::ClosedStream),
            };
        };
        if stream.urgency == urgency && stream.incremental == incremental {
            return Ok(());
        }
        let old = stream.urgency;
        stream.urgency = urgency;
        stream.incremental = incremental;
        if self.pending.remove(id, old) {
            self.pending.push_back(id, urgency);
        }
        Ok(())
    }

    /// Stop reading from or writing to a stream, notifying the peer
    pub(super) fn shutdown(
        &mut self,
        id: StreamId,
        direction: Direction,
        error_code: VarInt,
        pending: &mut Retransmits,
    ) -> Result<(), StreamError> {
        if !self.is_opened(id) {
            return Err(StreamError::InvalidStream);
        }
        let local = id.initiator() == self.side;
        match direction {
            Direction::Read => {
                if local && id.dir() == Dir::Uni {
                    return Err(StreamError::InvalidStream);
                }
                let Some(stream) = self.recv.get_mut(&id) else {
                    return Err(StreamError::ClosedStream);
                };
                let credit = stream.stop();
                if !stream.is_finished() {
                    pending.stop_sending.push(frame::StopSending { id, error_code });
                }
                let closed = stream.is_closed();
                self.readable.remove(&id);
                if closed {
                    self.recv.remove(&id);
                    self.stream_freed(id, pending);
                }
                self.add_read_credits(credit, pending);
            }
            Direction::Write => {
                if !local && id.dir() == Dir::Uni {
                    return Err(StreamError::InvalidStream);
                }
                let Some(stream) = self.send.get_mut(&id) else {
                    return Err(StreamError::ClosedStream);
                };
                let unacked = stream.pending.unacked();
                if stream.reset().is_some() {
                    self.unacked_data -= unacked;
                    pending.reset_stream.push((id, error_code));
                    self.blocked.remove(&id);
                    self.writable.remove(&id);
                    self.unblock();
                }
            }
        }
        Ok(())
    }

    /// Credit available for writing to a stream
    pub(super) fn capacity(&self, id: StreamId) -> Result<usize, StreamError> {
        let stream_credit = match self.send.get(&id) {
            Some(stream) if stream.state == SendState::Ready && stream.stop_reason.is_none() => {
                stream.credit()
            }
            Some(_) => return Err(StreamError::ClosedStream),
            None if id.initiator() == self.side
                && id.index() >= self.next[id.dir() as usize]
                && id.index() < self.max[id.dir() as usize] =>
            {
                self.max_send_data(id)
            }
            None if self.is_opened(id) && self.recv.contains_key(&id) => {
                return Err(StreamError::InvalidStream);
            }
            None if self.is_opened(id) => return Err(StreamError::ClosedStream),
            None => return Err(StreamError::InvalidStream),
        };
        Ok(stream_credit.min(self.connection_credit()) as usize)
    }

    /// Take the next stream with data or a terminal condition for the application to read
    pub(super) fn readable_next(&mut self) -> Option<StreamId> {
        self.readable.pop_first()
    }

    /// Take the next stream whose writes were blocked and that can make progress again
    pub(super) fn writable_next(&mut self) -> Option<StreamId> {
        self.writable.pop_first()
    }

    pub(super) fn is_readable(&self, id: StreamId) -> bool {
        self.recv.get(&id).is_some_and(Recv::is_readable)
    }

    /// Whether the peer finished or reset the stream and everything was read
    pub(super) fn is_finished(&self, id: StreamId) -> bool {
        match self.recv.get(&id) {
            Some(stream) => stream.is_closed(),
            None => true,
        }
    }

    pub(super) fn reset_acked(&mut self, id: StreamId, pending: &mut Retransmits) {
        if let hash_map::Entry::Occupied(e) = self.send.entry(id) {
            if e.get().state == SendState::ResetSent {
                e.remove();
                self.stream_freed(id, pending);
            }
        }
    }

    pub(super) fn received_ack_of(&mut self, frame: frame::StreamMeta, pending: &mut Retransmits) {
        let id = frame.id;
        let Some(stream) = self.send.get_mut(&id) else {
            return;
        };
        if stream.is_reset() {
            // Outstanding data on reset streams was released at reset time
            return;
        }
        let before = stream.pending.unacked();
        let finished = stream.ack(frame);
        self.unacked_data -= before - stream.pending.unacked();
        if finished {
            self.send.remove(&id);
            self.stream_freed(id, pending);
        }
        if !self.blocked.is_empty() {
            self.unblock();
        }
    }

    pub(super) fn retransmit(&mut self, frame: frame::StreamMeta) {
        let Some(stream) = self.send.get_mut(&frame.id) else {
            return;
        };
        if stream.is_reset() {
            return;
        }
        if !stream.is_pending() {
            self.pending.push_back(frame.id, stream.urgency);
        }
        stream.fin_pending |= frame.fin;
        stream.pending.retransmit(frame.offsets);
    }

    /// Queue everything sent in 0-RTT again for 1-RTT
    pub(super) fn retransmit_all_for_0rtt(&mut self) {
        for dir in Dir::iter() {
            for index in 0..self.next[dir as usize] {
                let id = StreamId::new(Side::Client, dir, index);
                let Some(stream) = self.send.get_mut(&id) else {
                    continue;
                };
                if stream.is_reset() {
                    continue;
                }
                let was_pending = stream.is_pending();
                stream.pending.retransmit_all_for_0rtt();
                if matches!(stream.state, SendState::DataSent { .. }) {
                    stream.fin_pending = true;
                }
                if !was_pending && stream.is_pending() {
                    self.pending.push_back(id, stream.urgency);
                }
            }
        }
    }

    /// Whether any stream has STREAM frames to send
    pub(super) fn can_send_stream_data(&self) -> bool {
        self.pending
            .iter()
            .any(|id| self.send.get(id).is_some_and(Send::is_pending))
    }

    /// Whether MAX_STREAM_DATA frames could be sent for stream `id`
    pub(super) fn can_send_flow_control(&self, id: StreamId) -> bool {
        self.recv
            .get(&id)
            .is_some_and(Recv::can_send_flow_control)
    }

    /// Whether unreliable BLOCKED-family frames are queued
    pub(super) fn has_blocked_frames(&self) -> bool {
        self.data_blocked.is_some()
            || !self.stream_data_blocked.is_empty()
            || self.streams_blocked.iter().any(Option::is_some)
    }

    pub(super) fn write_control_frames(
        &mut self,
        buf: &mut Vec<u8>,
        pending: &mut Retransmits,
        retransmits: &mut ThinRetransmits,
        max_size: usize,
    ) {
        // RESET_STREAM
        while buf.len() + frame::ResetStream::SIZE_BOUND < max_size {
            let Some((id, error_code)) = pending.reset_stream.pop() else {
                break;
            };
            let Some(stream) = self.send.get(&id) else {
                continue;
            };
            if stream.state != SendState::ResetSent {
                continue;
            }
            trace!(stream = %id, "RESET_STREAM");
            retransmits
                .get_or_create()
                .reset_stream
                .push((id, error_code));
            frame::ResetStream {
                id,
                error_code,
                final_offset: VarInt::saturating(stream.pending.offset()),
            }
            .encode(buf);
        }

        // STOP_SENDING
        while buf.len() + frame::StopSending::SIZE_BOUND < max_size {
            let Some(frame) = pending.stop_sending.pop() else {
                break;
            };
            // The peer may have finished the stream in the meantime
            if !self.recv.get(&frame.id).is_some_and(|s| !s.is_finished()) {
                continue;
            }
            trace!(stream = %frame.id, "STOP_SENDING");
            frame.encode(buf);
            retransmits.get_or_create().stop_sending.push(frame);
        }

        // MAX_DATA
        if pending.max_data && buf.len() + 9 < max_size {
            pending.max_data = false;
            trace!(value = self.local_max_data, "MAX_DATA");
            retransmits.get_or_create().max_data = true;
            buf.write(FrameType::MAX_DATA);
            buf.write_var(self.local_max_data);
        }

        // MAX_STREAM_DATA
        while buf.len() + 17 < max_size {
            let Some(&id) = pending.max_stream_data.iter().next() else {
                break;
            };
            pending.max_stream_data.remove(&id);
            let window = self.recv_window(id);
            let Some(stream) = self.recv.get_mut(&id) else {
                continue;
            };
            if !stream.can_send_flow_control() {
                continue;
            }
            let max = (stream.assembler.bytes_read() + window).max(stream.sent_max_stream_data());
            stream.record_sent_max_stream_data(max);
            trace!(stream = %id, max, "MAX_STREAM_DATA");
            retransmits.get_or_create().max_stream_data.insert(id);
            buf.write(FrameType::MAX_STREAM_DATA);
            buf.write(id);
            buf.write_var(max);
        }

        // MAX_STREAMS
        for dir in Dir::iter() {
            if !pending.max_stream_id[dir as usize] || buf.len() + 9 >= max_size {
                continue;
            }
            pending.max_stream_id[dir as usize] = false;
            retransmits.get_or_create().max_stream_id[dir as usize] = true;
            let count = self.max_remote[dir as usize];
            trace!(%dir, count, "MAX_STREAMS");
            buf.write(match dir {
                Dir::Uni => FrameType::MAX_STREAMS_UNI,
                Dir::Bi => FrameType::MAX_STREAMS_BIDI,
            });
            buf.write_var(count);
        }

        // DATA_BLOCKED
        if let Some(offset) = self.data_blocked {
            if buf.len() + 9 < max_size {
                self.data_blocked = None;
                trace!(offset, "DATA_BLOCKED");
                buf.write(FrameType::DATA_BLOCKED);
                buf.write_var(offset);
            }
        }

        // STREAM_DATA_BLOCKED
        while buf.len() + 17 < max_size {
            let Some((id, offset)) = self.stream_data_blocked.pop() else {
                break;
            };
            trace!(stream = %id, offset, "STREAM_DATA_BLOCKED");
            buf.write(FrameType::STREAM_DATA_BLOCKED);
            buf.write(id);
            buf.write_var(offset);
        }

        // STREAMS_BLOCKED
        for dir in Dir::iter() {
            if buf.len() + 9 >= max_size {
                break;
            }
            let Some(limit) = self.streams_blocked[dir as usize].take() else {
                continue;
            };
            trace!(%dir, limit, "STREAMS_BLOCKED");
            buf.write(match dir {
                Dir::Bi => FrameType::STREAMS_BLOCKED_BIDI,
                Dir::Uni => FrameType::STREAMS_BLOCKED_UNI,
            });
            buf.write_var(limit);
        }
    }

    /// Fill `buf` with STREAM frames in priority order
    pub(super) fn write_stream_frames(&mut self, buf: &mut Vec<u8>, max_size: usize) -> StreamMetaVec {
        let mut stream_frames = StreamMetaVec::new();
        while buf.len() + frame::Stream::SIZE_BOUND < max_size {
            let Some(id) = self.pending.pop() else {
                break;
            };
            let Some(stream) = self.send.get_mut(&id) else {
                continue;
            };
            if !stream.is_pending() {
                continue;
            }

            // Type byte, stream ID, offset and length
            let overhead = 1 + VarInt::saturating(id.0).size() + 8 + 8;
            let room = max_size - buf.len() - overhead;
            let offsets = stream.pending.poll_transmit(room);
            let fin = offsets.end == stream.pending.offset()
                && matches!(stream.state, SendState::DataSent { .. });
            if fin {
                stream.fin_pending = false;
            }

            if stream.is_pending() {
                // Incremental streams take turns; others keep the head of their level
                match stream.incremental {
                    true => self.pending.push_back(id, stream.urgency),
                    false => self.pending.push_front(id, stream.urgency),
                }
            }

            let meta = frame::StreamMeta { id, offsets, fin };
            trace!(stream = %meta.id, off = meta.offsets.start, len = meta.offsets.end - meta.offsets.start, fin = meta.fin, "STREAM");
            meta.encode(true, buf);
            stream.pending.copy_to(meta.offsets.clone(), buf);
            stream_frames.push(meta);
        }
        stream_frames
    }

    #[cfg(test)]
    fn has_stream(&self, id: StreamId) -> bool {
        self.send.contains_key(&id) || self.recv.contains_key(&id)
    }
}

/// Streams awaiting transmission, grouped by urgency
#[derive(Debug, Default)]
struct PendingStreams {
    levels: BTreeMap<u8, VecDeque<StreamId>>,
}

impl PendingStreams {
    fn push_back(&mut self, id: StreamId, urgency: u8) {
        self.levels.entry(urgency).or_default().push_back(id);
    }

    fn push_front(&mut self, id: StreamId, urgency: u8) {
        self.levels.entry(urgency).or_default().push_front(id);
    }

    /// Take the first stream of the most urgent level
    fn pop(&mut self) -> Option<StreamId> {
        let mut level = self.levels.first_entry()?;
        let id = level.get_mut().pop_front();
        if level.get().is_empty() {
            level.remove();
        }
        id
    }

    fn remove(&mut self, id: StreamId, urgency: u8) -> bool {
        let Some(level) = self.levels.get_mut(&urgency) else {
            return false;
        };
        let Some(pos) = level.iter().position(|&x| x == id) else {
            return false;
        };
        level.remove(pos);
        if level.is_empty() {
            self.levels.remove(&urgency);
        }
        true
    }

    fn iter(&self) -> impl Iterator<Item = &StreamId> {
        self.levels.values().flatten()
    }
}

/// Which half of a stream to shut down
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    /// Stop receiving, sending STOP_SENDING
    Read,
    /// Stop sending, sending RESET_STREAM
    Write,
}

/// Errors triggered while writing to a stream
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// Flow control or the send buffer left no room for more data
    ///
    /// Retry once the stream shows up in
    /// [`stream_writable_next`](crate::Connection::stream_writable_next).
    #[error("blocked by flow control")]
    Blocked,
    /// The peer asked us to stop sending with the given error code
    #[error("stopped by peer: code {0}")]
    Stopped(VarInt),
    /// The stream was finished or reset
    #[error("closed stream")]
    ClosedStream,
    /// The stream can't be written by this endpoint
    #[error("invalid stream")]
    InvalidStream,
    /// Opening the stream would exceed the peer's stream limit
    #[error("stream limit reached")]
    StreamLimit,
}

/// Errors triggered when reading from a stream
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// No data is ready to be read
    #[error("blocked")]
    Blocked,
    /// The peer abandoned transmitting data on this stream
    #[error("reset by peer: code {0}")]
    Reset(VarInt),
    /// All data was read or the stream was stopped
    #[error("closed stream")]
    ClosedStream,
    /// The stream can't be read by this endpoint, or wasn't opened
    #[error("invalid stream")]
    InvalidStream,
}

/// Errors of stream management operations
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The stream doesn't exist or doesn't support the operation
    #[error("invalid stream")]
    InvalidStream,
    /// The stream was already closed
    #[error("closed stream")]
    ClosedStream,
}
