use std::{
    fmt,
    ops::{Range, RangeInclusive},
};

use bytes::{Buf, BufMut, Bytes};
use tinyvec::TinyVec;

use crate::{
    Dir, MAX_CID_SIZE, RESET_TOKEN_SIZE, ResetToken, StreamId, TransportError, TransportErrorCode,
    VarInt,
    coding::{self, BufExt, BufMutExt, UnexpectedEnd},
    range_set::ArrayRangeSet,
    shared::ConnectionId,
};

/// A QUIC frame type
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FrameType(u64);

impl FrameType {
    fn is_stream(self) -> bool {
        STREAM_TYS.contains(&self.0)
    }

    fn is_datagram(self) -> bool {
        DATAGRAM_TYS.contains(&self.0)
    }

    fn has(self, bit: u64) -> bool {
        self.0 & bit != 0
    }
}

impl coding::Codec for FrameType {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        buf.get_var().map(Self)
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

impl fmt::Debug for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Type({:02x})", self.0),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None if self.is_stream() => f.write_str("STREAM"),
            None if self.is_datagram() => f.write_str("DATAGRAM"),
            None => write!(f, "<unknown {:02x}>", self.0),
        }
    }
}

pub(crate) trait FrameStruct {
    /// Smallest number of bytes this type of frame is guaranteed to fit within.
    const SIZE_BOUND: usize;
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub(crate) const $name: FrameType = FrameType($val);)*

            fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($val => Some(stringify!($name)),)*
                    _ => None,
                }
            }
        }
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    NEW_TOKEN = 0x07,
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    DATA_BLOCKED = 0x14,
    STREAM_DATA_BLOCKED = 0x15,
    STREAMS_BLOCKED_BIDI = 0x16,
    STREAMS_BLOCKED_UNI = 0x17,
    NEW_CONNECTION_ID = 0x18,
    RETIRE_CONNECTION_ID = 0x19,
    PATH_CHALLENGE = 0x1a,
    PATH_RESPONSE = 0x1b,
    CONNECTION_CLOSE = 0x1c,
    APPLICATION_CLOSE = 0x1d,
    HANDSHAKE_DONE = 0x1e,
}

/// STREAM frames occupy 0x08..=0x0f, the low bits flagging optional fields
const STREAM_TYS: RangeInclusive<u64> = 0x08..=0x0f;
const STREAM_FIN: u64 = 0x01;
const STREAM_LEN: u64 = 0x02;
const STREAM_OFF: u64 = 0x04;

/// DATAGRAM frames (RFC 9221), the low bit flagging an explicit length
const DATAGRAM_TYS: RangeInclusive<u64> = 0x30..=0x31;
const DATAGRAM_LEN: u64 = 0x01;

#[derive(Debug)]
pub(crate) enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto),
    NewToken(NewToken),
    Stream(Stream),
    MaxData(VarInt),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { dir: Dir, count: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { dir: Dir, limit: u64 },
    NewConnectionId(NewConnectionId),
    RetireConnectionId { sequence: u64 },
    PathChallenge(u64),
    PathResponse(u64),
    Close(Close),
    Datagram(Datagram),
    HandshakeDone,
}

impl Frame {
    pub(crate) fn ty(&self) -> FrameType {
        match self {
            Self::Padding => FrameType::PADDING,
            Self::Ping => FrameType::PING,
            Self::Ack(_) => FrameType::ACK,
            Self::ResetStream(_) => FrameType::RESET_STREAM,
            Self::StopSending(_) => FrameType::STOP_SENDING,
            Self::Crypto(_) => FrameType::CRYPTO,
            Self::NewToken(_) => FrameType::NEW_TOKEN,
            Self::Stream(stream) => {
                let mut ty = *STREAM_TYS.start();
                if stream.fin {
                    ty |= STREAM_FIN;
                }
                if stream.offset != 0 {
                    ty |= STREAM_OFF;
                }
                FrameType(ty)
            }
            Self::MaxData(_) => FrameType::MAX_DATA,
            Self::MaxStreamData { .. } => FrameType::MAX_STREAM_DATA,
            Self::MaxStreams { dir: Dir::Bi, .. } => FrameType::MAX_STREAMS_BIDI,
            Self::MaxStreams { dir: Dir::Uni, .. } => FrameType::MAX_STREAMS_UNI,
            Self::DataBlocked { .. } => FrameType::DATA_BLOCKED,
            Self::StreamDataBlocked { .. } => FrameType::STREAM_DATA_BLOCKED,
            Self::StreamsBlocked { dir: Dir::Bi, .. } => FrameType::STREAMS_BLOCKED_BIDI,
            Self::StreamsBlocked { dir: Dir::Uni, .. } => FrameType::STREAMS_BLOCKED_UNI,
            Self::NewConnectionId(_) => FrameType::NEW_CONNECTION_ID,
            Self::RetireConnectionId { .. } => FrameType::RETIRE_CONNECTION_ID,
            Self::PathChallenge(_) => FrameType::PATH_CHALLENGE,
            Self::PathResponse(_) => FrameType::PATH_RESPONSE,
            Self::Close(Close::Connection(_)) => FrameType::CONNECTION_CLOSE,
            Self::Close(Close::Application(_)) => FrameType::APPLICATION_CLOSE,
            Self::Datagram(_) => FrameType(*DATAGRAM_TYS.start()),
            Self::HandshakeDone => FrameType::HANDSHAKE_DONE,
        }
    }

    pub(crate) fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Self::Ack(_) | Self::Padding | Self::Close(_))
    }

    /// Whether the frame may appear in Initial and Handshake packets
    pub(crate) fn is_allowed_in_handshake(&self) -> bool {
        matches!(
            self,
            Self::Padding
                | Self::Ping
                | Self::Ack(_)
                | Self::Crypto(_)
                | Self::Close(Close::Connection(_))
        )
    }

    /// Whether the frame may appear in 0-RTT packets
    pub(crate) fn is_allowed_in_0rtt(&self) -> bool {
        !matches!(
            self,
            Self::Ack(_)
                | Self::Crypto(_)
                | Self::NewToken(_)
                | Self::PathResponse(_)
                | Self::RetireConnectionId { .. }
                | Self::HandshakeDone
        )
    }

    /// Whether receipt of the frame says the sender is only probing a path
    pub(crate) fn is_probing(&self) -> bool {
        matches!(
            self,
            Self::PathChallenge(_)
                | Self::PathResponse(_)
                | Self::NewConnectionId(_)
                | Self::Padding
        )
    }
}

/// Reason for closing a connection, as carried by a CONNECTION_CLOSE frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Close {
    /// The transport closed the connection
    Connection(ConnectionClose),
    /// The application closed the connection
    Application(ApplicationClose),
}

impl Close {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        match self {
            Self::Connection(close) => close.encode(out, max_len),
            Self::Application(close) => close.encode(out, max_len),
        }
    }

    /// Whether the close was initiated by the application
    pub fn is_app(&self) -> bool {
        matches!(self, Self::Application(_))
    }

    /// The error code carried by the frame
    pub fn error_code(&self) -> u64 {
        match self {
            Self::Connection(close) => close.error_code.into(),
            Self::Application(close) => close.error_code.into_inner(),
        }
    }

    /// The human-readable reason carried by the frame
    pub fn reason(&self) -> &[u8] {
        match self {
            Self::Connection(close) => &close.reason,
            Self::Application(close) => &close.reason,
        }
    }
}

impl fmt::Display for Close {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(close) => fmt::Display::fmt(close, f),
            Self::Application(close) => fmt::Display::fmt(close, f),
        }
    }
}

impl From<TransportError> for Close {
    fn from(err: TransportError) -> Self {
        Self::Connection(err.into())
    }
}

impl From<ConnectionClose> for Close {
    fn from(close: ConnectionClose) -> Self {
        Self::Connection(close)
    }
}

impl From<ApplicationClose> for Close {
    fn from(close: ApplicationClose) -> Self {
        Self::Application(close)
    }
}

/// Reason given by the transport for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClose {
    /// Class of error as encoded on the wire
    pub error_code: TransportErrorCode,
    /// Type of frame that caused the close
    pub frame_type: Option<FrameType>,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error_code, f)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl From<TransportError> for ConnectionClose {
    fn from(err: TransportError) -> Self {
        Self {
            error_code: err.code,
            frame_type: err.frame,
            reason: err.reason.into(),
        }
    }
}

impl FrameStruct for ConnectionClose {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 8;
}

impl ConnectionClose {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        let frame_type = self.frame_type.map_or(0, |ty| ty.0);
        let fixed = 1
            + VarInt::saturating(u64::from(self.error_code)).size()
            + VarInt::saturating(frame_type).size();
        out.write(FrameType::CONNECTION_CLOSE);
        out.write(self.error_code);
        out.write_var(frame_type);
        write_reason(out, &self.reason, max_len.saturating_sub(fixed));
    }

    fn decode(bytes: &mut Bytes) -> Result<Self, IterErr> {
        Ok(Self {
            error_code: bytes.get()?,
            frame_type: match bytes.get_var()? {
                0 => None,
                ty => Some(FrameType(ty)),
            },
            reason: take_len(bytes)?,
        })
    }
}

/// Reason given by an application for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationClose {
    /// Application-specific reason code
    pub error_code: VarInt,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason.is_empty() {
            true => fmt::Display::fmt(&self.error_code, f),
            false => write!(
                f,
                "{} (code {})",
                String::from_utf8_lossy(&self.reason),
                self.error_code
            ),
        }
    }
}

impl FrameStruct for ApplicationClose {
    const SIZE_BOUND: usize = 1 + 8 + 8;
}

impl ApplicationClose {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        let fixed = 1 + self.error_code.size();
        out.write(FrameType::APPLICATION_CLOSE);
        out.write(self.error_code);
        write_reason(out, &self.reason, max_len.saturating_sub(fixed));
    }

    fn decode(bytes: &mut Bytes) -> Result<Self, IterErr> {
        Ok(Self {
            error_code: bytes.get()?,
            reason: take_len(bytes)?,
        })
    }
}

/// Write a length-prefixed close reason, truncated so prefix and reason fit in `room`
fn write_reason<W: BufMut>(out: &mut W, reason: &[u8], room: usize) {
    let prefix = VarInt::saturating(reason.len() as u64).size();
    let len = reason.len().min(room.saturating_sub(prefix));
    out.write_var(len as u64);
    out.put_slice(&reason[..len]);
}

#[derive(Clone, Eq, PartialEq)]
pub(crate) struct Ack {
    pub(crate) largest: u64,
    pub(crate) delay: u64,
    /// Encoded ranges, validated on decode
    pub(crate) additional: Bytes,
    pub(crate) ecn: Option<EcnCounts>,
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("largest", &self.largest)
            .field("delay", &self.delay)
            .field("ecn", &self.ecn)
            .field("ranges", &AckRanges(self))
            .finish()
    }
}

struct AckRanges<'a>(&'a Ack);

impl fmt::Debug for AckRanges<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a Ack {
    type Item = RangeInclusive<u64>;
    type IntoIter = AckIter<'a>;

    fn into_iter(self) -> AckIter<'a> {
        AckIter {
            largest: self.largest,
            data: &self.additional,
        }
    }
}

impl Ack {
    /// Encode the ranges of `ranges`, which must not be empty
    pub(crate) fn encode<W: BufMut>(delay: u64, ranges: &ArrayRangeSet, buf: &mut W) {
        // Ranges go out highest first, each as a gap below the previous one and a length
        let mut descending = ranges.iter().rev();
        let Some(first) = descending.next() else {
            debug_assert!(false, "ACK frame with no ranges");
            return;
        };
        buf.write(FrameType::ACK);
        buf.write_var(first.end - 1);
        buf.write_var(delay);
        buf.write_var(ranges.len() as u64 - 1);
        buf.write_var(first.end - first.start - 1);
        let mut lowest = first.start;
        for range in descending {
            buf.write_var(lowest - range.end - 1);
            buf.write_var(range.end - range.start - 1);
            lowest = range.start;
        }
    }

    pub(crate) fn iter(&self) -> AckIter<'_> {
        self.into_iter()
    }

    fn decode(bytes: &mut Bytes, ecn: bool) -> Result<Self, IterErr> {
        let largest = bytes.get_var()?;
        let delay = bytes.get_var()?;
        let extra_ranges = bytes.get_var()?;
        let len = scan_ack_ranges(bytes, largest, extra_ranges)?;
        let additional = bytes.split_to(len);
        let ecn = match ecn {
            true => Some(EcnCounts {
                ect0: bytes.get_var()?,
                ect1: bytes.get_var()?,
                ce: bytes.get_var()?,
            }),
            false => None,
        };
        Ok(Self {
            largest,
            delay,
            additional,
            ecn,
        })
    }
}

/// Check that `extra` gap/length pairs after the first range stay above packet zero, returning
/// how many bytes of `buf` the ranges take
fn scan_ack_ranges(buf: &[u8], largest: u64, extra: u64) -> Result<usize, IterErr> {
    let mut cursor = buf;
    let mut smallest = largest
        .checked_sub(cursor.get_var()?)
        .ok_or(IterErr::Malformed)?;
    for _ in 0..extra {
        let gap = cursor.get_var()?;
        let len = cursor.get_var()?;
        smallest = smallest
            .checked_sub(gap + 2)
            .and_then(|x| x.checked_sub(len))
            .ok_or(IterErr::Malformed)?;
    }
    Ok(buf.len() - cursor.len())
}

/// Iterates over the acknowledged ranges of an [`Ack`], highest first
#[derive(Debug, Clone)]
pub(crate) struct AckIter<'a> {
    largest: u64,
    data: &'a [u8],
}

impl Iterator for AckIter<'_> {
    type Item = RangeInclusive<u64>;

    fn next(&mut self) -> Option<RangeInclusive<u64>> {
        if self.data.is_empty() {
            return None;
        }
        let len = self.data.get_var().ok()?;
        let range = self.largest - len..=self.largest;
        if let Ok(gap) = self.data.get_var() {
            self.largest -= len + gap + 2;
        }
        Some(range)
    }
}

/// ECN counts reported by the peer
///
/// Decoded for well-formedness; this endpoint does not mark packets with ECN.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct EcnCounts {
    pub(crate) ect0: u64,
    pub(crate) ect1: u64,
    pub(crate) ce: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct Stream {
    pub(crate) id: StreamId,
    pub(crate) offset: u64,
    pub(crate) fin: bool,
    pub(crate) data: Bytes,
}

impl FrameStruct for Stream {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 8;
}

impl Stream {
    fn decode(bytes: &mut Bytes, ty: FrameType) -> Result<Self, IterErr> {
        let id = bytes.get()?;
        let offset = match ty.has(STREAM_OFF) {
            true => bytes.get_var()?,
            false => 0,
        };
        let data = match ty.has(STREAM_LEN) {
            true => take_len(bytes)?,
            false => bytes.split_off(0),
        };
        Ok(Self {
            id,
            offset,
            fin: ty.has(STREAM_FIN),
            data,
        })
    }
}

/// Metadata from a stream frame
#[derive(Debug, Clone)]
pub(crate) struct StreamMeta {
    pub(crate) id: StreamId,
    pub(crate) offsets: Range<u64>,
    pub(crate) fin: bool,
}

// Needed by `TinyVec`
impl Default for StreamMeta {
    fn default() -> Self {
        Self {
            id: StreamId(0),
            offsets: 0..0,
            fin: false,
        }
    }
}

impl StreamMeta {
    /// Write the frame header; the data follows, running to the end of the packet unless `length`
    pub(crate) fn encode<W: BufMut>(&self, length: bool, out: &mut W) {
        let has_offset = self.offsets.start != 0;
        let mut ty = *STREAM_TYS.start();
        if has_offset {
            ty |= STREAM_OFF;
        }
        if length {
            ty |= STREAM_LEN;
        }
        if self.fin {
            ty |= STREAM_FIN;
        }
        out.write_var(ty);
        out.write(self.id);
        if has_offset {
            out.write_var(self.offsets.start);
        }
        if length {
            out.write_var(self.offsets.end - self.offsets.start);
        }
    }
}

/// A vector of [`StreamMeta`] with optimization for the single element case
pub(crate) type StreamMetaVec = TinyVec<[StreamMeta; 1]>;

#[derive(Debug, Clone)]
pub(crate) struct Crypto {
    pub(crate) offset: u64,
    pub(crate) data: Bytes,
}

impl Crypto {
    pub(crate) const SIZE_BOUND: usize = 17;

    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::CRYPTO);
        out.write_var(self.offset);
        out.write_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NewToken {
    pub(crate) token: Bytes,
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct ResetStream {
    pub(crate) id: StreamId,
    pub(crate) error_code: VarInt,
    pub(crate) final_offset: VarInt,
}

impl FrameStruct for ResetStream {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 8;
}

impl ResetStream {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::RESET_STREAM);
        out.write(self.id);
        out.write(self.error_code);
        out.write(self.final_offset);
    }
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct StopSending {
    pub(crate) id: StreamId,
    pub(crate) error_code: VarInt,
}

impl FrameStruct for StopSending {
    const SIZE_BOUND: usize = 1 + 8 + 8;
}

impl StopSending {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::STOP_SENDING);
        out.write(self.id);
        out.write(self.error_code);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct NewConnectionId {
    pub(crate) sequence: u64,
    pub(crate) retire_prior_to: u64,
    pub(crate) id: ConnectionId,
    pub(crate) reset_token: ResetToken,
}

impl FrameStruct for NewConnectionId {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 1 + MAX_CID_SIZE + RESET_TOKEN_SIZE;
}

impl NewConnectionId {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::NEW_CONNECTION_ID);
        out.write_var(self.sequence);
        out.write_var(self.retire_prior_to);
        out.write(self.id.len() as u8);
        out.put_slice(&self.id);
        out.put_slice(&self.reset_token);
    }

    fn decode<R: Buf>(bytes: &mut R) -> Result<Self, IterErr> {
        let sequence = bytes.get_var()?;
        let retire_prior_to = bytes.get_var()?;
        if retire_prior_to > sequence {
            return Err(IterErr::Malformed);
        }
        let len = usize::from(bytes.get::<u8>()?);
        if !(1..=MAX_CID_SIZE).contains(&len) {
            return Err(IterErr::Malformed);
        }
        if bytes.remaining() < len + RESET_TOKEN_SIZE {
            return Err(IterErr::UnexpectedEnd);
        }
        let id = ConnectionId::from_buf(bytes, len);
        let mut reset_token = [0; RESET_TOKEN_SIZE];
        bytes.copy_to_slice(&mut reset_token);
        Ok(Self {
            sequence,
            retire_prior_to,
            id,
            reset_token: reset_token.into(),
        })
    }
}

/// An unreliable datagram
#[derive(Debug, Clone)]
pub(crate) struct Datagram {
    /// Payload
    pub(crate) data: Bytes,
}

impl FrameStruct for Datagram {
    const SIZE_BOUND: usize = 1 + 8;
}

impl Datagram {
    pub(crate) fn encode(&self, length: bool, out: &mut impl BufMut) {
        let mut ty = *DATAGRAM_TYS.start();
        if length {
            ty |= DATAGRAM_LEN;
        }
        out.write_var(ty);
        if length {
            out.write_var(self.data.len() as u64);
        }
        out.put_slice(&self.data);
    }

    /// Encoded size of the frame
    pub(crate) fn size(&self, length: bool) -> usize {
        let prefix = match length {
            true => VarInt::saturating(self.data.len() as u64).size(),
            false => 0,
        };
        1 + prefix + self.data.len()
    }

    fn decode(bytes: &mut Bytes, ty: FrameType) -> Result<Self, IterErr> {
        let data = match ty.has(DATAGRAM_LEN) {
            true => take_len(bytes)?,
            false => bytes.split_off(0),
        };
        Ok(Self { data })
    }
}

/// Split a varint-length-prefixed field off the front of `bytes`
fn take_len(bytes: &mut Bytes) -> Result<Bytes, UnexpectedEnd> {
    let len = bytes.get_var()?;
    if len > bytes.remaining() as u64 {
        return Err(UnexpectedEnd);
    }
    Ok(bytes.split_to(len as usize))
}

/// Decodes the frames of a packet payload
///
/// Yields an error for the first malformed frame and nothing after it.
pub(crate) struct Iter {
    bytes: Bytes,
    last_ty: Option<FrameType>,
}

impl Iter {
    pub(crate) fn new(payload: Bytes) -> Result<Self, TransportError> {
        // RFC 9000 §12.4: a packet without frames is a PROTOCOL_VIOLATION
        if payload.is_empty() {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "packet payload is empty",
            ));
        }
        Ok(Self {
            bytes: payload,
            last_ty: None,
        })
    }

    fn try_next(&mut self) -> Result<Frame, IterErr> {
        let ty = self.bytes.get::<FrameType>()?;
        self.last_ty = Some(ty);
        let bytes = &mut self.bytes;
        let frame = match ty {
            FrameType::PADDING => Frame::Padding,
            FrameType::PING => Frame::Ping,
            FrameType::ACK => Frame::Ack(Ack::decode(bytes, false)?),
            FrameType::ACK_ECN => Frame::Ack(Ack::decode(bytes, true)?),
            FrameType::RESET_STREAM => Frame::ResetStream(ResetStream {
                id: bytes.get()?,
                error_code: bytes.get()?,
                final_offset: bytes.get()?,
            }),
            FrameType::STOP_SENDING => Frame::StopSending(StopSending {
                id: bytes.get()?,
                error_code: bytes.get()?,
            }),
            FrameType::CRYPTO => Frame::Crypto(Crypto {
                offset: bytes.get_var()?,
                data: take_len(bytes)?,
            }),
            FrameType::NEW_TOKEN => Frame::NewToken(NewToken {
                token: take_len(bytes)?,
            }),
            FrameType::MAX_DATA => Frame::MaxData(bytes.get()?),
            FrameType::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: bytes.get()?,
                offset: bytes.get_var()?,
            },
            FrameType::MAX_STREAMS_BIDI | FrameType::MAX_STREAMS_UNI => Frame::MaxStreams {
                dir: streams_dir(ty, FrameType::MAX_STREAMS_BIDI),
                count: bytes.get_var()?,
            },
            FrameType::DATA_BLOCKED => Frame::DataBlocked {
                offset: bytes.get_var()?,
            },
            FrameType::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: bytes.get()?,
                offset: bytes.get_var()?,
            },
            FrameType::STREAMS_BLOCKED_BIDI | FrameType::STREAMS_BLOCKED_UNI => {
                Frame::StreamsBlocked {
                    dir: streams_dir(ty, FrameType::STREAMS_BLOCKED_BIDI),
                    limit: bytes.get_var()?,
                }
            }
            FrameType::NEW_CONNECTION_ID => Frame::NewConnectionId(NewConnectionId::decode(bytes)?),
            FrameType::RETIRE_CONNECTION_ID => Frame::RetireConnectionId {
                sequence: bytes.get_var()?,
            },
            FrameType::PATH_CHALLENGE => Frame::PathChallenge(bytes.get()?),
            FrameType::PATH_RESPONSE => Frame::PathResponse(bytes.get()?),
            FrameType::CONNECTION_CLOSE => {
                Frame::Close(Close::Connection(ConnectionClose::decode(bytes)?))
            }
            FrameType::APPLICATION_CLOSE => {
                Frame::Close(Close::Application(ApplicationClose::decode(bytes)?))
            }
            FrameType::HANDSHAKE_DONE => Frame::HandshakeDone,
            _ if ty.is_stream() => Frame::Stream(Stream::decode(bytes, ty)?),
            _ if ty.is_datagram() => Frame::Datagram(Datagram::decode(bytes, ty)?),
            _ => return Err(IterErr::InvalidFrameId),
        };
        Ok(frame)
    }
}

/// Direction of a MAX_STREAMS or STREAMS_BLOCKED frame, whose bidi variant is `bidi`
fn streams_dir(ty: FrameType, bidi: FrameType) -> Dir {
    match ty == bidi {
        true => Dir::Bi,
        false => Dir::Uni,
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, InvalidFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.is_empty() {
            return None;
        }
        Some(self.try_next().map_err(|err| {
            // Nothing after a corrupt frame can be trusted
            self.bytes.clear();
            InvalidFrame {
                ty: self.last_ty,
                reason: err.reason(),
            }
        }))
    }
}

#[derive(Debug)]
pub(crate) struct InvalidFrame {
    pub(crate) ty: Option<FrameType>,
    pub(crate) reason: &'static str,
}

impl From<InvalidFrame> for TransportError {
    fn from(err: InvalidFrame) -> Self {
        let mut te = Self::FRAME_ENCODING_ERROR(err.reason);
        te.frame = err.ty;
        te
    }
}

#[derive(Debug)]
enum IterErr {
    UnexpectedEnd,
    InvalidFrameId,
    Malformed,
}

impl IterErr {
    fn reason(&self) -> &'static str {
        match self {
            Self::UnexpectedEnd => "unexpected end",
            Self::InvalidFrameId => "invalid frame ID",
            Self::Malformed => "malformed",
        }
    }
}

impl From<UnexpectedEnd> for IterErr {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coding::Codec;
    use assert_matches::assert_matches;

    #[track_caller]
    fn frames(buf: Vec<u8>) -> Vec<Frame> {
        Iter::new(Bytes::from(buf))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn ack_coding() {
        const PACKETS: &[u64] = &[1, 2, 3, 5, 10, 11, 14];
        let mut ranges = ArrayRangeSet::new();
        for &packet in PACKETS {
            ranges.insert(packet..packet + 1);
        }
        let mut buf = Vec::new();
        Ack::encode(42, &ranges, &mut buf);
        let frames = frames(buf);
        assert_eq!(frames.len(), 1);
        match frames[0] {
            Frame::Ack(ref ack) => {
                let mut packets = ack.iter().flatten().collect::<Vec<_>>();
                packets.sort_unstable();
                assert_eq!(&packets[..], PACKETS);
                assert_eq!(ack.delay, 42);
                assert_eq!(ack.ecn, None);
                assert_eq!(ack.iter().next(), Some(14..=14));
            }
            ref x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn ack_ecn_decoding() {
        let mut ranges = ArrayRangeSet::new();
        ranges.insert(0..4);
        let mut buf = Vec::new();
        Ack::encode(0, &ranges, &mut buf);
        buf[0] = 0x03;
        buf.extend_from_slice(&[3, 0, 1]);
        match &frames(buf)[0] {
            Frame::Ack(ack) => assert_eq!(
                ack.ecn,
                Some(EcnCounts {
                    ect0: 3,
                    ect1: 0,
                    ce: 1
                })
            ),
            x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn malformed_ack_ranges() {
        // Largest 2 with a first range of 5 reaches below packet zero
        let buf = vec![0x02, 0x02, 0x00, 0x00, 0x05];
        let err = Iter::new(Bytes::from(buf))
            .unwrap()
            .next()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.ty, Some(FrameType::ACK));
        let err = TransportError::from(err);
        assert_eq!(err.code, TransportErrorCode::FRAME_ENCODING_ERROR);
    }

    #[test]
    fn stream_coding() {
        let mut buf = Vec::new();
        let meta = StreamMeta {
            id: StreamId(4),
            offsets: 10..15,
            fin: true,
        };
        meta.encode(true, &mut buf);
        buf.extend_from_slice(b"hello");
        meta.encode(false, &mut buf);
        buf.extend_from_slice(b"tail");
        let frames = frames(buf);
        assert_eq!(frames.len(), 2);
        assert_matches!(&frames[0], Frame::Stream(s) if s.id == StreamId(4) && s.offset == 10 && s.fin && s.data[..] == b"hello"[..]);
        assert_matches!(&frames[1], Frame::Stream(s) if s.data[..] == b"tail"[..]);
        assert_eq!(frames[0].ty().to_string(), "STREAM");
    }

    #[test]
    fn new_connection_id_validation() {
        let frame = NewConnectionId {
            sequence: 3,
            retire_prior_to: 1,
            id: ConnectionId::new(&[0xab; 8]),
            reset_token: ResetToken::from([0xcd; RESET_TOKEN_SIZE]),
        };
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_matches!(&frames(buf.clone())[0], Frame::NewConnectionId(x) if *x == frame);

        // retire_prior_to may not exceed the sequence number
        buf[2] = 0x05;
        assert!(Iter::new(Bytes::from(buf)).unwrap().next().unwrap().is_err());
    }

    #[test]
    fn close_truncates_reason() {
        let close = ConnectionClose {
            error_code: TransportErrorCode::PROTOCOL_VIOLATION,
            frame_type: Some(FrameType::STREAM_DATA_BLOCKED),
            reason: Bytes::from(vec![b'x'; 100]),
        };
        let mut buf = Vec::new();
        close.encode(&mut buf, 32);
        assert!(buf.len() <= 32);
        match &frames(buf)[0] {
            Frame::Close(Close::Connection(x)) => {
                assert_eq!(x.error_code, close.error_code);
                assert_eq!(x.frame_type, close.frame_type);
                assert!(x.reason.len() < 100);
            }
            x => panic!("incorrect frame {x:?}"),
        }

        let app = Close::Application(ApplicationClose {
            error_code: VarInt(7),
            reason: Bytes::from_static(b"bye"),
        });
        assert!(app.is_app());
        assert_eq!(app.error_code(), 7);
        assert_eq!(app.reason(), b"bye");
        assert_eq!(app.to_string(), "bye (code 7)");
    }

    #[test]
    fn datagram_coding() {
        let mut buf = Vec::new();
        let dgram = Datagram {
            data: Bytes::from_static(b"unreliable"),
        };
        dgram.encode(true, &mut buf);
        assert_eq!(buf.len(), dgram.size(true));
        FrameType::HANDSHAKE_DONE.encode(&mut buf);
        let frames = frames(buf);
        assert_matches!(&frames[0], Frame::Datagram(d) if d.data[..] == b"unreliable"[..]);
        assert_matches!(&frames[1], Frame::HandshakeDone);
    }

    #[test]
    fn unknown_frame_type() {
        let err = Iter::new(Bytes::from_static(&[0x01, 0x21]))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap_err();
        assert_eq!(err.reason, "invalid frame ID");
        assert_eq!(err.ty.map(|ty| ty.to_string()).as_deref(), Some("<unknown 21>"));
    }

    #[test]
    fn empty_payload_rejected() {
        assert!(Iter::new(Bytes::new()).is_err());
    }
}
