use std::{cmp::Ordering, io, ops::Range};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use thiserror::Error;

use crate::{
    ConnectionId, PROTOCOL_VERSION,
    coding::{self, BufExt, BufMutExt},
    connection::BufferTooShort,
    crypto,
};

/// Decodes a QUIC packet's invariant header
///
/// Due to packet number encryption, it is impossible to fully decode a header
/// (which includes a variable-length packet number) without crypto context.
/// The crypto context is usually part of the `Connection`, or can be derived
/// from the destination CID for Initial packets.
///
/// To cope with this, we decode the invariant header (which should be stable
/// across QUIC versions), which gives us the destination CID and allows us
/// to inspect the version and packet type (which depends on the version).
/// This information allows us to fully decode and decrypt the packet.
#[derive(Debug)]
pub(crate) struct PartialDecode {
    plain_header: ProtectedHeader,
    buf: io::Cursor<BytesMut>,
}

impl PartialDecode {
    /// Begin decoding a QUIC packet from `bytes`, returning any trailing data not part of that packet
    pub(crate) fn new(
        bytes: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = io::Cursor::new(bytes);
        let plain_header = ProtectedHeader::decode(&mut buf, local_cid_len)?;
        let dgram_len = buf.get_ref().len();
        let packet_len = plain_header
            .payload_len()
            .map(|len| (buf.position() + len) as usize)
            .unwrap_or(dgram_len);
        match dgram_len.cmp(&packet_len) {
            Ordering::Equal => Ok((Self { plain_header, buf }, None)),
            Ordering::Less => Err(PacketDecodeError::InvalidHeader(
                "packet too short to contain payload length",
            )),
            Ordering::Greater => {
                let rest = Some(buf.get_mut().split_off(packet_len));
                Ok((Self { plain_header, buf }, rest))
            }
        }
    }

    /// The underlying partially-decoded packet data
    pub(crate) fn data(&self) -> &[u8] {
        self.buf.get_ref()
    }

    pub(crate) fn initial_header(&self) -> Option<&ProtectedInitialHeader> {
        self.plain_header.as_initial()
    }

    pub(crate) fn has_long_header(&self) -> bool {
        !matches!(self.plain_header, ProtectedHeader::Short { .. })
    }

    pub(crate) fn is_initial(&self) -> bool {
        self.space() == Some(SpaceId::Initial)
    }

    pub(crate) fn space(&self) -> Option<SpaceId> {
        use ProtectedHeader::*;
        match self.plain_header {
            Initial { .. } => Some(SpaceId::Initial),
            Long {
                ty: LongType::Handshake,
                ..
            } => Some(SpaceId::Handshake),
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => Some(SpaceId::Data),
            Short { .. } => Some(SpaceId::Data),
            _ => None,
        }
    }

    pub(crate) fn is_0rtt(&self) -> bool {
        match self.plain_header {
            ProtectedHeader::Long { ty, .. } => ty == LongType::ZeroRtt,
            _ => false,
        }
    }

    pub(crate) fn dst_cid(&self) -> &ConnectionId {
        self.plain_header.dst_cid()
    }

    /// Length of data being decoded
    #[allow(unreachable_pub)] // fuzzing only
    pub fn len(&self) -> usize {
        self.buf.get_ref().len()
    }

    pub(crate) fn finish(
        self,
        header_crypto: Option<&dyn crypto::HeaderKey>,
    ) -> Result<Packet, PacketDecodeError> {
        use ProtectedHeader::*;
        let Self {
            plain_header,
            mut buf,
        } = self;

        if let Initial(ProtectedInitialHeader {
            dst_cid,
            src_cid,
            token_pos,
            version,
            ..
        }) = plain_header
        {
            let number = Self::decrypt_header(&mut buf, header_crypto)?;
            let header_len = buf.position() as usize;
            let mut bytes = buf.into_inner();

            let header_data = bytes.split_to(header_len).freeze();
            let token = header_data.slice(token_pos.start..token_pos.end);
            return Ok(Packet {
                header: PlainHeader::Initial(InitialHeader {
                    dst_cid,
                    src_cid,
                    token,
                    number,
                    version,
                }),
                header_data,
                payload: bytes,
            });
        }

        let header = match plain_header {
            Long {
                ty,
                dst_cid,
                src_cid,
                version,
                ..
            } => PlainHeader::Long {
                ty,
                dst_cid,
                src_cid,
                number: Self::decrypt_header(&mut buf, header_crypto)?,
                version,
            },
            Retry {
                dst_cid,
                src_cid,
                version,
            } => PlainHeader::Retry {
                dst_cid,
                src_cid,
                version,
            },
            Short { spin, dst_cid, .. } => {
                let number = Self::decrypt_header(&mut buf, header_crypto)?;
                let key_phase = buf.get_ref()[0] & KEY_PHASE_BIT != 0;
                PlainHeader::Short {
                    spin,
                    key_phase,
                    dst_cid,
                    number,
                }
            }
            VersionNegotiate {
                random,
                dst_cid,
                src_cid,
            } => PlainHeader::VersionNegotiate {
                random,
                dst_cid,
                src_cid,
            },
            Initial(_) => unreachable!(),
        };

        let header_len = buf.position() as usize;
        let mut bytes = buf.into_inner();
        Ok(Packet {
            header,
            header_data: bytes.split_to(header_len).freeze(),
            payload: bytes,
        })
    }

    fn decrypt_header(
        buf: &mut io::Cursor<BytesMut>,
        header_crypto: Option<&dyn crypto::HeaderKey>,
    ) -> Result<PacketNumber, PacketDecodeError> {
        let packet_length = buf.get_ref().len();
        let pn_offset = buf.position() as usize;
        if packet_length < pn_offset + 4 {
            return Err(PacketDecodeError::InvalidHeader(
                "packet too short to read packet number",
            ));
        }
        let header_crypto = header_crypto.ok_or(PacketDecodeError::InvalidHeader(
            "no keys to remove header protection",
        ))?;
        if packet_length < pn_offset + 4 + header_crypto.sample_size() {
            return Err(PacketDecodeError::InvalidHeader(
                "packet too short to extract header protection sample",
            ));
        }

        header_crypto.decrypt(pn_offset, buf.get_mut());

        let len = PacketNumber::decode_len(buf.get_ref()[0]);
        PacketNumber::decode(len, buf)
    }
}

/// A packet whose header protection has been removed
pub(crate) struct Packet {
    pub(crate) header: PlainHeader,
    pub(crate) header_data: Bytes,
    pub(crate) payload: BytesMut,
}

impl Packet {
    pub(crate) fn reserved_bits_valid(&self) -> bool {
        let mask = match self.header {
            PlainHeader::Short { .. } => SHORT_RESERVED_BITS,
            _ => LONG_RESERVED_BITS,
        };
        self.header_data[0] & mask == 0
    }
}

/// A packet header with protection removed
#[derive(Debug, Clone)]
pub(crate) enum PlainHeader {
    Initial(InitialHeader),
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
        version: u32,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        version: u32,
    },
    Short {
        spin: bool,
        key_phase: bool,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    VersionNegotiate {
        random: u8,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
}

impl PlainHeader {
    pub(crate) fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use PlainHeader::*;
        let start = w.len();
        match *self {
            Initial(InitialHeader {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
                version,
            }) => {
                w.write(u8::from(LongHeaderType::Initial) | number.tag());
                w.write(version);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.write_var(token.len() as u64);
                w.put_slice(token);
                w.write::<u16>(0); // Placeholder for payload length; see `set_payload_length`
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), true)),
                }
            }
            Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
                version,
            } => {
                w.write(u8::from(LongHeaderType::Standard(ty)) | number.tag());
                w.write(version);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.write::<u16>(0); // Placeholder for payload length; see `set_payload_length`
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), true)),
                }
            }
            Retry {
                ref dst_cid,
                ref src_cid,
                version,
            } => {
                w.write(u8::from(LongHeaderType::Retry));
                w.write(version);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: None,
                }
            }
            Short {
                spin,
                key_phase,
                ref dst_cid,
                number,
            } => {
                w.write(
                    FIXED_BIT
                        | if key_phase { KEY_PHASE_BIT } else { 0 }
                        | if spin { SPIN_BIT } else { 0 }
                        | number.tag(),
                );
                w.put_slice(dst_cid);
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), false)),
                }
            }
            VersionNegotiate {
                ref random,
                ref dst_cid,
                ref src_cid,
            } => {
                w.write(LONG_HEADER_FORM | random);
                w.write::<u32>(0);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: None,
                }
            }
        }
    }

    /// Whether the packet is encrypted on the wire
    pub(crate) fn is_protected(&self) -> bool {
        !matches!(
            *self,
            Self::Retry { .. } | Self::VersionNegotiate { .. }
        )
    }

    pub(crate) fn number(&self) -> Option<PacketNumber> {
        use PlainHeader::*;
        Some(match *self {
            Initial(InitialHeader { number, .. }) => number,
            Long { number, .. } => number,
            Short { number, .. } => number,
            _ => return None,
        })
    }

    pub(crate) fn space(&self) -> SpaceId {
        use PlainHeader::*;
        match *self {
            Short { .. } => SpaceId::Data,
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => SpaceId::Data,
            Long {
                ty: LongType::Handshake,
                ..
            } => SpaceId::Handshake,
            _ => SpaceId::Initial,
        }
    }

    pub(crate) fn key_phase(&self) -> bool {
        match *self {
            Self::Short { key_phase, .. } => key_phase,
            _ => false,
        }
    }

    pub(crate) fn is_short(&self) -> bool {
        matches!(*self, Self::Short { .. })
    }

    pub(crate) fn is_1rtt(&self) -> bool {
        self.is_short()
    }

    pub(crate) fn is_0rtt(&self) -> bool {
        matches!(
            *self,
            Self::Long {
                ty: LongType::ZeroRtt,
                ..
            }
        )
    }

    pub(crate) fn dst_cid(&self) -> &ConnectionId {
        use PlainHeader::*;
        match self {
            Initial(header) => &header.dst_cid,
            Long { dst_cid, .. } => dst_cid,
            Retry { dst_cid, .. } => dst_cid,
            Short { dst_cid, .. } => dst_cid,
            VersionNegotiate { dst_cid, .. } => dst_cid,
        }
    }

    pub(crate) fn src_cid(&self) -> Option<&ConnectionId> {
        use PlainHeader::*;
        match self {
            Initial(header) => Some(&header.src_cid),
            Long { src_cid, .. } => Some(src_cid),
            Retry { src_cid, .. } => Some(src_cid),
            Short { .. } => None,
            VersionNegotiate { src_cid, .. } => Some(src_cid),
        }
    }

    /// Whether the payload of this packet contains QUIC frames
    pub(crate) fn has_frames(&self) -> bool {
        use PlainHeader::*;
        match *self {
            Initial(_) => true,
            Long { .. } => true,
            Retry { .. } => false,
            Short { .. } => true,
            VersionNegotiate { .. } => false,
        }
    }
}

pub(crate) struct PartialEncode {
    pub(crate) start: usize,
    pub(crate) header_len: usize,
    // Packet number length, payload length needed
    pn: Option<(usize, bool)>,
}

impl PartialEncode {
    pub(crate) fn finish(
        self,
        buf: &mut [u8],
        header_crypto: &dyn crypto::HeaderKey,
        crypto: Option<(u64, &dyn crypto::PacketKey)>,
    ) {
        let Self { header_len, pn, .. } = self;
        let (pn_len, write_len) = match pn {
            Some((pn_len, write_len)) => (pn_len, write_len),
            None => return,
        };

        let pn_pos = header_len - pn_len;
        if write_len {
            let len = buf.len() - header_len + pn_len;
            debug_assert!(len < 2usize.pow(14)); // Fits in reserved space
            let mut slice = &mut buf[pn_pos - 2..pn_pos];
            slice.put_u16(len as u16 | (0b01 << 14));
        }

        if let Some((number, crypto)) = crypto {
            crypto.encrypt(number, buf, header_len);
        }

        debug_assert!(
            pn_pos + 4 + header_crypto.sample_size() <= buf.len(),
            "packet must be padded to at least {} bytes for header protection sampling",
            pn_pos + 4 + header_crypto.sample_size()
        );
        header_crypto.encrypt(pn_pos, buf);
    }
}

/// Plain packet header
#[derive(Clone, Debug)]
pub(crate) enum ProtectedHeader {
    /// An Initial packet header
    Initial(ProtectedInitialHeader),
    /// A Long packet header, as used during the handshake
    Long {
        /// Type of the Long header packet
        ty: LongType,
        /// Destination Connection ID
        dst_cid: ConnectionId,
        /// Source Connection ID
        src_cid: ConnectionId,
        /// Length of the packet payload
        len: u64,
        /// QUIC version
        version: u32,
    },
    /// A Retry packet header
    Retry {
        /// Destination Connection ID
        dst_cid: ConnectionId,
        /// Source Connection ID
        src_cid: ConnectionId,
        /// QUIC version
        version: u32,
    },
    /// A short packet header, as used during the data phase
    Short {
        /// Spin bit
        spin: bool,
        /// Destination Connection ID
        dst_cid: ConnectionId,
    },
    /// A Version Negotiation packet header
    VersionNegotiate {
        /// Random value
        random: u8,
        /// Destination Connection ID
        dst_cid: ConnectionId,
        /// Source Connection ID
        src_cid: ConnectionId,
    },
}

impl ProtectedHeader {
    fn as_initial(&self) -> Option<&ProtectedInitialHeader> {
        match self {
            Self::Initial(x) => Some(x),
            _ => None,
        }
    }

    /// The destination Connection ID of the packet
    pub(crate) fn dst_cid(&self) -> &ConnectionId {
        use ProtectedHeader::*;
        match self {
            Initial(header) => &header.dst_cid,
            Long { dst_cid, .. } => dst_cid,
            Retry { dst_cid, .. } => dst_cid,
            Short { dst_cid, .. } => dst_cid,
            VersionNegotiate { dst_cid, .. } => dst_cid,
        }
    }

    fn payload_len(&self) -> Option<u64> {
        use ProtectedHeader::*;
        match self {
            Initial(ProtectedInitialHeader { len, .. }) | Long { len, .. } => Some(*len),
            _ => None,
        }
    }

    /// Decode a plain header from given buffer, with given local connection ID length
    pub(crate) fn decode(
        buf: &mut io::Cursor<BytesMut>,
        local_cid_len: usize,
    ) -> Result<Self, PacketDecodeError> {
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            if first & FIXED_BIT == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }
            let spin = first & SPIN_BIT != 0;
            if buf.remaining() < local_cid_len {
                return Err(PacketDecodeError::InvalidHeader(
                    "destination connection ID longer than packet",
                ));
            }
            Ok(Self::Short {
                spin,
                dst_cid: ConnectionId::from_buf(buf, local_cid_len),
            })
        } else {
            let (version, dst_cid, src_cid) = decode_long_invariant(buf)?;

            if version == 0 {
                let random = first & !LONG_HEADER_FORM;
                return Ok(Self::VersionNegotiate {
                    random,
                    dst_cid,
                    src_cid,
                });
            }

            if version != PROTOCOL_VERSION {
                return Err(PacketDecodeError::UnsupportedVersion {
                    src_cid,
                    dst_cid,
                    version,
                });
            }
            if first & FIXED_BIT == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }

            match LongHeaderType::from_byte(first)? {
                LongHeaderType::Initial => {
                    let token_len = buf.get_var()? as usize;
                    let token_start = buf.position() as usize;
                    if token_len > buf.remaining() {
                        return Err(PacketDecodeError::InvalidHeader("token out of bounds"));
                    }
                    buf.advance(token_len);

                    let len = buf.get_var()?;
                    Ok(Self::Initial(ProtectedInitialHeader {
                        dst_cid,
                        src_cid,
                        token_pos: token_start..token_start + token_len,
                        len,
                        version,
                    }))
                }
                LongHeaderType::Retry => Ok(Self::Retry {
                    dst_cid,
                    src_cid,
                    version,
                }),
                LongHeaderType::Standard(ty) => Ok(Self::Long {
                    ty,
                    dst_cid,
                    src_cid,
                    len: buf.get_var()?,
                    version,
                }),
            }
        }
    }
}

fn decode_long_invariant<B: Buf>(
    buf: &mut B,
) -> Result<(u32, ConnectionId, ConnectionId), PacketDecodeError> {
    let version = buf.get::<u32>()?;
    let dst_cid = ConnectionId::decode_long(buf).ok_or(PacketDecodeError::InvalidHeader(
        "malformed destination connection ID",
    ))?;
    let src_cid = ConnectionId::decode_long(buf).ok_or(PacketDecodeError::InvalidHeader(
        "malformed source connection ID",
    ))?;
    Ok((version, dst_cid, src_cid))
}

/// Header of an Initial packet, before decryption
#[derive(Clone, Debug)]
pub(crate) struct ProtectedInitialHeader {
    /// Destination Connection ID
    pub(crate) dst_cid: ConnectionId,
    /// Source Connection ID
    pub(crate) src_cid: ConnectionId,
    /// The position of a token in the packet buffer
    pub(crate) token_pos: Range<usize>,
    /// Length of the packet payload
    pub(crate) len: u64,
    /// QUIC version
    pub(crate) version: u32,
}

#[derive(Clone, Debug)]
pub(crate) struct InitialHeader {
    pub(crate) dst_cid: ConnectionId,
    pub(crate) src_cid: ConnectionId,
    pub(crate) token: Bytes,
    pub(crate) number: PacketNumber,
    pub(crate) version: u32,
}

// An encoded packet number
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    pub(crate) fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            Self::U8(n as u8)
        } else if range < 1 << 16 {
            Self::U16(n as u16)
        } else if range < 1 << 24 {
            Self::U24(n as u32)
        } else {
            Self::U32(n as u32)
        }
    }

    pub(crate) fn len(self) -> usize {
        use PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        use PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U24(x) => w.put_uint(u64::from(x), 3),
            U32(x) => w.write(x),
        }
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> Result<Self, PacketDecodeError> {
        use PacketNumber::*;
        let pn = match len {
            1 => U8(r.get()?),
            2 => U16(r.get()?),
            3 => {
                if r.remaining() < 3 {
                    return Err(coding::UnexpectedEnd.into());
                }
                U24(r.get_uint(3) as u32)
            }
            4 => U32(r.get()?),
            _ => unreachable!(),
        };
        Ok(pn)
    }

    pub(crate) fn decode_len(tag: u8) -> usize {
        1 + (tag & 0x03) as usize
    }

    fn tag(self) -> u8 {
        use PacketNumber::*;
        match self {
            U8(_) => 0b00,
            U16(_) => 0b01,
            U24(_) => 0b10,
            U32(_) => 0b11,
        }
    }

    pub(crate) fn expand(self, expected: u64) -> u64 {
        // From Appendix A
        use PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) => u64::from(x),
            U32(x) => u64::from(x),
        };
        let nbits = self.len() * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // The incoming packet number should be greater than expected - hwin and less than or equal
        // to expected + hwin
        //
        // This means we can't just strip the trailing bits from expected and add the truncated
        // because that might yield a value outside the window.
        //
        // The following code calculates a candidate value and makes sure it's within the packet
        // number window.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).is_some_and(|x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate > win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// Long packet type including non-uniform cases
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongHeaderType {
    Initial,
    Retry,
    Standard(LongType),
}

impl LongHeaderType {
    fn from_byte(b: u8) -> Result<Self, PacketDecodeError> {
        use {LongHeaderType::*, LongType::*};
        debug_assert!(b & LONG_HEADER_FORM != 0, "not a long packet");
        Ok(match (b & 0x30) >> 4 {
            0x0 => Initial,
            0x1 => Standard(ZeroRtt),
            0x2 => Standard(Handshake),
            0x3 => Retry,
            _ => unreachable!(),
        })
    }
}

impl From<LongHeaderType> for u8 {
    fn from(ty: LongHeaderType) -> Self {
        use {LongHeaderType::*, LongType::*};
        match ty {
            Initial => LONG_HEADER_FORM | FIXED_BIT,
            Standard(ZeroRtt) => LONG_HEADER_FORM | FIXED_BIT | (0x1 << 4),
            Standard(Handshake) => LONG_HEADER_FORM | FIXED_BIT | (0x2 << 4),
            Retry => LONG_HEADER_FORM | FIXED_BIT | (0x3 << 4),
        }
    }
}

/// Long packet types with uniform header structure
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongType {
    Handshake,
    ZeroRtt,
}

/// Packet number space identifiers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum SpaceId {
    /// Unprotected packets, used to bootstrap the handshake
    Initial = 0,
    Handshake = 1,
    /// Application data space, used for 0-RTT and post-handshake/1-RTT packets
    Data = 2,
}

impl SpaceId {
    pub(crate) fn iter() -> impl Iterator<Item = Self> {
        [Self::Initial, Self::Handshake, Self::Data].iter().cloned()
    }
}

/// Type of a QUIC packet as seen on the wire
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketType {
    /// Initial packet, carrying the first handshake messages
    Initial,
    /// 0-RTT packet, carrying early application data
    ZeroRtt,
    /// Handshake packet
    Handshake,
    /// Retry packet, asking the client to prove ownership of its address
    Retry,
    /// Version Negotiation packet
    VersionNegotiation,
    /// 1-RTT packet with a short header
    Short,
}

/// Header fields of an ingress packet, readable without any keys
///
/// Returned by [`parse_header`] so a driver can route datagrams to connections, answer unknown
/// versions and decide whether to send a Retry before creating a [`Connection`].
///
/// [`Connection`]: crate::Connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Kind of packet
    pub ty: PacketType,
    /// Version field of a long header, 0 for Version Negotiation and short headers
    pub version: u32,
    /// Destination connection ID
    pub dcid: ConnectionId,
    /// Source connection ID, empty for short headers
    pub scid: ConnectionId,
    /// Address validation token carried by Initial and Retry packets
    pub token: Option<Vec<u8>>,
    /// Versions listed in a Version Negotiation packet
    pub versions: Option<Vec<u32>>,
}

/// Parse the header of the first packet in `buf`
///
/// Short headers carry no length for their destination CID, so `dcid_len` must be the length of
/// the connection IDs this endpoint issues. Packets using a version other than
/// [`PROTOCOL_VERSION`] fail with [`PacketDecodeError::UnsupportedVersion`], carrying the
/// connection IDs needed to answer with [`negotiate_version`].
pub fn parse_header(buf: &[u8], dcid_len: usize) -> Result<Header, PacketDecodeError> {
    if dcid_len > crate::MAX_CID_SIZE {
        return Err(PacketDecodeError::InvalidHeader(
            "connection ID length exceeds maximum",
        ));
    }
    let mut cursor = io::Cursor::new(BytesMut::from(buf));
    let header = ProtectedHeader::decode(&mut cursor, dcid_len)?;
    Ok(match header {
        ProtectedHeader::Initial(ProtectedInitialHeader {
            dst_cid,
            src_cid,
            token_pos,
            version,
            ..
        }) => Header {
            ty: PacketType::Initial,
            version,
            dcid: dst_cid,
            scid: src_cid,
            token: Some(buf[token_pos].to_vec()),
            versions: None,
        },
        ProtectedHeader::Long {
            ty,
            dst_cid,
            src_cid,
            version,
            ..
        } => Header {
            ty: match ty {
                LongType::Handshake => PacketType::Handshake,
                LongType::ZeroRtt => PacketType::ZeroRtt,
            },
            version,
            dcid: dst_cid,
            scid: src_cid,
            token: None,
            versions: None,
        },
        ProtectedHeader::Retry {
            dst_cid,
            src_cid,
            version,
        } => {
            let start = cursor.position() as usize;
            let token_end = buf
                .len()
                .checked_sub(RETRY_TAG_LEN)
                .filter(|&end| end >= start)
                .ok_or(PacketDecodeError::InvalidHeader("retry packet too short"))?;
            Header {
                ty: PacketType::Retry,
                version,
                dcid: dst_cid,
                scid: src_cid,
                token: Some(buf[start..token_end].to_vec()),
                versions: None,
            }
        }
        ProtectedHeader::Short { dst_cid, .. } => Header {
            ty: PacketType::Short,
            version: 0,
            dcid: dst_cid,
            scid: ConnectionId::new(&[]),
            token: None,
            versions: None,
        },
        ProtectedHeader::VersionNegotiate {
            dst_cid, src_cid, ..
        } => {
            let mut versions = Vec::new();
            while cursor.remaining() >= 4 {
                versions.push(cursor.get_u32());
            }
            Header {
                ty: PacketType::VersionNegotiation,
                version: 0,
                dcid: dst_cid,
                scid: src_cid,
                token: None,
                versions: Some(versions),
            }
        }
    })
}

/// Whether `buf` starts with a Version Negotiation packet
pub fn is_version_negotiation(buf: &[u8]) -> bool {
    buf.len() >= 5 && buf[0] & LONG_HEADER_FORM != 0 && buf[1..5] == [0; 4]
}

/// Write a Version Negotiation packet answering a packet with the given connection IDs
///
/// `scid` and `dcid` are the source and destination IDs of the packet being answered; they are
/// swapped on the way out. Returns the number of bytes written.
pub fn negotiate_version(
    scid: &ConnectionId,
    dcid: &ConnectionId,
    out: &mut [u8],
) -> Result<usize, BufferTooShort> {
    let mut buf = Vec::with_capacity(7 + scid.len() + dcid.len() + 8);
    PlainHeader::VersionNegotiate {
        random: rand::rng().random::<u8>() | FIXED_BIT,
        src_cid: *dcid,
        dst_cid: *scid,
    }
    .encode(&mut buf);
    // Grease with a reserved version to exercise the peer's negotiation logic
    buf.write::<u32>(0x0a1a_2a3a);
    buf.write::<u32>(PROTOCOL_VERSION);
    write_out(&buf, out)
}

/// Write a Retry packet in response to a client Initial
///
/// `scid` and `dcid` are the source and destination IDs of the client's Initial, `new_scid` the
/// ID the server will use from now on. The client must echo `token` in its next Initial; the
/// server then passes `dcid` as the original destination ID to [`Connection::accept`].
///
/// [`Connection::accept`]: crate::Connection::accept
pub fn retry(
    scid: &ConnectionId,
    dcid: &ConnectionId,
    new_scid: &ConnectionId,
    token: &[u8],
    version: u32,
    out: &mut [u8],
) -> Result<usize, BufferTooShort> {
    let mut buf = Vec::with_capacity(7 + scid.len() + new_scid.len() + token.len() + 16);
    PlainHeader::Retry {
        dst_cid: *scid,
        src_cid: *new_scid,
        version,
    }
    .encode(&mut buf);
    buf.put_slice(token);
    let tag = crypto::rustls::retry_tag(dcid, &buf);
    buf.put_slice(&tag);
    write_out(&buf, out)
}

fn write_out(packet: &[u8], out: &mut [u8]) -> Result<usize, BufferTooShort> {
    let dst = out.get_mut(..packet.len()).ok_or(BufferTooShort)?;
    dst.copy_from_slice(packet);
    Ok(packet.len())
}

/// Generate a random connection ID of `len` bytes, at most [`MAX_CONN_ID_LEN`]
///
/// [`MAX_CONN_ID_LEN`]: crate::MAX_CONN_ID_LEN
pub fn generate_cid(len: usize) -> ConnectionId {
    ConnectionId::random(&mut rand::rng(), len)
}

/// Encode a list of application protocols in the TLS ALPN wire format
///
/// Protocol names longer than 255 bytes cannot be represented and are skipped.
pub fn encode_alpn(protos: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for proto in protos.iter().filter(|p| !p.is_empty() && p.len() <= 255) {
        out.push(proto.len() as u8);
        out.extend_from_slice(proto.as_bytes());
    }
    out
}

/// Reasons why a packet header could not be decoded
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketDecodeError {
    /// The packet uses a QUIC version that is not supported
    #[error("unsupported version {version:x}")]
    UnsupportedVersion {
        /// Source Connection ID
        src_cid: ConnectionId,
        /// Destination Connection ID
        dst_cid: ConnectionId,
        /// The version that was unsupported
        version: u32,
    },
    /// The packet header is malformed
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::InvalidHeader("unexpected end of packet")
    }
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
pub(crate) const FIXED_BIT: u8 = 0x40;
pub(crate) const SPIN_BIT: u8 = 0x20;
const SHORT_RESERVED_BITS: u8 = 0x18;
const LONG_RESERVED_BITS: u8 = 0x0c;
const KEY_PHASE_BIT: u8 = 0x04;
pub(crate) const RETRY_TAG_LEN: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Side,
        crypto::rustls::{configured_provider, initial_keys, initial_suite_from_provider},
    };
    use hex_literal::hex;

    fn check_pn(typed: PacketNumber, encoded: &[u8]) {
        let mut buf = Vec::new();
        typed.encode(&mut buf);
        assert_eq!(&buf[..], encoded);
        let decoded = PacketNumber::decode(typed.len(), &mut io::Cursor::new(&buf)).unwrap();
        assert_eq!(typed, decoded);
    }

    #[test]
    fn roundtrip_packet_numbers() {
        check_pn(PacketNumber::U8(0x7f), &[0x7f]);
        check_pn(PacketNumber::U16(0x80), &[0x00, 0x80]);
        check_pn(PacketNumber::U16(0x3fff), &[0x3f, 0xff]);
        check_pn(PacketNumber::U32(0x0000_4000), &[0x00, 0x00, 0x40, 0x00]);
        check_pn(PacketNumber::U32(0xffff_ffff), &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn pn_encode() {
        check_pn(PacketNumber::new(0x10, 0), &[0x10]);
        check_pn(PacketNumber::new(0x100, 0), &[0x01, 0x00]);
        check_pn(PacketNumber::new(0x10000, 0), &[0x01, 0x00, 0x00]);
    }

    #[test]
    fn pn_expand_roundtrip() {
        for expected in 0..1024 {
            for actual in expected..1024 {
                assert_eq!(actual, PacketNumber::new(actual, expected).expand(expected));
            }
        }
    }

    #[test]
    fn pn_expand_rfc_example() {
        // RFC 9000 Appendix A.3
        assert_eq!(PacketNumber::U16(0x9b32).expand(0xa82f_30eb), 0xa82f_9b32);
    }

    #[test]
    fn header_protection_roundtrip() {
        let dcid = ConnectionId::new(&hex!("06b858ec6f80452b"));
        let suite = initial_suite_from_provider(&configured_provider()).unwrap();
        let client = initial_keys(&dcid, Side::Client, &suite);
        let mut buf = Vec::new();
        let header = PlainHeader::Initial(InitialHeader {
            number: PacketNumber::U8(0),
            src_cid: ConnectionId::new(&[]),
            dst_cid: dcid,
            token: Bytes::new(),
            version: PROTOCOL_VERSION,
        });
        let encode = header.encode(&mut buf);
        let header_len = buf.len();
        assert_eq!(
            buf[..],
            hex!("c0000000010806b858ec6f80452b0000000000")[..header_len]
        );
        buf.resize(header_len + 16 + client.packet.local.tag_len(), 0);
        encode.finish(
            &mut buf,
            &*client.header.local,
            Some((0, &*client.packet.local)),
        );

        let server = initial_keys(&dcid, Side::Server, &suite);
        let decode = PartialDecode::new(buf.as_slice().into(), 0).unwrap().0;
        assert!(decode.is_initial());
        let mut packet = decode.finish(Some(&*server.header.remote)).unwrap();
        assert_eq!(
            packet.header_data[..],
            hex!("c0000000010806b858ec6f80452b0000402100")[..]
        );
        server
            .packet
            .remote
            .decrypt(0, &packet.header_data, &mut packet.payload)
            .unwrap();
        assert_eq!(packet.payload[..], [0; 16]);
        match packet.header {
            PlainHeader::Initial(InitialHeader {
                number: PacketNumber::U8(0),
                ..
            }) => {}
            _ => panic!("unexpected header {:?}", packet.header),
        }
    }

    #[test]
    fn coalesced_packets_split() {
        let mut buf = Vec::new();
        let cid = ConnectionId::new(&[7; 8]);
        for _ in 0..2 {
            let encode = PlainHeader::Long {
                ty: LongType::Handshake,
                dst_cid: cid,
                src_cid: cid,
                number: PacketNumber::U8(1),
                version: PROTOCOL_VERSION,
            }
            .encode(&mut buf);
            buf.extend_from_slice(&[0; 20]);
            let len = buf.len() - encode.start - encode.header_len + 1;
            let pn_pos = encode.start + encode.header_len - 1;
            (&mut buf[pn_pos - 2..pn_pos]).put_u16(len as u16 | (0b01 << 14));
        }
        let (first, rest) = PartialDecode::new(buf.as_slice().into(), 8).unwrap();
        assert_eq!(first.space(), Some(SpaceId::Handshake));
        assert_eq!(first.len() * 2, buf.len());
        let (second, rest) = PartialDecode::new(rest.unwrap(), 8).unwrap();
        assert_eq!(second.dst_cid(), &cid);
        assert!(rest.is_none());
    }

    #[test]
    fn parse_public_headers() {
        let dcid = ConnectionId::new(&[1, 2, 3, 4]);
        let scid = ConnectionId::new(&[5, 6]);
        let mut buf = Vec::new();
        PlainHeader::Initial(InitialHeader {
            dst_cid: dcid,
            src_cid: scid,
            token: Bytes::from_static(b"tok"),
            number: PacketNumber::U8(0),
            version: PROTOCOL_VERSION,
        })
        .encode(&mut buf);
        buf.extend_from_slice(&[0; 32]);
        let header = parse_header(&buf, 0).unwrap();
        assert_eq!(header.ty, PacketType::Initial);
        assert_eq!(header.version, PROTOCOL_VERSION);
        assert_eq!(header.dcid, dcid);
        assert_eq!(header.scid, scid);
        assert_eq!(header.token.as_deref(), Some(&b"tok"[..]));

        let mut short = vec![FIXED_BIT];
        short.extend_from_slice(&dcid);
        short.extend_from_slice(&[0; 24]);
        let header = parse_header(&short, 4).unwrap();
        assert_eq!(header.ty, PacketType::Short);
        assert_eq!(header.dcid, dcid);
    }

    #[test]
    fn malformed_headers() {
        // Truncated destination CID
        assert!(matches!(
            parse_header(&hex!("c0 00000001 08 0102"), 0),
            Err(PacketDecodeError::InvalidHeader(_))
        ));
        // CID length above 20
        assert!(matches!(
            parse_header(&hex!("c0 00000001 15 0102030405060708090a0b0c0d0e0f101112131415 00"), 0),
            Err(PacketDecodeError::InvalidHeader(_))
        ));
        // Fixed bit unset
        assert!(matches!(
            parse_header(&hex!("80 00000001 00 00"), 0),
            Err(PacketDecodeError::InvalidHeader(_))
        ));
        assert!(parse_header(&[], 0).is_err());
        assert!(matches!(
            parse_header(&hex!("c0 ff00001d 01 aa 01 bb"), 0),
            Err(PacketDecodeError::UnsupportedVersion { version: 0xff00_001d, .. })
        ));
    }

    #[test]
    fn version_negotiation() {
        let scid = ConnectionId::new(&[1; 8]);
        let dcid = ConnectionId::new(&[2; 8]);
        let mut out = [0; 64];
        let len = negotiate_version(&scid, &dcid, &mut out).unwrap();
        assert!(is_version_negotiation(&out[..len]));
        let header = parse_header(&out[..len], 0).unwrap();
        assert_eq!(header.ty, PacketType::VersionNegotiation);
        assert_eq!(header.dcid, scid);
        assert_eq!(header.scid, dcid);
        assert!(header.versions.unwrap().contains(&PROTOCOL_VERSION));
        assert_eq!(
            negotiate_version(&scid, &dcid, &mut [0; 10]),
            Err(BufferTooShort)
        );
    }

    #[test]
    fn retry_packet() {
        let scid = ConnectionId::new(&[1; 8]);
        let dcid = ConnectionId::new(&[2; 8]);
        let new_scid = ConnectionId::new(&[3; 8]);
        let mut out = [0; 128];
        let len = retry(&scid, &dcid, &new_scid, b"token", PROTOCOL_VERSION, &mut out).unwrap();
        let header = parse_header(&out[..len], 0).unwrap();
        assert_eq!(header.ty, PacketType::Retry);
        assert_eq!(header.dcid, scid);
        assert_eq!(header.scid, new_scid);
        assert_eq!(header.token.as_deref(), Some(&b"token"[..]));
        assert!(crypto::rustls::is_valid_retry(
            &dcid,
            &out[..len - RETRY_TAG_LEN],
            &out[len - RETRY_TAG_LEN..len]
        ));
    }

    #[test]
    fn alpn_wire_format() {
        assert_eq!(encode_alpn(&["echo", "h3"]), b"\x04echo\x02h3");
    }
}
