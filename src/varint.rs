use std::fmt;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::coding::{self, Codec, UnexpectedEnd};

/// An integer less than 2^62
///
/// Values of this type are suitable for encoding as QUIC variable-length integer.
#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarInt(pub(crate) u64);

impl VarInt {
    /// The largest representable value
    pub const MAX: Self = Self((1 << 62) - 1);
    /// The largest encoded value length
    pub const MAX_SIZE: usize = 8;

    /// Construct a `VarInt` infallibly
    pub const fn from_u32(x: u32) -> Self {
        Self(x as u64)
    }

    /// Succeeds iff `x` < 2^62
    pub fn from_u64(x: u64) -> Result<Self, VarIntBoundsExceeded> {
        if x <= Self::MAX.0 {
            Ok(Self(x))
        } else {
            Err(VarIntBoundsExceeded)
        }
    }

    /// Construct a `VarInt`, saturating at [`VarInt::MAX`]
    pub fn saturating(x: u64) -> Self {
        Self(x.min(Self::MAX.0))
    }

    /// Extract the integer value
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// Compute the number of bytes needed to encode this value
    pub(crate) const fn size(self) -> usize {
        let x = self.0;
        if x < 1 << 6 {
            1
        } else if x < 1 << 14 {
            2
        } else if x < 1 << 30 {
            4
        } else {
            8
        }
    }
}

impl From<VarInt> for u64 {
    fn from(x: VarInt) -> Self {
        x.0
    }
}

impl From<u8> for VarInt {
    fn from(x: u8) -> Self {
        Self(x.into())
    }
}

impl From<u16> for VarInt {
    fn from(x: u16) -> Self {
        Self(x.into())
    }
}

impl From<u32> for VarInt {
    fn from(x: u32) -> Self {
        Self(x.into())
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntBoundsExceeded;
    /// Succeeds iff `x` < 2^62
    fn try_from(x: u64) -> Result<Self, VarIntBoundsExceeded> {
        Self::from_u64(x)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = VarIntBoundsExceeded;
    /// Succeeds iff `x` < 2^62
    fn try_from(x: usize) -> Result<Self, VarIntBoundsExceeded> {
        Self::try_from(x as u64)
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Error returned when constructing a `VarInt` from a value >= 2^62
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("value too large for varint encoding")]
pub struct VarIntBoundsExceeded;

impl Codec for VarInt {
    fn decode<B: Buf>(r: &mut B) -> coding::Result<Self> {
        if !r.has_remaining() {
            return Err(UnexpectedEnd);
        }
        let first = r.get_u8();
        let len = 1usize << (first >> 6);
        if r.remaining() < len - 1 {
            return Err(UnexpectedEnd);
        }
        let mut x = u64::from(first & 0b0011_1111);
        for _ in 1..len {
            x = (x << 8) | u64::from(r.get_u8());
        }
        Ok(Self(x))
    }

    fn encode<B: BufMut>(&self, w: &mut B) {
        let x = self.0;
        match self.size() {
            1 => w.put_u8(x as u8),
            2 => w.put_u16((0b01 << 14) | x as u16),
            4 => w.put_u32((0b10 << 30) | x as u32),
            _ => w.put_u64((0b11 << 62) | x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn rfc_examples() {
        // RFC 9000 Appendix A.1
        let cases: &[(&[u8], u64)] = &[
            (&hex!("c2197c5eff14e88c"), 151_288_809_941_952_652),
            (&hex!("9d7f3e7d"), 494_878_333),
            (&hex!("7bbd"), 15_293),
            (&hex!("25"), 37),
            (&hex!("4025"), 37),
        ];
        for &(bytes, value) in cases {
            let mut buf = bytes;
            assert_eq!(VarInt::decode(&mut buf).unwrap().into_inner(), value);
            assert!(buf.is_empty());
        }
        let mut out = Vec::new();
        VarInt(15_293).encode(&mut out);
        assert_eq!(out, hex!("7bbd"));
    }

    #[test]
    fn truncated() {
        let mut buf: &[u8] = &hex!("9d7f3e");
        assert_eq!(VarInt::decode(&mut buf), Err(UnexpectedEnd));
    }

    #[test]
    fn bounds() {
        assert!(VarInt::from_u64(1 << 62).is_err());
        assert_eq!(VarInt::saturating(u64::MAX), VarInt::MAX);
        assert_eq!(VarInt::MAX.size(), 8);
    }
}
