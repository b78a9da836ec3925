use std::{fmt, ops::Deref};

use bytes::{Buf, BufMut};
use rand::RngCore;
use thiserror::Error;

use crate::{MAX_CID_SIZE, RESET_TOKEN_SIZE, coding::BufExt};

/// Protocol-level identifier for a connection.
///
/// Mainly useful for identifying this connection's packets on the wire with tools like Wireshark,
/// and for routing ingress datagrams to the right [`Connection`](crate::Connection).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    /// length of CID
    len: u8,
    /// CID in byte array
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct cid from byte array
    ///
    /// # Panics
    ///
    /// If `bytes` is longer than [`MAX_CID_SIZE`].
    pub fn new(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_CID_SIZE, "connection ID too long");
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Generate a random connection ID of `len` bytes, clamped to [`MAX_CID_SIZE`]
    pub fn random<R: RngCore + ?Sized>(rng: &mut R, len: usize) -> Self {
        let len = len.min(MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    /// Constructs cid by reading `len` bytes from a `Buf`
    ///
    /// Callers need to assure that `buf.remaining() >= len`
    pub(crate) fn from_buf(buf: &mut impl Buf, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        buf.copy_to_slice(&mut res.bytes[..len]);
        res
    }

    /// Decode from long header format
    pub(crate) fn decode_long(buf: &mut impl Buf) -> Option<Self> {
        let len = buf.get::<u8>().ok()? as usize;
        if len > MAX_CID_SIZE || buf.remaining() < len {
            return None;
        }
        Some(Self::from_buf(buf, len))
    }

    /// Encode in long header format
    pub(crate) fn encode_long(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.len() as u8);
        buf.put_slice(self);
    }
}

impl TryFrom<&[u8]> for ConnectionId {
    type Error = InvalidCidLength;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() > MAX_CID_SIZE {
            return Err(InvalidCidLength(bytes.len()));
        }
        Ok(Self::new(bytes))
    }
}

impl Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A connection ID longer than 20 bytes was supplied
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("connection ID length {0} exceeds the maximum of 20 bytes")]
pub struct InvalidCidLength(pub usize);

/// Stateless reset token
///
/// Sent alongside each connection ID we issue, so the peer can recognize a stateless reset
/// carrying it once our state for that CID is gone.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
pub struct ResetToken([u8; RESET_TOKEN_SIZE]);

impl ResetToken {
    pub(crate) fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut token = [0; RESET_TOKEN_SIZE];
        rng.fill_bytes(&mut token);
        Self(token)
    }

    /// Whether the trailing bytes of `datagram` carry this token
    pub(crate) fn matches_tail(&self, datagram: &[u8]) -> bool {
        datagram.len() >= RESET_TOKEN_SIZE
            && crate::constant_time_eq(&datagram[datagram.len() - RESET_TOKEN_SIZE..], &self.0)
    }
}

impl PartialEq<ResetToken> for [u8] {
    fn eq(&self, other: &ResetToken) -> bool {
        crate::constant_time_eq(self, &other.0)
    }
}

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn long_form_coding() {
        let cid = ConnectionId::new(&[1, 2, 3, 4]);
        let mut buf = Vec::new();
        cid.encode_long(&mut buf);
        assert_eq!(buf, [4, 1, 2, 3, 4]);
        assert_eq!(ConnectionId::decode_long(&mut &buf[..]), Some(cid));
        assert_eq!(ConnectionId::decode_long(&mut &[21u8; 30][..]), None);
    }

    #[test]
    fn random_len_clamped() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(ConnectionId::random(&mut rng, 8).len(), 8);
        assert_eq!(ConnectionId::random(&mut rng, 64).len(), MAX_CID_SIZE);
        assert!(ConnectionId::try_from(&[0u8; 21][..]).is_err());
    }

    #[test]
    fn reset_token_tail() {
        let token = ResetToken::from([0xab; RESET_TOKEN_SIZE]);
        let mut datagram = vec![0x40; 30];
        datagram.extend_from_slice(&token);
        assert!(token.matches_tail(&datagram));
        assert!(!token.matches_tail(&datagram[..datagram.len() - 1]));
    }
}
