//! Coding related traits.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::VarInt;

/// Error indicating that the provided buffer was too small
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

/// Coding result type
pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// Infallible encoding and decoding of QUIC primitives
pub trait Codec: Sized {
    /// Decode a `Self` from the provided buffer, if the buffer is large enough
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    /// Append the encoding of `self` to the provided buffer
    fn encode<B: BufMut>(&self, buf: &mut B);
}

macro_rules! impl_int_codec {
    ($($ty:ty => $get:ident, $put:ident;)*) => {
        $(
            impl Codec for $ty {
                fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
                    if buf.remaining() < std::mem::size_of::<$ty>() {
                        return Err(UnexpectedEnd);
                    }
                    Ok(buf.$get())
                }
                fn encode<B: BufMut>(&self, buf: &mut B) {
                    buf.$put(*self);
                }
            }
        )*
    };
}

impl_int_codec! {
    u8 => get_u8, put_u8;
    u16 => get_u16, put_u16;
    u32 => get_u32, put_u32;
    u64 => get_u64, put_u64;
}

impl Codec for Ipv4Addr {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        let mut octets = [0; 4];
        buf.copy_to_slice(&mut octets);
        Ok(octets.into())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.octets());
    }
}

impl Codec for Ipv6Addr {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 16 {
            return Err(UnexpectedEnd);
        }
        let mut octets = [0; 16];
        buf.copy_to_slice(&mut octets);
        Ok(octets.into())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.octets());
    }
}

/// Extension trait for reading from buffers
pub trait BufExt {
    /// Read and decode a value from the buffer
    fn get<T: Codec>(&mut self) -> Result<T>;
    /// Read a variable-length integer from the buffer
    fn get_var(&mut self) -> Result<u64>;
}

impl<T: Buf> BufExt for T {
    fn get<U: Codec>(&mut self) -> Result<U> {
        U::decode(self)
    }

    fn get_var(&mut self) -> Result<u64> {
        Ok(VarInt::decode(self)?.into_inner())
    }
}

/// Extension trait for writing to buffers
pub trait BufMutExt {
    /// Write and encode a value to the buffer
    fn write<T: Codec>(&mut self, x: T);
    /// Write a variable-length integer to the buffer
    ///
    /// Values of 2^62 and above are a caller bug and are rejected in debug builds.
    fn write_var(&mut self, x: u64);
}

impl<T: BufMut> BufMutExt for T {
    fn write<U: Codec>(&mut self, x: U) {
        x.encode(self);
    }

    fn write_var(&mut self, x: u64) {
        match VarInt::from_u64(x) {
            Ok(var) => var.encode(self),
            Err(_) => debug_assert!(false, "varint overflow: {x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_integers() {
        let mut buf: &[u8] = &[0x01];
        assert_eq!(BufExt::get::<u16>(&mut buf), Err(UnexpectedEnd));
        let mut buf: &[u8] = &[0x01, 0x02, 0x03, 0x04];
        assert_eq!(BufExt::get::<u32>(&mut buf), Ok(0x0102_0304));
        assert!(!buf.has_remaining());
    }

    #[test]
    fn addresses() {
        let mut out = Vec::new();
        out.write(Ipv4Addr::new(10, 0, 0, 1));
        out.write(Ipv6Addr::LOCALHOST);
        let mut buf = &out[..];
        assert_eq!(
            BufExt::get::<Ipv4Addr>(&mut buf),
            Ok(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(BufExt::get::<Ipv6Addr>(&mut buf), Ok(Ipv6Addr::LOCALHOST));
    }
}
