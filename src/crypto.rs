//! Traits and implementation for the cryptographic protocol driving the handshake
//!
//! The connection only talks to the TLS engine through [`Session`], and protects packets through
//! [`HeaderKey`] and [`PacketKey`]. The rustls-backed implementation lives in [`rustls`].

use bytes::BytesMut;

use crate::{ConnectionId, Side, TransportError, transport_parameters::TransportParameters};

pub(crate) mod rustls;

/// A cryptographic session (commonly TLS)
pub(crate) trait Session: Send + Sync + 'static {
    /// Create the initial set of keys given the client's initial destination ConnectionId
    fn initial_keys(&self, dst_cid: &ConnectionId, side: Side) -> Keys;

    /// The negotiated application protocol, once known
    fn alpn_protocol(&self) -> Option<&[u8]>;

    /// Get the 0-RTT keys if available (clients only)
    ///
    /// On the client side, this method can be used to see if 0-RTT key material is available
    /// to start sending data before the protocol handshake has completed.
    fn early_crypto(&self) -> Option<(Box<dyn HeaderKey>, Box<dyn PacketKey>)>;

    /// If the 0-RTT-encrypted data has been accepted by the peer
    fn early_data_accepted(&self) -> Option<bool>;

    /// Returns `true` until the connection is fully established.
    fn is_handshaking(&self) -> bool;

    /// Whether the session was resumed from a previous connection's ticket
    fn is_resumed(&self) -> bool;

    /// Read bytes of handshake data
    ///
    /// This should be called with the contents of `CRYPTO` frames. If it returns `Ok`, the
    /// caller should call `write_handshake()` to check if the crypto protocol has anything
    /// to send to the peer. Returns `true` the first time the application protocol becomes
    /// known.
    fn read_handshake(&mut self, buf: &[u8]) -> Result<bool, TransportError>;

    /// The peer's QUIC transport parameters
    ///
    /// These are only available after the first flight from the peer has been received.
    fn transport_parameters(&self) -> Result<Option<TransportParameters>, TransportError>;

    /// Writes handshake bytes into the given buffer and optionally returns the negotiated keys
    ///
    /// When the handshake proceeds to the next phase, this method will return a new set of
    /// keys to encrypt data with.
    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<Keys>;

    /// Compute keys for the next key update
    fn next_1rtt_keys(&mut self) -> Option<KeyPair<Box<dyn PacketKey>>>;

    /// Verify the integrity of a retry packet
    fn is_valid_retry(&self, orig_dst_cid: &ConnectionId, header: &[u8], payload: &[u8]) -> bool;
}

/// A pair of keys for bidirectional communication
pub(crate) struct KeyPair<T> {
    /// Key for encrypting data
    pub(crate) local: T,
    /// Key for decrypting data
    pub(crate) remote: T,
}

/// A complete set of keys for a certain packet space
pub(crate) struct Keys {
    /// Header protection keys
    pub(crate) header: KeyPair<Box<dyn HeaderKey>>,
    /// Packet protection keys
    pub(crate) packet: KeyPair<Box<dyn PacketKey>>,
}

/// Keys used to protect packet payloads
pub(crate) trait PacketKey: Send + Sync {
    /// Encrypt the packet payload with the given packet number
    fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize);
    /// Decrypt the packet payload with the given packet number
    fn decrypt(
        &self,
        packet: u64,
        header: &[u8],
        payload: &mut BytesMut,
    ) -> Result<(), CryptoError>;
    /// The length of the AEAD tag appended to packets on encryption
    fn tag_len(&self) -> usize;
    /// Maximum number of packets that may be sent using a single key
    fn confidentiality_limit(&self) -> u64;
    /// Maximum number of incoming packets that may fail decryption before the connection must be
    /// abandoned
    fn integrity_limit(&self) -> u64;
}

/// Keys used to protect packet headers
pub(crate) trait HeaderKey: Send + Sync {
    /// Decrypt the given packet's header
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// Encrypt the given packet's header
    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// The sample size used for this key's algorithm
    fn sample_size(&self) -> usize;
}

/// Generic crypto errors
#[derive(Debug)]
pub(crate) struct CryptoError;
