use bytes::Bytes;

use crate::frame::Close;

/// Lifecycle of a connection
///
/// `Handshake` covers both the time before the first packet is exchanged and the crypto
/// handshake itself. `Closed` means we initiated the close and linger for three PTOs answering
/// stray packets with CONNECTION_CLOSE; `Draining` means the peer closed and we stay silent.
#[derive(Debug)]
pub(super) enum State {
    Handshake(Handshake),
    Established,
    Closed(Closed),
    Draining,
    Drained,
}

impl State {
    pub(super) fn as_handshake_mut(&mut self) -> Option<&mut Handshake> {
        match self {
            Self::Handshake(hs) => Some(hs),
            _ => None,
        }
    }

    pub(super) fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }

    pub(super) fn is_established(&self) -> bool {
        matches!(self, Self::Established)
    }

    /// Whether the connection is closing in any way, or gone
    pub(super) fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_) | Self::Draining | Self::Drained)
    }

    pub(super) fn is_drained(&self) -> bool {
        matches!(self, Self::Drained)
    }
}

#[derive(Debug)]
pub(super) struct Handshake {
    /// Whether the peer's first source CID replaced the random destination CID we started with
    ///
    /// Only the first packet from the peer may change the destination CID.
    pub(super) rem_cid_set: bool,
    /// The first CRYPTO data a client sent, kept to be sent again after a Retry
    pub(super) client_hello: Option<Bytes>,
}

impl Handshake {
    pub(super) fn new() -> Self {
        Self {
            rem_cid_set: false,
            client_hello: None,
        }
    }
}

#[derive(Debug)]
pub(super) struct Closed {
    /// The frame sent to the peer in response to anything it sends while we linger
    pub(super) reason: Close,
}
