//! Maintain the state of local and peer connection IDs
use std::collections::BTreeMap;

use rand::RngCore;
use tracing::{debug, trace};

use crate::{ConnectionId, ResetToken, TransportError, frame::NewConnectionId};

/// A connection ID we handed out to the peer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct IssuedCid {
    pub(crate) sequence: u64,
    pub(crate) id: ConnectionId,
    pub(crate) reset_token: ResetToken,
}

impl IssuedCid {
    pub(crate) fn frame(&self, retire_prior_to: u64) -> NewConnectionId {
        NewConnectionId {
            sequence: self.sequence,
            retire_prior_to,
            id: self.id,
            reset_token: self.reset_token,
        }
    }
}

/// Connection IDs issued by this endpoint
///
/// Sequence number 0 is the CID the connection was created with. Further CIDs are issued until the
/// peer holds as many as its `active_connection_id_limit` allows.
#[derive(Debug)]
pub(super) struct LocalCids {
    active: BTreeMap<u64, IssuedCid>,
    next_seq: u64,
    /// Number of CIDs the peer is willing to store, known once its parameters arrive
    limit: u64,
    cid_len: usize,
}

impl LocalCids {
    pub(super) fn new(initial: ConnectionId, reset_token: ResetToken) -> Self {
        let mut active = BTreeMap::new();
        active.insert(
            0,
            IssuedCid {
                sequence: 0,
                id: initial,
                reset_token,
            },
        );
        Self {
            active,
            next_seq: 1,
            limit: 1,
            cid_len: initial.len(),
        }
    }

    pub(super) fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    /// Mint CIDs until the peer's limit is reached
    ///
    /// Endpoints using zero-length CIDs have nothing to issue.
    pub(super) fn issue(&mut self, rng: &mut impl RngCore) -> Vec<IssuedCid> {
        let mut issued = Vec::new();
        if self.cid_len == 0 {
            return issued;
        }
        while (self.active.len() as u64) < self.limit {
            let cid = IssuedCid {
                sequence: self.next_seq,
                id: ConnectionId::random(rng, self.cid_len),
                reset_token: ResetToken::random(rng),
            };
            trace!(sequence = cid.sequence, id = %cid.id, "issuing CID");
            self.active.insert(cid.sequence, cid);
            self.next_seq += 1;
            issued.push(cid);
        }
        issued
    }

    /// Process a RETIRE_CONNECTION_ID frame received in a packet addressed to `packet_dcid`
    ///
    /// Returns whether an active CID was retired, in which case a replacement may be issued.
    pub(super) fn on_retired(
        &mut self,
        sequence: u64,
        packet_dcid: &ConnectionId,
    ) -> Result<bool, TransportError> {
        if self.cid_len == 0 {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "RETIRE_CONNECTION_ID when CIDs aren't in use",
            ));
        }
        if sequence >= self.next_seq {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "RETIRE_CONNECTION_ID for unissued sequence number",
            ));
        }
        match self.active.get(&sequence) {
            None => Ok(false),
            Some(cid) if cid.id == *packet_dcid => Err(TransportError::PROTOCOL_VIOLATION(
                "RETIRE_CONNECTION_ID retires the CID it was sent to",
            )),
            Some(_) => {
                debug!(sequence, "peer retired CID");
                self.active.remove(&sequence);
                Ok(true)
            }
        }
    }

    /// Whether `cid` currently routes to this connection
    pub(super) fn contains(&self, cid: &ConnectionId) -> bool {
        self.active.values().any(|x| x.id == *cid)
    }

    /// The CID with the lowest live sequence number
    pub(super) fn first(&self) -> ConnectionId {
        self.active
            .values()
            .next()
            .map_or(ConnectionId::new(&[]), |x| x.id)
    }

    pub(super) fn cid_len(&self) -> usize {
        self.cid_len
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = &ConnectionId> {
        self.active.values().map(|x| &x.id)
    }

    pub(super) fn get(&self, sequence: u64) -> Option<&IssuedCid> {
        self.active.get(&sequence)
    }
}

/// A connection ID the peer issued to us
#[derive(Debug, Copy, Clone)]
struct PeerCid {
    id: ConnectionId,
    reset_token: Option<ResetToken>,
    /// Whether a path currently sends with this CID
    in_use: bool,
}

/// Connection IDs the peer issued for us to address it with
#[derive(Debug)]
pub(super) struct PeerCids {
    cids: BTreeMap<u64, PeerCid>,
    /// Every sequence number below this was retired at the peer's request
    retire_prior_to: u64,
    /// Our `active_connection_id_limit`
    limit: u64,
}

impl PeerCids {
    /// Start out with the CID used for the first flight, sequence number 0, owned by the first path
    pub(super) fn new(initial: ConnectionId, limit: u64) -> Self {
        let mut cids = BTreeMap::new();
        cids.insert(
            0,
            PeerCid {
                id: initial,
                reset_token: None,
                in_use: true,
            },
        );
        Self {
            cids,
            retire_prior_to: 0,
            limit,
        }
    }

    /// Replace sequence number 0 once the peer picked its own CID
    pub(super) fn update_initial(&mut self, id: ConnectionId) {
        if let Some(cid) = self.cids.get_mut(&0) {
            cid.id = id;
        }
    }

    /// Record the stateless reset token the server advertised for sequence number 0
    pub(super) fn set_initial_reset_token(&mut self, token: ResetToken) {
        if let Some(cid) = self.cids.get_mut(&0) {
            cid.reset_token = Some(token);
        }
    }

    /// Whether the peer addresses us with zero-length CIDs and so can't issue more
    pub(super) fn is_zero_length(&self) -> bool {
        self.cids.values().next().is_some_and(|x| x.id.is_empty())
    }

    /// Process a NEW_CONNECTION_ID frame
    ///
    /// Returns the sequence numbers to retire, paired with whether a path was still using them.
    pub(super) fn insert(
        &mut self,
        frame: NewConnectionId,
    ) -> Result<Vec<(u64, bool)>, TransportError> {
        if self.is_zero_length() {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "NEW_CONNECTION_ID when CIDs aren't in use",
            ));
        }

        let mut retired = Vec::new();
        if frame.sequence < self.retire_prior_to {
            // Arrived after a later frame already retired it
            retired.push((frame.sequence, false));
            return Ok(retired);
        }

        match self.cids.get(&frame.sequence) {
            Some(existing)
                if existing.id != frame.id
                    || existing.reset_token.is_some_and(|t| t != frame.reset_token) =>
            {
                return Err(TransportError::PROTOCOL_VIOLATION(
                    "sequence number reused for a different CID",
                ));
            }
            Some(_) => {}
            None => {
                self.cids.insert(
                    frame.sequence,
                    PeerCid {
                        id: frame.id,
                        reset_token: Some(frame.reset_token),
                        in_use: false,
                    },
                );
            }
        }

        if frame.retire_prior_to > self.retire_prior_to {
            let keep = self.cids.split_off(&frame.retire_prior_to);
            let dropped = std::mem::replace(&mut self.cids, keep);
            retired.extend(dropped.into_iter().map(|(seq, cid)| (seq, cid.in_use)));
            self.retire_prior_to = frame.retire_prior_to;
        }

        if self.cids.len() as u64 > self.limit {
            return Err(TransportError::CONNECTION_ID_LIMIT_ERROR(""));
        }
        Ok(retired)
    }

    /// Number of CIDs that no path uses yet
    pub(super) fn available(&self) -> usize {
        if self.is_zero_length() {
            return 0;
        }
        self.cids.values().filter(|x| !x.in_use).count()
    }

    /// Claim the unused CID with the lowest sequence number
    pub(super) fn take_unused(&mut self) -> Option<(u64, ConnectionId)> {
        let (&seq, cid) = self.cids.iter_mut().find(|(_, x)| !x.in_use)?;
        cid.in_use = true;
        Some((seq, cid.id))
    }

    /// Forget a CID, returning whether it was known
    pub(super) fn retire(&mut self, sequence: u64) -> bool {
        self.cids.remove(&sequence).is_some()
    }

    pub(super) fn get(&self, sequence: u64) -> Option<ConnectionId> {
        self.cids.get(&sequence).map(|x| x.id)
    }

    pub(super) fn contains(&self, sequence: u64) -> bool {
        self.cids.contains_key(&sequence)
    }

    /// The lowest sequence number still live, used when nothing better is left
    pub(super) fn first(&self) -> Option<(u64, ConnectionId)> {
        self.cids.iter().next().map(|(&seq, cid)| (seq, cid.id))
    }

    /// Whether `datagram` ends in the reset token of any CID the peer gave us
    pub(super) fn is_stateless_reset(&self, datagram: &[u8]) -> bool {
        self.cids
            .values()
            .filter_map(|x| x.reset_token)
            .any(|token| token.matches_tail(datagram))
    }
}
