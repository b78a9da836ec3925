use std::{cmp, net::SocketAddr, time::Instant};

use rand::Rng;
use tracing::{debug, trace};

use super::{
    Connection, PathError, RecvInfo,
    paths::{PathData, PathId, PathState},
    timer::{PathTimer, Timer},
};
use crate::packet::SpaceId;

/// Upper bound on the number of paths tracked at once
const MAX_PATHS: usize = 8;

impl Connection {
    /// Start validating the path from `local` to `peer` without moving traffic onto it
    ///
    /// Returns the sequence number of the destination CID the path uses.
    pub fn probe_path(
        &mut self,
        local: SocketAddr,
        peer: SocketAddr,
        now: Instant,
    ) -> Result<u64, PathError> {
        self.check_can_migrate()?;
        let path_id = match self.find_path(local, peer) {
            Some(path_id) => path_id,
            None => self.create_path(local, peer, now)?,
        };
        self.start_path_validation(now, path_id);
        Ok(self.dcid_seq_of(path_id))
    }

    /// Move the connection to the path from `local` to `peer`
    ///
    /// Traffic switches right away while the new path is validated; if validation fails the
    /// connection falls back to the current path. The destination CID of the current path is
    /// retired. Fails with [`PathError::NoAvailableDcid`] if the peer left us no spare CID.
    pub fn migrate(
        &mut self,
        local: SocketAddr,
        peer: SocketAddr,
        now: Instant,
    ) -> Result<u64, PathError> {
        self.check_can_migrate()?;
        let path_id = match self.find_path(local, peer) {
            Some(path_id) if path_id == self.active_path => {
                return Ok(self.dcid_seq_of(path_id));
            }
            Some(path_id) => path_id,
            None => self.create_path(local, peer, now)?,
        };

        let prev = self.active_path;
        debug!(%local, %peer, from = %prev, to = %path_id, "migrating");
        if !self.paths[path_id.index()].is_validated() {
            self.start_path_validation(now, path_id);
        }
        self.set_active_path(path_id, Some(prev));

        // The old path's CID must not link the two paths
        if let Some(seq) = self.paths[prev.index()].dcid_seq.take() {
            if !self.peer_cids.is_zero_length() && self.peer_cids.retire(seq) {
                trace!(seq, "retiring destination CID of previous path");
                self.spaces[SpaceId::Data].pending.retire_cids.push(seq);
            }
        }
        Ok(self.dcid_seq_of(path_id))
    }

    /// Move the connection to a new local address, keeping the peer address
    pub fn migrate_source(&mut self, local: SocketAddr, now: Instant) -> Result<u64, PathError> {
        let peer = self.path().peer;
        self.migrate(local, peer, now)
    }

    /// Stop using the peer-issued destination CID with sequence number `seq`
    ///
    /// Paths using it switch to a spare CID, which must exist.
    pub fn retire_dcid(&mut self, seq: u64) -> Result<(), PathError> {
        if self.peer_cids.is_zero_length() {
            return Err(PathError::ZeroLengthCid);
        }
        if !self.peer_cids.contains(seq) {
            return Err(PathError::UnknownCid);
        }
        let in_use = self.paths.iter().any(|path| path.dcid_seq == Some(seq));
        if in_use && self.peer_cids.available() == 0 {
            return Err(PathError::NoAvailableDcid);
        }

        self.peer_cids.retire(seq);
        self.spaces[SpaceId::Data].pending.retire_cids.push(seq);
        for index in 0..self.paths.len() {
            if self.paths[index].dcid_seq == Some(seq) {
                self.paths[index].dcid_seq = self.peer_cids.take_unused().map(|(seq, _)| seq);
            }
        }
        debug!(seq, "retired destination CID");
        Ok(())
    }

    /// Number of peer-issued destination CIDs not used by any path
    pub fn available_dcids(&self) -> usize {
        self.peer_cids.available()
    }

    /// Restart path MTU discovery on the active path from the base MTU
    pub fn revalidate_pmtu(&mut self) {
        trace!("restarting path MTU discovery");
        self.path_mut().mtud.restart();
    }

    /// Whether the path from `local` to `peer` was validated
    pub fn is_path_validated(&self, local: SocketAddr, peer: SocketAddr) -> Result<bool, PathError> {
        let path_id = self.find_path(local, peer).ok_or(PathError::UnknownPath)?;
        Ok(self.paths[path_id.index()].is_validated())
    }

    fn check_can_migrate(&self) -> Result<(), PathError> {
        if self.side.is_server() || !self.state.is_established() {
            return Err(PathError::InvalidState);
        }
        if self
            .peer_params
            .as_ref()
            .is_some_and(|params| params.disable_active_migration)
        {
            return Err(PathError::ActiveMigrationDisabled);
        }
        if !self.peer_cids.is_zero_length() && self.peer_cids.available() == 0 {
            return Err(PathError::NoAvailableDcid);
        }
        Ok(())
    }

    /// Set up a path we initiate, claiming a spare destination CID for it
    fn create_path(
        &mut self,
        local: SocketAddr,
        peer: SocketAddr,
        now: Instant,
    ) -> Result<PathId, PathError> {
        let dcid_seq = match self.peer_cids.is_zero_length() {
            true => None,
            false => Some(
                self.peer_cids
                    .take_unused()
                    .ok_or(PathError::NoAvailableDcid)?
                    .0,
            ),
        };
        let path = self.new_path_data(local, peer, now);
        let path_id = self.insert_path(path).ok_or(PathError::InvalidState)?;
        self.paths[path_id.index()].dcid_seq = dcid_seq;
        Ok(path_id)
    }

    fn new_path_data(&mut self, local: SocketAddr, peer: SocketAddr, now: Instant) -> PathData {
        self.path_generation += 1;
        let active = self.path();
        if active.local == local && active.peer.ip() == peer.ip() {
            // Most likely a NAT rebinding, keep the estimates of the current path
            return PathData::from_rebinding(local, peer, self.path_generation, active, now);
        }
        let peer_max_udp_payload_size = self
            .peer_params
            .as_ref()
            .map(|params| u16::try_from(params.max_udp_payload_size.into_inner()).unwrap_or(u16::MAX));
        PathData::new(
            local,
            peer,
            self.path_generation,
            &self.config,
            peer_max_udp_payload_size,
            now,
        )
    }

    /// Store a path in a free slot, reusing slots of failed paths
    fn insert_path(&mut self, path: PathData) -> Option<PathId> {
        let reusable = self
            .paths
            .iter()
            .position(|path| !path.active && path.state == PathState::Failed);
        let path_id = match reusable {
            Some(index) => {
                let path_id = PathId::new(index);
                self.timers.stop_per_path(path_id);
                if let Some(seq) = self.paths[index].dcid_seq.take() {
                    self.release_dcid(seq);
                }
                self.paths[index] = path;
                path_id
            }
            None if self.paths.len() < MAX_PATHS => {
                self.paths.push(path);
                PathId::new(self.paths.len() - 1)
            }
            None => {
                debug!("too many paths");
                return None;
            }
        };
        for other in &mut self.paths {
            if other.fallback == Some(path_id) {
                other.fallback = None;
            }
        }
        Some(path_id)
    }

    /// Retire a CID nobody uses any more so the peer can issue a replacement
    fn release_dcid(&mut self, seq: u64) {
        if self.peer_cids.is_zero_length() {
            return;
        }
        if self.peer_cids.retire(seq) {
            self.spaces[SpaceId::Data].pending.retire_cids.push(seq);
        }
    }

    fn start_path_validation(&mut self, now: Instant, path_id: PathId) {
        let token = self.rng.random::<u64>();
        trace!(%path_id, token, "validating path");
        self.paths[path_id.index()].start_validation(token);
        // RFC 9000 section 8.2.4
        let timeout = cmp::max(
            3 * cmp::max(self.pto(SpaceId::Data), self.path_pto(path_id)),
            6 * self.config.initial_rtt,
        );
        self.timers.set(
            Timer::PerPath(path_id, PathTimer::PathValidation),
            now + timeout,
        );
    }

    fn set_active_path(&mut self, path_id: PathId, fallback: Option<PathId>) {
        for path in &mut self.paths {
            path.active = false;
        }
        let path = &mut self.paths[path_id.index()];
        path.active = true;
        path.fallback = fallback.filter(|&fallback| fallback != path_id);
        self.active_path = path_id;
    }

    fn dcid_seq_of(&self, path_id: PathId) -> u64 {
        self.paths[path_id.index()].dcid_seq.unwrap_or(0)
    }

    /// A server heard from the peer at an address it doesn't know yet
    ///
    /// Returns the path to attribute the packet to, or `None` to drop it.
    pub(super) fn on_new_peer_address(&mut self, now: Instant, info: RecvInfo) -> Option<PathId> {
        if self.side.is_client() || !self.state.is_established() {
            debug!(from = %info.from, "dropping packet from unknown address");
            return None;
        }
        if self.local_params.disable_active_migration {
            debug!(from = %info.from, "dropping packet from new address, migration disabled");
            return None;
        }
        let mut path = self.new_path_data(info.to, info.from, now);
        path.amplification_limited = true;
        let path_id = self.insert_path(path)?;
        self.paths[path_id.index()].dcid_seq = self.peer_cids.take_unused().map(|(seq, _)| seq);
        debug!(from = %info.from, %path_id, "new peer address");
        self.start_path_validation(now, path_id);
        Some(path_id)
    }

    /// The peer sent non-probing packets from a new path: make it the active path
    pub(super) fn on_peer_migrated(&mut self, now: Instant, path_id: PathId) {
        let prev = self.active_path;
        debug!(from = %prev, to = %path_id, "peer migrated");
        if !self.paths[path_id.index()].is_validated()
            && self.timers.get(Timer::PerPath(path_id, PathTimer::PathValidation)).is_none()
        {
            self.start_path_validation(now, path_id);
        }
        let fallback = self.paths[prev.index()].is_validated().then_some(prev);
        self.set_active_path(path_id, fallback);
    }

    pub(super) fn on_path_response(&mut self, now: Instant, path_id: PathId, token: u64) {
        // A response validates the path its challenge was sent on, wherever it arrives
        let validated = match self.paths[path_id.index()].on_path_response(token) {
            true => Some(path_id),
            false => self
                .paths
                .iter_mut()
                .position(|path| path.on_path_response(token))
                .map(PathId::new),
        };
        let Some(validated) = validated else {
            trace!(token, "ignoring unexpected PATH_RESPONSE");
            return;
        };
        debug!(path_id = %validated, "path validated");
        self.timers
            .stop(Timer::PerPath(validated, PathTimer::PathValidation));
        self.timers
            .stop(Timer::PerPath(validated, PathTimer::PathChallengeLost));
        if validated == self.active_path {
            self.set_loss_detection_timer(now);
        }
    }

    pub(super) fn on_path_validation_timeout(&mut self, now: Instant, path_id: PathId) {
        let path = &mut self.paths[path_id.index()];
        debug!(%path_id, local = %path.local, peer = %path.peer, "path validation failed");
        path.on_validation_failed();
        let fallback = path.fallback.take();
        self.timers
            .stop(Timer::PerPath(path_id, PathTimer::PathChallengeLost));

        if path_id != self.active_path {
            return;
        }
        let Some(fallback) = fallback else {
            return;
        };
        debug!(to = %fallback, "falling back to previous path");
        if self.paths[fallback.index()].dcid_seq.is_none() && !self.peer_cids.is_zero_length() {
            self.paths[fallback.index()].dcid_seq =
                self.peer_cids.take_unused().map(|(seq, _)| seq);
        }
        self.set_active_path(fallback, None);
        self.set_loss_detection_timer(now);
    }

    pub(super) fn on_path_challenge_lost(&mut self, _now: Instant, path_id: PathId) {
        let path = &mut self.paths[path_id.index()];
        if path.state == PathState::Validating {
            trace!(%path_id, "resending PATH_CHALLENGE");
            path.challenge_pending = true;
        }
    }
}
