use std::time::Instant;

use super::paths::PathId;

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum Timer {
    /// Per connection timers
    Conn(ConnTimer),
    /// Per path timers
    PerPath(PathId, PathTimer),
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum ConnTimer {
    /// When to send an ack-eliciting probe packet or declare unacked packets lost
    LossDetection = 0,
    /// When to close the connection after no activity
    Idle = 1,
    /// When the close timer expires, the connection has been gracefully terminated
    Close = 2,
    /// When keys are discarded because they should not be needed anymore
    KeyDiscard = 3,
    /// When to send a `PING` frame to keep the connection alive
    KeepAlive = 4,
    /// When to send an immediate ACK if there are unacked ack-eliciting packets of the peer
    MaxAckDelay = 5,
}

impl ConnTimer {
    const VALUES: [Self; 6] = [
        Self::LossDetection,
        Self::Idle,
        Self::Close,
        Self::KeyDiscard,
        Self::KeepAlive,
        Self::MaxAckDelay,
    ];
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum PathTimer {
    /// When to give up on validating the path
    PathValidation = 0,
    /// When to resend a PATH_CHALLENGE deemed lost
    PathChallengeLost = 1,
    /// When pacing will allow us to send a packet
    Pacing = 2,
}

impl PathTimer {
    const VALUES: [Self; 3] = [Self::PathValidation, Self::PathChallengeLost, Self::Pacing];
}

type PathTimerTable = [Option<Instant>; PathTimer::VALUES.len()];

/// Keeps track of the nearest timeout for each `Timer`
///
/// The [`TimerTable`] is advanced with [`TimerTable::expire_before`].
#[derive(Debug, Clone, Default)]
pub(crate) struct TimerTable {
    generic: [Option<Instant>; ConnTimer::VALUES.len()],
    /// Indexed by [`PathId`], grown on demand
    path_timers: Vec<PathTimerTable>,
}

impl TimerTable {
    pub(super) fn set(&mut self, timer: Timer, time: Instant) {
        match timer {
            Timer::Conn(timer) => self.generic[timer as usize] = Some(time),
            Timer::PerPath(path_id, timer) => {
                let index = path_id.index();
                if self.path_timers.len() <= index {
                    self.path_timers.resize(index + 1, Default::default());
                }
                self.path_timers[index][timer as usize] = Some(time);
            }
        }
    }

    pub(super) fn get(&self, timer: Timer) -> Option<Instant> {
        match timer {
            Timer::Conn(timer) => self.generic[timer as usize],
            Timer::PerPath(path_id, timer) => self
                .path_timers
                .get(path_id.index())
                .and_then(|table| table[timer as usize]),
        }
    }

    pub(super) fn stop(&mut self, timer: Timer) {
        match timer {
            Timer::Conn(timer) => self.generic[timer as usize] = None,
            Timer::PerPath(path_id, timer) => {
                if let Some(table) = self.path_timers.get_mut(path_id.index()) {
                    table[timer as usize] = None;
                }
            }
        }
    }

    pub(super) fn stop_per_path(&mut self, path_id: PathId) {
        if let Some(table) = self.path_timers.get_mut(path_id.index()) {
            *table = Default::default();
        }
    }

    pub(super) fn is_expired(&self, timer: Timer, now: Instant) -> bool {
        self.get(timer).is_some_and(|time| time <= now)
    }

    /// The earliest armed deadline
    pub(super) fn peek(&self) -> Option<Instant> {
        let min_generic = self.generic.iter().filter_map(|&x| x).min();
        let min_path = self
            .path_timers
            .iter()
            .flat_map(|table| table.iter().filter_map(|&x| x))
            .min();
        match (min_generic, min_path) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Disarm and return one timer that expired at or before `now`
    ///
    /// Connection-wide timers are returned before per-path ones.
    pub(super) fn expire_before(&mut self, now: Instant) -> Option<(Timer, Instant)> {
        for timer in ConnTimer::VALUES {
            let slot = &mut self.generic[timer as usize];
            if slot.is_some_and(|time| time <= now) {
                return slot.take().map(|time| (Timer::Conn(timer), time));
            }
        }

        for (index, table) in self.path_timers.iter_mut().enumerate() {
            for timer in PathTimer::VALUES {
                let slot = &mut table[timer as usize];
                if slot.is_some_and(|time| time <= now) {
                    return slot
                        .take()
                        .map(|time| (Timer::PerPath(PathId::new(index), timer), time));
                }
            }
        }
        None
    }

    pub(super) fn reset(&mut self) {
        self.generic = Default::default();
        self.path_timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn conn_timers_expire_first() {
        let now = Instant::now();
        let mut timers = TimerTable::default();
        let path = PathId::new(2);
        timers.set(Timer::PerPath(path, PathTimer::PathValidation), now);
        timers.set(Timer::Conn(ConnTimer::Idle), now + Duration::from_millis(1));
        timers.set(Timer::Conn(ConnTimer::LossDetection), now);
        assert_eq!(timers.peek(), Some(now));

        let later = now + Duration::from_millis(5);
        assert_eq!(
            timers.expire_before(later),
            Some((Timer::Conn(ConnTimer::LossDetection), now))
        );
        assert_eq!(
            timers.expire_before(later),
            Some((Timer::Conn(ConnTimer::Idle), now + Duration::from_millis(1)))
        );
        assert_eq!(
            timers.expire_before(later),
            Some((Timer::PerPath(path, PathTimer::PathValidation), now))
        );
        assert_eq!(timers.expire_before(later), None);
        assert_eq!(timers.peek(), None);
    }

    #[test]
    fn stop_and_reset() {
        let now = Instant::now();
        let mut timers = TimerTable::default();
        let path = PathId::new(0);
        timers.set(Timer::PerPath(path, PathTimer::Pacing), now);
        timers.set(Timer::PerPath(path, PathTimer::PathChallengeLost), now);
        timers.stop_per_path(path);
        assert_eq!(timers.peek(), None);

        timers.set(Timer::Conn(ConnTimer::Close), now);
        assert!(timers.is_expired(Timer::Conn(ConnTimer::Close), now));
        timers.stop(Timer::Conn(ConnTimer::Close));
        assert!(!timers.is_expired(Timer::Conn(ConnTimer::Close), now));

        timers.set(Timer::Conn(ConnTimer::KeepAlive), now);
        timers.reset();
        assert_eq!(timers.peek(), None);
    }
}
