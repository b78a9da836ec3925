use bytes::Bytes;

use super::WriteError;
use crate::{VarInt, connection::send_buffer::SendBuffer, frame};

/// Sending half of a stream
#[derive(Debug)]
pub(super) struct Send {
    /// Limit on the stream offset set by the peer
    pub(super) max_data: u64,
    pub(super) state: SendState,
    pub(super) pending: SendBuffer,
    /// Lower urgency is scheduled first
    pub(super) urgency: u8,
    /// Whether the stream shares its urgency level round-robin rather than sending to exhaustion
    pub(super) incremental: bool,
    /// Whether a frame containing a FIN bit must be transmitted, even if we don't have any new data
    pub(super) fin_pending: bool,
    /// Error code from a STOP_SENDING frame
    pub(super) stop_reason: Option<VarInt>,
    /// Offset at which we last told the peer we were blocked
    pub(super) blocked_at: Option<u64>,
}

impl Send {
    pub(super) fn new(max_data: u64) -> Self {
        Self {
            max_data,
            state: SendState::Ready,
            pending: SendBuffer::new(),
            urgency: super::DEFAULT_URGENCY,
            incremental: true,
            fin_pending: false,
            stop_reason: None,
            blocked_at: None,
        }
    }

    /// Accept as much of `data` as `limit` and the stream's own credit allow
    ///
    /// `limit` is the connection-level budget. A write of zero bytes with `fin` always succeeds on a
    /// stream that is still open.
    pub(super) fn write(&mut self, data: &[u8], fin: bool, limit: u64) -> Result<usize, WriteError> {
        if let Some(error_code) = self.stop_reason {
            return Err(WriteError::Stopped(error_code));
        }
        if self.state != SendState::Ready {
            return Err(WriteError::ClosedStream);
        }

        let budget = self.credit().min(limit);
        if budget == 0 && !data.is_empty() {
            return Err(WriteError::Blocked);
        }

        let len = data.len().min(budget as usize);
        if len > 0 {
            self.pending.write(Bytes::copy_from_slice(&data[..len]));
        }
        if fin && len == data.len() {
            self.state = SendState::DataSent {
                finish_acked: false,
            };
            self.fin_pending = true;
        }
        Ok(len)
    }

    /// Stream-level flow control credit
    pub(super) fn credit(&self) -> u64 {
        self.max_data.saturating_sub(self.pending.offset())
    }

    /// Whether the stream is limited by its own credit rather than the connection's
    pub(super) fn is_stream_blocked(&self) -> bool {
        self.credit() == 0
    }

    /// Abandon transmission, returning the final size to report in RESET_STREAM
    pub(super) fn reset(&mut self) -> Option<u64> {
        use SendState::*;
        match self.state {
            DataRecvd | ResetSent | ResetRecvd => None,
            Ready | DataSent { .. } => {
                self.state = ResetSent;
                self.fin_pending = false;
                Some(self.pending.offset())
            }
        }
    }

    /// Record STOP_SENDING; returns whether the stream should now be reset
    pub(super) fn try_stop(&mut self, error_code: VarInt) -> bool {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(error_code);
            !self.is_reset() && self.state != SendState::DataRecvd
        } else {
            false
        }
    }

    /// Returns whether the stream has been finished and all data has been acknowledged by the peer
    pub(super) fn ack(&mut self, frame: frame::StreamMeta) -> bool {
        self.pending.ack(frame.offsets);
        match self.state {
            SendState::DataSent {
                ref mut finish_acked,
            } => {
                *finish_acked |= frame.fin;
                if *finish_acked && self.pending.is_fully_acked() {
                    self.state = SendState::DataRecvd;
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Handle increase to stream-level flow control limit
    ///
    /// Returns whether the stream was unblocked.
    pub(super) fn increase_max_data(&mut self, offset: u64) -> bool {
        if offset <= self.max_data || self.state != SendState::Ready {
            return false;
        }
        let was_blocked = self.is_stream_blocked();
        self.max_data = offset;
        was_blocked
    }

    pub(super) fn is_reset(&self) -> bool {
        matches!(self.state, SendState::ResetSent | SendState::ResetRecvd)
    }

    /// Whether the stream has frames to transmit
    pub(super) fn is_pending(&self) -> bool {
        !self.is_reset() && (self.pending.has_unsent_data() || self.fin_pending)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum SendState {
    /// Sending new data
    Ready,
    /// Stream was finished
    DataSent { finish_acked: bool },
    /// Sent RESET
    ResetSent,
    /// Peer acknowledged RESET
    ResetRecvd,
    /// All data and the FIN bit were acknowledged
    DataRecvd,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamId;

    #[test]
    fn write_respects_limits() {
        let mut send = Send::new(4);
        assert_eq!(send.write(b"hello", false, 100), Ok(4));
        assert!(send.is_stream_blocked());
        assert_eq!(send.write(b"o", false, 100), Err(WriteError::Blocked));
        assert!(send.increase_max_data(10));
        assert_eq!(send.write(b"o world", true, 3), Ok(3));
        assert_eq!(send.state, SendState::Ready);
        // Seven bytes written against a limit of ten
        assert_eq!(send.write(b"orld", true, 100), Ok(3));
        assert_eq!(send.state, SendState::Ready);
        assert!(send.is_stream_blocked());
        assert!(send.increase_max_data(11));
        assert_eq!(send.write(b"d", true, 100), Ok(1));
        assert_eq!(
            send.state,
            SendState::DataSent {
                finish_acked: false
            }
        );
        assert_eq!(send.write(b"!", false, 100), Err(WriteError::ClosedStream));
    }

    #[test]
    fn empty_fin() {
        let mut send = Send::new(0);
        assert_eq!(send.write(&[], true, 0), Ok(0));
        assert!(send.fin_pending);
        assert!(send.is_pending());
    }

    #[test]
    fn ack_completes_stream() {
        let mut send = Send::new(100);
        send.write(b"abc", true, 100).unwrap();
        let range = send.pending.poll_transmit(100);
        assert!(!send.ack(frame::StreamMeta {
            id: StreamId(0),
            offsets: range.start..2,
            fin: false,
        }));
        assert!(send.ack(frame::StreamMeta {
            id: StreamId(0),
            offsets: 2..3,
            fin: true,
        }));
        assert_eq!(send.state, SendState::DataRecvd);
    }

    #[test]
    fn stop_sending_forces_reset() {
        let mut send = Send::new(100);
        send.write(b"abc", false, 100).unwrap();
        assert!(send.try_stop(VarInt(9)));
        assert!(!send.try_stop(VarInt(9)));
        assert_eq!(send.write(b"d", false, 100), Err(WriteError::Stopped(VarInt(9))));
        assert_eq!(send.reset(), Some(3));
        assert_eq!(send.reset(), None);
        assert!(!send.is_pending());
    }
}
