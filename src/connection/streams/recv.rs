use tracing::debug;

use super::ReadError;
use crate::{
    TransportError, VarInt,
    connection::assembler::Assembler,
    frame,
};

/// Receiving half of a stream
#[derive(Debug)]
pub(super) struct Recv {
    state: RecvState,
    pub(super) assembler: Assembler,
    /// Highest MAX_STREAM_DATA value advertised to the peer
    sent_max_stream_data: u64,
    /// Offset past the highest byte received
    pub(super) end: u64,
    /// Whether the application asked the peer to stop sending
    pub(super) stopped: bool,
}

impl Recv {
    pub(super) fn new(initial_max_data: u64) -> Self {
        Self {
            state: RecvState::Recv { size: None },
            assembler: Assembler::new(),
            sent_max_stream_data: initial_max_data,
            end: 0,
            stopped: false,
        }
    }

    /// Buffer a STREAM frame, returning the connection-level credit it consumed
    ///
    /// `received` and `max_data` are the connection-level totals used to enforce flow control.
    pub(super) fn ingest(
        &mut self,
        frame: frame::Stream,
        received: u64,
        max_data: u64,
    ) -> Result<u64, TransportError> {
        let end = frame.offset + frame.data.len() as u64;
        if end > VarInt::MAX.into_inner() {
            return Err(TransportError::FRAME_ENCODING_ERROR(
                "maximum stream offset too large",
            ));
        }

        if let Some(final_size) = self.final_size() {
            if end > final_size || (frame.fin && end != final_size) {
                debug!(end, final_size, "final size error");
                return Err(TransportError::FINAL_SIZE_ERROR(""));
            }
        } else if frame.fin && self.end > end {
            return Err(TransportError::FINAL_SIZE_ERROR(
                "fin below previously received data",
            ));
        }

        let new_bytes = self.credit_consumed_by(end, received, max_data)?;

        if frame.fin {
            if let RecvState::Recv { ref mut size } = self.state {
                *size = Some(end);
            }
        }
        self.end = self.end.max(end);
        self.assembler.insert(frame.offset, frame.data);
        Ok(new_bytes)
    }

    /// Copy readable data into `buf`, returning the byte count and whether the stream finished
    pub(super) fn read(&mut self, buf: &mut [u8]) -> Result<(usize, bool), ReadError> {
        match self.state {
            RecvState::ResetRecvd { error_code, .. } => {
                self.state = RecvState::Closed;
                return Err(ReadError::Reset(error_code));
            }
            RecvState::Closed => return Err(ReadError::ClosedStream),
            RecvState::Recv { .. } => {}
        }
        if self.stopped {
            return Err(ReadError::ClosedStream);
        }

        let read = self.assembler.read(buf);
        let fin = matches!(self.state, RecvState::Recv { size: Some(size) } if size == self.assembler.bytes_read());
        if fin {
            self.state = RecvState::Closed;
        } else if read == 0 && !buf.is_empty() {
            return Err(ReadError::Blocked);
        }
        Ok((read, fin))
    }

    /// Whether a read would make progress or report a terminal condition
    pub(super) fn is_readable(&self) -> bool {
        match self.state {
            RecvState::ResetRecvd { .. } => true,
            RecvState::Closed => false,
            RecvState::Recv { size } => {
                !self.stopped
                    && (self.assembler.has_readable()
                        || size == Some(self.assembler.bytes_read()))
            }
        }
    }

    /// Discard buffered and future data, returning the credit to hand back to the connection
    pub(super) fn stop(&mut self) -> u64 {
        if self.stopped {
            return 0;
        }
        self.stopped = true;
        self.assembler.stop();
        self.end - self.assembler.bytes_read()
    }

    /// The MAX_STREAM_DATA value to announce if the window moved far enough to be worth it
    pub(super) fn max_stream_data(&self, window: u64) -> Option<u64> {
        let max_stream_data = self.assembler.bytes_read() + window;
        // Announce once half the window has been consumed
        let worthwhile = max_stream_data - self.sent_max_stream_data >= window / 2;
        (self.receiving_unknown_size() && worthwhile).then_some(max_stream_data)
    }

    /// Whether a MAX_STREAM_DATA frame could still be useful to the peer
    pub(super) fn can_send_flow_control(&self) -> bool {
        self.receiving_unknown_size() && !self.stopped
    }

    pub(super) fn record_sent_max_stream_data(&mut self, sent: u64) {
        self.sent_max_stream_data = self.sent_max_stream_data.max(sent);
    }

    pub(super) fn sent_max_stream_data(&self) -> u64 {
        self.sent_max_stream_data
    }

    fn receiving_unknown_size(&self) -> bool {
        matches!(self.state, RecvState::Recv { size: None })
    }

    /// No more data expected from the peer
    pub(super) fn is_finished(&self) -> bool {
        !matches!(self.state, RecvState::Recv { size: None })
    }

    /// All data was read or the reset delivered
    pub(super) fn is_closed(&self) -> bool {
        self.state == RecvState::Closed
            || (self.stopped && self.is_finished())
    }

    fn final_size(&self) -> Option<u64> {
        match self.state {
            RecvState::Recv { size } => size,
            RecvState::ResetRecvd { size, .. } => Some(size),
            RecvState::Closed => None,
        }
    }

    /// Process RESET_STREAM; returns `false` if the reset was redundant
    pub(super) fn reset(
        &mut self,
        error_code: VarInt,
        final_size: VarInt,
        received: u64,
        max_data: u64,
    ) -> Result<bool, TransportError> {
        let final_size = final_size.into_inner();
        if let Some(size) = self.final_size() {
            if size != final_size {
                return Err(TransportError::FINAL_SIZE_ERROR("inconsistent value"));
            }
        } else if self.end > final_size {
            return Err(TransportError::FINAL_SIZE_ERROR(
                "lower than high water mark",
            ));
        }
        self.credit_consumed_by(final_size, received, max_data)?;

        if matches!(self.state, RecvState::ResetRecvd { .. } | RecvState::Closed) {
            return Ok(false);
        }
        self.state = RecvState::ResetRecvd {
            size: final_size,
            error_code,
        };
        self.end = final_size;
        // Reads fail from now on, so buffered data is never handed out
        self.assembler.stop();
        Ok(true)
    }

    /// Credit consumed by receiving data up to `offset`, or an error if it exceeds what we issued
    fn credit_consumed_by(
        &self,
        offset: u64,
        received: u64,
        max_data: u64,
    ) -> Result<u64, TransportError> {
        let new_bytes = offset.saturating_sub(self.end);
        if offset > self.sent_max_stream_data || received + new_bytes > max_data {
            debug!(
                received,
                new_bytes,
                max_data,
                offset,
                stream_max_data = self.sent_max_stream_data,
                "flow control error"
            );
            return Err(TransportError::FLOW_CONTROL_ERROR(""));
        }
        Ok(new_bytes)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RecvState {
    Recv { size: Option<u64> },
    ResetRecvd { size: u64, error_code: VarInt },
    Closed,
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::StreamId;

    fn stream(offset: u64, data: &'static [u8], fin: bool) -> frame::Stream {
        frame::Stream {
            id: StreamId(0),
            offset,
            fin,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn read_until_fin() {
        let mut recv = Recv::new(100);
        assert_eq!(recv.ingest(stream(3, b"lo", true), 0, 100).unwrap(), 5);
        let mut buf = [0; 8];
        assert_eq!(recv.read(&mut buf), Err(ReadError::Blocked));
        assert_eq!(recv.ingest(stream(0, b"hel", false), 5, 100).unwrap(), 0);
        assert!(recv.is_readable());
        assert_eq!(recv.read(&mut buf), Ok((5, true)));
        assert_eq!(&buf[..5], b"hello");
        assert!(recv.is_closed());
        assert_eq!(recv.read(&mut buf), Err(ReadError::ClosedStream));
    }

    #[test]
    fn flow_control_violation() {
        let mut recv = Recv::new(4);
        assert!(recv.ingest(stream(0, b"hello", false), 0, 100).is_err());
        let mut recv = Recv::new(100);
        assert!(recv.ingest(stream(0, b"hello", false), 98, 100).is_err());
    }

    #[test]
    fn final_size_errors() {
        let mut recv = Recv::new(100);
        recv.ingest(stream(0, b"abcd", true), 0, 100).unwrap();
        assert!(recv.ingest(stream(4, b"e", false), 4, 100).is_err());
        assert!(recv.ingest(stream(0, b"ab", true), 4, 100).is_err());
        assert!(recv.reset(VarInt(1), VarInt(3), 4, 100).is_err());
    }

    #[test]
    fn reset_is_reported_once() {
        let mut recv = Recv::new(100);
        recv.ingest(stream(0, b"ab", false), 0, 100).unwrap();
        assert_eq!(recv.reset(VarInt(7), VarInt(2), 2, 100), Ok(true));
        assert_eq!(recv.reset(VarInt(7), VarInt(2), 2, 100), Ok(false));
        assert!(recv.is_readable());
        let mut buf = [0; 4];
        assert_eq!(recv.read(&mut buf), Err(ReadError::Reset(VarInt(7))));
        assert_eq!(recv.read(&mut buf), Err(ReadError::ClosedStream));
    }

    #[test]
    fn window_update_after_half_consumed() {
        let mut recv = Recv::new(10);
        recv.ingest(stream(0, b"1234", false), 0, 100).unwrap();
        let mut buf = [0; 4];
        recv.read(&mut buf).unwrap();
        assert_eq!(recv.max_stream_data(10), None);
        recv.ingest(stream(4, b"5", false), 4, 100).unwrap();
        recv.read(&mut buf).unwrap();
        assert_eq!(recv.max_stream_data(10), Some(15));
        recv.record_sent_max_stream_data(15);
        assert_eq!(recv.max_stream_data(10), None);
    }

    #[test]
    fn stop_returns_unread_credit() {
        let mut recv = Recv::new(100);
        recv.ingest(stream(0, b"hello", false), 0, 100).unwrap();
        assert_eq!(recv.stop(), 5);
        assert_eq!(recv.stop(), 0);
        assert!(!recv.is_readable());
    }
}
