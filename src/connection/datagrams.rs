use std::collections::VecDeque;

use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

use crate::config::DatagramFullPolicy;

/// Bounded FIFO of unreliable datagrams
#[derive(Debug)]
pub(super) struct DatagramQueue {
    queue: VecDeque<Bytes>,
    /// Total payload bytes held
    byte_size: usize,
    max_len: usize,
    policy: DatagramFullPolicy,
}

impl DatagramQueue {
    pub(super) fn new(max_len: usize, policy: DatagramFullPolicy) -> Self {
        Self {
            queue: VecDeque::new(),
            byte_size: 0,
            max_len,
            policy,
        }
    }

    /// Enqueue a datagram, applying the full-queue policy
    pub(super) fn push(&mut self, data: Bytes) -> Result<(), SendDatagramError> {
        if self.queue.len() >= self.max_len {
            match self.policy {
                DatagramFullPolicy::Reject => return Err(SendDatagramError::QueueFull),
                DatagramFullPolicy::DropOldest => {
                    if self.max_len == 0 {
                        return Err(SendDatagramError::QueueFull);
                    }
                    while self.queue.len() >= self.max_len {
                        let Some(dropped) = self.pop() else { break };
                        trace!(len = dropped.len(), "dropping oldest datagram");
                    }
                }
            }
        }
        self.byte_size += data.len();
        self.queue.push_back(data);
        Ok(())
    }

    pub(super) fn pop(&mut self) -> Option<Bytes> {
        let data = self.queue.pop_front()?;
        self.byte_size -= data.len();
        Some(data)
    }

    /// Put back a datagram that didn't fit into a packet after all
    pub(super) fn push_front(&mut self, data: Bytes) {
        self.byte_size += data.len();
        self.queue.push_front(data);
    }

    pub(super) fn peek_len(&self) -> Option<usize> {
        self.queue.front().map(Bytes::len)
    }

    /// Drop every queued datagram for which `f` returns `true`
    pub(super) fn purge<F: Fn(&[u8]) -> bool>(&mut self, f: F) {
        self.queue.retain(|data| !f(data));
        self.byte_size = self.queue.iter().map(Bytes::len).sum();
    }

    pub(super) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(super) fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub(super) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Errors that can arise when sending a datagram
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum SendDatagramError {
    /// Datagrams are disabled locally or the peer doesn't accept them
    #[error("datagrams not negotiated")]
    NotNegotiated,
    /// The datagram exceeds what the peer accepts or what fits in a packet on the current path
    #[error("datagram too large")]
    TooLarge,
    /// The send queue is full and configured to refuse new datagrams
    #[error("datagram queue full")]
    QueueFull,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_oldest() {
        let mut queue = DatagramQueue::new(2, DatagramFullPolicy::DropOldest);
        queue.push(Bytes::from_static(b"one")).unwrap();
        queue.push(Bytes::from_static(b"two")).unwrap();
        queue.push(Bytes::from_static(b"three")).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.byte_size(), 8);
        assert_eq!(queue.pop().as_deref(), Some(&b"two"[..]));
        assert_eq!(queue.pop().as_deref(), Some(&b"three"[..]));
        assert!(queue.pop().is_none());
        assert_eq!(queue.byte_size(), 0);
    }

    #[test]
    fn reject_when_full() {
        let mut queue = DatagramQueue::new(1, DatagramFullPolicy::Reject);
        queue.push(Bytes::from_static(b"one")).unwrap();
        assert_eq!(
            queue.push(Bytes::from_static(b"two")),
            Err(SendDatagramError::QueueFull)
        );
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_len(), Some(3));
    }

    #[test]
    fn zero_capacity_never_grows() {
        let mut queue = DatagramQueue::new(0, DatagramFullPolicy::DropOldest);
        assert_eq!(
            queue.push(Bytes::from_static(b"x")),
            Err(SendDatagramError::QueueFull)
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn purge_matching() {
        let mut queue = DatagramQueue::new(4, DatagramFullPolicy::DropOldest);
        for data in [&b"keep"[..], b"drop me", b"keep too"] {
            queue.push(Bytes::copy_from_slice(data)).unwrap();
        }
        queue.purge(|data| data.starts_with(b"drop"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.byte_size(), 12);
        let popped = queue.pop().unwrap();
        queue.push_front(popped);
        assert_eq!(queue.byte_size(), 12);
    }
}
