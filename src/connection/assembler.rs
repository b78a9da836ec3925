use std::collections::BTreeMap;

use bytes::{Buf, Bytes, BytesMut};

/// Buffered chunks above which the assembler copies its data into a single allocation
const DEFRAGMENT_THRESHOLD: usize = 32;

/// Reassembles out-of-order stream or crypto frames into an ordered byte stream
///
/// Chunks are indexed by offset. Overlapping retransmissions are tolerated: the part of a chunk
/// that was already read is skipped, and a chunk fully covered by a buffered one is dropped.
#[derive(Debug, Default)]
pub(super) struct Assembler {
    data: BTreeMap<u64, Bytes>,
    /// Bytes buffered in `data`, counting overlaps twice
    buffered: usize,
    /// Length of the prefix consumed by the application
    bytes_read: u64,
    /// First offset we haven't received any data at or after
    end: u64,
    /// Whether incoming data is discarded
    stopped: bool,
}

impl Assembler {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn insert(&mut self, mut offset: u64, mut bytes: Bytes) {
        let end = offset + bytes.len() as u64;
        self.end = self.end.max(end);
        if self.stopped || end <= self.bytes_read {
            return;
        }
        if offset < self.bytes_read {
            bytes.advance((self.bytes_read - offset) as usize);
            offset = self.bytes_read;
        }
        if bytes.is_empty() {
            return;
        }

        // Skip data that a single buffered chunk already covers
        if let Some((&start, existing)) = self.data.range(..=offset).next_back() {
            if start + existing.len() as u64 >= end {
                return;
            }
        }
        if let Some(existing) = self.data.get(&offset) {
            self.buffered -= existing.len();
        }
        self.buffered += bytes.len();
        self.data.insert(offset, bytes);

        if self.data.len() > DEFRAGMENT_THRESHOLD {
            self.defragment();
        }
    }

    /// Copy contiguous data into `buf`, returning the number of bytes written
    pub(super) fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut read = 0;
        while read < buf.len() {
            let Some(chunk) = self.read_chunk(buf.len() - read) else {
                break;
            };
            buf[read..read + chunk.len()].copy_from_slice(&chunk);
            read += chunk.len();
        }
        read
    }

    /// Take the next contiguous chunk of at most `max_len` bytes
    pub(super) fn read_chunk(&mut self, max_len: usize) -> Option<Bytes> {
        loop {
            let mut entry = self.data.first_entry()?;
            let offset = *entry.key();
            if offset > self.bytes_read {
                return None;
            }
            let chunk = entry.get_mut();
            let chunk_end = offset + chunk.len() as u64;
            if chunk_end <= self.bytes_read {
                self.buffered -= chunk.len();
                entry.remove();
                continue;
            }

            let start = (self.bytes_read - offset) as usize;
            let len = max_len.min(chunk.len() - start);
            let out = chunk.slice(start..start + len);
            self.bytes_read += len as u64;
            if start + len == chunk.len() {
                self.buffered -= chunk.len();
                entry.remove();
            } else {
                // Re-key the remainder at the new read offset
                let mut rest = entry.remove();
                self.buffered -= rest.len();
                rest.advance(start + len);
                self.buffered += rest.len();
                self.data.entry(self.bytes_read).or_insert(rest);
            }
            return Some(out);
        }
    }

    /// Whether contiguous data is available at the read offset
    pub(super) fn has_readable(&self) -> bool {
        self.data
            .range(..=self.bytes_read)
            .any(|(&offset, chunk)| offset + chunk.len() as u64 > self.bytes_read)
    }

    /// Copy buffered data into a single buffer, merging adjacent and overlapping chunks
    fn defragment(&mut self) {
        let mut merged = BTreeMap::new();
        let mut buffer = BytesMut::with_capacity(self.buffered);
        let mut start = None::<u64>;
        for (offset, chunk) in std::mem::take(&mut self.data) {
            let chunk_end = offset + chunk.len() as u64;
            match start {
                Some(s) if offset <= s + buffer.len() as u64 => {
                    let covered = s + buffer.len() as u64;
                    if chunk_end > covered {
                        buffer.extend_from_slice(&chunk[(covered - offset) as usize..]);
                    }
                }
                _ => {
                    if let Some(s) = start {
                        merged.insert(s, buffer.split().freeze());
                    }
                    start = Some(offset);
                    buffer.extend_from_slice(&chunk);
                }
            }
        }
        if let Some(s) = start {
            merged.insert(s, buffer.split().freeze());
        }
        self.buffered = merged.values().map(Bytes::len).sum();
        self.data = merged;
    }

    /// Number of bytes consumed by the application
    pub(super) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Offset after the largest byte received
    pub(super) fn end(&self) -> u64 {
        self.end
    }

    /// Whether all data prior to `self.end()` has been read
    pub(super) fn is_fully_read(&self) -> bool {
        self.bytes_read == self.end
    }

    /// Discard buffered data and ignore future data, but keep tracking offsets
    pub(super) fn stop(&mut self) {
        self.stopped = true;
        self.data.clear();
        self.buffered = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next(x: &mut Assembler, size: usize) -> Option<Bytes> {
        x.read_chunk(size)
    }

    #[test]
    fn assemble_ordered() {
        let mut x = Assembler::new();
        assert_eq!(next(&mut x, 32), None);
        x.insert(0, Bytes::from_static(b"123"));
        assert_eq!(next(&mut x, 1), Some(Bytes::from_static(b"1")));
        assert_eq!(next(&mut x, 3), Some(Bytes::from_static(b"23")));
        x.insert(3, Bytes::from_static(b"456"));
        x.insert(6, Bytes::from_static(b"789"));
        x.insert(9, Bytes::from_static(b"10"));
        let mut buf = [0; 16];
        assert_eq!(x.read(&mut buf), 8);
        assert_eq!(&buf[..8], b"45678910");
        assert!(x.is_fully_read());
    }

    #[test]
    fn assemble_unordered() {
        let mut x = Assembler::new();
        x.insert(3, Bytes::from_static(b"456"));
        assert_eq!(next(&mut x, 32), None);
        assert!(!x.has_readable());
        x.insert(0, Bytes::from_static(b"123"));
        assert!(x.has_readable());
        let mut buf = [0; 6];
        assert_eq!(x.read(&mut buf), 6);
        assert_eq!(&buf, b"123456");
        assert_eq!(x.end(), 6);
    }

    #[test]
    fn assemble_duplicate_and_overlap() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"123"));
        x.insert(0, Bytes::from_static(b"123"));
        x.insert(1, Bytes::from_static(b"23456"));
        x.insert(2, Bytes::from_static(b"3"));
        let mut buf = [0; 16];
        assert_eq!(x.read(&mut buf), 6);
        assert_eq!(&buf[..6], b"123456");
        // Already consumed
        x.insert(0, Bytes::from_static(b"1234"));
        assert_eq!(next(&mut x, 32), None);
        x.insert(4, Bytes::from_static(b"5678"));
        assert_eq!(next(&mut x, 32), Some(Bytes::from_static(b"78")));
    }

    #[test]
    fn assemble_defragments_small_chunks() {
        let mut x = Assembler::new();
        for i in (1..=64u64).rev() {
            x.insert(i, Bytes::from(vec![i as u8]));
        }
        assert!(x.data.len() <= DEFRAGMENT_THRESHOLD);
        x.insert(0, Bytes::from_static(&[0]));
        let mut buf = [0; 65];
        assert_eq!(x.read(&mut buf), 65);
        for (i, b) in buf.iter().enumerate() {
            assert_eq!(*b, i as u8);
        }
        assert_eq!(x.buffered, 0);
    }

    #[test]
    fn stopped_discards_data() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"123"));
        x.stop();
        x.insert(3, Bytes::from_static(b"456"));
        assert_eq!(next(&mut x, 32), None);
        assert_eq!(x.end(), 6);
    }
}
