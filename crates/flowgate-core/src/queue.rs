//! Offset-tagged buffer queue.
//!
//! A queue holds whole chunks in arrival order and tracks the absolute
//! stream offsets they cover. Chunks are moved between queues, never split.

use std::collections::VecDeque;
use std::net::SocketAddr;

/// Accounting cell for small chunks.
const SMALL_CELL: u64 = 256;
/// Accounting cell for large chunks.
const CLUSTER: u64 = 2048;

/// A unit of intercepted data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
    /// Peer address, for connectionless flows
    pub addr: Option<SocketAddr>,
    /// Payload starts with an IP header that is stripped on inbound delivery
    pub ip_header: bool,
}

impl Chunk {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            addr: None,
            ip_header: false,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn with_ip_header(mut self) -> Self {
        self.ip_header = true;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Buffer memory charged for this chunk.
    pub fn footprint(&self) -> u64 {
        let len = self.data.len() as u64;
        if len <= SMALL_CELL {
            SMALL_CELL
        } else {
            len.div_ceil(CLUSTER) * CLUSTER
        }
    }

    /// Copy of this chunk without its leading IP header.
    ///
    /// Returns `None` when the payload is too short to hold the header.
    pub fn without_ip_header(&self) -> Option<Chunk> {
        let first = *self.data.first()?;
        let header_len = match first >> 4 {
            4 => ((first & 0x0f) as usize) * 4,
            6 => 40,
            _ => return None,
        };
        if header_len == 0 || self.data.len() < header_len {
            return None;
        }
        Some(Chunk {
            data: self.data[header_len..].to_vec(),
            addr: self.addr,
            ip_header: false,
        })
    }
}

/// Ordered chunks covering `[start_offset, end_offset)`.
#[derive(Debug, Default)]
pub struct BufferQueue {
    start: u64,
    end: u64,
    items: VecDeque<Chunk>,
}

impl BufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk at the tail.
    pub fn append(&mut self, chunk: Chunk) {
        self.end += chunk.len() as u64;
        self.items.push_back(chunk);
        self.debug_verify();
    }

    /// Remove the head chunk, advancing the start offset by its length.
    pub fn remove_front(&mut self) -> Option<Chunk> {
        let chunk = self.items.pop_front()?;
        self.start += chunk.len() as u64;
        self.debug_verify();
        Some(chunk)
    }

    /// Put a chunk back at the head after a failed delivery.
    pub fn requeue_front(&mut self, chunk: Chunk) {
        self.start -= chunk.len() as u64;
        self.items.push_front(chunk);
        self.debug_verify();
    }

    pub fn front(&self) -> Option<&Chunk> {
        self.items.front()
    }

    /// Chunks with their absolute start offsets.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Chunk)> {
        self.items.iter().scan(self.start, |offset, chunk| {
            let at = *offset;
            *offset += chunk.len() as u64;
            Some((at, chunk))
        })
    }

    pub fn start_offset(&self) -> u64 {
        self.start
    }

    pub fn end_offset(&self) -> u64 {
        self.end
    }

    /// Bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of chunks held.
    pub fn chunk_count(&self) -> usize {
        self.items.len()
    }

    /// Slide an empty queue forward over bytes that bypassed it.
    pub fn advance(&mut self, len: u64) {
        debug_assert!(self.is_empty(), "advancing a non-empty queue");
        self.start += len;
        self.end += len;
    }

    /// Copy `len` bytes starting at absolute offset `from`.
    pub fn copy_range(&self, from: u64, len: u64) -> Vec<u8> {
        let until = from + len;
        let mut out = Vec::with_capacity(len as usize);
        for (at, chunk) in self.iter() {
            let chunk_end = at + chunk.len() as u64;
            if chunk_end <= from {
                continue;
            }
            if at >= until {
                break;
            }
            let lo = from.saturating_sub(at) as usize;
            let hi = (until.min(chunk_end) - at) as usize;
            out.extend_from_slice(&chunk.data[lo..hi]);
        }
        out
    }

    /// Discard everything, returning the bytes dropped.
    pub fn drain(&mut self) -> u64 {
        let drained = self.len();
        self.items.clear();
        self.start = self.end;
        drained
    }

    /// Whether the offsets agree with the chunks held.
    pub fn is_consistent(&self) -> bool {
        let total: u64 = self.items.iter().map(|c| c.len() as u64).sum();
        self.start <= self.end
            && self.end - self.start == total
            && (!self.items.is_empty() || self.start == self.end)
    }

    fn debug_verify(&self) {
        debug_assert!(
            self.is_consistent(),
            "queue offsets {}..{} disagree with {} chunks",
            self.start,
            self.end,
            self.items.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_of(parts: &[&[u8]]) -> BufferQueue {
        let mut q = BufferQueue::new();
        for p in parts {
            q.append(Chunk::new(p.to_vec()));
        }
        q
    }

    #[test]
    fn test_append_and_remove() {
        let mut q = queue_of(&[b"hello", b"world!"]);
        assert_eq!(q.len(), 11);
        assert_eq!(q.start_offset(), 0);
        assert_eq!(q.end_offset(), 11);

        let first = q.remove_front().unwrap();
        assert_eq!(first.data, b"hello");
        assert_eq!(q.start_offset(), 5);
        assert!(q.is_consistent());

        q.remove_front().unwrap();
        assert!(q.is_empty());
        assert_eq!(q.start_offset(), q.end_offset());
        assert!(q.remove_front().is_none());
    }

    #[test]
    fn test_iter_offsets_restartable() {
        let q = queue_of(&[b"ab", b"cde", b"f"]);
        let offsets: Vec<u64> = q.iter().map(|(at, _)| at).collect();
        assert_eq!(offsets, vec![0, 2, 5]);
        let again: Vec<u64> = q.iter().map(|(at, _)| at).collect();
        assert_eq!(offsets, again);
    }

    #[test]
    fn test_copy_range_spans_chunks() {
        let q = queue_of(&[b"abc", b"defg", b"hi"]);
        assert_eq!(q.copy_range(2, 4), b"cdef");
        assert_eq!(q.copy_range(0, 9), b"abcdefghi");
        assert_eq!(q.copy_range(7, 1), b"h");
    }

    #[test]
    fn test_drain_and_advance() {
        let mut q = queue_of(&[b"abc", b"de"]);
        assert_eq!(q.drain(), 5);
        assert!(q.is_empty());
        assert_eq!(q.start_offset(), 5);

        q.advance(10);
        assert_eq!(q.start_offset(), 15);
        assert_eq!(q.end_offset(), 15);
        assert!(q.is_consistent());
    }

    #[test]
    fn test_requeue_front() {
        let mut q = queue_of(&[b"abc", b"de"]);
        let chunk = q.remove_front().unwrap();
        q.requeue_front(chunk);
        assert_eq!(q.start_offset(), 0);
        assert_eq!(q.front().unwrap().data, b"abc");
    }

    #[test]
    fn test_footprint_and_ip_strip() {
        assert_eq!(Chunk::new(vec![0u8; 100]).footprint(), 256);
        assert_eq!(Chunk::new(vec![0u8; 3000]).footprint(), 4096);

        let mut packet = vec![0x45u8];
        packet.extend_from_slice(&[0u8; 19]);
        packet.extend_from_slice(b"payload");
        let stripped = Chunk::new(packet).with_ip_header().without_ip_header().unwrap();
        assert_eq!(stripped.data, b"payload");
        assert!(!stripped.ip_header);

        assert!(Chunk::new(vec![0x45u8, 0]).without_ip_header().is_none());
    }
}
