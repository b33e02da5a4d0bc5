//! Bounded, append-only output buffer with absolute chunk indices.
//!
//! Producers push chunks without knowing who reads them. Each consumer keeps
//! its own [`OutputCursor`] and asks only for what it has not seen yet, so a
//! consumer can restart from any point still held in scrollback.

use std::collections::VecDeque;

use super::types::OutputChunk;

/// Scrollback bounded by total bytes.
#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<OutputChunk>,
    bytes: usize,
    limit: usize,
    next_index: u64,
}

/// Unseen output returned by [`OutputBuffer::since`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Replay {
    pub chunks: Vec<OutputChunk>,
    /// Chunks the consumer never saw because they were trimmed first.
    pub missed: u64,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            limit: limit.max(1),
            next_index: 0,
        }
    }

    /// Append a chunk and trim the oldest output beyond the limit.
    pub fn push(&mut self, mut data: Vec<u8>) -> OutputChunk {
        if data.len() > self.limit {
            data.drain(..data.len() - self.limit);
        }
        let chunk = OutputChunk {
            index: self.next_index,
            data,
        };
        self.next_index += 1;
        self.bytes += chunk.data.len();
        self.chunks.push_back(chunk.clone());

        while self.bytes > self.limit
            && let Some(old) = self.chunks.pop_front()
        {
            self.bytes -= old.data.len();
        }
        chunk
    }

    /// Chunks at or after `cursor`, advancing it past the last one returned.
    pub fn since(&self, cursor: &mut OutputCursor) -> Replay {
        let first = self.first_index();
        let missed = first.saturating_sub(cursor.next);
        let chunks: Vec<OutputChunk> = self
            .chunks
            .iter()
            .filter(|c| c.index >= cursor.next)
            .cloned()
            .collect();
        if let Some(last) = chunks.last() {
            cursor.next = last.index + 1;
        } else {
            cursor.next = cursor.next.max(first);
        }
        Replay { chunks, missed }
    }

    /// All retained output, concatenated.
    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.data);
        }
        out
    }

    /// Index of the oldest retained chunk (equals `next_index` when empty).
    pub fn first_index(&self) -> u64 {
        self.chunks.front().map_or(self.next_index, |c| c.index)
    }

    pub const fn next_index(&self) -> u64 {
        self.next_index
    }

    pub const fn len_bytes(&self) -> usize {
        self.bytes
    }
}

/// A consumer's read position in one session's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputCursor {
    next: u64,
}

impl OutputCursor {
    pub const fn at(index: u64) -> Self {
        Self { next: index }
    }

    /// Record `chunk` as consumed. Returns `false` for a chunk already seen.
    pub const fn advance(&mut self, chunk: &OutputChunk) -> bool {
        if chunk.index < self.next {
            return false;
        }
        self.next = chunk.index + 1;
        true
    }

    pub const fn position(&self) -> u64 {
        self.next
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_absolute_and_increasing() {
        let mut buf = OutputBuffer::new(1024);
        assert_eq!(buf.push(b"a".to_vec()).index, 0);
        assert_eq!(buf.push(b"b".to_vec()).index, 1);
        assert_eq!(buf.next_index(), 2);
        assert_eq!(buf.contents(), b"ab");
    }

    #[test]
    fn since_returns_only_new_chunks() {
        let mut buf = OutputBuffer::new(1024);
        let mut cursor = OutputCursor::default();
        buf.push(b"one".to_vec());
        buf.push(b"two".to_vec());

        let replay = buf.since(&mut cursor);
        assert_eq!(replay.chunks.len(), 2);
        assert_eq!(replay.missed, 0);
        assert!(buf.since(&mut cursor).chunks.is_empty());

        buf.push(b"three".to_vec());
        let replay = buf.since(&mut cursor);
        assert_eq!(replay.chunks.len(), 1);
        assert_eq!(replay.chunks[0].data, b"three");
    }

    #[test]
    fn independent_cursors_do_not_interfere() {
        let mut buf = OutputBuffer::new(1024);
        let mut fast = OutputCursor::default();
        let mut slow = OutputCursor::default();
        buf.push(b"x".to_vec());
        assert_eq!(buf.since(&mut fast).chunks.len(), 1);
        buf.push(b"y".to_vec());
        assert_eq!(buf.since(&mut fast).chunks.len(), 1);
        assert_eq!(buf.since(&mut slow).chunks.len(), 2);
    }

    #[test]
    fn trims_oldest_beyond_limit_and_reports_gap() {
        let mut buf = OutputBuffer::new(6);
        let mut cursor = OutputCursor::default();
        buf.push(b"aaa".to_vec());
        buf.push(b"bbb".to_vec());
        buf.push(b"ccc".to_vec());

        assert_eq!(buf.len_bytes(), 6);
        assert_eq!(buf.first_index(), 1);
        assert_eq!(buf.contents(), b"bbbccc");

        let replay = buf.since(&mut cursor);
        assert_eq!(replay.missed, 1);
        assert_eq!(replay.chunks.first().unwrap().index, 1);
        assert_eq!(cursor.position(), 3);
    }

    #[test]
    fn oversized_chunk_keeps_its_tail() {
        let mut buf = OutputBuffer::new(4);
        buf.push(b"0123456789".to_vec());
        assert_eq!(buf.contents(), b"6789");
    }

    #[test]
    fn cursor_skips_duplicates() {
        let mut cursor = OutputCursor::at(5);
        let old = OutputChunk {
            index: 4,
            data: vec![],
        };
        let new = OutputChunk {
            index: 5,
            data: vec![],
        };
        assert!(!cursor.advance(&old));
        assert!(cursor.advance(&new));
        assert!(!cursor.advance(&new));
        assert_eq!(cursor.position(), 6);
    }
}
