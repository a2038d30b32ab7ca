use std::time::{Duration, Instant};

/// Receive buffer for frame assembly.
///
/// Remembers when the last byte arrived, so that a stalled partial frame
/// can be detected.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    last_write: Option<Instant>,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            data: Vec::with_capacity(64),
            read_pos: 0,
            last_write: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn consume(&mut self, len: usize) {
        assert!(len <= self.len());
        self.read_pos += len;
        if self.read_pos == self.data.len() {
            self.clear();
        }
    }

    pub fn write(&mut self, bytes: &[u8], now: Instant) {
        if self.read_pos == self.data.len() {
            self.clear();
        }
        self.data.extend_from_slice(bytes);
        if !bytes.is_empty() {
            self.last_write = Some(now);
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    /// True when unconsumed bytes have been waiting longer than `gap`.
    pub fn stalled(&self, now: Instant, gap: Duration) -> bool {
        match self.last_write {
            Some(last) if !self.is_empty() => now.saturating_duration_since(last) > gap,
            _ => false,
        }
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }
}
