use bytes::{Bytes, BytesMut};

/// Keeps the tail of the host's PTY output so a late joiner gets some
/// context. Replay is best-effort: bytes may start mid escape sequence.
pub struct ReplayBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        if data.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend_from_slice(&data[data.len() - self.capacity..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            let _ = self.buf.split_to(overflow);
        }
        self.buf.extend_from_slice(data);
    }

    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }
}
