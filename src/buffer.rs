use bytes::{Buf, BytesMut};

/// Dynamically sized FIFO byte queue. Data is appended at the tail and
/// consumed from the head; the readable region is always contiguous.
pub struct Buffer {
    data: BytesMut,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer {
            data: BytesMut::new(),
        }
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: BytesMut::with_capacity(capacity),
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append bytes at the tail.
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Discard `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.data.len(), "consuming past the buffer head");
        self.data.advance(count);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_roundtrip() {
        let mut buffer = Buffer::new();

        buffer.append(&[1, 2, 3]);
        buffer.append(&[4, 5]);

        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 4, 5]);

        buffer.consume(2);

        assert_eq!(buffer.as_slice(), &[3, 4, 5]);

        buffer.append(&[6]);

        assert_eq!(buffer.as_slice(), &[3, 4, 5, 6]);

        buffer.consume(4);

        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut buffer = Buffer::with_capacity(64);

        buffer.append(&[7; 48]);
        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.as_slice(), &[] as &[u8]);
    }

    #[test]
    #[should_panic(expected = "consuming past the buffer head")]
    fn test_fail_on_overconsume() {
        let mut buffer = Buffer::new();

        buffer.append(&[1, 2, 3]);
        buffer.consume(4);
    }

    #[test]
    fn test_interleaved_growth() {
        let mut buffer = Buffer::with_capacity(16);
        let mut expected = Vec::new();

        for round in 0..64u32 {
            let chunk: Vec<u8> = (0..37).map(|i| (round + i) as u8).collect();
            buffer.append(&chunk);
            expected.extend_from_slice(&chunk);

            buffer.consume(11);
            expected.drain(..11);
        }

        assert_eq!(buffer.as_slice(), &expected[..]);
    }
}
