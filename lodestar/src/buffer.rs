use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

/// A bounded FIFO byte queue between the serial link and the line parser.
/// Data is appended at the tail and consumed from the head.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
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

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Pop the oldest byte.
    #[inline]
    pub fn pop_front(&mut self) -> Option<u8> {
        self.data.pop_front()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Read from the link until it runs dry. The modem keeps transmitting no
    /// matter how far behind we are, so when the buffer fills up the oldest
    /// bytes are dropped to make room for the most recent output.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut chunk = [0u8; 256];
        let mut total = 0;

        loop {
            let count = match reader.read(&mut chunk) {
                Ok(0) => return Ok(total),
                Ok(count) => count,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref err) if err.kind() == io::ErrorKind::TimedOut => return Ok(total),
                Err(err) => return Err(err),
            };

            let keep = if count > self.size {
                &chunk[count - self.size..count]
            } else {
                &chunk[..count]
            };

            if keep.len() > self.free_capacity() {
                let excess = keep.len() - self.free_capacity();
                for _ in 0..excess {
                    self.data.pop_front();
                }
            }

            self.data.extend(keep.iter().cloned());
            total += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;
    use std::io::Cursor;

    struct MockLink {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
    }

    impl MockLink {
        fn new(data: Vec<u8>, chunk: usize) -> MockLink {
            MockLink {
                data,
                cursor: 0,
                chunk,
            }
        }
    }

    impl io::Read for MockLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    #[test]
    fn test_ingress_drains_reader() {
        let mock_data: Vec<_> = (0..500).map(|item| item as u8).collect();
        let mut link = MockLink::new(mock_data.clone(), 100);

        let mut buffer = Buffer::new(1024);

        let count = buffer.ingress(&mut link).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.len(), mock_data.len());

        let drained: Vec<_> = std::iter::from_fn(|| buffer.pop_front()).collect();
        assert_eq!(drained, mock_data);
    }

    #[test]
    fn test_ingress_stops_on_empty_reader() {
        let mut cursor = Cursor::new(vec![1u8, 2, 3]);
        let mut buffer = Buffer::new(1024);

        let count = buffer.ingress(&mut cursor).unwrap();

        assert_eq!(count, 3);
        assert_eq!(buffer.pop_front(), Some(1));
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mock_data: Vec<_> = (0..64).map(|item| item as u8).collect();
        let mut link = MockLink::new(mock_data, 16);

        let mut buffer = Buffer::new(32);

        buffer.ingress(&mut link).unwrap();

        assert_eq!(buffer.len(), 32);
        // The first 32 bytes were dropped, the most recent 32 kept.
        assert_eq!(buffer.pop_front(), Some(32));
    }

    #[test]
    fn test_empty() {
        let mut buffer = Buffer::new(32);
        assert!(buffer.is_empty());
        assert_eq!(buffer.pop_front(), None);
        assert_eq!(buffer.free_capacity(), 32);
    }
}
