use slice_deque::SliceDeque;
use std::cmp;
use std::io;

type ByteDeque = SliceDeque<u8>;

/// A fixed-capacity FIFO byte queue, one half of a link's buffer pair.
/// Data is appended at the tail and consumed from the head; the backing
/// storage is reserved once and never reallocated.
///
/// Overflow and underflow are invariant violations on the caller's side
/// (the engine caps every read by the free capacity of the destination),
/// so they are asserted rather than surfaced as recoverable errors.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        assert!(size > 0, "Buffer size must be non-zero");

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

    /// The fixed logical capacity of the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Slice containing buffered data, oldest byte first.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Mutable slice containing buffered data. Used to run the cipher
    /// transform in place before bytes are moved to their queue.
    #[inline]
    pub(crate) fn data_slice(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }

    #[inline]
    pub fn clear(&mut self) {
        unsafe { self.data.move_head(self.len() as isize) };
    }

    /// Copies `src` to the tail of the buffer.
    #[inline]
    pub fn append(&mut self, src: &[u8]) {
        assert!(
            src.len() <= self.free_capacity(),
            "Buffer overflow: appending {} bytes to {}/{}",
            src.len(),
            self.len(),
            self.size
        );

        unsafe {
            self.data.tail_head_slice()[..src.len()].copy_from_slice(src);
            self.data.move_tail(src.len() as isize);
        }
    }

    /// Shifts the buffered data right and copies `src` at the head. Used to
    /// emit the IV in front of ciphertext that is already queued.
    pub fn prepend(&mut self, src: &[u8]) {
        assert!(
            src.len() <= self.free_capacity(),
            "Buffer overflow: prepending {} bytes to {}/{}",
            src.len(),
            self.len(),
            self.size
        );

        unsafe {
            for byte in &mut self.data.tail_head_slice()[..src.len()] {
                *byte = 0;
            }
            self.data.move_tail(src.len() as isize);
        }

        self.data.as_mut_slice().rotate_right(src.len());
        self.data.as_mut_slice()[..src.len()].copy_from_slice(src);
    }

    /// Removes the first `count` bytes from the buffer.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        assert!(
            count <= self.data.len(),
            "Buffer underflow: consuming {} bytes of {}",
            count,
            self.data.len()
        );

        unsafe { self.data.move_head(count as isize) }
    }

    /// Drops bytes from the tail until `len` remain. Used to retire bytes
    /// that were staged at the tail and have been moved to another buffer.
    #[inline]
    pub(crate) fn truncate(&mut self, len: usize) {
        assert!(
            len <= self.data.len(),
            "Buffer underflow: truncating to {} of {}",
            len,
            self.data.len()
        );

        self.data.truncate(len);
    }

    /// Reads up to `limit` bytes from the supplied reader into the tail of
    /// the buffer, stopping early when the reader would block. A reader that
    /// signals end-of-stream yields `UnexpectedEof`, which the error
    /// plumbing upstream folds into a peer-closed teardown.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R, limit: usize) -> io::Result<usize> {
        let mut total = 0;
        let max = cmp::min(limit, self.free_capacity());

        while total < max {
            let read = {
                let spare = unsafe { self.data.tail_head_slice() };
                let want = cmp::min(spare.len(), max - total);
                reader.read(&mut spare[..want])
            };

            match read {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(count) => {
                    unsafe { self.data.move_tail(count as isize) };
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }

    /// Writes the buffered data to the supplied writer, consuming exactly
    /// the bytes the writer accepted. Returns the number of bytes written;
    /// the caller detects a partial drain through `is_empty`.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0;

        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    unsafe { self.data.move_head(count as isize) };
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        pub fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        pub fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let offset = self
                .chunk
                .min(buf.len())
                .min(self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = self.chunk.min(buf.len()).min(self.max_size - self.data.len());
            self.data.extend(&buf[..count]);

            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            unimplemented!()
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..1024).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 100, mock_data.len());

        let mut buffer = Buffer::new(4096);

        let count = buffer.ingress(&mut channel, 4096).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert!(buffer.is_empty());
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_ingress_respects_limit() {
        let mock_data = vec![9u8; 100];
        let mut channel = MockChannel::new(mock_data, 7, 100);

        let mut buffer = Buffer::new(4096);
        let count = buffer.ingress(&mut channel, 10).unwrap();

        assert_eq!(count, 10);
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn test_ingress_eof() {
        let mut buffer = Buffer::new(64);

        let result = buffer.ingress(&[][..], 64);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_egress_partial_write() {
        let mut channel = MockChannel::new(Vec::new(), 8, 10);
        let mut buffer = Buffer::new(64);
        buffer.append(&[1; 30]);

        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, 10);
        assert_eq!(buffer.len(), 20);
        assert!(!buffer.is_empty());
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut zero_vec = vec![];

        let mut buffer = Buffer::new(64);
        buffer.append(&[1]);

        let result = buffer.egress(&mut zero_vec[..]);

        assert!(result.is_err());
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_fifo_order_through_ops() {
        let mut buffer = Buffer::new(16);

        buffer.append(&[1, 2, 3]);
        buffer.append(&[4, 5]);

        assert_eq!(buffer.read_slice(), &[1, 2, 3, 4, 5]);

        buffer.consume(2);
        assert_eq!(buffer.read_slice(), &[3, 4, 5]);

        buffer.append(&[6]);
        assert_eq!(buffer.read_slice(), &[3, 4, 5, 6]);
        assert_eq!(buffer.free_capacity(), 12);
    }

    #[test]
    fn test_prepend() {
        let mut buffer = Buffer::new(16);

        buffer.append(&[4, 5, 6]);
        buffer.prepend(&[1, 2, 3]);

        assert_eq!(buffer.read_slice(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_prepend_into_empty() {
        let mut buffer = Buffer::new(16);

        buffer.prepend(&[7, 8]);

        assert_eq!(buffer.read_slice(), &[7, 8]);
    }

    #[test]
    fn test_truncate_retires_tail() {
        let mut buffer = Buffer::new(16);

        buffer.append(&[1, 2, 3, 4, 5]);
        buffer.truncate(2);

        assert_eq!(buffer.read_slice(), &[1, 2]);
    }

    #[test]
    #[should_panic(expected = "Buffer overflow")]
    fn test_append_overflow_panics() {
        let mut buffer = Buffer::new(4);
        buffer.append(&[0; 5]);
    }

    #[test]
    #[should_panic(expected = "Buffer underflow")]
    fn test_consume_underflow_panics() {
        let mut buffer = Buffer::new(4);
        buffer.append(&[1, 2]);
        buffer.consume(3);
    }
}
