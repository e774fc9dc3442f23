//! Fixed pre-allocated circular buffer between the device callback and the
//! analysis thread. When the reader falls behind, the oldest samples are
//! overwritten and counted as dropped.

/// Fixed-size ring buffer for PCM i16 samples. Never grows.
pub struct RingBuffer {
    buffer: Box<[i16]>,
    write_pos: usize,
    read_pos: usize,
    len: usize,
    dropped: u64,
}

impl RingBuffer {
    /// Ring buffer sized for `duration_secs` at `sample_rate` Hz, mono.
    pub fn new(sample_rate: u32, duration_secs: f32) -> Self {
        Self::with_capacity((sample_rate as f32 * duration_secs) as usize)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0i16; capacity.max(1)].into_boxed_slice(),
            write_pos: 0,
            read_pos: 0,
            len: 0,
            dropped: 0,
        }
    }

    /// Write samples, overwriting the oldest unread ones if full.
    /// Called from the device callback: no allocation.
    #[inline]
    pub fn write(&mut self, samples: &[i16]) {
        let capacity = self.buffer.len();
        for &s in samples {
            self.buffer[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % capacity;
            if self.len == capacity {
                self.read_pos = (self.read_pos + 1) % capacity;
                self.dropped += 1;
            } else {
                self.len += 1;
            }
        }
    }

    /// Read up to `output.len()` samples. Returns the number read.
    #[inline]
    pub fn read(&mut self, output: &mut [i16]) -> usize {
        let capacity = self.buffer.len();
        let to_read = output.len().min(self.len);
        for slot in output.iter_mut().take(to_read) {
            *slot = self.buffer[self.read_pos];
            self.read_pos = (self.read_pos + 1) % capacity;
        }
        self.len -= to_read;
        to_read
    }

    /// Number of unread samples available.
    #[inline]
    pub fn available(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Samples overwritten before they were read.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Discard unread data.
    pub fn reset_read(&mut self) {
        self.read_pos = self.write_pos;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sized_from_rate_and_duration() {
        let rb = RingBuffer::new(16000, 1.0);
        assert_eq!(rb.capacity(), 16000);
        assert_eq!(rb.available(), 0);
    }

    #[test]
    fn reads_back_in_order_across_wrap() {
        let mut rb = RingBuffer::with_capacity(8);
        rb.write(&[1, 2, 3, 4, 5, 6]);
        let mut out = [0i16; 4];
        assert_eq!(rb.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        rb.write(&[7, 8, 9, 10]);
        let mut out = [0i16; 8];
        assert_eq!(rb.read(&mut out), 6);
        assert_eq!(&out[..6], &[5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn overrun_drops_oldest() {
        let mut rb = RingBuffer::with_capacity(4);
        rb.write(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(rb.available(), 4);
        assert_eq!(rb.dropped(), 2);
        let mut out = [0i16; 4];
        rb.read(&mut out);
        assert_eq!(out, [3, 4, 5, 6]);
    }

    #[test]
    fn reset_read_discards_pending() {
        let mut rb = RingBuffer::with_capacity(4);
        rb.write(&[1, 2, 3]);
        rb.reset_read();
        assert_eq!(rb.available(), 0);
        rb.write(&[9]);
        let mut out = [0i16; 1];
        rb.read(&mut out);
        assert_eq!(out, [9]);
    }
}
