//! Bounded ring buffer between download loops and the player-facing reader.
//!
//! One producer thread writes decoded-for-transport bytes, one consumer
//! thread reads them. The buffer tracks the absolute media offset of its
//! oldest byte so short backward/forward seeks can be served without
//! touching the network.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Upper bound on one read wait cycle; keeps reads bounded even when the
/// producer has gone quiet without deactivating the buffer.
const READ_WAIT_CYCLE: Duration = Duration::from_millis(100);

struct Inner {
    buf: Box<[u8]>,
    /// Monotonic read cursor. `head <= tail` and `tail - head <= capacity`.
    head: u64,
    /// Monotonic write cursor.
    tail: u64,
    /// Absolute media offset of the byte at `head`. Adopted from the
    /// first write after (re)initialization.
    media_offset: u64,
    active: bool,
}

impl Inner {
    fn size(&self) -> usize {
        (self.tail - self.head) as usize
    }
}

pub struct RingBuffer {
    inner: Mutex<Inner>,
    readable: Condvar,
    writable: Condvar,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                media_offset: 0,
                active: true,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    /// Appends `data`, blocking while the buffer is full.
    ///
    /// `media_offset` is the absolute offset of `data[0]` in the media
    /// stream; it is adopted as the buffer's origin on the first write
    /// after construction, [`clear`], or deactivation, and ignored on
    /// subsequent writes (data is assumed contiguous).
    ///
    /// Returns `false` if the buffer was (or became) inactive, in which
    /// case a prefix of `data` may have been written.
    ///
    /// [`clear`]: RingBuffer::clear
    pub fn write(&self, data: &[u8], media_offset: u64) -> bool {
        let mut guard = self.inner.lock();
        if !guard.active {
            return false;
        }
        if guard.head == 0 && guard.tail == 0 {
            guard.media_offset = media_offset;
        }

        let capacity = guard.buf.len();
        let mut written = 0;
        while written < data.len() {
            while guard.active && guard.size() == capacity {
                self.writable.wait(&mut guard);
            }
            if !guard.active {
                return false;
            }

            let n = (capacity - guard.size()).min(data.len() - written);
            let inner = &mut *guard;
            let idx = (inner.tail % capacity as u64) as usize;
            let chunk = &data[written..written + n];
            let first = (capacity - idx).min(n);
            inner.buf[idx..idx + first].copy_from_slice(&chunk[..first]);
            if first < n {
                inner.buf[..n - first].copy_from_slice(&chunk[first..]);
            }
            inner.tail += n as u64;
            written += n;
            self.readable.notify_all();
        }
        true
    }

    /// Reads up to `out.len()` bytes.
    ///
    /// When the buffer is empty, waits through at most `wait_cycles`
    /// bounded wait cycles for data to arrive; returns 0 if none did or
    /// the buffer is inactive. A partial read returns whatever is
    /// available without waiting for more.
    pub fn read(&self, out: &mut [u8], wait_cycles: u32) -> usize {
        let mut guard = self.inner.lock();
        let mut cycles = wait_cycles;
        while guard.active && guard.size() == 0 && cycles > 0 {
            self.readable.wait_for(&mut guard, READ_WAIT_CYCLE);
            cycles -= 1;
        }

        let n = guard.size().min(out.len());
        if n == 0 {
            return 0;
        }

        let capacity = guard.buf.len();
        let inner = &mut *guard;
        let idx = (inner.head % capacity as u64) as usize;
        let first = (capacity - idx).min(n);
        out[..first].copy_from_slice(&inner.buf[idx..idx + first]);
        if first < n {
            out[first..n].copy_from_slice(&inner.buf[..n - first]);
        }
        inner.head += n as u64;
        inner.media_offset += n as u64;
        self.writable.notify_all();
        n
    }

    /// Moves the read cursor to absolute media offset `offset` if that
    /// byte is currently buffered. Returns `false` (leaving the buffer
    /// untouched) when the offset is outside the buffered window; the
    /// caller then has to refill from the network.
    pub fn seek(&self, offset: u64) -> bool {
        let mut guard = self.inner.lock();
        let size = guard.size() as u64;
        if offset < guard.media_offset || offset >= guard.media_offset + size {
            return false;
        }
        let delta = offset - guard.media_offset;
        guard.head += delta;
        guard.media_offset = offset;
        self.writable.notify_all();
        true
    }

    /// Drops all buffered bytes and resets the media origin; the next
    /// write establishes a new one. The buffer stays active.
    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.head = 0;
        guard.tail = 0;
        guard.media_offset = 0;
        self.writable.notify_all();
    }

    /// Activates or deactivates the buffer. Deactivation drops all
    /// buffered bytes and wakes every blocked reader and writer, which
    /// then observe the inactive state and back out.
    pub fn set_active(&self, active: bool) {
        let mut guard = self.inner.lock();
        guard.active = active;
        if !active {
            guard.head = 0;
            guard.tail = 0;
            guard.media_offset = 0;
        }
        self.readable.notify_all();
        self.writable.notify_all();
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Buffered byte count.
    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().buf.len()
    }

    /// Absolute media offset of the oldest buffered byte.
    pub fn media_offset(&self) -> u64 {
        self.inner.lock().media_offset
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn write_then_read_round_trips() {
        let ring = RingBuffer::new(16);
        assert!(ring.write(b"hello", 100));
        assert_eq!(ring.media_offset(), 100);
        assert_eq!(ring.size(), 5);

        let mut out = [0u8; 8];
        let n = ring.read(&mut out, 0);
        assert_eq!(&out[..n], b"hello");
        assert_eq!(ring.media_offset(), 105);
        assert!(ring.is_empty());
    }

    #[test]
    fn read_on_empty_buffer_returns_zero_without_data() {
        let ring = RingBuffer::new(16);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out, 0), 0);
    }

    #[test]
    fn wraparound_preserves_byte_order() {
        let ring = RingBuffer::new(8);
        assert!(ring.write(b"abcdef", 0));
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out, 0), 4);
        assert_eq!(&out, b"abcd");
        // tail wraps past the end of the backing slice here
        assert!(ring.write(b"ghij", 0));
        let mut rest = [0u8; 6];
        let n = ring.read(&mut rest, 0);
        assert_eq!(&rest[..n], b"efghij");
    }

    #[test]
    fn full_buffer_blocks_writer_until_reader_drains() {
        let ring = Arc::new(RingBuffer::new(4));
        assert!(ring.write(b"aaaa", 0));

        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.write(b"bb", 0))
        };
        // give the writer time to block on the full buffer
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ring.size(), 4);

        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out, 0), 4);
        assert!(writer.join().unwrap());
        assert_eq!(ring.size(), 2);
    }

    #[test]
    fn deactivation_wakes_blocked_writer() {
        let ring = Arc::new(RingBuffer::new(4));
        assert!(ring.write(b"aaaa", 0));

        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.write(b"bb", 0))
        };
        thread::sleep(Duration::from_millis(50));
        ring.set_active(false);
        assert!(!writer.join().unwrap());
        assert!(ring.is_empty());
    }

    #[test]
    fn deactivation_wakes_blocked_reader() {
        let ring = Arc::new(RingBuffer::new(4));
        let reader = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut out = [0u8; 4];
                ring.read(&mut out, u32::MAX)
            })
        };
        thread::sleep(Duration::from_millis(50));
        ring.set_active(false);
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn seek_within_buffered_window() {
        let ring = RingBuffer::new(16);
        ring.write(b"0123456789", 1000);
        assert!(ring.seek(1004));
        assert_eq!(ring.media_offset(), 1004);
        let mut out = [0u8; 3];
        ring.read(&mut out, 0);
        assert_eq!(&out, b"456");
    }

    #[test]
    fn seek_outside_window_fails_and_preserves_state() {
        let ring = RingBuffer::new(16);
        ring.write(b"0123456789", 1000);
        assert!(!ring.seek(999));
        assert!(!ring.seek(1010)); // one past the last buffered byte
        assert_eq!(ring.media_offset(), 1000);
        assert_eq!(ring.size(), 10);
    }

    #[test]
    fn seek_on_empty_buffer_fails() {
        let ring = RingBuffer::new(16);
        assert!(!ring.seek(0));
    }

    #[test]
    fn size_never_exceeds_capacity_under_interleaving() {
        let ring = RingBuffer::new(8);
        let mut written = 0u8;
        let mut expected = std::collections::VecDeque::new();
        let mut out = [0u8; 3];
        for round in 0..200 {
            if round % 3 != 2 {
                let chunk = [written, written.wrapping_add(1)];
                written = written.wrapping_add(2);
                assert!(ring.write(&chunk, 0));
                expected.extend(chunk);
            } else {
                let n = ring.read(&mut out, 0);
                for b in &out[..n] {
                    assert_eq!(Some(*b), expected.pop_front());
                }
            }
            assert!(ring.size() <= ring.capacity());
            assert_eq!(ring.size(), expected.len().min(8));
            // keep headroom so the next two-byte write cannot block
            while ring.size() > 6 {
                let n = ring.read(&mut out, 0);
                for b in &out[..n] {
                    assert_eq!(Some(*b), expected.pop_front());
                }
            }
        }
    }

    #[test]
    fn clear_adopts_new_origin_on_next_write() {
        let ring = RingBuffer::new(16);
        ring.write(b"abc", 0);
        ring.clear();
        assert!(ring.is_empty());
        ring.write(b"xyz", 5000);
        assert_eq!(ring.media_offset(), 5000);
    }

    #[test]
    fn write_larger_than_capacity_streams_through() {
        let ring = Arc::new(RingBuffer::new(8));
        let data: Vec<u8> = (0..64u8).collect();
        let writer = {
            let ring = Arc::clone(&ring);
            let data = data.clone();
            thread::spawn(move || ring.write(&data, 0))
        };

        let mut collected = Vec::new();
        let mut out = [0u8; 8];
        while collected.len() < data.len() {
            let n = ring.read(&mut out, u32::MAX);
            assert!(n > 0);
            collected.extend_from_slice(&out[..n]);
        }
        assert!(writer.join().unwrap());
        assert_eq!(collected, data);
    }
}
