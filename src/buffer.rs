//! Streaming byte buffer backing connection I/O.
//!
//! The backing storage is split by two cursors into a prepend area, a
//! readable payload and writable space:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0            read_index         write_index        capacity
//! ```
//!
//! Appends go to the back, consumption moves `read_index` forward, and the
//! prepend area lets a length header be stamped in front of already-encoded
//! payload without moving it.

use std::io;
use std::os::unix::io::RawFd;

use crate::sys::syscall;

/// Space reserved in front of the payload for cheap prepends.
pub const CHEAP_PREPEND: usize = 8;
/// Initial writable capacity.
pub const INITIAL_SIZE: usize = 1024;

pub struct Buffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self { Buffer::new() }
}

impl Buffer {
    pub fn new() -> Self { Buffer::with_capacity(INITIAL_SIZE) }

    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            data: vec![0; CHEAP_PREPEND + initial],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize { self.write_index - self.read_index }

    pub fn writable_bytes(&self) -> usize { self.data.len() - self.write_index }

    pub fn prependable_bytes(&self) -> usize { self.read_index }

    /// The readable payload, without consuming it.
    pub fn peek(&self) -> &[u8] { &self.data[self.read_index..self.write_index] }

    /// Consumes `len` bytes from the front of the payload.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes everything and resets both cursors to the prepend baseline.
    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        assert!(len <= self.readable_bytes());
        let s = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        s
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Guarantees `len` contiguous writable bytes, compacting or growing.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.write_index..self.write_index + bytes.len()].copy_from_slice(bytes);
        self.write_index += bytes.len();
    }

    /// Writes into the prepend area, moving `read_index` backwards.
    pub fn prepend(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.prependable_bytes());
        self.read_index -= bytes.len();
        self.data[self.read_index..self.read_index + bytes.len()].copy_from_slice(bytes);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.data.resize(self.write_index + len, 0);
        } else {
            // Enough room overall; shift the payload back to the baseline.
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = CHEAP_PREPEND + readable;
        }
    }

    /// Drains a readable descriptor into the buffer with a single vectored
    /// read. The second iovec points at a stack scratch region, so most
    /// messages are consumed in one syscall without growing the buffer
    /// up-front; scratch overflow is appended (growing the buffer) after the
    /// fact.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.data[self.write_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        // When the buffer already has plenty of room the scratch region is
        // left out, capping a single read at the writable size.
        let iovcnt = if writable < extra.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, iov.as_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.data.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn append_retrieve_round_trip() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        buf.append(b"hello, ");
        buf.append(b"world");
        assert_eq!(buf.readable_bytes(), 12);
        assert_eq!(buf.peek(), b"hello, world");

        assert_eq!(buf.retrieve_as_string(7), "hello, ");
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 7);

        assert_eq!(buf.retrieve_all_as_string(), "world");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn interleaved_appends_keep_order() {
        let mut buf = Buffer::new();
        let mut expected = Vec::new();
        for i in 0..50u8 {
            let chunk = vec![i; (i as usize % 7) + 1];
            expected.extend_from_slice(&chunk);
            buf.append(&chunk);
            if i % 3 == 0 {
                let take = buf.readable_bytes() / 2;
                assert_eq!(buf.peek()[..take], expected[..take]);
                buf.retrieve(take);
                expected.drain(..take);
            }
        }
        assert_eq!(buf.peek(), &expected[..]);
    }

    #[test]
    fn grows_when_payload_exceeds_capacity() {
        let mut buf = Buffer::new();
        buf.append(&[b'x'; 400]);
        buf.append(&[b'y'; 1000]);
        assert_eq!(buf.readable_bytes(), 1400);
        assert_eq!(&buf.peek()[399..401], b"xy");
    }

    #[test]
    fn compacts_instead_of_growing() {
        let mut buf = Buffer::new();
        buf.append(&[b'a'; 800]);
        buf.retrieve(700);
        // 100 readable; front space suffices for 1000 more without resizing.
        let capacity_before = buf.data.len();
        buf.append(&[b'b'; 1000]);
        assert_eq!(buf.data.len(), capacity_before);
        assert_eq!(buf.readable_bytes(), 1100);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(&buf.peek()[..100], &[b'a'; 100][..]);
    }

    #[test]
    fn prepend_writes_in_front() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(&buf.peek()[..4], &7u32.to_be_bytes());
        assert_eq!(&buf.peek()[4..], b"payload");
    }

    #[test]
    fn read_fd_small_message() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"ping").unwrap();
        let mut buf = Buffer::new();
        let n = buf.read_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf.peek(), b"ping");
    }

    #[test]
    fn read_fd_overflows_into_scratch() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let payload = vec![b'z'; 3000];
        tx.write_all(&payload).unwrap();
        let mut buf = Buffer::new();
        let n = buf.read_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, 3000);
        assert_eq!(buf.readable_bytes(), 3000);
        assert_eq!(buf.peek(), &payload[..]);
    }
}
