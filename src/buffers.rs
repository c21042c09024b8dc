//! Reusable fixed-length buffers for serialized MADs. Their main purpose is
//!  to minimize allocation on the hot send and reassembly paths.

use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};
use std::sync::Mutex;

use bytes::buf::UninitSlice;
use tracing::{debug, trace};

/// A fixed-length dynamically allocated buffer. Reassembly buffers can grow
///  in place when the remote announces a longer transfer than initially
///  provisioned for.
#[derive(Eq)]
pub struct MadBuf {
    buf: Vec<u8>,
    len: usize,
}
impl MadBuf {
    pub fn new(capacity: usize) -> MadBuf {
        MadBuf {
            // buffers are reused aggressively, so we trade the overhead of
            //  initial zeroing for simplicity
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Extends the underlying storage, keeping already written bytes. A
    ///  no-op if the buffer is already at least that big.
    pub fn grow(&mut self, new_capacity: usize) {
        if new_capacity > self.buf.len() {
            self.buf.resize(new_capacity, 0);
        }
    }

    /// This is a convenience function for test code. It derives the buffer's
    ///  capacity from the slice used for initialization, which is a shortcut
    ///  not intended for production usage.
    #[cfg(test)]
    pub fn from_slice(capacity: usize, data: &[u8]) -> MadBuf {
        let mut result = MadBuf::new(capacity);
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for MadBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for MadBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for MadBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for MadBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
impl AsMut<[u8]> for MadBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for MadBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}

/// A pool of MAD-sized buffers for the send path, allocating lazily and
///  bounded in how many buffers it retains.
pub struct MadBufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<MadBuf>>,
}

impl MadBufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> MadBufferPool {
        MadBufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self) -> MadBuf {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        MadBuf::new(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: MadBuf) {
        if buffer.capacity() != self.buf_size {
            // grown reassembly buffers are not pooled
            debug!("discarding buffer with irregular capacity {}", buffer.capacity());
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}
