//! Reuse pools for message structures and receive buffers

use crate::dns::message::Message;
use parking_lot::Mutex;

/// Receive-buffer size buckets.
pub const BUF_SIZES: [usize; 4] = [512, 1232, 4096, 65535];

/// Free list of reset messages.
pub struct MessagePool {
    free: Mutex<Vec<Box<Message>>>,
    cap: usize,
}

impl MessagePool {
    pub fn new(cap: usize) -> Self {
        MessagePool {
            free: Mutex::new(Vec::new()),
            cap,
        }
    }

    pub fn acquire(&self) -> Box<Message> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(Message::new()))
    }

    /// Return a message; it is reset before it can be handed out again.
    pub fn release(&self, mut msg: Box<Message>) {
        msg.reset();
        let mut free = self.free.lock();
        if free.len() < self.cap {
            free.push(msg);
        }
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        MessagePool::new(1024)
    }
}

/// Size-bucketed byte-buffer pool for network reads.
pub struct BufferPool {
    buckets: [Mutex<Vec<Vec<u8>>>; BUF_SIZES.len()],
    per_bucket_cap: usize,
}

impl BufferPool {
    pub fn new(per_bucket_cap: usize) -> Self {
        BufferPool {
            buckets: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
            per_bucket_cap,
        }
    }

    fn bucket_for(size: usize) -> usize {
        BUF_SIZES
            .iter()
            .position(|&s| size <= s)
            .unwrap_or(BUF_SIZES.len() - 1)
    }

    /// A zero-filled buffer of at least `size` bytes, from the smallest
    /// bucket that fits.
    pub fn acquire(&self, size: usize) -> Vec<u8> {
        let idx = Self::bucket_for(size);
        let mut buf = self
            .buckets[idx]
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUF_SIZES[idx]]);
        buf.resize(BUF_SIZES[idx], 0);
        buf
    }

    pub fn release(&self, buf: Vec<u8>) {
        let idx = match BUF_SIZES.iter().position(|&s| buf.capacity() >= s) {
            Some(_) => Self::bucket_for(buf.capacity()),
            None => return,
        };
        if buf.capacity() < BUF_SIZES[idx] {
            return;
        }
        let mut bucket = self.buckets[idx].lock();
        if bucket.len() < self.per_bucket_cap {
            bucket.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(64)
    }
}
