//! Fixed-size buffer pool for the assembly pipeline.

use std::sync::{Condvar, Mutex};

/// Lends out equally-sized byte buffers with explicit acquire/release.
/// `acquire` blocks until a buffer is free, so the pool also bounds how much
/// memory the pipeline can hold at once.
pub struct BufferPool {
    buffer_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    available: Condvar,
}

impl BufferPool {
    /// Pool of `count` buffers of `buffer_size` bytes each.
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let free = (0..count.max(1))
            .map(|_| vec![0u8; buffer_size])
            .collect();
        Self {
            buffer_size,
            free: Mutex::new(free),
            available: Condvar::new(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a buffer, blocking until one is returned if all are lent out.
    pub fn acquire(&self) -> Vec<u8> {
        let mut free = self.free.lock().expect("buffer pool poisoned");
        loop {
            if let Some(buf) = free.pop() {
                return buf;
            }
            free = self.available.wait(free).expect("buffer pool poisoned");
        }
    }

    /// Return a buffer to the pool. Buffers must not outlive the task that
    /// acquired them; returning a foreign buffer of the wrong size is a bug.
    pub fn release(&self, mut buf: Vec<u8>) {
        debug_assert!(buf.capacity() >= self.buffer_size);
        buf.resize(self.buffer_size, 0);
        let mut free = self.free.lock().expect("buffer pool poisoned");
        free.push(buf);
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn acquire_release_cycles() {
        let pool = BufferPool::new(2, 1024);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(a.len(), 1024);
        assert_eq!(b.len(), 1024);
        pool.release(a);
        let c = pool.acquire();
        assert_eq!(c.len(), 1024);
        pool.release(b);
        pool.release(c);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = Arc::new(BufferPool::new(1, 64));
        let held = pool.acquire();

        let pool2 = Arc::clone(&pool);
        let waiter = std::thread::spawn(move || {
            let buf = pool2.acquire();
            pool2.release(buf);
        });

        // The waiter cannot finish while the only buffer is held.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        pool.release(held);
        waiter.join().unwrap();
    }
}
