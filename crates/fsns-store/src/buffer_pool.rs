//! Shared pool of large I/O buffers, bounded by a counting semaphore.
//!
//! Readers borrow one buffer per in-flight chunk; uploads hold a single
//! buffer across the whole streaming write, which doubles as their admission
//! slot. Acquisition blocks under pressure and times out with a retryable
//! stream-timeout error.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fsns_common::error::{FsError, Result};
use fsns_common::FsConfig;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

#[derive(Debug)]
struct PoolInner {
    semaphore: Arc<Semaphore>,
    free: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
    timeout: Duration,
    warn_after: Duration,
}

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(config: &FsConfig) -> Self {
        let count = (config.buf_pool_mem_limit / config.buf_size).max(1);
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(count)),
                free: Mutex::new(Vec::new()),
                buf_size: config.buf_size,
                timeout: Duration::from_millis(config.buf_pool_timeout_ms),
                warn_after: Duration::from_millis(config.buf_pool_warn_ms),
            }),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.inner.buf_size
    }

    /// Borrows one buffer. The permit is part of the returned guard, so the
    /// slot frees exactly when the buffer drops back into the pool.
    pub async fn acquire(&self) -> Result<PooledBuf> {
        let started = std::time::Instant::now();
        let acquired = tokio::time::timeout(
            self.inner.timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await;
        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return Err(FsError::Internal("buffer pool closed".to_string()));
            }
            Err(_elapsed) => return Err(FsError::StreamTimeout),
        };
        let waited = started.elapsed();
        if waited >= self.inner.warn_after {
            warn!(waited_ms = waited.as_millis() as u64, "buffer pool under pressure");
        }

        let buf = {
            let mut free = self.inner.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()
        }
        .unwrap_or_else(|| vec![0u8; self.inner.buf_size]);

        Ok(PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }
}

/// A borrowed pool buffer. Dropping it returns the memory to the free list
/// and releases the semaphore slot, on every exit path.
#[derive(Debug)]
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let mut free = self.pool.free.lock().unwrap_or_else(|e| e.into_inner());
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(count: usize, timeout_ms: u64) -> BufferPool {
        BufferPool::new(&FsConfig {
            buf_size: 1024,
            buf_pool_mem_limit: 1024 * count,
            buf_pool_timeout_ms: timeout_ms,
            ..FsConfig::default()
        })
    }

    #[tokio::test]
    async fn exhausted_pool_times_out_with_stream_timeout() {
        let pool = small_pool(1, 50);
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, FsError::StreamTimeout));
        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn buffers_are_reused_after_release() {
        let pool = small_pool(2, 1000);
        {
            let mut a = pool.acquire().await.unwrap();
            a[0] = 0xAB;
        }
        let b = pool.acquire().await.unwrap();
        assert_eq!(b.len(), 1024);
    }
}
