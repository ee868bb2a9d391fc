//! Shared handles and configuration values.
//!
//! The generic client owns a [`ClientConfig`]; the HTTP/2 engine runs with a
//! [`SessionConfig`]. The bridge (see [`crate::bridge`]) derives the latter
//! from the former so both sides share the same executor, scheduler and
//! buffer pool instances.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;

/// A boxed, owned future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs background tasks: exchange listener delivery, transport listener
/// notifications.
pub trait Executor: Send + Sync {
    fn execute(&self, task: BoxFuture<'static, ()>);
}

/// Produces timers for the engine (connect timeout).
pub trait Scheduler: Send + Sync {
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

/// An executor that spawns onto the ambient tokio runtime.
///
/// Must be used from within a tokio runtime context.
#[derive(Clone, Copy, Default, Debug)]
pub struct TokioExecutor;

impl Executor for TokioExecutor {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}

/// A scheduler backed by `tokio::time`.
#[derive(Clone, Copy, Default, Debug)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(delay))
    }
}

/// Default number of released buffers kept for reuse.
const DEFAULT_MAX_POOLED: usize = 64;

/// Pool of reusable byte buffers.
///
/// Buffers larger than `max_capacity` are not retained.
pub struct ByteBufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
    max_capacity: usize,
}

impl Default for ByteBufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POOLED, 64 * 1024)
    }
}

impl ByteBufferPool {
    pub fn new(max_pooled: usize, max_capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_pooled,
            max_capacity,
        }
    }

    /// Take an empty buffer with at least `capacity` bytes reserved.
    pub fn acquire(&self, capacity: usize) -> BytesMut {
        let pooled = self.buffers.lock().unwrap().pop();
        match pooled {
            Some(mut buf) => {
                buf.reserve(capacity);
                buf
            }
            None => BytesMut::with_capacity(capacity),
        }
    }

    /// Return a buffer to the pool. Its contents are discarded.
    pub fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > self.max_capacity {
            return;
        }
        buf.clear();
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    /// Number of buffers currently held for reuse.
    pub fn pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

impl fmt::Debug for ByteBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBufferPool")
            .field("pooled", &self.pooled())
            .field("max_pooled", &self.max_pooled)
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}

/// Configuration of the generic HTTP client.
#[derive(Clone)]
pub struct ClientConfig {
    /// Executor for listener callbacks.
    pub executor: Arc<dyn Executor>,
    /// Timer source.
    pub scheduler: Arc<dyn Scheduler>,
    /// Buffer pool for response content.
    pub buffer_pool: Arc<ByteBufferPool>,
    /// Maximum time to establish a session.
    pub connect_timeout: Duration,
    /// Idle time after which the engine may close a session.
    pub idle_timeout: Duration,
    /// Requests waiting for a free stream, per destination.
    pub max_requests_queued_per_destination: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            executor: Arc::new(TokioExecutor),
            scheduler: Arc::new(TokioScheduler),
            buffer_pool: Arc::new(ByteBufferPool::default()),
            connect_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(30),
            max_requests_queued_per_destination: 1024,
        }
    }
}

impl ClientConfig {
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn buffer_pool(mut self, buffer_pool: Arc<ByteBufferPool>) -> Self {
        self.buffer_pool = buffer_pool;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_requests_queued_per_destination(mut self, max: usize) -> Self {
        self.max_requests_queued_per_destination = max;
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field(
                "max_requests_queued_per_destination",
                &self.max_requests_queued_per_destination,
            )
            .finish_non_exhaustive()
    }
}

/// Configuration the HTTP/2 engine runs with.
#[derive(Clone)]
pub struct SessionConfig {
    pub executor: Arc<dyn Executor>,
    pub scheduler: Arc<dyn Scheduler>,
    pub buffer_pool: Arc<ByteBufferPool>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl SessionConfig {
    /// Name of the first field that differs from `other`, if any.
    ///
    /// Handles compare by identity, durations by value.
    pub fn mismatch(&self, other: &SessionConfig) -> Option<&'static str> {
        if !Arc::ptr_eq(&self.executor, &other.executor) {
            return Some("executor");
        }
        if !Arc::ptr_eq(&self.scheduler, &other.scheduler) {
            return Some("scheduler");
        }
        if !Arc::ptr_eq(&self.buffer_pool, &other.buffer_pool) {
            return Some("buffer pool");
        }
        if self.connect_timeout != other.connect_timeout {
            return Some("connect timeout");
        }
        if self.idle_timeout != other.idle_timeout {
            return Some("idle timeout");
        }
        None
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_released_buffers() {
        let pool = ByteBufferPool::new(2, 1024);
        let mut buf = pool.acquire(16);
        buf.extend_from_slice(b"hello");
        pool.release(buf);
        assert_eq!(pool.pooled(), 1);

        let buf = pool.acquire(16);
        assert!(buf.is_empty());
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn pool_drops_oversized_buffers() {
        let pool = ByteBufferPool::new(2, 8);
        pool.release(BytesMut::with_capacity(64));
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn mismatch_compares_handles_by_identity() {
        let a = SessionConfig {
            executor: Arc::new(TokioExecutor),
            scheduler: Arc::new(TokioScheduler),
            buffer_pool: Arc::new(ByteBufferPool::default()),
            connect_timeout: Duration::from_millis(13),
            idle_timeout: Duration::from_millis(17),
        };
        let b = a.clone();
        assert_eq!(a.mismatch(&b), None);

        let c = SessionConfig {
            buffer_pool: Arc::new(ByteBufferPool::default()),
            ..a.clone()
        };
        assert_eq!(a.mismatch(&c), Some("buffer pool"));

        let d = SessionConfig {
            idle_timeout: Duration::from_millis(18),
            ..a.clone()
        };
        assert_eq!(a.mismatch(&d), Some("idle timeout"));
    }
}
