//! Connection pool for transports that support reuse.
//!
//! Keyed by destination string (`host:port`). Bounded per destination;
//! returning a connection to a full bucket drops it. Idle entries expire.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::Stream;

use super::connection::Recycler;

/// Idle timeout for pooled connections.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Max pooled connections per destination.
const DEFAULT_MAX_PER_DEST: usize = 4;

struct PooledStream {
    stream: Stream,
    stored_at: Instant,
}

/// Pool of idle, still-usable streams awaiting their next session.
pub struct ConnectionPool {
    idle_timeout: Duration,
    max_per_dest: usize,
    buckets: Mutex<HashMap<String, Vec<PooledStream>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_per_dest: DEFAULT_MAX_PER_DEST,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take an idle stream for `dest`, discarding expired entries.
    pub fn get(&self, dest: &str) -> Option<Stream> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.get_mut(dest)?;
        bucket.retain(|c| c.stored_at.elapsed() <= self.idle_timeout);
        let pooled = bucket.pop();
        if pooled.is_some() {
            debug!("pool: reusing connection to {}", dest);
        } else {
            trace!("pool: no idle connection for {}", dest);
        }
        pooled.map(|c| c.stream)
    }

    /// Return a stream to the pool; dropped when the bucket is full.
    pub fn put(&self, dest: &str, stream: Stream) {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(dest.to_string()).or_default();
        if bucket.len() >= self.max_per_dest {
            debug!("pool: bucket for {} full, dropping connection", dest);
            return;
        }
        bucket.push(PooledStream {
            stream,
            stored_at: Instant::now(),
        });
    }

    /// Number of idle streams currently pooled for `dest`.
    pub fn idle_count(&self, dest: &str) -> usize {
        self.buckets.lock().get(dest).map_or(0, |b| b.len())
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Recycler for ConnectionPool {
    fn recycle(&self, dest: &str, stream: Stream) {
        self.put(dest, stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IntoStream;

    fn test_stream() -> Stream {
        let (near, far) = tokio::io::duplex(64);
        std::mem::forget(far);
        near.into_stream()
    }

    #[tokio::test]
    async fn test_get_empty_pool() {
        let pool = ConnectionPool::new();
        assert!(pool.get("example.com:80").is_none());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let pool = ConnectionPool::new();
        pool.put("example.com:80", test_stream());
        assert_eq!(pool.idle_count("example.com:80"), 1);
        assert!(pool.get("example.com:80").is_some());
        assert!(pool.get("example.com:80").is_none());
    }

    #[tokio::test]
    async fn test_over_capacity_put_drops() {
        let pool = ConnectionPool::new();
        for _ in 0..DEFAULT_MAX_PER_DEST + 3 {
            pool.put("example.com:80", test_stream());
        }
        assert_eq!(pool.idle_count("example.com:80"), DEFAULT_MAX_PER_DEST);
    }
}
