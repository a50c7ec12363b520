//! Bounded byte buffer between the tuner receiver callback and the
//! streamer task. The receiver side must never block; overflowing data is
//! dropped and counted so the streamer can report it.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct RingInner {
    capacity: usize,
    buffer: Mutex<BytesMut>,
    notify: Notify,
    dropped: AtomicU64,
}

/// TS byte ring, sized for roughly 10 MiB of transport stream and kept
/// aligned to whole packets by the consumer.
#[derive(Clone)]
pub struct PacketRing {
    inner: Arc<RingInner>,
}

impl PacketRing {
    /// Default ring capacity (~10 MiB, a whole number of TS packets).
    pub const DEFAULT_CAPACITY: usize = 10 * 1024 * 1024 / 188 * 188;

    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RingInner {
                capacity,
                buffer: Mutex::new(BytesMut::new()),
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Non-blocking put from the receiver callback. Returns the number of
    /// bytes accepted; the rest is dropped and counted.
    pub fn put(&self, data: &[u8]) -> usize {
        let mut buffer = self.inner.buffer.lock();

        let room = self.inner.capacity.saturating_sub(buffer.len());
        let accepted = room.min(data.len());

        buffer.extend_from_slice(&data[..accepted]);
        drop(buffer);

        let overflow = data.len() - accepted;
        if overflow > 0 {
            self.inner.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
            log::error!("receiver ring overflow, dropped {} bytes", overflow);
        }

        if accepted > 0 {
            self.inner.notify.notify_one();
        }
        accepted
    }

    /// Take all buffered bytes, waiting up to `timeout` for data.
    pub async fn take(&self, timeout: Duration) -> Option<Bytes> {
        loop {
            {
                let mut buffer = self.inner.buffer.lock();
                if !buffer.is_empty() {
                    return Some(buffer.split().freeze());
                }
            }

            let notified = self.inner.notify.notified();
            if tokio::time::timeout(timeout, notified).await.is_err() {
                return None;
            }
        }
    }

    pub fn clear(&self) {
        self.inner.buffer.lock().clear();
    }

    /// Total bytes dropped on overflow since creation.
    pub fn dropped_bytes(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_take() {
        let ring = PacketRing::new(1024);
        assert_eq!(ring.put(&[1, 2, 3]), 3);

        let data = ring.take(Duration::from_millis(10)).await.unwrap();
        assert_eq!(&data[..], &[1, 2, 3]);

        // empty ring times out
        assert!(ring.take(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_overflow_is_counted() {
        let ring = PacketRing::new(4);
        assert_eq!(ring.put(&[0; 10]), 4);
        assert_eq!(ring.dropped_bytes(), 6);
    }
}
