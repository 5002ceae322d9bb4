//! Byte accounting for outbound queues
//!
//! Senders never block: `push` always succeeds so frames keep their order.
//! Producers that can wait call [`Backlog::writable`] before reading more,
//! which holds them while more than `limit` bytes are queued. Each producer
//! overshoots by at most the chunk it already read.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Bytes a socket may queue before its feeders wait (1 MiB)
pub const SOCKET_HIGH_WATER: usize = 1024 * 1024;
/// Bytes a peer session may queue before its feeders wait (4 MiB)
pub const SESSION_HIGH_WATER: usize = 4 * 1024 * 1024;

#[derive(Debug)]
pub struct Backlog {
    queued: AtomicUsize,
    limit: usize,
    closed: AtomicBool,
    drained: Notify,
}

impl Backlog {
    pub fn new(limit: usize) -> Self {
        Self {
            queued: AtomicUsize::new(0),
            limit,
            closed: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    pub fn push(&self, bytes: usize) {
        self.queued.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Account for bytes handed to the OS
    pub fn pop(&self, bytes: usize) {
        let before = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| Some(q.saturating_sub(bytes)))
            .unwrap_or(0);
        if before.saturating_sub(bytes) <= self.limit {
            self.drained.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() > self.limit
    }

    /// Release every waiter for good
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.drained.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until the queue is at or below its limit, or closed
    pub async fn writable(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_full() || self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_writable_waits_for_drain() {
        let backlog = Arc::new(Backlog::new(10));
        backlog.push(8);
        backlog.writable().await;

        backlog.push(8);
        assert!(backlog.is_full());
        let waiter = tokio::spawn({
            let backlog = backlog.clone();
            async move { backlog.writable().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        backlog.pop(8);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(backlog.len(), 8);
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let backlog = Arc::new(Backlog::new(0));
        backlog.push(1);
        let waiter = tokio::spawn({
            let backlog = backlog.clone();
            async move { backlog.writable().await }
        });
        backlog.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_pop_saturates() {
        let backlog = Backlog::new(4);
        backlog.push(3);
        backlog.pop(5);
        assert!(backlog.is_empty());
    }
}
