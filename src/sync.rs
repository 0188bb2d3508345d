//! Reconnection plumbing: the pending queue and the backoff schedule.
//!
//! Edits made while disconnected are queued and replayed after the next
//! sync handshake. The queue is a fast path, not the source of truth: the
//! store's own log feeds the handshake, so a dropped queue entry is
//! recovered by delta sync anyway.

use std::collections::VecDeque;
use std::time::Duration;

use crate::protocol::UpdatePayload;

/// Queue of durable updates awaiting a live connection.
///
/// Bounded; when full the oldest batch is dropped with a warning (safe,
/// see module docs).
pub struct PendingQueue {
    queue: VecDeque<UpdatePayload>,
    max_size: usize,
}

impl PendingQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a batch for later replay. Empty batches are ignored.
    pub fn enqueue(&mut self, payload: UpdatePayload) {
        if payload.is_empty() {
            return;
        }
        if self.queue.len() >= self.max_size {
            log::warn!(
                "pending queue full ({} batches), dropping oldest",
                self.max_size
            );
            self.queue.pop_front();
        }
        self.queue.push_back(payload);
    }

    /// Drain all queued batches for replay, oldest first.
    pub fn drain(&mut self) -> Vec<UpdatePayload> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total queued operations across all batches.
    pub fn total_ops(&self) -> usize {
        self.queue
            .iter()
            .map(|p| p.ops.len() + p.comments.len())
            .sum()
    }
}

/// Exponential backoff with deterministic jitter.
///
/// Delay doubles per attempt from `base` up to `max`. Jitter is derived
/// from the attempt counter (no RNG dependency), spreading reconnect storms
/// without making tests flaky.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);

        let raw = self
            .base
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
            .min(self.max);

        // Up to 25% jitter, deterministic in the attempt counter.
        let jitter_num = (splitmix(self.attempt as u64) % 256) as u32;
        let jitter = raw.mul_f64(0.25 * jitter_num as f64 / 255.0);
        (raw + jitter).min(self.max)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn splitmix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}
