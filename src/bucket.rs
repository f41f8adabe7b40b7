//! A generic interval-reset token bucket.
//!
//! The gateway uses buckets to throttle identifies across shards and presence
//! updates within a shard; the REST dispatcher keeps its own per-route state
//! in [`crate::http`] since that state is driven by response headers rather
//! than a fixed window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};

/// A shared "last known network latency" cell, in milliseconds.
///
/// Updated from shard heartbeat round-trips. A bucket driven by a latency
/// reference delays its refill boundary by the current latency, so tokens are
/// not handed out before the remote end's own window has actually reset.
#[derive(Debug, Default)]
pub struct LatencyRef(AtomicU64);

impl LatencyRef {
    pub fn set(&self, latency: Duration) {
        self.0.store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::Relaxed))
    }
}

/// A token bucket that refills to `limit` every `interval`.
///
/// [`Self::acquire`] suspends the caller until a token is available. Waiters
/// are released in FIFO order: the window state is guarded by a queueing
/// mutex which is held across the refill sleep, so a caller that arrived
/// first wakes and consumes first. The bucket never rejects; callers with a
/// deadline should wrap `acquire` in their own timeout.
#[derive(Debug)]
pub struct TokenBucket {
    limit: u32,
    interval: Duration,
    latency: Option<Arc<LatencyRef>>,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    remaining: u32,
    last_reset: Instant,
    last_send: Option<Instant>,
}

impl TokenBucket {
    #[must_use]
    pub fn new(limit: u32, interval: Duration) -> Self {
        assert!(limit > 0, "a bucket must hold at least one token");

        Self {
            limit,
            interval,
            latency: None,
            state: Mutex::new(BucketState {
                remaining: limit,
                last_reset: Instant::now(),
                last_send: None,
            }),
        }
    }

    /// Like [`Self::new`], with refills delayed by the referenced latency.
    #[must_use]
    pub fn with_latency_ref(limit: u32, interval: Duration, latency: Arc<LatencyRef>) -> Self {
        let mut bucket = Self::new(limit, interval);
        bucket.latency = Some(latency);
        bucket
    }

    /// Waits until a token is available, then consumes it.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;

        loop {
            match self.refill_and_take(&mut state) {
                None => return,
                Some(boundary) => sleep_until(boundary).await,
            }
        }
    }

    /// Consumes a token if one is available right now. Never waits, not even
    /// on the state lock; a contended bucket counts as empty.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut state) = self.state.try_lock() else { return false };

        self.refill_and_take(&mut state).is_none()
    }

    /// Takes a token after refilling an elapsed window. On an empty bucket,
    /// returns the boundary at which the window next refills.
    fn refill_and_take(&self, state: &mut BucketState) -> Option<Instant> {
        let latency = self.latency.as_ref().map_or(Duration::ZERO, |l| l.get());
        let boundary = state.last_reset + self.interval + latency;
        let now = Instant::now();

        if now >= boundary {
            state.last_reset = now;
            state.remaining = self.limit;
        }

        if state.remaining > 0 {
            state.remaining -= 1;
            state.last_send = Some(now);
            None
        } else {
            Some(boundary)
        }
    }

    /// Runs `task` once a token is available.
    pub async fn run<F>(&self, task: F) -> F::Output
    where
        F: std::future::Future,
    {
        self.acquire().await;
        task.await
    }

    /// The time the bucket last released a caller, if it ever has.
    pub async fn last_send(&self) -> Option<Instant> {
        self.state.lock().await.last_send
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::{Duration, Instant};

    use super::{LatencyRef, TokenBucket};

    #[tokio::test(start_paused = true)]
    async fn tokens_within_limit_run_immediately() {
        let bucket = TokenBucket::new(3, Duration::from_secs(1));

        let start = Instant::now();
        for _ in 0..3 {
            bucket.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_for_the_window() {
        let interval = Duration::from_millis(500);
        let bucket = TokenBucket::new(2, interval);

        let start = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        bucket.acquire().await;
        assert!(start.elapsed() >= interval);
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_never_waits() {
        let bucket = TokenBucket::new(1, Duration::from_secs(60));

        let start = Instant::now();
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        assert_eq!(start.elapsed(), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn latency_reference_delays_the_refill() {
        let latency = Arc::new(LatencyRef::default());
        latency.set(Duration::from_millis(200));
        let bucket =
            TokenBucket::with_latency_ref(1, Duration::from_millis(500), Arc::clone(&latency));

        let start = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_released_in_fifo_order() {
        let bucket = Arc::new(TokenBucket::new(1, Duration::from_millis(100)));
        bucket.acquire().await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for tag in 0..3u8 {
            let bucket = Arc::clone(&bucket);
            let tx = tx.clone();
            tokio::spawn(async move {
                bucket.acquire().await;
                tx.send(tag).unwrap();
            });
            // Let the task enqueue before spawning the next one.
            tokio::task::yield_now().await;
        }
        drop(tx);

        let mut order = Vec::new();
        while let Some(tag) = rx.recv().await {
            order.push(tag);
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn last_send_is_recorded() {
        let bucket = TokenBucket::new(1, Duration::from_secs(1));
        assert!(bucket.last_send().await.is_none());

        bucket.acquire().await;
        assert_eq!(bucket.last_send().await, Some(Instant::now()));
    }
}
