//! Fixed-window rate limiter with a priority wait queue.
//!
//! At most `max_requests` admissions happen per window. Callers arriving
//! over budget wait in a heap ordered by [`Priority`] (critical first) and,
//! within a tier, by arrival. When the window rolls over, a drain task
//! admits waiters in that order until the new window is full.
//!
//! A newcomer never overtakes queued waiters, even if the window has room.
//!
//! The drain stops when the limiter's shutdown token fires. Queued callers
//! then fail as cancelled instead of waiting for a window that never rolls.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use inkwell_core::{ApiError, ConfigError, Priority};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_REQUESTS: u32 = 100;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests == 0 {
            return Err(ConfigError::invalid("rate_limit.max_requests", "must be > 0"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::invalid("rate_limit.window_ms", "must be > 0"));
        }
        Ok(())
    }
}

/// How a caller got through the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Immediate,
    Queued { waited: Duration },
}

impl Admission {
    pub fn was_queued(&self) -> bool {
        matches!(self, Admission::Queued { .. })
    }
}

#[derive(Debug)]
struct Waiter {
    priority: Priority,
    seq: u64,
    tx: oneshot::Sender<()>,
}

// Max-heap: higher priority first, then lower sequence first.
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Waiter {}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    used: u32,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
    draining: bool,
}

impl WindowState {
    fn roll(&mut self, now: Instant, window: Duration) {
        if now >= self.window_start + window {
            self.window_start = now;
            self.used = 0;
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<WindowState>>,
    shutdown: CancellationToken,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_shutdown(config, CancellationToken::new())
    }

    /// A limiter whose queue is torn down when `shutdown` fires.
    pub fn with_shutdown(config: RateLimitConfig, shutdown: CancellationToken) -> Self {
        Self {
            config,
            shutdown,
            state: Arc::new(Mutex::new(WindowState {
                window_start: Instant::now(),
                used: 0,
                waiters: BinaryHeap::new(),
                next_seq: 0,
                draining: false,
            })),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Callers currently waiting for a slot.
    pub fn queued(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    /// Wait for a slot in the current or a later window.
    ///
    /// Fails with a cancelled error if `cancel` fires while waiting.
    pub async fn acquire(
        &self,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<Admission, ApiError> {
        if self.shutdown.is_cancelled() {
            return Err(ApiError::cancelled());
        }
        let rx = {
            let mut state = lock(&self.state);
            state.roll(Instant::now(), self.config.window);
            if state.waiters.is_empty() && state.used < self.config.max_requests {
                state.used += 1;
                return Ok(Admission::Immediate);
            }

            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter { priority, seq, tx });
            tracing::debug!(
                priority = %priority,
                queued = state.waiters.len(),
                "Rate limit reached, request queued"
            );
            if !state.draining {
                state.draining = true;
                tokio::spawn(drain(
                    Arc::clone(&self.state),
                    self.config,
                    self.shutdown.clone(),
                ));
            }
            rx
        };

        let queued_at = Instant::now();
        tokio::select! {
            granted = rx => match granted {
                Ok(()) => Ok(Admission::Queued { waited: queued_at.elapsed() }),
                Err(_) if self.shutdown.is_cancelled() => Err(ApiError::cancelled()),
                Err(_) => Err(ApiError::unknown("Rate limiter dropped a queued request")),
            },
            _ = cancel.cancelled() => Err(ApiError::cancelled()),
            _ = self.shutdown.cancelled() => Err(ApiError::cancelled()),
        }
    }
}

fn lock(state: &Mutex<WindowState>) -> MutexGuard<'_, WindowState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Admit queued callers window by window until the queue is empty.
async fn drain(
    state: Arc<Mutex<WindowState>>,
    config: RateLimitConfig,
    shutdown: CancellationToken,
) {
    loop {
        let wake_at = lock(&state).window_start + config.window;
        tokio::select! {
            _ = tokio::time::sleep_until(wake_at) => {}
            _ = shutdown.cancelled() => {
                let mut guard = lock(&state);
                tracing::debug!(dropped = guard.waiters.len(), "Rate limiter shut down");
                guard.waiters.clear();
                guard.draining = false;
                return;
            }
        }

        let mut guard = lock(&state);
        guard.roll(Instant::now(), config.window);
        while guard.used < config.max_requests {
            let Some(waiter) = guard.waiters.pop() else {
                break;
            };
            // A closed receiver means the caller gave up; its slot stays free.
            if waiter.tx.send(()).is_ok() {
                guard.used += 1;
            }
        }
        guard.waiters.retain(|waiter| !waiter.tx.is_closed());
        if guard.waiters.is_empty() {
            guard.draining = false;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_budget() {
        let limiter = RateLimiter::new(RateLimitConfig::new(3, Duration::from_secs(60)));
        let token = CancellationToken::new();
        for _ in 0..3 {
            assert_eq!(
                limiter.acquire(Priority::Medium, &token).await.unwrap(),
                Admission::Immediate
            );
        }

        let started = Instant::now();
        let admission = limiter.acquire(Priority::Medium, &token).await.unwrap();
        assert!(admission.was_queued());
        assert!(started.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_overtakes_low() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(60)));
        let token = CancellationToken::new();
        limiter.acquire(Priority::Low, &token).await.unwrap();

        let order = Arc::new(StdMutex::new(Vec::new()));
        for (label, priority) in [("low", Priority::Low), ("critical", Priority::Critical)] {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            let token = token.clone();
            tokio::spawn(async move {
                limiter.acquire(priority, &token).await.unwrap();
                order.lock().unwrap().push(label);
            });
            tokio::task::yield_now().await;
        }
        assert_eq!(limiter.queued(), 2);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(*order.lock().unwrap(), vec!["critical"]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*order.lock().unwrap(), vec!["critical", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_within_tier() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(10)));
        let token = CancellationToken::new();
        limiter.acquire(Priority::High, &token).await.unwrap();

        let order = Arc::new(StdMutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            let token = token.clone();
            tokio::spawn(async move {
                limiter.acquire(Priority::High, &token).await.unwrap();
                order.lock().unwrap().push(label);
            });
            tokio::task::yield_now().await;
        }

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(60)));
        let token = CancellationToken::new();
        limiter.acquire(Priority::Low, &token).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(Priority::Low, &cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        // The abandoned slot is not consumed: the next window admits a newcomer.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(limiter.queued(), 0);
        assert_eq!(
            limiter.acquire(Priority::Low, &token).await.unwrap(),
            Admission::Immediate
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_queued_waiters() {
        let shutdown = CancellationToken::new();
        let limiter = RateLimiter::with_shutdown(
            RateLimitConfig::new(1, Duration::from_secs(60)),
            shutdown.clone(),
        );
        let token = CancellationToken::new();
        limiter.acquire(Priority::Low, &token).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let token = token.clone();
            tokio::spawn(async move { limiter.acquire(Priority::High, &token).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.queued(), 1);

        shutdown.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(limiter.queued(), 0);
        assert!(limiter.acquire(Priority::Critical, &token).await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_config_validation() {
        assert!(RateLimitConfig::default().validate().is_ok());
        assert!(RateLimitConfig::new(0, Duration::from_secs(1)).validate().is_err());
        assert!(RateLimitConfig::new(1, Duration::ZERO).validate().is_err());
    }
}
