//! Grouping of logical requests into one execution tick.

use std::time::Duration;

use inkwell_core::ConfigError;

pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// How long the first queued request waits for company.
    pub window: Duration,
    /// A batch this large flushes immediately.
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_BATCH_WINDOW,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.is_zero() {
            return Err(ConfigError::invalid("batch.window_ms", "must be > 0"));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid("batch.max_batch_size", "must be > 0"));
        }
        Ok(())
    }
}

/// What the caller of [`BatchQueue::push`] must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPush {
    /// The batch is full: take and run it now.
    Flush,
    /// First item of a new batch: arm a timer for this epoch.
    StartTimer { epoch: u64 },
    /// Joined a batch whose timer is already armed.
    Queued,
}

/// Pending items of the batch being collected.
///
/// Every [`take`](Self::take) starts a new epoch, so a timer armed for an
/// earlier batch cannot flush a later one early.
#[derive(Debug)]
pub struct BatchQueue<T> {
    pending: Vec<T>,
    epoch: u64,
    max_batch_size: usize,
}

impl<T> BatchQueue<T> {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            pending: Vec::new(),
            epoch: 0,
            max_batch_size: max_batch_size.max(1),
        }
    }

    pub fn push(&mut self, item: T) -> BatchPush {
        self.pending.push(item);
        if self.pending.len() >= self.max_batch_size {
            BatchPush::Flush
        } else if self.pending.len() == 1 {
            BatchPush::StartTimer { epoch: self.epoch }
        } else {
            BatchPush::Queued
        }
    }

    pub fn take(&mut self) -> Vec<T> {
        self.epoch += 1;
        std::mem::take(&mut self.pending)
    }

    /// Take the batch only if it is still the one `epoch` was armed for.
    pub fn take_epoch(&mut self, epoch: u64) -> Option<Vec<T>> {
        if epoch == self.epoch && !self.pending.is_empty() {
            Some(self.take())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_signals() {
        let mut queue = BatchQueue::new(3);
        assert_eq!(queue.push(1), BatchPush::StartTimer { epoch: 0 });
        assert_eq!(queue.push(2), BatchPush::Queued);
        assert_eq!(queue.push(3), BatchPush::Flush);
        assert_eq!(queue.take(), vec![1, 2, 3]);
        assert_eq!(queue.push(4), BatchPush::StartTimer { epoch: 1 });
    }

    #[test]
    fn test_stale_timer_does_not_flush_next_batch() {
        let mut queue = BatchQueue::new(2);
        queue.push("a");
        queue.push("b");
        queue.take();
        queue.push("c");

        assert_eq!(queue.take_epoch(0), None);
        assert_eq!(queue.take_epoch(1), Some(vec!["c"]));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(BatchConfig::default().validate().is_ok());
        let bad = BatchConfig {
            max_batch_size: 0,
            ..BatchConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
