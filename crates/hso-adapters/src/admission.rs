//! Bounded admission for quantum solver calls shared across all domains.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Wait up to the configured queue time for a slot.
    #[default]
    Queue,
    /// Fail immediately when every slot is taken.
    Reject,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("all {limit} slots in use")]
    Full { limit: usize },
    #[error("no slot freed within {waited_ms}ms")]
    QueueTimeout { waited_ms: u64 },
    #[error("limiter closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub limit: usize,
    pub in_flight: usize,
    pub admitted: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

/// Caps concurrent quantum solver invocations.
///
/// Handed to the scheduler rather than held globally so tests can size and reset it.
#[derive(Debug)]
pub struct AdmissionLimiter {
    limit: usize,
    mode: AdmissionMode,
    queue_wait: Duration,
    semaphore: Mutex<Arc<Semaphore>>,
    counters: Arc<Counters>,
}

/// Holds one admission slot until dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AdmissionLimiter {
    pub fn new(limit: usize, mode: AdmissionMode, queue_wait: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            mode,
            queue_wait,
            semaphore: Mutex::new(Arc::new(Semaphore::new(limit))),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn mode(&self) -> AdmissionMode {
        self.mode
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn acquire(&self) -> Result<AdmissionPermit, AdmissionError> {
        let semaphore = self.current()?;
        let acquired = match self.mode {
            AdmissionMode::Reject => semaphore.try_acquire_owned().map_err(|err| match err {
                TryAcquireError::NoPermits => AdmissionError::Full { limit: self.limit },
                TryAcquireError::Closed => AdmissionError::Closed,
            }),
            AdmissionMode::Queue => {
                match timeout(self.queue_wait, semaphore.acquire_owned()).await {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(AdmissionError::Closed),
                    Err(_) => Err(AdmissionError::QueueTimeout {
                        waited_ms: self.queue_wait.as_millis() as u64,
                    }),
                }
            }
        };
        match acquired {
            Ok(permit) => {
                self.counters.admitted.fetch_add(1, Ordering::AcqRel);
                self.counters.in_flight.fetch_add(1, Ordering::AcqRel);
                Ok(AdmissionPermit {
                    _permit: permit,
                    counters: self.counters.clone(),
                })
            }
            Err(err) => {
                self.counters.rejected.fetch_add(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    /// Swap in a fresh set of slots and zero the counters. Permits issued before the
    /// reset keep their old slot until dropped; waiters on the old set are released
    /// with [`AdmissionError::Closed`].
    pub fn reset(&self) {
        let fresh = Arc::new(Semaphore::new(self.limit));
        if let Ok(mut guard) = self.semaphore.lock() {
            let old = std::mem::replace(&mut *guard, fresh);
            old.close();
        }
        self.counters.admitted.store(0, Ordering::Release);
        self.counters.rejected.store(0, Ordering::Release);
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            limit: self.limit,
            in_flight: self.counters.in_flight.load(Ordering::Acquire),
            admitted: self.counters.admitted.load(Ordering::Acquire),
            rejected: self.counters.rejected.load(Ordering::Acquire),
        }
    }

    fn current(&self) -> Result<Arc<Semaphore>, AdmissionError> {
        self.semaphore
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| AdmissionError::Closed)
    }
}

impl Default for AdmissionLimiter {
    fn default() -> Self {
        Self::new(4, AdmissionMode::Queue, Duration::from_millis(50))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reject_mode_fails_fast_when_full() {
        let limiter = AdmissionLimiter::new(1, AdmissionMode::Reject, Duration::ZERO);
        let held = limiter.acquire().await.unwrap();
        assert_eq!(limiter.stats().in_flight, 1);
        let err = limiter.acquire().await.unwrap_err();
        assert_eq!(err, AdmissionError::Full { limit: 1 });
        drop(held);
        assert_eq!(limiter.stats().in_flight, 0);
        assert!(limiter.acquire().await.is_ok());
        let stats = limiter.stats();
        assert_eq!((stats.admitted, stats.rejected), (2, 1));
    }

    #[tokio::test]
    async fn queue_mode_waits_for_a_slot() {
        let limiter = Arc::new(AdmissionLimiter::new(
            1,
            AdmissionMode::Queue,
            Duration::from_millis(500),
        ));
        let held = limiter.acquire().await.unwrap();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn queue_mode_times_out() {
        let limiter = AdmissionLimiter::new(1, AdmissionMode::Queue, Duration::from_millis(10));
        let _held = limiter.acquire().await.unwrap();
        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, AdmissionError::QueueTimeout { waited_ms: 10 }));
    }

    #[tokio::test]
    async fn reset_restores_capacity() {
        let limiter = AdmissionLimiter::new(1, AdmissionMode::Reject, Duration::ZERO);
        let held = limiter.acquire().await.unwrap();
        limiter.reset();
        assert!(limiter.acquire().await.is_ok());
        assert_eq!(limiter.stats().rejected, 0);
        drop(held);
    }
}
