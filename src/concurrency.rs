//! Signing backend protection
//!
//! Bounds the number of signing batches in flight and optionally enforces a
//! minimum delay between batch dispatches.

use crate::error::{Result, SigningError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Instant};

/// Concurrency and spacing limiter for signing-provider calls
#[derive(Debug, Clone)]
pub struct BatchLimiter {
    semaphore: Arc<Semaphore>,
    last_dispatch: Arc<Mutex<Option<Instant>>>,
    min_spacing: Option<Duration>,
}

impl BatchLimiter {
    pub fn new(max_concurrent: usize, min_spacing_ms: Option<u64>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            last_dispatch: Arc::new(Mutex::new(None)),
            min_spacing: min_spacing_ms.filter(|ms| *ms > 0).map(Duration::from_millis),
        }
    }

    /// Wait for a free slot; the batch holds it until the permit is dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SigningError::LimiterClosed)?;

        if let Some(min_spacing) = self.min_spacing {
            // Reserve a dispatch slot under the lock, sleep outside it.
            let wait = {
                let mut last = self.last_dispatch.lock();
                let now = Instant::now();
                let slot = match *last {
                    Some(previous) if previous + min_spacing > now => previous + min_spacing,
                    _ => now,
                };
                *last = Some(slot);
                slot.saturating_duration_since(now)
            };
            if !wait.is_zero() {
                sleep(wait).await;
            }
        }

        Ok(permit)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
