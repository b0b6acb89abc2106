//! Retry policy
//!
//! Classifies remote failures and computes the exponential backoff
//! schedule `base * 2^(attempt-1)`. The same policy drives both the
//! bounded per-call retry loop and the queue ceiling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{RemoteError, SyncError, SyncResult};

/// Outcome of classifying a remote failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient transport failure; try again later
    Retryable,
    /// Authorization or validation failure; retrying cannot help
    Fatal,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub base: Duration,
    /// Upper bound for a single delay
    pub max_backoff: Duration,
    /// Low-level attempts per remote call (first try included)
    pub call_attempts: u32,
    /// Failed drain attempts before a pending operation is dropped
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            call_attempts: 3,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn classify(err: &RemoteError) -> ErrorClass {
        match err {
            RemoteError::Unavailable(_)
            | RemoteError::DeadlineExceeded(_)
            | RemoteError::Unknown(_) => ErrorClass::Retryable,
            RemoteError::Unauthenticated(_)
            | RemoteError::PermissionDenied(_)
            | RemoteError::InvalidArgument(_)
            | RemoteError::NotFound(_)
            | RemoteError::AlreadyExists(_)
            | RemoteError::FailedPrecondition(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(err: &RemoteError) -> bool {
        Self::classify(err) == ErrorClass::Retryable
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 2u32.saturating_pow(exponent);
        self.base.saturating_mul(factor).min(self.max_backoff)
    }

    /// Run `call` up to `call_attempts` times, sleeping between retryable
    /// failures. Fatal errors return immediately. Cancellation is observed
    /// before each attempt and during backoff, never mid-call.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancelToken,
        what: &str,
        mut call: F,
    ) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let attempts = self.call_attempts.max(1);
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !Self::is_retryable(&err) || attempt >= attempts {
                return Err(err.into());
            }

            let delay = self.backoff(attempt);
            tracing::debug!(
                "{} failed (attempt {}/{}): {}; retrying in {:?}",
                what,
                attempt,
                attempts,
                err,
                delay
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            }
            attempt += 1;
        }
    }
}

/// Cooperative cancellation signal shared by the coordinator and its calls
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
