//! Per-operation execution context.
//!
//! Every backend call receives an [`OpContext`]. It carries the caller's
//! cancellation token and an optional deadline down through the operations
//! layer into the backend.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{StorageError, StorageResult};

/// Cancellation scope plus deadline for one operation.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context bound to an existing cancellation token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Return a copy that expires after `timeout` (or keeps an earlier deadline).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let at = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < at => existing,
            _ => at,
        });
        self
    }

    /// Derive a context whose cancellation follows this one.
    ///
    /// Canceling the child leaves the parent untouched.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A fresh cancellation scope that keeps this context's deadline.
    ///
    /// Used for work shared between callers, which must not die with the
    /// caller that happened to start it.
    pub fn detached(&self) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: self.deadline,
        }
    }

    /// The cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true once canceled.
    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Checkpoint: fail with `Canceled` or `DeadlineExceeded` if either applies.
    pub fn check(&self) -> StorageResult<()> {
        if self.token.is_cancelled() {
            return Err(StorageError::Canceled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StorageError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Run a future, abandoning it on cancellation or deadline.
    pub async fn run<T, F>(&self, fut: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(StorageError::Canceled),
                _ = tokio::time::sleep_until(deadline) => Err(StorageError::DeadlineExceeded),
                out = fut => out,
            },
            None => tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(StorageError::Canceled),
                out = fut => out,
            },
        }
    }
}
