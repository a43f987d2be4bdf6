//! Deadline and cancellation context for storage operations.
//!
//! Every call that performs I/O takes a [`Context`]. A context carries an
//! optional deadline and a [`CancellationToken`]; derived contexts inherit
//! both and may only tighten the deadline. When either fires, the in-flight
//! future is dropped, which aborts the dial or query, and the caller gets
//! [`StorageError::Timeout`] or [`StorageError::Cancelled`].

use std::future::IntoFuture;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::storage::StorageError;

/// Cancellable deadline context.
#[derive(Debug, Clone)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context with no deadline that is never cancelled by its parent.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Derive a child expiring after `timeout`, or at the parent's deadline
    /// if that is sooner.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child expiring at `deadline`, or at the parent's deadline if
    /// that is sooner.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
        }
    }

    /// Apply `timeout` only when this context has no deadline of its own.
    pub fn or_timeout(&self, timeout: Duration) -> Self {
        match self.deadline {
            Some(_) => self.clone(),
            None => self.with_timeout(timeout),
        }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token for wiring external shutdown signals.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<(), StorageError> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(StorageError::Timeout);
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the deadline elapses, or the context
    /// is cancelled.
    pub async fn run<F, T, E>(&self, fut: F) -> Result<T, StorageError>
    where
        F: IntoFuture<Output = Result<T, E>>,
        E: Into<StorageError>,
    {
        self.check()?;
        let fut = fut.into_future();

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StorageError::Cancelled),
            _ = expired => Err(StorageError::Timeout),
            result = fut => result.map_err(Into::into),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = Context::background();
        let value = ctx
            .run(async { Ok::<_, StorageError>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StorageError>(())
            })
            .await;
        assert!(matches!(result, Err(StorageError::Timeout)));
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let parent = Context::background();
        let child = parent.with_timeout(Duration::from_secs(60));
        parent.cancel();

        let result = child.run(async { Ok::<_, StorageError>(()) }).await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
    }

    #[tokio::test]
    async fn test_child_never_extends_parent_deadline() {
        let parent = Context::background().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let bounded = parent.or_timeout(Duration::from_secs(60));
        assert_eq!(bounded.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_check_expired() {
        let ctx = Context::background().with_timeout(Duration::ZERO);
        assert!(matches!(ctx.check(), Err(StorageError::Timeout)));
        assert!(Context::background().check().is_ok());
        assert!(Context::background().remaining().is_none());
    }
}
