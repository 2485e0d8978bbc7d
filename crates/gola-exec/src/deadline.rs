//! Explicit deadlines and per-attempt execution context
//!
//! A request carries one overall budget. Each provider attempt receives a
//! `Deadline` for whatever is left of it, so fallback arithmetic is a plain
//! subtraction on values rather than hidden timer state.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Remaining budget rounded up to whole seconds, never below one.
    pub fn remaining_secs_ceil(&self) -> u64 {
        let remaining = self.remaining();
        let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        secs.max(1)
    }
}

/// Everything an adapter needs to bound a single `execute` call.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub request_id: String,
    pub deadline: Deadline,
    pub cancel: CancellationToken,
}

impl ExecContext {
    pub fn new(request_id: impl Into<String>, deadline: Deadline) -> Self {
        Self {
            request_id: request_id.into(),
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    /// Resolves when the deadline passes or the attempt is cancelled, whichever is first.
    pub async fn expired(&self) {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline.instant()) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_remaining_shrinks_with_time() {
        let deadline = Deadline::after(Duration::from_secs(5));
        assert_eq!(deadline.remaining(), Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(deadline.remaining(), Duration::from_secs(3));
        assert!(!deadline.is_expired());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_secs_rounds_up() {
        let deadline = Deadline::after(Duration::from_millis(2_100));
        assert_eq!(deadline.remaining_secs_ceil(), 3);
        tokio::time::advance(Duration::from_millis(2_100)).await;
        assert_eq!(deadline.remaining_secs_ceil(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_expires_on_cancel() {
        let ctx = ExecContext::new("r1", Deadline::after(Duration::from_secs(60)));
        ctx.cancel.cancel();
        tokio::time::timeout(Duration::from_millis(10), ctx.expired())
            .await
            .expect("cancelled context should resolve immediately");
    }
}
