use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken as SharedToken;

/// Cooperative cancellation for long parameter searches.
///
/// Wraps [`tokio_util::sync::CancellationToken`], whose `cancel` and
/// `is_cancelled` are synchronous and safe to poll from rayon workers.
/// Clones share the same state. A token may also carry a deadline, after
/// which it reports itself cancelled without anyone calling [`cancel`].
///
/// [`cancel`]: CancellationToken::cancel
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: SharedToken,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that cancels itself once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: SharedToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Wrap an existing tokio token, e.g. one tied to a service's shutdown signal.
    pub fn from_token(inner: SharedToken) -> Self {
        Self {
            inner,
            deadline: None,
        }
    }

    /// Child token: cancelled when the parent is, but cancelling it leaves
    /// the parent running. The deadline is inherited.
    pub fn child_token(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.is_cancelled() {
            return true;
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            // Latch so clones without the deadline observe it too.
            self.inner.cancel();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_expired_deadline() {
        let token = CancellationToken::with_timeout(Duration::ZERO);
        assert!(token.is_cancelled());
        let token = CancellationToken::with_timeout(Duration::from_secs(3600));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_wraps_external_tokio_token() {
        let shutdown = SharedToken::new();
        let token = CancellationToken::from_token(shutdown.clone());
        assert!(!token.is_cancelled());
        shutdown.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let child = parent.child_token();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_expired_deadline_latches_for_shared_token() {
        let shutdown = SharedToken::new();
        let token = CancellationToken {
            inner: shutdown.clone(),
            deadline: Some(Instant::now()),
        };
        assert!(token.is_cancelled());
        assert!(shutdown.is_cancelled());
    }
}
