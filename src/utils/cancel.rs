//! Cooperative cancellation
//!
//! A [`CancelToken`] is threaded through every long-running call and
//! checked at chunk boundaries. A token can be shielded for a critical
//! section (the final device flush); cancel requests are refused while
//! the shield is held.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelState {
    Active,
    Cancelled,
    Shielded,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<CancelState>,
    notify: Notify,
}

/// Job-scoped cancellation signal
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CancelState::Active),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> CancelState {
        // A poisoned lock only means another holder panicked; the state is still valid
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Request cancellation
    ///
    /// Returns false when the token is shielded and the request was refused.
    pub fn cancel(&self) -> bool {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *state {
            CancelState::Shielded => false,
            CancelState::Cancelled => true,
            CancelState::Active => {
                *state = CancelState::Cancelled;
                drop(state);
                self.inner.notify.notify_waiters();
                true
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == CancelState::Cancelled
    }

    /// Enter a section that must not be interrupted
    ///
    /// Returns `None` if cancellation was already accepted; the caller must
    /// then stop instead of entering the section.
    pub fn shield(&self) -> Option<ShieldGuard> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *state {
            CancelState::Cancelled => None,
            _ => {
                *state = CancelState::Shielded;
                Some(ShieldGuard {
                    token: self.clone(),
                })
            }
        }
    }

    /// Resolves once cancellation is accepted
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Holds a [`CancelToken`] shielded until dropped
#[derive(Debug)]
pub struct ShieldGuard {
    token: CancelToken,
}

impl Drop for ShieldGuard {
    fn drop(&mut self) {
        let mut state = self
            .token
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == CancelState::Shielded {
            *state = CancelState::Active;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_sticky() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.cancel());
        assert!(token.cancel());
        assert!(token.clone().is_cancelled());
    }

    #[test]
    fn test_shield_refuses_cancel() {
        let token = CancelToken::new();
        let guard = token.shield().unwrap();
        assert!(!token.cancel());
        assert!(!token.is_cancelled());
        drop(guard);
        assert!(token.cancel());
        assert!(token.shield().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
