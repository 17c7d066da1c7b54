//! Cooperative cancellation shared across one caller-facing operation.
//!
//! The flag and the awaitable side come from `tokio_util`'s token; on top of
//! it this type keeps a set of registered sub-operations (for example an
//! in-flight request waiting for its response) that are torn down the moment
//! the token fires.

use conduit_core::{ConduitError, ConduitResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Hooks {
    next_id: u64,
    entries: HashMap<u64, Hook>,
}

struct Inner {
    token: tokio_util::sync::CancellationToken,
    hooks: Mutex<Hooks>,
    /// A child's hook in its parent, released when the child goes away.
    parent: Mutex<Option<Registration>>,
}

/// Cancellation token threaded through connect, dispatch and retry.
///
/// Clones share state: cancelling any clone cancels them all.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: tokio_util::sync::CancellationToken::new(),
                hooks: Mutex::new(Hooks::default()),
                parent: Mutex::new(None),
            }),
        }
    }

    /// Mark the token cancelled and run every registered hook. Idempotent.
    pub fn cancel(&self) {
        if self.inner.token.is_cancelled() {
            return;
        }
        // The flag goes first so a concurrent `register` either lands in the
        // map before the drain or sees the flag and runs its hook itself.
        self.inner.token.cancel();
        let hooks: Vec<Hook> = {
            let mut guard = self.inner.hooks.lock();
            guard.entries.drain().map(|(_, hook)| hook).collect()
        };
        for hook in hooks {
            hook();
        }
        drop(self.inner.parent.lock().take());
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Checkpoint: fail with [`ConduitError::Cancelled`] once the token fired.
    pub fn check(&self) -> ConduitResult<()> {
        if self.is_cancelled() {
            Err(ConduitError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the token is cancelled. Use inside `tokio::select!`.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Associate a sub-operation with this token.
    ///
    /// `hook` runs exactly once: when the token is cancelled, or immediately
    /// if it already was. Dropping the returned guard unregisters it.
    pub fn register<F>(&self, hook: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self.inner.hooks.lock();
        if self.inner.token.is_cancelled() {
            drop(guard);
            hook();
            return Registration::inert();
        }
        let id = guard.next_id;
        guard.next_id += 1;
        guard.entries.insert(id, Box::new(hook));
        Registration {
            owner: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    /// A token that is cancelled together with this one but can also be
    /// cancelled on its own without affecting the parent. The parent keeps
    /// a hook for the child only while the child is alive and uncancelled.
    pub fn child_token(&self) -> CancellationToken {
        let child = CancellationToken::new();
        let weak = Arc::downgrade(&child.inner);
        let registration = self.register(move || {
            if let Some(inner) = weak.upgrade() {
                CancellationToken { inner }.cancel();
            }
        });
        *child.inner.parent.lock() = Some(registration);
        child
    }

    /// Number of hooks currently waiting on this token.
    pub fn registered(&self) -> usize {
        self.inner.hooks.lock().entries.len()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Guard returned by [`CancellationToken::register`].
#[must_use = "dropping the registration unregisters the hook"]
pub struct Registration {
    owner: Weak<Inner>,
    id: Option<u64>,
}

impl Registration {
    fn inert() -> Self {
        Self {
            owner: Weak::new(),
            id: None,
        }
    }

    /// Keep the hook registered for the token's whole lifetime.
    pub fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        if let Some(inner) = self.owner.upgrade() {
            inner.hooks.lock().entries.remove(&id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_cancel_is_idempotent_and_runs_hooks_once() {
        let token = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _reg = token.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(token.registered(), 1);

        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(token.registered(), 0);
    }

    #[test]
    fn test_register_after_cancel_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _reg = token.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_registration_does_not_fire() {
        let token = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let reg = token.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        drop(reg);
        token.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_check() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.clone().cancel();
        assert!(matches!(token.check(), Err(ConduitError::Cancelled)));
    }

    #[test]
    fn test_child_follows_parent_but_not_the_reverse() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        let sibling = parent.child_token();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn test_child_hooks_are_released() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        let clone = child.clone();
        assert_eq!(parent.registered(), 1);
        drop(child);
        assert_eq!(parent.registered(), 1);
        drop(clone);
        assert_eq!(parent.registered(), 0);

        let child = parent.child_token();
        child.cancel();
        assert_eq!(parent.registered(), 0);
        assert!(!parent.is_cancelled());

        for _ in 0..100 {
            let _ = parent.child_token();
        }
        assert_eq!(parent.registered(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_future_wakes() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancelled() did not wake")
            .unwrap();
    }
}
