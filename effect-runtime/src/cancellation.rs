//! Cooperative Cancellation
//!
//! A [`CancellationToken`] is the shared signal a run consults to decide
//! whether it should stop. Cancellation is cooperative: the run loop checks
//! the active token once per iteration and never interrupts user code.
//!
//! # Cascading
//!
//! Each token keeps a stack of child tokens. Canceling a token cancels every
//! child pushed onto it (and, transitively, their children). Children pushed
//! after cancellation are canceled on the spot.
//!
//! # Uncancelable
//!
//! [`CancellationToken::uncancelable`] returns a stateless token whose
//! `cancel` does nothing and which never reports cancellation. Runs started
//! with [`run`](crate::run) use it as their root.
//!
//! # Example
//!
//! ```rust
//! use effect_runtime::CancellationToken;
//!
//! let parent = CancellationToken::new();
//! let child = parent.child();
//!
//! parent.cancel();
//! assert!(child.is_canceled());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Counter for generating unique token IDs.
static TOKEN_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Shared state behind a cancelable token.
struct TokenState {
    /// Unique token ID.
    id: u64,
    /// Whether cancellation has been requested.
    canceled: AtomicBool,
    /// Tokens canceled together with this one.
    children: Mutex<Vec<CancellationToken>>,
    /// Cancellation reason, if one was given.
    reason: Mutex<Option<String>>,
}

impl Drop for TokenState {
    fn drop(&mut self) {
        // Unlink children one level at a time, so dropping the root of a
        // deep child chain does not recurse.
        let mut pending = std::mem::take(self.children.get_mut());
        while let Some(child) = pending.pop() {
            if let Some(state) = child.state {
                if let Ok(mut last) = Arc::try_unwrap(state) {
                    pending.append(last.children.get_mut());
                }
            }
        }
    }
}

/// A shareable cancellation signal.
///
/// Cloning is cheap and yields a handle to the same signal. Two tokens
/// compare equal when they share state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    /// `None` for the uncancelable token.
    state: Option<Arc<TokenState>>,
}

impl CancellationToken {
    /// Create a new, not yet canceled token.
    pub fn new() -> Self {
        Self {
            state: Some(Arc::new(TokenState {
                id: TOKEN_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                canceled: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
                reason: Mutex::new(None),
            })),
        }
    }

    /// The token that can never be canceled.
    pub const fn uncancelable() -> Self {
        Self { state: None }
    }

    /// Token ID; `0` for the uncancelable token.
    pub fn id(&self) -> u64 {
        self.state.as_ref().map_or(0, |s| s.id)
    }

    /// Returns false for the uncancelable token.
    pub fn is_cancelable(&self) -> bool {
        self.state.is_some()
    }

    /// Check whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.canceled.load(Ordering::Acquire))
    }

    /// Request cancellation.
    ///
    /// Idempotent: only the first call has any effect. Cascades to every
    /// pushed child.
    pub fn cancel(&self) {
        self.cancel_with_reason(None);
    }

    /// Request cancellation, recording a reason.
    ///
    /// The reason is kept only if this call is the one that cancels.
    pub fn cancel_with_reason(&self, reason: Option<String>) {
        let Some(root) = &self.state else {
            return;
        };

        // Worklist instead of recursion, so deep child chains are safe.
        let mut pending = vec![(root.clone(), reason)];
        while let Some((state, reason)) = pending.pop() {
            if state.canceled.swap(true, Ordering::AcqRel) {
                continue;
            }
            if reason.is_some() {
                *state.reason.lock() = reason;
            }
            tracing::debug!(token = state.id, "cancellation requested");

            let children = std::mem::take(&mut *state.children.lock());
            for child in children.into_iter().rev() {
                if let Some(child_state) = child.state {
                    pending.push((child_state, None));
                }
            }
        }
    }

    /// The reason given to [`cancel_with_reason`](Self::cancel_with_reason).
    pub fn reason(&self) -> Option<String> {
        self.state.as_ref()?.reason.lock().clone()
    }

    /// Push a child token onto the cascade stack.
    ///
    /// If this token is already canceled the child is canceled immediately.
    pub fn push(&self, child: CancellationToken) {
        let Some(state) = &self.state else {
            return;
        };

        {
            let mut children = state.children.lock();
            if !state.canceled.load(Ordering::Acquire) {
                children.push(child);
                return;
            }
        }
        child.cancel();
    }

    /// Pop the most recently pushed child token.
    pub fn pop(&self) -> Option<CancellationToken> {
        self.state.as_ref()?.children.lock().pop()
    }

    /// Number of children currently on the cascade stack.
    pub fn child_count(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.children.lock().len())
    }

    /// Create a new token pushed onto this one.
    ///
    /// The child is canceled when this token is; canceling the child leaves
    /// this token untouched.
    pub fn child(&self) -> CancellationToken {
        let child = CancellationToken::new();
        self.push(child.clone());
        child
    }

    /// Return an error if cancellation has been requested.
    pub fn check(&self) -> Result<(), CancellationError> {
        if self.is_canceled() {
            Err(CancellationError {
                reason: self.reason(),
            })
        } else {
            Ok(())
        }
    }
}

impl PartialEq for CancellationToken {
    fn eq(&self, other: &Self) -> bool {
        match (&self.state, &other.state) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for CancellationToken {}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            Some(_) => f
                .debug_struct("CancellationToken")
                .field("id", &self.id())
                .field("canceled", &self.is_canceled())
                .field("children", &self.child_count())
                .finish(),
            None => f.write_str("CancellationToken(uncancelable)"),
        }
    }
}

/// Error returned by [`CancellationToken::check`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation canceled{}", reason_suffix(.reason))]
pub struct CancellationError {
    /// The cancellation reason, if provided.
    pub reason: Option<String>,
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(": {}", reason),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_basic() {
        let token = CancellationToken::new();
        assert!(!token.is_canceled());
        token.cancel();
        assert!(token.is_canceled());
    }

    #[test]
    fn test_cancel_idempotent() {
        let token = CancellationToken::new();
        token.cancel_with_reason(Some("first".into()));
        token.cancel_with_reason(Some("second".into()));
        token.cancel();
        assert!(token.is_canceled());
        assert_eq!(token.reason(), Some("first".into()));
    }

    #[test]
    fn test_uncancelable() {
        let token = CancellationToken::uncancelable();
        token.cancel();
        assert!(!token.is_canceled());
        assert!(!token.is_cancelable());
        assert_eq!(token.id(), 0);
        assert_eq!(token, CancellationToken::default());

        token.push(CancellationToken::new());
        assert!(token.pop().is_none());
    }

    #[test]
    fn test_cascade_to_children() {
        let parent = CancellationToken::new();
        let a = parent.child();
        let b = a.child();

        parent.cancel();
        assert!(a.is_canceled());
        assert!(b.is_canceled());
        assert_eq!(parent.child_count(), 0);
    }

    #[test]
    fn test_child_cancel_independent() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_canceled());
        assert!(!parent.is_canceled());
    }

    #[test]
    fn test_push_pop() {
        let parent = CancellationToken::new();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        parent.push(a.clone());
        parent.push(b.clone());

        assert_eq!(parent.pop(), Some(b.clone()));
        parent.cancel();
        assert!(a.is_canceled());
        assert!(!b.is_canceled());
    }

    #[test]
    fn test_push_after_cancel() {
        let parent = CancellationToken::new();
        parent.cancel();

        let late = CancellationToken::new();
        parent.push(late.clone());
        assert!(late.is_canceled());
    }

    #[test]
    fn test_deep_chain_cancel() {
        let root = CancellationToken::new();
        let mut tip = root.clone();
        for _ in 0..100_000 {
            tip = tip.child();
        }
        root.cancel();
        assert!(tip.is_canceled());
    }

    #[test]
    fn test_drop_deep_chain_without_cancel() {
        let root = CancellationToken::new();
        let mut tip = root.clone();
        for _ in 0..100_000 {
            tip = tip.child();
        }
        assert!(!tip.is_canceled());
        drop(tip);
        drop(root);
    }

    #[test]
    fn test_drop_parent_keeps_shared_child() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let grandchild = child.child();
        drop(parent);

        assert_eq!(child.child_count(), 1);
        child.cancel();
        assert!(grandchild.is_canceled());
    }

    #[test]
    fn test_identity_equality() {
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a, CancellationToken::uncancelable());
    }

    #[test]
    fn test_check() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel_with_reason(Some("timeout".into()));
        let err = token.check().unwrap_err();
        assert_eq!(err.to_string(), "operation canceled: timeout");
    }
}
