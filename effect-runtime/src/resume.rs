//! # Resumption Handles
//!
//! A run that reaches an asynchronous boundary stops and returns control to
//! its caller. Before it does, it moves everything needed to carry on (the
//! continuation stack and the active token) into a [`ResumeHandle`]. The
//! asynchronous source later completes the [`AsyncCallback`] it was given,
//! which moves that state back out and re-enters the run loop.
//!
//! ## One Handle Per Run
//!
//! A handle is created lazily, on the first boundary of a top-level run, and
//! reused for every later boundary of the same run. Each arming bumps an
//! epoch; callbacks are bound to the epoch they were created for, so a stale
//! callback from an earlier boundary can never resume a later one.
//!
//! ## Single-Shot
//!
//! The handle's state lives in one atomic word (epoch plus phase). Firing
//! claims the armed phase with a compare-and-swap before doing anything else,
//! so of two racing or repeated completions exactly one resumes the run and
//! the rest are ignored.
//!
//! ## Synchronous Completion
//!
//! A registration may complete its callback before it returns, on the same
//! thread. Resuming right there would nest one run loop inside another for
//! every such boundary. Instead the outcome is parked in the handle and the
//! loop that is still waiting for `register` to return picks it up and keeps
//! going inline. A completion from any other thread resumes the run on that
//! thread.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::cancellation::CancellationToken;
use crate::effect::Value;
use crate::error::{EffectError, Outcome};
use crate::panic::{catch_panic_unchecked, CatchResult};
use crate::run_loop::{self, CallStack};

/// Not armed.
const IDLE: u64 = 0;
/// Armed; the registering loop is still inside `register`.
const REGISTERING: u64 = 1;
/// Armed; the registering loop has returned.
const WAITING: u64 = 2;
/// Fired on the registering thread during registration; outcome parked.
const PARKED: u64 = 3;

const PHASE_BITS: u32 = 2;
const PHASE_MASK: u64 = (1 << PHASE_BITS) - 1;

fn pack(epoch: u64, phase: u64) -> u64 {
    (epoch << PHASE_BITS) | phase
}

fn unpack(state: u64) -> (u64, u64) {
    (state >> PHASE_BITS, state & PHASE_MASK)
}

/// The user's completion callback, delivered at most once.
pub(crate) struct Terminal {
    callback: Mutex<Option<Box<dyn FnOnce(Outcome<Value>) + Send>>>,
}

impl Terminal {
    pub(crate) fn new(callback: Box<dyn FnOnce(Outcome<Value>) + Send>) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(Some(callback)),
        })
    }

    /// A terminal that completes an enclosing run's async callback.
    pub(crate) fn forward(callback: AsyncCallback) -> Arc<Self> {
        Self::new(Box::new(move |outcome| callback.complete_outcome(outcome)))
    }

    /// Deliver the run's outcome.
    pub(crate) fn complete(&self, outcome: Outcome<Value>) {
        let callback = self.callback.lock().take();
        match callback {
            Some(callback) => {
                if let CatchResult::Panicked(info) = catch_panic_unchecked(move || callback(outcome)) {
                    tracing::error!(panic = %info, "completion callback panicked");
                }
            }
            None => {
                tracing::warn!("dropping second terminal outcome for a finished run");
            }
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.callback.lock().is_none()
    }
}

/// Bridge from a paused run to its asynchronous completion.
pub struct ResumeHandle {
    /// Epoch and phase, packed.
    state: AtomicU64,
    /// Token the run resumes with.
    token: Mutex<CancellationToken>,
    /// Saved continuation stack while armed.
    stack: Mutex<CallStack>,
    /// Outcome of a completion that arrived during registration.
    parked: Mutex<Option<Outcome<Value>>>,
    /// Thread running the current registration.
    registrar: Mutex<Option<ThreadId>>,
    /// Where the run's final outcome goes.
    terminal: Arc<Terminal>,
}

impl ResumeHandle {
    pub(crate) fn new(token: CancellationToken, terminal: Arc<Terminal>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU64::new(pack(0, IDLE)),
            token: Mutex::new(token),
            stack: Mutex::new(CallStack::new()),
            parked: Mutex::new(None),
            registrar: Mutex::new(None),
            terminal,
        })
    }

    /// Whether a completion would currently resume the run.
    pub fn is_armed(&self) -> bool {
        let (_, phase) = unpack(self.state.load(Ordering::Acquire));
        phase == REGISTERING || phase == WAITING
    }

    /// Number of times this handle has been armed.
    pub fn epoch(&self) -> u64 {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    /// The token the run resumes with.
    pub fn token(&self) -> CancellationToken {
        self.token.lock().clone()
    }

    /// Token-change notification; the saved stack is left alone.
    pub(crate) fn update_token(&self, token: CancellationToken) {
        *self.token.lock() = token;
    }

    pub(crate) fn terminal(&self) -> &Arc<Terminal> {
        &self.terminal
    }

    /// Store the continuation stack and enable firing.
    ///
    /// Returns the epoch of this arming. Must be called by the thread that
    /// will invoke the registration.
    pub(crate) fn arm(&self, stack: CallStack) -> u64 {
        *self.stack.lock() = stack;
        *self.registrar.lock() = Some(thread::current().id());

        let (epoch, _) = unpack(self.state.load(Ordering::Acquire));
        let next = epoch.wrapping_add(1) & (u64::MAX >> PHASE_BITS);
        self.state.store(pack(next, REGISTERING), Ordering::Release);
        next
    }

    /// Called by the registering loop once `register` has returned.
    ///
    /// Returns the parked outcome and the saved stack if the registration
    /// completed synchronously; the caller continues the run inline.
    /// Otherwise the run now belongs to whoever fires the callback.
    pub(crate) fn detach(&self, epoch: u64) -> Option<(Outcome<Value>, CallStack)> {
        match self.state.compare_exchange(
            pack(epoch, REGISTERING),
            pack(epoch, WAITING),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => None,
            Err(actual) if actual == pack(epoch, PARKED) => {
                self.state.store(pack(epoch, IDLE), Ordering::Release);
                let outcome = self.parked.lock().take()?;
                let stack = std::mem::take(&mut *self.stack.lock());
                tracing::trace!(epoch, "async boundary completed synchronously");
                Some((outcome, stack))
            }
            // Another thread already claimed the completion.
            Err(_) => None,
        }
    }

    /// Complete the arming identified by `epoch`.
    ///
    /// Inert unless that arming is still armed.
    pub(crate) fn fire(self: &Arc<Self>, epoch: u64, outcome: Outcome<Value>) {
        let mut outcome = Some(outcome);

        loop {
            let current = self.state.load(Ordering::Acquire);
            let (current_epoch, phase) = unpack(current);

            if current_epoch != epoch || !(phase == REGISTERING || phase == WAITING) {
                tracing::warn!(epoch, "ignoring completion of an async boundary that is no longer armed");
                return;
            }

            if phase == REGISTERING && self.is_registrar() {
                *self.parked.lock() = outcome.take();
                if self
                    .state
                    .compare_exchange(current, pack(epoch, PARKED), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                outcome = self.parked.lock().take();
                continue;
            }

            if self
                .state
                .compare_exchange(current, pack(epoch, IDLE), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let stack = std::mem::take(&mut *self.stack.lock());
                if let Some(outcome) = outcome.take() {
                    tracing::trace!(epoch, "resuming run after async boundary");
                    run_loop::resume(self.clone(), outcome, stack);
                }
                return;
            }
        }
    }

    fn is_registrar(&self) -> bool {
        *self.registrar.lock() == Some(thread::current().id())
    }
}

impl fmt::Debug for ResumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumeHandle")
            .field("epoch", &self.epoch())
            .field("armed", &self.is_armed())
            .field("token", &self.token())
            .field("finished", &self.terminal.is_completed())
            .finish()
    }
}

/// Callback handed to an async registration, bound to one arming.
#[derive(Clone)]
pub struct AsyncCallback {
    handle: Arc<ResumeHandle>,
    epoch: u64,
}

impl AsyncCallback {
    pub(crate) fn new(handle: Arc<ResumeHandle>, epoch: u64) -> Self {
        Self { handle, epoch }
    }

    /// Complete the boundary with a value or an error.
    pub(crate) fn complete(&self, result: Result<Value, EffectError>) {
        let outcome = match result {
            Ok(value) => Outcome::Completed(value),
            Err(err) => Outcome::Errored(err),
        };
        self.complete_outcome(outcome);
    }

    /// Complete the boundary with any outcome, cancellation included.
    pub(crate) fn complete_outcome(&self, outcome: Outcome<Value>) {
        self.handle.fire(self.epoch, outcome);
    }
}

impl fmt::Debug for AsyncCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCallback")
            .field("epoch", &self.epoch)
            .field("armed", &self.handle.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_terminal() -> (Arc<Terminal>, Arc<AtomicUsize>, Arc<Mutex<Option<Outcome<Value>>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        let count_clone = count.clone();
        let seen_clone = seen.clone();
        let terminal = Terminal::new(Box::new(move |outcome| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            *seen_clone.lock() = Some(outcome);
        }));
        (terminal, count, seen)
    }

    #[test]
    fn test_pack_roundtrip() {
        assert_eq!(unpack(pack(7, WAITING)), (7, WAITING));
        assert_eq!(unpack(pack(0, IDLE)), (0, IDLE));
    }

    #[test]
    fn test_terminal_fires_once() {
        let (terminal, count, _) = counting_terminal();
        terminal.complete(Outcome::Canceled);
        terminal.complete(Outcome::Canceled);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(terminal.is_completed());
    }

    #[test]
    fn test_arm_bumps_epoch() {
        let (terminal, _, _) = counting_terminal();
        let handle = ResumeHandle::new(CancellationToken::uncancelable(), terminal);
        assert!(!handle.is_armed());

        let first = handle.arm(CallStack::new());
        assert!(handle.is_armed());
        assert!(handle.detach(first).is_none());
        let second = handle.arm(CallStack::new());
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_sync_fire_is_parked() {
        let (terminal, count, _) = counting_terminal();
        let handle = ResumeHandle::new(CancellationToken::uncancelable(), terminal);

        let epoch = handle.arm(CallStack::new());
        AsyncCallback::new(handle.clone(), epoch).complete(Ok(Box::new(3i32)));

        // Parked, not delivered: the registering loop takes it back.
        assert_eq!(count.load(Ordering::SeqCst), 0);
        let (outcome, stack) = handle.detach(epoch).expect("outcome should be parked");
        assert!(stack.is_empty());
        match outcome {
            Outcome::Completed(value) => assert_eq!(value.downcast_ref::<i32>(), Some(&3)),
            other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
        }
        assert!(!handle.is_armed());
    }

    #[test]
    fn test_fire_after_detach_resumes() {
        let (terminal, count, seen) = counting_terminal();
        let handle = ResumeHandle::new(CancellationToken::uncancelable(), terminal);

        let epoch = handle.arm(CallStack::new());
        assert!(handle.detach(epoch).is_none());

        let callback = AsyncCallback::new(handle.clone(), epoch);
        callback.complete(Ok(Box::new("done")));
        callback.complete(Ok(Box::new("spurious")));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let outcome = seen.lock().take().expect("terminal outcome");
        match outcome {
            Outcome::Completed(value) => assert_eq!(value.downcast_ref::<&str>(), Some(&"done")),
            other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_stale_epoch_is_inert() {
        let (terminal, count, _) = counting_terminal();
        let handle = ResumeHandle::new(CancellationToken::uncancelable(), terminal);

        let first = handle.arm(CallStack::new());
        let stale = AsyncCallback::new(handle.clone(), first);
        handle.fire(first, Outcome::Completed(Box::new(())));
        let _ = handle.detach(first);

        let second = handle.arm(CallStack::new());
        assert!(handle.detach(second).is_none());
        stale.complete(Ok(Box::new(())));

        assert!(handle.is_armed());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_update_token_keeps_arming() {
        let (terminal, _, _) = counting_terminal();
        let handle = ResumeHandle::new(CancellationToken::uncancelable(), terminal);
        let epoch = handle.arm(CallStack::new());

        let token = CancellationToken::new();
        handle.update_token(token.clone());
        assert_eq!(handle.token(), token);
        assert!(handle.is_armed());
        assert_eq!(handle.epoch(), epoch);
    }

    #[test]
    fn test_foreign_thread_fire_resumes_there() {
        let (terminal, count, _) = counting_terminal();
        let handle = ResumeHandle::new(CancellationToken::uncancelable(), terminal);
        let epoch = handle.arm(CallStack::new());

        let callback = AsyncCallback::new(handle.clone(), epoch);
        thread::spawn(move || callback.complete(Err(EffectError::msg("remote"))))
            .join()
            .expect("firing thread");

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(handle.detach(epoch).is_none());
    }
}
