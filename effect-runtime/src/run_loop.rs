//! # Trampoline Interpreter
//!
//! The run loop walks an effect description iteratively. Sequencing nodes
//! push their continuation onto an explicit [`CallStack`] and descend into
//! their source; results pop the next continuation and feed it. No node is
//! ever interpreted by a recursive call, so the depth of a bind chain never
//! reaches the native stack.
//!
//! ## Entry Points
//!
//! | Function | Token | Delivers |
//! |----------|-------|----------|
//! | [`run`] | uncancelable | value or error |
//! | [`run_cancelable`] | caller supplied | value, error or cancellation |
//! | [`step`] | none | the residual effect |
//! | [`run_sync`] | uncancelable | blocks until the outcome is known |
//!
//! ## Cancellation
//!
//! The active token is checked once at the top of every loop iteration, both
//! when a run starts and when it resumes after an asynchronous boundary. It
//! is not checked by [`step`] nor inside user thunks. Once a canceled token
//! is observed, no further continuation runs.
//!
//! ## Asynchronous Boundaries
//!
//! At an `Async` node the loop arms the run's
//! [`ResumeHandle`](crate::resume::ResumeHandle) with its stack, calls the
//! registration and returns. A registration that completes before returning
//! is picked up again by the same loop, so chains of synchronously
//! completing boundaries stay flat too.

use std::mem;
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::context::SharedContext;
use crate::effect::{downcast_outcome, Frame, Io, Node, PanicMapper, Register, Value};
use crate::error::{EffectError, Outcome};
use crate::panic::{catch_panic_unchecked, CatchResult, PanicInfo};
use crate::resume::{AsyncCallback, ResumeHandle, Terminal};

// ----------------------------------------------------------------------------
// Call stack
// ----------------------------------------------------------------------------

/// Pending continuations of one run.
///
/// The top frame lives in its own slot; the overflow vector is only
/// allocated once two or more frames are pending.
#[derive(Default)]
pub(crate) struct CallStack {
    first: Option<Frame>,
    rest: Vec<Frame>,
}

impl CallStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, frame: Frame) {
        if let Some(previous) = self.first.replace(frame) {
            if self.rest.capacity() == 0 {
                self.rest
                    .reserve(crate::config::current().initial_stack_capacity);
            }
            self.rest.push(previous);
        }
    }

    fn pop(&mut self) -> Option<Frame> {
        self.first.take().or_else(|| self.rest.pop())
    }

    /// Next frame that takes a value; error handlers in the way are dropped.
    pub(crate) fn pop_value(&mut self) -> Option<Frame> {
        while let Some(frame) = self.pop() {
            if frame.accepts_value() {
                return Some(frame);
            }
        }
        None
    }

    /// Next frame that takes an error; value continuations in the way are
    /// dropped.
    pub(crate) fn pop_handler(&mut self) -> Option<Frame> {
        while let Some(frame) = self.pop() {
            if frame.accepts_error() {
                return Some(frame);
            }
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.first.is_none() && self.rest.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        usize::from(self.first.is_some()) + self.rest.len()
    }
}

// ----------------------------------------------------------------------------
// Machine
// ----------------------------------------------------------------------------

/// What the driver should do after one iteration.
enum Control {
    /// Keep looping.
    Continue,
    /// Keep looping; the active token was replaced.
    TokenChanged,
    /// Stop at an asynchronous boundary.
    Suspend(Register),
    /// The run produced a value.
    Completed(Value),
    /// The run failed and nothing handled it.
    Failed(EffectError),
}

/// State of one synchronous segment of a run.
struct Machine {
    current: Option<Node>,
    stack: CallStack,
    token: CancellationToken,
}

impl Machine {
    fn new(node: Node, stack: CallStack, token: CancellationToken) -> Self {
        Self {
            current: Some(node),
            stack,
            token,
        }
    }

    /// Whether the current node needs a token to interpret.
    fn at_token_boundary(&self) -> bool {
        matches!(
            self.current,
            Some(Node::Async(_)) | Some(Node::ContextSwitch { .. })
        )
    }

    /// Interpret one node.
    fn advance(&mut self) -> Control {
        let node = self
            .current
            .take()
            .unwrap_or_else(|| Node::RaiseError(EffectError::internal("run loop reached an absent node")));

        match node {
            Node::Pure(value) => self.deliver(value),
            Node::RaiseError(err) => self.raise(err),
            Node::Suspend { thunk, on_panic } => {
                self.current = Some(match guarded(thunk, on_panic) {
                    Ok(next) => next,
                    Err(err) => Node::RaiseError(err),
                });
                Control::Continue
            }
            Node::Delay { thunk, on_panic } => match guarded(thunk, on_panic) {
                Ok(value) => self.deliver(value),
                Err(err) => self.raise(err),
            },
            Node::Async(register) => Control::Suspend(register),
            Node::Bind(source, f) => {
                self.stack.push(Frame::Bind(f));
                self.current = Some(source.into_node());
                Control::Continue
            }
            Node::Map(source, f) => {
                self.stack.push(Frame::Map(f));
                self.current = Some(source.into_node());
                Control::Continue
            }
            Node::Recover(source, frame) => {
                self.stack.push(frame);
                self.current = Some(source.into_node());
                Control::Continue
            }
            Node::ContinueOn(source, context) => {
                self.current = Some(continue_on(source.into_node(), context));
                Control::Continue
            }
            Node::ContextSwitch {
                source,
                modify,
                restore,
            } => {
                let token = &self.token;
                let next = match guarded(move || modify(token), None) {
                    Ok(next) => next,
                    Err(err) => {
                        self.current = Some(Node::RaiseError(err));
                        return Control::Continue;
                    }
                };
                self.current = Some(source.into_node());
                if next == self.token {
                    return Control::Continue;
                }

                let old = mem::replace(&mut self.token, next);
                tracing::debug!(from = old.id(), to = self.token.id(), "switched cancellation token");
                if let Some(restore) = restore {
                    self.stack.push(Frame::Restore { old, restore });
                }
                Control::TokenChanged
            }
        }
    }

    /// Feed a value to the next value continuation.
    fn deliver(&mut self, value: Value) -> Control {
        let frame = match self.stack.pop_value() {
            Some(frame) => frame,
            None => return Control::Completed(value),
        };

        let next = match frame {
            Frame::Bind(f) | Frame::Redeem { on_value: f, .. } => {
                guarded(move || f(value), None).unwrap_or_else(Node::RaiseError)
            }
            Frame::Map(f) => match guarded(move || f(value), None) {
                Ok(result) => Node::from_outcome(result),
                Err(err) => Node::RaiseError(err),
            },
            Frame::Restore { old, restore } => {
                let current = &self.token;
                return match guarded(|| restore(Ok(&value), &old, current), None) {
                    Ok(Ok(token)) => self.restore_token(token, Node::Pure(value)),
                    Ok(Err(err)) | Err(err) => {
                        self.current = Some(Node::RaiseError(err));
                        Control::Continue
                    }
                };
            }
            Frame::Handler(_) => Node::RaiseError(EffectError::internal(
                "error handler popped as a value continuation",
            )),
        };

        self.current = Some(next);
        Control::Continue
    }

    /// Unwind to the nearest handler-capable frame.
    fn raise(&mut self, err: EffectError) -> Control {
        let frame = match self.stack.pop_handler() {
            Some(frame) => frame,
            None => return Control::Failed(err),
        };

        let next = match frame {
            Frame::Handler(f) | Frame::Redeem { on_error: f, .. } => {
                guarded(move || f(err), None).unwrap_or_else(Node::RaiseError)
            }
            Frame::Restore { old, restore } => {
                let current = &self.token;
                return match guarded(|| restore(Err(&err), &old, current), None) {
                    Ok(Ok(token)) => self.restore_token(token, Node::RaiseError(err)),
                    Ok(Err(restore_err)) | Err(restore_err) => {
                        self.current = Some(Node::RaiseError(restore_err));
                        Control::Continue
                    }
                };
            }
            Frame::Bind(_) | Frame::Map(_) => Node::RaiseError(EffectError::internal(
                "value continuation popped as an error handler",
            )),
        };

        self.current = Some(next);
        Control::Continue
    }

    fn restore_token(&mut self, token: CancellationToken, next: Node) -> Control {
        self.current = Some(next);
        if token == self.token {
            return Control::Continue;
        }
        tracing::debug!(from = self.token.id(), to = token.id(), "restored cancellation token");
        self.token = token;
        Control::TokenChanged
    }
}

/// Call user code, turning a panic into an error.
fn guarded<T, F>(f: F, on_panic: Option<PanicMapper>) -> Result<T, EffectError>
where
    F: FnOnce() -> T,
{
    match catch_panic_unchecked(f) {
        CatchResult::Ok(value) => Ok(value),
        CatchResult::Panicked(info) => Err(map_panic(info, on_panic)),
    }
}

fn map_panic(info: PanicInfo, on_panic: Option<PanicMapper>) -> EffectError {
    match on_panic {
        None => EffectError::Panicked(info),
        Some(mapper) => match catch_panic_unchecked(move || mapper(info)) {
            CatchResult::Ok(err) => err,
            CatchResult::Panicked(second) => EffectError::Panicked(second),
        },
    }
}

/// Rewrite a context hop as an asynchronous boundary.
///
/// The source runs as a nested run on the same token, started from a task
/// scheduled on `context`. Its outcome completes the outer boundary from
/// wherever the nested run finished, so everything sequenced after the hop
/// continues there.
fn continue_on(source: Node, context: SharedContext) -> Node {
    Node::Async(Box::new(move |token: CancellationToken, callback: AsyncCallback| {
        tracing::debug!(context = context.name(), "continuing on execution context");
        context.execute(Box::new(move || {
            start(source, CallStack::new(), token, Terminal::forward(callback));
        }));
    }))
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

fn start(node: Node, stack: CallStack, token: CancellationToken, terminal: Arc<Terminal>) {
    drive(Machine::new(node, stack, token), terminal, None);
}

/// Run the machine until it finishes or parks at a boundary.
fn drive(mut machine: Machine, terminal: Arc<Terminal>, mut handle: Option<Arc<ResumeHandle>>) {
    loop {
        if machine.token.is_canceled() {
            tracing::debug!(token = machine.token.id(), "run observed cancellation");
            terminal.complete(Outcome::Canceled);
            return;
        }

        match machine.advance() {
            Control::Continue => {}
            Control::TokenChanged => {
                if let Some(handle) = &handle {
                    handle.update_token(machine.token.clone());
                }
            }
            Control::Completed(value) => {
                terminal.complete(Outcome::Completed(value));
                return;
            }
            Control::Failed(err) => {
                terminal.complete(Outcome::Errored(err));
                return;
            }
            Control::Suspend(register) => {
                let handle = handle
                    .get_or_insert_with(|| ResumeHandle::new(machine.token.clone(), terminal.clone()))
                    .clone();
                match suspend(&handle, &mut machine, register) {
                    None => return,
                    Some(Outcome::Completed(value)) => machine.current = Some(Node::Pure(value)),
                    Some(Outcome::Errored(err)) => machine.current = Some(Node::RaiseError(err)),
                    Some(Outcome::Canceled) => {
                        terminal.complete(Outcome::Canceled);
                        return;
                    }
                }
            }
        }
    }
}

/// Arm the handle and call the registration.
///
/// Returns the outcome if the registration completed synchronously, with the
/// stack moved back into the machine; otherwise the run has been handed off.
fn suspend(
    handle: &Arc<ResumeHandle>,
    machine: &mut Machine,
    register: Register,
) -> Option<Outcome<Value>> {
    handle.update_token(machine.token.clone());
    let epoch = handle.arm(mem::take(&mut machine.stack));
    tracing::trace!(epoch, "suspending at async boundary");

    let callback = AsyncCallback::new(handle.clone(), epoch);
    let token = machine.token.clone();
    let registration = callback.clone();
    if let CatchResult::Panicked(info) = catch_panic_unchecked(move || register(token, registration)) {
        callback.complete_outcome(Outcome::Errored(EffectError::Panicked(info)));
    }

    let (outcome, stack) = handle.detach(epoch)?;
    machine.stack = stack;
    Some(outcome)
}

/// Continue a run after its boundary fired on another thread, or after the
/// registering loop returned.
pub(crate) fn resume(handle: Arc<ResumeHandle>, outcome: Outcome<Value>, stack: CallStack) {
    let terminal = handle.terminal().clone();
    let node = match outcome {
        Outcome::Completed(value) => Node::Pure(value),
        Outcome::Errored(err) => Node::RaiseError(err),
        Outcome::Canceled => {
            terminal.complete(Outcome::Canceled);
            return;
        }
    };
    let machine = Machine::new(node, stack, handle.token());
    drive(machine, terminal, Some(handle));
}

// ----------------------------------------------------------------------------
// Entry points
// ----------------------------------------------------------------------------

/// Run `io` with an uncancelable root token.
///
/// `callback` is invoked exactly once, on whichever thread finishes the run,
/// unless an asynchronous boundary inside `io` never completes.
pub fn run<A, F>(io: Io<A>, callback: F)
where
    A: Send + 'static,
    F: FnOnce(Outcome<A>) + Send + 'static,
{
    run_cancelable(io, CancellationToken::uncancelable(), callback)
}

/// Run `io` under `token`.
///
/// Canceling the token stops the run at its next iteration and delivers
/// [`Outcome::Canceled`].
pub fn run_cancelable<A, F>(io: Io<A>, token: CancellationToken, callback: F)
where
    A: Send + 'static,
    F: FnOnce(Outcome<A>) + Send + 'static,
{
    let terminal = Terminal::new(Box::new(move |outcome| callback(downcast_outcome::<A>(outcome))));
    start(io.into_node(), CallStack::new(), token, terminal);
}

/// Evaluate the synchronous prefix of `io`.
///
/// Interprets nodes exactly like [`run`] until the result is known or the
/// next node needs the run's token (an asynchronous boundary or a token
/// switch). The returned effect is `pure`, `raise_error`, or the remaining
/// computation including every pending continuation. Does not check
/// cancellation.
pub fn step<A: Send + 'static>(io: Io<A>) -> Io<A> {
    let mut machine = Machine::new(io.into_node(), CallStack::new(), CancellationToken::uncancelable());

    loop {
        if machine.at_token_boundary() {
            let head = machine
                .current
                .take()
                .unwrap_or_else(|| Node::RaiseError(EffectError::internal("run loop reached an absent node")));
            return Io::from_node(residual(head, machine.stack));
        }

        match machine.advance() {
            Control::Continue | Control::TokenChanged => {}
            Control::Completed(value) => return Io::from_node(Node::Pure(value)),
            Control::Failed(err) => return Io::from_node(Node::RaiseError(err)),
            Control::Suspend(register) => {
                return Io::from_node(residual(Node::Async(register), machine.stack))
            }
        }
    }
}

/// The remaining computation after [`step`] stopped at `head`.
fn residual(head: Node, stack: CallStack) -> Node {
    if stack.is_empty() {
        return head;
    }
    tracing::trace!(pending = stack.len(), "step stopped with pending continuations");
    Node::Async(Box::new(move |token: CancellationToken, callback: AsyncCallback| {
        start(head, stack, token, Terminal::forward(callback));
    }))
}

/// Run `io` and block the current thread until it finishes.
///
/// Returns `None` if the run abandons itself: an asynchronous boundary
/// dropped its callback without completing it.
pub fn run_sync<A: Send + 'static>(io: Io<A>) -> Option<Outcome<A>> {
    run_sync_cancelable(io, CancellationToken::uncancelable())
}

/// [`run_sync`] under a caller-supplied token.
pub fn run_sync_cancelable<A: Send + 'static>(
    io: Io<A>,
    token: CancellationToken,
) -> Option<Outcome<A>> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    run_cancelable(io, token, move |outcome| {
        let _ = tx.send(outcome);
    });
    rx.recv().ok()
}
