//! # Effect Algebra
//!
//! [`Io<A>`] is an immutable description of a computation producing an `A`.
//! Building one performs no work; the run loop in [`run_loop`](crate::run_loop)
//! interprets it later.
//!
//! ## Representation
//!
//! Internally an `Io<A>` is a [`Node`]: a closed tagged union over the kinds of
//! step the interpreter knows about. Values travelling between nodes are
//! type-erased (`Box<dyn Any + Send>`), the same way captured continuations
//! carry their resume values; the typed wrapper downcasts at each closure it
//! installs, so a mismatch can only come from a broken invariant and is
//! reported as [`EffectError::Internal`].
//!
//! ## One-Shot
//!
//! Every closure inside a node is `FnOnce`, so an `Io` is consumed by running
//! it. To run the same description twice, build it twice.
//!
//! ## Example
//!
//! ```rust
//! use effect_runtime::{run_sync, Io, Outcome};
//!
//! let io = Io::suspend(|| Io::pure(2)).flat_map(|x| Io::pure(x + 3));
//! assert!(matches!(run_sync(io), Some(Outcome::Completed(5))));
//! ```

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use crate::cancellation::CancellationToken;
use crate::context::SharedContext;
use crate::error::{EffectError, Outcome};
use crate::panic::PanicInfo;
use crate::resume::AsyncCallback;

/// A type-erased value flowing through the run loop.
pub(crate) type Value = Box<dyn Any + Send>;

pub(crate) type Thunk = Box<dyn FnOnce() -> Node + Send>;
pub(crate) type DelayThunk = Box<dyn FnOnce() -> Value + Send>;
pub(crate) type PanicMapper = Box<dyn FnOnce(PanicInfo) -> EffectError + Send>;
pub(crate) type Register = Box<dyn FnOnce(CancellationToken, AsyncCallback) + Send>;
pub(crate) type BindFn = Box<dyn FnOnce(Value) -> Node + Send>;
pub(crate) type MapFn = Box<dyn FnOnce(Value) -> Result<Value, EffectError> + Send>;
pub(crate) type RecoverFn = Box<dyn FnOnce(EffectError) -> Node + Send>;
pub(crate) type ModifyFn = Box<dyn FnOnce(&CancellationToken) -> CancellationToken + Send>;
pub(crate) type RestoreFn = Box<
    dyn FnOnce(
            Result<&Value, &EffectError>,
            &CancellationToken,
            &CancellationToken,
        ) -> Result<CancellationToken, EffectError>
        + Send,
>;

/// One step of an effect description.
pub(crate) enum Node {
    /// Already-computed result.
    Pure(Value),
    /// Already-failed result.
    RaiseError(EffectError),
    /// Lazily produces the next node.
    Suspend {
        thunk: Thunk,
        on_panic: Option<PanicMapper>,
    },
    /// Lazily produces a raw value inline.
    Delay {
        thunk: DelayThunk,
        on_panic: Option<PanicMapper>,
    },
    /// Asynchronous boundary.
    Async(Register),
    /// Sequencing through a value continuation.
    Bind(Source, BindFn),
    /// Sequencing through a pure value transform.
    Map(Source, MapFn),
    /// Sequencing through a handler-capable frame.
    Recover(Source, Frame),
    /// Run `source` and resume subsequent work on another context.
    ContinueOn(Source, SharedContext),
    /// Scoped replacement of the active cancellation token.
    ContextSwitch {
        source: Source,
        modify: ModifyFn,
        restore: Option<RestoreFn>,
    },
}

impl Node {
    pub(crate) fn kind(&self) -> NodeKind {
        match self {
            Node::Pure(_) => NodeKind::Pure,
            Node::RaiseError(_) => NodeKind::RaiseError,
            Node::Suspend { .. } => NodeKind::Suspend,
            Node::Delay { .. } => NodeKind::Delay,
            Node::Async(_) => NodeKind::Async,
            Node::Bind(..) => NodeKind::Bind,
            Node::Map(..) => NodeKind::Map,
            Node::Recover(..) => NodeKind::Recover,
            Node::ContinueOn(..) => NodeKind::ContinueOn,
            Node::ContextSwitch { .. } => NodeKind::ContextSwitch,
        }
    }

    pub(crate) fn from_outcome(outcome: Result<Value, EffectError>) -> Node {
        match outcome {
            Ok(value) => Node::Pure(value),
            Err(err) => Node::RaiseError(err),
        }
    }

    fn source_mut(&mut self) -> Option<&mut Source> {
        match self {
            Node::Bind(source, _)
            | Node::Map(source, _)
            | Node::Recover(source, _)
            | Node::ContinueOn(source, _)
            | Node::ContextSwitch { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// The sub-effect a sequencing node runs first.
///
/// Released iteratively: an unrun left-nested chain of any depth is
/// dropped without recursing once per level.
pub(crate) struct Source(Option<Box<Node>>);

impl Source {
    pub(crate) fn new(node: Node) -> Self {
        Source(Some(Box::new(node)))
    }

    pub(crate) fn into_node(mut self) -> Node {
        match self.0.take() {
            Some(node) => *node,
            None => Node::RaiseError(EffectError::internal("effect source was already taken")),
        }
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        let mut next = self.0.take();
        while let Some(mut node) = next {
            next = node.source_mut().and_then(|source| source.0.take());
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::RaiseError(err) => f.debug_tuple("RaiseError").field(err).finish(),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

/// Discriminant of an effect node, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Already-computed result.
    Pure,
    /// Already-failed result.
    RaiseError,
    /// Deferred node producer.
    Suspend,
    /// Deferred value producer.
    Delay,
    /// Asynchronous boundary.
    Async,
    /// Value continuation.
    Bind,
    /// Pure value transform.
    Map,
    /// Error handler or value/error fold.
    Recover,
    /// Execution context hop.
    ContinueOn,
    /// Cancellation token replacement.
    ContextSwitch,
}

/// A continuation frame waiting on the call stack.
pub(crate) enum Frame {
    /// Value continuation.
    Bind(BindFn),
    /// Pure value transform; the result re-enters as `Pure`.
    Map(MapFn),
    /// Pure error handler; skipped when a value is looking for a continuation.
    Handler(RecoverFn),
    /// Handles both outcomes.
    Redeem { on_value: BindFn, on_error: RecoverFn },
    /// Puts a cancellation token back after a scoped switch, on both outcomes.
    Restore {
        old: CancellationToken,
        restore: RestoreFn,
    },
}

impl Frame {
    /// Whether this frame takes a value.
    pub(crate) fn accepts_value(&self) -> bool {
        !matches!(self, Frame::Handler(_))
    }

    /// Whether this frame takes an error.
    pub(crate) fn accepts_error(&self) -> bool {
        matches!(
            self,
            Frame::Handler(_) | Frame::Redeem { .. } | Frame::Restore { .. }
        )
    }
}

/// Downcast an erased value to the type a typed closure expects.
pub(crate) fn downcast_value<A: Any>(value: Value) -> Result<A, EffectError> {
    value
        .downcast::<A>()
        .map(|boxed| *boxed)
        .map_err(|_| type_mismatch::<A>())
}

pub(crate) fn downcast_outcome<A: Any>(outcome: Outcome<Value>) -> Outcome<A> {
    match outcome {
        Outcome::Completed(value) => match downcast_value::<A>(value) {
            Ok(a) => Outcome::Completed(a),
            Err(err) => Outcome::Errored(err),
        },
        Outcome::Errored(err) => Outcome::Errored(err),
        Outcome::Canceled => Outcome::Canceled,
    }
}

fn type_mismatch<A>() -> EffectError {
    EffectError::internal(format!(
        "continuation expected a value of type {}",
        std::any::type_name::<A>()
    ))
}

/// Typed continuation: downcast, call, unwrap the next node.
fn bind_fn<A, B, F>(f: F) -> BindFn
where
    A: Send + 'static,
    B: Send + 'static,
    F: FnOnce(A) -> Io<B> + Send + 'static,
{
    Box::new(move |value: Value| match downcast_value::<A>(value) {
        Ok(a) => f(a).node,
        Err(err) => Node::RaiseError(err),
    })
}

fn recover_fn<A, F>(f: F) -> RecoverFn
where
    A: Send + 'static,
    F: FnOnce(EffectError) -> Io<A> + Send + 'static,
{
    Box::new(move |err: EffectError| f(err).node)
}

/// A description of a computation producing an `A`.
#[must_use = "an Io does nothing until it is run"]
pub struct Io<A> {
    node: Node,
    _marker: PhantomData<fn() -> A>,
}

impl<A> fmt::Debug for Io<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Io").field(&self.node).finish()
    }
}

impl<A: Send + 'static> Io<A> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_node(self) -> Node {
        self.node
    }

    /// Which kind of node this description starts with.
    pub fn kind(&self) -> NodeKind {
        self.node.kind()
    }

    /// The value, if this is an already-computed result.
    pub fn pure_value(self) -> Option<A> {
        match self.node {
            Node::Pure(value) => downcast_value::<A>(value).ok(),
            _ => None,
        }
    }

    /// The error, if this is an already-failed result.
    pub fn raised_error(&self) -> Option<&EffectError> {
        match &self.node {
            Node::RaiseError(err) => Some(err),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// An already-computed value.
    pub fn pure(value: A) -> Self {
        Self::from_node(Node::Pure(Box::new(value)))
    }

    /// An already-failed computation.
    pub fn raise_error(error: EffectError) -> Self {
        Self::from_node(Node::RaiseError(error))
    }

    /// Lift a `Result`.
    pub fn from_result(result: Result<A, EffectError>) -> Self {
        match result {
            Ok(value) => Self::pure(value),
            Err(err) => Self::raise_error(err),
        }
    }

    /// Defer building the rest of the computation until it runs.
    ///
    /// A panic in `thunk` becomes [`EffectError::Panicked`].
    pub fn suspend<F>(thunk: F) -> Self
    where
        F: FnOnce() -> Io<A> + Send + 'static,
    {
        Self::from_node(Node::Suspend {
            thunk: Box::new(move || thunk().node),
            on_panic: None,
        })
    }

    /// Like [`suspend`](Self::suspend), mapping a panic through `on_panic`.
    pub fn suspend_with<F, M>(thunk: F, on_panic: M) -> Self
    where
        F: FnOnce() -> Io<A> + Send + 'static,
        M: FnOnce(PanicInfo) -> EffectError + Send + 'static,
    {
        Self::from_node(Node::Suspend {
            thunk: Box::new(move || thunk().node),
            on_panic: Some(Box::new(on_panic)),
        })
    }

    /// Compute a value lazily, inline.
    ///
    /// A panic in `thunk` becomes [`EffectError::Panicked`].
    pub fn delay<F>(thunk: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::from_node(Node::Delay {
            thunk: Box::new(move || Box::new(thunk()) as Value),
            on_panic: None,
        })
    }

    /// Like [`delay`](Self::delay), mapping a panic through `on_panic`.
    pub fn delay_with<F, M>(thunk: F, on_panic: M) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
        M: FnOnce(PanicInfo) -> EffectError + Send + 'static,
    {
        Self::from_node(Node::Delay {
            thunk: Box::new(move || Box::new(thunk()) as Value),
            on_panic: Some(Box::new(on_panic)),
        })
    }

    /// Compute a fallible value lazily.
    pub fn try_delay<F>(thunk: F) -> Self
    where
        F: FnOnce() -> Result<A, EffectError> + Send + 'static,
    {
        Self::suspend(move || Self::from_result(thunk()))
    }

    /// An asynchronous computation.
    ///
    /// `register` receives the active cancellation token and a [`Resume`]
    /// callback. It should arrange for the callback to be invoked once; any
    /// invocation after the first is ignored. If the callback is dropped
    /// without being invoked, the run never completes.
    pub fn from_async<F>(register: F) -> Self
    where
        F: FnOnce(CancellationToken, Resume<A>) + Send + 'static,
    {
        Self::from_node(Node::Async(Box::new(
            move |token: CancellationToken, callback: AsyncCallback| {
                register(
                    token,
                    Resume {
                        callback,
                        _marker: PhantomData,
                    },
                )
            },
        )))
    }

    /// A computation that never completes.
    pub fn never() -> Self {
        Self::from_async(|_, _| {})
    }

    // ------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------

    /// Feed the result into `f` and continue with the effect it returns.
    pub fn flat_map<B, F>(self, f: F) -> Io<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Io<B> + Send + 'static,
    {
        Io::from_node(Node::Bind(Source::new(self.node), bind_fn(f)))
    }

    /// Transform the result.
    pub fn map<B, F>(self, f: F) -> Io<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        let transform: MapFn = Box::new(move |value: Value| {
            downcast_value::<A>(value).map(|a| Box::new(f(a)) as Value)
        });
        Io::from_node(Node::Map(Source::new(self.node), transform))
    }

    /// Run `next` after this, discarding this result.
    pub fn then<B>(self, next: Io<B>) -> Io<B>
    where
        B: Send + 'static,
    {
        self.flat_map(move |_| next)
    }

    // ------------------------------------------------------------------
    // Error handling
    // ------------------------------------------------------------------

    /// Recover from a failure with another effect.
    pub fn handle_error_with<F>(self, f: F) -> Io<A>
    where
        F: FnOnce(EffectError) -> Io<A> + Send + 'static,
    {
        Io::from_node(Node::Recover(
            Source::new(self.node),
            Frame::Handler(recover_fn(f)),
        ))
    }

    /// Recover from a failure with a value.
    pub fn handle_error<F>(self, f: F) -> Io<A>
    where
        F: FnOnce(EffectError) -> A + Send + 'static,
    {
        self.handle_error_with(move |err| Io::pure(f(err)))
    }

    /// Transform a failure, keeping it a failure.
    pub fn map_error<F>(self, f: F) -> Io<A>
    where
        F: FnOnce(EffectError) -> EffectError + Send + 'static,
    {
        self.handle_error_with(move |err| Io::raise_error(f(err)))
    }

    /// Continue with `on_value` or `on_error`, whichever applies.
    pub fn redeem_with<B, FE, FV>(self, on_error: FE, on_value: FV) -> Io<B>
    where
        B: Send + 'static,
        FE: FnOnce(EffectError) -> Io<B> + Send + 'static,
        FV: FnOnce(A) -> Io<B> + Send + 'static,
    {
        Io::from_node(Node::Recover(
            Source::new(self.node),
            Frame::Redeem {
                on_value: bind_fn(on_value),
                on_error: recover_fn(on_error),
            },
        ))
    }

    /// Fold both outcomes into a value.
    pub fn redeem<B, FE, FV>(self, on_error: FE, on_value: FV) -> Io<B>
    where
        B: Send + 'static,
        FE: FnOnce(EffectError) -> B + Send + 'static,
        FV: FnOnce(A) -> B + Send + 'static,
    {
        self.redeem_with(
            move |err| Io::pure(on_error(err)),
            move |a| Io::pure(on_value(a)),
        )
    }

    /// Expose a failure as a value.
    pub fn attempt(self) -> Io<Result<A, EffectError>> {
        self.redeem(Err, Ok)
    }

    // ------------------------------------------------------------------
    // Context
    // ------------------------------------------------------------------

    /// Run this effect on `context`; everything sequenced after it also runs
    /// there.
    pub fn continue_on(self, context: SharedContext) -> Io<A> {
        Io::from_node(Node::ContinueOn(Source::new(self.node), context))
    }

    /// Run this effect under the token returned by `modify`.
    ///
    /// The replacement is not undone afterwards; see
    /// [`context_switch_scoped`](Self::context_switch_scoped).
    pub fn context_switch<M>(self, modify: M) -> Io<A>
    where
        M: FnOnce(&CancellationToken) -> CancellationToken + Send + 'static,
    {
        Io::from_node(Node::ContextSwitch {
            source: Source::new(self.node),
            modify: Box::new(modify),
            restore: None,
        })
    }

    /// Run this effect under the token returned by `modify`, then install
    /// the token returned by `restore`.
    ///
    /// `restore` receives the outcome, the token active before the switch
    /// and the token active when this effect finished. It runs on success
    /// and on failure, and only if `modify` actually changed the token.
    pub fn context_switch_scoped<M, R>(self, modify: M, restore: R) -> Io<A>
    where
        M: FnOnce(&CancellationToken) -> CancellationToken + Send + 'static,
        R: FnOnce(Result<&A, &EffectError>, &CancellationToken, &CancellationToken) -> CancellationToken
            + Send
            + 'static,
    {
        let restore: RestoreFn = Box::new(
            move |outcome: Result<&Value, &EffectError>,
                  old: &CancellationToken,
                  current: &CancellationToken| {
                let typed = match outcome {
                    Ok(value) => match value.downcast_ref::<A>() {
                        Some(a) => Ok(a),
                        None => return Err(type_mismatch::<A>()),
                    },
                    Err(err) => Err(err),
                };
                Ok(restore(typed, old, current))
            },
        );

        Io::from_node(Node::ContextSwitch {
            source: Source::new(self.node),
            modify: Box::new(modify),
            restore: Some(restore),
        })
    }

    /// Run this effect without observing cancellation.
    ///
    /// The surrounding token is put back afterwards, so a cancellation
    /// requested meanwhile is observed right after this effect finishes.
    pub fn uncancelable(self) -> Io<A> {
        self.context_switch_scoped(
            |_| CancellationToken::uncancelable(),
            |_, old, _| old.clone(),
        )
    }
}

impl Io<()> {
    /// The unit value.
    pub fn unit() -> Self {
        Io::pure(())
    }
}

/// Completion callback handed to [`Io::from_async`] registrations.
///
/// Cloneable and callable from any thread. Only the first completion counts.
pub struct Resume<A> {
    callback: AsyncCallback,
    _marker: PhantomData<fn(A)>,
}

impl<A> Clone for Resume<A> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for Resume<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Resume").field(&self.callback).finish()
    }
}

impl<A: Send + 'static> Resume<A> {
    /// Complete the asynchronous computation.
    pub fn complete(&self, result: Result<A, EffectError>) {
        self.callback
            .complete(result.map(|value| Box::new(value) as Value));
    }

    /// Complete with a value.
    pub fn succeed(&self, value: A) {
        self.complete(Ok(value));
    }

    /// Complete with an error.
    pub fn fail(&self, error: EffectError) {
        self.complete(Err(error));
    }
}
