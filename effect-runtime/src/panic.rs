//! Panic Capture
//!
//! Every piece of user code the run loop calls (thunks, continuations, error
//! handlers, async registration functions, token modifiers) is invoked through
//! this module. A panic that unwinds out of user code is caught at that single
//! call site and turned into a [`PanicInfo`] value, which the run loop then
//! raises as an ordinary effect error. Panics never cross the interpreter.
//!
//! # Panic Hook
//!
//! Catching happens after the process panic hook has run, so by default
//! every captured panic is still reported on stderr. Call
//! [`install_panic_hook`] once to skip the report for panics raised under
//! [`catch_panic`]; other panics still reach the previous hook.
//!
//! # Example
//!
//! ```rust
//! use effect_runtime::panic::{catch_panic_unchecked, CatchResult};
//!
//! let result: CatchResult<i32> = catch_panic_unchecked(|| panic!("oops"));
//! match result {
//!     CatchResult::Ok(_) => unreachable!(),
//!     CatchResult::Panicked(info) => assert_eq!(info.message(), "oops"),
//! }
//! ```

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Number of panics captured by [`catch_panic`] since process start.
static CAPTURED_PANICS: AtomicU64 = AtomicU64::new(0);

/// Whether [`install_panic_hook`] has run.
static HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Nesting depth of [`catch_panic`] on this thread.
    static CATCH_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Information about a captured panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicInfo {
    /// Panic message.
    message: String,
    /// Stack backtrace, when `RUST_BACKTRACE` enables capture.
    backtrace: Option<String>,
    /// Sequence number of this capture.
    count: u64,
    /// Thread name where the panic was caught.
    thread_name: Option<String>,
}

impl PanicInfo {
    /// Build panic info from a message, outside of an actual unwind.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: None,
            count: CAPTURED_PANICS.load(Ordering::Relaxed),
            thread_name: std::thread::current().name().map(str::to_string),
        }
    }

    /// Get the panic message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the stack backtrace, if one was captured.
    pub fn backtrace(&self) -> Option<&str> {
        self.backtrace.as_deref()
    }

    /// Get the capture sequence number.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Get the thread name, if available.
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// Format with thread and backtrace detail for logging.
    pub fn format(&self) -> String {
        let mut output = format!("panic #{}: {}\n", self.count, self.message);

        match &self.thread_name {
            Some(thread) => output.push_str(&format!("  in thread '{}'\n", thread)),
            None => output.push_str("  in unnamed thread\n"),
        }

        if let Some(bt) = &self.backtrace {
            output.push_str("\nBacktrace:\n");
            output.push_str(bt);
        }

        output
    }
}

impl fmt::Display for PanicInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Result of running a closure under a panic guard.
#[derive(Debug)]
pub enum CatchResult<T> {
    /// The closure returned normally.
    Ok(T),
    /// The closure panicked.
    Panicked(PanicInfo),
}

impl<T> CatchResult<T> {
    /// Returns true if the closure returned normally.
    pub fn is_ok(&self) -> bool {
        matches!(self, CatchResult::Ok(_))
    }

    /// Returns true if the closure panicked.
    pub fn is_panicked(&self) -> bool {
        matches!(self, CatchResult::Panicked(_))
    }

    /// Converts to a standard Result.
    pub fn into_result(self) -> Result<T, PanicInfo> {
        match self {
            CatchResult::Ok(v) => Ok(v),
            CatchResult::Panicked(info) => Err(info),
        }
    }

    /// Maps the Ok value.
    pub fn map<U, F>(self, f: F) -> CatchResult<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            CatchResult::Ok(v) => CatchResult::Ok(f(v)),
            CatchResult::Panicked(info) => CatchResult::Panicked(info),
        }
    }

    /// Returns the Ok value or computes one from the panic info.
    pub fn unwrap_or_else<F>(self, f: F) -> T
    where
        F: FnOnce(PanicInfo) -> T,
    {
        match self {
            CatchResult::Ok(v) => v,
            CatchResult::Panicked(info) => f(info),
        }
    }
}

/// Catch panics from a closure.
///
/// Wraps `std::panic::catch_unwind` and converts the payload into a
/// [`PanicInfo`].
pub fn catch_panic<F, R>(f: F) -> CatchResult<R>
where
    F: FnOnce() -> R + std::panic::UnwindSafe,
{
    CATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let result = std::panic::catch_unwind(f);
    CATCH_DEPTH.with(|depth| depth.set(depth.get() - 1));

    match result {
        Ok(value) => CatchResult::Ok(value),
        Err(payload) => {
            let count = CAPTURED_PANICS.fetch_add(1, Ordering::Relaxed) + 1;
            let info = PanicInfo {
                message: payload_message(payload.as_ref()),
                backtrace: capture_backtrace(),
                count,
                thread_name: std::thread::current().name().map(str::to_string),
            };
            tracing::debug!(count, message = %info.message, "captured panic from user code");
            CatchResult::Panicked(info)
        }
    }
}

/// Catch panics from a closure that is not statically unwind-safe.
///
/// Callers must not read state the closure may have left half-updated.
pub fn catch_panic_unchecked<F, R>(f: F) -> CatchResult<R>
where
    F: FnOnce() -> R,
{
    catch_panic(std::panic::AssertUnwindSafe(f))
}

/// Install a process panic hook that stays silent for captured panics.
///
/// Panics raised inside [`catch_panic`] are already reported as effect
/// errors and logged at debug level; the hook skips them. Any other panic
/// is passed to the hook that was installed before. Only the first call
/// has an effect.
pub fn install_panic_hook() {
    if HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if !is_catching() {
            previous(info);
        }
    }));
}

/// Whether the current thread is inside [`catch_panic`].
pub fn is_catching() -> bool {
    CATCH_DEPTH.with(|depth| depth.get() > 0)
}

/// Number of panics captured so far.
pub fn captured_panic_count() -> u64 {
    CAPTURED_PANICS.load(Ordering::Relaxed)
}

/// Capture a backtrace at the current location, if enabled.
pub fn capture_backtrace() -> Option<String> {
    let bt = Backtrace::capture();
    match bt.status() {
        BacktraceStatus::Captured => Some(bt.to_string()),
        _ => None,
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
