//! # Effect Runtime
//!
//! A stack-safe interpreter for deferred effect descriptions:
//!
//! - **Effect Algebra**: [`Io<A>`], an immutable tree of pure values,
//!   failures, deferred thunks, asynchronous boundaries and sequencing
//! - **Trampoline Interpreter**: an iterative run loop with an explicit
//!   continuation stack, so bind chains of any depth run in constant native
//!   stack
//! - **Cancellation**: cooperative, cascading [`CancellationToken`]s checked
//!   once per loop iteration
//! - **Resumption**: single-shot handles that park a run at an asynchronous
//!   boundary and resume it, from any thread, when the boundary completes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        EFFECT RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Io<A> tree  │─▶│   Run Loop   │─▶│   Outcome    │          │
//! │  │ (effect.rs)  │  │(run_loop.rs) │  │  (error.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                       │        ▲                                │
//! │                 arm   ▼        │ fire                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Cancellation │  │ResumeHandle  │  │  Execution   │          │
//! │  │(cancellation)│  │ (resume.rs)  │  │  Contexts    │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The interpreter creates no threads. It runs on whichever thread calls an
//! entry point, and on whichever thread completes an asynchronous boundary
//! or executes a [`continue_on`](Io::continue_on) hop.
//!
//! ## Example
//!
//! ```rust
//! use effect_runtime::{run_sync, EffectError, Io, Outcome};
//!
//! let io = Io::suspend(|| Io::pure(2))
//!     .flat_map(|x| Io::pure(x + 3))
//!     .flat_map(|_| Io::<i32>::raise_error(EffectError::msg("boom")))
//!     .handle_error(|_| 0);
//!
//! assert!(matches!(run_sync(io), Some(Outcome::Completed(0))));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod effect;
pub mod error;
pub mod panic;
pub mod resume;
pub mod run_loop;

// Re-exports
pub use cancellation::{CancellationError, CancellationToken};
pub use config::{ConfigError, RunConfig, RunConfigBuilder};
pub use context::{ExecutionContext, Immediate, SharedContext, ThreadPerTask};
pub use effect::{Io, NodeKind, Resume};
pub use error::{EffectError, Outcome};
pub use panic::{install_panic_hook, PanicInfo};
pub use run_loop::{run, run_cancelable, run_sync, run_sync_cancelable, step};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a configuration for every run in this process.
///
/// Must be called before the first run that needs the configuration; runs
/// already using the defaults keep them. Fails if a configuration was
/// already installed.
pub fn init_with_config(config: RunConfig) -> Result<(), ConfigError> {
    config::install(config)?;
    tracing::debug!(config = ?config::current(), "run loop configuration installed");
    Ok(())
}

/// Install the configuration read from `EFFECT_*` environment variables.
pub fn init_from_env() -> Result<(), ConfigError> {
    init_with_config(RunConfig::try_from_env()?)
}

/// The configuration runs are using.
pub fn run_config() -> &'static RunConfig {
    config::current()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_run_config_is_valid() {
        assert!(run_config().validate().is_ok());
    }
}
