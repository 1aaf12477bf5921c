//! Run Loop Configuration
//!
//! Configuration can be set programmatically or loaded from environment
//! variables, then installed once for the whole process with
//! [`init_with_config`](crate::init_with_config). Runs started before
//! installation (or without it) use the defaults.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `EFFECT_INITIAL_STACK_CAPACITY` | Frames preallocated when a run first overflows its current-frame slot | 16 |
//! | `EFFECT_THREAD_NAME_PREFIX` | Name prefix for `ThreadPerTask` threads | `effect-worker` |
//!
//! # Example
//!
//! ```rust
//! use effect_runtime::config::RunConfig;
//!
//! let config = RunConfig::builder()
//!     .initial_stack_capacity(64)
//!     .thread_name_prefix("io")
//!     .build()
//!     .unwrap();
//! assert_eq!(config.initial_stack_capacity, 64);
//! ```

use std::env;
use std::sync::OnceLock;

use thiserror::Error;

/// Environment variable for [`RunConfig::initial_stack_capacity`].
pub const ENV_INITIAL_STACK_CAPACITY: &str = "EFFECT_INITIAL_STACK_CAPACITY";
/// Environment variable for [`RunConfig::thread_name_prefix`].
pub const ENV_THREAD_NAME_PREFIX: &str = "EFFECT_THREAD_NAME_PREFIX";

/// Upper bound for `initial_stack_capacity`.
const MAX_INITIAL_STACK_CAPACITY: usize = 1 << 20;

/// Process-wide configuration, installed at most once.
static RUN_CONFIG: OnceLock<RunConfig> = OnceLock::new();

/// Complete run loop configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Capacity of the overflow continuation stack when a run first needs it.
    /// Default: 16.
    pub initial_stack_capacity: usize,

    /// Prefix for threads spawned by `ThreadPerTask::from_config`.
    /// Default: `effect-worker`.
    pub thread_name_prefix: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            initial_stack_capacity: 16,
            thread_name_prefix: "effect-worker".to_string(),
        }
    }
}

impl RunConfig {
    /// Create a new builder for RunConfig.
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults. Invalid values are logged and
    /// ignored.
    pub fn from_env() -> Self {
        match Self::try_from_env() {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring invalid run loop environment configuration");
                Self::default()
            }
        }
    }

    /// Load configuration from environment variables, reporting bad values.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize(ENV_INITIAL_STACK_CAPACITY)? {
            config.initial_stack_capacity = val;
        }

        if let Ok(prefix) = env::var(ENV_THREAD_NAME_PREFIX) {
            config.thread_name_prefix = prefix;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_stack_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "initial_stack_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.initial_stack_capacity > MAX_INITIAL_STACK_CAPACITY {
            return Err(ConfigError::InvalidValue {
                field: "initial_stack_capacity".to_string(),
                message: format!("must be at most {}", MAX_INITIAL_STACK_CAPACITY),
            });
        }

        if self.thread_name_prefix.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "thread_name_prefix".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParseError {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
    /// A configuration was already installed for this process.
    #[error("run loop configuration is already initialized")]
    AlreadyInitialized,
}

/// Builder for RunConfig.
#[derive(Debug, Clone, Default)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial overflow stack capacity.
    pub fn initial_stack_capacity(mut self, capacity: usize) -> Self {
        self.config.initial_stack_capacity = capacity;
        self
    }

    /// Set the thread name prefix.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    /// Build the configuration, validating it.
    pub fn build(self) -> Result<RunConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Install `config` for the rest of the process.
pub(crate) fn install(config: RunConfig) -> Result<(), ConfigError> {
    config.validate()?;
    RUN_CONFIG
        .set(config)
        .map_err(|_| ConfigError::AlreadyInitialized)
}

/// The installed configuration, or the defaults.
pub fn current() -> &'static RunConfig {
    RUN_CONFIG.get_or_init(RunConfig::default)
}

/// The installed configuration, if one was installed.
pub fn installed() -> Option<&'static RunConfig> {
    RUN_CONFIG.get()
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Result<Option<usize>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: std::num::ParseIntError| ConfigError::EnvParseError {
                var: name.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.initial_stack_capacity, 16);
        assert_eq!(config.thread_name_prefix, "effect-worker");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RunConfig::builder()
            .initial_stack_capacity(128)
            .thread_name_prefix("pool")
            .build()
            .unwrap();

        assert_eq!(config.initial_stack_capacity, 128);
        assert_eq!(config.thread_name_prefix, "pool");
    }

    #[test]
    fn test_builder_validation() {
        let err = RunConfig::builder()
            .initial_stack_capacity(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "initial_stack_capacity"));

        let err = RunConfig::builder()
            .initial_stack_capacity(MAX_INITIAL_STACK_CAPACITY + 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = RunConfig::builder()
            .thread_name_prefix("   ")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "thread_name_prefix"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "initial_stack_capacity".to_string(),
            message: "must be at least 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid configuration for 'initial_stack_capacity': must be at least 1"
        );

        let err = ConfigError::EnvParseError {
            var: ENV_INITIAL_STACK_CAPACITY.to_string(),
            message: "invalid digit found in string".to_string(),
        };
        assert!(err.to_string().contains(ENV_INITIAL_STACK_CAPACITY));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        // Env vars are not set in the test environment.
        let config = RunConfig::from_env();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_current_is_valid() {
        assert!(current().validate().is_ok());
    }
}
