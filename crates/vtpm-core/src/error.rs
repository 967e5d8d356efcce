//! Error types for vtpm-core.

use thiserror::Error;

/// Result type alias for vtpm-core operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Descriptor rejected before any resource was touched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Shape tag does not match what this supervisor understands
    #[error("descriptor version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    /// Device version selector is not a supported variant
    #[error("unsupported TPM version selector: {0}")]
    UnsupportedTpmVersion(u32),

    /// Two options that cannot be combined
    #[error("conflicting options: {0}")]
    Conflict(String),

    /// Descriptor could not be decoded at all
    #[error("malformed descriptor: {0}")]
    Malformed(String),
}

/// Failure of a single resource acquirer.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Sub-option rejected by its acquirer
    #[error("invalid {subsystem} option: {reason}")]
    Option {
        subsystem: &'static str,
        reason: String,
    },

    /// The resource itself could not be obtained
    #[error("{subsystem}: {source}")]
    Io {
        subsystem: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Subsystem is already initialized for this process
    #[error("{0} is already initialized")]
    AlreadyInitialized(&'static str),

    /// Sandbox policy could not be compiled or installed
    #[error("sandbox: {0}")]
    Sandbox(String),
}

impl AcquireError {
    pub(crate) fn option(subsystem: &'static str, reason: impl Into<String>) -> Self {
        Self::Option {
            subsystem,
            reason: reason.into(),
        }
    }

    pub(crate) fn io(subsystem: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { subsystem, source }
    }

    /// Subsystem this error belongs to.
    pub fn subsystem(&self) -> &'static str {
        match self {
            Self::Option { subsystem, .. } | Self::Io { subsystem, .. } => subsystem,
            Self::AlreadyInitialized(subsystem) => subsystem,
            Self::Sandbox(_) => "seccomp",
        }
    }
}

/// Errors reported across the device engine boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Engine does not support the requested version
    #[error("engine rejected TPM version {0}")]
    Version(String),

    /// Engine rejected the callback table
    #[error("callback registration failed: {0}")]
    Register(String),

    /// Engine failed to start
    #[error("engine start failed: {0}")]
    Start(String),

    /// Storage could not be locked for exclusive use
    #[error("storage lock failed: {0}")]
    StorageLock(#[from] StoreError),
}

/// Errors raised by the persistent store callbacks.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Named blob does not exist
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Storage lock is held by another process
    #[error("storage at {0} is locked by another process")]
    Locked(std::path::PathBuf),

    /// Store was shut down
    #[error("store is shut down")]
    Shutdown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the command loop collaborator.
#[derive(Debug, Error)]
pub enum LoopError {
    /// Transport or control channel failure
    #[error("loop I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device engine failure during deferred init or processing
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Any failure of a supervisor run.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Descriptor rejected
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource acquisition failed
    #[error("resource acquisition failed: {0}")]
    Acquire(#[from] AcquireError),

    /// Device engine failed
    #[error("device engine error: {0}")]
    Engine(#[from] EngineError),

    /// Termination bridge could not be created
    #[error("termination bridge: {0}")]
    Bridge(#[source] std::io::Error),

    /// Command loop exited with an error
    #[error("command loop failed: {0}")]
    Loop(#[from] LoopError),
}

impl SupervisorError {
    /// True for descriptor rejections, which never hold resources.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::VersionMismatch {
            expected: 1,
            actual: 7,
        };
        assert_eq!(
            err.to_string(),
            "descriptor version mismatch: expected 1, got 7"
        );

        let err = AcquireError::option("pid", "unknown key 'foo'");
        assert_eq!(err.to_string(), "invalid pid option: unknown key 'foo'");
        assert_eq!(err.subsystem(), "pid");
    }

    #[test]
    fn test_supervisor_error_classification() {
        let err: SupervisorError = ConfigError::UnsupportedTpmVersion(9).into();
        assert!(err.is_config());

        let err: SupervisorError = AcquireError::AlreadyInitialized("tpmstate").into();
        assert!(!err.is_config());
    }
}
