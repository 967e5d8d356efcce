//! Descriptor loading for the daemon.
//!
//! A descriptor comes from a JSON file when one is named (first CLI
//! argument, else `VTPMD_CONFIG`); otherwise it is assembled from
//! environment variables with sensible defaults.

use std::path::PathBuf;
use thiserror::Error;
use vtpm_core::{ConfigError, Descriptor, TpmVersion, DESCRIPTOR_VERSION};

/// Transport used when `VTPMD_SERVER` is not set.
pub const DEFAULT_SERVER: &str = "type=tcp";

/// Errors while assembling a descriptor.
#[derive(Debug, Error)]
pub enum DaemonConfigError {
    /// Descriptor file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Descriptor file or variables were rejected
    #[error(transparent)]
    Descriptor(#[from] ConfigError),

    /// `VTPMD_TPM_VERSION` is not a known version
    #[error("invalid VTPMD_TPM_VERSION '{0}' (expected 1.2 or 2)")]
    TpmVersion(String),
}

/// Load the descriptor for this process.
///
/// `path` is the first CLI argument, if any.
pub fn load_descriptor(path: Option<String>) -> Result<Descriptor, DaemonConfigError> {
    let path = path.or_else(|| std::env::var("VTPMD_CONFIG").ok());
    match path {
        Some(path) => from_file(PathBuf::from(path)),
        None => from_env(),
    }
}

/// Read a JSON descriptor file.
pub fn from_file(path: PathBuf) -> Result<Descriptor, DaemonConfigError> {
    let contents = std::fs::read_to_string(&path).map_err(|source| DaemonConfigError::Read {
        path: path.clone(),
        source,
    })?;
    tracing::debug!(path = %path.display(), "Descriptor loaded from file");
    Ok(Descriptor::from_json(&contents)?)
}

/// Assemble a descriptor from environment variables.
///
/// | Variable | Default |
/// |----------|---------|
/// | `VTPMD_TPM_VERSION` | `2` (`1.2` or `2`) |
/// | `VTPMD_TPMSTATE` | none (required by the run) |
/// | `VTPMD_SERVER` | `type=tcp` (port 6545) |
/// | `VTPMD_CTRL` | none |
/// | `VTPMD_LOG` | none (stderr) |
/// | `VTPMD_PID` | none |
/// | `VTPMD_KEY` | none |
/// | `VTPMD_MIGRATION_KEY` | none |
/// | `VTPMD_LOCALITY` | none |
/// | `VTPMD_FLAGS` | none (wait for init) |
/// | `VTPMD_SECCOMP` | none (`action=kill`) |
/// | `VTPMD_MIGRATION` | none |
pub fn from_env() -> Result<Descriptor, DaemonConfigError> {
    from_vars(|name| std::env::var(name).ok())
}

/// Same as [`from_env`] with a custom variable lookup.
pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Descriptor, DaemonConfigError> {
    // Empty variables count as unset.
    let get = |name: &str| var(name).filter(|v| !v.trim().is_empty());

    let tpm_version = match get("VTPMD_TPM_VERSION").as_deref() {
        None | Some("2") | Some("2.0") => TpmVersion::Tpm2,
        Some("1.2") => TpmVersion::Tpm12,
        Some(other) => return Err(DaemonConfigError::TpmVersion(other.to_string())),
    };

    Ok(Descriptor {
        descriptor_version: DESCRIPTOR_VERSION,
        tpm_version: tpm_version.selector(),
        key: get("VTPMD_KEY"),
        migration_key: get("VTPMD_MIGRATION_KEY"),
        log: get("VTPMD_LOG"),
        pid: get("VTPMD_PID"),
        locality: get("VTPMD_LOCALITY"),
        tpmstate: get("VTPMD_TPMSTATE"),
        ctrl: get("VTPMD_CTRL"),
        server: get("VTPMD_SERVER").or_else(|| Some(DEFAULT_SERVER.to_string())),
        flags: get("VTPMD_FLAGS"),
        seccomp: get("VTPMD_SECCOMP"),
        migration: get("VTPMD_MIGRATION"),
    })
}
