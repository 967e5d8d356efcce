//! State storage sub-option and its process-wide registration.
//!
//! The storage location is global state: it is registered once per run by
//! [`init`] and must be dropped again by [`release`] during teardown.

use crate::descriptor::TpmVersion;
use crate::error::AcquireError;
use crate::options::parse_optional;
use std::path::PathBuf;
use std::sync::Mutex;

const SUBSYSTEM: &str = "tpmstate";

/// File mode for newly written state blobs unless `mode=` says otherwise.
pub const DEFAULT_MODE: u32 = 0o640;

static LOCATION: Mutex<Option<StateLocation>> = Mutex::new(None);

/// Where and how device state is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLocation {
    /// Existing directory holding the state blobs
    pub dir: PathBuf,
    /// File mode for written blobs
    pub mode: u32,
    /// Device version; selects the blob name prefix
    pub version: TpmVersion,
}

impl StateLocation {
    /// Parse `dir=<path>[,mode=<octal>]`. The directory must already exist.
    pub fn parse(input: Option<&str>, version: TpmVersion) -> Result<Self, AcquireError> {
        let opts = parse_optional(SUBSYSTEM, input)?;
        opts.check_keys(SUBSYSTEM, &["dir", "mode"])?;

        let Some(dir) = opts.get_path("dir") else {
            return Err(AcquireError::option(SUBSYSTEM, "'dir' is required"));
        };
        let meta = std::fs::metadata(&dir).map_err(AcquireError::io(SUBSYSTEM))?;
        if !meta.is_dir() {
            return Err(AcquireError::option(
                SUBSYSTEM,
                format!("{} is not a directory", dir.display()),
            ));
        }

        Ok(Self {
            dir,
            mode: opts.get_mode(SUBSYSTEM, "mode")?.unwrap_or(DEFAULT_MODE),
            version,
        })
    }
}

/// Register the state location for this process.
///
/// # Errors
/// [`AcquireError::AlreadyInitialized`] if a location is already registered.
pub fn init(location: StateLocation) -> Result<(), AcquireError> {
    let mut slot = LOCATION.lock().unwrap_or_else(|e| e.into_inner());
    if slot.is_some() {
        return Err(AcquireError::AlreadyInitialized(SUBSYSTEM));
    }
    tracing::debug!(subsystem = SUBSYSTEM, dir = %location.dir.display(), version = %location.version, "State storage registered");
    *slot = Some(location);
    Ok(())
}

/// Currently registered location, if any.
pub fn current() -> Option<StateLocation> {
    LOCATION.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Drop the registered location. Idempotent.
pub fn release() {
    LOCATION.lock().unwrap_or_else(|e| e.into_inner()).take();
}
