//! Device engine boundary.
//!
//! The engine interprets TPM commands and owns all cryptographic state. The
//! supervisor only drives it through [`DeviceEngine`] and hands it a
//! [`Callbacks`] table for persistence and I/O.

use crate::descriptor::TpmVersion;
use crate::error::{EngineError, StoreError};
use std::fmt;
use std::sync::Arc;

/// Persistent store hooks used by the engine.
pub trait NvStore: Send + Sync {
    /// Prepare the store for use.
    fn init(&self) -> Result<(), StoreError>;

    /// Read the named blob.
    fn load(&self, name: &str) -> Result<Vec<u8>, StoreError>;

    /// Write the named blob, replacing any previous contents.
    fn store(&self, name: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Delete the named blob. Missing blobs are an error only if `must_exist`.
    fn delete(&self, name: &str, must_exist: bool) -> Result<(), StoreError>;

    /// Take the exclusive storage lock. Holding it already is not an error.
    fn lock_storage(&self) -> Result<(), StoreError>;

    /// Release the storage lock if held.
    fn unlock_storage(&self);

    /// Release everything; later calls to other hooks fail.
    fn shutdown(&self);
}

/// Transport hooks used by the engine.
pub trait IoHooks: Send + Sync {
    /// Called once when the engine starts.
    fn io_init(&self) -> Result<(), EngineError>;

    /// Locality of the command being processed.
    fn locality(&self) -> u8;
}

/// Callback table registered with the engine exactly once per run.
#[derive(Clone)]
pub struct Callbacks {
    /// Persistent store
    pub nvram: Arc<dyn NvStore>,
    /// Transport hooks
    pub io: Arc<dyn IoHooks>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("locality", &self.io.locality())
            .finish_non_exhaustive()
    }
}

/// An emulated TPM.
pub trait DeviceEngine: Send {
    /// Select the device version. Called before any resource is bound.
    fn choose_version(&mut self, version: TpmVersion) -> Result<(), EngineError>;

    /// Install the callback table.
    fn register_callbacks(&mut self, callbacks: Callbacks) -> Result<(), EngineError>;

    /// Start the device. `storage_locked` tells the engine whether the
    /// store is held exclusively.
    fn start(&mut self, version: TpmVersion, storage_locked: bool) -> Result<(), EngineError>;

    /// Process one command and return the response.
    fn process(&mut self, command: &[u8], locality: u8) -> Vec<u8>;

    /// Stop the device and flush its state. Must tolerate being called on
    /// an engine that was never started.
    fn terminate(&mut self);
}

/// Lock storage if requested, then start the engine.
///
/// Used for eager initialization by the sequencer and for deferred
/// initialization by the command loop. The lock is dropped again if the
/// I/O hooks or the engine fail to start.
pub fn start_device(
    engine: &mut dyn DeviceEngine,
    callbacks: &Callbacks,
    version: TpmVersion,
    storage_locked: bool,
) -> Result<(), EngineError> {
    if storage_locked {
        callbacks.nvram.lock_storage()?;
    }

    let started = callbacks
        .io
        .io_init()
        .and_then(|()| engine.start(version, storage_locked));
    if let Err(e) = started {
        if storage_locked {
            callbacks.nvram.unlock_storage();
        }
        return Err(e);
    }

    tracing::info!(%version, storage_locked, "Device started");
    Ok(())
}
