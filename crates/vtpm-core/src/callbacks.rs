//! Device callback adapter.
//!
//! Binds the engine's storage and I/O hooks to the resources acquired for
//! the run: [`DirStore`] persists blobs in the state directory and
//! [`LocalityHooks`] reports the locality selected over the control channel.

use crate::acquire::key::KeyMaterial;
use crate::acquire::tpmstate::StateLocation;
use crate::engine::{Callbacks, IoHooks, NvStore};
use crate::error::{EngineError, StoreError};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Name of the lock file inside the state directory.
pub const LOCK_FILE: &str = ".lock";

const LOCK_ATTEMPTS: u32 = 10;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Build the callback table for one run.
pub fn bind(
    location: StateLocation,
    state_key: Option<KeyMaterial>,
    migration_key: Option<KeyMaterial>,
    locality: Arc<AtomicU8>,
) -> Callbacks {
    Callbacks {
        nvram: Arc::new(DirStore::new(location).with_keys(state_key, migration_key)),
        io: Arc::new(LocalityHooks { locality }),
    }
}

/// Blob store over a state directory.
///
/// Blob `<name>` lives in `<prefix>-00.<name>`, where the prefix depends on
/// the device version. Writes go to a temp file that is renamed into place.
#[derive(Debug)]
pub struct DirStore {
    location: StateLocation,
    state_key: Option<KeyMaterial>,
    migration_key: Option<KeyMaterial>,
    lock: Mutex<Option<File>>,
    shut_down: AtomicBool,
}

impl DirStore {
    /// Create a store; nothing is touched on disk until a hook runs.
    pub fn new(location: StateLocation) -> Self {
        Self {
            location,
            state_key: None,
            migration_key: None,
            lock: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Attach the keys configured for state and migration blobs.
    pub fn with_keys(
        mut self,
        state_key: Option<KeyMaterial>,
        migration_key: Option<KeyMaterial>,
    ) -> Self {
        self.state_key = state_key;
        self.migration_key = migration_key;
        self
    }

    /// Key for state blobs, if any.
    pub fn state_key(&self) -> Option<&KeyMaterial> {
        self.state_key.as_ref()
    }

    /// Key for migration blobs, if any.
    pub fn migration_key(&self) -> Option<&KeyMaterial> {
        self.migration_key.as_ref()
    }

    /// True while this store holds the storage lock.
    pub fn is_locked(&self) -> bool {
        self.lock.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(StoreError::Shutdown);
        }
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(StoreError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid blob name '{name}'"),
            )));
        }
        Ok(self.location.dir.join(format!(
            "{}-00.{}",
            self.location.version.blob_prefix(),
            name
        )))
    }
}

impl NvStore for DirStore {
    fn init(&self) -> Result<(), StoreError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(StoreError::Shutdown);
        }
        let meta = std::fs::metadata(&self.location.dir)?;
        if !meta.is_dir() {
            return Err(StoreError::NotFound(self.location.dir.display().to_string()));
        }
        tracing::debug!(
            dir = %self.location.dir.display(),
            encrypted = self.state_key.is_some(),
            "State store initialized"
        );
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(name)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.blob_path(name)?;
        let tmp = path.with_file_name(format!(".{name}.tmp"));

        let result = (|| {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(self.location.mode)
                .open(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result?;
        tracing::trace!(blob = name, bytes = data.len(), "Blob stored");
        Ok(())
    }

    fn delete(&self, name: &str, must_exist: bool) -> Result<(), StoreError> {
        let path = self.blob_path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound && !must_exist => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn lock_storage(&self) -> Result<(), StoreError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(StoreError::Shutdown);
        }
        let mut held = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if held.is_some() {
            return Ok(());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(self.location.mode)
            .open(self.location.dir.join(LOCK_FILE))?;

        for attempt in 1..=LOCK_ATTEMPTS {
            // SAFETY: flock on a descriptor we own; LOCK_NB never blocks.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                tracing::debug!(dir = %self.location.dir.display(), attempt, "Storage locked");
                *held = Some(file);
                return Ok(());
            }

            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::WouldBlock {
                return Err(err.into());
            }
            std::thread::sleep(LOCK_RETRY_DELAY);
        }

        Err(StoreError::Locked(self.location.dir.clone()))
    }

    fn unlock_storage(&self) {
        // Closing the descriptor drops the flock.
        if self.lock.lock().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            tracing::debug!(dir = %self.location.dir.display(), "Storage unlocked");
        }
    }

    fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            self.unlock_storage();
            tracing::debug!(dir = %self.location.dir.display(), "State store shut down");
        }
    }
}

/// I/O hooks backed by the run's locality cell.
#[derive(Debug)]
pub struct LocalityHooks {
    locality: Arc<AtomicU8>,
}

impl IoHooks for LocalityHooks {
    fn io_init(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn locality(&self) -> u8 {
        self.locality.load(Ordering::SeqCst)
    }
}
