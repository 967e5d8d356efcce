//! Stand-in device engine.
//!
//! Accepts the startup and save-state commands, answers everything else
//! with a TPM failure, and keeps a command counter in the `permall` blob so
//! persistence through the state directory can be observed end to end.

use crate::commands::{self, Header};
use vtpm_core::{Callbacks, DeviceEngine, EngineError, StoreError, TpmVersion};

/// Name of the blob holding the engine's permanent state.
pub const PERMANENT_BLOB: &str = "permall";

/// Device engine without a TPM behind it.
#[derive(Debug, Default)]
pub struct StubEngine {
    version: TpmVersion,
    callbacks: Option<Callbacks>,
    running: bool,
    commands: u64,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// True between a successful `start` and `terminate`.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Commands processed over the lifetime of the stored state.
    pub fn command_count(&self) -> u64 {
        self.commands
    }

    fn persist(&self) -> Result<(), StoreError> {
        match &self.callbacks {
            Some(callbacks) => callbacks
                .nvram
                .store(PERMANENT_BLOB, &self.commands.to_be_bytes()),
            None => Ok(()),
        }
    }
}

impl DeviceEngine for StubEngine {
    fn choose_version(&mut self, version: TpmVersion) -> Result<(), EngineError> {
        self.version = version;
        Ok(())
    }

    fn register_callbacks(&mut self, callbacks: Callbacks) -> Result<(), EngineError> {
        if self.callbacks.is_some() {
            return Err(EngineError::Register("callbacks already registered".into()));
        }
        self.callbacks = Some(callbacks);
        Ok(())
    }

    fn start(&mut self, version: TpmVersion, storage_locked: bool) -> Result<(), EngineError> {
        let callbacks = self
            .callbacks
            .as_ref()
            .ok_or_else(|| EngineError::Start("no callbacks registered".into()))?;
        callbacks
            .nvram
            .init()
            .map_err(|e| EngineError::Start(e.to_string()))?;

        self.commands = match callbacks.nvram.load(PERMANENT_BLOB) {
            Ok(blob) => {
                let bytes: [u8; 8] = blob
                    .as_slice()
                    .try_into()
                    .map_err(|_| EngineError::Start("corrupt permanent state".into()))?;
                u64::from_be_bytes(bytes)
            }
            Err(StoreError::NotFound(_)) => 0,
            Err(e) => return Err(EngineError::Start(e.to_string())),
        };

        self.version = version;
        self.running = true;
        self.persist().map_err(|e| EngineError::Start(e.to_string()))?;

        tracing::debug!(%version, storage_locked, commands = self.commands, "Stub engine started");
        Ok(())
    }

    fn process(&mut self, command: &[u8], locality: u8) -> Vec<u8> {
        let header = match Header::parse(command) {
            Ok(Some(header)) if self.running => header,
            _ => return commands::failure_response(self.version),
        };
        self.commands += 1;
        tracing::trace!(ordinal = header.ordinal, locality, "Stub engine command");

        if commands::is_startup(self.version, header.ordinal) {
            return commands::success_response(self.version);
        }
        if commands::is_save_state(self.version, header.ordinal) {
            return match self.persist() {
                Ok(()) => commands::success_response(self.version),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to save state");
                    commands::failure_response(self.version)
                }
            };
        }
        commands::failure_response(self.version)
    }

    fn terminate(&mut self) {
        if !self.running {
            return;
        }
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "Failed to persist state on terminate");
        }
        self.running = false;
        tracing::debug!("Stub engine terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::response_code;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use vtpm_core::{IoHooks, NvStore, StartupType};

    #[derive(Default)]
    struct MemStore {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl NvStore for MemStore {
        fn init(&self) -> Result<(), StoreError> {
            Ok(())
        }
        fn load(&self, name: &str) -> Result<Vec<u8>, StoreError> {
            self.blobs
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(name.to_string()))
        }
        fn store(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
            self.blobs
                .lock()
                .unwrap()
                .insert(name.to_string(), data.to_vec());
            Ok(())
        }
        fn delete(&self, name: &str, _must_exist: bool) -> Result<(), StoreError> {
            self.blobs.lock().unwrap().remove(name);
            Ok(())
        }
        fn lock_storage(&self) -> Result<(), StoreError> {
            Ok(())
        }
        fn unlock_storage(&self) {}
        fn shutdown(&self) {}
    }

    struct NoIo;

    impl IoHooks for NoIo {
        fn io_init(&self) -> Result<(), EngineError> {
            Ok(())
        }
        fn locality(&self) -> u8 {
            0
        }
    }

    fn callbacks(store: &Arc<MemStore>) -> Callbacks {
        Callbacks {
            nvram: store.clone(),
            io: Arc::new(NoIo),
        }
    }

    #[test]
    fn test_commands_before_start_fail() {
        let mut engine = StubEngine::new();
        engine.choose_version(TpmVersion::Tpm2).unwrap();
        let cmd = commands::startup_command(TpmVersion::Tpm2, StartupType::Clear).unwrap();
        assert_eq!(response_code(&engine.process(&cmd, 0)), Some(0x101));
        assert_eq!(engine.command_count(), 0);
    }

    #[test]
    fn test_state_survives_restart() {
        let store = Arc::new(MemStore::default());
        let startup = commands::startup_command(TpmVersion::Tpm2, StartupType::Clear).unwrap();

        let mut engine = StubEngine::new();
        engine.register_callbacks(callbacks(&store)).unwrap();
        engine.start(TpmVersion::Tpm2, true).unwrap();
        assert_eq!(response_code(&engine.process(&startup, 0)), Some(0));
        let get_random = [0x80, 0x01, 0, 0, 0, 10, 0, 0, 0x01, 0x7b];
        assert_eq!(response_code(&engine.process(&get_random, 0)), Some(0x101));
        engine.terminate();
        assert!(!engine.is_running());

        let mut engine = StubEngine::new();
        engine.register_callbacks(callbacks(&store)).unwrap();
        engine.start(TpmVersion::Tpm2, true).unwrap();
        assert_eq!(engine.command_count(), 2);
    }

    #[test]
    fn test_register_twice_rejected() {
        let store = Arc::new(MemStore::default());
        let mut engine = StubEngine::new();
        engine.register_callbacks(callbacks(&store)).unwrap();
        assert!(matches!(
            engine.register_callbacks(callbacks(&store)),
            Err(EngineError::Register(_))
        ));
    }

    #[test]
    fn test_terminate_without_start() {
        let mut engine = StubEngine::new();
        engine.terminate();
        assert!(!engine.is_running());
    }
}
