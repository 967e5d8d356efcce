//! Lifecycle parameters threaded through one run.

use crate::acquire::flags::StartupType;
use crate::acquire::locality::LocalityFlags;
use crate::descriptor::TpmVersion;
use crate::loop_flags::LoopFlags;
use crate::transport::Endpoint;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Mutable state shared between the sequencer and the command loop.
///
/// Owned by the sequencer; the command loop borrows it for the duration of
/// the loop and may update the command and device fields.
#[derive(Debug)]
pub struct LoopParams<C> {
    /// Control channel handle; released by the sequencer after the loop
    pub ctrl: Option<C>,
    /// Composed loop behaviour
    pub flags: LoopFlags,
    /// Transport socket, moved out of the transport handle
    pub endpoint: Option<Endpoint>,
    /// Locality policy
    pub locality_flags: LocalityFlags,
    /// Active locality, shared with the engine's I/O hooks
    pub locality: Arc<AtomicU8>,
    /// Device version
    pub tpm_version: TpmVersion,
    /// Startup command the device expects
    pub startup_type: Option<StartupType>,
    /// Ordinal of the last command processed
    pub last_command: Option<u32>,
    /// Device waits for an init command from the control channel
    pub need_init_cmd: bool,
    /// Do not shut the device down when the client goes away
    pub disable_auto_shutdown: bool,
    /// State is expected to arrive through an incoming migration
    pub incoming_migration: bool,
    /// Release the storage lock once outgoing state has been read
    pub release_lock_outgoing: bool,
    /// Storage is held exclusively; meaningful once the device started
    pub storage_locked: bool,
    /// The device engine is running and must be terminated at teardown
    pub device_running: bool,
}

impl<C> LoopParams<C> {
    /// Parameters for a fresh run: deferred init, locality 0.
    pub fn new(tpm_version: TpmVersion) -> Self {
        Self {
            ctrl: None,
            flags: LoopFlags::default(),
            endpoint: None,
            locality_flags: LocalityFlags::default(),
            locality: Arc::new(AtomicU8::new(0)),
            tpm_version,
            startup_type: None,
            last_command: None,
            need_init_cmd: true,
            disable_auto_shutdown: false,
            incoming_migration: false,
            release_lock_outgoing: false,
            storage_locked: false,
            device_running: false,
        }
    }

    /// Storage lock decision for starting the device now.
    pub fn lock_decision(&self) -> bool {
        !self.incoming_migration
    }

    /// Select a locality. Returns false if the policy forbids it.
    pub fn set_locality(&self, locality: u8) -> bool {
        if !self.locality_flags.permits(locality) {
            return false;
        }
        self.locality.store(locality, Ordering::SeqCst);
        true
    }

    /// Active locality.
    pub fn active_locality(&self) -> u8 {
        self.locality.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_decision() {
        let mut params = LoopParams::<()>::new(TpmVersion::Tpm2);
        assert!(params.lock_decision());
        params.incoming_migration = true;
        assert!(!params.lock_decision());
    }

    #[test]
    fn test_set_locality() {
        let mut params = LoopParams::<()>::new(TpmVersion::Tpm2);
        assert!(params.set_locality(3));
        assert_eq!(params.active_locality(), 3);

        params.locality_flags.reject_locality_4 = true;
        assert!(!params.set_locality(4));
        assert_eq!(params.active_locality(), 3);
    }
}
