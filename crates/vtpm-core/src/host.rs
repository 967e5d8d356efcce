//! Host resource collaborators.
//!
//! The sequencer never touches files, sockets or process-wide state
//! directly; it goes through a [`Host`]. Each resource has a
//! `configure_*` call that turns a sub-option into a handle (or an error)
//! and a matching `release_*` call. [`SystemHost`] is the real thing.

use crate::acquire::ctrlchannel::CtrlChannel;
use crate::acquire::log::LogOptions;
use crate::acquire::pidfile::PidFile;
use crate::acquire::sandbox::SandboxPolicy;
use crate::acquire::server::Server;
use crate::acquire::tpmstate::{self, StateLocation};
use crate::descriptor::TpmVersion;
use crate::error::AcquireError;
use crate::logging;
use crate::loop_flags::LoopFlags;
use crate::transport::Transport;

/// Resource collaborators used by the sequencer.
pub trait Host: Send {
    /// Control channel handle
    type CtrlChannel: Send + 'static;
    /// Transport handle
    type Server: Transport + 'static;

    /// Configure the process-wide log sink.
    fn configure_log(&mut self, opts: Option<&str>) -> Result<(), AcquireError>;

    /// Release the process-wide log sink.
    fn release_log(&mut self);

    /// Open the control channel. May contribute base loop flags.
    fn configure_ctrlchannel(
        &mut self,
        opts: Option<&str>,
        flags: &mut LoopFlags,
    ) -> Result<Option<Self::CtrlChannel>, AcquireError>;

    /// Close the control channel.
    fn release_ctrlchannel(&mut self, ctrl: Self::CtrlChannel);

    /// Open the transport.
    fn configure_server(&mut self, opts: Option<&str>) -> Result<Option<Self::Server>, AcquireError>;

    /// Close the transport.
    fn release_server(&mut self, server: Self::Server);

    /// Parse the PID file option. Returns whether a PID file is configured.
    fn configure_pidfile(&mut self, opts: Option<&str>) -> Result<bool, AcquireError>;

    /// Write the configured PID file.
    fn write_pidfile(&mut self, pid: u32) -> Result<(), AcquireError>;

    /// Remove the PID file if it was written.
    fn remove_pidfile(&mut self);

    /// Register the process-wide state storage location.
    fn configure_tpmstate(
        &mut self,
        opts: Option<&str>,
        version: TpmVersion,
    ) -> Result<StateLocation, AcquireError>;

    /// Drop the process-wide state storage location.
    fn release_tpmstate(&mut self);

    /// Parse the sandbox policy.
    fn configure_sandbox(&mut self, opts: Option<&str>) -> Result<SandboxPolicy, AcquireError>;

    /// Install the sandbox policy. Irreversible.
    fn install_sandbox(&mut self, policy: &SandboxPolicy) -> Result<(), AcquireError>;
}

/// Production host: real files, sockets, process globals and seccomp.
#[derive(Debug, Default)]
pub struct SystemHost {
    pidfile: Option<PidFile>,
}

impl SystemHost {
    /// Create a new system host.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Host for SystemHost {
    type CtrlChannel = CtrlChannel;
    type Server = Server;

    fn configure_log(&mut self, opts: Option<&str>) -> Result<(), AcquireError> {
        logging::configure(&LogOptions::parse(opts)?)
    }

    fn release_log(&mut self) {
        logging::release();
    }

    fn configure_ctrlchannel(
        &mut self,
        opts: Option<&str>,
        flags: &mut LoopFlags,
    ) -> Result<Option<CtrlChannel>, AcquireError> {
        CtrlChannel::open(opts, flags)
    }

    fn release_ctrlchannel(&mut self, ctrl: CtrlChannel) {
        ctrl.release();
    }

    fn configure_server(&mut self, opts: Option<&str>) -> Result<Option<Server>, AcquireError> {
        Server::open(opts)
    }

    fn release_server(&mut self, server: Server) {
        server.release();
    }

    fn configure_pidfile(&mut self, opts: Option<&str>) -> Result<bool, AcquireError> {
        self.pidfile = PidFile::parse(opts)?;
        Ok(self.pidfile.is_some())
    }

    fn write_pidfile(&mut self, pid: u32) -> Result<(), AcquireError> {
        match self.pidfile.as_mut() {
            Some(pidfile) => pidfile.write(pid),
            None => Ok(()),
        }
    }

    fn remove_pidfile(&mut self) {
        if let Some(pidfile) = self.pidfile.as_mut() {
            pidfile.remove();
        }
    }

    fn configure_tpmstate(
        &mut self,
        opts: Option<&str>,
        version: TpmVersion,
    ) -> Result<StateLocation, AcquireError> {
        let location = StateLocation::parse(opts, version)?;
        tpmstate::init(location.clone())?;
        Ok(location)
    }

    fn release_tpmstate(&mut self) {
        tpmstate::release();
    }

    fn configure_sandbox(&mut self, opts: Option<&str>) -> Result<SandboxPolicy, AcquireError> {
        SandboxPolicy::parse(opts)
    }

    fn install_sandbox(&mut self, policy: &SandboxPolicy) -> Result<(), AcquireError> {
        policy.install()
    }
}
