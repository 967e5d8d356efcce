//! Lifecycle sequencer.
//!
//! [`Supervisor::run`] walks a run through
//!
//! ```text
//! Uninit → Validated → ResourcesAcquired → CallbacksBound
//!        → EagerStarted | Deferred → SignalBridgeReady → Sandboxed
//!        → Running → Stopped | Failed
//! ```
//!
//! Every acquisition is recorded in a ledger as soon as it succeeds. A
//! failure at any stage, and the normal end of the command loop, both end
//! in the same teardown routine, which releases what the ledger lists in a
//! fixed order and nothing else.

use crate::acquire::flags::{MigrationOptions, StartupFlags};
use crate::acquire::key::KeyMaterial;
use crate::acquire::locality::LocalityFlags;
use crate::callbacks;
use crate::descriptor::{Descriptor, TpmVersion};
use crate::engine::{start_device, Callbacks, DeviceEngine};
use crate::error::{LoopError, SupervisorError};
use crate::host::Host;
use crate::loop_flags::LoopFlags;
use crate::params::LoopParams;
use crate::stop::{StopBridge, StopHandle};
use crate::transport::Transport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stage of a run.
///
/// Ordered by progress; a run only ever moves to a later stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    /// Nothing checked yet
    Uninit,
    /// Descriptor accepted
    Validated,
    /// Every acquirer succeeded
    ResourcesAcquired,
    /// Callback table registered with the engine
    CallbacksBound,
    /// Device started at startup
    EagerStarted,
    /// Device waits for an init command
    Deferred,
    /// Termination bridge open
    SignalBridgeReady,
    /// Sandbox policy installed
    Sandboxed,
    /// Command loop entered
    Running,
    /// Loop exited and teardown finished
    Stopped,
    /// A stage failed and teardown finished
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninit => "Uninit",
            Self::Validated => "Validated",
            Self::ResourcesAcquired => "ResourcesAcquired",
            Self::CallbacksBound => "CallbacksBound",
            Self::EagerStarted => "EagerStarted",
            Self::Deferred => "Deferred",
            Self::SignalBridgeReady => "SignalBridgeReady",
            Self::Sandboxed => "Sandboxed",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// A resource released during teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Device engine terminated
    Engine,
    /// Termination bridge closed
    StopBridge,
    /// PID file removed
    PidFile,
    /// Control channel closed
    CtrlChannel,
    /// Transport closed
    Server,
    /// Log sink released
    Log,
    /// State storage location dropped
    TpmState,
    /// Persistent store shut down
    Nvram,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Engine => "engine",
            Self::StopBridge => "stop-bridge",
            Self::PidFile => "pidfile",
            Self::CtrlChannel => "ctrl",
            Self::Server => "server",
            Self::Log => "log",
            Self::TpmState => "tpmstate",
            Self::Nvram => "nvram",
        };
        f.write_str(name)
    }
}

/// Everything the command loop gets to work with.
pub struct LoopContext<'a, C> {
    /// Lifecycle parameters
    pub params: &'a mut LoopParams<C>,
    /// Device engine
    pub engine: &'a mut dyn DeviceEngine,
    /// Callback table registered with the engine
    pub callbacks: &'a Callbacks,
    /// Termination bridge; activity on it ends the loop
    pub stop: &'a StopBridge,
}

/// The command-processing main loop.
///
/// Must give [`StopBridge::stopped`] priority over every other input and
/// return once it resolves.
#[async_trait]
pub trait CommandLoop: Send {
    /// Control channel handle this loop serves
    type CtrlChannel: Send + 'static;

    /// Serve commands until stopped or the loop flags say to end.
    async fn run(&mut self, ctx: LoopContext<'_, Self::CtrlChannel>) -> Result<(), LoopError>;
}

/// Outcome of one run.
#[derive(Debug)]
pub struct RunReport {
    /// Run identifier, also attached to every log event of the run
    pub run_id: RunId,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Last stage reached before teardown
    pub reached: LifecycleState,
    /// Terminal state: `Stopped` or `Failed`
    pub state: LifecycleState,
    /// Why the run failed, if it did
    pub result: Result<(), SupervisorError>,
    /// Resources released, in release order
    pub released: Vec<Resource>,
    /// Storage lock decision, if the device was started
    pub storage_locked: Option<bool>,
    /// Loop flags the run composed
    pub loop_flags: LoopFlags,
}

impl RunReport {
    /// True if the run stopped cleanly.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Resources currently held by a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Acquired {
    log: bool,
    ctrl: bool,
    server: bool,
    tpmstate: bool,
    pidfile: bool,
    nvram: bool,
    engine: bool,
    bridge: bool,
}

#[derive(Debug)]
struct Progress {
    run_id: RunId,
    state: LifecycleState,
}

impl Progress {
    fn advance(&mut self, next: LifecycleState) {
        debug_assert!(next > self.state, "{} -> {next}", self.state);
        tracing::debug!(run_id = %self.run_id, from = %self.state, to = %next, "Lifecycle transition");
        self.state = next;
    }
}

/// Supervises one device instance.
pub struct Supervisor<H, E, L> {
    host: H,
    engine: E,
    command_loop: L,
    stop: StopHandle,
}

impl<H, E, L> Supervisor<H, E, L>
where
    H: Host,
    E: DeviceEngine,
    L: CommandLoop<CtrlChannel = H::CtrlChannel>,
{
    /// Create a supervisor from its collaborators.
    pub fn new(host: H, engine: E, command_loop: L) -> Self {
        Self {
            host,
            engine,
            command_loop,
            stop: StopHandle::new(),
        }
    }

    /// Handle for requesting a stop from any context.
    ///
    /// A request made before the command loop starts is delivered as soon
    /// as it does.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run the device until it stops or fails.
    ///
    /// Always tears down whatever was acquired before returning.
    pub async fn run(self, descriptor: &Descriptor) -> RunReport {
        let Self {
            host,
            engine,
            mut command_loop,
            stop,
        } = self;

        let started_at = Utc::now();
        let mut run = Run::new(host, engine);
        let run_id = run.progress.run_id;
        tracing::info!(run_id = %run_id, "Starting run");

        let result = run.execute(descriptor, &mut command_loop, &stop).await;
        let reached = run.progress.state;
        let storage_locked =
            (run.acquired.engine || run.params.device_running).then_some(run.params.storage_locked);
        let loop_flags = run.params.flags;

        match &result {
            Ok(()) => tracing::info!(run_id = %run_id, "Command loop finished"),
            Err(e) if e.is_config() => {
                tracing::warn!(run_id = %run_id, error = %e, "Descriptor rejected")
            }
            Err(e) => tracing::error!(run_id = %run_id, stage = %reached, error = %e, "Run failed"),
        }

        let released = run.teardown();
        let state = if result.is_ok() {
            LifecycleState::Stopped
        } else {
            LifecycleState::Failed
        };
        run.progress.advance(state);

        RunReport {
            run_id,
            started_at,
            reached,
            state,
            result,
            released,
            storage_locked,
            loop_flags,
        }
    }
}

struct Run<H: Host, E> {
    progress: Progress,
    host: H,
    engine: E,
    acquired: Acquired,
    params: LoopParams<H::CtrlChannel>,
    server: Option<H::Server>,
    callbacks: Option<Callbacks>,
    bridge: Option<StopBridge>,
}

impl<H: Host, E: DeviceEngine> Run<H, E> {
    fn new(host: H, engine: E) -> Self {
        Self {
            progress: Progress {
                run_id: RunId::new(),
                state: LifecycleState::Uninit,
            },
            host,
            engine,
            acquired: Acquired::default(),
            params: LoopParams::new(TpmVersion::default()),
            server: None,
            callbacks: None,
            bridge: None,
        }
    }

    async fn execute<L>(
        &mut self,
        descriptor: &Descriptor,
        command_loop: &mut L,
        stop: &StopHandle,
    ) -> Result<(), SupervisorError>
    where
        L: CommandLoop<CtrlChannel = H::CtrlChannel>,
    {
        let version = descriptor.validate()?;
        self.params.tpm_version = version;
        self.progress.advance(LifecycleState::Validated);

        self.host.configure_log(descriptor.log.as_deref())?;
        self.acquired.log = true;

        self.engine.choose_version(version)?;

        let mut base_flags = LoopFlags::default();
        let ctrl = self
            .host
            .configure_ctrlchannel(descriptor.ctrl.as_deref(), &mut base_flags)?;
        self.acquired.ctrl = ctrl.is_some();
        self.params.ctrl = ctrl;

        self.server = self.host.configure_server(descriptor.server.as_deref())?;
        self.acquired.server = self.server.is_some();

        let state_key = KeyMaterial::load("key", descriptor.key.as_deref())?;
        let migration_key = KeyMaterial::load("migration-key", descriptor.migration_key.as_deref())?;
        let has_pidfile = self.host.configure_pidfile(descriptor.pid.as_deref())?;
        self.params.locality_flags = LocalityFlags::parse(descriptor.locality.as_deref())?;

        let location = self
            .host
            .configure_tpmstate(descriptor.tpmstate.as_deref(), version)?;
        self.acquired.tpmstate = true;

        let policy = self.host.configure_sandbox(descriptor.seccomp.as_deref())?;
        let startup = StartupFlags::parse(descriptor.flags.as_deref())?;
        let migration = MigrationOptions::parse(descriptor.migration.as_deref())?;
        self.params.need_init_cmd = startup.need_init_cmd;
        self.params.startup_type = startup.startup_type;
        self.params.disable_auto_shutdown = startup.disable_auto_shutdown;
        self.params.incoming_migration = migration.incoming;
        self.params.release_lock_outgoing = migration.release_lock_outgoing;

        self.params.flags = base_flags.compose(self.server.as_ref().map(Transport::flags));
        self.params.endpoint = self.server.as_mut().and_then(Transport::take_endpoint);
        tracing::debug!(run_id = %self.progress.run_id, flags = ?self.params.flags, "Loop flags composed");

        if has_pidfile {
            self.host.write_pidfile(std::process::id())?;
            self.acquired.pidfile = true;
        }
        self.progress.advance(LifecycleState::ResourcesAcquired);

        let callbacks = callbacks::bind(
            location,
            state_key,
            migration_key,
            self.params.locality.clone(),
        );
        self.engine.register_callbacks(callbacks.clone())?;
        let callbacks: &Callbacks = self.callbacks.insert(callbacks);
        self.acquired.nvram = true;
        self.progress.advance(LifecycleState::CallbacksBound);

        if self.params.need_init_cmd {
            tracing::info!(run_id = %self.progress.run_id, "Device waits for init command");
            self.progress.advance(LifecycleState::Deferred);
        } else {
            let storage_locked = self.params.lock_decision();
            start_device(&mut self.engine, callbacks, version, storage_locked)?;
            self.acquired.engine = true;
            self.params.storage_locked = storage_locked;
            self.params.device_running = true;
            self.progress.advance(LifecycleState::EagerStarted);
        }

        let bridge: &StopBridge = self
            .bridge
            .insert(StopBridge::open(stop).map_err(SupervisorError::Bridge)?);
        self.acquired.bridge = true;
        self.progress.advance(LifecycleState::SignalBridgeReady);

        self.host.install_sandbox(&policy)?;
        self.progress.advance(LifecycleState::Sandboxed);

        self.progress.advance(LifecycleState::Running);
        command_loop
            .run(LoopContext {
                params: &mut self.params,
                engine: &mut self.engine,
                callbacks,
                stop: bridge,
            })
            .await?;
        Ok(())
    }

    /// Release everything the ledger lists, in a fixed order. Idempotent.
    fn teardown(&mut self) -> Vec<Resource> {
        let mut released = Vec::new();
        let held = std::mem::take(&mut self.acquired);

        if held.engine || self.params.device_running {
            self.engine.terminate();
            self.params.device_running = false;
            released.push(Resource::Engine);
        }
        if held.bridge {
            self.bridge.take();
            released.push(Resource::StopBridge);
        }
        if held.pidfile {
            self.host.remove_pidfile();
            released.push(Resource::PidFile);
        }
        if held.ctrl {
            if let Some(ctrl) = self.params.ctrl.take() {
                self.host.release_ctrlchannel(ctrl);
            }
            released.push(Resource::CtrlChannel);
        }
        self.params.endpoint.take();
        if held.server {
            if let Some(server) = self.server.take() {
                self.host.release_server(server);
            }
            released.push(Resource::Server);
        }
        if held.log {
            self.host.release_log();
            released.push(Resource::Log);
        }
        if held.tpmstate {
            self.host.release_tpmstate();
            released.push(Resource::TpmState);
        }
        if held.nvram {
            if let Some(callbacks) = self.callbacks.take() {
                callbacks.nvram.shutdown();
            }
            released.push(Resource::Nvram);
        }

        if !released.is_empty() {
            let names: Vec<String> = released.iter().map(ToString::to_string).collect();
            tracing::debug!(run_id = %self.progress.run_id, released = %names.join(","), "Teardown complete");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_order() {
        assert!(LifecycleState::Uninit < LifecycleState::Validated);
        assert!(LifecycleState::CallbacksBound < LifecycleState::EagerStarted);
        assert!(LifecycleState::CallbacksBound < LifecycleState::Deferred);
        assert!(LifecycleState::Deferred < LifecycleState::SignalBridgeReady);
        assert!(LifecycleState::Running < LifecycleState::Stopped);
        assert!(LifecycleState::Running < LifecycleState::Failed);
    }

    #[test]
    fn test_exit_code() {
        let mut report = RunReport {
            run_id: RunId::new(),
            started_at: Utc::now(),
            reached: LifecycleState::Running,
            state: LifecycleState::Stopped,
            result: Ok(()),
            released: vec![],
            storage_locked: None,
            loop_flags: LoopFlags::default(),
        };
        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);

        report.result = Err(crate::error::ConfigError::UnsupportedTpmVersion(3).into());
        report.state = LifecycleState::Failed;
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(LifecycleState::SignalBridgeReady.to_string(), "SignalBridgeReady");
        assert_eq!(Resource::PidFile.to_string(), "pidfile");
        assert_ne!(RunId::new(), RunId::new());
    }
}
