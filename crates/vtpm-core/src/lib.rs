//! # vtpm-core
//!
//! Lifecycle supervisor for an emulated TPM device.
//!
//! This crate turns a validated [`Descriptor`] into a running, sandboxed,
//! command-serving device and tears it down again, releasing exactly the
//! resources that were acquired, whether the run stopped cleanly or failed
//! halfway through startup.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      Supervisor::run                       │
//! ├────────────────────────────────────────────────────────────┤
//! │  Descriptor::validate                                      │
//! │        │                                                   │
//! │        ▼                                                   │
//! │  Host (log, ctrl, server, pid, tpmstate, seccomp)          │
//! │  + key / locality / flags / migration                      │
//! │        │                                                   │
//! │        ▼                                                   │
//! │  callbacks::bind ──▶ DeviceEngine::register_callbacks      │
//! │        │                                                   │
//! │        ▼                                                   │
//! │  start_device (eager) | wait for init (deferred)           │
//! │        │                                                   │
//! │        ▼                                                   │
//! │  StopBridge ──▶ sandbox ──▶ CommandLoop::run               │
//! │        │                                                   │
//! │        ▼                                                   │
//! │  teardown (same path for success and failure)              │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use vtpm_core::{Descriptor, Supervisor, SystemHost};
//!
//! # async fn example(engine: impl vtpm_core::DeviceEngine, main_loop: impl vtpm_core::CommandLoop<CtrlChannel = vtpm_core::CtrlChannel>) {
//! let descriptor = Descriptor::builder()
//!     .tpmstate("dir=/var/lib/vtpm")
//!     .ctrl("type=unixio,path=/run/vtpm/ctrl.sock")
//!     .server("type=tcp,port=2321")
//!     .flags("startup-clear")
//!     .build()
//!     .unwrap();
//!
//! let supervisor = Supervisor::new(SystemHost::new(), engine, main_loop);
//! let stop = supervisor.stop_handle();
//! // hand `stop` to a signal handler, then:
//! let report = supervisor.run(&descriptor).await;
//! std::process::exit(report.exit_code());
//! # }
//! ```

pub mod acquire;
pub mod callbacks;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod host;
pub mod logging;
pub mod loop_flags;
pub mod options;
pub mod params;
pub mod sequencer;
pub mod stop;
pub mod transport;

pub use acquire::ctrlchannel::{CtrlChannel, CtrlEndpoint};
pub use acquire::flags::{MigrationOptions, StartupFlags, StartupType};
pub use acquire::key::{KeyMaterial, KeyMode};
pub use acquire::locality::LocalityFlags;
pub use acquire::sandbox::{SandboxAction, SandboxPolicy};
pub use acquire::server::Server;
pub use acquire::tpmstate::StateLocation;
pub use callbacks::DirStore;
pub use descriptor::{Descriptor, DescriptorBuilder, TpmVersion, DESCRIPTOR_VERSION};
pub use engine::{start_device, Callbacks, DeviceEngine, IoHooks, NvStore};
pub use error::{
    AcquireError, ConfigError, EngineError, LoopError, Result, StoreError, SupervisorError,
};
pub use host::{Host, SystemHost};
pub use loop_flags::{LoopFlags, ServerFlags};
pub use params::LoopParams;
pub use sequencer::{
    CommandLoop, LifecycleState, LoopContext, Resource, RunId, RunReport, Supervisor,
};
pub use stop::{StopBridge, StopHandle};
pub use transport::{Endpoint, SocketFamily, Transport};
