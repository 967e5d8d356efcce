//! # vtpm-daemon
//!
//! Process-level pieces of `vtpmd`: descriptor loading, OS signal
//! forwarding, the TPM command framing used on the transport, a stand-in
//! device engine, and the reference command loop.

pub mod commands;
pub mod config;
pub mod ctrl;
pub mod engine;
pub mod mainloop;
pub mod signals;

pub use config::{load_descriptor, DaemonConfigError};
pub use engine::StubEngine;
pub use mainloop::MainLoop;
