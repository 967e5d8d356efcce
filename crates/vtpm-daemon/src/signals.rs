//! OS signal forwarding.
//!
//! SIGINT, SIGTERM and SIGQUIT are turned into a stop request. The request
//! itself is latched, so a signal arriving before the command loop runs is
//! not lost.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use vtpm_core::StopHandle;

/// Installed handlers for the termination signals.
///
/// From [`install`](Self::install) on, these signals no longer take their
/// default action.
#[derive(Debug)]
pub struct ShutdownSignals {
    sigint: Signal,
    sigterm: Signal,
    sigquit: Signal,
}

impl ShutdownSignals {
    /// Register the handlers. Must be called inside a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    /// Wait for the first termination signal and return its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigquit.recv() => "SIGQUIT",
        }
    }
}

/// Install the handlers now and spawn a task that requests a stop on the
/// first termination signal.
pub fn forward_to(stop: StopHandle) -> std::io::Result<JoinHandle<()>> {
    let mut signals = ShutdownSignals::install()?;
    Ok(tokio::spawn(async move {
        let name = signals.recv().await;
        tracing::info!(signal = name, "Received signal");
        stop.request_stop();
    }))
}
