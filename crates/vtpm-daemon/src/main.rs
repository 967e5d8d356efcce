//! `vtpmd` entry point.
//!
//! Serves one emulated TPM device for the lifetime of the process.
//!
//! ```text
//! vtpmd [descriptor.json]
//! ```
//!
//! Without a descriptor file the run is configured from `VTPMD_*`
//! environment variables. SIGINT, SIGTERM and SIGQUIT stop the device
//! cleanly. The exit code is 0 for a clean shutdown and 1 otherwise.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use vtpm_core::{logging, Supervisor, SystemHost};
use vtpm_daemon::{load_descriptor, signals, MainLoop, StubEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Verbosity comes from the descriptor's log options; RUST_LOG can only narrow it.
    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::TRACE.into())
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(logging::SinkWriter)
                .with_filter(logging::sink_filter()),
        )
        .init();

    let descriptor = load_descriptor(std::env::args().nth(1))?;
    tracing::debug!(?descriptor, "Descriptor loaded");

    let supervisor = Supervisor::new(SystemHost::new(), StubEngine::new(), MainLoop::new());
    let forwarder = signals::forward_to(supervisor.stop_handle())?;

    let report = supervisor.run(&descriptor).await;
    forwarder.abort();

    match &report.result {
        Ok(()) => tracing::info!(
            run_id = %report.run_id,
            state = %report.state,
            released = report.released.len(),
            "vtpmd exiting"
        ),
        Err(e) => tracing::error!(
            run_id = %report.run_id,
            reached = %report.reached,
            error = %e,
            "vtpmd failed"
        ),
    }

    std::process::exit(report.exit_code());
}
