//! Process-wide log sink.
//!
//! The sink is a singleton bracketed by [`configure`] and [`release`]. While
//! configured, every event formatted through [`SinkWriter`] goes to the
//! configured target with the configured prefix; otherwise output falls back
//! to stderr. [`level_filter`] exposes the configured verbosity so that the
//! subscriber installed by the binary can honour it.
//!
//! ```ignore
//! use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};
//!
//! tracing_subscriber::registry()
//!     .with(
//!         tracing_subscriber::fmt::layer()
//!             .with_writer(vtpm_core::logging::SinkWriter)
//!             .with_filter(vtpm_core::logging::sink_filter()),
//!     )
//!     .init();
//! ```

use crate::acquire::adopt_fd;
use crate::acquire::log::{LogOptions, LogTarget, DEFAULT_LEVEL};
use crate::error::AcquireError;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::{filter_fn, FilterFn};
use tracing_subscriber::fmt::MakeWriter;

const SUBSYSTEM: &str = "log";

struct Sink {
    out: File,
    prefix: Option<String>,
}

struct SinkState {
    configured: bool,
    sink: Option<Sink>,
}

static SINK: Mutex<SinkState> = Mutex::new(SinkState {
    configured: false,
    sink: None,
});

static LEVEL: AtomicU8 = AtomicU8::new(DEFAULT_LEVEL);

fn lock() -> MutexGuard<'static, SinkState> {
    SINK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Install the process-wide sink described by `options`.
///
/// # Errors
/// Fails if a sink is already configured or the target cannot be opened.
pub fn configure(options: &LogOptions) -> Result<(), AcquireError> {
    let mut state = lock();
    if state.configured {
        return Err(AcquireError::AlreadyInitialized("log sink"));
    }

    let out = match &options.target {
        LogTarget::Stderr => None,
        LogTarget::File { path, truncate } => {
            let mut open = OpenOptions::new();
            open.create(true).write(true);
            if *truncate {
                open.truncate(true);
            } else {
                open.append(true);
            }
            Some(open.open(path).map_err(AcquireError::io(SUBSYSTEM))?)
        }
        LogTarget::Fd(fd) => Some(File::from(adopt_fd(SUBSYSTEM, *fd)?)),
    };

    state.sink = out.map(|out| Sink {
        out,
        prefix: options.prefix.clone(),
    });
    state.configured = true;
    LEVEL.store(options.level, Ordering::Relaxed);
    Ok(())
}

/// Tear down the process-wide sink. Safe to call when nothing is configured.
pub fn release() {
    let mut state = lock();
    if let Some(mut sink) = state.sink.take() {
        let _ = sink.out.flush();
    }
    state.configured = false;
    LEVEL.store(DEFAULT_LEVEL, Ordering::Relaxed);
}

/// True between [`configure`] and [`release`].
pub fn is_configured() -> bool {
    lock().configured
}

/// Verbosity currently in effect.
pub fn level_filter() -> LevelFilter {
    match LEVEL.load(Ordering::Relaxed) {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Per-layer filter that follows the configured verbosity.
pub fn sink_filter() -> FilterFn<impl Fn(&tracing::Metadata<'_>) -> bool> {
    filter_fn(|meta| *meta.level() <= level_filter())
}

/// `MakeWriter` routing formatted events to the configured sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkWriter;

impl<'a> MakeWriter<'a> for SinkWriter {
    type Writer = SinkGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SinkGuard
    }
}

/// Writer handed out by [`SinkWriter`]. Each `write` is one formatted event.
#[derive(Debug)]
pub struct SinkGuard;

impl Write for SinkGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock();
        match state.sink.as_mut() {
            Some(sink) => {
                if let Some(prefix) = &sink.prefix {
                    sink.out.write_all(prefix.as_bytes())?;
                    sink.out.write_all(b" ")?;
                }
                sink.out.write_all(buf)?;
                Ok(buf.len())
            }
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock().sink.as_mut() {
            Some(sink) => sink.out.flush(),
            None => io::stderr().flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    // The sink is process-wide, so everything touching it lives in one test.
    #[test]
    fn test_sink_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vtpm.log");
        let options =
            LogOptions::parse(Some(&format!("file={},level=3,prefix=vtpm:", path.display())))
                .unwrap();

        configure(&options).unwrap();
        assert!(is_configured());
        assert_eq!(level_filter(), LevelFilter::DEBUG);
        assert!(matches!(
            configure(&options),
            Err(AcquireError::AlreadyInitialized(_))
        ));

        let mut writer = SinkWriter.make_writer();
        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();

        release();
        assert!(!is_configured());
        assert_eq!(level_filter(), LevelFilter::INFO);
        release();

        let mut contents = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "vtpm: hello\n");
    }
}
