//! Log target sub-option.

use crate::error::AcquireError;
use crate::options::parse_optional;
use std::os::fd::RawFd;
use std::path::PathBuf;

const SUBSYSTEM: &str = "log";

/// Default verbosity (info).
pub const DEFAULT_LEVEL: u8 = 2;

/// Highest accepted verbosity (trace).
pub const MAX_LEVEL: u8 = 5;

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogTarget {
    /// Standard error (no sub-option given)
    #[default]
    Stderr,
    /// Append to (or truncate) a file
    File { path: PathBuf, truncate: bool },
    /// Write to an inherited descriptor
    Fd(RawFd),
}

/// Parsed log options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Output target
    pub target: LogTarget,
    /// Verbosity 0 (errors only) to 5 (everything)
    pub level: u8,
    /// Text prepended to every line
    pub prefix: Option<String>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            target: LogTarget::Stderr,
            level: DEFAULT_LEVEL,
            prefix: None,
        }
    }
}

impl LogOptions {
    /// Parse `file=<path>|fd=<n>,level=<n>,prefix=<text>,truncate`.
    pub fn parse(input: Option<&str>) -> Result<Self, AcquireError> {
        let opts = parse_optional(SUBSYSTEM, input)?;
        opts.check_keys(SUBSYSTEM, &["file", "fd", "level", "prefix", "truncate"])?;

        let truncate = opts.get_bool(SUBSYSTEM, "truncate", false)?;
        let target = match (opts.get_path("file"), opts.get_fd(SUBSYSTEM, "fd")?) {
            (Some(_), Some(_)) => {
                return Err(AcquireError::option(
                    SUBSYSTEM,
                    "'file' and 'fd' are mutually exclusive",
                ))
            }
            (Some(path), None) => LogTarget::File { path, truncate },
            (None, Some(fd)) => LogTarget::Fd(fd),
            (None, None) => LogTarget::Stderr,
        };

        let level = match opts.get_u32(SUBSYSTEM, "level")? {
            Some(level) if level <= MAX_LEVEL as u32 => level as u8,
            Some(level) => {
                return Err(AcquireError::option(
                    SUBSYSTEM,
                    format!("level must be 0-{MAX_LEVEL}, got {level}"),
                ))
            }
            None => DEFAULT_LEVEL,
        };

        Ok(Self {
            target,
            level,
            prefix: opts.get("prefix").map(str::to_string),
        })
    }
}
