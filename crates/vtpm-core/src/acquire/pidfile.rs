//! PID file sub-option and resource.

use crate::acquire::adopt_fd;
use crate::error::AcquireError;
use crate::options::parse_optional;
use std::fs::File;
use std::io::Write;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

const SUBSYSTEM: &str = "pid";

/// Where the PID gets written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidTarget {
    /// A path, created on write and unlinked on remove
    File(PathBuf),
    /// An inherited descriptor, written once and closed
    Fd(RawFd),
}

/// PID file resource. Nothing is written until [`PidFile::write`].
#[derive(Debug)]
pub struct PidFile {
    target: PidTarget,
    written: bool,
}

impl PidFile {
    /// Parse `file=<path>|fd=<n>`. Returns `None` when no PID file is wanted.
    pub fn parse(input: Option<&str>) -> Result<Option<Self>, AcquireError> {
        let opts = parse_optional(SUBSYSTEM, input)?;
        if opts.is_empty() {
            return Ok(None);
        }
        opts.check_keys(SUBSYSTEM, &["file", "fd"])?;

        let target = match (opts.get_path("file"), opts.get_fd(SUBSYSTEM, "fd")?) {
            (Some(path), None) => PidTarget::File(path),
            (None, Some(fd)) => PidTarget::Fd(fd),
            (Some(_), Some(_)) => {
                return Err(AcquireError::option(
                    SUBSYSTEM,
                    "'file' and 'fd' are mutually exclusive",
                ))
            }
            (None, None) => {
                return Err(AcquireError::option(SUBSYSTEM, "either 'file' or 'fd' is required"))
            }
        };

        Ok(Some(Self {
            target,
            written: false,
        }))
    }

    /// Configured target.
    pub fn target(&self) -> &PidTarget {
        &self.target
    }

    /// Write `pid`. File targets are written to a temp file and renamed.
    pub fn write(&mut self, pid: u32) -> Result<(), AcquireError> {
        let contents = format!("{pid}\n");
        match &self.target {
            PidTarget::File(path) => write_atomic(path, contents.as_bytes())?,
            PidTarget::Fd(fd) => {
                let mut file = File::from(adopt_fd(SUBSYSTEM, *fd)?);
                file.write_all(contents.as_bytes())
                    .map_err(AcquireError::io(SUBSYSTEM))?;
            }
        }
        self.written = true;
        tracing::debug!(subsystem = SUBSYSTEM, target = ?self.target, pid, "PID file written");
        Ok(())
    }

    /// Remove the PID file if this process wrote it. Idempotent.
    pub fn remove(&mut self) {
        if !std::mem::take(&mut self.written) {
            return;
        }
        if let PidTarget::File(path) = &self.target {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(subsystem = SUBSYSTEM, path = %path.display(), error = %e, "Failed to remove PID file");
            }
        }
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), AcquireError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| AcquireError::option(SUBSYSTEM, format!("not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result.map_err(AcquireError::io(SUBSYSTEM))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_option() {
        assert!(PidFile::parse(None).unwrap().is_none());
        assert!(PidFile::parse(Some("")).unwrap().is_none());
    }

    #[test]
    fn test_requires_target() {
        assert!(PidFile::parse(Some("bogus")).is_err());
        assert!(PidFile::parse(Some("file=/a,fd=4")).is_err());
    }

    #[test]
    fn test_write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vtpm.pid");
        let mut pidfile = PidFile::parse(Some(&format!("file={}", path.display())))
            .unwrap()
            .unwrap();

        // remove before write does nothing
        pidfile.remove();

        pidfile.write(4242).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242\n");

        pidfile.remove();
        assert!(!path.exists());
        pidfile.remove();
    }

    #[test]
    fn test_write_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("vtpm.pid");
        let mut pidfile = PidFile::parse(Some(&format!("file={}", path.display())))
            .unwrap()
            .unwrap();
        assert!(matches!(
            pidfile.write(1),
            Err(AcquireError::Io { subsystem: "pid", .. })
        ));
    }
}
