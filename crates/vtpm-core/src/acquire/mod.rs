//! Resource acquirers.
//!
//! Each acquirer validates its own sub-option and produces one resource (or
//! a plain value for the pure ones). They are independent of one another
//! except that transport resolution must happen before loop flags are
//! composed; see [`crate::LoopFlags::compose`].

pub mod ctrlchannel;
pub mod flags;
pub mod key;
pub mod locality;
pub mod log;
pub mod pidfile;
pub mod sandbox;
pub mod server;
pub mod tpmstate;

use crate::error::AcquireError;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// Take ownership of a descriptor handed over by the caller.
///
/// The descriptor is checked with `F_GETFD` first so that a stale number
/// fails here instead of at first use.
pub(crate) fn adopt_fd(subsystem: &'static str, fd: RawFd) -> Result<OwnedFd, AcquireError> {
    // SAFETY: fcntl with F_GETFD only queries descriptor flags.
    let rc = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if rc < 0 {
        return Err(AcquireError::Io {
            subsystem,
            source: std::io::Error::last_os_error(),
        });
    }
    // SAFETY: the descriptor is open (checked above) and the descriptor
    // options hand it to this process for exclusive use.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
