//! Socket endpoints shared by the transport and the control channel.

use crate::error::AcquireError;
use crate::loop_flags::ServerFlags;
use std::net::{IpAddr, TcpListener};
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::Path;

/// Address family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFamily {
    /// TCP socket
    Tcp,
    /// Unix domain socket
    Unix,
}

/// A socket descriptor plus enough information to wrap it again.
#[derive(Debug)]
pub struct Endpoint {
    /// Listening socket, or a connected one when the loop runs with `use_fd`
    pub fd: OwnedFd,
    /// Address family
    pub family: SocketFamily,
}

/// Resolved transport, as seen by the sequencer.
pub trait Transport: Send {
    /// Flags that shape the command loop.
    fn flags(&self) -> ServerFlags;

    /// Hand the socket over to the command loop. Subsequent calls return `None`.
    fn take_endpoint(&mut self) -> Option<Endpoint>;
}

pub(crate) fn bind_tcp(
    subsystem: &'static str,
    addr: IpAddr,
    port: u16,
) -> Result<Endpoint, AcquireError> {
    let listener = TcpListener::bind((addr, port)).map_err(AcquireError::io(subsystem))?;
    tracing::debug!(subsystem, %addr, port, "Bound TCP listener");
    Ok(Endpoint {
        fd: OwnedFd::from(listener),
        family: SocketFamily::Tcp,
    })
}

pub(crate) fn bind_unix(
    subsystem: &'static str,
    path: &Path,
    mode: Option<u32>,
) -> Result<Endpoint, AcquireError> {
    // A stale socket from an earlier run would make bind fail.
    if path.exists() {
        std::fs::remove_file(path).map_err(AcquireError::io(subsystem))?;
    }

    let listener = UnixListener::bind(path).map_err(AcquireError::io(subsystem))?;
    if let Some(mode) = mode {
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
            let _ = std::fs::remove_file(path);
            return Err(AcquireError::Io { subsystem, source: e });
        }
    }

    tracing::debug!(subsystem, path = %path.display(), "Bound Unix listener");
    Ok(Endpoint {
        fd: OwnedFd::from(listener),
        family: SocketFamily::Unix,
    })
}

pub(crate) fn parse_bind_addr(
    subsystem: &'static str,
    value: Option<&str>,
) -> Result<IpAddr, AcquireError> {
    match value {
        None => Ok(IpAddr::from([127, 0, 0, 1])),
        Some(v) => v
            .parse()
            .map_err(|_| AcquireError::option(subsystem, format!("invalid bindaddr '{v}'"))),
    }
}

pub(crate) fn parse_port(subsystem: &'static str, value: Option<u32>) -> Result<Option<u16>, AcquireError> {
    value
        .map(|p| {
            u16::try_from(p)
                .map_err(|_| AcquireError::option(subsystem, format!("port out of range: {p}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_unix_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();

        let endpoint = bind_unix("server", &path, Some(0o600)).unwrap();
        assert_eq!(endpoint.family, SocketFamily::Unix);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_parse_bind_addr() {
        assert_eq!(
            parse_bind_addr("server", None).unwrap(),
            IpAddr::from([127, 0, 0, 1])
        );
        assert!(parse_bind_addr("server", Some("not-an-ip")).is_err());
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port("ctrl", Some(2322)).unwrap(), Some(2322));
        assert!(parse_port("ctrl", Some(70000)).is_err());
    }
}
