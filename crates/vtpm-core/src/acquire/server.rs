//! Transport (server) sub-option and resource.

use crate::acquire::adopt_fd;
use crate::error::AcquireError;
use crate::loop_flags::ServerFlags;
use crate::options::parse_optional;
use crate::transport::{
    bind_tcp, bind_unix, parse_bind_addr, parse_port, Endpoint, SocketFamily, Transport,
};
use std::path::PathBuf;

const SUBSYSTEM: &str = "server";

/// Port used when `type=tcp` is given without `port` or `fd`.
pub const DEFAULT_TCP_PORT: u16 = 6545;

/// The command transport.
///
/// Owns the socket until [`Transport::take_endpoint`] moves it to the
/// command loop; always owns the socket path so it can be unlinked.
#[derive(Debug)]
pub struct Server {
    endpoint: Option<Endpoint>,
    flags: ServerFlags,
    socket_path: Option<PathBuf>,
}

impl Server {
    /// Parse the sub-option and open the transport.
    ///
    /// Returns `None` when no transport is configured.
    ///
    /// # Errors
    /// Invalid option combinations, bind failures, and stale descriptors.
    pub fn open(input: Option<&str>) -> Result<Option<Self>, AcquireError> {
        let opts = parse_optional(SUBSYSTEM, input)?;
        if opts.is_empty() {
            return Ok(None);
        }
        opts.check_keys(
            SUBSYSTEM,
            &["type", "port", "bindaddr", "path", "mode", "fd", "disconnect"],
        )?;

        let family = match opts.get("type").unwrap_or("tcp") {
            "tcp" => SocketFamily::Tcp,
            "unixio" => SocketFamily::Unix,
            other => {
                return Err(AcquireError::option(
                    SUBSYSTEM,
                    format!("unsupported type '{other}'"),
                ))
            }
        };
        let disconnect = opts.get_bool(SUBSYSTEM, "disconnect", false)?;
        let fd = opts.get_fd(SUBSYSTEM, "fd")?;
        let port = parse_port(SUBSYSTEM, opts.get_u32(SUBSYSTEM, "port")?)?;
        let path = opts.get_path("path");

        if fd.is_some() && (port.is_some() || path.is_some()) {
            return Err(AcquireError::option(
                SUBSYSTEM,
                "'fd' cannot be combined with 'port' or 'path'",
            ));
        }

        let mut socket_path = None;
        let endpoint = match (family, fd) {
            (_, Some(fd)) => Endpoint {
                fd: adopt_fd(SUBSYSTEM, fd)?,
                family,
            },
            (SocketFamily::Tcp, None) => {
                if path.is_some() {
                    return Err(AcquireError::option(SUBSYSTEM, "'path' requires type=unixio"));
                }
                let addr = parse_bind_addr(SUBSYSTEM, opts.get("bindaddr"))?;
                bind_tcp(SUBSYSTEM, addr, port.unwrap_or(DEFAULT_TCP_PORT))?
            }
            (SocketFamily::Unix, None) => {
                let Some(path) = path else {
                    return Err(AcquireError::option(
                        SUBSYSTEM,
                        "type=unixio requires 'path' or 'fd'",
                    ));
                };
                let endpoint = bind_unix(SUBSYSTEM, &path, opts.get_mode(SUBSYSTEM, "mode")?)?;
                socket_path = Some(path);
                endpoint
            }
        };

        let flags = ServerFlags {
            fd_given: fd.is_some(),
            disconnect,
        };
        tracing::info!(subsystem = SUBSYSTEM, ?family, ?flags, "Transport ready");

        Ok(Some(Self {
            endpoint: Some(endpoint),
            flags,
            socket_path,
        }))
    }

    /// Close the socket (if still held) and unlink its path.
    pub fn release(mut self) {
        self.endpoint.take();
        if let Some(path) = self.socket_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(subsystem = SUBSYSTEM, path = %path.display(), error = %e, "Failed to remove socket");
            }
        }
    }
}

impl Transport for Server {
    fn flags(&self) -> ServerFlags {
        self.flags
    }

    fn take_endpoint(&mut self) -> Option<Endpoint> {
        self.endpoint.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, IntoRawFd};
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_absent() {
        assert!(Server::open(None).unwrap().is_none());
    }

    #[test]
    fn test_unix_server_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.sock");
        let mut server = Server::open(Some(&format!("type=unixio,path={}", path.display())))
            .unwrap()
            .unwrap();
        assert_eq!(server.flags(), ServerFlags::default());
        assert!(path.exists());

        let endpoint = server.take_endpoint().unwrap();
        assert_eq!(endpoint.family, SocketFamily::Unix);
        assert!(server.take_endpoint().is_none());

        server.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_tcp_ephemeral_port() {
        let server = Server::open(Some("type=tcp,port=0,disconnect")).unwrap().unwrap();
        assert!(server.flags().disconnect);
        assert!(!server.flags().fd_given);
        server.release();
    }

    #[test]
    fn test_given_fd() {
        let (a, _b) = UnixStream::pair().unwrap();
        let raw = a.into_raw_fd();
        let mut server = Server::open(Some(&format!("type=unixio,fd={raw},disconnect")))
            .unwrap()
            .unwrap();
        assert_eq!(
            server.flags(),
            ServerFlags {
                fd_given: true,
                disconnect: true
            }
        );
        assert_eq!(server.take_endpoint().unwrap().fd.as_raw_fd(), raw);
    }

    #[test]
    fn test_invalid_combinations() {
        assert!(Server::open(Some("type=serial")).is_err());
        assert!(Server::open(Some("type=unixio")).is_err());
        assert!(Server::open(Some("type=tcp,path=/tmp/x")).is_err());
        assert!(Server::open(Some("fd=3,port=1234")).is_err());
    }
}
