//! Control channel sub-option and resource.

use crate::acquire::adopt_fd;
use crate::error::AcquireError;
use crate::loop_flags::LoopFlags;
use crate::options::parse_optional;
use crate::transport::{bind_tcp, bind_unix, parse_bind_addr, parse_port, Endpoint, SocketFamily};
use std::os::fd::OwnedFd;
use std::path::PathBuf;

const SUBSYSTEM: &str = "ctrl";

/// How the control channel is reached.
#[derive(Debug)]
pub enum CtrlEndpoint {
    /// Listening socket; clients connect and issue commands
    Listener(Endpoint),
    /// A single, already connected client
    Client(OwnedFd),
}

/// The out-of-band control channel.
#[derive(Debug)]
pub struct CtrlChannel {
    endpoint: Option<CtrlEndpoint>,
    socket_path: Option<PathBuf>,
}

impl CtrlChannel {
    /// Parse the sub-option and open the control channel.
    ///
    /// A `clientfd` channel sets [`LoopFlags::ctrl_end_on_hup`] in `flags`:
    /// the loop ends when that single client goes away.
    ///
    /// Returns `None` when no control channel is configured.
    pub fn open(input: Option<&str>, flags: &mut LoopFlags) -> Result<Option<Self>, AcquireError> {
        let opts = parse_optional(SUBSYSTEM, input)?;
        if opts.is_empty() {
            return Ok(None);
        }
        opts.check_keys(
            SUBSYSTEM,
            &["type", "path", "mode", "fd", "clientfd", "port", "bindaddr"],
        )?;

        let family = match opts.get("type") {
            Some("unixio") => SocketFamily::Unix,
            Some("tcp") => SocketFamily::Tcp,
            Some(other) => {
                return Err(AcquireError::option(
                    SUBSYSTEM,
                    format!("unsupported type '{other}'"),
                ))
            }
            None => return Err(AcquireError::option(SUBSYSTEM, "'type' is required")),
        };

        let fd = opts.get_fd(SUBSYSTEM, "fd")?;
        let clientfd = opts.get_fd(SUBSYSTEM, "clientfd")?;
        let path = opts.get_path("path");
        let port = parse_port(SUBSYSTEM, opts.get_u32(SUBSYSTEM, "port")?)?;

        let given = [fd.is_some(), clientfd.is_some(), path.is_some(), port.is_some()]
            .iter()
            .filter(|g| **g)
            .count();
        if given != 1 {
            return Err(AcquireError::option(
                SUBSYSTEM,
                "exactly one of 'path', 'port', 'fd' or 'clientfd' is required",
            ));
        }

        let mut socket_path = None;
        let endpoint = match family {
            SocketFamily::Unix => {
                if port.is_some() {
                    return Err(AcquireError::option(SUBSYSTEM, "'port' requires type=tcp"));
                }
                if let Some(fd) = clientfd {
                    flags.ctrl_end_on_hup = true;
                    CtrlEndpoint::Client(adopt_fd(SUBSYSTEM, fd)?)
                } else if let Some(fd) = fd {
                    CtrlEndpoint::Listener(Endpoint {
                        fd: adopt_fd(SUBSYSTEM, fd)?,
                        family,
                    })
                } else if let Some(path) = path {
                    let endpoint = bind_unix(SUBSYSTEM, &path, opts.get_mode(SUBSYSTEM, "mode")?)?;
                    socket_path = Some(path);
                    CtrlEndpoint::Listener(endpoint)
                } else {
                    unreachable!("exactly one endpoint option is present")
                }
            }
            SocketFamily::Tcp => {
                if path.is_some() || clientfd.is_some() {
                    return Err(AcquireError::option(
                        SUBSYSTEM,
                        "'path' and 'clientfd' require type=unixio",
                    ));
                }
                if let Some(fd) = fd {
                    CtrlEndpoint::Listener(Endpoint {
                        fd: adopt_fd(SUBSYSTEM, fd)?,
                        family,
                    })
                } else {
                    let addr = parse_bind_addr(SUBSYSTEM, opts.get("bindaddr"))?;
                    CtrlEndpoint::Listener(bind_tcp(SUBSYSTEM, addr, port.unwrap_or_default())?)
                }
            }
        };

        tracing::info!(subsystem = SUBSYSTEM, ?family, "Control channel ready");
        Ok(Some(Self {
            endpoint: Some(endpoint),
            socket_path,
        }))
    }

    /// Hand the endpoint over to the command loop.
    pub fn take_endpoint(&mut self) -> Option<CtrlEndpoint> {
        self.endpoint.take()
    }

    /// Close the channel and unlink its socket path.
    pub fn release(mut self) {
        self.endpoint.take();
        if let Some(path) = self.socket_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(subsystem = SUBSYSTEM, path = %path.display(), error = %e, "Failed to remove socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_absent() {
        let mut flags = LoopFlags::default();
        assert!(CtrlChannel::open(None, &mut flags).unwrap().is_none());
        assert_eq!(flags, LoopFlags::default());
    }

    #[test]
    fn test_unix_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctrl.sock");
        let mut flags = LoopFlags::default();
        let mut cc = CtrlChannel::open(
            Some(&format!("type=unixio,path={},mode=0600", path.display())),
            &mut flags,
        )
        .unwrap()
        .unwrap();

        assert!(!flags.ctrl_end_on_hup);
        assert!(matches!(cc.take_endpoint(), Some(CtrlEndpoint::Listener(_))));
        cc.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_clientfd_sets_end_on_hup() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut flags = LoopFlags::default();
        let mut cc = CtrlChannel::open(
            Some(&format!("type=unixio,clientfd={}", a.into_raw_fd())),
            &mut flags,
        )
        .unwrap()
        .unwrap();

        assert!(flags.ctrl_end_on_hup);
        assert!(matches!(cc.take_endpoint(), Some(CtrlEndpoint::Client(_))));
    }

    #[test]
    fn test_tcp_listener() {
        let mut flags = LoopFlags::default();
        let cc = CtrlChannel::open(Some("type=tcp,port=0"), &mut flags)
            .unwrap()
            .unwrap();
        cc.release();
    }

    #[test]
    fn test_invalid() {
        let mut flags = LoopFlags::default();
        assert!(CtrlChannel::open(Some("path=/tmp/x"), &mut flags).is_err());
        assert!(CtrlChannel::open(Some("type=unixio"), &mut flags).is_err());
        assert!(CtrlChannel::open(Some("type=tcp,path=/tmp/x"), &mut flags).is_err());
        assert!(CtrlChannel::open(Some("type=unixio,port=1"), &mut flags).is_err());
        assert!(CtrlChannel::open(Some("type=unixio,path=/a,fd=3"), &mut flags).is_err());
    }
}
