//! Reference command loop.
//!
//! Serves TPM commands on the transport and control requests on the
//! control channel until a stop is requested, the control client asks for
//! shutdown, or a hang-up ends the run.

use crate::commands::{self, Header};
use crate::ctrl::{self, CtrlCommand};
use async_trait::async_trait;
use std::future::pending;
use std::io;
use std::os::fd::OwnedFd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use vtpm_core::{
    start_device, Callbacks, CommandLoop, CtrlChannel, CtrlEndpoint, DeviceEngine, Endpoint,
    LoopContext, LoopError, LoopParams, SocketFamily, TpmVersion,
};

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    fn from_endpoint(endpoint: Endpoint) -> io::Result<Self> {
        match endpoint.family {
            SocketFamily::Tcp => {
                let listener = std::net::TcpListener::from(endpoint.fd);
                listener.set_nonblocking(true)?;
                Ok(Self::Tcp(TcpListener::from_std(listener)?))
            }
            SocketFamily::Unix => {
                let listener = std::os::unix::net::UnixListener::from(endpoint.fd);
                listener.set_nonblocking(true)?;
                Ok(Self::Unix(UnixListener::from_std(listener)?))
            }
        }
    }

    async fn accept(&self) -> io::Result<Box<dyn Io>> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::debug!(%peer, "Accepted TCP client");
                Ok(Box::new(stream))
            }
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                tracing::debug!("Accepted Unix client");
                Ok(Box::new(stream))
            }
        }
    }
}

fn connected_stream(endpoint: Endpoint) -> io::Result<Box<dyn Io>> {
    match endpoint.family {
        SocketFamily::Tcp => {
            let stream = std::net::TcpStream::from(endpoint.fd);
            stream.set_nonblocking(true)?;
            Ok(Box::new(TcpStream::from_std(stream)?))
        }
        SocketFamily::Unix => connected_unix(endpoint.fd),
    }
}

fn connected_unix(fd: OwnedFd) -> io::Result<Box<dyn Io>> {
    let stream = std::os::unix::net::UnixStream::from(fd);
    stream.set_nonblocking(true)?;
    Ok(Box::new(UnixStream::from_std(stream)?))
}

/// A client connection and the bytes received but not yet consumed.
struct Conn {
    io: Box<dyn Io>,
    buf: Vec<u8>,
}

impl Conn {
    fn new(io: Box<dyn Io>) -> Self {
        Self {
            io,
            buf: Vec::new(),
        }
    }

    /// Read whatever is available. Cancel-safe.
    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 1024];
        let n = self.io.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

async fn accept(listener: Option<&Listener>) -> io::Result<Box<dyn Io>> {
    match listener {
        Some(listener) => listener.accept().await,
        None => pending().await,
    }
}

async fn fill(conn: Option<&mut Conn>) -> io::Result<usize> {
    match conn {
        Some(conn) => conn.fill().await,
        None => pending().await,
    }
}

/// What to do with a connection after its buffered input was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Keep,
    /// Drop the connection
    Close,
    /// Peer went away or the connection failed
    HangUp,
    /// Leave the command loop
    Exit,
}

/// Borrowed run state the handlers operate on.
struct Session<'a> {
    params: &'a mut LoopParams<CtrlChannel>,
    engine: &'a mut dyn DeviceEngine,
    callbacks: &'a Callbacks,
}

impl Session<'_> {
    fn version(&self) -> TpmVersion {
        self.params.tpm_version
    }

    /// Send the configured startup command to a device that is already up.
    fn send_startup(&mut self) {
        if !self.params.device_running {
            return;
        }
        let Some(startup) = self.params.startup_type else {
            return;
        };
        let Some(command) = commands::startup_command(self.version(), startup) else {
            return;
        };
        let response = self.engine.process(&command, self.params.active_locality());
        tracing::debug!(
            startup = %startup,
            rc = commands::response_code(&response),
            "Sent startup command"
        );
    }

    fn execute(&mut self, command: &[u8], ordinal: u32) -> Vec<u8> {
        self.params.last_command = Some(ordinal);
        if !self.params.device_running {
            tracing::debug!(ordinal, "Command before device start");
            return commands::failure_response(self.version());
        }
        self.engine.process(command, self.params.active_locality())
    }

    /// Shut a TPM 2 device down cleanly when its client goes away.
    fn client_gone(&mut self) {
        if self.params.device_running
            && !self.params.disable_auto_shutdown
            && self.version() == TpmVersion::Tpm2
        {
            let command = commands::shutdown_state_command();
            let response = self.engine.process(&command, self.params.active_locality());
            tracing::debug!(
                rc = commands::response_code(&response),
                "Sent shutdown on client hang-up"
            );
        }
    }

    fn init_device(&mut self) -> u32 {
        if self.params.device_running {
            self.engine.terminate();
            self.params.device_running = false;
        }

        let version = self.version();
        let locked = self.params.lock_decision();
        match start_device(self.engine, self.callbacks, version, locked) {
            Ok(()) => {
                self.params.storage_locked = locked;
                self.params.device_running = true;
                ctrl::RES_SUCCESS
            }
            Err(e) => {
                tracing::warn!(error = %e, "Deferred device start failed");
                ctrl::RES_FAIL
            }
        }
    }

    fn stop_device(&mut self) {
        if self.params.device_running {
            self.engine.terminate();
            self.params.device_running = false;
        }
        if self.params.release_lock_outgoing && self.params.storage_locked {
            self.callbacks.nvram.unlock_storage();
            self.params.storage_locked = false;
            tracing::debug!("Released storage lock for outgoing migration");
        }
    }

    async fn serve_transport(&mut self, conn: &mut Conn) -> Next {
        loop {
            let header = match Header::parse(&conn.buf) {
                Ok(Some(header)) => header,
                Ok(None) => return Next::Keep,
                Err(e) => {
                    tracing::warn!(error = ?e, "Malformed command header");
                    let response = commands::failure_response(self.version());
                    let _ = conn.io.write_all(&response).await;
                    return Next::Close;
                }
            };
            if conn.buf.len() < header.len() {
                return Next::Keep;
            }

            let command: Vec<u8> = conn.buf.drain(..header.len()).collect();
            let response = self.execute(&command, header.ordinal);
            if let Err(e) = conn.io.write_all(&response).await {
                tracing::debug!(error = %e, "Transport write failed");
                return Next::HangUp;
            }
            if !self.params.flags.keep_connection {
                return Next::Close;
            }
        }
    }

    async fn serve_ctrl(&mut self, conn: &mut Conn) -> Next {
        while let Some((command, len)) = CtrlCommand::parse(&conn.buf) {
            conn.buf.drain(..len);
            tracing::debug!(?command, "Control command");

            let mut next = Next::Keep;
            let response = match command {
                CtrlCommand::GetCapability => ctrl::capability_response(),
                CtrlCommand::Init { .. } => ctrl::response(self.init_device()),
                CtrlCommand::Shutdown => {
                    next = Next::Exit;
                    ctrl::response(ctrl::RES_SUCCESS)
                }
                CtrlCommand::SetLocality(locality) => {
                    if self.params.set_locality(locality) {
                        ctrl::response(ctrl::RES_SUCCESS)
                    } else {
                        tracing::warn!(locality, "Locality refused");
                        ctrl::response(ctrl::RES_BAD_LOCALITY)
                    }
                }
                CtrlCommand::Stop => {
                    self.stop_device();
                    ctrl::response(ctrl::RES_SUCCESS)
                }
                CtrlCommand::Unknown(code) => {
                    tracing::debug!(code, "Unknown control command");
                    ctrl::response(ctrl::RES_BAD_ORDINAL)
                }
            };

            if let Err(e) = conn.io.write_all(&response).await {
                tracing::debug!(error = %e, "Control write failed");
                return Next::HangUp;
            }
            if next == Next::Exit {
                return next;
            }
        }
        Next::Keep
    }
}

/// The daemon's command loop.
#[derive(Debug, Default)]
pub struct MainLoop;

impl MainLoop {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandLoop for MainLoop {
    type CtrlChannel = CtrlChannel;

    async fn run(&mut self, ctx: LoopContext<'_, CtrlChannel>) -> Result<(), LoopError> {
        let LoopContext {
            params,
            engine,
            callbacks,
            stop,
        } = ctx;

        let flags = params.flags;

        let (ctrl_listener, mut ctrl_conn) =
            match params.ctrl.as_mut().and_then(CtrlChannel::take_endpoint) {
                Some(CtrlEndpoint::Listener(endpoint)) => {
                    (Some(Listener::from_endpoint(endpoint)?), None)
                }
                Some(CtrlEndpoint::Client(fd)) => (None, Some(Conn::new(connected_unix(fd)?))),
                None => (None, None),
            };

        let (listener, mut conn) = match params.endpoint.take() {
            Some(endpoint) if flags.use_fd => (None, Some(Conn::new(connected_stream(endpoint)?))),
            Some(endpoint) => (Some(Listener::from_endpoint(endpoint)?), None),
            None => (None, None),
        };

        let mut session = Session {
            params,
            engine,
            callbacks,
        };
        session.send_startup();

        tracing::info!(
            ctrl = ctrl_listener.is_some() || ctrl_conn.is_some(),
            transport = listener.is_some() || conn.is_some(),
            "Command loop running"
        );

        loop {
            tokio::select! {
                biased;

                _ = stop.stopped() => {
                    tracing::info!("Stop requested, leaving command loop");
                    break;
                }

                res = accept(ctrl_listener.as_ref()), if ctrl_conn.is_none() => match res {
                    Ok(io) => ctrl_conn = Some(Conn::new(io)),
                    Err(e) => tracing::warn!(error = %e, "Control accept failed"),
                },

                res = fill(ctrl_conn.as_mut()) => {
                    let next = match (res, ctrl_conn.as_mut()) {
                        (Ok(n), Some(c)) if n > 0 => session.serve_ctrl(c).await,
                        _ => Next::HangUp,
                    };
                    match next {
                        Next::Keep => {}
                        Next::Exit => {
                            tracing::info!("Shutdown requested on control channel");
                            break;
                        }
                        Next::Close | Next::HangUp => {
                            ctrl_conn = None;
                            if flags.ctrl_end_on_hup {
                                tracing::info!("Control client hung up");
                                break;
                            }
                        }
                    }
                }

                res = accept(listener.as_ref()), if conn.is_none() => match res {
                    Ok(io) => conn = Some(Conn::new(io)),
                    Err(e) => tracing::warn!(error = %e, "Transport accept failed"),
                },

                res = fill(conn.as_mut()) => {
                    let next = match (res, conn.as_mut()) {
                        (Ok(n), Some(c)) if n > 0 => session.serve_transport(c).await,
                        _ => Next::HangUp,
                    };
                    match next {
                        Next::Keep => {}
                        Next::Close => {
                            conn = None;
                            if flags.terminate {
                                tracing::info!("Transport closed, terminating");
                                break;
                            }
                        }
                        Next::HangUp | Next::Exit => {
                            conn = None;
                            session.client_gone();
                            if flags.terminate {
                                tracing::info!("Transport closed, terminating");
                                break;
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
