//! Command loop behaviour flags.

/// Properties of a resolved transport that affect loop behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerFlags {
    /// Descriptor was handed in by the caller rather than created here
    pub fd_given: bool,
    /// Client connection is dropped after each command
    pub disconnect: bool,
}

/// Behaviour switches for the command loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopFlags {
    /// Keep the client connection open between commands
    pub keep_connection: bool,
    /// Terminate once the external descriptor closes
    pub terminate: bool,
    /// Transport descriptor is an already-open connection
    pub use_fd: bool,
    /// Terminate when the control channel client hangs up
    pub ctrl_end_on_hup: bool,
}

impl LoopFlags {
    /// Fold the transport's properties into flags contributed by the
    /// control channel.
    ///
    /// With a transport present the connection is kept open unless the
    /// transport asks to disconnect after each command. A caller-supplied
    /// descriptor additionally terminates the loop when it closes and is
    /// used as a pre-opened connection.
    #[must_use]
    pub fn compose(self, transport: Option<ServerFlags>) -> Self {
        let Some(server) = transport else {
            return self;
        };

        let mut flags = self;
        flags.keep_connection = !server.disconnect;
        if server.fd_given {
            flags.terminate = true;
            flags.use_fd = true;
        }
        flags
    }
}
