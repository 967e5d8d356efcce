//! Control channel protocol.
//!
//! A request is a big-endian u32 command code followed by a fixed-size
//! payload. Every response starts with a big-endian u32 result code.

/// Command completed.
pub const RES_SUCCESS: u32 = 0;
/// Command failed.
pub const RES_FAIL: u32 = 9;
/// Unknown command code.
pub const RES_BAD_ORDINAL: u32 = 10;
/// Locality refused by policy.
pub const RES_BAD_LOCALITY: u32 = 61;

const CMD_GET_CAPABILITY: u32 = 1;
const CMD_INIT: u32 = 2;
const CMD_SHUTDOWN: u32 = 3;
const CMD_SET_LOCALITY: u32 = 5;
const CMD_STOP: u32 = 14;

const CAP_INIT: u32 = 0x0001;
const CAP_SHUTDOWN: u32 = 0x0002;
const CAP_SET_LOCALITY: u32 = 0x0008;
const CAP_STOP: u32 = 0x0400;

/// Mask reported by [`CtrlCommand::GetCapability`].
pub const CAPABILITIES: u32 = CAP_INIT | CAP_SHUTDOWN | CAP_SET_LOCALITY | CAP_STOP;

/// A decoded control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlCommand {
    GetCapability,
    /// (Re)start the device; `flags` is carried but not interpreted
    Init { flags: u32 },
    Shutdown,
    SetLocality(u8),
    /// Stop the device but keep serving
    Stop,
    Unknown(u32),
}

impl CtrlCommand {
    /// Decode the request at the start of `buf`.
    ///
    /// Returns the command and the number of bytes it occupies, or `None`
    /// until the whole request has arrived.
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        let code = u32::from_be_bytes(buf.get(..4)?.try_into().ok()?);
        let payload = &buf[4..];

        let (command, payload_len) = match code {
            CMD_GET_CAPABILITY => (Self::GetCapability, 0),
            CMD_INIT => {
                let flags = u32::from_be_bytes(payload.get(..4)?.try_into().ok()?);
                (Self::Init { flags }, 4)
            }
            CMD_SHUTDOWN => (Self::Shutdown, 0),
            CMD_SET_LOCALITY => (Self::SetLocality(*payload.first()?), 1),
            CMD_STOP => (Self::Stop, 0),
            other => (Self::Unknown(other), 0),
        };
        Some((command, 4 + payload_len))
    }

    /// Encode the request. Used by clients and tests.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        match *self {
            Self::GetCapability => out.extend_from_slice(&CMD_GET_CAPABILITY.to_be_bytes()),
            Self::Init { flags } => {
                out.extend_from_slice(&CMD_INIT.to_be_bytes());
                out.extend_from_slice(&flags.to_be_bytes());
            }
            Self::Shutdown => out.extend_from_slice(&CMD_SHUTDOWN.to_be_bytes()),
            Self::SetLocality(locality) => {
                out.extend_from_slice(&CMD_SET_LOCALITY.to_be_bytes());
                out.push(locality);
            }
            Self::Stop => out.extend_from_slice(&CMD_STOP.to_be_bytes()),
            Self::Unknown(code) => out.extend_from_slice(&code.to_be_bytes()),
        }
        out
    }
}

/// Response carrying only a result code.
pub fn response(result: u32) -> Vec<u8> {
    result.to_be_bytes().to_vec()
}

/// Response to [`CtrlCommand::GetCapability`].
pub fn capability_response() -> Vec<u8> {
    let mut out = response(RES_SUCCESS);
    out.extend_from_slice(&CAPABILITIES.to_be_bytes());
    out
}
