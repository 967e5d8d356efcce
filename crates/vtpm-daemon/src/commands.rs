//! TPM command framing and the few commands the daemon builds itself.
//!
//! Every command and response starts with a 10-byte header: tag (u16),
//! total size (u32) and ordinal or return code (u32), all big-endian.

use vtpm_core::{StartupType, TpmVersion};

/// Size of a command or response header.
pub const HEADER_SIZE: usize = 10;

/// Largest command accepted on the transport.
pub const MAX_COMMAND_SIZE: usize = 4096;

const TPM2_ST_NO_SESSIONS: u16 = 0x8001;
const TPM2_CC_STARTUP: u32 = 0x0144;
const TPM2_CC_SHUTDOWN: u32 = 0x0145;
const TPM2_SU_CLEAR: u16 = 0x0000;
const TPM2_SU_STATE: u16 = 0x0001;
const TPM2_RC_FAILURE: u32 = 0x0101;

const TPM_TAG_RQU_COMMAND: u16 = 0x00C1;
const TPM_TAG_RSP_COMMAND: u16 = 0x00C4;
const TPM_ORD_SAVE_STATE: u32 = 0x0098;
const TPM_ORD_STARTUP: u32 = 0x0099;
const TPM_ST_CLEAR: u16 = 0x0001;
const TPM_ST_STATE: u16 = 0x0002;
const TPM_ST_DEACTIVATED: u16 = 0x0003;
const TPM_FAIL: u32 = 9;

/// Parsed command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u16,
    pub size: u32,
    pub ordinal: u32,
}

/// Why a header was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Declared size is smaller than a header
    TooShort(u32),
    /// Declared size exceeds [`MAX_COMMAND_SIZE`]
    TooLarge(u32),
}

impl Header {
    /// Parse the header at the start of `buf`.
    ///
    /// Returns `Ok(None)` while fewer than [`HEADER_SIZE`] bytes are
    /// available.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = Self {
            tag: u16::from_be_bytes([buf[0], buf[1]]),
            size: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            ordinal: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        };
        if (header.size as usize) < HEADER_SIZE {
            return Err(FrameError::TooShort(header.size));
        }
        if header.size as usize > MAX_COMMAND_SIZE {
            return Err(FrameError::TooLarge(header.size));
        }
        Ok(Some(header))
    }

    /// Total frame length in bytes.
    pub fn len(&self) -> usize {
        self.size as usize
    }

    /// True for a frame that carries only a header.
    pub fn is_empty(&self) -> bool {
        self.len() == HEADER_SIZE
    }
}

fn frame(tag: u16, ordinal: u32, body: &[u8]) -> Vec<u8> {
    let size = (HEADER_SIZE + body.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(&ordinal.to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Header-only response with return code 0.
pub fn success_response(version: TpmVersion) -> Vec<u8> {
    match version {
        TpmVersion::Tpm2 => frame(TPM2_ST_NO_SESSIONS, 0, &[]),
        TpmVersion::Tpm12 => frame(TPM_TAG_RSP_COMMAND, 0, &[]),
    }
}

/// Response returned for commands the device cannot handle.
pub fn failure_response(version: TpmVersion) -> Vec<u8> {
    match version {
        TpmVersion::Tpm2 => frame(TPM2_ST_NO_SESSIONS, TPM2_RC_FAILURE, &[]),
        TpmVersion::Tpm12 => frame(TPM_TAG_RSP_COMMAND, TPM_FAIL, &[]),
    }
}

/// Startup command for `startup`, if the device version has one.
pub fn startup_command(version: TpmVersion, startup: StartupType) -> Option<Vec<u8>> {
    match version {
        TpmVersion::Tpm2 => {
            let su = match startup {
                StartupType::Clear => TPM2_SU_CLEAR,
                StartupType::State => TPM2_SU_STATE,
                StartupType::Deactivated | StartupType::None => return None,
            };
            Some(frame(TPM2_ST_NO_SESSIONS, TPM2_CC_STARTUP, &su.to_be_bytes()))
        }
        TpmVersion::Tpm12 => {
            let st = match startup {
                StartupType::Clear => TPM_ST_CLEAR,
                StartupType::State => TPM_ST_STATE,
                StartupType::Deactivated => TPM_ST_DEACTIVATED,
                StartupType::None => return None,
            };
            Some(frame(TPM_TAG_RQU_COMMAND, TPM_ORD_STARTUP, &st.to_be_bytes()))
        }
    }
}

/// `TPM2_Shutdown(SU_STATE)`, sent when a client goes away.
pub fn shutdown_state_command() -> Vec<u8> {
    frame(
        TPM2_ST_NO_SESSIONS,
        TPM2_CC_SHUTDOWN,
        &TPM2_SU_STATE.to_be_bytes(),
    )
}

/// True if `ordinal` starts the device.
pub fn is_startup(version: TpmVersion, ordinal: u32) -> bool {
    match version {
        TpmVersion::Tpm2 => ordinal == TPM2_CC_STARTUP,
        TpmVersion::Tpm12 => ordinal == TPM_ORD_STARTUP,
    }
}

/// True if `ordinal` asks the device to save its state.
pub fn is_save_state(version: TpmVersion, ordinal: u32) -> bool {
    match version {
        TpmVersion::Tpm2 => ordinal == TPM2_CC_SHUTDOWN,
        TpmVersion::Tpm12 => ordinal == TPM_ORD_SAVE_STATE,
    }
}

/// Return code of a response frame.
pub fn response_code(response: &[u8]) -> Option<u32> {
    response
        .get(6..HEADER_SIZE)
        .map(|rc| u32::from_be_bytes([rc[0], rc[1], rc[2], rc[3]]))
}
