//! State encryption and migration key sub-options.

use crate::acquire::adopt_fd;
use crate::error::AcquireError;
use crate::options::parse_optional;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

/// Cipher the key is meant for; fixes the expected key length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyMode {
    /// AES-128-CBC, 16 byte key
    #[default]
    Aes128Cbc,
    /// AES-256-CBC, 32 byte key
    Aes256Cbc,
}

impl KeyMode {
    /// Key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            Self::Aes128Cbc => 16,
            Self::Aes256Cbc => 32,
        }
    }
}

/// Encoding of the key source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyFormat {
    /// Hex digits, surrounding whitespace ignored
    #[default]
    Hex,
    /// Raw bytes
    Binary,
}

/// Key bytes read from a file or descriptor.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
    mode: KeyMode,
}

impl KeyMaterial {
    /// Parse and read the key sub-option on behalf of `subsystem`
    /// (`key` or `migration-key`). Returns `None` when not configured.
    pub fn load(subsystem: &'static str, input: Option<&str>) -> Result<Option<Self>, AcquireError> {
        let opts = parse_optional(subsystem, input)?;
        if opts.is_empty() {
            return Ok(None);
        }
        opts.check_keys(subsystem, &["file", "fd", "format", "mode", "remove"])?;

        let format = match opts.get("format") {
            None | Some("hex") => KeyFormat::Hex,
            Some("binary") => KeyFormat::Binary,
            Some(other) => {
                return Err(AcquireError::option(
                    subsystem,
                    format!("unsupported format '{other}'"),
                ))
            }
        };
        let mode = match opts.get("mode") {
            None | Some("aes-cbc") => KeyMode::Aes128Cbc,
            Some("aes-256-cbc") => KeyMode::Aes256Cbc,
            Some(other) => {
                return Err(AcquireError::option(
                    subsystem,
                    format!("unsupported mode '{other}'"),
                ))
            }
        };
        let remove = opts.get_bool(subsystem, "remove", false)?;

        let raw = match (opts.get_path("file"), opts.get_fd(subsystem, "fd")?) {
            (Some(path), None) => {
                let raw = std::fs::read(&path).map_err(AcquireError::io(subsystem))?;
                if remove {
                    remove_key_file(subsystem, &path);
                }
                raw
            }
            (None, Some(fd)) => {
                if remove {
                    return Err(AcquireError::option(subsystem, "'remove' requires 'file'"));
                }
                let mut raw = Vec::new();
                File::from(adopt_fd(subsystem, fd)?)
                    .read_to_end(&mut raw)
                    .map_err(AcquireError::io(subsystem))?;
                raw
            }
            (Some(_), Some(_)) => {
                return Err(AcquireError::option(
                    subsystem,
                    "'file' and 'fd' are mutually exclusive",
                ))
            }
            (None, None) => {
                return Err(AcquireError::option(subsystem, "either 'file' or 'fd' is required"))
            }
        };

        let bytes = match format {
            KeyFormat::Hex => decode_hex(subsystem, &raw)?,
            KeyFormat::Binary => raw,
        };
        if bytes.len() != mode.key_len() {
            return Err(AcquireError::option(
                subsystem,
                format!(
                    "key is {} bytes, {:?} needs {}",
                    bytes.len(),
                    mode,
                    mode.key_len()
                ),
            ));
        }

        tracing::debug!(subsystem, ?mode, ?format, "Key loaded");
        Ok(Some(Self { bytes, mode }))
    }

    /// Key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Cipher the key belongs to.
    pub fn mode(&self) -> KeyMode {
        self.mode
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("mode", &self.mode)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

fn remove_key_file(subsystem: &'static str, path: &PathBuf) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(subsystem, path = %path.display(), error = %e, "Failed to remove key file");
    }
}

fn decode_hex(subsystem: &'static str, raw: &[u8]) -> Result<Vec<u8>, AcquireError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| AcquireError::option(subsystem, "hex key is not valid text"))?
        .trim();
    if text.len() % 2 != 0 {
        return Err(AcquireError::option(subsystem, "hex key has an odd number of digits"));
    }

    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| AcquireError::option(subsystem, "hex key contains non-hex characters"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_128: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn test_absent() {
        assert!(KeyMaterial::load("key", None).unwrap().is_none());
    }

    #[test]
    fn test_hex_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, format!("{HEX_128}\n")).unwrap();

        let key = KeyMaterial::load("key", Some(&format!("file={}", path.display())))
            .unwrap()
            .unwrap();
        assert_eq!(key.mode(), KeyMode::Aes128Cbc);
        assert_eq!(key.as_bytes(), (0u8..16).collect::<Vec<_>>().as_slice());
        assert!(path.exists());
    }

    #[test]
    fn test_binary_key_with_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.bin");
        std::fs::write(&path, [7u8; 32]).unwrap();

        let key = KeyMaterial::load(
            "migration-key",
            Some(&format!(
                "file={},format=binary,mode=aes-256-cbc,remove",
                path.display()
            )),
        )
        .unwrap()
        .unwrap();
        assert_eq!(key.as_bytes(), &[7u8; 32]);
        assert!(!path.exists());
    }

    #[test]
    fn test_length_must_match_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, HEX_128).unwrap();

        let err = KeyMaterial::load(
            "key",
            Some(&format!("file={},mode=aes-256-cbc", path.display())),
        )
        .unwrap_err();
        assert_eq!(err.subsystem(), "key");
    }

    #[test]
    fn test_debug_redacts() {
        let key = KeyMaterial {
            bytes: vec![0xaa; 16],
            mode: KeyMode::Aes128Cbc,
        };
        assert!(!format!("{key:?}").contains("170"));
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex("key", b" 0aFf ").unwrap(), vec![0x0a, 0xff]);
        assert!(decode_hex("key", b"abc").is_err());
        assert!(decode_hex("key", b"zz").is_err());
    }
}
