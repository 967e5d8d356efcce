//! Locality policy sub-option.

use crate::error::AcquireError;
use crate::options::parse_optional;

/// Locality policy consulted by the device engine and the control channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalityFlags {
    /// Commands at locality 4 are rejected
    pub reject_locality_4: bool,
    /// The device may change locality on its own (TPM 2.0)
    pub allow_set_locality: bool,
}

impl LocalityFlags {
    /// Highest locality a client may select.
    pub const MAX_LOCALITY: u8 = 4;

    /// Parse `reject-locality-4,allow-set-locality`.
    pub fn parse(input: Option<&str>) -> Result<Self, AcquireError> {
        const SUBSYSTEM: &str = "locality";

        let opts = parse_optional(SUBSYSTEM, input)?;
        opts.check_keys(SUBSYSTEM, &["reject-locality-4", "allow-set-locality"])?;
        Ok(Self {
            reject_locality_4: opts.get_bool(SUBSYSTEM, "reject-locality-4", false)?,
            allow_set_locality: opts.get_bool(SUBSYSTEM, "allow-set-locality", false)?,
        })
    }

    /// True if `locality` may be selected under this policy.
    pub fn permits(&self, locality: u8) -> bool {
        match locality {
            4 => !self.reject_locality_4,
            l => l < Self::MAX_LOCALITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(LocalityFlags::parse(None).unwrap(), LocalityFlags::default());
        let flags = LocalityFlags::parse(Some("reject-locality-4,allow-set-locality")).unwrap();
        assert!(flags.reject_locality_4);
        assert!(flags.allow_set_locality);
        assert!(LocalityFlags::parse(Some("locality=2")).is_err());
    }

    #[test]
    fn test_permits() {
        let open = LocalityFlags::default();
        assert!((0..=4).all(|l| open.permits(l)));
        assert!(!open.permits(5));

        let strict = LocalityFlags {
            reject_locality_4: true,
            ..Default::default()
        };
        assert!(strict.permits(3));
        assert!(!strict.permits(4));
    }
}
