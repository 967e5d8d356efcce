//! Startup and migration flags.
//!
//! Both are pure acquirers: they produce values for the lifecycle
//! parameters and hold nothing that needs releasing.

use crate::error::AcquireError;
use crate::options::parse_optional;
use std::fmt;

/// Startup command the device runs on its own after it is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupType {
    /// Fresh start, volatile state cleared
    Clear,
    /// Resume previously saved volatile state
    State,
    /// Start deactivated (TPM 1.2)
    Deactivated,
    /// Start the device but send no startup command
    None,
}

impl StartupType {
    fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "startup-clear" => Some(Self::Clear),
            "startup-state" => Some(Self::State),
            "startup-deactivated" => Some(Self::Deactivated),
            "startup-none" => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for StartupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clear => write!(f, "clear"),
            Self::State => write!(f, "state"),
            Self::Deactivated => write!(f, "deactivated"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Parsed `flags` sub-option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupFlags {
    /// Wait for an explicit init command before starting the device
    pub need_init_cmd: bool,
    /// Startup command issued after the device starts
    pub startup_type: Option<StartupType>,
    /// Do not shut the device down when the client goes away
    pub disable_auto_shutdown: bool,
}

impl Default for StartupFlags {
    fn default() -> Self {
        Self {
            need_init_cmd: true,
            startup_type: None,
            disable_auto_shutdown: false,
        }
    }
}

impl StartupFlags {
    /// Parse the flags sub-option.
    ///
    /// Any `startup-*` flag implies `not-need-init`.
    pub fn parse(input: Option<&str>) -> Result<Self, AcquireError> {
        const SUBSYSTEM: &str = "flags";

        let opts = parse_optional(SUBSYSTEM, input)?;
        opts.check_keys(
            SUBSYSTEM,
            &[
                "not-need-init",
                "startup-clear",
                "startup-state",
                "startup-deactivated",
                "startup-none",
                "disable-auto-shutdown",
            ],
        )?;

        let mut startup_type = None;
        for flag in ["startup-clear", "startup-state", "startup-deactivated", "startup-none"] {
            if !opts.get_bool(SUBSYSTEM, flag, false)? {
                continue;
            }
            if startup_type.is_some() {
                return Err(AcquireError::option(SUBSYSTEM, "only one startup type may be given"));
            }
            startup_type = StartupType::from_flag(flag);
        }

        let not_need_init = opts.get_bool(SUBSYSTEM, "not-need-init", false)?;
        Ok(Self {
            need_init_cmd: !not_need_init && startup_type.is_none(),
            startup_type,
            disable_auto_shutdown: opts.get_bool(SUBSYSTEM, "disable-auto-shutdown", false)?,
        })
    }
}

/// Parsed `migration` sub-option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationOptions {
    /// State will be imported from another instance; storage stays unlocked
    pub incoming: bool,
    /// Release the storage lock once outgoing state has been read
    pub release_lock_outgoing: bool,
}

impl MigrationOptions {
    /// Parse `incoming,release-lock-outgoing`.
    pub fn parse(input: Option<&str>) -> Result<Self, AcquireError> {
        const SUBSYSTEM: &str = "migration";

        let opts = parse_optional(SUBSYSTEM, input)?;
        opts.check_keys(SUBSYSTEM, &["incoming", "release-lock-outgoing"])?;
        Ok(Self {
            incoming: opts.get_bool(SUBSYSTEM, "incoming", false)?,
            release_lock_outgoing: opts.get_bool(SUBSYSTEM, "release-lock-outgoing", false)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_waits_for_init() {
        let flags = StartupFlags::parse(None).unwrap();
        assert!(flags.need_init_cmd);
        assert_eq!(flags.startup_type, None);
        assert!(!flags.disable_auto_shutdown);
    }

    #[test]
    fn test_not_need_init() {
        let flags = StartupFlags::parse(Some("not-need-init,disable-auto-shutdown")).unwrap();
        assert!(!flags.need_init_cmd);
        assert!(flags.disable_auto_shutdown);
    }

    #[test]
    fn test_startup_type_implies_eager() {
        for (input, expected) in [
            ("startup-clear", StartupType::Clear),
            ("startup-state", StartupType::State),
            ("startup-deactivated", StartupType::Deactivated),
            ("startup-none", StartupType::None),
        ] {
            let flags = StartupFlags::parse(Some(input)).unwrap();
            assert!(!flags.need_init_cmd, "{input}");
            assert_eq!(flags.startup_type, Some(expected));
        }
    }

    #[test]
    fn test_rejects_bad_flags() {
        assert!(StartupFlags::parse(Some("startup-clear,startup-none")).is_err());
        assert!(StartupFlags::parse(Some("startup-bogus")).is_err());
    }

    #[test]
    fn test_migration() {
        assert_eq!(MigrationOptions::parse(None).unwrap(), MigrationOptions::default());

        let migration = MigrationOptions::parse(Some("incoming,release-lock-outgoing")).unwrap();
        assert!(migration.incoming);
        assert!(migration.release_lock_outgoing);

        assert!(MigrationOptions::parse(Some("outgoing")).is_err());
    }
}
