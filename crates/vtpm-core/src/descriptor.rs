//! Configuration descriptor and its validator.
//!
//! A [`Descriptor`] is the versioned, immutable record a caller hands to the
//! supervisor. [`Descriptor::validate`] is the only check performed while no
//! resource is held: it confirms the shape tag, the device version selector,
//! and rejects option combinations that can never work together. Each
//! sub-option string is otherwise validated by the acquirer that owns it.

use crate::error::ConfigError;
use crate::options::OptionList;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape tag this supervisor understands.
pub const DESCRIPTOR_VERSION: u32 = 1;

/// Version selector value for a TPM 1.2 device.
pub const TPM_VERSION_1_2: u32 = 0;

/// Version selector value for a TPM 2.0 device.
pub const TPM_VERSION_2: u32 = 1;

/// Device version emulated by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TpmVersion {
    /// TPM 1.2
    #[default]
    Tpm12,
    /// TPM 2.0
    Tpm2,
}

impl TpmVersion {
    /// Map a raw selector to a supported version.
    pub fn from_selector(selector: u32) -> Result<Self, ConfigError> {
        match selector {
            TPM_VERSION_1_2 => Ok(Self::Tpm12),
            TPM_VERSION_2 => Ok(Self::Tpm2),
            other => Err(ConfigError::UnsupportedTpmVersion(other)),
        }
    }

    /// Raw selector value.
    pub fn selector(&self) -> u32 {
        match self {
            Self::Tpm12 => TPM_VERSION_1_2,
            Self::Tpm2 => TPM_VERSION_2,
        }
    }

    /// File name prefix for blobs belonging to this version.
    pub fn blob_prefix(&self) -> &'static str {
        match self {
            Self::Tpm12 => "tpm",
            Self::Tpm2 => "tpm2",
        }
    }
}

impl fmt::Display for TpmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tpm12 => write!(f, "1.2"),
            Self::Tpm2 => write!(f, "2"),
        }
    }
}

/// Startup flags that cause the device to initialize without an explicit
/// init command.
const STARTUP_FLAGS: [&str; 4] = [
    "startup-clear",
    "startup-state",
    "startup-deactivated",
    "startup-none",
];

/// Versioned configuration record supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Descriptor {
    /// Shape tag; must equal [`DESCRIPTOR_VERSION`]
    pub descriptor_version: u32,
    /// Device version selector
    #[serde(default = "default_tpm_version")]
    pub tpm_version: u32,
    /// State encryption key sub-option
    #[serde(default)]
    pub key: Option<String>,
    /// Migration key sub-option
    #[serde(default)]
    pub migration_key: Option<String>,
    /// Log target sub-option
    #[serde(default)]
    pub log: Option<String>,
    /// PID file sub-option
    #[serde(default)]
    pub pid: Option<String>,
    /// Locality policy sub-option
    #[serde(default)]
    pub locality: Option<String>,
    /// State storage sub-option
    #[serde(default)]
    pub tpmstate: Option<String>,
    /// Control channel sub-option
    #[serde(default)]
    pub ctrl: Option<String>,
    /// Transport sub-option
    #[serde(default)]
    pub server: Option<String>,
    /// Startup flags sub-option
    #[serde(default)]
    pub flags: Option<String>,
    /// Sandbox policy sub-option
    #[serde(default)]
    pub seccomp: Option<String>,
    /// Migration mode sub-option
    #[serde(default)]
    pub migration: Option<String>,
}

fn default_tpm_version() -> u32 {
    TPM_VERSION_2
}

impl Default for Descriptor {
    fn default() -> Self {
        Self {
            descriptor_version: DESCRIPTOR_VERSION,
            tpm_version: default_tpm_version(),
            key: None,
            migration_key: None,
            log: None,
            pid: None,
            locality: None,
            tpmstate: None,
            ctrl: None,
            server: None,
            flags: None,
            seccomp: None,
            migration: None,
        }
    }
}

impl Descriptor {
    /// Create a new descriptor builder.
    pub fn builder() -> DescriptorBuilder {
        DescriptorBuilder::default()
    }

    /// Decode a descriptor from JSON.
    ///
    /// Unknown fields and a missing shape tag are rejected here, before
    /// [`validate`](Self::validate) runs.
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(input).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    /// Validate the descriptor without touching any resource.
    ///
    /// # Errors
    /// Returns the first rejection reason found.
    pub fn validate(&self) -> Result<TpmVersion, ConfigError> {
        if self.descriptor_version != DESCRIPTOR_VERSION {
            return Err(ConfigError::VersionMismatch {
                expected: DESCRIPTOR_VERSION,
                actual: self.descriptor_version,
            });
        }

        let version = TpmVersion::from_selector(self.tpm_version)?;

        // Sub-options that fail to parse are left for their acquirer to report.
        let flags = lenient(self.flags.as_deref());
        let migration = lenient(self.migration.as_deref());

        let startups: Vec<&str> = STARTUP_FLAGS
            .iter()
            .copied()
            .filter(|f| enabled(&flags, f))
            .collect();
        if startups.len() > 1 {
            return Err(ConfigError::Conflict(format!(
                "only one startup type may be given, got {}",
                startups.join(" and ")
            )));
        }

        if enabled(&migration, "incoming") && enabled(&flags, "startup-clear") {
            return Err(ConfigError::Conflict(
                "incoming migration cannot be combined with startup-clear".into(),
            ));
        }

        Ok(version)
    }
}

fn lenient(input: Option<&str>) -> OptionList {
    input
        .and_then(|s| OptionList::parse("descriptor", s).ok())
        .unwrap_or_default()
}

/// Same truth table as the acquirers; bad boolean values count as unset.
fn enabled(opts: &OptionList, key: &str) -> bool {
    opts.get_bool("descriptor", key, false).unwrap_or(false)
}

/// Builder for [`Descriptor`].
#[derive(Debug, Default)]
pub struct DescriptorBuilder {
    descriptor: Descriptor,
}

impl DescriptorBuilder {
    /// Set the device version.
    pub fn tpm_version(mut self, version: TpmVersion) -> Self {
        self.descriptor.tpm_version = version.selector();
        self
    }

    /// Set the state encryption key sub-option.
    pub fn key(mut self, opts: impl Into<String>) -> Self {
        self.descriptor.key = Some(opts.into());
        self
    }

    /// Set the migration key sub-option.
    pub fn migration_key(mut self, opts: impl Into<String>) -> Self {
        self.descriptor.migration_key = Some(opts.into());
        self
    }

    /// Set the log target sub-option.
    pub fn log(mut self, opts: impl Into<String>) -> Self {
        self.descriptor.log = Some(opts.into());
        self
    }

    /// Set the PID file sub-option.
    pub fn pid(mut self, opts: impl Into<String>) -> Self {
        self.descriptor.pid = Some(opts.into());
        self
    }

    /// Set the locality policy sub-option.
    pub fn locality(mut self, opts: impl Into<String>) -> Self {
        self.descriptor.locality = Some(opts.into());
        self
    }

    /// Set the state storage sub-option.
    pub fn tpmstate(mut self, opts: impl Into<String>) -> Self {
        self.descriptor.tpmstate = Some(opts.into());
        self
    }

    /// Set the control channel sub-option.
    pub fn ctrl(mut self, opts: impl Into<String>) -> Self {
        self.descriptor.ctrl = Some(opts.into());
        self
    }

    /// Set the transport sub-option.
    pub fn server(mut self, opts: impl Into<String>) -> Self {
        self.descriptor.server = Some(opts.into());
        self
    }

    /// Set the startup flags sub-option.
    pub fn flags(mut self, opts: impl Into<String>) -> Self {
        self.descriptor.flags = Some(opts.into());
        self
    }

    /// Set the sandbox policy sub-option.
    pub fn seccomp(mut self, opts: impl Into<String>) -> Self {
        self.descriptor.seccomp = Some(opts.into());
        self
    }

    /// Set the migration mode sub-option.
    pub fn migration(mut self, opts: impl Into<String>) -> Self {
        self.descriptor.migration = Some(opts.into());
        self
    }

    /// Build the descriptor, running the validator.
    pub fn build(self) -> Result<Descriptor, ConfigError> {
        self.descriptor.validate()?;
        Ok(self.descriptor)
    }

    /// Build the descriptor without validation.
    ///
    /// Useful for tests that exercise the validator inside a run.
    pub fn build_unchecked(self) -> Descriptor {
        self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_descriptor_is_valid() {
        let descriptor = Descriptor::default();
        assert_eq!(descriptor.validate(), Ok(TpmVersion::Tpm2));
    }

    #[test]
    fn test_version_mismatch() {
        let descriptor = Descriptor {
            descriptor_version: 2,
            ..Default::default()
        };
        assert_eq!(
            descriptor.validate(),
            Err(ConfigError::VersionMismatch {
                expected: DESCRIPTOR_VERSION,
                actual: 2
            })
        );
    }

    #[test]
    fn test_unsupported_tpm_version() {
        let descriptor = Descriptor {
            tpm_version: 5,
            ..Default::default()
        };
        assert_eq!(
            descriptor.validate(),
            Err(ConfigError::UnsupportedTpmVersion(5))
        );
    }

    #[test]
    fn test_incoming_migration_with_startup_clear() {
        let result = Descriptor::builder()
            .flags("startup-clear")
            .migration("incoming")
            .build();
        assert!(matches!(result, Err(ConfigError::Conflict(_))));

        // startup-state resumes saved state, which is fine
        let result = Descriptor::builder()
            .flags("startup-state")
            .migration("incoming")
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_multiple_startup_types() {
        let result = Descriptor::builder()
            .flags("startup-clear,startup-state")
            .build();
        assert!(matches!(result, Err(ConfigError::Conflict(_))));
    }

    #[test]
    fn test_disabled_flags_do_not_conflict() {
        let result = Descriptor::builder()
            .flags("startup-clear=false")
            .migration("incoming")
            .build();
        assert!(result.is_ok(), "{result:?}");

        let result = Descriptor::builder()
            .flags("startup-clear=false,startup-state")
            .build();
        assert!(result.is_ok(), "{result:?}");

        let result = Descriptor::builder()
            .flags("startup-clear")
            .migration("incoming=false")
            .build();
        assert!(result.is_ok(), "{result:?}");

        // explicit true still counts
        let result = Descriptor::builder()
            .flags("startup-clear=true")
            .migration("incoming=yes")
            .build();
        assert!(matches!(result, Err(ConfigError::Conflict(_))));
    }

    #[test]
    fn test_malformed_sub_option_left_to_acquirer() {
        let result = Descriptor::builder().flags("=oops").build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_from_json() {
        let descriptor = Descriptor::from_json(
            r#"{"descriptor_version": 1, "tpm_version": 0, "tpmstate": "dir=/var/lib/vtpm"}"#,
        )
        .unwrap();
        assert_eq!(descriptor.validate(), Ok(TpmVersion::Tpm12));
        assert_eq!(descriptor.tpmstate.as_deref(), Some("dir=/var/lib/vtpm"));
    }

    #[test]
    fn test_from_json_rejects_wrong_shape() {
        assert!(matches!(
            Descriptor::from_json(r#"{"tpm_version": 1}"#),
            Err(ConfigError::Malformed(_))
        ));
        assert!(matches!(
            Descriptor::from_json(r#"{"descriptor_version": 1, "extra": true}"#),
            Err(ConfigError::Malformed(_))
        ));
    }

    #[test]
    fn test_tpm_version_display() {
        assert_eq!(format!("{}", TpmVersion::Tpm12), "1.2");
        assert_eq!(format!("{}", TpmVersion::Tpm2), "2");
        assert_eq!(TpmVersion::Tpm2.blob_prefix(), "tpm2");
    }
}
