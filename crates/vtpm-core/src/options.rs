//! Parser for comma-separated sub-option strings.
//!
//! Every resource sub-option uses the same small grammar:
//!
//! ```text
//! type=unixio,path=/run/vtpm/ctrl.sock,mode=0600
//! not-need-init,startup-clear
//! ```
//!
//! Items are either `key=value` pairs or bare flags. Each acquirer declares
//! the keys it understands and [`OptionList::check_keys`] rejects the rest.

use crate::error::AcquireError;
use std::os::fd::RawFd;
use std::path::PathBuf;

/// A parsed sub-option string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionList {
    items: Vec<(String, Option<String>)>,
}

impl OptionList {
    /// Parse a sub-option string on behalf of `subsystem`.
    ///
    /// Empty items (`a,,b`) are skipped. Keys must be non-empty and may not
    /// repeat.
    pub fn parse(subsystem: &'static str, input: &str) -> Result<Self, AcquireError> {
        let mut items: Vec<(String, Option<String>)> = Vec::new();

        for raw in input.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }

            let (key, value) = match raw.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim().to_string())),
                None => (raw, None),
            };

            if key.is_empty() {
                return Err(AcquireError::option(
                    subsystem,
                    format!("missing key in '{raw}'"),
                ));
            }
            if items.iter().any(|(k, _)| k == key) {
                return Err(AcquireError::option(
                    subsystem,
                    format!("duplicate key '{key}'"),
                ));
            }

            items.push((key.to_string(), value));
        }

        Ok(Self { items })
    }

    /// True if no items were given.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Reject any key not in `allowed`.
    pub fn check_keys(&self, subsystem: &'static str, allowed: &[&str]) -> Result<(), AcquireError> {
        for (key, _) in &self.items {
            if !allowed.contains(&key.as_str()) {
                return Err(AcquireError::option(
                    subsystem,
                    format!("unknown key '{key}'"),
                ));
            }
        }
        Ok(())
    }

    /// True if `key` is present, with or without a value.
    pub fn contains(&self, key: &str) -> bool {
        self.items.iter().any(|(k, _)| k == key)
    }

    /// Value of `key`, if given as `key=value`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Boolean flag. A bare `key` means true; `key=true|false|1|0` is explicit.
    pub fn get_bool(&self, subsystem: &'static str, key: &str, default: bool) -> Result<bool, AcquireError> {
        match self.items.iter().find(|(k, _)| k == key) {
            None => Ok(default),
            Some((_, None)) => Ok(true),
            Some((_, Some(v))) => match v.as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                other => Err(AcquireError::option(
                    subsystem,
                    format!("'{key}' expects a boolean, got '{other}'"),
                )),
            },
        }
    }

    /// Path value of `key`.
    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).filter(|v| !v.is_empty()).map(PathBuf::from)
    }

    /// Unsigned integer value of `key`.
    pub fn get_u32(&self, subsystem: &'static str, key: &str) -> Result<Option<u32>, AcquireError> {
        self.get(key)
            .map(|v| {
                v.parse::<u32>().map_err(|_| {
                    AcquireError::option(subsystem, format!("'{key}' expects a number, got '{v}'"))
                })
            })
            .transpose()
    }

    /// File descriptor value of `key`. Must be non-negative.
    pub fn get_fd(&self, subsystem: &'static str, key: &str) -> Result<Option<RawFd>, AcquireError> {
        self.get(key)
            .map(|v| match v.parse::<RawFd>() {
                Ok(fd) if fd >= 0 => Ok(fd),
                _ => Err(AcquireError::option(
                    subsystem,
                    format!("'{key}' expects a file descriptor, got '{v}'"),
                )),
            })
            .transpose()
    }

    /// Octal file mode value of `key`, e.g. `mode=0600`.
    pub fn get_mode(&self, subsystem: &'static str, key: &str) -> Result<Option<u32>, AcquireError> {
        self.get(key)
            .map(|v| match u32::from_str_radix(v, 8) {
                Ok(mode) if mode <= 0o7777 => Ok(mode),
                _ => Err(AcquireError::option(
                    subsystem,
                    format!("'{key}' expects an octal mode, got '{v}'"),
                )),
            })
            .transpose()
    }
}

/// Parse an optional sub-option; `None` and blank strings yield an empty list.
pub(crate) fn parse_optional(
    subsystem: &'static str,
    input: Option<&str>,
) -> Result<OptionList, AcquireError> {
    match input {
        Some(s) if !s.trim().is_empty() => OptionList::parse(subsystem, s),
        _ => Ok(OptionList::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs_and_flags() {
        let opts = OptionList::parse("ctrl", "type=unixio,path=/tmp/x.sock,mode=0600").unwrap();
        assert_eq!(opts.get("type"), Some("unixio"));
        assert_eq!(opts.get_path("path"), Some(PathBuf::from("/tmp/x.sock")));
        assert_eq!(opts.get_mode("ctrl", "mode").unwrap(), Some(0o600));

        let opts = OptionList::parse("flags", "not-need-init, startup-clear").unwrap();
        assert!(opts.contains("not-need-init"));
        assert!(opts.contains("startup-clear"));
        assert_eq!(opts.get("startup-clear"), None);
    }

    #[test]
    fn test_skips_empty_items() {
        let opts = OptionList::parse("log", ",level=3,,").unwrap();
        assert_eq!(opts.get_u32("log", "level").unwrap(), Some(3));
    }

    #[test]
    fn test_rejects_duplicate_and_empty_keys() {
        assert!(OptionList::parse("pid", "file=a,file=b").is_err());
        assert!(OptionList::parse("pid", "=value").is_err());
    }

    #[test]
    fn test_check_keys() {
        let opts = OptionList::parse("migration", "incoming,bogus").unwrap();
        let err = opts
            .check_keys("migration", &["incoming", "release-lock-outgoing"])
            .unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_typed_getters_reject_garbage() {
        let opts = OptionList::parse("server", "port=abc,fd=-1,mode=999,remove=maybe").unwrap();
        assert!(opts.get_u32("server", "port").is_err());
        assert!(opts.get_fd("server", "fd").is_err());
        assert!(opts.get_mode("server", "mode").is_err());
        assert!(opts.get_bool("server", "remove", false).is_err());
    }

    #[test]
    fn test_bool_forms() {
        let opts = OptionList::parse("key", "remove").unwrap();
        assert!(opts.get_bool("key", "remove", false).unwrap());
        let opts = OptionList::parse("key", "remove=false").unwrap();
        assert!(!opts.get_bool("key", "remove", true).unwrap());
        let opts = OptionList::default();
        assert!(opts.get_bool("key", "remove", true).unwrap());
    }

    #[test]
    fn test_parse_optional_blank() {
        assert!(parse_optional("log", None).unwrap().is_empty());
        assert!(parse_optional("log", Some("  ")).unwrap().is_empty());
    }
}
