//! Process configuration.
//!
//! Each binary builds one immutable configuration value at startup from the
//! environment and passes it down explicitly. The `from_lookup` constructors
//! take the variable source as a function so tests never touch the real
//! process environment.

pub mod cleaner;
pub mod worker;

pub use cleaner::CleanerConfig;
pub use worker::{StorageCredentials, WorkerConfig};

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Source of configuration variables.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Read from the process environment.
pub fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Trimmed, non-empty value of `name`.
pub(crate) fn var(lookup: Lookup<'_>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn parse_var<T>(lookup: Lookup<'_>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    var(lookup, name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Error::config(format!("invalid {name}={raw:?}: {e}")))
        })
        .transpose()
}

/// Bool-like variable: `1|true|yes|on` or `0|false|no|off`.
pub(crate) fn bool_var(lookup: Lookup<'_>, name: &str) -> Result<Option<bool>> {
    var(lookup, name)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::config(format!("invalid {name}={raw:?}: expected a boolean"))),
        })
        .transpose()
}

/// Non-negative number of seconds, fractions allowed.
pub(crate) fn secs_var(lookup: Lookup<'_>, name: &str) -> Result<Option<Duration>> {
    parse_var::<f64>(lookup, name)?
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|_| Error::config(format!("invalid {name}={secs}: expected seconds >= 0")))
        })
        .transpose()
}

/// Byte count, as an integer or in float notation such as `1e9`.
pub(crate) fn size_var(lookup: Lookup<'_>, name: &str) -> Result<Option<u64>> {
    let Some(raw) = var(lookup, name) else {
        return Ok(None);
    };
    if let Ok(size) = raw.parse::<u64>() {
        return Ok(Some(size));
    }
    match raw.parse::<f64>() {
        Ok(size) if size.is_finite() && size >= 0.0 => Ok(Some(size as u64)),
        _ => Err(Error::config(format!(
            "invalid {name}={raw:?}: expected a size in bytes"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    /// Lookup over a fixed set of variables.
    pub fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::lookup_from;
    use super::*;

    #[test]
    fn test_bool_var() {
        let lookup = lookup_from(&[("A", "Yes"), ("B", "0"), ("C", "maybe"), ("D", " ")]);
        assert_eq!(bool_var(&lookup, "A").unwrap(), Some(true));
        assert_eq!(bool_var(&lookup, "B").unwrap(), Some(false));
        assert!(bool_var(&lookup, "C").is_err());
        assert_eq!(bool_var(&lookup, "D").unwrap(), None);
        assert_eq!(bool_var(&lookup, "E").unwrap(), None);
    }

    #[test]
    fn test_size_var_accepts_float_notation() {
        let lookup = lookup_from(&[("A", "1e9"), ("B", "2048"), ("C", "-1"), ("D", "big")]);
        assert_eq!(size_var(&lookup, "A").unwrap(), Some(1_000_000_000));
        assert_eq!(size_var(&lookup, "B").unwrap(), Some(2048));
        assert!(size_var(&lookup, "C").is_err());
        assert!(size_var(&lookup, "D").is_err());
    }

    #[test]
    fn test_secs_var() {
        let lookup = lookup_from(&[("A", "0.5"), ("B", "-3")]);
        assert_eq!(secs_var(&lookup, "A").unwrap(), Some(Duration::from_millis(500)));
        assert!(secs_var(&lookup, "B").is_err());
    }
}
