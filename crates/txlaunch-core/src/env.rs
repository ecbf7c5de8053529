//! Environment variable utilities
//!
//! Launcher and benchmark settings all come from `TXL_*` variables. These
//! helpers parse them with a fallback, so a malformed value degrades to the
//! default instead of failing startup. Range checks belong to the caller.
//!
//! ```ignore
//! use txlaunch_core::env::{env_get, env_get_bool};
//!
//! let pool: usize = env_get("TXL_POOL_SIZE", 4);
//! let flush = env_get_bool("TXL_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;

/// Parse a boolean switch
///
/// `1/true/yes/on` and `0/false/no/off`, case-insensitive. Anything else
/// is `None`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Get a variable parsed as `T`, or `default` if unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get a variable parsed as `T`
///
/// `None` if unset or if the value does not parse. Surrounding whitespace
/// is ignored.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get a boolean switch, or `default` if unset or unrecognized
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

/// Get a variable as a string, or `default` if unset
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Check whether a variable is set, whatever its value
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns its variable names; tests run in parallel.

    #[test]
    fn test_parse_bool() {
        for s in ["1", "true", "YES", " on "] {
            assert_eq!(parse_bool(s), Some(true), "{:?}", s);
        }
        for s in ["0", "False", "no", "off"] {
            assert_eq!(parse_bool(s), Some(false), "{:?}", s);
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn test_env_get_unset_uses_default() {
        let val: usize = env_get("__TXL_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<u64>("__TXL_TEST_UNSET__").is_none());
        assert_eq!(env_get_str("__TXL_TEST_UNSET__", "thread"), "thread");
        assert!(!env_is_set("__TXL_TEST_UNSET__"));
    }

    #[test]
    fn test_env_get_parses_value() {
        std::env::set_var("__TXL_TEST_NUM__", " 123 ");
        let val: usize = env_get("__TXL_TEST_NUM__", 0);
        assert_eq!(val, 123);
        assert!(env_is_set("__TXL_TEST_NUM__"));
        std::env::remove_var("__TXL_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_falls_back() {
        std::env::set_var("__TXL_TEST_BAD__", "lots");
        let val: usize = env_get("__TXL_TEST_BAD__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__TXL_TEST_BAD__");
    }

    #[test]
    fn test_env_get_bool() {
        std::env::set_var("__TXL_TEST_BOOL__", "on");
        assert!(env_get_bool("__TXL_TEST_BOOL__", false));

        std::env::set_var("__TXL_TEST_BOOL__", "off");
        assert!(!env_get_bool("__TXL_TEST_BOOL__", true));

        // Unrecognized keeps the default either way
        std::env::set_var("__TXL_TEST_BOOL__", "garbage");
        assert!(env_get_bool("__TXL_TEST_BOOL__", true));
        assert!(!env_get_bool("__TXL_TEST_BOOL__", false));

        std::env::remove_var("__TXL_TEST_BOOL__");
        assert!(env_get_bool("__TXL_TEST_BOOL__", true));
    }
}
