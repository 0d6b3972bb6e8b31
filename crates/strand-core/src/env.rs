//! Environment variable helpers for configuration overrides
//!
//! All runtime knobs are `STRAND_*` variables; these helpers parse them with
//! typed defaults so config construction stays one line per field.

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default.
///
/// Parse failures fall back to the default rather than erroring: a bad
/// override must never prevent the runtime from starting.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get an environment variable as a boolean.
///
/// "1", "true", "yes", "on" (case-insensitive) are true; any other set
/// value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get an environment variable if set and parseable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Get an environment variable as a string, or the default.
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__STRAND_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_set_and_invalid() {
        std::env::set_var("__STRAND_TEST_NUM__", "123");
        let val: usize = env_get("__STRAND_TEST_NUM__", 0);
        assert_eq!(val, 123);

        std::env::set_var("__STRAND_TEST_NUM__", "not_a_number");
        let val: usize = env_get("__STRAND_TEST_NUM__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__STRAND_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        assert!(env_get_bool("__STRAND_TEST_UNSET__", true));
        assert!(!env_get_bool("__STRAND_TEST_UNSET__", false));

        std::env::set_var("__STRAND_TEST_BOOL__", "YES");
        assert!(env_get_bool("__STRAND_TEST_BOOL__", false));
        std::env::set_var("__STRAND_TEST_BOOL__", "0");
        assert!(!env_get_bool("__STRAND_TEST_BOOL__", true));
        std::env::remove_var("__STRAND_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_opt_and_str() {
        let val: Option<u16> = env_get_opt("__STRAND_TEST_UNSET__");
        assert!(val.is_none());
        assert_eq!(env_get_str("__STRAND_TEST_UNSET__", "fallback"), "fallback");
    }
}
