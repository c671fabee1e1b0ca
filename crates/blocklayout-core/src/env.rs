//! Environment variable utilities
//!
//! Every tunable of the block-layout stack can be overridden from the
//! environment (`BL_*`). Config constructors call these helpers.
//!
//! ```ignore
//! let segs: usize = env_get("BL_MAX_SEGMENTS", 256);
//! let direct = env_get_bool("BL_DIRECT", false);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, or return `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` if `key` is set and parses.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// "1", "true", "yes", "on" (any case) are true; any other value is false.
/// Unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__BL_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<u32>("__BL_TEST_UNSET__").is_none());
        assert!(env_get_bool("__BL_TEST_UNSET__", true));
    }

    #[test]
    fn test_env_get_parses_and_trims() {
        std::env::set_var("__BL_TEST_NUM__", " 128 ");
        let val: usize = env_get("__BL_TEST_NUM__", 0);
        assert_eq!(val, 128);
        std::env::set_var("__BL_TEST_NUM__", "many");
        let val: usize = env_get("__BL_TEST_NUM__", 7);
        assert_eq!(val, 7);
        std::env::remove_var("__BL_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for v in ["1", "true", "YES", "on"] {
            std::env::set_var("__BL_TEST_BOOL__", v);
            assert!(env_get_bool("__BL_TEST_BOOL__", false), "{}", v);
        }
        for v in ["0", "false", "nope"] {
            std::env::set_var("__BL_TEST_BOOL__", v);
            assert!(!env_get_bool("__BL_TEST_BOOL__", true), "{}", v);
        }
        std::env::remove_var("__BL_TEST_BOOL__");
    }
}
