//! Helpers for reading `QUILL_*` environment variables.

use crate::error::{QuillError, Result};
use std::str::FromStr;

/// Read and parse an environment variable.
///
/// Returns `Ok(None)` when the variable is unset or empty and
/// [`QuillError::ConfigValue`] when it cannot be parsed.
pub fn env_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| QuillError::ConfigValue {
                field: name.to_string(),
                cause: format!("'{}': {}", raw, e),
            }),
        Err(_) => Ok(None),
    }
}

/// Read a boolean environment variable.
///
/// Accepts `true/false`, `1/0`, `yes/no` and `on/off`, case-insensitively.
pub fn env_flag(name: &str) -> Result<Option<bool>> {
    let Some(raw) = env_var::<String>(name)? else {
        return Ok(None);
    };
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(QuillError::ConfigValue {
            field: name.to_string(),
            cause: format!("'{}' is not a boolean", raw),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_helpers() {
        // SAFETY: Variables are unique to this test
        unsafe { std::env::set_var("QUILL_TEST_ENV_NUMBER", "42") };
        assert_eq!(env_var::<u64>("QUILL_TEST_ENV_NUMBER").unwrap(), Some(42));

        unsafe { std::env::set_var("QUILL_TEST_ENV_NUMBER", "forty") };
        let err = env_var::<u64>("QUILL_TEST_ENV_NUMBER").unwrap_err();
        assert_eq!(err.code(), "E501");

        unsafe { std::env::remove_var("QUILL_TEST_ENV_NUMBER") };
        assert_eq!(env_var::<u64>("QUILL_TEST_ENV_NUMBER").unwrap(), None);

        unsafe { std::env::set_var("QUILL_TEST_ENV_FLAG", "Yes") };
        assert_eq!(env_flag("QUILL_TEST_ENV_FLAG").unwrap(), Some(true));

        unsafe { std::env::set_var("QUILL_TEST_ENV_FLAG", "maybe") };
        assert!(env_flag("QUILL_TEST_ENV_FLAG").is_err());
        unsafe { std::env::remove_var("QUILL_TEST_ENV_FLAG") };
    }
}
