use std::env::VarError;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Read an environment variable, treating blank values as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid UTF-8".to_string(),
        }),
    }
}

pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(key)? {
        None => Ok(default),
        Some(raw) => parse_bool(key, &raw),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

pub(crate) fn parse_string_env(
    key: &str,
    default: impl Into<String>,
) -> Result<String, ConfigError> {
    Ok(optional_env(key)?
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| default.into()))
}

pub(crate) fn parse_optional_string_env(
    key: &str,
    default: Option<String>,
) -> Result<Option<String>, ConfigError> {
    Ok(optional_env(key)?
        .map(|v| v.trim().to_string())
        .or(default)
        .filter(|v| !v.trim().is_empty()))
}

pub(crate) fn parse_u64_env(key: &str, default: u64) -> Result<u64, ConfigError> {
    match optional_env(key)? {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected an unsigned integer: {e}"),
            }),
    }
}

pub(crate) fn parse_secret_env(key: &str) -> Result<Option<SecretString>, ConfigError> {
    Ok(optional_env(key)?.map(|v| SecretString::from(v.trim().to_string())))
}

#[cfg(test)]
mod tests {
    use super::parse_bool;
    use crate::error::ConfigError;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("K", "Yes").expect("yes"));
        assert!(parse_bool("K", " 1 ").expect("1"));
        assert!(!parse_bool("K", "off").expect("off"));
    }

    #[test]
    fn parse_bool_rejects_garbage_with_key() {
        let err = parse_bool("APPEAL_FORWARD_REPLIES", "maybe").expect_err("garbage");
        let ConfigError::InvalidValue { key, message } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "APPEAL_FORWARD_REPLIES");
        assert!(message.contains("maybe"), "unexpected message: {message}");
    }
}
