use std::path::{Component, PathBuf};

use crate::config::helpers::{parse_bool_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Appeal audit controls.
#[derive(Debug, Clone)]
pub struct AppealAuditConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub hash_chain: bool,
}

/// Case-lifecycle behaviour switches.
#[derive(Debug, Clone)]
pub struct AppealConfig {
    /// Kick off denial extraction in the background after every upload.
    pub extract_on_upload: bool,
    /// Ask the analysis service to summarise each inbound insurer reply.
    pub analyze_replies: bool,
    /// Forward processed inbound replies to the case owner.
    pub forward_replies: bool,
    pub audit: AppealAuditConfig,
}

fn invalid_audit_path(message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: "APPEAL_AUDIT_PATH".to_string(),
        message: message.to_string(),
    }
}

fn validate_audit_path(raw: &str) -> Result<PathBuf, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid_audit_path("audit log path must not be empty"));
    }

    let raw_path = PathBuf::from(trimmed);
    if raw_path.is_absolute() {
        return Err(invalid_audit_path(
            "audit log path must be relative to the working directory",
        ));
    }

    let mut normalized = PathBuf::new();
    for component in raw_path.components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(invalid_audit_path(
                    "audit log path must not contain '..' components",
                ));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid_audit_path(
                    "audit log path must be relative to the working directory",
                ));
            }
        }
    }

    if normalized.components().count() < 2 || !normalized.starts_with("logs") {
        return Err(invalid_audit_path(
            "audit log path must be under 'logs/' and include a filename",
        ));
    }

    Ok(normalized)
}

impl AppealConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let appeal = &settings.appeal;
        Ok(Self {
            extract_on_upload: parse_bool_env(
                "APPEAL_EXTRACT_ON_UPLOAD",
                appeal.extract_on_upload,
            )?,
            analyze_replies: parse_bool_env("APPEAL_ANALYZE_REPLIES", appeal.analyze_replies)?,
            forward_replies: parse_bool_env("APPEAL_FORWARD_REPLIES", appeal.forward_replies)?,
            audit: AppealAuditConfig {
                enabled: parse_bool_env("APPEAL_AUDIT_ENABLED", appeal.audit.enabled)?,
                path: {
                    let raw = parse_string_env("APPEAL_AUDIT_PATH", appeal.audit.path.clone())?;
                    validate_audit_path(&raw)?
                },
                hash_chain: parse_bool_env("APPEAL_AUDIT_HASH_CHAIN", appeal.audit.hash_chain)?,
            },
        })
    }

    /// Defaults without consulting the environment; audit disabled.
    pub fn for_tests() -> Self {
        Self {
            extract_on_upload: false,
            analyze_replies: true,
            forward_replies: true,
            audit: AppealAuditConfig {
                enabled: false,
                path: PathBuf::from("logs/appeal_audit.jsonl"),
                hash_chain: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::error::ConfigError;
    use crate::settings::Settings;

    #[test]
    fn resolve_uses_settings_defaults() {
        let config = super::AppealConfig::resolve(&Settings::default()).expect("appeal config");

        assert!(config.extract_on_upload);
        assert!(config.analyze_replies);
        assert!(config.forward_replies);
        assert!(config.audit.enabled);
        assert!(config.audit.hash_chain);
        assert_eq!(config.audit.path, PathBuf::from("logs/appeal_audit.jsonl"));
    }

    #[test]
    fn validate_audit_path_normalizes_cur_dir_segments() {
        let path = super::validate_audit_path("./logs//cases/./audit.jsonl/")
            .expect("path should be accepted");
        assert_eq!(path, PathBuf::from("logs/cases/audit.jsonl"));
    }

    #[test]
    fn validate_audit_path_rejects_parent_dir_traversal() {
        let err = super::validate_audit_path("logs/../audit.jsonl").expect_err("must reject '..'");
        let ConfigError::InvalidValue { key, message } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "APPEAL_AUDIT_PATH");
        assert!(message.contains(".."), "unexpected message: {message}");
    }

    #[test]
    fn validate_audit_path_rejects_absolute_paths() {
        let absolute = if cfg!(windows) {
            r"C:\tmp\audit.jsonl"
        } else {
            "/tmp/audit.jsonl"
        };
        let err = super::validate_audit_path(absolute).expect_err("absolute must be rejected");
        let ConfigError::InvalidValue { message, .. } = err else {
            panic!("expected InvalidValue");
        };
        assert!(message.contains("relative"), "unexpected message: {message}");
    }

    #[test]
    fn validate_audit_path_requires_logs_dir_and_filename() {
        for raw in ["tmp/appeal_audit.jsonl", "logs"] {
            let err = super::validate_audit_path(raw).expect_err("must stay under logs/");
            let ConfigError::InvalidValue { message, .. } = err else {
                panic!("expected InvalidValue");
            };
            assert!(message.contains("under 'logs/'"), "unexpected: {message}");
        }
    }
}
