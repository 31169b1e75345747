//! File-backed settings with defaults.
//!
//! Settings are the lowest-precedence configuration source. They come from
//! `POLICYPILOT_CONFIG` (or `./policypilot.toml` when present) and are
//! overridden per key by environment variables in [`crate::config`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_SETTINGS_FILE: &str = "policypilot.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub gateway: GatewaySettings,
    pub database: DatabaseSettings,
    pub services: ServiceSettings,
    pub mail: MailSettings,
    pub storage: StorageSettings,
    pub appeal: AppealSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            max_body_bytes: 25 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub backend: String,
    pub libsql_path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: "libsql".to_string(),
            libsql_path: "data/policypilot.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Base URL of the AI endpoints. With `url_style = "path"` an endpoint
    /// lives at `{base}/{name}`; with `"modal"` at `{base}-{name}.modal.run`.
    pub api_url: Option<String>,
    pub url_style: String,
    pub timeout_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            api_url: None,
            url_style: "path".to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailSettings {
    pub provider: String,
    pub agent_address: Option<String>,
    pub inbound_domain: Option<String>,
    pub gmail_api_url: String,
    pub resend_api_url: String,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            provider: "gmail".to_string(),
            agent_address: None,
            inbound_domain: None,
            gmail_api_url: "https://gmail.googleapis.com/gmail/v1/users/me".to_string(),
            resend_api_url: "https://api.resend.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: String,
    pub local_root: String,
    pub object_url: Option<String>,
    pub denial_bucket: String,
    pub policy_bucket: String,
    pub signed_url_ttl_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            local_root: "data/files".to_string(),
            object_url: None,
            denial_bucket: "denial-files".to_string(),
            policy_bucket: "policy-files".to_string(),
            signed_url_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppealSettings {
    pub extract_on_upload: bool,
    pub analyze_replies: bool,
    pub forward_replies: bool,
    pub audit: AuditSettings,
}

impl Default for AppealSettings {
    fn default() -> Self {
        Self {
            extract_on_upload: true,
            analyze_replies: true,
            forward_replies: true,
            audit: AuditSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub enabled: bool,
    pub path: String,
    pub hash_chain: bool,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "logs/appeal_audit.jsonl".to_string(),
            hash_chain: true,
        }
    }
}

impl Settings {
    /// Load settings from `POLICYPILOT_CONFIG`, then `./policypilot.toml`,
    /// falling back to defaults when neither exists.
    pub fn load() -> Result<Self, ConfigError> {
        if let Some(path) = std::env::var_os("POLICYPILOT_CONFIG") {
            return Self::from_file(Path::new(&path));
        }
        let default_path = PathBuf::from(DEFAULT_SETTINGS_FILE);
        if default_path.is_file() {
            return Self::from_file(&default_path);
        }
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Settings {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&raw).map_err(|e| ConfigError::Settings {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}
