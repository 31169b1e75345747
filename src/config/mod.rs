//! Typed runtime configuration.
//!
//! [`Config::resolve`] layers environment variables over [`Settings`] and
//! validates the result. Secrets only ever come from the environment.

mod appeal;
pub(crate) mod helpers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

pub use self::appeal::{AppealAuditConfig, AppealConfig};
use self::helpers::{
    parse_optional_string_env, parse_secret_env, parse_string_env, parse_u64_env,
};
use crate::error::ConfigError;
use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub database: DatabaseConfig,
    pub services: ServicesConfig,
    pub mail: MailConfig,
    pub storage: StorageConfig,
    pub appeal: AppealConfig,
}

impl Config {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            gateway: GatewayConfig::resolve(settings)?,
            database: DatabaseConfig::resolve(settings)?,
            services: ServicesConfig::resolve(settings)?,
            mail: MailConfig::resolve(settings)?,
            storage: StorageConfig::resolve(settings)?,
            appeal: AppealConfig::resolve(settings)?,
        })
    }
}

// ==================== Gateway ====================

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
}

impl GatewayConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let port = parse_u64_env("GATEWAY_PORT", u64::from(settings.gateway.port))?;
        let port = u16::try_from(port).map_err(|_| ConfigError::InvalidValue {
            key: "GATEWAY_PORT".to_string(),
            message: format!("{port} is not a valid TCP port"),
        })?;
        let max_body = parse_u64_env("GATEWAY_MAX_BODY_BYTES", settings.gateway.max_body_bytes as u64)?;
        Ok(Self {
            host: parse_string_env("GATEWAY_HOST", settings.gateway.host.clone())?,
            port,
            max_body_bytes: usize::try_from(max_body).unwrap_or(usize::MAX),
        })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "GATEWAY_HOST".to_string(),
                message: format!("'{}' is not a valid listen address: {e}", self.host),
            })
    }
}

// ==================== Database ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Memory,
    LibSql,
}

impl DatabaseBackend {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "libsql" | "sqlite" => Ok(Self::LibSql),
            other => Err(ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message: format!("unsupported backend '{other}'"),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::LibSql => "libsql",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub libsql_path: PathBuf,
}

impl DatabaseConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let backend = parse_string_env("DATABASE_BACKEND", settings.database.backend.clone())?;
        Ok(Self {
            backend: DatabaseBackend::from_str(&backend)?,
            libsql_path: PathBuf::from(parse_string_env(
                "LIBSQL_PATH",
                settings.database.libsql_path.clone(),
            )?),
        })
    }
}

// ==================== AI services ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStyle {
    /// `{base}/{endpoint}`
    Path,
    /// `{base}-{endpoint}.modal.run`
    Modal,
}

#[derive(Debug, Clone)]
pub struct ServicesConfig {
    pub api_url: Option<String>,
    pub style: EndpointStyle,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
}

impl ServicesConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let style = match parse_string_env("AI_URL_STYLE", settings.services.url_style.clone())?
            .to_ascii_lowercase()
            .as_str()
        {
            "path" => EndpointStyle::Path,
            "modal" => EndpointStyle::Modal,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "AI_URL_STYLE".to_string(),
                    message: format!("expected 'path' or 'modal', got '{other}'"),
                });
            }
        };
        let api_url = parse_optional_string_env("AI_API_URL", settings.services.api_url.clone())?
            .map(|u| u.trim_end_matches('/').to_string());
        if let Some(url) = &api_url {
            url::Url::parse(url).map_err(|e| ConfigError::InvalidValue {
                key: "AI_API_URL".to_string(),
                message: format!("invalid URL: {e}"),
            })?;
        }
        Ok(Self {
            api_url,
            style,
            api_key: parse_secret_env("AI_API_KEY")?,
            timeout: Duration::from_secs(parse_u64_env(
                "AI_TIMEOUT_SECS",
                settings.services.timeout_secs,
            )?),
        })
    }
}

// ==================== Mail ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailProvider {
    Gmail,
    Resend,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub provider: MailProvider,
    /// Address outbound appeals are sent from.
    pub agent_address: Option<String>,
    /// Domain for `case-{id}@domain` reply addresses.
    pub inbound_domain: Option<String>,
    pub gmail_api_url: String,
    pub gmail_access_token: Option<SecretString>,
    pub resend_api_url: String,
    pub resend_api_key: Option<SecretString>,
}

impl MailConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let mail = &settings.mail;
        let provider = match parse_string_env("MAIL_PROVIDER", mail.provider.clone())?
            .to_ascii_lowercase()
            .as_str()
        {
            "gmail" => MailProvider::Gmail,
            "resend" => MailProvider::Resend,
            "none" | "disabled" => MailProvider::Disabled,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "MAIL_PROVIDER".to_string(),
                    message: format!("unsupported provider '{other}'"),
                });
            }
        };
        let inbound_domain =
            parse_optional_string_env("RESEND_INBOUND_DOMAIN", mail.inbound_domain.clone())?
                .map(|d| crate::appeal::policy::normalize_domain(&d))
                .filter(|d| !d.is_empty());
        Ok(Self {
            provider,
            agent_address: parse_optional_string_env(
                "MAIL_AGENT_ADDRESS",
                mail.agent_address.clone(),
            )?,
            inbound_domain,
            gmail_api_url: parse_string_env("GMAIL_API_URL", mail.gmail_api_url.clone())?,
            gmail_access_token: parse_secret_env("GMAIL_ACCESS_TOKEN")?,
            resend_api_url: parse_string_env("RESEND_API_URL", mail.resend_api_url.clone())?,
            resend_api_key: parse_secret_env("RESEND_API_KEY")?,
        })
    }
}

// ==================== Storage ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    Object,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub local_root: PathBuf,
    pub object_url: Option<String>,
    pub service_key: Option<SecretString>,
    pub denial_bucket: String,
    pub policy_bucket: String,
    pub signed_url_ttl: Duration,
}

impl StorageConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let storage = &settings.storage;
        let backend = match parse_string_env("STORAGE_BACKEND", storage.backend.clone())?
            .to_ascii_lowercase()
            .as_str()
        {
            "local" => StorageBackend::Local,
            "object" | "supabase" => StorageBackend::Object,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "STORAGE_BACKEND".to_string(),
                    message: format!("unsupported backend '{other}'"),
                });
            }
        };
        let object_url = parse_optional_string_env("STORAGE_URL", storage.object_url.clone())?;
        if backend == StorageBackend::Object && object_url.is_none() {
            return Err(ConfigError::Missing {
                key: "STORAGE_URL".to_string(),
            });
        }
        Ok(Self {
            backend,
            local_root: PathBuf::from(parse_string_env(
                "STORAGE_LOCAL_ROOT",
                storage.local_root.clone(),
            )?),
            object_url,
            service_key: parse_secret_env("STORAGE_SERVICE_KEY")?,
            denial_bucket: parse_string_env("DENIAL_BUCKET", storage.denial_bucket.clone())?,
            policy_bucket: parse_string_env("POLICY_BUCKET", storage.policy_bucket.clone())?,
            signed_url_ttl: Duration::from_secs(parse_u64_env(
                "SIGNED_URL_TTL_SECS",
                storage.signed_url_ttl_secs,
            )?),
        })
    }
}
