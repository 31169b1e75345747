//! Email transport adapters.
//!
//! [`EmailTransport`] is the only thing the lifecycle controller and the
//! correlator know about mail. Gmail supports the full contract (send,
//! labels, polling, thread history); the transactional adapter only sends,
//! and its replies arrive through the inbound webhook instead.

pub mod gmail;
pub mod inbound;
pub mod resend;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{MailConfig, MailProvider};
use crate::error::{ConfigError, TransportError};

/// A message to send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Provider thread to continue, if any.
    pub thread_id: Option<String>,
    /// RFC 5322 id of the message being answered.
    pub in_reply_to: Option<String>,
    pub reply_to: Option<String>,
    /// Provider labels to attach after sending (ignored by transports
    /// without labels).
    pub tags: Vec<String>,
}

/// Provider identifiers of a sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentEmail {
    pub message_id: String,
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub message_id_header: Option<String>,
}

/// A received message as seen by the correlator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEmail {
    pub message_id: String,
    pub thread_id: String,
    #[serde(default)]
    pub message_id_header: Option<String>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub date: DateTime<Utc>,
    /// Label names (not provider label ids).
    #[serde(default)]
    pub labels: Vec<String>,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, email: &OutboundEmail) -> Result<SentEmail, TransportError>;

    /// Provider ids of unread inbox messages.
    async fn list_unread(&self) -> Result<Vec<String>, TransportError> {
        Err(TransportError::Unsupported("list_unread"))
    }

    async fn get(&self, _message_id: &str) -> Result<InboundEmail, TransportError> {
        Err(TransportError::Unsupported("get"))
    }

    /// Every message in a provider thread, oldest first.
    async fn thread_messages(&self, _thread_id: &str) -> Result<Vec<InboundEmail>, TransportError> {
        Err(TransportError::Unsupported("thread_messages"))
    }

    async fn mark_read(&self, _message_id: &str) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Transport used when mail is switched off; every send fails.
pub struct DisabledTransport;

#[async_trait]
impl EmailTransport for DisabledTransport {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn send(&self, _email: &OutboundEmail) -> Result<SentEmail, TransportError> {
        Err(TransportError::NotConfigured(
            "MAIL_PROVIDER is disabled".to_string(),
        ))
    }
}

/// Build the configured transport. Missing credentials are reported at
/// first use rather than at startup so the API stays usable for drafting.
pub fn build_transport(config: &MailConfig) -> Result<Arc<dyn EmailTransport>, ConfigError> {
    Ok(match config.provider {
        MailProvider::Gmail => Arc::new(gmail::GmailTransport::new(
            &config.gmail_api_url,
            config.gmail_access_token.clone(),
        )),
        MailProvider::Resend => {
            let from = config.agent_address.clone().ok_or_else(|| ConfigError::Missing {
                key: "MAIL_AGENT_ADDRESS".to_string(),
            })?;
            Arc::new(resend::ResendTransport::new(
                &config.resend_api_url,
                config.resend_api_key.clone(),
                from,
                config.inbound_domain.clone(),
            ))
        }
        MailProvider::Disabled => Arc::new(DisabledTransport),
    })
}
