//! Transactional send-only transport. Replies come back through the inbound
//! webhook, so threading relies on RFC 5322 headers we mint ourselves.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use uuid::Uuid;

use crate::channels::email::{EmailTransport, OutboundEmail, SentEmail};
use crate::error::TransportError;

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

pub struct ResendTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    from: String,
    message_domain: String,
}

impl ResendTransport {
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        from: String,
        inbound_domain: Option<String>,
    ) -> Self {
        let message_domain = inbound_domain
            .or_else(|| from.rsplit_once('@').map(|(_, d)| d.trim_end_matches('>').to_string()))
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            from,
            message_domain,
        }
    }

    fn mint_message_id(&self) -> String {
        format!("<{}@{}>", Uuid::new_v4(), self.message_domain)
    }

    fn request_body(&self, email: &OutboundEmail, message_id: &str) -> serde_json::Value {
        let mut headers = serde_json::Map::new();
        headers.insert("Message-ID".to_string(), message_id.into());
        if let Some(parent) = &email.in_reply_to {
            headers.insert("In-Reply-To".to_string(), parent.as_str().into());
            headers.insert("References".to_string(), parent.as_str().into());
        }
        let mut body = serde_json::json!({
            "from": self.from,
            "to": [email.to],
            "subject": email.subject,
            "text": email.body,
            "headers": headers,
        });
        if let Some(reply_to) = &email.reply_to {
            body["reply_to"] = serde_json::Value::String(reply_to.clone());
        }
        body
    }
}

#[async_trait]
impl EmailTransport for ResendTransport {
    fn name(&self) -> &'static str {
        "resend"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SentEmail, TransportError> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| TransportError::NotConfigured("RESEND_API_KEY is not set".to_string()))?;
        let message_id = self.mint_message_id();

        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(key.expose_secret())
            .json(&self.request_body(email, &message_id))
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::AuthExpired);
        }
        if !status.is_success() {
            return Err(TransportError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        let sent: SendResponse = response.json().await?;

        let thread_id = email
            .thread_id
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| message_id.trim_matches(['<', '>']).to_string());
        Ok(SentEmail {
            message_id: sent.id,
            thread_id,
            label_ids: Vec::new(),
            message_id_header: Some(message_id),
        })
    }
}
