//! HTTP client for the serverless AI endpoints.
//!
//! Every operation is one JSON POST to a named endpoint. Documents are sent
//! inline as base64. A body with an `error` field is treated as a failure
//! even when the HTTP status is 200.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::appeal::case::{CaseAnalysis, EmailDraft, ReplyAnalysis};
use crate::config::{EndpointStyle, ServicesConfig};
use crate::error::ServiceError;
use crate::services::{
    ArgumentRequest, CaseAnalyzer, DenialFacts, DocumentExtractor, FollowupRequest, PlanFacts,
    StagedDocuments,
};

const EXTRACT_DENIAL: &str = "extract-denial";
const EXTRACT_PLAN: &str = "extract-plan";
const ANALYZE_CASE: &str = "analyze-case";
const GENERATE_EMAIL: &str = "generate-email";
const ANALYZE_REPLY: &str = "analyze-reply";
const GENERATE_FOLLOWUP: &str = "generate-followup";
const HEALTH: &str = "health";

/// Shape shared by the two drafting endpoints: either bare argument text or
/// a full draft whose body is used as the argument.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftResponse {
    #[serde(default)]
    argument: Option<String>,
    #[serde(default)]
    email_draft: Option<EmailDraft>,
}

impl DraftResponse {
    fn into_argument(self, endpoint: &str) -> Result<String, ServiceError> {
        self.argument
            .or(self.email_draft.map(|d| d.body))
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| ServiceError::Decode {
                endpoint: endpoint.to_string(),
                reason: "response contained no draft text".to_string(),
            })
    }
}

pub struct ModalClient {
    http: reqwest::Client,
    base_url: Option<String>,
    style: EndpointStyle,
    api_key: Option<SecretString>,
}

impl ModalClient {
    pub fn new(config: &ServicesConfig) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServiceError::Request {
                endpoint: "client".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: config.api_url.clone(),
            style: config.style,
            api_key: config.api_key.clone(),
        })
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<String, ServiceError> {
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| ServiceError::NotConfigured {
                endpoint: endpoint.to_string(),
            })?;
        Ok(match self.style {
            EndpointStyle::Path => format!("{base}/{endpoint}"),
            EndpointStyle::Modal => format!("{base}-{endpoint}.modal.run"),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<T, ServiceError> {
        let url = self.endpoint_url(endpoint)?;
        let mut request = self.http.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        tracing::debug!(endpoint, "calling AI endpoint");
        let response = request.send().await.map_err(|e| ServiceError::Request {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| ServiceError::Request {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(ServiceError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: text.chars().take(500).collect(),
            });
        }

        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| ServiceError::Decode {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        if let Some(message) = value.get("error").filter(|e| !e.is_null()) {
            return Err(ServiceError::Remote {
                endpoint: endpoint.to_string(),
                message: message
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| message.to_string()),
            });
        }
        serde_json::from_value(value).map_err(|e| ServiceError::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }

    /// Ping the health endpoint.
    pub async fn health(&self) -> Result<(), ServiceError> {
        let _: serde_json::Value = self.call(HEALTH, &serde_json::json!({})).await?;
        Ok(())
    }
}

async fn encode_documents(
    endpoint: &str,
    docs: &StagedDocuments,
) -> Result<Vec<serde_json::Value>, ServiceError> {
    let mut out = Vec::with_capacity(docs.documents().len());
    for doc in docs.documents() {
        let bytes = tokio::fs::read(&doc.path)
            .await
            .map_err(|e| ServiceError::Staging {
                name: doc.name.clone(),
                reason: format!("{endpoint}: {e}"),
            })?;
        out.push(serde_json::json!({
            "name": doc.name,
            "type": doc.content_type,
            "data": STANDARD.encode(&bytes),
        }));
    }
    Ok(out)
}

#[async_trait]
impl DocumentExtractor for ModalClient {
    async fn extract_denial(&self, docs: &StagedDocuments) -> Result<DenialFacts, ServiceError> {
        let files = encode_documents(EXTRACT_DENIAL, docs).await?;
        self.call(EXTRACT_DENIAL, &serde_json::json!({ "files": files }))
            .await
    }

    async fn extract_plan(&self, docs: &StagedDocuments) -> Result<PlanFacts, ServiceError> {
        let files = encode_documents(EXTRACT_PLAN, docs).await?;
        self.call(EXTRACT_PLAN, &serde_json::json!({ "files": files }))
            .await
    }
}

#[async_trait]
impl CaseAnalyzer for ModalClient {
    async fn analyze(
        &self,
        denial_reason: &str,
        policy_context: &str,
    ) -> Result<CaseAnalysis, ServiceError> {
        self.call(
            ANALYZE_CASE,
            &serde_json::json!({
                "denialReason": denial_reason,
                "policyContext": policy_context,
            }),
        )
        .await
    }

    async fn draft_appeal_argument(
        &self,
        request: &ArgumentRequest<'_>,
    ) -> Result<String, ServiceError> {
        let body = serde_json::to_value(request).map_err(|e| ServiceError::Decode {
            endpoint: GENERATE_EMAIL.to_string(),
            reason: e.to_string(),
        })?;
        let response: DraftResponse = self.call(GENERATE_EMAIL, &body).await?;
        response.into_argument(GENERATE_EMAIL)
    }

    async fn analyze_reply(
        &self,
        reply_body: &str,
        thread_history: &str,
    ) -> Result<ReplyAnalysis, ServiceError> {
        self.call(
            ANALYZE_REPLY,
            &serde_json::json!({
                "replyBody": reply_body,
                "threadHistory": thread_history,
            }),
        )
        .await
    }

    async fn draft_followup_argument(
        &self,
        request: &FollowupRequest<'_>,
    ) -> Result<String, ServiceError> {
        let body = serde_json::to_value(request).map_err(|e| ServiceError::Decode {
            endpoint: GENERATE_FOLLOWUP.to_string(),
            reason: e.to_string(),
        })?;
        let response: DraftResponse = self.call(GENERATE_FOLLOWUP, &body).await?;
        response.into_argument(GENERATE_FOLLOWUP)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn client(base: Option<&str>, style: EndpointStyle) -> ModalClient {
        ModalClient::new(&ServicesConfig {
            api_url: base.map(str::to_string),
            style,
            api_key: None,
            timeout: Duration::from_secs(5),
        })
        .expect("client")
    }

    #[test]
    fn endpoint_urls_follow_style() {
        assert_eq!(
            client(Some("https://acct--appeals"), EndpointStyle::Modal)
                .endpoint_url(ANALYZE_CASE)
                .expect("url"),
            "https://acct--appeals-analyze-case.modal.run"
        );
        assert_eq!(
            client(Some("http://127.0.0.1:9000"), EndpointStyle::Path)
                .endpoint_url(EXTRACT_DENIAL)
                .expect("url"),
            "http://127.0.0.1:9000/extract-denial"
        );
    }

    #[tokio::test]
    async fn unconfigured_client_fails_without_network() {
        let err = client(None, EndpointStyle::Path)
            .analyze("not medically necessary", "")
            .await
            .expect_err("not configured");
        assert!(matches!(err, ServiceError::NotConfigured { .. }));
    }

    #[test]
    fn draft_response_accepts_either_shape() {
        let bare: DraftResponse =
            serde_json::from_value(serde_json::json!({ "argument": "Para." })).expect("bare");
        assert_eq!(bare.into_argument("x").expect("arg"), "Para.");
        let full: DraftResponse = serde_json::from_value(
            serde_json::json!({ "emailDraft": { "subject": "S", "body": "Body." } }),
        )
        .expect("full");
        assert_eq!(full.into_argument("x").expect("arg"), "Body.");
        let empty: DraftResponse =
            serde_json::from_value(serde_json::json!({})).expect("empty");
        assert!(empty.into_argument("x").is_err());
    }
}
