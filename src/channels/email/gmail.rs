//! Gmail API v1 transport: send, label, poll and read threads.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::channels::email::inbound::strip_html;
use crate::channels::email::{EmailTransport, InboundEmail, OutboundEmail, SentEmail};
use crate::error::TransportError;

const UNREAD_QUERY: &str = "label:INBOX is:unread";

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    id: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    label_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
    id: String,
    #[serde(default)]
    thread_id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<FullPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FullPayload {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PayloadBody>,
    #[serde(default)]
    parts: Vec<FullPayload>,
}

#[derive(Debug, Deserialize)]
struct PayloadBody {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    #[serde(default)]
    messages: Vec<MessageDetail>,
}

#[derive(Debug, Deserialize)]
struct LabelListResponse {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Clone, Deserialize)]
struct Label {
    id: String,
    name: String,
}

// ============================================================================
// Message helpers
// ============================================================================

fn header<'a>(payload: &'a FullPayload, name: &str) -> Option<&'a str> {
    payload
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn decode_url_safe_base64(data: &str) -> Option<String> {
    let trimmed = data.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// First body part of `mime_type`, depth first.
fn extract_body_text(payload: &FullPayload, mime_type: &str) -> Option<String> {
    if payload.mime_type.eq_ignore_ascii_case(mime_type)
        && let Some(text) = payload
            .body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .and_then(decode_url_safe_base64)
    {
        return Some(text);
    }
    payload
        .parts
        .iter()
        .find_map(|part| extract_body_text(part, mime_type))
}

fn message_body(payload: &FullPayload) -> String {
    extract_body_text(payload, "text/plain")
        .or_else(|| extract_body_text(payload, "text/html").map(|html| strip_html(&html)))
        .unwrap_or_default()
}

fn parse_internal_date(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

/// RFC 2047 encoded-word for non-ASCII subjects.
fn encode_subject(subject: &str) -> String {
    if subject.is_ascii() {
        subject.to_string()
    } else {
        format!("=?utf-8?B?{}?=", STANDARD.encode(subject.as_bytes()))
    }
}

fn strip_header_breaks(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// Raw RFC 5322 message, base64url encoded for `messages.send`.
fn build_raw_message(email: &OutboundEmail) -> String {
    let mut lines = vec![
        format!("To: {}", strip_header_breaks(&email.to)),
        "Content-Type: text/plain; charset=utf-8".to_string(),
        "MIME-Version: 1.0".to_string(),
        format!("Subject: {}", encode_subject(&strip_header_breaks(&email.subject))),
    ];
    if let Some(reply_to) = &email.reply_to {
        lines.push(format!("Reply-To: {}", strip_header_breaks(reply_to)));
    }
    if let Some(parent) = &email.in_reply_to {
        let parent = strip_header_breaks(parent);
        lines.push(format!("In-Reply-To: {parent}"));
        lines.push(format!("References: {parent}"));
    }
    lines.push(String::new());
    lines.push(email.body.clone());
    URL_SAFE_NO_PAD.encode(lines.join("\r\n").as_bytes())
}

// ============================================================================
// Transport
// ============================================================================

pub struct GmailTransport {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<SecretString>,
    labels: Mutex<HashMap<String, String>>,
}

impl GmailTransport {
    pub fn new(base_url: &str, access_token: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
            labels: Mutex::new(HashMap::new()),
        }
    }

    fn token(&self) -> Result<&str, TransportError> {
        self.access_token
            .as_ref()
            .map(|t| t.expose_secret())
            .ok_or_else(|| TransportError::NotConfigured("GMAIL_ACCESS_TOKEN is not set".to_string()))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::AuthExpired);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, TransportError> {
        let response = self
            .client
            .get(format!("{}/{path}", self.base_url))
            .bearer_auth(self.token()?)
            .query(query)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, TransportError> {
        let response = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .bearer_auth(self.token()?)
            .json(body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn refresh_labels(&self) -> Result<(), TransportError> {
        let list: LabelListResponse = self.get_json("labels", &[]).await?;
        let mut labels = self.labels.lock().await;
        labels.clear();
        labels.extend(list.labels.into_iter().map(|l| (l.id, l.name)));
        Ok(())
    }

    async fn label_names(&self, ids: &[String]) -> Result<Vec<String>, TransportError> {
        let missing = {
            let labels = self.labels.lock().await;
            ids.iter().any(|id| !labels.contains_key(id))
        };
        if missing {
            self.refresh_labels().await?;
        }
        let labels = self.labels.lock().await;
        Ok(ids
            .iter()
            .map(|id| labels.get(id).cloned().unwrap_or_else(|| id.clone()))
            .collect())
    }

    async fn label_id_by_name(&self, name: &str) -> Option<String> {
        self.labels
            .lock()
            .await
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| id.clone())
    }

    /// Label id for `name`, creating the label when it does not exist yet.
    async fn ensure_label(&self, name: &str) -> Result<String, TransportError> {
        if let Some(id) = self.label_id_by_name(name).await {
            return Ok(id);
        }
        self.refresh_labels().await?;
        if let Some(id) = self.label_id_by_name(name).await {
            return Ok(id);
        }
        let created: Result<Label, TransportError> = self
            .post_json(
                "labels",
                &serde_json::json!({
                    "name": name,
                    "labelListVisibility": "labelShow",
                    "messageListVisibility": "show",
                }),
            )
            .await;
        match created {
            Ok(label) => {
                self.labels
                    .lock()
                    .await
                    .insert(label.id.clone(), label.name);
                Ok(label.id)
            }
            // Created concurrently by someone else.
            Err(TransportError::Api { status: 409, .. }) => {
                self.refresh_labels().await?;
                self.label_id_by_name(name).await.ok_or_else(|| TransportError::Api {
                    status: 409,
                    message: format!("label '{name}' conflicts but cannot be found"),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_tags(&self, message_id: &str, tags: &[String]) -> Result<Vec<String>, TransportError> {
        let mut ids = Vec::with_capacity(tags.len());
        for tag in tags {
            ids.push(self.ensure_label(tag).await?);
        }
        if !ids.is_empty() {
            let _: serde_json::Value = self
                .post_json(
                    &format!("messages/{message_id}/modify"),
                    &serde_json::json!({ "addLabelIds": ids }),
                )
                .await?;
        }
        Ok(ids)
    }

    async fn to_inbound(&self, detail: MessageDetail) -> Result<InboundEmail, TransportError> {
        let labels = self.label_names(&detail.label_ids).await?;
        let payload = detail.payload.as_ref();
        let text = |name: &str| {
            payload
                .and_then(|p| header(p, name))
                .unwrap_or_default()
                .to_string()
        };
        Ok(InboundEmail {
            message_id: detail.id.clone(),
            thread_id: detail.thread_id.clone(),
            message_id_header: payload
                .and_then(|p| header(p, "Message-ID"))
                .map(str::to_string),
            from: text("From"),
            to: text("To"),
            subject: text("Subject"),
            body: payload.map(message_body).unwrap_or_default(),
            date: parse_internal_date(detail.internal_date.as_deref()),
            labels,
        })
    }
}

#[async_trait]
impl EmailTransport for GmailTransport {
    fn name(&self) -> &'static str {
        "gmail"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SentEmail, TransportError> {
        let mut request = serde_json::json!({ "raw": build_raw_message(email) });
        if let Some(thread_id) = email.thread_id.as_deref().filter(|t| !t.is_empty()) {
            request["threadId"] = serde_json::Value::String(thread_id.to_string());
        }
        let sent: SendResponse = self.post_json("messages/send", &request).await?;

        // The message is out; label failures must not turn into a send error.
        let mut label_ids = sent.label_ids;
        match self.apply_tags(&sent.id, &email.tags).await {
            Ok(ids) => label_ids.extend(ids),
            Err(e) => tracing::warn!(message_id = %sent.id, "Failed to label sent message: {}", e),
        }

        Ok(SentEmail {
            message_id: sent.id,
            thread_id: sent.thread_id,
            label_ids,
            message_id_header: None,
        })
    }

    async fn list_unread(&self) -> Result<Vec<String>, TransportError> {
        let list: MessageListResponse = self
            .get_json("messages", &[("q", UNREAD_QUERY), ("maxResults", "50")])
            .await?;
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn get(&self, message_id: &str) -> Result<InboundEmail, TransportError> {
        let detail: MessageDetail = self
            .get_json(&format!("messages/{message_id}"), &[("format", "full")])
            .await?;
        self.to_inbound(detail).await
    }

    async fn thread_messages(&self, thread_id: &str) -> Result<Vec<InboundEmail>, TransportError> {
        let thread: ThreadResponse = self
            .get_json(&format!("threads/{thread_id}"), &[("format", "full")])
            .await?;
        let mut out = Vec::with_capacity(thread.messages.len());
        for detail in thread.messages {
            out.push(self.to_inbound(detail).await?);
        }
        Ok(out)
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), TransportError> {
        let _: serde_json::Value = self
            .post_json(
                &format!("messages/{message_id}/modify"),
                &serde_json::json!({ "removeLabelIds": ["UNREAD"] }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(mime: &str, text: &str) -> FullPayload {
        FullPayload {
            mime_type: mime.to_string(),
            headers: Vec::new(),
            body: Some(PayloadBody {
                data: Some(URL_SAFE_NO_PAD.encode(text.as_bytes())),
            }),
            parts: Vec::new(),
        }
    }

    #[test]
    fn body_prefers_plain_text_in_nested_parts() {
        let payload = FullPayload {
            mime_type: "multipart/alternative".to_string(),
            headers: vec![Header {
                name: "subject".to_string(),
                value: "Re: Appeal".to_string(),
            }],
            body: None,
            parts: vec![part("text/html", "<p>html</p>"), part("text/plain", "plain")],
        };
        assert_eq!(message_body(&payload), "plain");
        assert_eq!(header(&payload, "Subject"), Some("Re: Appeal"));
    }

    #[test]
    fn body_falls_back_to_stripped_html() {
        let payload = part("text/html", "<p>Denial <b>upheld</b></p>");
        assert_eq!(message_body(&payload).trim(), "Denial upheld");
    }

    #[test]
    fn raw_message_carries_threading_headers() {
        let raw = build_raw_message(&OutboundEmail {
            to: "claims@insurer.example".to_string(),
            subject: "Appeal – Policy #1".to_string(),
            body: "Body".to_string(),
            in_reply_to: Some("<abc@insurer.example>".to_string()),
            ..OutboundEmail::default()
        });
        let decoded = String::from_utf8(URL_SAFE_NO_PAD.decode(raw).expect("b64")).expect("utf8");
        assert!(decoded.contains("In-Reply-To: <abc@insurer.example>\r\n"));
        assert!(decoded.contains("Subject: =?utf-8?B?"));
        assert!(decoded.ends_with("\r\n\r\nBody"));
    }

    #[test]
    fn header_injection_is_neutralised() {
        let raw = build_raw_message(&OutboundEmail {
            to: "a@example.com\r\nBcc: evil@example.com".to_string(),
            subject: "s".to_string(),
            body: "b".to_string(),
            ..OutboundEmail::default()
        });
        let decoded = String::from_utf8(URL_SAFE_NO_PAD.decode(raw).expect("b64")).expect("utf8");
        assert!(!decoded.contains("\r\nBcc:"));
    }

    #[tokio::test]
    async fn missing_token_is_reported_before_any_request() {
        let transport = GmailTransport::new("http://127.0.0.1:9", None);
        let err = transport.list_unread().await.expect_err("no token");
        assert!(matches!(err, TransportError::NotConfigured(_)));
    }
}
