//! Parsing of inbound-mail webhook payloads.
//!
//! Providers disagree on the shape of addresses and headers, so every field
//! is read leniently: addresses may be a string, a list or `{email}`
//! objects, and headers may be a map or a list of `{name, value}` pairs.

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::channels::email::InboundEmail;

static BREAK_TAG: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*(br\s*/?|/p|/div|/li|/tr)\s*>").ok());
static ANY_TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"<[^>]*>").ok());
static BLANK_RUNS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\n{3,}").ok());

fn replace_all(re: &Option<Regex>, text: &str, with: &str) -> String {
    match re {
        Some(re) => re.replace_all(text, with).into_owned(),
        None => text.to_string(),
    }
}

/// Plain-text rendering of an HTML body.
pub fn strip_html(html: &str) -> String {
    let with_breaks = replace_all(&BREAK_TAG, html, "\n");
    let text = replace_all(&ANY_TAG, &with_breaks, "");
    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    replace_all(&BLANK_RUNS, decoded.trim(), "\n\n")
}

fn address_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(map) => {
            let email = map.get("email").or_else(|| map.get("address"))?.as_str()?;
            match map.get("name").and_then(Value::as_str).filter(|n| !n.is_empty()) {
                Some(name) => Some(format!("{name} <{email}>")),
                None => Some(email.to_string()),
            }
        }
        _ => None,
    }
}

/// Comma-joined address list.
fn addresses(value: Option<&Value>) -> String {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(address_of)
            .collect::<Vec<_>>()
            .join(", "),
        Some(other) => address_of(other).unwrap_or_default(),
        None => String::new(),
    }
}

fn header_value(headers: Option<&Value>, name: &str) -> Option<String> {
    match headers? {
        Value::Object(map) => map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_str())
            .map(str::to_string),
        Value::Array(items) => items.iter().find_map(|item| {
            let key = item.get("name").and_then(Value::as_str)?;
            if key.eq_ignore_ascii_case(name) {
                item.get("value").and_then(Value::as_str).map(str::to_string)
            } else {
                None
            }
        }),
        _ => None,
    }
}

fn strip_angles(id: &str) -> String {
    id.trim().trim_start_matches('<').trim_end_matches('>').to_string()
}

fn text_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

/// Parse a webhook body into an [`InboundEmail`]. Returns `None` when the
/// payload has no sender.
pub fn parse_webhook(payload: &Value) -> Option<InboundEmail> {
    // `{ "type": "email.received", "data": { ... } }` envelopes.
    let data = match payload.get("data") {
        Some(inner) if inner.is_object() => inner,
        _ => payload,
    };
    let from = addresses(data.get("from"));
    if from.is_empty() {
        return None;
    }
    let headers = data.get("headers");

    let message_id_header = header_value(headers, "Message-ID")
        .or_else(|| text_field(data, "message_id"))
        .filter(|id| !id.trim().is_empty());
    let message_id = message_id_header
        .as_deref()
        .map(strip_angles)
        .unwrap_or_else(|| format!("inbound-{}", Uuid::new_v4()));

    let thread_id = header_value(headers, "References")
        .and_then(|refs| refs.split_whitespace().next().map(strip_angles))
        .or_else(|| header_value(headers, "In-Reply-To").map(|v| strip_angles(&v)))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| message_id.clone());

    let body = text_field(data, "text")
        .or_else(|| text_field(data, "html").map(|html| strip_html(&html)))
        .unwrap_or_default();

    let date = text_field(data, "created_at")
        .or_else(|| header_value(headers, "Date"))
        .and_then(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .or_else(|_| DateTime::parse_from_rfc2822(&raw))
                .ok()
        })
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(InboundEmail {
        message_id,
        thread_id,
        message_id_header,
        from,
        to: addresses(data.get("to")),
        subject: text_field(data, "subject").unwrap_or_default(),
        body,
        date,
        labels: Vec::new(),
    })
}

/// Decode the `{ "message": { "data": base64 } }` push envelope used by the
/// mailbox watch notification.
pub fn decode_push_notification(payload: &Value) -> Option<Value> {
    let data = payload.get("message")?.get("data")?.as_str()?;
    let bytes = STANDARD.decode(data).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_enveloped_payload_with_header_list() {
        let payload = json!({
            "type": "email.received",
            "data": {
                "from": { "email": "claims@insurer.example", "name": "Claims" },
                "to": ["case-abc123@in.example.com"],
                "subject": "RE: Appeal",
                "text": "We have reviewed your appeal.",
                "headers": [
                    { "name": "Message-ID", "value": "<r1@insurer.example>" },
                    { "name": "References", "value": "<m0@in.example.com> <m1@in.example.com>" }
                ]
            }
        });
        let email = parse_webhook(&payload).expect("parsed");
        assert_eq!(email.from, "Claims <claims@insurer.example>");
        assert_eq!(email.to, "case-abc123@in.example.com");
        assert_eq!(email.message_id, "r1@insurer.example");
        assert_eq!(email.message_id_header.as_deref(), Some("<r1@insurer.example>"));
        assert_eq!(email.thread_id, "m0@in.example.com");
    }

    #[test]
    fn flat_payload_falls_back_to_html_and_generated_id() {
        let payload = json!({
            "from": "claims@insurer.example",
            "to": "case-x@in.example.com",
            "subject": "Decision",
            "html": "<p>Denial&nbsp;<b>upheld</b></p><p>Thanks</p>",
            "headers": { "in-reply-to": "<m9@in.example.com>" }
        });
        let email = parse_webhook(&payload).expect("parsed");
        assert_eq!(email.body, "Denial upheld\nThanks");
        assert!(email.message_id.starts_with("inbound-"));
        assert_eq!(email.thread_id, "m9@in.example.com");
    }

    #[test]
    fn payload_without_sender_is_rejected() {
        assert!(parse_webhook(&json!({ "subject": "no from" })).is_none());
    }

    #[test]
    fn push_notification_is_decoded() {
        let inner = json!({ "emailAddress": "agent@example.com", "historyId": 42 });
        let payload = json!({ "message": { "data": STANDARD.encode(inner.to_string()) } });
        assert_eq!(decode_push_notification(&payload), Some(inner));
    }
}
