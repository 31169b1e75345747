//! Identifier and address conventions shared by the transports and the
//! correlator.

use std::sync::LazyLock;

use regex::Regex;

const CASE_TAG_PREFIX: &str = "case-";

static CASE_ADDRESS_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\bcase-([a-z0-9][a-z0-9_-]*)@").ok());

static BRACKETED_ADDRESS_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"<([^<>@\s]+@[^<>\s]+)>").ok());

/// Normalize a domain for comparisons.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Keep case ids safe for labels, addresses and storage paths.
pub fn sanitize_case_id(case_id: &str) -> String {
    case_id
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// Label/tag used to mark provider messages that belong to a case.
pub fn case_tag(case_id: &str) -> String {
    format!("{CASE_TAG_PREFIX}{}", sanitize_case_id(case_id))
}

/// Case id encoded in a `case-{id}` tag, if the tag is one.
pub fn case_id_from_tag(tag: &str) -> Option<String> {
    let rest = tag.trim().strip_prefix(CASE_TAG_PREFIX)?;
    let id = sanitize_case_id(rest);
    (!id.is_empty() && id == rest).then_some(id)
}

/// `case-{id}@{domain}` reply address for transports without labels.
pub fn reply_address(case_id: &str, inbound_domain: &str) -> String {
    format!("{}@{}", case_tag(case_id), normalize_domain(inbound_domain))
}

/// First case id embedded in a recipient header (`case-{id}@...`).
pub fn case_id_from_address(header: &str) -> Option<String> {
    let re = CASE_ADDRESS_RE.as_ref()?;
    re.captures(header)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Bare lower-cased address from `Name <addr>` or `addr`.
pub fn bare_address(header: &str) -> String {
    let bracketed = BRACKETED_ADDRESS_RE
        .as_ref()
        .and_then(|re| re.captures(header))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str());
    bracketed
        .unwrap_or(header)
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_ascii_lowercase()
}

/// Whether a label or header fragment looks like an e-mail address. Labels
/// named after the owner's address carry the user identity.
pub fn looks_like_address(value: &str) -> bool {
    let value = value.trim();
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !value.contains(char::is_whitespace)
        }
        None => false,
    }
}

/// Storage object path for an uploaded file.
pub fn storage_path(case_id: &str, file_name: &str) -> String {
    let name: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = name.trim_start_matches('.');
    let name = if name.is_empty() { "file" } else { name };
    format!(
        "{}/{}-{}",
        sanitize_case_id(case_id),
        uuid::Uuid::new_v4().simple(),
        name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_address_round_trips_through_extraction() {
        let addr = reply_address("65f0c2a1b3", "Replies.Example.com.");
        assert_eq!(addr, "case-65f0c2a1b3@replies.example.com");
        assert_eq!(
            case_id_from_address(&format!("Appeals <{addr}>")).as_deref(),
            Some("65f0c2a1b3")
        );
    }

    #[test]
    fn case_id_from_address_ignores_other_recipients() {
        assert_eq!(case_id_from_address("someone@example.com"), None);
        assert_eq!(case_id_from_address("showcase-1@example.com"), None);
        assert_eq!(
            case_id_from_address("a@example.com, case-abc-123@in.example.com").as_deref(),
            Some("abc-123")
        );
    }

    #[test]
    fn tags_only_match_clean_ids() {
        assert_eq!(case_id_from_tag("case-c1").as_deref(), Some("c1"));
        assert_eq!(case_id_from_tag("case-"), None);
        assert_eq!(case_id_from_tag("case-a b"), None);
        assert_eq!(case_id_from_tag("INBOX"), None);
    }

    #[test]
    fn bare_address_strips_display_names() {
        assert_eq!(bare_address("Pat Doe <Pat@Example.com>"), "pat@example.com");
        assert_eq!(bare_address(" claims@insurer.example "), "claims@insurer.example");
    }

    #[test]
    fn looks_like_address_rejects_system_labels() {
        assert!(looks_like_address("pat@example.com"));
        assert!(!looks_like_address("INBOX"));
        assert!(!looks_like_address("Label_12"));
        assert!(!looks_like_address("@example.com"));
    }

    #[test]
    fn storage_path_is_scoped_to_case() {
        let path = storage_path("c1", "../Denial Letter.pdf");
        assert!(path.starts_with("c1/"), "{path}");
        assert!(path.ends_with("-_Denial_Letter.pdf"), "{path}");
        assert!(!path.contains(".."), "{path}");
    }
}
