//! Case aggregate, insurance plan and user records, and the lifecycle rules
//! that tie `status` and `current_step` together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::DenialFacts;

/// Business state of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaseStatus {
    Uploading,
    Analyzing,
    ReadyToSend,
    Sent,
    AwaitingReply,
    ReplyReceived,
}

impl CaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Analyzing => "analyzing",
            Self::ReadyToSend => "ready-to-send",
            Self::Sent => "sent",
            Self::AwaitingReply => "awaiting-reply",
            Self::ReplyReceived => "reply-received",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "uploading" => Some(Self::Uploading),
            "analyzing" => Some(Self::Analyzing),
            "ready-to-send" => Some(Self::ReadyToSend),
            "sent" => Some(Self::Sent),
            "awaiting-reply" => Some(Self::AwaitingReply),
            "reply-received" => Some(Self::ReplyReceived),
            _ => None,
        }
    }

    /// Statuses from which an outbound appeal or follow-up may be sent.
    pub const SENDABLE: &'static [CaseStatus] = &[
        Self::ReadyToSend,
        Self::Sent,
        Self::AwaitingReply,
        Self::ReplyReceived,
    ];

    /// Statuses in which an inbound reply also moves the case forward.
    pub const REPLYABLE: &'static [CaseStatus] =
        &[Self::Sent, Self::AwaitingReply, Self::ReplyReceived];

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// `Sent` is only ever read back from older records; sending moves a
    /// case straight to `AwaitingReply`.
    pub fn can_transition_to(self, next: CaseStatus) -> bool {
        use CaseStatus::*;
        match next {
            // New denial files restart analysis from any point.
            Analyzing => true,
            ReadyToSend => matches!(self, Analyzing | ReadyToSend),
            Sent | AwaitingReply => Self::SENDABLE.contains(&self),
            ReplyReceived => Self::REPLYABLE.contains(&self),
            Uploading => self == Uploading,
        }
    }

    /// Workflow steps a case in this status may sit on.
    pub fn permitted_steps(self) -> &'static [CaseStep] {
        use CaseStep::*;
        match self {
            Self::Uploading => &[DenialUpload],
            Self::Analyzing => &[DenialUpload, DenialExtractedInfo],
            Self::ReadyToSend => &[DenialExtractedInfo, Strategy, EmailReview],
            Self::Sent | Self::AwaitingReply => &[EmailSent],
            Self::ReplyReceived => &[CaseStep::ReplyReceived, FollowupReview],
        }
    }

    pub fn permits_step(self, step: CaseStep) -> bool {
        self.permitted_steps().contains(&step)
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UI workflow position of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaseStep {
    DenialUpload,
    DenialExtractedInfo,
    Strategy,
    EmailReview,
    EmailSent,
    ReplyReceived,
    FollowupReview,
}

impl CaseStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DenialUpload => "denial-upload",
            Self::DenialExtractedInfo => "denial-extracted-info",
            Self::Strategy => "strategy",
            Self::EmailReview => "email-review",
            Self::EmailSent => "email-sent",
            Self::ReplyReceived => "reply-received",
            Self::FollowupReview => "followup-review",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "denial-upload" => Some(Self::DenialUpload),
            "denial-extracted-info" => Some(Self::DenialExtractedInfo),
            "strategy" => Some(Self::Strategy),
            "email-review" => Some(Self::EmailReview),
            "email-sent" => Some(Self::EmailSent),
            "reply-received" => Some(Self::ReplyReceived),
            "followup-review" => Some(Self::FollowupReview),
            _ => None,
        }
    }
}

impl std::fmt::Display for CaseStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded document: either a pointer into object storage or inline
/// bytes carried on the record itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type", default)]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "inline_bytes"
    )]
    pub data: Option<Vec<u8>>,
}

impl FileRef {
    /// Object-storage location, when the file lives outside the record.
    pub fn storage_location(&self) -> Option<(&str, &str)> {
        match (self.bucket.as_deref(), self.path.as_deref()) {
            (Some(bucket), Some(path)) if !path.is_empty() => Some((bucket, path)),
            _ => None,
        }
    }
}

mod inline_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|encoded| STANDARD.decode(encoded.as_bytes()))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

/// Facts the user confirmed from the denial letter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedData {
    pub insurer: String,
    pub policy_number: String,
    pub denial_reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermDefinition {
    pub term: String,
    pub definition: String,
}

/// Appeal strategy produced by the analysis service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseAnalysis {
    pub analysis: String,
    #[serde(default)]
    pub terms: Vec<TermDefinition>,
    #[serde(default)]
    pub context_used: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailDraft {
    pub subject: String,
    pub body: String,
}

/// Analysis of an insurer reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyAnalysis {
    pub summary: String,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub terms: Vec<TermDefinition>,
    #[serde(default)]
    pub action_items: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Sent,
    Received,
}

/// One entry of a case's append-only correspondence log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub direction: MessageDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<ReplyAnalysis>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub covered_person_id: Option<String>,
    pub date_created: DateTime<Utc>,
    pub status: CaseStatus,
    pub current_step: CaseStep,
    #[serde(default)]
    pub has_new_email: bool,
    #[serde(default)]
    pub denial_files: Vec<FileRef>,
    /// Bumped on every change to `denial_files`; cached AI writes are
    /// conditioned on it.
    #[serde(default)]
    pub files_version: u64,
    #[serde(default)]
    pub parsed_data: Option<ParsedData>,
    #[serde(default)]
    pub denial_reason_title: Option<String>,
    /// Full extraction result for the current files version.
    #[serde(default)]
    pub denial_facts: Option<DenialFacts>,
    #[serde(default)]
    pub analysis: Option<CaseAnalysis>,
    #[serde(default)]
    pub email_draft: Option<EmailDraft>,
    #[serde(default)]
    pub email_thread: Vec<EmailMessage>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolved_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl Case {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            plan_id: None,
            covered_person_id: None,
            date_created: Utc::now(),
            status: CaseStatus::Uploading,
            current_step: CaseStep::DenialUpload,
            has_new_email: false,
            denial_files: Vec::new(),
            files_version: 0,
            parsed_data: None,
            denial_reason_title: None,
            denial_facts: None,
            analysis: None,
            email_draft: None,
            email_thread: Vec::new(),
            resolved: false,
            resolved_date: None,
            feedback: None,
        }
    }

    /// Whether the prerequisite data for `step` exists on the record.
    pub fn has_prerequisites_for(&self, step: CaseStep) -> bool {
        match step {
            CaseStep::DenialUpload | CaseStep::EmailSent => true,
            CaseStep::DenialExtractedInfo => !self.denial_files.is_empty(),
            CaseStep::Strategy | CaseStep::EmailReview => self.parsed_data.is_some(),
            CaseStep::ReplyReceived | CaseStep::FollowupReview => self.last_received().is_some(),
        }
    }

    pub fn last_received(&self) -> Option<&EmailMessage> {
        self.email_thread
            .iter()
            .rev()
            .find(|m| m.direction == MessageDirection::Received)
    }

    /// Most recent provider thread id seen anywhere in the correspondence.
    pub fn latest_thread_id(&self) -> Option<&str> {
        self.email_thread
            .iter()
            .rev()
            .find_map(|m| m.thread_id.as_deref().filter(|t| !t.is_empty()))
    }

    /// Denial reason best suited as analysis input: the user-confirmed
    /// reason first, the extracted title second.
    pub fn denial_reason(&self) -> Option<&str> {
        self.parsed_data
            .as_ref()
            .map(|p| p.denial_reason.as_str())
            .filter(|r| !r.trim().is_empty())
            .or(self.denial_reason_title.as_deref())
            .filter(|r| !r.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relationship {
    #[serde(rename = "Self")]
    SelfInsured,
    Spouse,
    Child,
    Dependent,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoveredPerson {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    pub relationship: Relationship,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    Comprehensive,
    Supplementary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsurancePlan {
    pub id: String,
    pub user_id: String,
    pub insurance_company: String,
    pub plan_name: String,
    pub policy_number: String,
    #[serde(default)]
    pub group_number: Option<String>,
    pub policy_type: PolicyType,
    #[serde(default)]
    pub policy_files: Vec<FileRef>,
    #[serde(default)]
    pub covered_individuals: Vec<CoveredPerson>,
    pub date_added: DateTime<Utc>,
}

impl InsurancePlan {
    pub fn covered_person(&self, id: &str) -> Option<&CoveredPerson> {
        self.covered_individuals.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl UserRecord {
    pub fn display_name(&self) -> Option<String> {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        (!name.is_empty()).then_some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_status_permits_at_least_one_step() {
        for status in [
            CaseStatus::Uploading,
            CaseStatus::Analyzing,
            CaseStatus::ReadyToSend,
            CaseStatus::Sent,
            CaseStatus::AwaitingReply,
            CaseStatus::ReplyReceived,
        ] {
            assert!(!status.permitted_steps().is_empty(), "{status}");
            assert_eq!(CaseStatus::from_db_value(status.as_str()), Some(status));
        }
    }

    #[test]
    fn sending_requires_confirmed_denial_info() {
        assert!(!CaseStatus::Uploading.can_transition_to(CaseStatus::AwaitingReply));
        assert!(!CaseStatus::Analyzing.can_transition_to(CaseStatus::AwaitingReply));
        assert!(CaseStatus::ReadyToSend.can_transition_to(CaseStatus::AwaitingReply));
        assert!(CaseStatus::ReplyReceived.can_transition_to(CaseStatus::AwaitingReply));
    }

    #[test]
    fn replies_only_advance_cases_that_sent_something() {
        assert!(!CaseStatus::ReadyToSend.can_transition_to(CaseStatus::ReplyReceived));
        assert!(CaseStatus::Sent.can_transition_to(CaseStatus::ReplyReceived));
        assert!(CaseStatus::AwaitingReply.can_transition_to(CaseStatus::ReplyReceived));
    }

    #[test]
    fn email_review_needs_parsed_data() {
        let mut case = Case::new("c1", "u1");
        assert!(!case.has_prerequisites_for(CaseStep::EmailReview));
        case.parsed_data = Some(ParsedData {
            insurer: "Acme Health".to_string(),
            policy_number: "P-1".to_string(),
            denial_reason: "not medically necessary".to_string(),
        });
        assert!(case.has_prerequisites_for(CaseStep::EmailReview));
    }

    #[test]
    fn status_and_step_serialize_kebab_case() {
        let json = serde_json::to_value(Case::new("c1", "u1")).expect("serialize");
        assert_eq!(json["status"], "uploading");
        assert_eq!(json["currentStep"], "denial-upload");
        assert_eq!(json["userId"], "u1");
    }

    #[test]
    fn inline_file_bytes_travel_as_base64() {
        let file = FileRef {
            name: "denial.pdf".to_string(),
            size: 3,
            content_type: "application/pdf".to_string(),
            last_modified: None,
            bucket: None,
            path: None,
            data: Some(vec![1, 2, 3]),
        };
        let json = serde_json::to_value(&file).expect("serialize");
        assert_eq!(json["data"], "AQID");
        let back: FileRef = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.data.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn denial_reason_prefers_confirmed_facts() {
        let mut case = Case::new("c1", "u1");
        case.denial_reason_title = Some("Out of network".to_string());
        assert_eq!(case.denial_reason(), Some("Out of network"));
        case.parsed_data = Some(ParsedData {
            denial_reason: "Experimental treatment".to_string(),
            ..ParsedData::default()
        });
        assert_eq!(case.denial_reason(), Some("Experimental treatment"));
    }
}
