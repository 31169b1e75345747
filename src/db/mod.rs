//! Database abstraction layer.
//!
//! Provides a backend-agnostic `Database` trait that unifies all persistence
//! operations. Two implementations exist:
//!
//! - `memory`: process-local maps, used by tests and throwaway deployments
//! - `libsql` (default feature): libSQL (Turso's SQLite fork) document tables
//!
//! Case mutation goes exclusively through [`CaseStore::find_case_and_update`],
//! which applies a [`CaseUpdate`] atomically under an optional
//! [`CaseCondition`]. There is no whole-document replace for cases.

pub mod memory;

#[cfg(feature = "libsql")]
pub mod libsql;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::appeal::case::{
    Case, CaseAnalysis, CaseStatus, CaseStep, EmailDraft, EmailMessage, FileRef, InsurancePlan,
    ParsedData, ReplyAnalysis, UserRecord,
};
use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::DatabaseError;
use crate::services::DenialFacts;

/// Create a database backend from configuration, run migrations, and return it.
pub async fn connect_from_config(
    config: &DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        DatabaseBackend::Memory => {
            let backend = memory::MemoryBackend::new();
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "libsql")]
        DatabaseBackend::LibSql => {
            let backend = libsql::LibSqlBackend::new_local(&config.libsql_path).await?;
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "libsql"))]
        DatabaseBackend::LibSql => Err(DatabaseError::Pool(
            "libsql backend requested but the 'libsql' feature is disabled".to_string(),
        )),
    }
}

// ==================== Case updates ====================

/// Derived AI outputs that are always cleared together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachedField {
    ParsedData,
    DenialReasonTitle,
    DenialFacts,
    Analysis,
    EmailDraft,
}

impl CachedField {
    pub const GROUP: [CachedField; 5] = [
        Self::ParsedData,
        Self::DenialReasonTitle,
        Self::DenialFacts,
        Self::Analysis,
        Self::EmailDraft,
    ];

    fn clear(self, case: &mut Case) {
        match self {
            Self::ParsedData => case.parsed_data = None,
            Self::DenialReasonTitle => case.denial_reason_title = None,
            Self::DenialFacts => case.denial_facts = None,
            Self::Analysis => case.analysis = None,
            Self::EmailDraft => case.email_draft = None,
        }
    }
}

/// A single `$set` on a case.
#[derive(Debug, Clone, PartialEq)]
pub enum CaseSet {
    Status(CaseStatus),
    CurrentStep(CaseStep),
    HasNewEmail(bool),
    ParsedData(ParsedData),
    /// Extraction result; also sets `denialReasonTitle` from its description.
    DenialFacts(DenialFacts),
    Analysis(CaseAnalysis),
    EmailDraft(EmailDraft),
    PlanId(Option<String>),
    CoveredPersonId(Option<String>),
    Resolved {
        resolved_date: DateTime<Utc>,
        feedback: Option<String>,
    },
}

impl CaseSet {
    fn apply(&self, case: &mut Case) {
        match self {
            Self::Status(status) => case.status = *status,
            Self::CurrentStep(step) => case.current_step = *step,
            Self::HasNewEmail(flag) => case.has_new_email = *flag,
            Self::ParsedData(data) => case.parsed_data = Some(data.clone()),
            Self::DenialFacts(facts) => {
                case.denial_reason_title = Some(facts.brief_description.clone());
                case.denial_facts = Some(facts.clone());
            }
            Self::Analysis(analysis) => case.analysis = Some(analysis.clone()),
            Self::EmailDraft(draft) => case.email_draft = Some(draft.clone()),
            Self::PlanId(plan_id) => case.plan_id = plan_id.clone(),
            Self::CoveredPersonId(person_id) => case.covered_person_id = person_id.clone(),
            Self::Resolved {
                resolved_date,
                feedback,
            } => {
                case.resolved = true;
                case.resolved_date = Some(*resolved_date);
                if feedback.is_some() {
                    case.feedback = feedback.clone();
                }
            }
        }
    }
}

/// Field-level update applied atomically by a store: `$set`, `$unset`,
/// `$push` with `$each`, plus the files-version increment.
///
/// Pushes happen before sets and unsets happen after sets, so an update that
/// both uploads files and clears the cache can never leave a stale field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaseUpdate {
    pub set: Vec<CaseSet>,
    pub unset: Vec<CachedField>,
    pub push_files: Vec<FileRef>,
    pub push_messages: Vec<EmailMessage>,
    pub bump_files_version: bool,
}

impl CaseUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: CaseSet) -> Self {
        self.set.push(field);
        self
    }

    /// Unset the whole cached AI group.
    pub fn invalidate_cache(mut self) -> Self {
        for field in CachedField::GROUP {
            if !self.unset.contains(&field) {
                self.unset.push(field);
            }
        }
        self
    }

    /// Append files; always bumps the files version.
    pub fn push_files(mut self, files: impl IntoIterator<Item = FileRef>) -> Self {
        self.push_files.extend(files);
        self.bump_files_version = true;
        self
    }

    pub fn push_message(mut self, message: EmailMessage) -> Self {
        self.push_messages.push(message);
        self
    }

    /// Apply to an in-memory document. Shared by every backend so the
    /// semantics cannot drift between them.
    pub fn apply(&self, case: &mut Case) {
        case.denial_files.extend(self.push_files.iter().cloned());
        case.email_thread.extend(self.push_messages.iter().cloned());
        for field in &self.set {
            field.apply(case);
        }
        for field in &self.unset {
            field.clear(case);
        }
        if self.bump_files_version {
            case.files_version = case.files_version.saturating_add(1);
        }
    }
}

/// Precondition checked inside the same atomic step as the update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaseCondition {
    /// Write only if the denial file set has not changed since it was read.
    pub files_version: Option<u64>,
    /// Write only if the case is in one of these statuses.
    pub status_in: Option<Vec<CaseStatus>>,
    /// Write only if no thread entry carries this message id.
    pub without_message: Option<String>,
}

impl CaseCondition {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn files_version(version: u64) -> Self {
        Self {
            files_version: Some(version),
            ..Self::default()
        }
    }

    pub fn status_in(statuses: &[CaseStatus]) -> Self {
        Self {
            status_in: Some(statuses.to_vec()),
            ..Self::default()
        }
    }

    pub fn and_files_version(mut self, version: Option<u64>) -> Self {
        if version.is_some() {
            self.files_version = version;
        }
        self
    }

    pub fn and_without_message(mut self, message_id: impl Into<String>) -> Self {
        self.without_message = Some(message_id.into());
        self
    }

    pub fn matches(&self, case: &Case) -> bool {
        if let Some(message_id) = self.without_message.as_deref()
            && case.email_thread.iter().any(|m| m.id == message_id)
        {
            return false;
        }
        if let Some(version) = self.files_version
            && case.files_version != version
        {
            return false;
        }
        if let Some(statuses) = &self.status_in
            && !statuses.contains(&case.status)
        {
            return false;
        }
        true
    }
}

/// Filter for [`CaseStore::find_cases`]. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct CaseFilter {
    pub user_id: Option<String>,
    pub statuses: Option<Vec<CaseStatus>>,
}

impl CaseFilter {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            statuses: None,
        }
    }

    pub fn with_statuses(mut self, statuses: &[CaseStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn matches(&self, case: &Case) -> bool {
        self.user_id.as_deref().is_none_or(|u| case.user_id == u)
            && self
                .statuses
                .as_ref()
                .is_none_or(|s| s.contains(&case.status))
    }
}

// ==================== Email records ====================

/// Provider-level record of one sent or received message.
///
/// Created on every send and every processed inbound message, after the
/// case thread has been updated. Never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailRecord {
    pub message_id: String,
    pub thread_id: String,
    #[serde(default)]
    pub message_id_header: Option<String>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub internal_date: DateTime<Utc>,
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub analysis: Option<ReplyAnalysis>,
}

// ==================== Sub-traits ====================
//
// Each sub-trait groups related persistence methods. The `Database` supertrait
// combines them all; the lifecycle controller depends on the sub-traits.

#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn find_cases(&self, filter: &CaseFilter) -> Result<Vec<Case>, DatabaseError>;
    async fn find_case(&self, id: &str) -> Result<Option<Case>, DatabaseError>;
    /// Fails with [`DatabaseError::Duplicate`] when the id is taken.
    async fn insert_case(&self, case: &Case) -> Result<Case, DatabaseError>;
    /// Apply `update` if the case exists and `condition` holds, returning
    /// the new document. `None` means missing or condition failed.
    async fn find_case_and_update(
        &self,
        id: &str,
        condition: &CaseCondition,
        update: &CaseUpdate,
    ) -> Result<Option<Case>, DatabaseError>;
    async fn find_case_and_delete(&self, id: &str) -> Result<Option<Case>, DatabaseError>;
}

#[async_trait]
pub trait EmailStore: Send + Sync {
    /// Returns `false` without writing when `message_id` already exists.
    async fn insert_email(&self, record: &EmailRecord) -> Result<bool, DatabaseError>;
    async fn find_email(&self, message_id: &str) -> Result<Option<EmailRecord>, DatabaseError>;
    /// Earliest record in `thread_id` that is linked to a case.
    async fn find_linked_email_in_thread(
        &self,
        thread_id: &str,
    ) -> Result<Option<EmailRecord>, DatabaseError>;
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn insert_plan(&self, plan: &InsurancePlan) -> Result<InsurancePlan, DatabaseError>;
    async fn list_plans(&self, user_id: &str) -> Result<Vec<InsurancePlan>, DatabaseError>;
    async fn get_plan(&self, id: &str) -> Result<Option<InsurancePlan>, DatabaseError>;
    async fn replace_plan(
        &self,
        plan: &InsurancePlan,
    ) -> Result<Option<InsurancePlan>, DatabaseError>;
    async fn delete_plan(&self, id: &str) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn upsert_user(&self, user: &UserRecord) -> Result<UserRecord, DatabaseError>;
    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, DatabaseError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, DatabaseError>;
}

/// Backend-agnostic database supertrait.
#[async_trait]
pub trait Database: CaseStore + EmailStore + PlanStore + UserStore + Send + Sync {
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> FileRef {
        FileRef {
            name: name.to_string(),
            size: 10,
            content_type: "application/pdf".to_string(),
            last_modified: None,
            bucket: Some("denial-files".to_string()),
            path: Some(format!("c1/{name}")),
            data: None,
        }
    }

    #[test]
    fn upload_update_clears_every_cached_field_and_bumps_version() {
        let mut case = Case::new("c1", "u1");
        case.parsed_data = Some(ParsedData::default());
        case.denial_reason_title = Some("title".to_string());
        case.denial_facts = Some(DenialFacts::default());
        case.analysis = Some(CaseAnalysis::default());
        case.email_draft = Some(EmailDraft::default());

        CaseUpdate::new()
            .push_files([file("a.pdf")])
            .invalidate_cache()
            .set(CaseSet::Status(CaseStatus::Analyzing))
            .apply(&mut case);

        assert!(case.parsed_data.is_none());
        assert!(case.denial_reason_title.is_none());
        assert!(case.denial_facts.is_none());
        assert!(case.analysis.is_none());
        assert!(case.email_draft.is_none());
        assert_eq!(case.files_version, 1);
        assert_eq!(case.denial_files.len(), 1);
        assert_eq!(case.status, CaseStatus::Analyzing);
    }

    #[test]
    fn unset_wins_over_set_in_same_update() {
        let mut case = Case::new("c1", "u1");
        CaseUpdate::new()
            .set(CaseSet::DenialFacts(DenialFacts {
                brief_description: "late".to_string(),
                ..DenialFacts::default()
            }))
            .invalidate_cache()
            .apply(&mut case);
        assert!(case.denial_reason_title.is_none());
        assert!(case.denial_facts.is_none());
    }

    #[test]
    fn condition_checks_version_and_status() {
        let mut case = Case::new("c1", "u1");
        case.files_version = 3;
        assert!(CaseCondition::files_version(3).matches(&case));
        assert!(!CaseCondition::files_version(2).matches(&case));
        assert!(!CaseCondition::status_in(CaseStatus::REPLYABLE).matches(&case));
        case.status = CaseStatus::AwaitingReply;
        assert!(
            CaseCondition::status_in(CaseStatus::REPLYABLE)
                .and_files_version(Some(3))
                .matches(&case)
        );
    }

    #[test]
    fn without_message_rejects_a_thread_that_already_has_it() {
        let mut case = Case::new("c1", "u1");
        let condition = CaseCondition::any().and_without_message("r1");
        assert!(condition.matches(&case));
        case.email_thread.push(EmailMessage {
            id: "r1".to_string(),
            from: "claims@insurer.example".to_string(),
            to: "agent@policypilot.test".to_string(),
            subject: "Re: Appeal".to_string(),
            body: "Received.".to_string(),
            date: Utc::now(),
            direction: crate::appeal::case::MessageDirection::Received,
            thread_id: None,
            message_id_header: None,
            analysis: None,
        });
        assert!(!condition.matches(&case));
        assert!(CaseCondition::any().and_without_message("r2").matches(&case));
    }

    #[test]
    fn resolved_keeps_previous_feedback_when_none_given() {
        let mut case = Case::new("c1", "u1");
        case.feedback = Some("went well".to_string());
        CaseUpdate::new()
            .set(CaseSet::Resolved {
                resolved_date: Utc::now(),
                feedback: None,
            })
            .apply(&mut case);
        assert!(case.resolved);
        assert_eq!(case.feedback.as_deref(), Some("went well"));
        assert_eq!(case.status, CaseStatus::Uploading);
    }
}
