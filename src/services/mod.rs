//! Contracts for the external document extraction, case analysis and file
//! storage services, plus their HTTP implementations.
//!
//! The lifecycle controller only sees the traits in this module; the
//! concrete clients are chosen in `main.rs` and replaced by fakes in tests.

pub mod modal;
pub mod storage;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::appeal::case::{CaseAnalysis, ReplyAnalysis};
use crate::error::ServiceError;

pub use self::storage::{FileStorage, StagedDocuments, StoredObject, stage_documents};

/// One document copied to local disk for the duration of an extraction.
#[derive(Debug, Clone)]
pub struct StagedDocument {
    pub name: String,
    pub content_type: String,
    pub path: PathBuf,
}

/// Facts read from a denial letter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialFacts {
    pub brief_description: String,
    #[serde(default)]
    pub denial_date: Option<String>,
    #[serde(default)]
    pub procedure_name: Option<String>,
}

/// Facts read from policy documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFacts {
    pub insurance_company: String,
    pub plan_name: String,
    pub policy_number: String,
    #[serde(default)]
    pub group_number: Option<String>,
}

/// Input for the appeal argument paragraphs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgumentRequest<'a> {
    pub case_id: &'a str,
    pub denial_reason: &'a str,
    pub insurer: Option<&'a str>,
    pub policy_number: Option<&'a str>,
    pub analysis: &'a CaseAnalysis,
}

/// Input for follow-up argument paragraphs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowupRequest<'a> {
    pub case_id: &'a str,
    pub denial_reason: Option<&'a str>,
    pub thread_history: &'a str,
}

#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract_denial(&self, docs: &StagedDocuments) -> Result<DenialFacts, ServiceError>;
    async fn extract_plan(&self, docs: &StagedDocuments) -> Result<PlanFacts, ServiceError>;
}

#[async_trait]
pub trait CaseAnalyzer: Send + Sync {
    /// Appeal strategy for a denial reason given policy context.
    async fn analyze(
        &self,
        denial_reason: &str,
        policy_context: &str,
    ) -> Result<CaseAnalysis, ServiceError>;

    /// Argument paragraphs for the initial appeal letter.
    async fn draft_appeal_argument(
        &self,
        request: &ArgumentRequest<'_>,
    ) -> Result<String, ServiceError>;

    async fn analyze_reply(
        &self,
        reply_body: &str,
        thread_history: &str,
    ) -> Result<ReplyAnalysis, ServiceError>;

    /// Argument paragraphs answering the latest insurer reply.
    async fn draft_followup_argument(
        &self,
        request: &FollowupRequest<'_>,
    ) -> Result<String, ServiceError>;
}
